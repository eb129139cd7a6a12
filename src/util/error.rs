use std::io;

/// Failures of the host access layer: local files, the remote shell channel or a dataset.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Path missing: {0}")]
    PathMissing(String),

    #[error("Permission denied: {0}. Try running with sudo.")]
    PermissionDenied(String),

    #[error("Failed to read: {0}")]
    ReadError(String),

    #[error("Failed to write: {0}")]
    WriteError(String),

    #[error("Failed to parse value: {0}")]
    ParseError(String),

    #[error("Operation timed out after {seconds}s: {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("Connection to '{host}' failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("Operation not supported by host: {0}")]
    NotSupported(String),
}

/// A malformed selection list such as `1-x` or `all,3`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("invalid list '{input}': '{token}' is invalid: {problem}")]
    InvalidSyntax {
        input: String,
        token: String,
        problem: String,
    },

    #[error("invalid list '{input}': {value} is out of range, valid values are: {valid}")]
    OutOfDomain {
        input: String,
        value: u32,
        valid: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("bad {what} list: {source}")]
    Syntax {
        what: &'static str,
        #[source]
        source: RangeError,
    },

    #[error(
        "ambiguous core scope: core numbers are relative to the package on {host}, specify exactly one package (got {packages})"
    )]
    AmbiguousCoreScope { host: String, packages: String },

    #[error(
        "ambiguous die scope: die numbers are relative to the package on {host}, specify exactly one package (got {packages})"
    )]
    AmbiguousDieScope { host: String, packages: String },

    #[error("sibling index out of range: index {index} is not valid for {unit}, it has {online} online CPU(s)")]
    SiblingIndexOutOfRange {
        unit: String,
        index: u32,
        online: usize,
    },

    #[error("{what} {value} is not available on {host}, available: {available}")]
    NotAvailable {
        what: &'static str,
        value: String,
        host: String,
        available: String,
    },

    #[error("CPU {cpu} is offline on {host}")]
    OfflineCpu { cpu: u32, host: String },

    #[error("empty selection: {0}")]
    Empty(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("failed to read topology: {0}")]
    Host(#[from] HostError),

    #[error("bad topology data in '{path}': {reason}")]
    BadData { path: String, reason: String },

    #[error("inconsistent topology: {0}")]
    Inconsistent(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PropertyError {
    #[error("unknown property '{name}', available properties: {available}")]
    Unknown { name: String, available: String },

    #[error("property '{0}' is read-only")]
    NotWritable(String),

    #[error("bad value '{value}' for {property}: {expected}")]
    BadValue {
        property: String,
        value: String,
        expected: String,
    },

    #[error("unknown mechanism '{name}', available mechanisms: {available}")]
    UnknownMechanism { name: String, available: String },

    #[error("mechanism '{mechanism}' is not supported by property '{property}', supported: {supported}")]
    UnsupportedMechanism {
        property: String,
        mechanism: String,
        supported: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error("no {scope} instances to operate on for property '{property}'")]
    NoTarget { property: String, scope: String },
}

// A unified error type for the entire application
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Whether the failure boils down to missing privileges, so callers can print a hint.
    pub const fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            Self::Host(HostError::PermissionDenied(_))
                | Self::Topology(TopologyError::Host(HostError::PermissionDenied(_)))
        )
    }
}
