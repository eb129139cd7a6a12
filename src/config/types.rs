// Configuration types and structures for pwrcfg
use crate::host::RemoteConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default connect and operation timeout for remote hosts.
pub const DEFAULT_REMOTE_TIMEOUT_SEC: u64 = 5;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub const fn to_filter(self) -> log::LevelFilter {
        match self {
            Self::Error => log::LevelFilter::Error,
            Self::Warning => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
        }
    }
}

// Error type for config loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Where to find the host to operate on when no host is given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSettings {
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub private_key: Option<PathBuf>,
    pub timeout: Duration,
}

impl RemoteSettings {
    /// The remote connection to use, if a hostname is configured.
    pub fn to_remote_config(&self) -> Option<RemoteConfig> {
        let hostname = self.hostname.as_ref()?;
        let mut config = RemoteConfig::new(hostname.clone());
        config.username.clone_from(&self.username);
        config.private_key.clone_from(&self.private_key);
        config.timeout = self.timeout;
        Some(config)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ResolutionConfig {
    /// Scope instances resolved in parallel. Zero means one per local CPU.
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    /// Read values back on every CPU after a write.
    #[serde(default)]
    pub verify_writes: bool,
    /// Select all CPUs rather than CPU 0 when a command names no CPUs.
    #[serde(default)]
    pub default_all_cpus: bool,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            verify_writes: false,
            default_all_cpus: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConfig {
    pub remote: RemoteSettings,
    pub resolution: ResolutionConfig,
    pub logging: LoggingConfig,
}

const fn default_jobs() -> usize {
    1
}

const fn default_log_level() -> LogLevel {
    LogLevel::Warning
}

const fn default_remote_timeout_sec() -> u64 {
    DEFAULT_REMOTE_TIMEOUT_SEC
}

// Intermediate structs for TOML parsing
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct AppConfigToml {
    #[serde(default)]
    pub remote: RemoteConfigToml,
    #[serde(default)]
    pub resolution: ResolutionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RemoteConfigToml {
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub private_key: Option<PathBuf>,
    #[serde(default = "default_remote_timeout_sec")]
    pub timeout_sec: u64,
}

impl Default for RemoteConfigToml {
    fn default() -> Self {
        Self {
            hostname: None,
            username: None,
            private_key: None,
            timeout_sec: default_remote_timeout_sec(),
        }
    }
}

impl TryFrom<AppConfigToml> for AppConfig {
    type Error = ConfigError;

    fn try_from(toml_config: AppConfigToml) -> Result<Self, Self::Error> {
        let remote = toml_config.remote;
        if remote.timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "remote.timeout_sec must be greater than 0".to_string(),
            ));
        }
        if remote.hostname.is_none() && (remote.username.is_some() || remote.private_key.is_some()) {
            return Err(ConfigError::ValidationError(
                "remote.username and remote.private_key need remote.hostname".to_string(),
            ));
        }

        Ok(Self {
            remote: RemoteSettings {
                hostname: remote.hostname,
                username: remote.username,
                private_key: remote.private_key,
                timeout: Duration::from_secs(remote.timeout_sec),
            },
            resolution: toml_config.resolution,
            logging: toml_config.logging,
        })
    }
}
