//! Uniform access to the machine being configured.
//!
//! Everything above this layer talks to a [`Host`]: the local machine, a remote one over a
//! persistent SSH channel, or an in-memory dataset used by tests and offline inspection.

mod fixture;
mod local;
mod record;
mod remote;

pub use fixture::{CommandEntry, Dataset, FixtureHost, RegisterEntry};
pub use local::LocalHost;
pub use record::RecordingHost;
pub use remote::{RemoteConfig, RemoteHost};

use crate::util::error::HostError;
use std::io;
use std::path::{Path, PathBuf};

/// Output of a command run on a host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// The file, register and command operations every host supports.
///
/// Implementations must be usable from several worker threads at once.
pub trait Host: Send + Sync + std::fmt::Debug {
    /// A human readable name used in messages, such as `localhost` or the remote hostname.
    fn name(&self) -> &str;

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, HostError>;

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), HostError>;

    /// Names of the entries in a directory, sorted.
    fn list_dir(&self, path: &Path) -> Result<Vec<String>, HostError>;

    /// Read the 64-bit model specific register `address` on `cpu`.
    fn read_register(&self, cpu: u32, address: u32) -> Result<u64, HostError>;

    /// Replace the bits selected by `mask` in register `address` on `cpu` with the matching
    /// bits of `value`, leaving the other bits untouched.
    fn write_register(&self, cpu: u32, address: u32, value: u64, mask: u64) -> Result<(), HostError>;

    fn run_command(&self, argv: &[&str]) -> Result<CommandOutput, HostError>;

    fn exists(&self, path: &Path) -> bool {
        self.read_file(path).is_ok() || self.list_dir(path).is_ok()
    }
}

impl<H: Host + ?Sized> Host for Box<H> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, HostError> {
        (**self).read_file(path)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), HostError> {
        (**self).write_file(path, data)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, HostError> {
        (**self).list_dir(path)
    }

    fn read_register(&self, cpu: u32, address: u32) -> Result<u64, HostError> {
        (**self).read_register(cpu, address)
    }

    fn write_register(&self, cpu: u32, address: u32, value: u64, mask: u64) -> Result<(), HostError> {
        (**self).write_register(cpu, address, value, mask)
    }

    fn run_command(&self, argv: &[&str]) -> Result<CommandOutput, HostError> {
        (**self).run_command(argv)
    }

    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }
}

/// Which host a session should talk to.
#[derive(Debug, Clone)]
pub enum HostSpec {
    Local,
    Remote(RemoteConfig),
    Dataset(PathBuf),
}

/// Open a host according to `spec`.
pub fn open_host(spec: &HostSpec) -> Result<Box<dyn Host>, HostError> {
    Ok(match spec {
        HostSpec::Local => Box::new(LocalHost::new()),
        HostSpec::Remote(config) => Box::new(RemoteHost::connect(config.clone())?),
        HostSpec::Dataset(path) => Box::new(FixtureHost::load(path)?),
    })
}

pub(crate) fn msr_path(cpu: u32) -> PathBuf {
    PathBuf::from(format!("/dev/cpu/{cpu}/msr"))
}

/// Translate an I/O error on `path` into the host error taxonomy.
pub(crate) fn map_io_error(e: &io::Error, path: &Path, writing: bool) -> HostError {
    let error_msg = format!("Path: {:?}, Error: {}", path.display(), e);
    match e.kind() {
        io::ErrorKind::PermissionDenied => HostError::PermissionDenied(error_msg),
        io::ErrorKind::NotFound => {
            HostError::PathMissing(format!("Path '{}' does not exist", path.display()))
        }
        _ if writing => HostError::WriteError(error_msg),
        _ => HostError::ReadError(error_msg),
    }
}

/// Merge `value` into `current` under `mask`.
pub(crate) const fn apply_mask(current: u64, value: u64, mask: u64) -> u64 {
    (current & !mask) | (value & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_merge() {
        assert_eq!(apply_mask(0xFFFF_0000, 0x1234, 0xFF00), 0xFFFF_1200);
        assert_eq!(apply_mask(0x8000, 0x3, 0x7), 0x8003);
        assert_eq!(apply_mask(0xABCD, 0, u64::MAX), 0);
    }

    #[test]
    fn io_errors_are_classified() {
        let path = Path::new("/sys/x");
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            map_io_error(&denied, path, true),
            HostError::PermissionDenied(_)
        ));
        let missing = io::Error::from(io::ErrorKind::NotFound);
        assert!(matches!(
            map_io_error(&missing, path, false),
            HostError::PathMissing(_)
        ));
        let other = io::Error::other("EIO");
        assert!(matches!(
            map_io_error(&other, path, true),
            HostError::WriteError(_)
        ));
        assert!(matches!(
            map_io_error(&other, path, false),
            HostError::ReadError(_)
        ));
    }
}
