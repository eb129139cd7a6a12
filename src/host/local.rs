use super::{CommandOutput, Host, apply_mask, map_io_error, msr_path};
use crate::util::error::HostError;
use crate::util::process::run_with_timeout;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// The machine this process runs on.
#[derive(Debug)]
pub struct LocalHost {
    command_timeout: Duration,
}

impl LocalHost {
    pub const fn new() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for LocalHost {
    fn name(&self) -> &str {
        "localhost"
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, HostError> {
        fs::read(path).map_err(|e| map_io_error(&e, path, false))
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), HostError> {
        // sysfs attributes cannot be created, so never pass `create`.
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| map_io_error(&e, path, true))?;
        file.write_all(data)
            .map_err(|e| map_io_error(&e, path, true))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, HostError> {
        let entries = fs::read_dir(path).map_err(|e| map_io_error(&e, path, false))?;

        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str().map(ToString::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    fn read_register(&self, cpu: u32, address: u32) -> Result<u64, HostError> {
        let path = msr_path(cpu);
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| map_io_error(&e, &path, false))?;

        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, u64::from(address))
            .map_err(|e| {
                HostError::ReadError(format!(
                    "MSR {address:#x} on CPU {cpu} via {}: {e}",
                    path.display()
                ))
            })?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_register(&self, cpu: u32, address: u32, value: u64, mask: u64) -> Result<(), HostError> {
        let path = msr_path(cpu);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| map_io_error(&e, &path, true))?;

        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, u64::from(address))
            .map_err(|e| HostError::ReadError(format!("MSR {address:#x} on CPU {cpu}: {e}")))?;

        let new = apply_mask(u64::from_le_bytes(buf), value, mask);
        file.write_all_at(&new.to_le_bytes(), u64::from(address))
            .map_err(|e| HostError::WriteError(format!("MSR {address:#x} on CPU {cpu}: {e}")))
    }

    fn run_command(&self, argv: &[&str]) -> Result<CommandOutput, HostError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(HostError::NotSupported("empty command line".to_string()));
        };

        let mut command = Command::new(program);
        command.args(args);
        run_with_timeout(command, None, self.command_timeout)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}
