use super::fixture::{CommandEntry, Dataset, RegisterEntry};
use super::{CommandOutput, Host};
use crate::util::error::HostError;
use std::path::Path;
use std::sync::Mutex;

/// Wraps a host and remembers everything successfully read through it, so the session can
/// be replayed later with [`FixtureHost`](super::FixtureHost).
#[derive(Debug)]
pub struct RecordingHost<H: Host> {
    inner: H,
    dataset: Mutex<Dataset>,
}

impl<H: Host> RecordingHost<H> {
    pub fn new(inner: H) -> Self {
        let dataset = Dataset {
            name: Some(inner.name().to_string()),
            recorded_at: Some(chrono::Local::now().to_rfc3339()),
            ..Dataset::default()
        };
        Self {
            inner,
            dataset: Mutex::new(dataset),
        }
    }

    /// Everything recorded so far.
    pub fn dataset(&self) -> Dataset {
        self.with_dataset(|dataset| dataset.clone())
    }

    pub fn into_dataset(self) -> Dataset {
        self.dataset
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn with_dataset<T>(&self, f: impl FnOnce(&mut Dataset) -> T) -> T {
        let mut guard = self
            .dataset
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }
}

impl<H: Host> Host for RecordingHost<H> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, HostError> {
        let data = self.inner.read_file(path)?;
        let key = path.display().to_string();
        self.with_dataset(|dataset| match String::from_utf8(data.clone()) {
            Ok(text) => {
                dataset.files.insert(key, text);
            }
            Err(_) => {
                dataset.binary.insert(key, data.clone());
            }
        });
        Ok(data)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), HostError> {
        self.inner.write_file(path, data)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, HostError> {
        let names = self.inner.list_dir(path)?;
        self.with_dataset(|dataset| {
            dataset
                .dirs
                .insert(path.display().to_string(), names.clone());
        });
        Ok(names)
    }

    fn read_register(&self, cpu: u32, address: u32) -> Result<u64, HostError> {
        let value = self.inner.read_register(cpu, address)?;
        self.with_dataset(|dataset| {
            dataset
                .registers
                .retain(|reg| !(reg.cpu == cpu && reg.address == address));
            dataset.registers.push(RegisterEntry {
                cpu,
                address,
                value: format!("{value:#x}"),
                shared: Vec::new(),
            });
        });
        Ok(value)
    }

    fn write_register(&self, cpu: u32, address: u32, value: u64, mask: u64) -> Result<(), HostError> {
        self.inner.write_register(cpu, address, value, mask)
    }

    fn run_command(&self, argv: &[&str]) -> Result<CommandOutput, HostError> {
        let output = self.inner.run_command(argv)?;
        self.with_dataset(|dataset| {
            dataset.commands.push(CommandEntry {
                argv: argv.iter().map(ToString::to_string).collect(),
                stdout: output.stdout_str(),
                exit_code: output.exit_code,
            });
        });
        Ok(output)
    }
}
