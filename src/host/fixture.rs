use super::{CommandOutput, Host, apply_mask, msr_path};
use crate::range;
use crate::util::error::HostError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const CPU_SYSFS: &str = "/sys/devices/system/cpu";

/// A captured snapshot of a machine's files, registers and command outputs.
///
/// Datasets are stored as TOML so they can be written by hand for tests or produced by
/// [`RecordingHost`](super::RecordingHost).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dataset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<String>,
    /// Paths that exist but refuse writes.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub readonly: BTreeSet<String>,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Files whose contents are not text, such as `/dev/cpu_dma_latency`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub binary: BTreeMap<String, Vec<u8>>,
    /// Directory listings that cannot be derived from the file paths above.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dirs: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registers: Vec<RegisterEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterEntry {
    pub cpu: u32,
    pub address: u32,
    /// Hexadecimal (`0x...`) or decimal. TOML integers are signed, so wide register values
    /// are kept as strings.
    pub value: String,
    /// Other CPUs that see the same register, as for package or core scoped MSRs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandEntry {
    pub argv: Vec<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub exit_code: i32,
}

#[derive(Debug, Default)]
struct FixtureState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeMap<PathBuf, BTreeSet<String>>,
    readonly: BTreeSet<PathBuf>,
    registers: BTreeMap<(u32, u32), u64>,
    /// Maps a CPU's view of a shared register to the CPU holding the value.
    aliases: BTreeMap<(u32, u32), u32>,
    commands: Vec<CommandEntry>,
}

/// An emulated host backed by a [`Dataset`]. Writes change the in-memory state only.
#[derive(Debug)]
pub struct FixtureHost {
    name: String,
    state: Mutex<FixtureState>,
}

impl FixtureHost {
    pub fn load(path: &Path) -> Result<Self, HostError> {
        let contents = fs::read_to_string(path).map_err(|e| super::map_io_error(&e, path, false))?;
        let mut host = Self::from_toml(&contents)?;
        if host.name == "dataset" {
            host.name = path.display().to_string();
        }
        Ok(host)
    }

    pub fn from_toml(contents: &str) -> Result<Self, HostError> {
        let dataset: Dataset = toml::from_str(contents)
            .map_err(|e| HostError::ParseError(format!("bad dataset: {e}")))?;
        Self::from_dataset(dataset)
    }

    pub fn from_dataset(dataset: Dataset) -> Result<Self, HostError> {
        let mut state = FixtureState::default();

        for (path, contents) in dataset.files {
            state.files.insert(PathBuf::from(path), contents.into_bytes());
        }
        for (path, contents) in dataset.binary {
            state.files.insert(PathBuf::from(path), contents);
        }
        for (path, entries) in dataset.dirs {
            state
                .dirs
                .entry(PathBuf::from(path))
                .or_default()
                .extend(entries);
        }
        state.readonly = dataset.readonly.into_iter().map(PathBuf::from).collect();

        for reg in dataset.registers {
            let value = parse_register_value(&reg.value).ok_or_else(|| {
                HostError::ParseError(format!(
                    "bad value '{}' for MSR {:#x} on CPU {}",
                    reg.value, reg.address, reg.cpu
                ))
            })?;
            state.registers.insert((reg.cpu, reg.address), value);
            for cpu in reg.shared {
                state.aliases.insert((cpu, reg.address), reg.cpu);
            }
        }
        state.commands = dataset.commands;

        Ok(Self {
            name: dataset.name.unwrap_or_else(|| "dataset".to_string()),
            state: Mutex::new(state),
        })
    }

    /// Current value of a register, for inspecting the effect of writes.
    pub fn register(&self, cpu: u32, address: u32) -> Option<u64> {
        let state = self.lock();
        state.registers.get(&state.owner(cpu, address)).copied()
    }

    /// Current contents of a file as text, for inspecting the effect of writes.
    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.lock()
            .files
            .get(path.as_ref())
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    fn lock(&self) -> MutexGuard<'_, FixtureState> {
        // A panicking writer cannot leave the maps half-updated, so poisoning is harmless.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl FixtureState {
    fn owner(&self, cpu: u32, address: u32) -> (u32, u32) {
        let cpu = self.aliases.get(&(cpu, address)).copied().unwrap_or(cpu);
        (cpu, address)
    }

    /// Mirror what the kernel does when `cpuN/online` is written.
    fn apply_hotplug(&mut self, path: &Path, data: &[u8]) -> Result<(), HostError> {
        let Some(cpu) = path
            .strip_prefix(CPU_SYSFS)
            .ok()
            .and_then(|rest| rest.to_str())
            .and_then(|rest| rest.strip_suffix("/online"))
            .and_then(|dir| dir.strip_prefix("cpu"))
            .and_then(|num| num.parse::<u32>().ok())
        else {
            return Ok(());
        };

        let online_path = Path::new(CPU_SYSFS).join("online");
        let Some(current) = self.files.get(&online_path) else {
            return Ok(());
        };

        let mut online = range::parse_cpulist(&String::from_utf8_lossy(current))
            .map_err(|e| HostError::ParseError(e.to_string()))?;
        match String::from_utf8_lossy(data).trim() {
            "1" => online.insert(cpu),
            "0" => online.remove(&cpu),
            other => {
                return Err(HostError::WriteError(format!(
                    "Path: {:?}, Value: '{other}', Error: Invalid argument",
                    path.display()
                )));
            }
        };

        debug!("Emulated hotplug of CPU {cpu}, online CPUs now {}", range::emit(online.iter().copied()));
        self.files
            .insert(online_path, format!("{}\n", range::emit(online)).into_bytes());
        Ok(())
    }
}

impl Host for FixtureHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, HostError> {
        self.lock()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| HostError::PathMissing(format!("Path '{}' does not exist", path.display())))
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), HostError> {
        let mut state = self.lock();

        if !state.files.contains_key(path) {
            return Err(HostError::PathMissing(format!(
                "Path '{}' does not exist",
                path.display()
            )));
        }
        if state.readonly.contains(path) {
            return Err(HostError::PermissionDenied(format!(
                "Path: {:?}, Error: read-only file",
                path.display()
            )));
        }

        state.apply_hotplug(path, data)?;
        state.files.insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, HostError> {
        let state = self.lock();

        let mut names: BTreeSet<String> = state.dirs.get(path).cloned().unwrap_or_default();
        for file in state.files.keys() {
            if let Ok(rest) = file.strip_prefix(path) {
                if let Some(first) = rest.components().next() {
                    names.insert(first.as_os_str().to_string_lossy().into_owned());
                }
            }
        }

        if names.is_empty() && !state.dirs.contains_key(path) {
            return Err(HostError::PathMissing(format!(
                "Path '{}' does not exist",
                path.display()
            )));
        }
        Ok(names.into_iter().collect())
    }

    fn read_register(&self, cpu: u32, address: u32) -> Result<u64, HostError> {
        let state = self.lock();

        if let Some(value) = state.registers.get(&state.owner(cpu, address)) {
            return Ok(*value);
        }
        if state.registers.keys().chain(state.aliases.keys()).any(|(c, _)| *c == cpu) {
            Err(HostError::ReadError(format!(
                "MSR {address:#x} on CPU {cpu}: Input/output error"
            )))
        } else {
            Err(HostError::PathMissing(format!(
                "Path '{}' does not exist",
                msr_path(cpu).display()
            )))
        }
    }

    fn write_register(&self, cpu: u32, address: u32, value: u64, mask: u64) -> Result<(), HostError> {
        let current = self.read_register(cpu, address)?;
        let mut state = self.lock();
        let owner = state.owner(cpu, address);
        state.registers.insert(owner, apply_mask(current, value, mask));
        Ok(())
    }

    fn run_command(&self, argv: &[&str]) -> Result<CommandOutput, HostError> {
        let state = self.lock();
        state
            .commands
            .iter()
            .find(|cmd| cmd.argv.iter().map(String::as_str).eq(argv.iter().copied()))
            .map(|cmd| CommandOutput {
                stdout: cmd.stdout.clone().into_bytes(),
                stderr: Vec::new(),
                exit_code: cmd.exit_code,
            })
            .ok_or_else(|| {
                HostError::NotSupported(format!("command '{}' is not in the dataset", argv.join(" ")))
            })
    }
}

fn parse_register_value(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16).ok(),
        None => value.parse().ok(),
    }
}
