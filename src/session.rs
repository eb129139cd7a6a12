//! A host together with its current topology snapshot.

use crate::engine::{CancelToken, Engine};
use crate::host::{Dataset, Host, HostSpec, RecordingHost, open_host};
use crate::props::PROPERTIES;
use crate::selection::{self, Selection, SelectionRequest};
use crate::topology::Snapshot;
use crate::util::error::{AppError, HostError, SelectionError, TopologyError};
use crate::util::sysfs::{read_optional, write_sysfs_value};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;

const CPU_SYSFS: &str = "/sys/devices/system/cpu";

/// Settings the engine is created with.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub jobs: usize,
    pub verify: bool,
    pub cancel: CancelToken,
}

/// Owns the connection to one host and the topology snapshot everything is resolved against.
///
/// The snapshot is only ever replaced as a whole, so engines and selections created before a
/// refresh keep seeing the old one consistently.
#[derive(Debug)]
pub struct HostSession {
    host: Box<dyn Host>,
    topology: Arc<Snapshot>,
    options: EngineOptions,
}

/// What a hotplug request did.
#[derive(Debug, Default)]
pub struct Hotplug {
    pub changed: BTreeSet<u32>,
    /// CPUs that were already in the requested state.
    pub unchanged: BTreeSet<u32>,
    pub failed: Vec<(u32, HostError)>,
}

impl HostSession {
    /// Connect to the host described by `spec` and discover its topology.
    pub fn open(spec: &HostSpec) -> Result<Self, AppError> {
        let host = open_host(spec)?;
        Ok(Self::new(host)?)
    }

    pub fn new(host: Box<dyn Host>) -> Result<Self, TopologyError> {
        let topology = Arc::new(Snapshot::discover(host.as_ref())?);
        info!(
            "{}: {} CPU(s) online in {} package(s)",
            host.name(),
            topology.online_cpus().len(),
            topology.packages().len()
        );
        Ok(Self {
            host,
            topology,
            options: EngineOptions::default(),
        })
    }

    #[must_use]
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    pub fn topology(&self) -> Arc<Snapshot> {
        Arc::clone(&self.topology)
    }

    /// Probe the host again and replace the snapshot.
    pub fn refresh(&mut self) -> Result<(), TopologyError> {
        self.topology = Arc::new(Snapshot::discover(self.host.as_ref())?);
        debug!(
            "{}: topology refreshed, online CPUs {}",
            self.host.name(),
            crate::range::emit(self.topology.online_cpus())
        );
        Ok(())
    }

    pub fn select(&self, req: &SelectionRequest) -> Result<Selection, SelectionError> {
        selection::resolve(&self.topology, req)
    }

    pub fn engine(&self) -> Engine<'_> {
        Engine::new(self.host.as_ref(), &self.topology)
            .jobs(self.options.jobs)
            .verify(self.options.verify)
            .cancel_token(self.options.cancel.clone())
    }

    /// Bring `cpus` online or take them offline, then rebuild the snapshot.
    ///
    /// # Errors
    ///
    /// Per-CPU failures are collected in the result. Only a failed refresh is an error.
    pub fn set_online(&mut self, cpus: &BTreeSet<u32>, online: bool) -> Result<Hotplug, TopologyError> {
        let mut report = Hotplug::default();
        let value = if online { "1" } else { "0" };

        for &cpu in cpus {
            if self.topology.is_online(cpu) == online {
                report.unchanged.insert(cpu);
                continue;
            }
            let path = format!("{CPU_SYSFS}/cpu{cpu}/online");
            match write_sysfs_value(self.host.as_ref(), &path, value) {
                Ok(()) => {
                    info!("{}: CPU {cpu} {}", self.host.name(), if online { "onlined" } else { "offlined" });
                    report.changed.insert(cpu);
                }
                Err(e) => {
                    warn!("{}: failed to change CPU {cpu}: {e}", self.host.name());
                    report.failed.push((cpu, e));
                }
            }
        }

        if !report.changed.is_empty() {
            self.refresh()?;
        }
        Ok(report)
    }
}

/// Read everything this tool knows about through a recording wrapper and return the
/// resulting dataset, which [`FixtureHost`](crate::host::FixtureHost) can replay.
pub fn record(host: Box<dyn Host>) -> Result<Dataset, TopologyError> {
    let recorder = RecordingHost::new(host);
    let topology = Snapshot::discover(&recorder)?;

    // Hotplug controls, so a replay can emulate onlining and offlining.
    for cpu in topology.present_cpus() {
        read_optional(&recorder, format!("{CPU_SYSFS}/cpu{cpu}/online"))?;
    }

    let everything = Selection {
        cpus: topology.online_cpus(),
        noncomp_dies: topology.noncomp_dies().collect(),
    };
    let engine = Engine::new(&recorder, &topology);
    for prop in PROPERTIES {
        match engine.read(prop, &everything, None) {
            Ok(res) => debug!(
                "Recorded {}: {} of {} instance(s) readable",
                prop.name,
                res.values().count(),
                res.outcomes.len()
            ),
            Err(e) => warn!("Could not record {}: {e}", prop.name),
        }
    }

    Ok(recorder.into_dataset())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FixtureHost;

    const HOST: &str = r#"
        [files]
        "/sys/devices/system/cpu/present" = "0-3"
        "/sys/devices/system/cpu/online" = "0-3"
        "/sys/devices/system/cpu/cpu1/online" = "1"
        "/sys/devices/system/cpu/cpu2/online" = "1"
        "/sys/devices/system/cpu/cpu3/online" = "1"
        "/sys/devices/system/cpu/cpu0/topology/physical_package_id" = "0"
        "/sys/devices/system/cpu/cpu0/topology/core_id" = "0"
        "/sys/devices/system/cpu/cpu1/topology/physical_package_id" = "0"
        "/sys/devices/system/cpu/cpu1/topology/core_id" = "1"
        "/sys/devices/system/cpu/cpu2/topology/physical_package_id" = "0"
        "/sys/devices/system/cpu/cpu2/topology/core_id" = "0"
        "/sys/devices/system/cpu/cpu3/topology/physical_package_id" = "0"
        "/sys/devices/system/cpu/cpu3/topology/core_id" = "1"
        "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor" = "powersave"
        "/sys/devices/system/cpu/intel_pstate/no_turbo" = "0"
    "#;

    fn session() -> HostSession {
        HostSession::new(Box::new(FixtureHost::from_toml(HOST).unwrap())).unwrap()
    }

    #[test]
    fn hotplug_rebuilds_the_snapshot() {
        let mut session = session();
        let before = session.topology();
        assert_eq!(before.core_sibling_index(3), Some(1));

        let report = session.set_online(&[1, 2].into_iter().collect(), false).unwrap();
        assert_eq!(report.changed, [1, 2].into_iter().collect());
        assert!(report.failed.is_empty());

        let after = session.topology();
        assert_eq!(after.online_cpus(), [0, 3].into_iter().collect());
        assert_eq!(after.core_sibling_index(3), Some(0));
        // The old snapshot is untouched.
        assert_eq!(before.online_cpus().len(), 4);

        let report = session.set_online(&[0, 2].into_iter().collect(), true).unwrap();
        assert_eq!(report.unchanged, [0].into_iter().collect());
        assert_eq!(session.topology().online_cpus().len(), 3);
    }

    #[test]
    fn hotplug_failures_are_collected() {
        let mut session = session();
        // CPU 0 has no online control.
        let report = session.set_online(&[0].into_iter().collect(), false).unwrap();
        assert!(report.changed.is_empty());
        assert!(matches!(report.failed[..], [(0, HostError::PathMissing(_))]));
    }

    #[test]
    fn selections_use_the_current_snapshot() {
        let session = session();
        let sel = session
            .select(&SelectionRequest {
                cores: Some("1".to_string()),
                ..SelectionRequest::default()
            })
            .unwrap();
        assert_eq!(sel.cpus, [1, 3].into_iter().collect());
        let res = session
            .engine()
            .read(crate::props::lookup("turbo").unwrap(), &sel, None)
            .unwrap();
        assert!(res.is_complete());
    }

    #[test]
    fn recording_replays() {
        let dataset = record(Box::new(FixtureHost::from_toml(HOST).unwrap())).unwrap();
        assert!(dataset.files.contains_key("/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor"));
        assert!(dataset.files.contains_key("/sys/devices/system/cpu/cpu3/online"));

        let replay = FixtureHost::from_dataset(dataset).unwrap();
        let session = HostSession::new(Box::new(replay)).unwrap();
        assert_eq!(session.topology().online_cpus().len(), 4);
    }
}
