//! Emulated machines for the integration tests.

#![allow(dead_code)]

use pwrcfg::host::{Dataset, FixtureHost, RegisterEntry};
use pwrcfg::range;
use pwrcfg::session::HostSession;
use std::collections::BTreeSet;

pub const CPU_SYSFS: &str = "/sys/devices/system/cpu";

/// Shape of an emulated machine. CPUs are numbered the way Linux usually does it: first
/// thread of every core in package order, then the second threads.
#[derive(Debug, Clone)]
pub struct Machine {
    pub packages: u32,
    pub cores: u32,
    pub threads: u32,
    pub offline: Vec<u32>,
}

impl Machine {
    pub const fn new(packages: u32, cores: u32, threads: u32) -> Self {
        Self {
            packages,
            cores,
            threads,
            offline: Vec::new(),
        }
    }

    pub fn offline(mut self, cpus: &[u32]) -> Self {
        self.offline.extend_from_slice(cpus);
        self
    }

    pub const fn cpu_count(&self) -> u32 {
        self.packages * self.cores * self.threads
    }

    /// Package and core of `cpu`.
    pub const fn place(&self, cpu: u32) -> (u32, u32) {
        let slot = cpu % (self.packages * self.cores);
        (slot / self.cores, slot % self.cores)
    }

    pub fn dataset(&self) -> Dataset {
        let mut ds = Dataset {
            name: Some("testbox".to_string()),
            ..Dataset::default()
        };
        let count = self.cpu_count();
        let online: BTreeSet<u32> = (0..count).filter(|cpu| !self.offline.contains(cpu)).collect();

        let mut file = |path: String, value: &str| {
            ds.files.insert(path, format!("{value}\n"));
        };
        file(format!("{CPU_SYSFS}/present"), &format!("0-{}", count - 1));
        file(format!("{CPU_SYSFS}/online"), &range::emit(online.iter().copied()));
        file(format!("{CPU_SYSFS}/intel_pstate/no_turbo"), "0");
        file(format!("{CPU_SYSFS}/cpuidle/current_driver"), "intel_idle");
        file(format!("{CPU_SYSFS}/cpuidle/current_governor"), "menu");
        file(format!("{CPU_SYSFS}/cpuidle/available_governors"), "menu teo");

        for cpu in 0..count {
            let (package, core) = self.place(cpu);
            if cpu > 0 {
                let state = if online.contains(&cpu) { "1" } else { "0" };
                file(format!("{CPU_SYSFS}/cpu{cpu}/online"), state);
            }
            let topo = format!("{CPU_SYSFS}/cpu{cpu}/topology");
            file(format!("{topo}/physical_package_id"), &package.to_string());
            file(format!("{topo}/core_id"), &core.to_string());
            file(format!("{topo}/die_id"), "0");

            let freq = format!("{CPU_SYSFS}/cpu{cpu}/cpufreq");
            file(format!("{freq}/scaling_min_freq"), "800000");
            file(format!("{freq}/scaling_max_freq"), "3000000");
            file(format!("{freq}/cpuinfo_min_freq"), "800000");
            file(format!("{freq}/cpuinfo_max_freq"), "3400000");
            file(format!("{freq}/base_frequency"), "2000000");
            file(format!("{freq}/scaling_governor"), "powersave");
            file(format!("{freq}/scaling_available_governors"), "performance powersave");
            file(format!("{freq}/scaling_driver"), "intel_pstate");
        }

        // Package-scoped POWER_CTL (C1E autopromote is bit 1), seen by every CPU of the
        // package.
        for package in 0..self.packages {
            let members: Vec<u32> = (0..count).filter(|&cpu| self.place(cpu).0 == package).collect();
            ds.registers.push(RegisterEntry {
                cpu: members[0],
                address: 0x1FC,
                value: "0x2".to_string(),
                shared: members[1..].to_vec(),
            });
        }
        ds
    }

    pub fn host(&self) -> FixtureHost {
        FixtureHost::from_dataset(self.dataset()).unwrap()
    }

    pub fn session(&self) -> HostSession {
        HostSession::new(Box::new(self.host())).unwrap()
    }
}

pub fn set(values: &[u32]) -> BTreeSet<u32> {
    values.iter().copied().collect()
}
