//! An immutable snapshot of how CPUs are arranged into cores, modules, dies, NUMA nodes and
//! packages on one host.

mod builder;
mod probe;

pub use builder::{CpuReport, TopologyReport, build};
pub use probe::probe;

use crate::host::Host;
use crate::util::error::TopologyError;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The level of the hierarchy a property applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Cpu,
    Core,
    Module,
    Die,
    Package,
    Global,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "CPU",
            Self::Core => "core",
            Self::Module => "module",
            Self::Die => "die",
            Self::Package => "package",
            Self::Global => "global",
        })
    }
}

/// A core, identified by its package and its package-relative number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreKey {
    pub package: u32,
    pub core: u32,
}

/// A die, identified by its package and its number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DieKey {
    pub package: u32,
    pub die: u32,
}

/// Core type on hybrid parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HybridKind {
    #[default]
    None,
    Performance,
    Efficiency,
}

impl fmt::Display for HybridKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "-",
            Self::Performance => "P-core",
            Self::Efficiency => "E-core",
        })
    }
}

/// Where an online CPU sits in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub package: u32,
    pub core: u32,
    pub module: u32,
    pub die: u32,
    pub node: Option<u32>,
    pub hybrid: HybridKind,
}

/// A logical CPU. Offline CPUs have no placement, their ids are unknown rather than zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cpu {
    pub id: u32,
    pub placement: Option<Placement>,
}

impl Cpu {
    pub const fn is_online(&self) -> bool {
        self.placement.is_some()
    }
}

/// One concrete instance of a [`Scope`], such as "package 1 die 0".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeInstance {
    Cpu(u32),
    Core(CoreKey),
    Module(u32),
    Die(DieKey),
    Package(u32),
    Global,
}

impl ScopeInstance {
    pub const fn scope(&self) -> Scope {
        match self {
            Self::Cpu(_) => Scope::Cpu,
            Self::Core(_) => Scope::Core,
            Self::Module(_) => Scope::Module,
            Self::Die(_) => Scope::Die,
            Self::Package(_) => Scope::Package,
            Self::Global => Scope::Global,
        }
    }
}

impl fmt::Display for ScopeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu(cpu) => write!(f, "CPU {cpu}"),
            Self::Core(key) => write!(f, "package {} core {}", key.package, key.core),
            Self::Module(module) => write!(f, "module {module}"),
            Self::Die(key) => write!(f, "package {} die {}", key.package, key.die),
            Self::Package(package) => write!(f, "package {package}"),
            Self::Global => f.write_str("all CPUs"),
        }
    }
}

/// The order to list CPUs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Order {
    #[default]
    Cpu,
    Core,
    Module,
    Die,
    Node,
    Package,
}

/// What the platform reports about its own numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Core numbers restart in every package, so a core number alone is ambiguous.
    pub core_ids_package_relative: bool,
    /// Die numbers restart in every package.
    pub die_ids_package_relative: bool,
    /// Module numbers came from the platform rather than being derived from cores.
    pub modules_reported: bool,
    pub hybrid: bool,
}

/// The topology of one host at one point in time.
///
/// Snapshots are never patched in place: after CPU hotplug a new one is built, which keeps
/// sibling indices consistent with the online set.
#[derive(Debug, Clone)]
pub struct Snapshot {
    host: String,
    cpus: BTreeMap<u32, Cpu>,
    packages: BTreeMap<u32, BTreeSet<u32>>,
    cores: BTreeMap<CoreKey, Vec<u32>>,
    modules: BTreeMap<u32, Vec<u32>>,
    dies: BTreeMap<DieKey, Vec<u32>>,
    nodes: BTreeMap<u32, Vec<u32>>,
    caps: Capabilities,
}

impl Snapshot {
    /// Probe `host` and build its topology.
    pub fn discover(host: &dyn Host) -> Result<Self, TopologyError> {
        build(probe(host)?)
    }

    pub fn host_name(&self) -> &str {
        &self.host
    }

    pub const fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn cpu(&self, id: u32) -> Option<&Cpu> {
        self.cpus.get(&id)
    }

    pub fn placement(&self, cpu: u32) -> Option<&Placement> {
        self.cpus.get(&cpu).and_then(|c| c.placement.as_ref())
    }

    pub fn is_online(&self, cpu: u32) -> bool {
        self.placement(cpu).is_some()
    }

    pub fn present_cpus(&self) -> BTreeSet<u32> {
        self.cpus.keys().copied().collect()
    }

    pub fn online_cpus(&self) -> BTreeSet<u32> {
        self.cpus
            .values()
            .filter(|cpu| cpu.is_online())
            .map(|cpu| cpu.id)
            .collect()
    }

    pub fn offline_cpus(&self) -> BTreeSet<u32> {
        self.cpus
            .values()
            .filter(|cpu| !cpu.is_online())
            .map(|cpu| cpu.id)
            .collect()
    }

    /// All packages, including ones that only carry non-compute dies.
    pub fn packages(&self) -> BTreeSet<u32> {
        self.packages.keys().copied().collect()
    }

    pub fn package_cpus(&self, package: u32) -> Option<&BTreeSet<u32>> {
        self.packages.get(&package)
    }

    pub const fn cores(&self) -> &BTreeMap<CoreKey, Vec<u32>> {
        &self.cores
    }

    pub fn package_cores(&self, package: u32) -> BTreeSet<u32> {
        self.cores
            .keys()
            .filter(|key| key.package == package)
            .map(|key| key.core)
            .collect()
    }

    pub const fn modules(&self) -> &BTreeMap<u32, Vec<u32>> {
        &self.modules
    }

    /// Compute and non-compute dies. Non-compute dies have no CPUs.
    pub const fn dies(&self) -> &BTreeMap<DieKey, Vec<u32>> {
        &self.dies
    }

    pub fn package_dies(&self, package: u32) -> BTreeSet<u32> {
        self.dies
            .keys()
            .filter(|key| key.package == package)
            .map(|key| key.die)
            .collect()
    }

    pub fn is_compute_die(&self, key: DieKey) -> bool {
        self.dies.get(&key).is_some_and(|cpus| !cpus.is_empty())
    }

    pub fn noncomp_dies(&self) -> impl Iterator<Item = DieKey> + '_ {
        self.dies
            .iter()
            .filter(|(_, cpus)| cpus.is_empty())
            .map(|(key, _)| *key)
    }

    pub const fn nodes(&self) -> &BTreeMap<u32, Vec<u32>> {
        &self.nodes
    }

    /// The instance of `scope` that online CPU `cpu` belongs to.
    pub fn instance_of(&self, cpu: u32, scope: Scope) -> Option<ScopeInstance> {
        let p = self.placement(cpu)?;
        Some(match scope {
            Scope::Cpu => ScopeInstance::Cpu(cpu),
            Scope::Core => ScopeInstance::Core(CoreKey {
                package: p.package,
                core: p.core,
            }),
            Scope::Module => ScopeInstance::Module(p.module),
            Scope::Die => ScopeInstance::Die(DieKey {
                package: p.package,
                die: p.die,
            }),
            Scope::Package => ScopeInstance::Package(p.package),
            Scope::Global => ScopeInstance::Global,
        })
    }

    /// Online CPUs belonging to `instance`, sorted.
    pub fn instance_cpus(&self, instance: &ScopeInstance) -> Vec<u32> {
        match instance {
            ScopeInstance::Cpu(cpu) => {
                if self.is_online(*cpu) {
                    vec![*cpu]
                } else {
                    Vec::new()
                }
            }
            ScopeInstance::Core(key) => self.cores.get(key).cloned().unwrap_or_default(),
            ScopeInstance::Module(module) => self.modules.get(module).cloned().unwrap_or_default(),
            ScopeInstance::Die(key) => self.dies.get(key).cloned().unwrap_or_default(),
            ScopeInstance::Package(package) => self
                .packages
                .get(package)
                .map(|cpus| cpus.iter().copied().collect())
                .unwrap_or_default(),
            ScopeInstance::Global => self.online_cpus().into_iter().collect(),
        }
    }

    /// Position of `cpu` among the online CPUs of its core, ordered by CPU id.
    pub fn core_sibling_index(&self, cpu: u32) -> Option<u32> {
        let p = self.placement(cpu)?;
        let siblings = self.cores.get(&CoreKey {
            package: p.package,
            core: p.core,
        })?;
        sibling_position(siblings, cpu)
    }

    /// Position of `cpu` among the online CPUs of its module, ordered by CPU id.
    pub fn module_sibling_index(&self, cpu: u32) -> Option<u32> {
        let p = self.placement(cpu)?;
        sibling_position(self.modules.get(&p.module)?, cpu)
    }

    /// Order `cpus` for display. Offline CPUs go last.
    pub fn sorted(&self, cpus: impl IntoIterator<Item = u32>, order: Order) -> Vec<u32> {
        let mut cpus: Vec<u32> = cpus.into_iter().collect();
        cpus.sort_by_key(|&cpu| {
            let key = self.placement(cpu).map(|p| match order {
                Order::Cpu => (0, 0, cpu),
                Order::Core => (p.package, p.core, cpu),
                Order::Module => (p.module, 0, cpu),
                Order::Die => (p.package, p.die, cpu),
                Order::Node => (p.node.unwrap_or(u32::MAX), 0, cpu),
                Order::Package => (p.package, 0, cpu),
            });
            (key.is_none(), key, cpu)
        });
        cpus.dedup();
        cpus
    }
}

fn sibling_position(siblings: &[u32], cpu: u32) -> Option<u32> {
    siblings
        .binary_search(&cpu)
        .ok()
        .and_then(|idx| u32::try_from(idx).ok())
}

#[cfg(test)]
pub(crate) use builder::{synthetic, synthetic_report};
