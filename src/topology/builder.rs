use super::{Capabilities, CoreKey, Cpu, DieKey, HybridKind, Placement, Snapshot};
use crate::range;
use crate::util::error::TopologyError;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// Raw per-CPU topology data as collected from a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuReport {
    pub cpu: u32,
    pub package: u32,
    pub core: u32,
    pub die: u32,
    pub module: Option<u32>,
    pub node: Option<u32>,
    pub hybrid: HybridKind,
}

/// Everything needed to build a [`Snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyReport {
    pub host: String,
    pub present: BTreeSet<u32>,
    pub online: BTreeSet<u32>,
    pub cpus: Vec<CpuReport>,
    /// Dies without CPUs, such as I/O dies.
    pub noncomp_dies: Vec<DieKey>,
    pub core_ids_package_relative: bool,
    pub die_ids_package_relative: bool,
}

/// Validate a report and turn it into a snapshot.
///
/// # Errors
///
/// Returns `TopologyError::Inconsistent` when the report contradicts itself, for example when
/// an online CPU has no data, module numbers exist for only some CPUs, or a module spans
/// packages.
pub fn build(report: TopologyReport) -> Result<Snapshot, TopologyError> {
    if let Some(cpu) = report.online.difference(&report.present).next() {
        return Err(TopologyError::Inconsistent(format!(
            "CPU {cpu} is online but not present"
        )));
    }

    let mut by_cpu: BTreeMap<u32, CpuReport> = BTreeMap::new();
    for cpu in report.cpus {
        if !report.present.contains(&cpu.cpu) {
            return Err(TopologyError::Inconsistent(format!(
                "topology data for unknown CPU {}",
                cpu.cpu
            )));
        }
        if !report.online.contains(&cpu.cpu) {
            debug!("Ignoring topology data for offline CPU {}", cpu.cpu);
            continue;
        }
        let id = cpu.cpu;
        if by_cpu.insert(id, cpu).is_some() {
            return Err(TopologyError::Inconsistent(format!(
                "duplicate topology data for CPU {id}"
            )));
        }
    }

    if let Some(cpu) = report.online.iter().find(|cpu| !by_cpu.contains_key(cpu)) {
        return Err(TopologyError::Inconsistent(format!(
            "no topology data for online CPU {cpu}"
        )));
    }

    let modules_reported = by_cpu.values().any(|cpu| cpu.module.is_some());
    if modules_reported {
        if let Some(cpu) = by_cpu.values().find(|cpu| cpu.module.is_none()) {
            return Err(TopologyError::Inconsistent(format!(
                "CPU {} (package {} core {}) has no module number while other CPUs do",
                cpu.cpu, cpu.package, cpu.core
            )));
        }
    }

    // Without module data every core is its own module.
    let synthetic_modules: BTreeMap<CoreKey, u32> = if modules_reported {
        BTreeMap::new()
    } else {
        let keys: BTreeSet<CoreKey> = by_cpu
            .values()
            .map(|cpu| CoreKey {
                package: cpu.package,
                core: cpu.core,
            })
            .collect();
        keys.into_iter().zip(0..).collect()
    };

    let mut cpus: BTreeMap<u32, Cpu> = report
        .present
        .iter()
        .map(|&id| {
            (
                id,
                Cpu {
                    id,
                    placement: None,
                },
            )
        })
        .collect();
    let mut packages: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
    let mut cores: BTreeMap<CoreKey, Vec<u32>> = BTreeMap::new();
    let mut modules: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    let mut dies: BTreeMap<DieKey, Vec<u32>> = BTreeMap::new();
    let mut nodes: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    let mut core_die: BTreeMap<CoreKey, u32> = BTreeMap::new();
    let mut module_package: BTreeMap<u32, u32> = BTreeMap::new();

    // `by_cpu` iterates in CPU order, so every member list below ends up sorted.
    for report_cpu in by_cpu.values() {
        let core_key = CoreKey {
            package: report_cpu.package,
            core: report_cpu.core,
        };
        let Some(module) = report_cpu
            .module
            .or_else(|| synthetic_modules.get(&core_key).copied())
        else {
            return Err(TopologyError::Inconsistent(format!(
                "no module number for CPU {}",
                report_cpu.cpu
            )));
        };

        if let Some(&die) = core_die.get(&core_key) {
            if die != report_cpu.die {
                return Err(TopologyError::Inconsistent(format!(
                    "package {} core {} spans dies {die} and {}",
                    core_key.package, core_key.core, report_cpu.die
                )));
            }
        }
        core_die.insert(core_key, report_cpu.die);

        if let Some(&package) = module_package.get(&module) {
            if package != report_cpu.package {
                return Err(TopologyError::Inconsistent(format!(
                    "module {module} spans packages {package} and {}",
                    report_cpu.package
                )));
            }
        }
        module_package.insert(module, report_cpu.package);

        let placement = Placement {
            package: report_cpu.package,
            core: report_cpu.core,
            module,
            die: report_cpu.die,
            node: report_cpu.node,
            hybrid: report_cpu.hybrid,
        };
        if let Some(cpu) = cpus.get_mut(&report_cpu.cpu) {
            cpu.placement = Some(placement);
        }

        packages
            .entry(report_cpu.package)
            .or_default()
            .insert(report_cpu.cpu);
        cores.entry(core_key).or_default().push(report_cpu.cpu);
        modules.entry(module).or_default().push(report_cpu.cpu);
        dies.entry(DieKey {
            package: report_cpu.package,
            die: report_cpu.die,
        })
        .or_default()
        .push(report_cpu.cpu);
        if let Some(node) = report_cpu.node {
            nodes.entry(node).or_default().push(report_cpu.cpu);
        }
    }

    for key in report.noncomp_dies {
        if dies.get(&key).is_some_and(|cpus| !cpus.is_empty()) {
            return Err(TopologyError::Inconsistent(format!(
                "package {} die {} is listed as a non-compute die but has CPUs",
                key.package, key.die
            )));
        }
        dies.entry(key).or_default();
        packages.entry(key.package).or_default();
    }

    let caps = Capabilities {
        core_ids_package_relative: report.core_ids_package_relative,
        die_ids_package_relative: report.die_ids_package_relative,
        modules_reported,
        hybrid: by_cpu.values().any(|cpu| cpu.hybrid != HybridKind::None),
    };

    debug!(
        "Built topology of {}: {} present CPUs, online {}, {} package(s), {} core(s), {} die(s)",
        report.host,
        cpus.len(),
        range::emit(by_cpu.keys().copied()),
        packages.len(),
        cores.len(),
        dies.len()
    );

    Ok(Snapshot {
        host: report.host,
        cpus,
        packages,
        cores,
        modules,
        dies,
        nodes,
        caps,
    })
}

/// A regular topology for tests: `threads` CPUs per core, numbered the way Linux numbers
/// them, with all first threads before all second threads.
#[cfg(test)]
pub(crate) fn synthetic(packages: u32, cores: u32, threads: u32, offline: &[u32]) -> Snapshot {
    build(synthetic_report(packages, cores, threads, offline)).unwrap()
}

#[cfg(test)]
pub(crate) fn synthetic_report(
    packages: u32,
    cores: u32,
    threads: u32,
    offline: &[u32],
) -> TopologyReport {
    let mut report = TopologyReport {
        host: "synthetic".to_string(),
        core_ids_package_relative: true,
        die_ids_package_relative: true,
        ..TopologyReport::default()
    };

    for thread in 0..threads {
        for package in 0..packages {
            for core in 0..cores {
                let cpu = thread * packages * cores + package * cores + core;
                report.present.insert(cpu);
                if offline.contains(&cpu) {
                    continue;
                }
                report.online.insert(cpu);
                report.cpus.push(CpuReport {
                    cpu,
                    package,
                    core,
                    die: 0,
                    module: None,
                    node: Some(package),
                    hybrid: HybridKind::None,
                });
            }
        }
    }
    report
}
