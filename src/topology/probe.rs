use super::{CpuReport, DieKey, HybridKind, TopologyReport};
use crate::host::Host;
use crate::util::error::{HostError, TopologyError};
use crate::util::sysfs::{read_optional, read_sysfs_cpulist, read_sysfs_parsed};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

const CPU_SYSFS: &str = "/sys/devices/system/cpu";
const NODE_SYSFS: &str = "/sys/devices/system/node";
const UNCORE_SYSFS: &str = "/sys/devices/system/cpu/intel_uncore_frequency";

/// `MSR_PM_LOGICAL_ID`, whose domain id field numbers compute dies within a package on
/// platforms that hide them from CPUID.
const MSR_PM_LOGICAL_ID: u32 = 0x54;
const DOMAIN_ID_SHIFT: u32 = 11;
const DOMAIN_ID_MASK: u64 = 0x3F;

/// Collect topology data from the sysfs tree of `host`.
pub fn probe(host: &dyn Host) -> Result<TopologyReport, TopologyError> {
    let present = read_sysfs_cpulist(host, format!("{CPU_SYSFS}/present"))?;
    let online = match read_sysfs_cpulist(host, format!("{CPU_SYSFS}/online")) {
        Ok(online) => online,
        Err(HostError::PathMissing(_)) => {
            debug!("{}: no CPU online list, assuming all present CPUs are online", host.name());
            present.clone()
        }
        Err(e) => return Err(e.into()),
    };

    let nodes = read_nodes(host)?;
    let hybrid = read_hybrid(host)?;

    let mut cpus = Vec::with_capacity(online.len());
    let mut modules_missing = false;
    // None until the first CPU without a sysfs die id, then whether the MSR answered.
    let mut msr_dies: Option<bool> = None;
    for &cpu in &online {
        let topo = format!("{CPU_SYSFS}/cpu{cpu}/topology");
        let package: u32 = read_sysfs_parsed(host, format!("{topo}/physical_package_id"))?;
        let core: u32 = read_sysfs_parsed(host, format!("{topo}/core_id"))?;
        let die: Option<u32> = read_optional(host, format!("{topo}/die_id"))?
            .map(|value| parse_id(&topo, "die_id", &value))
            .transpose()?;
        let die = match die {
            Some(die) => Some(die),
            None if msr_dies != Some(false) => {
                let die = read_msr_die(host, cpu);
                msr_dies = Some(die.is_some());
                die
            }
            None => None,
        };

        // A module is a cluster of cores sharing an L2 cache. Older kernels and VMs expose
        // neither, then modules are derived from cores for every CPU.
        let module = if modules_missing {
            None
        } else {
            let module = read_module(host, cpu)?;
            if module.is_none() {
                debug!("{}: no module information for CPU {cpu}", host.name());
                modules_missing = true;
            }
            module
        };

        cpus.push(CpuReport {
            cpu,
            package,
            core,
            die: die.unwrap_or(0),
            module,
            node: nodes.get(&cpu).copied(),
            hybrid: hybrid.get(&cpu).copied().unwrap_or_default(),
        });
    }
    if modules_missing {
        for cpu in &mut cpus {
            cpu.module = None;
        }
    }

    // Domain ids repeat in every package.
    let die_ids_package_relative = msr_dies == Some(true) || dies_package_relative(&cpus);
    let noncomp_dies = read_noncomp_dies(host, &cpus)?;

    Ok(TopologyReport {
        host: host.name().to_string(),
        present,
        online,
        cpus,
        noncomp_dies,
        // Linux numbers cores within their package.
        core_ids_package_relative: true,
        die_ids_package_relative,
    })
}

fn parse_id(dir: &str, file: &str, value: &str) -> Result<u32, TopologyError> {
    value.parse().map_err(|e| TopologyError::BadData {
        path: format!("{dir}/{file}"),
        reason: format!("'{value}': {e}"),
    })
}

fn read_module(host: &dyn Host, cpu: u32) -> Result<Option<u32>, TopologyError> {
    let base = format!("{CPU_SYSFS}/cpu{cpu}");
    if let Some(id) = read_optional(host, format!("{base}/topology/cluster_id"))? {
        return parse_id(&format!("{base}/topology"), "cluster_id", &id).map(Some);
    }
    if let Some(id) = read_optional(host, format!("{base}/cache/index2/id"))? {
        return parse_id(&format!("{base}/cache/index2"), "id", &id).map(Some);
    }
    Ok(None)
}

fn read_msr_die(host: &dyn Host, cpu: u32) -> Option<u32> {
    match host.read_register(cpu, MSR_PM_LOGICAL_ID) {
        Ok(value) => u32::try_from((value >> DOMAIN_ID_SHIFT) & DOMAIN_ID_MASK).ok(),
        Err(e) => {
            debug!("{}: no die id for CPU {cpu} in sysfs or MSR {MSR_PM_LOGICAL_ID:#x}: {e}", host.name());
            None
        }
    }
}

fn read_nodes(host: &dyn Host) -> Result<BTreeMap<u32, u32>, TopologyError> {
    let mut cpu_to_node = BTreeMap::new();

    let nodes = match read_sysfs_cpulist(host, format!("{NODE_SYSFS}/online")) {
        Ok(nodes) => nodes,
        Err(HostError::PathMissing(_)) => return Ok(cpu_to_node),
        Err(e) => return Err(e.into()),
    };

    for node in nodes {
        for cpu in read_sysfs_cpulist(host, format!("{NODE_SYSFS}/node{node}/cpulist"))? {
            cpu_to_node.insert(cpu, node);
        }
    }
    Ok(cpu_to_node)
}

fn read_hybrid(host: &dyn Host) -> Result<BTreeMap<u32, HybridKind>, TopologyError> {
    let mut kinds = BTreeMap::new();

    for (pmu, kind) in [
        ("cpu_core", HybridKind::Performance),
        ("cpu_atom", HybridKind::Efficiency),
    ] {
        match read_sysfs_cpulist(host, format!("/sys/devices/{pmu}/cpus")) {
            Ok(cpus) => kinds.extend(cpus.into_iter().map(|cpu| (cpu, kind))),
            Err(HostError::PathMissing(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(kinds)
}

/// Die numbers are package-relative when the same number shows up in more than one package.
fn dies_package_relative(cpus: &[CpuReport]) -> bool {
    let mut die_packages: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
    for cpu in cpus {
        die_packages.entry(cpu.die).or_default().insert(cpu.package);
    }
    die_packages.values().any(|packages| packages.len() > 1)
}

/// Uncore frequency directories are named `package_XX_die_YY`. Those that match no compute
/// die belong to dies without CPUs.
fn read_noncomp_dies(host: &dyn Host, cpus: &[CpuReport]) -> Result<Vec<DieKey>, TopologyError> {
    let entries = match host.list_dir(Path::new(UNCORE_SYSFS)) {
        Ok(entries) => entries,
        Err(HostError::PathMissing(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let compute: BTreeSet<DieKey> = cpus
        .iter()
        .map(|cpu| DieKey {
            package: cpu.package,
            die: cpu.die,
        })
        .collect();
    let packages: BTreeSet<u32> = cpus.iter().map(|cpu| cpu.package).collect();

    let mut noncomp = Vec::new();
    for entry in entries {
        let Some(key) = parse_uncore_dir(&entry) else {
            continue;
        };
        // Packages with every CPU offline are skipped, nothing can represent them.
        if !compute.contains(&key) && packages.contains(&key.package) {
            noncomp.push(key);
        }
    }
    Ok(noncomp)
}

pub(crate) fn parse_uncore_dir(name: &str) -> Option<DieKey> {
    let rest = name.strip_prefix("package_")?;
    let (package, die) = rest.split_once("_die_")?;
    Some(DieKey {
        package: package.parse().ok()?,
        die: die.parse().ok()?,
    })
}
