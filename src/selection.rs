//! Turning a selection request (lists of CPUs, cores, modules, dies and packages plus sibling
//! filters) into a concrete set of online CPUs for one topology snapshot.

use crate::range::{self, RangeSpec};
use crate::topology::{CoreKey, DieKey, ScopeInstance, Snapshot};
use crate::util::error::{RangeError, SelectionError};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What the caller asked for. Every list is a raw range string such as `0-3,8` or `all`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionRequest {
    pub cpus: Option<String>,
    pub cores: Option<String>,
    pub modules: Option<String>,
    pub dies: Option<String>,
    pub packages: Option<String>,
    /// Indices of online CPUs within their core, such as `0` for the first hyperthread.
    pub core_siblings: Option<String>,
    pub module_siblings: Option<String>,
    /// The package that package-relative core and die numbers refer to.
    pub package: Option<u32>,
    /// Select every online CPU instead of CPU 0 when nothing else is given.
    pub default_all: bool,
}

impl SelectionRequest {
    fn has_dimension(&self) -> bool {
        self.cpus.is_some()
            || self.cores.is_some()
            || self.modules.is_some()
            || self.dies.is_some()
            || self.packages.is_some()
            || self.package.is_some()
    }

    fn has_siblings(&self) -> bool {
        self.core_siblings.is_some() || self.module_siblings.is_some()
    }
}

/// The outcome of resolving a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub cpus: BTreeSet<u32>,
    /// Selected dies that have no CPUs, such as I/O dies.
    pub noncomp_dies: BTreeSet<DieKey>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty() && self.noncomp_dies.is_empty()
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPUs {}", range::emit(self.cpus.iter().copied()))?;
        for die in &self.noncomp_dies {
            write!(f, ", package {} die {}", die.package, die.die)?;
        }
        Ok(())
    }
}

/// Every list of a request, parsed but not yet checked against the topology.
struct Parsed {
    cpus: Option<RangeSpec>,
    cores: Option<RangeSpec>,
    modules: Option<RangeSpec>,
    dies: Option<RangeSpec>,
    packages: Option<RangeSpec>,
    core_siblings: Option<RangeSpec>,
    module_siblings: Option<RangeSpec>,
}

/// Parse one list of a request. Numbers above the largest one `available` has are reported as
/// unavailable before any range is expanded.
fn parse_opt(
    topo: &Snapshot,
    what: &'static str,
    input: Option<&String>,
    available: &BTreeSet<u32>,
) -> Result<Option<RangeSpec>, SelectionError> {
    let Some(input) = input else {
        return Ok(None);
    };
    match range::parse_bounded(input, available.last().copied().unwrap_or(0)) {
        Ok(spec) => Ok(Some(spec)),
        Err(RangeError::OutOfDomain { value, .. }) => Err(SelectionError::NotAvailable {
            what,
            value: value.to_string(),
            host: topo.host_name().to_string(),
            available: range::emit(available.iter().copied()),
        }),
        Err(source) => Err(SelectionError::Syntax { what, source }),
    }
}

impl Parsed {
    fn new(topo: &Snapshot, req: &SelectionRequest) -> Result<Self, SelectionError> {
        let cores: BTreeSet<u32> = topo.cores().keys().map(|key| key.core).collect();
        let modules: BTreeSet<u32> = topo.modules().keys().copied().collect();
        let dies: BTreeSet<u32> = topo.dies().keys().map(|key| key.die).collect();
        // No unit can have more siblings than the host has CPUs.
        let present = topo.present_cpus();
        let positions: BTreeSet<u32> = (0..u32::try_from(present.len()).unwrap_or(u32::MAX)).collect();

        Ok(Self {
            cpus: parse_opt(topo, "CPU", req.cpus.as_ref(), &present)?,
            cores: parse_opt(topo, "core", req.cores.as_ref(), &cores)?,
            modules: parse_opt(topo, "module", req.modules.as_ref(), &modules)?,
            dies: parse_opt(topo, "die", req.dies.as_ref(), &dies)?,
            packages: parse_opt(topo, "package", req.packages.as_ref(), &topo.packages())?,
            core_siblings: parse_opt(topo, "core sibling index", req.core_siblings.as_ref(), &positions)?,
            module_siblings: parse_opt(
                topo,
                "module sibling index",
                req.module_siblings.as_ref(),
                &positions,
            )?,
        })
    }
}

/// Expand `spec` within `available`, rejecting numbers that do not exist.
fn expand(
    topo: &Snapshot,
    what: &'static str,
    spec: &RangeSpec,
    available: &BTreeSet<u32>,
) -> Result<BTreeSet<u32>, SelectionError> {
    match spec {
        RangeSpec::All => Ok(available.clone()),
        RangeSpec::Values(values) => {
            if let Some(bad) = values.iter().find(|v| !available.contains(v)) {
                return Err(SelectionError::NotAvailable {
                    what,
                    value: bad.to_string(),
                    host: topo.host_name().to_string(),
                    available: range::emit(available.iter().copied()),
                });
            }
            Ok(values.clone())
        }
    }
}

/// Resolve `req` against `topo`.
///
/// # Errors
///
/// Returns a `SelectionError` when a list is malformed, names something that does not exist,
/// leaves package-relative numbers ambiguous, or selects nothing.
pub fn resolve(topo: &Snapshot, req: &SelectionRequest) -> Result<Selection, SelectionError> {
    let parsed = Parsed::new(topo, req)?;
    let host = topo.host_name().to_string();
    let all_packages = topo.packages();

    // Packages either select CPUs themselves or, next to cores and dies, only say which
    // package relative numbers refer to.
    let mut listed_packages = match &parsed.packages {
        Some(spec) => Some(expand(topo, "package", spec, &all_packages)?),
        None => None,
    };
    if let Some(package) = req.package {
        if !all_packages.contains(&package) {
            return Err(SelectionError::NotAvailable {
                what: "package",
                value: package.to_string(),
                host,
                available: range::emit(all_packages.iter().copied()),
            });
        }
        listed_packages = Some([package].into_iter().collect());
    }
    let context = listed_packages.clone().unwrap_or_else(|| all_packages.clone());
    let caps = topo.capabilities();

    let mut selection = Selection::default();

    if let Some(spec) = &parsed.cores {
        let relative = caps.core_ids_package_relative;
        if relative && matches!(spec, RangeSpec::Values(_)) && context.len() != 1 {
            return Err(SelectionError::AmbiguousCoreScope {
                host,
                packages: describe_packages(listed_packages.as_ref()),
            });
        }
        for &package in &context {
            let available = if relative {
                topo.package_cores(package)
            } else {
                topo.cores().keys().map(|key| key.core).collect()
            };
            for core in expand(topo, "core", spec, &available)? {
                if let Some(cpus) = topo.cores().get(&CoreKey { package, core }) {
                    selection.cpus.extend(cpus);
                }
            }
        }
    }

    if let Some(spec) = &parsed.dies {
        let relative = caps.die_ids_package_relative;
        if relative && matches!(spec, RangeSpec::Values(_)) && context.len() != 1 {
            return Err(SelectionError::AmbiguousDieScope {
                host,
                packages: describe_packages(listed_packages.as_ref()),
            });
        }
        for &package in &context {
            let available = if relative {
                topo.package_dies(package)
            } else {
                topo.dies().keys().map(|key| key.die).collect()
            };
            for die in expand(topo, "die", spec, &available)? {
                let key = DieKey { package, die };
                if topo.is_compute_die(key) {
                    selection.cpus.extend(topo.instance_cpus(&ScopeInstance::Die(key)));
                } else if topo.dies().contains_key(&key) {
                    selection.noncomp_dies.insert(key);
                }
            }
        }
    }

    if let Some(spec) = &parsed.modules {
        let available: BTreeSet<u32> = topo.modules().keys().copied().collect();
        for module in expand(topo, "module", spec, &available)? {
            if let Some(cpus) = topo.modules().get(&module) {
                selection.cpus.extend(cpus);
            }
        }
    }

    if let Some(spec) = &parsed.cpus {
        let online = topo.online_cpus();
        match spec {
            RangeSpec::All => selection.cpus.extend(online),
            RangeSpec::Values(values) => {
                let present = topo.present_cpus();
                for &cpu in values {
                    if !present.contains(&cpu) {
                        return Err(SelectionError::NotAvailable {
                            what: "CPU",
                            value: cpu.to_string(),
                            host,
                            available: range::emit(present.iter().copied()),
                        });
                    }
                    if !online.contains(&cpu) {
                        return Err(SelectionError::OfflineCpu { cpu, host });
                    }
                    selection.cpus.insert(cpu);
                }
            }
        }
    }

    if parsed.cores.is_none() && parsed.dies.is_none() {
        if let Some(packages) = &listed_packages {
            for package in packages {
                if let Some(cpus) = topo.package_cpus(*package) {
                    selection.cpus.extend(cpus);
                }
            }
            selection
                .noncomp_dies
                .extend(topo.noncomp_dies().filter(|key| packages.contains(&key.package)));
        }
    }

    if !req.has_dimension() {
        if req.has_siblings() || req.default_all {
            selection.cpus = topo.online_cpus();
        } else if topo.is_online(0) {
            selection.cpus.insert(0);
        } else {
            return Err(SelectionError::OfflineCpu { cpu: 0, host });
        }
    }

    if let Some(RangeSpec::Values(indices)) = &parsed.core_siblings {
        selection.cpus = filter_siblings(topo, &selection.cpus, indices, SiblingUnit::Core)?;
    }
    if let Some(RangeSpec::Values(indices)) = &parsed.module_siblings {
        selection.cpus = filter_siblings(topo, &selection.cpus, indices, SiblingUnit::Module)?;
    }

    if selection.is_empty() {
        return Err(SelectionError::Empty(format!(
            "the request selects no online CPUs on {host}"
        )));
    }

    debug!("{host}: selected {selection}");
    Ok(selection)
}

fn describe_packages(listed: Option<&BTreeSet<u32>>) -> String {
    match listed {
        Some(packages) => format!("packages {}", range::emit(packages.iter().copied())),
        None => "no package".to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
enum SiblingUnit {
    Core,
    Module,
}

impl SiblingUnit {
    fn instance(self, topo: &Snapshot, cpu: u32) -> Option<ScopeInstance> {
        let p = topo.placement(cpu)?;
        Some(match self {
            Self::Core => ScopeInstance::Core(CoreKey {
                package: p.package,
                core: p.core,
            }),
            Self::Module => ScopeInstance::Module(p.module),
        })
    }

    fn index(self, topo: &Snapshot, cpu: u32) -> Option<u32> {
        match self {
            Self::Core => topo.core_sibling_index(cpu),
            Self::Module => topo.module_sibling_index(cpu),
        }
    }
}

/// Keep the CPUs whose position among the online CPUs of their core or module is in
/// `indices`.
///
/// An index is out of range when no participating unit has that many online CPUs. Units with
/// fewer CPUs, such as E-cores next to hyperthreaded P-cores, simply contribute nothing.
fn filter_siblings(
    topo: &Snapshot,
    cpus: &BTreeSet<u32>,
    indices: &BTreeSet<u32>,
    unit: SiblingUnit,
) -> Result<BTreeSet<u32>, SelectionError> {
    let mut units: BTreeMap<ScopeInstance, usize> = BTreeMap::new();
    for &cpu in cpus {
        if let Some(instance) = unit.instance(topo, cpu) {
            units
                .entry(instance)
                .or_insert_with(|| topo.instance_cpus(&instance).len());
        }
    }

    if let Some((&largest, &online)) = units.iter().max_by_key(|(_, online)| **online) {
        if let Some(&index) = indices
            .iter()
            .find(|&&index| usize::try_from(index).map_or(true, |index| index >= online))
        {
            return Err(SelectionError::SiblingIndexOutOfRange {
                unit: largest.to_string(),
                index,
                online,
            });
        }
    }

    Ok(cpus
        .iter()
        .copied()
        .filter(|&cpu| unit.index(topo, cpu).is_some_and(|idx| indices.contains(&idx)))
        .collect())
}
