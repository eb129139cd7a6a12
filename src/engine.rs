//! Reading and writing one property over a selection: reduce the selected CPUs to the scope
//! instances the property lives at, then try the property's mechanisms in order on each
//! instance's representative CPU.

use crate::drivers::{self, Context, MechanismOutcome, Target};
use crate::host::Host;
use crate::props::{self, Mechanism, Property, Scope, Special, Value, WriteValue};
use crate::selection::Selection;
use crate::topology::{ScopeInstance, Snapshot};
use crate::util::error::{PropertyError, ResolutionError};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Frequencies computed for `mdl` are rounded to this step.
const FREQ_STEP_HZ: u64 = 100_000_000;

/// A flag shared between the caller and a running resolution. Once set, instances that have
/// not started yet are skipped and reported as abandoned.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One mechanism tried on one instance.
#[derive(Debug)]
pub struct Attempt {
    pub mechanism: Mechanism,
    pub outcome: MechanismOutcome,
}

/// How the fallback over mechanisms ended for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceOutcome {
    /// The value read, or the value written.
    Resolved { value: Value, mechanism: Mechanism },
    /// A mechanism refused the operation, later mechanisms were not tried.
    Denied { mechanism: Mechanism, reason: String },
    /// No mechanism could handle the instance.
    Exhausted,
}

impl fmt::Display for InstanceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved { value, mechanism } => write!(f, "{value} (via {mechanism})"),
            Self::Denied { mechanism, reason } => write!(f, "denied by {mechanism}: {reason}"),
            Self::Exhausted => f.write_str("no mechanism available"),
        }
    }
}

#[derive(Debug)]
enum State {
    Trying(usize),
    Done(InstanceOutcome),
}

/// Try `mechanisms` in order until one succeeds or denies.
///
/// `Unsupported` and transport errors move on to the next mechanism. A denial is final: a
/// locked register is not bypassed through a weaker mechanism.
pub fn run_fallback(
    mechanisms: &[Mechanism],
    mut attempt: impl FnMut(Mechanism) -> MechanismOutcome,
) -> (InstanceOutcome, Vec<Attempt>) {
    let mut attempts = Vec::new();
    let mut state = State::Trying(0);

    loop {
        state = match state {
            State::Done(outcome) => return (outcome, attempts),
            State::Trying(idx) => match mechanisms.get(idx) {
                None => State::Done(InstanceOutcome::Exhausted),
                Some(&mechanism) => {
                    let outcome = attempt(mechanism);
                    let next = match &outcome {
                        MechanismOutcome::Success(value) => State::Done(InstanceOutcome::Resolved {
                            value: value.clone(),
                            mechanism,
                        }),
                        MechanismOutcome::Denied(reason) => State::Done(InstanceOutcome::Denied {
                            mechanism,
                            reason: reason.clone(),
                        }),
                        MechanismOutcome::Unsupported(_) | MechanismOutcome::TransportError(_) => {
                            State::Trying(idx + 1)
                        }
                    };
                    attempts.push(Attempt { mechanism, outcome });
                    next
                }
            },
        };
    }
}

/// A member CPU whose read-back disagreed with the written value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub cpu: u32,
    /// What was read instead, or why reading failed.
    pub found: String,
}

/// Everything that happened for one scope instance.
#[derive(Debug)]
pub struct InstanceResult {
    /// Online CPUs sharing the instance. A write applies to all of them.
    pub members: Vec<u32>,
    /// The CPU all I/O went through. Dies without CPUs have none.
    pub representative: Option<u32>,
    pub outcome: InstanceOutcome,
    pub attempts: Vec<Attempt>,
    pub mismatches: Vec<Mismatch>,
}

/// The result of a read or write over a selection. Instances succeed or fail independently.
#[derive(Debug)]
pub struct Resolution {
    pub property: &'static Property,
    pub outcomes: BTreeMap<ScopeInstance, InstanceResult>,
    /// Instances skipped after cancellation.
    pub abandoned: Vec<ScopeInstance>,
}

impl Resolution {
    /// Whether every instance was processed and resolved.
    pub fn is_complete(&self) -> bool {
        self.abandoned.is_empty()
            && self
                .outcomes
                .values()
                .all(|res| matches!(res.outcome, InstanceOutcome::Resolved { .. }) && res.mismatches.is_empty())
    }

    /// Values per instance, in instance order. Instances that disagree are all kept.
    pub fn values(&self) -> impl Iterator<Item = (&ScopeInstance, &Value)> {
        self.outcomes.iter().filter_map(|(instance, res)| match &res.outcome {
            InstanceOutcome::Resolved { value, .. } => Some((instance, value)),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ScopeInstance, &InstanceResult)> {
        self.outcomes
            .iter()
            .filter(|(_, res)| !matches!(res.outcome, InstanceOutcome::Resolved { .. }))
    }
}

/// A scope instance to operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub target: Target,
    pub members: Vec<u32>,
}

/// Map a selection to the distinct instances of `scope` it touches. The representative of an
/// instance is its lowest selected CPU.
pub fn reduce(topology: &Snapshot, scope: Scope, selection: &Selection) -> Vec<Unit> {
    let mut units: BTreeMap<ScopeInstance, Option<u32>> = BTreeMap::new();

    if scope == Scope::Global {
        let representative = selection
            .cpus
            .first()
            .copied()
            .or_else(|| topology.online_cpus().first().copied());
        units.insert(ScopeInstance::Global, representative);
    } else {
        for &cpu in &selection.cpus {
            if let Some(instance) = topology.instance_of(cpu, scope) {
                units.entry(instance).or_insert(Some(cpu));
            }
        }
        if scope == Scope::Die {
            for &key in &selection.noncomp_dies {
                units.insert(ScopeInstance::Die(key), None);
            }
        } else if !selection.noncomp_dies.is_empty() {
            debug!("Dies without CPUs have no {scope} instances, skipping them");
        }
    }

    units
        .into_iter()
        .map(|(instance, cpu)| Unit {
            target: Target { instance, cpu },
            members: topology.instance_cpus(&instance),
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum Direction<'v> {
    Read,
    Write(&'v WriteValue),
}

/// Resolves property reads and writes on one host and topology snapshot.
#[derive(Debug)]
pub struct Engine<'a> {
    host: &'a dyn Host,
    topology: &'a Snapshot,
    jobs: usize,
    verify: bool,
    cancel: CancelToken,
}

impl<'a> Engine<'a> {
    pub fn new(host: &'a dyn Host, topology: &'a Snapshot) -> Self {
        Self {
            host,
            topology,
            jobs: 1,
            verify: false,
            cancel: CancelToken::new(),
        }
    }

    /// Resolve up to `jobs` instances in parallel. Zero means one job per local CPU.
    #[must_use]
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = if jobs == 0 { num_cpus::get() } else { jobs };
        self
    }

    /// Read the value back on every member CPU after a successful write.
    #[must_use]
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    #[must_use]
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    const fn context(&self) -> Context<'a> {
        Context {
            host: self.host,
            topology: self.topology,
        }
    }

    /// Read `prop` on every instance the selection touches.
    ///
    /// # Errors
    ///
    /// Returns `ResolutionError` when a preferred mechanism does not apply to the property or
    /// the selection maps to no instance. Per-instance failures are part of the result.
    pub fn read(
        &self,
        prop: &'static Property,
        selection: &Selection,
        mechanisms: Option<&[Mechanism]>,
    ) -> Result<Resolution, ResolutionError> {
        self.resolve(prop, selection, mechanisms, Direction::Read)
    }

    /// Write `value` to `prop` on every instance the selection touches.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::read`], plus `PropertyError::NotWritable` for read-only properties.
    pub fn write(
        &self,
        prop: &'static Property,
        selection: &Selection,
        value: &WriteValue,
        mechanisms: Option<&[Mechanism]>,
    ) -> Result<Resolution, ResolutionError> {
        if !prop.writable {
            return Err(PropertyError::NotWritable(prop.name.to_string()).into());
        }
        self.resolve(prop, selection, mechanisms, Direction::Write(value))
    }

    fn resolve(
        &self,
        prop: &'static Property,
        selection: &Selection,
        mechanisms: Option<&[Mechanism]>,
        direction: Direction<'_>,
    ) -> Result<Resolution, ResolutionError> {
        let order = prop.mechanism_order(mechanisms)?;
        let units = reduce(self.topology, prop.scope, selection);
        if units.is_empty() {
            return Err(ResolutionError::NoTarget {
                property: prop.name.to_string(),
                scope: prop.scope.to_string(),
            });
        }
        debug!(
            "{}: {} over {} {} instance(s)",
            self.host.name(),
            prop.name,
            units.len(),
            prop.scope
        );

        let order = order.as_slice();
        let jobs = self.jobs.clamp(1, units.len());
        let chunk_size = units.len().div_ceil(jobs);
        let mut done: Vec<(ScopeInstance, Option<InstanceResult>)> = Vec::with_capacity(units.len());

        if jobs == 1 {
            done.extend(self.run_chunk(prop, order, direction, &units));
        } else {
            std::thread::scope(|s| {
                let handles: Vec<_> = units
                    .chunks(chunk_size)
                    .map(|chunk| s.spawn(move || self.run_chunk(prop, order, direction, chunk)))
                    .collect();
                for (handle, chunk) in handles.into_iter().zip(units.chunks(chunk_size)) {
                    match handle.join() {
                        Ok(results) => done.extend(results),
                        Err(_) => {
                            warn!("A worker resolving {} panicked", prop.name);
                            done.extend(chunk.iter().map(|unit| (unit.target.instance, None)));
                        }
                    }
                }
            });
        }

        let mut resolution = Resolution {
            property: prop,
            outcomes: BTreeMap::new(),
            abandoned: Vec::new(),
        };
        for (instance, result) in done {
            match result {
                Some(result) => {
                    resolution.outcomes.insert(instance, result);
                }
                None => resolution.abandoned.push(instance),
            }
        }
        if !resolution.abandoned.is_empty() {
            warn!(
                "Cancelled, {} {} instance(s) were not processed",
                resolution.abandoned.len(),
                prop.scope
            );
        }
        Ok(resolution)
    }

    fn run_chunk(
        &self,
        prop: &'static Property,
        order: &[Mechanism],
        direction: Direction<'_>,
        units: &[Unit],
    ) -> Vec<(ScopeInstance, Option<InstanceResult>)> {
        units
            .iter()
            .map(|unit| {
                let result = (!self.cancel.is_cancelled())
                    .then(|| self.run_unit(prop, order, direction, unit));
                (unit.target.instance, result)
            })
            .collect()
    }

    fn run_unit(
        &self,
        prop: &'static Property,
        order: &[Mechanism],
        direction: Direction<'_>,
        unit: &Unit,
    ) -> InstanceResult {
        let ctx = self.context();
        let target = unit.target;

        let (outcome, attempts) = match direction {
            Direction::Read => run_fallback(order, |mechanism| {
                let outcome = drivers::driver(mechanism).read(&ctx, prop, &target);
                debug!("{}: read {} on {target} via {mechanism}: {outcome}", self.host.name(), prop.name);
                outcome
            }),
            Direction::Write(value) => match self.concrete_value(prop, &target, value) {
                Ok(value) => run_fallback(order, |mechanism| {
                    let outcome = drivers::driver(mechanism).write(&ctx, prop, &target, &value);
                    debug!(
                        "{}: write {} = {value} on {target} via {mechanism}: {outcome}",
                        self.host.name(),
                        prop.name
                    );
                    outcome
                }),
                Err(attempt) => (InstanceOutcome::Exhausted, vec![attempt]),
            },
        };

        let mismatches = match (&direction, &outcome) {
            (Direction::Write(_), InstanceOutcome::Resolved { value, mechanism }) => {
                info!("{}: {} set to {value} on {target}", self.host.name(), prop.name);
                if self.verify {
                    self.verify_members(prop, unit, value, *mechanism)
                } else {
                    Vec::new()
                }
            }
            (_, InstanceOutcome::Denied { reason, .. }) => {
                warn!("{}: {} on {target} denied: {reason}", self.host.name(), prop.name);
                Vec::new()
            }
            _ => Vec::new(),
        };

        InstanceResult {
            members: unit.members.clone(),
            representative: target.cpu,
            outcome,
            attempts,
            mismatches,
        }
    }

    /// Turn specials such as `max` or `base` into numbers by reading the properties they refer
    /// to through the mechanisms those properties list.
    fn concrete_value(&self, prop: &Property, target: &Target, value: &WriteValue) -> Result<Value, Attempt> {
        let special = match value {
            WriteValue::Exact(value) => return Ok(value.clone()),
            WriteValue::Special(special) => *special,
        };
        let unsupported = |reason: String| Attempt {
            mechanism: Mechanism::Sysfs,
            outcome: MechanismOutcome::Unsupported(reason),
        };

        let Some((min_name, max_name)) = prop.limits else {
            return Err(unsupported(format!("{} has no limits to resolve '{special}'", prop.name)));
        };
        let read_number = |name: &str| -> Result<u64, Attempt> {
            let source = props::lookup(name).map_err(|e| unsupported(e.to_string()))?;
            let mut last = unsupported(format!("{name} cannot be read"));
            for &mechanism in source.mechanisms {
                let outcome = match drivers::driver(mechanism).read(&self.context(), source, target) {
                    MechanismOutcome::Success(Value::Int(value)) => return Ok(value),
                    MechanismOutcome::Success(other) => {
                        MechanismOutcome::Unsupported(format!("{name} is not a number: {other}"))
                    }
                    outcome => outcome,
                };
                last = Attempt { mechanism, outcome };
            }
            Err(last)
        };

        let resolved = match special {
            Special::Min => read_number(min_name)?,
            Special::Max => read_number(max_name)?,
            Special::Mdl => mid_frequency(read_number(min_name)?, read_number(max_name)?),
            Special::Base => read_number("base_freq")?,
            Special::Eff => read_number("max_eff_freq").or_else(|attempt| {
                debug!(
                    "{}: no efficiency frequency on {target} ({}), using {min_name}",
                    self.host.name(),
                    attempt.outcome
                );
                read_number(min_name)
            })?,
        };
        debug!("{}: '{special}' for {} on {target} is {resolved}", self.host.name(), prop.name);
        Ok(Value::Int(resolved))
    }

    /// Read the property on every member CPU through the mechanism that performed the write.
    fn verify_members(&self, prop: &Property, unit: &Unit, expected: &Value, mechanism: Mechanism) -> Vec<Mismatch> {
        let ctx = self.context();
        let driver = drivers::driver(mechanism);

        unit.members
            .iter()
            .filter_map(|&cpu| {
                let target = Target {
                    instance: unit.target.instance,
                    cpu: Some(cpu),
                };
                let found = match driver.read(&ctx, prop, &target) {
                    MechanismOutcome::Success(value) if value == *expected => return None,
                    MechanismOutcome::Success(value) => value.to_string(),
                    other => other.to_string(),
                };
                warn!(
                    "{}: {} on CPU {cpu} reads back '{found}', expected '{expected}'",
                    self.host.name(),
                    prop.name
                );
                Some(Mismatch { cpu, found })
            })
            .collect()
    }
}

/// The middle of a frequency range, rounded to the nearest step.
fn mid_frequency(min: u64, max: u64) -> u64 {
    let mid = min / 2 + max / 2 + (min % 2 + max % 2) / 2;
    ((mid + FREQ_STEP_HZ / 2) / FREQ_STEP_HZ) * FREQ_STEP_HZ
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FixtureHost;
    use crate::props::lookup;
    use crate::topology::{DieKey, build, synthetic, synthetic_report};
    use crate::util::error::HostError;
    use std::cell::RefCell;

    fn selection(cpus: &[u32]) -> Selection {
        Selection {
            cpus: cpus.iter().copied().collect(),
            ..Selection::default()
        }
    }

    #[test]
    fn fallback_stops_at_success() {
        let tried = RefCell::new(Vec::new());
        let (outcome, attempts) = run_fallback(&[Mechanism::Tpmi, Mechanism::Msr, Mechanism::Sysfs], |m| {
            tried.borrow_mut().push(m);
            match m {
                Mechanism::Tpmi => MechanismOutcome::Unsupported("no debugfs".to_string()),
                Mechanism::Msr => MechanismOutcome::TransportError(HostError::PathMissing("msr".to_string())),
                _ => MechanismOutcome::Success(Value::Int(7)),
            }
        });
        assert_eq!(
            outcome,
            InstanceOutcome::Resolved {
                value: Value::Int(7),
                mechanism: Mechanism::Sysfs
            }
        );
        assert_eq!(attempts.len(), 3);
        assert_eq!(*tried.borrow(), vec![Mechanism::Tpmi, Mechanism::Msr, Mechanism::Sysfs]);
    }

    #[test]
    fn denial_is_final() {
        let mut tried = Vec::new();
        let (outcome, attempts) = run_fallback(&[Mechanism::Msr, Mechanism::Sysfs], |m| {
            tried.push(m);
            MechanismOutcome::Denied("locked".to_string())
        });
        assert!(matches!(outcome, InstanceOutcome::Denied { mechanism: Mechanism::Msr, .. }));
        assert_eq!(attempts.len(), 1);
        assert_eq!(tried, vec![Mechanism::Msr]);
    }

    #[test]
    fn exhaustion_keeps_every_attempt() {
        let (outcome, attempts) = run_fallback(&[Mechanism::Sysfs, Mechanism::Msr], |_| {
            MechanismOutcome::Unsupported("nope".to_string())
        });
        assert_eq!(outcome, InstanceOutcome::Exhausted);
        assert_eq!(
            attempts.iter().map(|a| a.mechanism).collect::<Vec<_>>(),
            vec![Mechanism::Sysfs, Mechanism::Msr]
        );
        let (outcome, attempts) = run_fallback(&[], |_| unreachable!());
        assert_eq!(outcome, InstanceOutcome::Exhausted);
        assert!(attempts.is_empty());
    }

    #[test]
    fn scope_reduction() {
        // One package, four single-threaded cores.
        let topo = synthetic(1, 4, 1, &[]);
        let sel = selection(&[0, 1, 2, 3]);

        let units = reduce(&topo, Scope::Package, &sel);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].target.cpu, Some(0));
        assert_eq!(units[0].members, vec![0, 1, 2, 3]);

        assert_eq!(reduce(&topo, Scope::Cpu, &sel).len(), 4);
        assert_eq!(reduce(&topo, Scope::Core, &sel).len(), 4);

        let global = reduce(&topo, Scope::Global, &selection(&[2, 3]));
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].target.cpu, Some(2));
    }

    #[test]
    fn representative_is_lowest_selected_cpu() {
        let topo = synthetic(2, 2, 2, &[]);
        // Package 1 holds CPUs 2, 3, 6 and 7.
        let units = reduce(&topo, Scope::Package, &selection(&[7, 3]));
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].target.instance, ScopeInstance::Package(1));
        assert_eq!(units[0].target.cpu, Some(3));
        assert_eq!(units[0].members, vec![2, 3, 6, 7]);
    }

    #[test]
    fn noncompute_dies_only_for_die_scope() {
        let mut report = synthetic_report(1, 2, 1, &[]);
        report.noncomp_dies.push(DieKey { package: 0, die: 1 });
        let topo = build(report).unwrap();
        let sel = Selection {
            cpus: [0].into_iter().collect(),
            noncomp_dies: [DieKey { package: 0, die: 1 }].into_iter().collect(),
        };

        let dies = reduce(&topo, Scope::Die, &sel);
        assert_eq!(dies.len(), 2);
        assert_eq!(dies[1].target.cpu, None);
        assert!(dies[1].members.is_empty());
        assert_eq!(reduce(&topo, Scope::Package, &sel).len(), 1);
    }

    const HOST: &str = r#"
        [files]
        "/sys/devices/system/cpu/cpu0/cpufreq/scaling_max_freq" = "3000000"
        "/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_min_freq" = "800000"
        "/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq" = "4000000"
        "/sys/devices/system/cpu/cpu1/cpufreq/scaling_max_freq" = "3000000"
        "/sys/devices/system/cpu/cpu1/cpufreq/cpuinfo_min_freq" = "800000"
        "/sys/devices/system/cpu/cpu1/cpufreq/cpuinfo_max_freq" = "4000000"
        "/sys/devices/system/cpu/intel_uncore_frequency/package_00_die_00/max_freq_khz" = "2000000"
        "/sys/devices/system/cpu/intel_uncore_frequency/package_00_die_00/initial_min_freq_khz" = "800000"
        "/sys/devices/system/cpu/intel_uncore_frequency/package_00_die_00/initial_max_freq_khz" = "2500000"

        [[registers]]
        cpu = 0
        address = 0xe2
        value = "0x8000"

        [[registers]]
        cpu = 0
        address = 0x1fc
        value = "0x0"
        shared = [1]
    "#;

    #[test]
    fn reads_per_cpu() {
        let host = FixtureHost::from_toml(HOST).unwrap();
        let topo = synthetic(1, 2, 1, &[]);
        let engine = Engine::new(&host, &topo);

        let res = engine.read(lookup("max_freq").unwrap(), &selection(&[0, 1]), None).unwrap();
        assert!(res.is_complete());
        assert_eq!(res.values().count(), 2);
        assert!(res.values().all(|(_, v)| *v == Value::Int(3_000_000_000)));
    }

    #[test]
    fn specials_use_limits() {
        let host = FixtureHost::from_toml(HOST).unwrap();
        let topo = synthetic(1, 2, 1, &[]);
        let engine = Engine::new(&host, &topo);

        let res = engine
            .write(
                lookup("max_freq").unwrap(),
                &selection(&[1]),
                &WriteValue::Special(Special::Max),
                None,
            )
            .unwrap();
        assert!(res.is_complete());
        assert_eq!(
            host.file("/sys/devices/system/cpu/cpu1/cpufreq/scaling_max_freq").unwrap(),
            "4000000"
        );

        // (800 + 2500) / 2 = 1650 MHz, rounded to 1700 MHz.
        let res = engine
            .write(
                lookup("uncore_max_freq").unwrap(),
                &selection(&[0]),
                &WriteValue::Special(Special::Mdl),
                None,
            )
            .unwrap();
        assert!(res.is_complete());
        assert_eq!(
            host.file("/sys/devices/system/cpu/intel_uncore_frequency/package_00_die_00/max_freq_khz")
                .unwrap(),
            "1700000"
        );
    }

    #[test]
    fn base_and_efficiency_specials() {
        // CPU 0 reports frequencies only through MSRs, CPU 1 only through sysfs.
        let host = FixtureHost::from_toml(
            r#"
            [files]
            "/sys/devices/system/cpu/cpu0/cpufreq/scaling_min_freq" = "800000"
            "/sys/devices/system/cpu/cpu0/cpufreq/scaling_max_freq" = "3000000"
            "/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_min_freq" = "800000"
            "/sys/devices/system/cpu/cpu1/cpufreq/scaling_min_freq" = "1000000"
            "/sys/devices/system/cpu/cpu1/cpufreq/scaling_max_freq" = "3000000"
            "/sys/devices/system/cpu/cpu1/cpufreq/cpuinfo_min_freq" = "800000"
            "/sys/devices/system/cpu/cpu1/cpufreq/base_frequency" = "2100000"

            [[registers]]
            cpu = 0
            address = 0xce
            value = "0xc0000001800"
            "#,
        )
        .unwrap();
        let topo = synthetic(1, 2, 1, &[]);
        let engine = Engine::new(&host, &topo);
        let cpufreq = |cpu: u32, file: &str| {
            host.file(&format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq/{file}")).unwrap()
        };

        for (name, special) in [("max_freq", Special::Base), ("min_freq", Special::Eff)] {
            let res = engine
                .write(lookup(name).unwrap(), &selection(&[0, 1]), &WriteValue::Special(special), None)
                .unwrap();
            assert!(res.is_complete(), "{name}={special}");
        }

        assert_eq!(cpufreq(0, "scaling_max_freq"), "2400000");
        assert_eq!(cpufreq(0, "scaling_min_freq"), "1200000");
        assert_eq!(cpufreq(1, "scaling_max_freq"), "2100000");
        // No efficiency frequency on CPU 1, so the lowest supported one is used.
        assert_eq!(cpufreq(1, "scaling_min_freq"), "800000");
    }

    #[test]
    fn missing_limits_exhaust_the_instance() {
        let host = FixtureHost::from_toml("").unwrap();
        let topo = synthetic(1, 2, 1, &[]);
        let res = Engine::new(&host, &topo)
            .write(
                lookup("uncore_min_freq").unwrap(),
                &selection(&[0]),
                &WriteValue::Special(Special::Min),
                None,
            )
            .unwrap();
        let (_, failed) = res.failures().next().unwrap();
        assert_eq!(failed.outcome, InstanceOutcome::Exhausted);
        assert_eq!(failed.attempts.len(), 1);
    }

    #[test]
    fn locked_register_is_denied_per_instance() {
        let host = FixtureHost::from_toml(HOST).unwrap();
        let topo = synthetic(1, 2, 1, &[]);
        let res = Engine::new(&host, &topo)
            .write(
                lookup("pkg_cstate_limit").unwrap(),
                &selection(&[0, 1]),
                &WriteValue::Exact(Value::Int(0)),
                None,
            )
            .unwrap();
        // Core 0 is locked, core 1 cannot read the register.
        let outcomes: Vec<_> = res.outcomes.values().map(|r| r.outcome.clone()).collect();
        assert!(matches!(outcomes[0], InstanceOutcome::Denied { mechanism: Mechanism::Msr, .. }));
        assert_eq!(outcomes[1], InstanceOutcome::Exhausted);
        assert!(!res.is_complete());
    }

    #[test]
    fn package_write_is_seen_by_every_cpu() {
        let host = FixtureHost::from_toml(HOST).unwrap();
        let topo = synthetic(1, 2, 1, &[]);
        let engine = Engine::new(&host, &topo).verify(true);
        let prop = lookup("c1e_autopromote").unwrap();

        let res = engine
            .write(prop, &selection(&[1]), &WriteValue::Exact(Value::Bool(true)), None)
            .unwrap();
        assert!(res.is_complete());
        let result = &res.outcomes[&ScopeInstance::Package(0)];
        assert_eq!(result.representative, Some(1));
        assert_eq!(result.members, vec![0, 1]);

        for cpu in [0, 1] {
            let res = engine.read(prop, &selection(&[cpu]), None).unwrap();
            assert_eq!(res.values().next().map(|(_, v)| v.clone()), Some(Value::Bool(true)));
        }
    }

    #[test]
    fn verification_reports_mismatches() {
        // The register is not shared, so CPU 1 keeps its own copy.
        let host = FixtureHost::from_toml(
            r#"
            [[registers]]
            cpu = 0
            address = 0x1fc
            value = "0x0"

            [[registers]]
            cpu = 1
            address = 0x1fc
            value = "0x0"
            "#,
        )
        .unwrap();
        let topo = synthetic(1, 2, 1, &[]);
        let res = Engine::new(&host, &topo)
            .verify(true)
            .write(
                lookup("c1e_autopromote").unwrap(),
                &selection(&[0]),
                &WriteValue::Exact(Value::Bool(true)),
                None,
            )
            .unwrap();
        let result = &res.outcomes[&ScopeInstance::Package(0)];
        assert_eq!(
            result.mismatches,
            vec![Mismatch {
                cpu: 1,
                found: "off".to_string()
            }]
        );
        assert!(!res.is_complete());
    }

    #[test]
    fn request_errors() {
        let host = FixtureHost::from_toml(HOST).unwrap();
        let topo = synthetic(1, 2, 1, &[]);
        let engine = Engine::new(&host, &topo);

        assert!(matches!(
            engine.write(
                lookup("base_freq").unwrap(),
                &selection(&[0]),
                &WriteValue::Exact(Value::Int(1)),
                None
            ),
            Err(ResolutionError::Property(PropertyError::NotWritable(_)))
        ));
        assert!(matches!(
            engine.read(lookup("turbo").unwrap(), &selection(&[0]), Some(&[Mechanism::Msr])),
            Err(ResolutionError::Property(PropertyError::UnsupportedMechanism { .. }))
        ));
        assert!(matches!(
            engine.read(lookup("max_freq").unwrap(), &Selection::default(), None),
            Err(ResolutionError::NoTarget { .. })
        ));
    }

    #[test]
    fn parallel_matches_sequential() {
        let host = FixtureHost::from_toml(HOST).unwrap();
        let topo = synthetic(1, 2, 1, &[]);
        let prop = lookup("max_freq").unwrap();
        let sel = selection(&[0, 1]);

        let seq = Engine::new(&host, &topo).read(prop, &sel, None).unwrap();
        let par = Engine::new(&host, &topo).jobs(4).read(prop, &sel, None).unwrap();
        let values = |res: &Resolution| res.values().map(|(i, v)| (*i, v.clone())).collect::<Vec<_>>();
        assert_eq!(values(&seq), values(&par));
    }

    #[test]
    fn cancelled_instances_are_abandoned() {
        let host = FixtureHost::from_toml(HOST).unwrap();
        let topo = synthetic(1, 2, 1, &[]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let res = Engine::new(&host, &topo)
            .cancel_token(cancel)
            .read(lookup("max_freq").unwrap(), &selection(&[0, 1]), None)
            .unwrap();
        assert!(res.outcomes.is_empty());
        assert_eq!(res.abandoned, vec![ScopeInstance::Cpu(0), ScopeInstance::Cpu(1)]);
        assert!(!res.is_complete());
    }

    #[test]
    fn mid_frequency_rounding() {
        assert_eq!(mid_frequency(800_000_000, 2_500_000_000), 1_700_000_000);
        assert_eq!(mid_frequency(800_000_000, 2_400_000_000), 1_600_000_000);
        assert_eq!(mid_frequency(1_000_000_000, 1_000_000_000), 1_000_000_000);
    }
}
