use pwrcfg::drivers::MechanismOutcome;
use pwrcfg::engine::{InstanceOutcome, Resolution};
use pwrcfg::host::Host;
use pwrcfg::props::{self, Mechanism, PROPERTIES, Property, WriteValue};
use pwrcfg::range;
use pwrcfg::selection::SelectionRequest;
use pwrcfg::session::HostSession;
use pwrcfg::topology::{Order, Scope, ScopeInstance, Snapshot};
use pwrcfg::util::error::{AppError, HostError};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub fn get(
    session: &HostSession,
    names: &[String],
    req: &SelectionRequest,
    order: Order,
    mechanisms: Option<&str>,
) -> Result<(), AppError> {
    // Validate everything before touching the host.
    let props = names
        .iter()
        .map(|name| props::lookup(name))
        .collect::<Result<Vec<_>, _>>()?;
    let mechanisms = mechanisms.map(Mechanism::parse_list).transpose()?;
    let selection = session.select(req)?;
    let topology = session.topology();
    let engine = session.engine();

    let mut failed = 0;
    let mut needs_root = false;
    for prop in props {
        let res = engine.read(prop, &selection, mechanisms.as_deref())?;
        report(&topology, &res, order, false);
        if !res.is_complete() {
            failed += 1;
            needs_root |= permission_problem(&res);
        }
    }
    finish(session.host(), failed, "read", needs_root)
}

pub fn set(
    session: &HostSession,
    assignments: &[String],
    req: &SelectionRequest,
    order: Order,
    mechanisms: Option<&str>,
) -> Result<(), AppError> {
    let mut writes: Vec<(&'static Property, WriteValue)> = Vec::new();
    for assignment in assignments {
        let Some((name, value)) = assignment.split_once('=') else {
            return Err(AppError::Generic(format!(
                "bad assignment '{assignment}', expected PROP=VALUE"
            )));
        };
        let prop = props::lookup(name.trim())?;
        writes.push((prop, prop.parse_value(value)?));
    }
    let mechanisms = mechanisms.map(Mechanism::parse_list).transpose()?;
    let selection = session.select(req)?;
    let topology = session.topology();
    let engine = session.engine();

    let mut failed = 0;
    let mut needs_root = false;
    for (prop, value) in &writes {
        let res = engine.write(prop, &selection, value, mechanisms.as_deref())?;
        report(&topology, &res, order, true);
        if !res.is_complete() {
            failed += 1;
            needs_root |= permission_problem(&res);
        }
    }
    finish(session.host(), failed, "changed", needs_root)
}

/// Print the values of a resolution grouped by value, then every failure.
fn report(topology: &Snapshot, res: &Resolution, order: Order, written: bool) {
    let prop = res.property;
    let position: HashMap<u32, usize> = topology
        .sorted(topology.present_cpus(), order)
        .into_iter()
        .enumerate()
        .map(|(idx, cpu)| (cpu, idx))
        .collect();

    // Value and mechanism to the CPUs and CPU-less instances that reported it.
    let mut groups: BTreeMap<(String, Mechanism), (BTreeSet<u32>, Vec<ScopeInstance>)> = BTreeMap::new();
    for (instance, result) in &res.outcomes {
        if let InstanceOutcome::Resolved { value, mechanism } = &result.outcome {
            let entry = groups
                .entry((value.display(prop.unit()), *mechanism))
                .or_default();
            if result.members.is_empty() {
                entry.1.push(*instance);
            } else {
                entry.0.extend(&result.members);
            }
        }
    }

    let mut lines: Vec<(usize, String)> = groups
        .into_iter()
        .map(|((value, mechanism), (cpus, cpuless))| {
            let first = cpus
                .iter()
                .filter_map(|cpu| position.get(cpu))
                .min()
                .copied()
                .unwrap_or(usize::MAX);
            let value = if written { format!("set to {value}") } else { value };
            let line = format!(
                "{} ({}): {value} for {} ({mechanism})",
                prop.title,
                prop.name,
                describe(prop, &cpus, &cpuless)
            );
            (first, line)
        })
        .collect();
    lines.sort();
    for (_, line) in lines {
        println!("{line}");
    }

    for (instance, result) in res.failures() {
        eprintln!("{} ({}): {instance}: {}", prop.title, prop.name, result.outcome);
        for attempt in &result.attempts {
            eprintln!("  {}: {}", attempt.mechanism, attempt.outcome);
        }
    }
    for (instance, result) in &res.outcomes {
        for mismatch in &result.mismatches {
            eprintln!(
                "{} ({}): {instance}: CPU {} reads back {}",
                prop.title, prop.name, mismatch.cpu, mismatch.found
            );
        }
    }
    if !res.abandoned.is_empty() {
        let names: Vec<String> = res.abandoned.iter().map(ToString::to_string).collect();
        eprintln!("{} ({}): interrupted, skipped {}", prop.title, prop.name, names.join(", "));
    }
}

fn describe(prop: &Property, cpus: &BTreeSet<u32>, cpuless: &[ScopeInstance]) -> String {
    if prop.scope == Scope::Global {
        return "all CPUs".to_string();
    }
    let mut parts = Vec::new();
    if !cpus.is_empty() {
        parts.push(format!("CPUs {}", range::emit(cpus.iter().copied())));
    }
    parts.extend(cpuless.iter().map(ToString::to_string));
    parts.join(", ")
}

fn finish(host: &dyn Host, failed: usize, what: &str, needs_root: bool) -> Result<(), AppError> {
    if failed == 0 {
        return Ok(());
    }
    if needs_root {
        eprintln!("Hint: this operation may require administrator privileges (e.g., run with sudo).");
    }
    Err(AppError::Generic(format!(
        "{failed} propert{} could not be {what} completely on {}",
        if failed == 1 { "y" } else { "ies" },
        host.name()
    )))
}

/// Whether any attempt failed for lack of privileges.
fn permission_problem(res: &Resolution) -> bool {
    res.outcomes.values().any(|result| {
        result.attempts.iter().any(|attempt| {
            matches!(
                attempt.outcome,
                MechanismOutcome::TransportError(HostError::PermissionDenied(_))
            )
        })
    })
}

pub fn list() {
    let width = PROPERTIES.iter().map(|prop| prop.name.len()).max().unwrap_or(0);
    println!("{:width$}  {:7}  {:2}  {:16}  Description", "Name", "Scope", "RW", "Mechanisms");
    for prop in PROPERTIES {
        let mechanisms: Vec<&str> = prop.mechanisms.iter().map(|m| m.name()).collect();
        println!(
            "{:width$}  {:7}  {:2}  {:16}  {}",
            prop.name,
            prop.scope.to_string(),
            if prop.writable { "rw" } else { "ro" },
            mechanisms.join(","),
            prop.title
        );
    }
}
