use pwrcfg::range::{self, Domain};
use pwrcfg::selection::SelectionRequest;
use pwrcfg::session::{Hotplug, HostSession};
use pwrcfg::util::error::AppError;

pub fn online(session: &mut HostSession, cpus: &str) -> Result<(), AppError> {
    let present = session.topology().present_cpus();
    let cpus = range::parse_in(cpus, Domain::Values(&present))?;
    let report = session.set_online(&cpus, true)?;
    summarize(&report, "online")
}

pub fn offline(session: &mut HostSession, req: &SelectionRequest) -> Result<(), AppError> {
    let selection = session.select(req)?;
    let report = session.set_online(&selection.cpus, false)?;
    summarize(&report, "offline")
}

pub fn info(session: &HostSession) {
    let topology = session.topology();
    println!("Online CPUs: {}", range::emit(topology.online_cpus()));
    let offline = topology.offline_cpus();
    if offline.is_empty() {
        println!("Offline CPUs: none");
    } else {
        println!("Offline CPUs: {}", range::emit(offline));
    }
}

fn summarize(report: &Hotplug, state: &str) -> Result<(), AppError> {
    if !report.changed.is_empty() {
        println!("CPUs {} are now {state}", range::emit(report.changed.iter().copied()));
    }
    if !report.unchanged.is_empty() {
        println!("CPUs {} were already {state}", range::emit(report.unchanged.iter().copied()));
    }
    for (cpu, e) in &report.failed {
        eprintln!("CPU {cpu}: {e}");
    }
    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(AppError::Generic(format!(
            "{} CPU(s) could not be set {state}",
            report.failed.len()
        )))
    }
}
