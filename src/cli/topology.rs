use pwrcfg::range;
use pwrcfg::selection::SelectionRequest;
use pwrcfg::session::HostSession;
use pwrcfg::topology::{Order, Snapshot};
use pwrcfg::util::error::AppError;
use std::collections::BTreeSet;
use std::fmt::Write;

pub fn show(session: &HostSession, req: &SelectionRequest, order: Order) -> Result<(), AppError> {
    let topology = session.topology();
    let selection = session.select(req)?;
    print!("{}", render(&topology, &selection.cpus, order));

    let dies: Vec<String> = selection
        .noncomp_dies
        .iter()
        .map(|key| format!("package {} die {}", key.package, key.die))
        .collect();
    if !dies.is_empty() {
        println!("Dies without CPUs: {}", dies.join(", "));
    }
    let offline = topology.offline_cpus();
    if !offline.is_empty() {
        println!("Offline CPUs: {}", range::emit(offline));
    }
    Ok(())
}

/// One row per selected CPU in the requested order.
fn render(topology: &Snapshot, cpus: &BTreeSet<u32>, order: Order) -> String {
    let hybrid = topology.capabilities().hybrid;
    let mut out = String::new();

    let _ = write!(out, "{:>4} {:>5} {:>7} {:>4} {:>5} {:>8}", "CPU", "Core", "Module", "Die", "Node", "Package");
    if hybrid {
        let _ = write!(out, " {:>7}", "Type");
    }
    out.push('\n');

    for cpu in topology.sorted(cpus.iter().copied(), order) {
        let Some(p) = topology.placement(cpu) else {
            continue;
        };
        let node = p.node.map_or_else(|| "-".to_string(), |node| node.to_string());
        let _ = write!(
            out,
            "{cpu:>4} {:>5} {:>7} {:>4} {node:>5} {:>8}",
            p.core, p.module, p.die, p.package
        );
        if hybrid {
            let _ = write!(out, " {:>7}", p.hybrid.to_string());
        }
        out.push('\n');
    }
    out
}
