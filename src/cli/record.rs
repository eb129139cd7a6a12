use log::info;
use pwrcfg::host::{HostSpec, open_host};
use pwrcfg::session;
use pwrcfg::util::error::{AppError, HostError};
use std::fs;
use std::path::Path;

pub fn run(spec: &HostSpec, output: &Path) -> Result<(), AppError> {
    let dataset = session::record(open_host(spec)?)?;

    let contents = toml::to_string_pretty(&dataset)
        .map_err(|e| AppError::Generic(format!("failed to serialize dataset: {e}")))?;
    fs::write(output, contents).map_err(HostError::from)?;

    info!(
        "Recorded {} file(s) and {} register(s)",
        dataset.files.len() + dataset.binary.len(),
        dataset.registers.len()
    );
    println!("Dataset written to {}", output.display());
    Ok(())
}
