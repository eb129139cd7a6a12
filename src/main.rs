mod cli;

use clap::Parser;
use log::{debug, warn};
use pwrcfg::config;
use pwrcfg::engine::CancelToken;
use std::error::Error;

fn main() {
    let cli = cli::Cli::parse();

    let config = match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // RUST_LOG takes precedence over both the flag and the config file
    let level = if cli.debug {
        log::LevelFilter::Debug
    } else {
        config.logging.level.to_filter()
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
    debug!("Effective configuration: {config:?}");

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("Interrupted, finishing the operations already started");
        handler_token.cancel();
    }) {
        warn!("Could not install the Ctrl-C handler: {e}");
    }

    if let Err(e) = cli::run(cli, &config, cancel) {
        eprintln!("Error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("Caused by: {cause}");
            source = cause.source();
        }
        if e.is_permission_denied() {
            eprintln!(
                "Hint: This operation may require administrator privileges (e.g., run with sudo)."
            );
        }
        std::process::exit(1);
    }
}
