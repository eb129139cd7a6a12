// Configuration loading functionality
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::types::{AppConfig, AppConfigToml, ConfigError};

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "PWRCFG_CONFIG";

// The paths searched for a configuration file, most specific first.
pub fn config_paths() -> Vec<PathBuf> {
    let mut config_paths: Vec<PathBuf> = Vec::new();

    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        config_paths.push(PathBuf::from(path));
    }

    // User-specific path
    if let Some(config_dir) = dirs::config_dir() {
        config_paths.push(config_dir.join("pwrcfg/config.toml"));
    } else {
        log::debug!("Could not determine the user configuration directory, skipping it");
    }

    // System-wide path
    config_paths.push(PathBuf::from("/etc/pwrcfg/config.toml"));
    config_paths
}

// Load the first configuration file that exists.
// A missing file is not an error, a malformed one is.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    for path in config_paths() {
        if path.exists() {
            return load_config_from_path(&path);
        }
    }

    log::debug!("No configuration file found, using defaults");
    AppConfig::try_from(AppConfigToml::default())
}

pub fn load_config_from_path(path: &Path) -> Result<AppConfig, ConfigError> {
    log::debug!("Loading configuration from {}", path.display());
    let contents = fs::read_to_string(path)?;
    parse_config(&contents).map_err(|e| match e {
        ConfigError::ValidationError(msg) => {
            ConfigError::ValidationError(format!("{}: {msg}", path.display()))
        }
        other => other,
    })
}

pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let toml_config = toml::from_str::<AppConfigToml>(contents)?;
    AppConfig::try_from(toml_config)
}
