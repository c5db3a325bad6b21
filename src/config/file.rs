//! Configuration file loading

use super::Config;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Default config file locations
const CONFIG_PATHS: &[&str] = &["/etc/torvisor/config.toml", "./torvisor.toml"];

/// Load configuration from an explicit path, or the first default location
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => find_config_file()?,
    };

    load_from_path(&config_path)
}

/// Find first existing config file
fn find_config_file() -> Result<PathBuf> {
    for path in CONFIG_PATHS {
        if Path::new(path).exists() {
            return Ok(PathBuf::from(path));
        }
    }
    anyhow::bail!("No configuration file found. Tried: {:?}", CONFIG_PATHS)
}

/// Load and parse config from path
pub fn load_from_path(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    super::validate(&config)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    Ok(config)
}
