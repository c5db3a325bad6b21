//! Configuration check

use crate::config;
use anyhow::{Context, Result};
use std::path::Path;

/// Load, validate and print the effective configuration
pub fn run_check_config(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config(config_path)?;

    let rendered =
        toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("{}", rendered);
    println!("# configuration OK");
    Ok(())
}
