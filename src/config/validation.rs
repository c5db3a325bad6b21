//! Configuration validation
//!
//! Fail-fast validation of configuration invariants.

use super::Config;
use anyhow::{bail, Result};
use std::net::IpAddr;

/// Validate configuration invariants
pub fn validate(config: &Config) -> Result<()> {
    validate_daemon(config)?;
    validate_control(config)?;
    validate_timing(config)?;
    validate_launcher(config)?;
    Ok(())
}

fn validate_daemon(config: &Config) -> Result<()> {
    let daemon = &config.daemon;
    if daemon.socks_port == 0 {
        bail!("daemon.socks_port cannot be 0");
    }
    if daemon.control_port == 0 {
        bail!("daemon.control_port cannot be 0");
    }
    if daemon.socks_port == daemon.control_port {
        bail!(
            "daemon.socks_port and daemon.control_port must differ (both {})",
            daemon.socks_port
        );
    }
    if daemon.data_directory.as_os_str().is_empty() {
        bail!("daemon.data_directory cannot be empty");
    }
    Ok(())
}

fn validate_control(config: &Config) -> Result<()> {
    let control = &config.control;

    // The control protocol is unencrypted; keep it on loopback
    let loopback = control.host == "localhost"
        || control
            .host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false);
    if !loopback {
        bail!("control.host must be a loopback address, got {}", control.host);
    }

    if control.password.is_some() && control.cookie_path.is_some() {
        bail!("control.password and control.cookie_path are mutually exclusive");
    }
    if control.connect_timeout_secs == 0 {
        bail!("control.connect_timeout_secs cannot be 0");
    }
    if control.command_timeout_secs == 0 {
        bail!("control.command_timeout_secs cannot be 0");
    }
    Ok(())
}

fn validate_timing(config: &Config) -> Result<()> {
    let supervisor = &config.supervisor;
    if supervisor.connect_attempts == 0 {
        bail!("supervisor.connect_attempts must be at least 1");
    }
    if supervisor.startup_timeout_secs == 0 {
        bail!("supervisor.startup_timeout_secs cannot be 0");
    }
    if supervisor.shutdown_grace_secs == 0 {
        bail!("supervisor.shutdown_grace_secs cannot be 0");
    }
    if supervisor.kill_timeout_secs == 0 {
        bail!("supervisor.kill_timeout_secs cannot be 0");
    }
    Ok(())
}

fn validate_launcher(config: &Config) -> Result<()> {
    if config.launcher.tor_binary.trim().is_empty() {
        bail!("launcher.tor_binary cannot be empty");
    }
    Ok(())
}
