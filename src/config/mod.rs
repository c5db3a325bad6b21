//! Configuration loading and validation
//!
//! Handles TOML configuration parsing with strict validation.
//! The daemon section is immutable while a daemon runs.

pub mod file;
mod validation;

pub use file::{load_config, load_from_path};
pub use validation::validate;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
}

/// Ports and data directory handed to the daemon
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DaemonConfig {
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Passed through to the daemon, never interpreted here
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
}

impl DaemonConfig {
    pub fn new(socks_port: u16, control_port: u16, data_directory: impl Into<PathBuf>) -> Self {
        Self {
            socks_port,
            control_port,
            data_directory: data_directory.into(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::new(
            default_socks_port(),
            default_control_port(),
            default_data_directory(),
        )
    }
}

fn default_socks_port() -> u16 {
    9050
}
fn default_control_port() -> u16 {
    9051
}
fn default_data_directory() -> PathBuf {
    PathBuf::from("/var/lib/torvisor")
}

/// Control port connection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_host")]
    pub host: String,
    /// Plain-text control password (HashedControlPassword on the daemon side)
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Explicit cookie file; defaults to `<data_directory>/control_auth_cookie`
    #[serde(default)]
    pub cookie_path: Option<PathBuf>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl ControlConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: default_control_host(),
            password: None,
            cookie_path: None,
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

fn default_control_host() -> String {
    "127.0.0.1".to_string()
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_command_timeout() -> u64 {
    30
}

/// Lifecycle timing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Control port connection attempts after launch
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Base delay between attempts (jittered)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Launch to 100% bootstrap
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    /// Wait for exit after SIGNAL SHUTDOWN
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Wait for exit after forced termination
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            retry_delay_ms: default_retry_delay(),
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            kill_timeout_secs: default_kill_timeout(),
        }
    }
}

fn default_connect_attempts() -> u32 {
    20
}
fn default_retry_delay() -> u64 {
    250
}
fn default_startup_timeout() -> u64 {
    120
}
fn default_shutdown_grace() -> u64 {
    10
}
fn default_kill_timeout() -> u64 {
    5
}

/// Daemon executable used by [`crate::launcher::TorProcess`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LauncherConfig {
    #[serde(default = "default_tor_binary")]
    pub tor_binary: String,
    /// Appended after the derived arguments
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            tor_binary: default_tor_binary(),
            extra_args: Vec::new(),
        }
    }
}

fn default_tor_binary() -> String {
    "tor".to_string()
}
