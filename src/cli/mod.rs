//! Command-line interface for torvisor
//!
//! Provides main commands:
//! - `run` - Launch and supervise a Tor daemon until Ctrl-C
//! - `check-config` - Validate the configuration file
//! - `circuits` - List circuits of a running daemon
//! - `new-identity` - Ask a running daemon for fresh circuits

mod check;
mod control;
mod run;

pub use check::run_check_config;
pub use control::{run_circuits, run_new_identity};
pub use run::run_daemon;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// torvisor - Tor daemon supervisor
#[derive(Parser, Debug)]
#[command(name = "torvisor")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file (default: /etc/torvisor/config.toml, then ./torvisor.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, default_value_t = false, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch Tor and supervise it until interrupted
    Run,

    /// Load and validate the configuration, then print it
    CheckConfig,

    /// List circuits of a running daemon
    Circuits(CircuitsArgs),

    /// Request new circuits from a running daemon
    NewIdentity,
}

/// Arguments for circuits command
#[derive(Parser, Debug)]
pub struct CircuitsArgs {
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
