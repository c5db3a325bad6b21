//! torvisor - supervisor for a Tor daemon
//!
//! Launches Tor, follows its bootstrap over the control port, and shuts it
//! down cleanly.
//!
//! # Usage
//!
//! ```bash
//! # Validate configuration
//! torvisor -c /etc/torvisor/config.toml check-config
//!
//! # Run daemon
//! torvisor run
//!
//! # Inspect a running daemon
//! torvisor circuits --format json
//! torvisor new-identity
//! ```

use anyhow::Result;
use clap::Parser;
use torvisor::cli::{self, Cli, Commands};
use torvisor::logging;
use tracing::Level;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG applies unless --verbose
    if cli.verbose {
        logging::init_with_level(Level::DEBUG);
    } else {
        logging::init();
    }

    let config_path = cli.config.as_deref();

    match &cli.command {
        Commands::Run => {
            cli::run_daemon(config_path).await?;
        },
        Commands::CheckConfig => {
            cli::run_check_config(config_path)?;
        },
        Commands::Circuits(args) => {
            cli::run_circuits(config_path, args).await?;
        },
        Commands::NewIdentity => {
            cli::run_new_identity(config_path).await?;
        },
    }

    Ok(())
}
