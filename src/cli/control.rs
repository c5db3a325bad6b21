//! One-shot commands against a running daemon

use super::{CircuitsArgs, OutputFormat};
use crate::config::{self, Config};
use crate::queue::CommandQueue;
use crate::tor::circuit::parse_circuit_status;
use crate::tor::control::{ControlAuth, ControlChannel};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Print the circuits of a running daemon
pub async fn run_circuits(config_path: Option<&Path>, args: &CircuitsArgs) -> Result<()> {
    let config = config::load_config(config_path)?;
    let (channel, queue) = connect(&config).await?;

    let resp = queue
        .execute("GETINFO circuit-status")
        .await
        .and_then(|resp| resp.into_result())
        .context("GETINFO circuit-status failed")?;
    let circuits = parse_circuit_status(resp.value("circuit-status").unwrap_or_default())?;
    channel.close().await;

    match args.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&circuits)?);
        },
        OutputFormat::Text => {
            if circuits.is_empty() {
                println!("No circuits");
            }
            for circ in &circuits {
                let path: Vec<String> = circ.path.iter().map(ToString::to_string).collect();
                println!(
                    "{:>5} {:<10} {:<12} {}",
                    circ.id,
                    circ.status,
                    circ.purpose.as_deref().unwrap_or("-"),
                    path.join(",")
                );
            }
        },
    }
    Ok(())
}

/// Send SIGNAL NEWNYM to a running daemon
pub async fn run_new_identity(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config(config_path)?;
    let (channel, queue) = connect(&config).await?;

    queue
        .execute("SIGNAL NEWNYM")
        .await
        .and_then(|resp| resp.into_result())
        .context("SIGNAL NEWNYM failed")?;
    channel.close().await;

    info!("New identity requested");
    println!("New identity requested");
    Ok(())
}

async fn connect(config: &Config) -> Result<(Arc<ControlChannel>, CommandQueue)> {
    let mut auth = ControlAuth::resolve(
        config.control.password.as_deref(),
        config.control.cookie_path.as_deref(),
        &config.daemon.data_directory,
    );
    // A system tor keeps its cookie elsewhere
    if let ControlAuth::Discover(paths) = &mut auth {
        if let ControlAuth::Discover(system) = ControlAuth::system() {
            paths.extend(system);
        }
    }

    debug!(
        "Connecting to {}:{}",
        config.control.host, config.daemon.control_port
    );
    let channel = ControlChannel::connect(
        &config.control.host,
        config.daemon.control_port,
        config.control.connect_timeout(),
        &auth,
    )
    .await
    .context("Failed to connect to Tor control port")?;

    let channel = Arc::new(channel);
    let queue = CommandQueue::new(channel.clone(), config.control.command_timeout());
    Ok((channel, queue))
}
