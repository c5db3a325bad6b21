//! Supervised daemon run

use crate::config;
use crate::notify::StatusObserver;
use crate::status::DaemonStatus;
use crate::supervisor::TorSupervisor;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Logs every status transition
struct LogObserver;

impl StatusObserver for LogObserver {
    fn on_status(&self, status: DaemonStatus, message: Option<&str>) {
        match (status, message) {
            (DaemonStatus::Error, Some(msg)) => error!("Tor status: {} ({})", status, msg),
            (_, Some(msg)) => info!("Tor status: {} ({})", status, msg),
            (_, None) => info!("Tor status: {}", status),
        }
    }
}

/// Run the torvisor daemon until Ctrl-C
pub async fn run_daemon(config_path: Option<&Path>) -> Result<()> {
    info!("torvisor v{} starting", crate::VERSION);

    let config = config::load_config(config_path)?;
    let supervisor = TorSupervisor::with_tor_process(&config);

    let observer: Arc<dyn StatusObserver> = Arc::new(LogObserver);
    let observer_id = supervisor.register_observer(&observer);

    let startup = supervisor.start(config.daemon.clone());
    let outcome = tokio::select! {
        result = startup => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    match outcome {
        Some(Ok(())) => {
            info!("SOCKS proxy: {}", supervisor.socks_proxy_url());
            println!("{}", supervisor.socks_proxy_url());

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Interrupted, shutting down");
        },
        Some(Err(e)) => {
            supervisor.stop().await;
            supervisor.unregister_observer(observer_id);
            return Err(e).context("Tor failed to start");
        },
        None => warn!("Interrupted during startup"),
    }

    supervisor.stop().await;
    supervisor.unregister_observer(observer_id);
    Ok(())
}
