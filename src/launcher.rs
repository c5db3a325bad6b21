//! Daemon entry point
//!
//! The supervisor never starts Tor itself; it asks a [`DaemonLauncher`] and
//! gets back a [`DaemonHandle`] it can wait on or terminate. [`TorProcess`]
//! runs the `tor` executable; an embedding that links the daemon in-process
//! provides its own launcher.

use crate::config::{DaemonConfig, LauncherConfig};
use crate::error::{Result, TorError};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Program and arguments derived from a [`DaemonConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    pub program: String,
    pub args: Vec<String>,
    pub config: DaemonConfig,
}

impl LaunchArgs {
    pub fn from_config(config: &DaemonConfig, launcher: &LauncherConfig) -> Self {
        let mut args = vec![
            "--SocksPort".to_string(),
            config.socks_port.to_string(),
            "--ControlPort".to_string(),
            config.control_port.to_string(),
            "--DataDirectory".to_string(),
            config.data_directory.display().to_string(),
            "--CookieAuthentication".to_string(),
            "1".to_string(),
            // Relay-side lookups only return placeholders in a client
            "--ClientOnly".to_string(),
            "1".to_string(),
        ];
        args.extend(launcher.extra_args.iter().cloned());

        Self {
            program: launcher.tor_binary.clone(),
            args,
            config: config.clone(),
        }
    }
}

/// Starts a daemon instance
#[async_trait]
pub trait DaemonLauncher: Send + Sync {
    /// Returns once the daemon is running, or fails with [`TorError::Startup`]
    async fn launch(&self, args: &LaunchArgs) -> Result<Box<dyn DaemonHandle>>;
}

/// A running daemon instance
#[async_trait]
pub trait DaemonHandle: Send {
    /// Resolves when the daemon has exited
    async fn wait(&mut self) -> Result<()>;

    /// Forced stop; follow with [`DaemonHandle::wait`]
    async fn terminate(&mut self) -> Result<()>;
}

/// Runs the `tor` executable as a child process
#[derive(Debug, Clone)]
pub struct TorProcess {
    /// An exit within this window counts as a failed launch
    settle: Duration,
}

impl TorProcess {
    pub fn new() -> Self {
        Self {
            settle: Duration::from_millis(250),
        }
    }
}

impl Default for TorProcess {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DaemonLauncher for TorProcess {
    async fn launch(&self, args: &LaunchArgs) -> Result<Box<dyn DaemonHandle>> {
        info!(
            "Launching {} (data directory {})",
            args.program,
            args.config.data_directory.display()
        );
        debug!("Daemon arguments: {:?}", args.args);

        let mut child = Command::new(&args.program)
            .args(&args.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TorError::Startup(format!("cannot execute {}: {}", args.program, e)))?;

        // Bad arguments or a locked data directory make tor exit right away
        match tokio::time::timeout(self.settle, child.wait()).await {
            Ok(Ok(status)) => Err(TorError::Startup(format!(
                "{} exited immediately ({})",
                args.program, status
            ))),
            Ok(Err(e)) => Err(TorError::Startup(format!(
                "lost track of {}: {}",
                args.program, e
            ))),
            Err(_) => {
                debug!("Daemon running with pid {:?}", child.id());
                Ok(Box::new(ProcessHandle { child }))
            },
        }
    }
}

struct ProcessHandle {
    child: Child,
}

#[async_trait]
impl DaemonHandle for ProcessHandle {
    async fn wait(&mut self) -> Result<()> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| TorError::Startup(format!("lost track of daemon process: {}", e)))?;
        debug!("Daemon exited with {}", status);
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        self.child
            .start_kill()
            .map_err(|e| TorError::Startup(format!("cannot kill daemon process: {}", e)))
    }
}
