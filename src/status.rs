//! Daemon lifecycle state
//!
//! Stopped → Starting → Connecting → Connected, with Error reachable from any
//! active state and left only through an explicit stop. Every transition is
//! applied under one lock and published to the [`NotificationHub`] before the
//! lock is released, so observers see transitions in the order they happened.
//!
//! Each start begins a new run. Events and failures are tagged with the run
//! they belong to and ignored once that run is over.

use crate::error::{Result, TorError};
use crate::notify::NotificationHub;
use crate::tor::events::TorEvent;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{error, info};

/// Lifecycle state of one daemon instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonStatus {
    Stopped,
    Starting,
    Connecting,
    Connected,
    Error,
}

impl DaemonStatus {
    /// Starting, Connecting or Connected
    pub fn is_running(self) -> bool {
        matches!(
            self,
            DaemonStatus::Starting | DaemonStatus::Connecting | DaemonStatus::Connected
        )
    }
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DaemonStatus::Stopped => "stopped",
            DaemonStatus::Starting => "starting",
            DaemonStatus::Connecting => "connecting",
            DaemonStatus::Connected => "connected",
            DaemonStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: DaemonStatus,
    pub run: u64,
    /// Highest bootstrap percentage seen in this run
    pub progress: u8,
    /// Reason attached to the last transition, if any
    pub message: Option<String>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            status: DaemonStatus::Stopped,
            run: 0,
            progress: 0,
            message: None,
        }
    }
}

/// Transition table plus notification
pub struct StatusMachine {
    state: Mutex<StatusSnapshot>,
    watch: watch::Sender<StatusSnapshot>,
    hub: Arc<NotificationHub>,
}

impl StatusMachine {
    pub fn new(hub: Arc<NotificationHub>) -> Self {
        let (watch, _) = watch::channel(StatusSnapshot::default());
        Self {
            state: Mutex::new(StatusSnapshot::default()),
            watch,
            hub,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().clone()
    }

    pub fn status(&self) -> DaemonStatus {
        self.lock().status
    }

    pub fn current_run(&self) -> u64 {
        self.lock().run
    }

    /// Every change, including progress and run changes without a transition
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.watch.subscribe()
    }

    /// Stopped → Starting under a fresh run id
    pub fn begin_start(&self) -> Result<u64> {
        let mut state = self.lock();
        if state.status != DaemonStatus::Stopped {
            return Err(TorError::AlreadyRunning(state.status));
        }
        state.run += 1;
        state.progress = 0;
        let run = state.run;
        self.transition(&mut state, DaemonStatus::Starting, None);
        Ok(run)
    }

    /// Feed a parsed event from `run`; returns true if the status changed
    pub fn apply_event(&self, run: u64, event: &TorEvent) -> bool {
        let mut state = self.lock();
        if state.run != run || !state.status.is_running() {
            return false;
        }

        if let Some(reason) = event.fatal_reason() {
            error!("Tor reported a fatal condition: {}", reason);
            self.transition(&mut state, DaemonStatus::Error, Some(reason));
            return true;
        }

        let TorEvent::Bootstrap(phase) = event else {
            return false;
        };

        if phase.progress > state.progress {
            state.progress = phase.progress;
            self.watch.send_replace(state.clone());
        }

        let mut changed = false;
        if state.status == DaemonStatus::Starting {
            self.transition(
                &mut state,
                DaemonStatus::Connecting,
                Some(phase.summary.clone()).filter(|s| !s.is_empty()),
            );
            changed = true;
        }
        if phase.is_complete() && state.status == DaemonStatus::Connecting {
            self.transition(&mut state, DaemonStatus::Connected, None);
            changed = true;
        }
        changed
    }

    /// Move an active run to Error; ignored for stale runs
    pub fn fail(&self, run: u64, message: &str) -> bool {
        let mut state = self.lock();
        if state.run != run || !state.status.is_running() {
            return false;
        }
        self.transition(&mut state, DaemonStatus::Error, Some(message.to_string()));
        true
    }

    /// Retire the current run without changing status
    pub fn cancel_run(&self) {
        let mut state = self.lock();
        state.run += 1;
        self.watch.send_replace(state.clone());
    }

    /// Unconditionally Stopped
    pub fn force_stop(&self) {
        let mut state = self.lock();
        state.run += 1;
        if state.status == DaemonStatus::Stopped {
            self.watch.send_replace(state.clone());
        } else {
            self.transition(&mut state, DaemonStatus::Stopped, None);
        }
    }

    fn transition(&self, state: &mut StatusSnapshot, next: DaemonStatus, message: Option<String>) {
        info!(run = state.run, "Daemon status: {} -> {}", state.status, next);
        state.status = next;
        state.message = message.clone();
        self.watch.send_replace(state.clone());
        self.hub.publish_status(next, message);
    }

    fn lock(&self) -> MutexGuard<'_, StatusSnapshot> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
