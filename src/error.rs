//! Error taxonomy for the control plane
//!
//! Every failure the supervisor, queue or channel can report is one of these
//! variants. The type is `Clone` so a single failure can be handed to every
//! command that was waiting on a channel when it went away.

use crate::status::DaemonStatus;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the Tor control plane.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TorError {
    /// Control port unreachable (refused, reset, or connect timeout)
    #[error("control port {addr} unreachable: {reason}")]
    Connect { addr: String, reason: String },

    /// AUTHENTICATE was rejected or credentials could not be read
    #[error("control port authentication failed: {0}")]
    Auth(String),

    /// A command or startup deadline elapsed
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// `start` while the daemon is not Stopped
    #[error("daemon is already running (status: {0})")]
    AlreadyRunning(DaemonStatus),

    /// Malformed reply framing on the control connection
    #[error("control protocol error: {0}")]
    Protocol(String),

    /// Fatal bootstrap event, launcher failure, or exhausted connect retries
    #[error("daemon failed to start: {0}")]
    Startup(String),

    /// Operation on a torn-down channel or faulted command queue
    #[error("control channel closed")]
    Closed,

    /// Another supervisor in this process owns the data directory
    #[error("data directory {0:?} is already owned by another supervisor")]
    DirectoryInUse(PathBuf),

    /// Well-framed error reply to a command that had to succeed
    #[error("daemon rejected command ({code}): {message}")]
    Command { code: u16, message: String },
}

impl TorError {
    pub(crate) fn connect(addr: impl Into<String>, reason: impl ToString) -> Self {
        TorError::Connect {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn timeout(what: impl Into<String>, after: Duration) -> Self {
        TorError::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Whether a connect attempt that failed this way is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, TorError::Connect { .. } | TorError::Timeout { .. })
    }
}

/// Result alias for control-plane operations
pub type Result<T> = std::result::Result<T, TorError>;
