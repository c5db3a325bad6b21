//! torvisor library crate
//!
//! Lifecycle supervision and control-port plumbing for a Tor daemon.
//!
//! # Modules
//!
//! - [`cli`] - Command-line interface (run, check-config, circuits, new-identity)
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Control-plane error taxonomy
//! - [`launcher`] - Daemon entry point (process or embedded)
//! - [`notify`] - Status and log fan-out to observers
//! - [`queue`] - Command serialization over one control connection
//! - [`status`] - Lifecycle state machine
//! - [`supervisor`] - Start/stop/restart and control queries
//! - [`tor`] - Control port transport, framing and event parsing
//! - [`util`] - Time, randomization, helpers

#![allow(clippy::missing_const_for_fn)] // Const fn optimization is low priority
#![allow(clippy::doc_markdown)] // Doc formatting is secondary
#![allow(clippy::uninlined_format_args)] // Format string style preference
#![allow(clippy::cast_possible_truncation)] // Millisecond values fit
#![allow(clippy::option_if_let_else)] // Style preference
#![allow(clippy::significant_drop_tightening)] // Lock scope is intentional
#![allow(clippy::single_match_else)] // Match for clarity
#![allow(clippy::new_without_default)] // Explicit new() is fine
#![allow(clippy::map_unwrap_or)] // map().unwrap_or is clearer
#![allow(clippy::module_name_repetitions)] // TorError, TorEvent read better

pub mod cli;
pub mod config;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod notify;
pub mod queue;
pub mod status;
pub mod supervisor;
pub mod tor;
pub mod util;

pub use config::{Config, DaemonConfig};
pub use error::{Result, TorError};
pub use launcher::{DaemonHandle, DaemonLauncher, LaunchArgs, TorProcess};
pub use notify::{NotificationHub, ObserverId, StatusObserver};
pub use queue::{CommandHandle, CommandQueue, ControlTransport};
pub use status::{DaemonStatus, StatusMachine, StatusSnapshot};
pub use supervisor::{SupervisorSettings, TorSupervisor};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
