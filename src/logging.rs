//! Logging setup
//!
//! Torvisor's own events and the daemon's forwarded log lines (target `tor`)
//! go through one `tracing` subscriber.

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "torvisor=info,tor=info";

/// Install the global subscriber; `RUST_LOG` overrides the default filter
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    install(filter);
}

/// Install the global subscriber with torvisor and daemon output at `level`
pub fn init_with_level(level: Level) {
    install(EnvFilter::new(directives(level)));
}

fn directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    format!("torvisor={},tor={}", level, level)
}

fn install(filter: EnvFilter) {
    // An embedding application may already own the global subscriber
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
