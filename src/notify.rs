//! Status and log fan-out
//!
//! Each observer gets its own dispatch thread fed by an unbounded channel, so
//! a slow or panicking observer never delays the others or the producer. The
//! hub keeps only a weak reference to each observer.

use crate::status::DaemonStatus;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, warn};

/// Receiver of daemon status transitions and log lines
pub trait StatusObserver: Send + Sync {
    fn on_status(&self, status: DaemonStatus, message: Option<&str>);

    /// Daemon log line, formatted `[SEVERITY] message`
    fn on_log(&self, _line: &str) {}
}

/// Handle returned by [`NotificationHub::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

#[derive(Debug, Clone)]
enum Notification {
    Status(DaemonStatus, Option<String>),
    Log(String),
}

struct Registration {
    tx: Sender<Notification>,
    active: Arc<AtomicBool>,
}

/// Registry of observers
#[derive(Default)]
pub struct NotificationHub {
    observers: Mutex<BTreeMap<ObserverId, Registration>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: &Arc<dyn StatusObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let weak = Arc::downgrade(observer);
        let active = Arc::new(AtomicBool::new(true));
        let (tx, rx) = channel();

        let flag = active.clone();
        let spawned = std::thread::Builder::new()
            .name(id.to_string())
            .spawn(move || dispatch(id, weak, rx, flag));
        if let Err(e) = spawned {
            // The dead receiver gets the registration pruned on first publish
            warn!("Could not start dispatch thread for {}: {}", id, e);
        }

        self.lock().insert(id, Registration { tx, active });
        debug!("Registered {}", id);
        id
    }

    /// Deliveries already queued for this observer become no-ops
    pub fn unregister(&self, id: ObserverId) -> bool {
        match self.lock().remove(&id) {
            Some(registration) => {
                registration.active.store(false, Ordering::SeqCst);
                debug!("Unregistered {}", id);
                true
            },
            None => false,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.lock().len()
    }

    pub fn publish_status(&self, status: DaemonStatus, message: Option<String>) {
        self.publish(Notification::Status(status, message));
    }

    pub fn publish_log(&self, line: impl Into<String>) {
        self.publish(Notification::Log(line.into()));
    }

    fn publish(&self, notification: Notification) {
        self.lock().retain(|id, registration| {
            let delivered = registration.tx.send(notification.clone()).is_ok();
            if !delivered {
                debug!("Dropping {}: observer is gone", id);
            }
            delivered
        });
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ObserverId, Registration>> {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn dispatch(
    id: ObserverId,
    observer: Weak<dyn StatusObserver>,
    rx: Receiver<Notification>,
    active: Arc<AtomicBool>,
) {
    while let Ok(notification) = rx.recv() {
        if !active.load(Ordering::SeqCst) {
            break;
        }
        let Some(observer) = observer.upgrade() else {
            break;
        };

        let delivered = catch_unwind(AssertUnwindSafe(|| match &notification {
            Notification::Status(status, message) => {
                observer.on_status(*status, message.as_deref())
            },
            Notification::Log(line) => observer.on_log(line),
        }));
        if delivered.is_err() {
            warn!("{} panicked while handling a notification", id);
        }
    }
}
