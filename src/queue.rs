//! Command serialization
//!
//! The control protocol answers commands strictly in order, one round trip at
//! a time. `CommandQueue` is the only writer on a transport: a single worker
//! task takes submissions in FIFO order, writes one, waits for its reply and
//! only then moves on.
//!
//! A round trip that outlives its deadline faults the queue: its late reply
//! would be read as the answer to the next command, so nothing more is
//! written to that transport and every later submission fails with
//! [`TorError::Closed`]. The owner replaces the transport and the queue.
//!
//! Every submission also carries a monotonically increasing token. Shutdown
//! fences off every token issued so far, and a reply that completes while
//! shutdown is under way is checked against the fence and dropped.

use crate::error::{Result, TorError};
use crate::tor::protocol::ControlResponse;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Request/response half of a control connection
#[async_trait]
pub trait ControlTransport: Send + Sync {
    async fn send(&self, command: &str) -> Result<()>;
    async fn read_response(&self) -> Result<ControlResponse>;
}

/// A submitted command waiting for its turn
#[derive(Debug)]
pub struct PendingCommand {
    pub command: String,
    pub submitted_at: Instant,
    token: u64,
    sink: oneshot::Sender<Result<ControlResponse>>,
}

impl PendingCommand {
    fn resolve(self, result: Result<ControlResponse>) {
        // The caller may have stopped waiting
        let _ = self.sink.send(result);
    }
}

/// Completion handle returned by [`CommandQueue::submit`]
#[derive(Debug)]
pub struct CommandHandle {
    token: u64,
    rx: oneshot::Receiver<Result<ControlResponse>>,
}

impl CommandHandle {
    /// Submission sequence number
    pub fn token(&self) -> u64 {
        self.token
    }

    pub async fn response(self) -> Result<ControlResponse> {
        self.rx.await.unwrap_or(Err(TorError::Closed))
    }
}

#[derive(Debug, Default)]
struct Fence {
    faulted: bool,
    /// Tokens up to and including this one were retired by shutdown
    retired_through: u64,
}

#[derive(Debug, Default)]
struct Shared {
    fence: Mutex<Fence>,
    next_token: AtomicU64,
}

impl Shared {
    fn with_fence<T>(&self, f: impl FnOnce(&mut Fence) -> T) -> T {
        match self.fence.lock() {
            Ok(mut fence) => f(&mut fence),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn is_faulted(&self) -> bool {
        self.with_fence(|fence| fence.faulted)
    }

    fn fault(&self) {
        self.with_fence(|fence| fence.faulted = true);
    }

    fn retire_through(&self, token: u64) {
        self.with_fence(|fence| {
            fence.faulted = true;
            fence.retired_through = fence.retired_through.max(token);
        });
    }

    fn admits(&self, token: u64) -> bool {
        self.with_fence(|fence| token > fence.retired_through)
    }
}

/// FIFO command serializer over one [`ControlTransport`]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<PendingCommand>,
    shared: Arc<Shared>,
    timeout: Duration,
    worker: JoinHandle<()>,
}

impl CommandQueue {
    /// Spawn the worker; `timeout` is measured from submission
    pub fn new(transport: Arc<dyn ControlTransport>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let worker = tokio::spawn(run_worker(transport, rx, shared.clone(), timeout));

        Self {
            tx,
            shared,
            timeout,
            worker,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Enqueue a command and return immediately
    pub fn submit(&self, command: impl Into<String>) -> CommandHandle {
        let token = self.shared.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        let (sink, rx) = oneshot::channel();
        let pending = PendingCommand {
            command: command.into(),
            submitted_at: Instant::now(),
            token,
            sink,
        };

        if self.shared.is_faulted() {
            pending.resolve(Err(TorError::Closed));
        } else if let Err(rejected) = self.tx.send(pending) {
            rejected.0.resolve(Err(TorError::Closed));
        }

        CommandHandle { token, rx }
    }

    /// Submit and wait for the reply
    pub async fn execute(&self, command: impl Into<String>) -> Result<ControlResponse> {
        self.submit(command).response().await
    }

    /// A timed-out or broken round trip left the transport out of sync
    pub fn is_faulted(&self) -> bool {
        self.shared.is_faulted()
    }

    /// Refuse new commands and fail the queued ones with [`TorError::Closed`]
    pub fn shutdown(&self) {
        self.shared
            .retire_through(self.shared.next_token.load(Ordering::SeqCst));
        self.worker.abort();
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(
    transport: Arc<dyn ControlTransport>,
    mut rx: mpsc::UnboundedReceiver<PendingCommand>,
    shared: Arc<Shared>,
    timeout: Duration,
) {
    while let Some(pending) = rx.recv().await {
        if shared.is_faulted() {
            pending.resolve(Err(TorError::Closed));
            continue;
        }
        if pending.sink.is_closed() {
            trace!("Skipping abandoned command #{}", pending.token);
            continue;
        }

        let deadline = pending.submitted_at + timeout;
        if Instant::now() >= deadline {
            // Expired while queued; nothing was written so the transport is still in sync
            let what = format!("turn to send {:?}", pending.command);
            pending.resolve(Err(TorError::timeout(what, timeout)));
            continue;
        }

        let outcome =
            tokio::time::timeout_at(deadline, round_trip(&*transport, &pending.command)).await;

        match outcome {
            Ok(result) => {
                if let Err(e) = &result {
                    if matches!(e, TorError::Closed | TorError::Protocol(_)) {
                        debug!("Command queue faulted: {}", e);
                        shared.fault();
                    }
                }
                if shared.admits(pending.token) {
                    pending.resolve(result);
                } else {
                    debug!("Dropping stale reply for command #{}", pending.token);
                }
            },
            Err(_) => {
                warn!(
                    "No reply to {:?} within {:?}, control channel out of sync",
                    pending.command, timeout
                );
                shared.fault();
                let what = format!("reply to {:?}", pending.command);
                pending.resolve(Err(TorError::timeout(what, timeout)));
            },
        }
    }
}

async fn round_trip(transport: &dyn ControlTransport, command: &str) -> Result<ControlResponse> {
    transport.send(command).await?;
    transport.read_response().await
}
