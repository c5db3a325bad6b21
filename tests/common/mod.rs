//! In-process stand-ins for a Tor daemon
//!
//! `MockTor` speaks enough of the control protocol for the supervisor and the
//! control channel; `FakeLauncher` brings one up per launch.

#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use torvisor::{
    DaemonHandle, DaemonLauncher, DaemonStatus, LaunchArgs, StatusObserver, SupervisorSettings,
    TorError,
};

pub const EXIT_FINGERPRINT: &str = "EEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEE";
pub const EXIT_ADDRESS: &str = "198.51.100.7";

pub const DEFAULT_CIRCUITS: &str = "1 LAUNCHED PURPOSE=GENERAL\n\
     2 BUILT $AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA~guard,$BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB~middle,$EEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEE~exit BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL";

/// Reserve `n` distinct loopback ports
pub fn free_ports(n: usize) -> Vec<u16> {
    let listeners: Vec<std::net::TcpListener> = (0..n)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect()
}

/// Poll `cond` until it holds, failing the test after five seconds
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

/// Short timings so lifecycle tests finish quickly
pub fn test_settings() -> SupervisorSettings {
    SupervisorSettings {
        connect_timeout: Duration::from_secs(1),
        command_timeout: Duration::from_secs(2),
        connect_attempts: 100,
        retry_delay: Duration::from_millis(40),
        startup_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(500),
        kill_timeout: Duration::from_millis(500),
        ..SupervisorSettings::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Expected AUTHENTICATE secret (hex of these bytes); `None` accepts anything
    pub password: Option<Vec<u8>>,
    /// Answer to `GETINFO status/bootstrap-phase`
    pub bootstrap: u8,
    /// Connections accepted and dropped unanswered before serving starts
    pub refuse_first: usize,
}

enum Action {
    Continue,
    Authenticated,
    Hangup,
    Exit,
}

struct Shared {
    options: MockOptions,
    commands: Mutex<Vec<String>>,
    circuits: Mutex<String>,
    events: broadcast::Sender<Vec<u8>>,
    refused: AtomicUsize,
    subscriptions: watch::Sender<usize>,
    exited: Arc<watch::Sender<bool>>,
}

/// Mock control port on 127.0.0.1
pub struct MockTor {
    port: u16,
    shared: Arc<Shared>,
}

impl MockTor {
    /// Any free port, no password
    pub async fn start() -> Arc<Self> {
        Self::start_with(MockOptions::default()).await
    }

    pub async fn start_with(options: MockOptions) -> Arc<Self> {
        Self::bind(0, options, Arc::new(watch::channel(false).0))
            .await
            .unwrap()
    }

    /// Listen on `port`; setting `exited` stops the listener and drops clients
    pub async fn bind(
        port: u16,
        options: MockOptions,
        exited: Arc<watch::Sender<bool>>,
    ) -> std::io::Result<Arc<Self>> {
        // A previous instance on the same port may still be letting go of it
        let deadline = Instant::now() + Duration::from_secs(2);
        let listener = loop {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => break listener,
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                },
                Err(e) => return Err(e),
            }
        };
        let port = listener.local_addr()?.port();

        let shared = Arc::new(Shared {
            options,
            commands: Mutex::new(Vec::new()),
            circuits: Mutex::new(DEFAULT_CIRCUITS.to_string()),
            events: broadcast::channel(64).0,
            refused: AtomicUsize::new(0),
            subscriptions: watch::channel(0).0,
            exited,
        });
        tokio::spawn(accept_loop(listener, shared.clone()));

        Ok(Arc::new(Self { port, shared }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Every command line received, in arrival order
    pub fn commands(&self) -> Vec<String> {
        self.shared.commands.lock().unwrap().clone()
    }

    /// Push `650 <line>` to authenticated clients
    pub fn emit(&self, line: &str) {
        self.emit_bytes(format!("650 {}\r\n", line).as_bytes());
    }

    /// Push raw bytes to authenticated clients
    pub fn emit_bytes(&self, bytes: &[u8]) {
        let _ = self.shared.events.send(bytes.to_vec());
    }

    /// Connections dropped because of `refuse_first`
    pub fn refused(&self) -> usize {
        self.shared.refused.load(Ordering::SeqCst)
    }

    pub fn set_circuits(&self, circuits: &str) {
        *self.shared.circuits.lock().unwrap() = circuits.to_string();
    }

    /// Wait until SETEVENTS has been received `n` times
    pub async fn wait_subscriptions(&self, n: usize) {
        let mut rx = self.shared.subscriptions.subscribe();
        within("SETEVENTS", rx.wait_for(|count| *count >= n))
            .await
            .unwrap();
    }

    pub fn has_exited(&self) -> bool {
        *self.shared.exited.borrow()
    }

    /// Simulate a crash: listener and connections go away
    pub fn crash(&self) {
        self.shared.exited.send_replace(true);
    }
}

/// Resolves once the daemon has exited; holds no borrow of the watch
async fn exit_signal(mut exited: watch::Receiver<bool>) {
    let _ = exited.wait_for(|exited| *exited).await;
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let exited = exit_signal(shared.exited.subscribe());
    tokio::pin!(exited);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    if shared.refused.load(Ordering::SeqCst) < shared.options.refuse_first {
                        shared.refused.fetch_add(1, Ordering::SeqCst);
                        drop(stream);
                        continue;
                    }
                    tokio::spawn(serve(stream, shared.clone()));
                },
                Err(_) => return,
            },
            _ = &mut exited => return,
        }
    }
}

async fn serve(stream: TcpStream, shared: Arc<Shared>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut events = shared.events.subscribe();
    let exited = exit_signal(shared.exited.subscribe());
    tokio::pin!(exited);
    let mut authenticated = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    return;
                };
                shared.commands.lock().unwrap().push(line.clone());

                let (reply, action) = shared.reply(&line, authenticated);
                if write.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
                match action {
                    Action::Continue => {},
                    Action::Authenticated => authenticated = true,
                    Action::Hangup => return,
                    Action::Exit => {
                        shared.exited.send_replace(true);
                        return;
                    },
                }
            },
            event = events.recv() => {
                if let Ok(event) = event {
                    if authenticated && write.write_all(&event).await.is_err() {
                        return;
                    }
                }
            },
            _ = &mut exited => return,
        }
    }
}

impl Shared {
    fn reply(&self, line: &str, authenticated: bool) -> (String, Action) {
        let (verb, arg) = line.split_once(' ').unwrap_or((line, ""));

        if verb == "AUTHENTICATE" {
            let accepted = match &self.options.password {
                Some(secret) => arg == data_encoding::HEXLOWER.encode(secret),
                None => true,
            };
            return if accepted {
                ok(Action::Authenticated)
            } else {
                (
                    "515 Authentication failed: Password did not match HashedControlPassword value from configuration\r\n".to_string(),
                    Action::Hangup,
                )
            };
        }

        if !authenticated {
            return ("514 Authentication required.\r\n".to_string(), Action::Hangup);
        }

        match (verb, arg) {
            ("SETEVENTS", _) => {
                self.subscriptions.send_modify(|count| *count += 1);
                ok(Action::Continue)
            },
            ("GETINFO", "version") => (
                "250-version=0.4.8.9\r\n250 OK\r\n".to_string(),
                Action::Continue,
            ),
            ("GETINFO", "status/bootstrap-phase") => {
                let progress = self.options.bootstrap;
                let (tag, summary) = if progress >= 100 {
                    ("done", "Done")
                } else {
                    ("starting", "Starting")
                };
                (
                    format!(
                        "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS={} TAG={} SUMMARY=\"{}\"\r\n250 OK\r\n",
                        progress, tag, summary
                    ),
                    Action::Continue,
                )
            },
            // Swallowed: the client never gets an answer
            ("GETINFO", "status/stall") => (String::new(), Action::Continue),
            ("GETINFO", "status/circuit-established") => (
                "250-status/circuit-established=1\r\n250 OK\r\n".to_string(),
                Action::Continue,
            ),
            ("GETINFO", "circuit-status") => {
                let mut reply = String::from("250+circuit-status=\r\n");
                for circuit in self.circuits.lock().unwrap().lines() {
                    reply.push_str(circuit);
                    reply.push_str("\r\n");
                }
                reply.push_str(".\r\n250 OK\r\n");
                (reply, Action::Continue)
            },
            ("GETINFO", key) if key.starts_with("ns/id/") => {
                let body = if key.ends_with(EXIT_FINGERPRINT) {
                    format!(
                        "r exit qUnSwFJK2xrWIhYf9SiX/+WmZhg 4S6iBz2TCW0kcwnDj3TIhX2Qj0U 2024-01-01 00:00:00 {} 9001 0\r\ns Exit Fast Running Valid\r\n",
                        EXIT_ADDRESS
                    )
                } else {
                    // What a client-only build answers for relays it knows nothing about
                    String::new()
                };
                (
                    format!("250+{}=\r\n{}.\r\n250 OK\r\n", key, body),
                    Action::Continue,
                )
            },
            ("SIGNAL", "NEWNYM") => ok(Action::Continue),
            ("SIGNAL", "SHUTDOWN") => ok(Action::Exit),
            _ => (
                format!("510 Unrecognized command \"{}\"\r\n", verb),
                Action::Continue,
            ),
        }
    }
}

fn ok(action: Action) -> (String, Action) {
    ("250 OK\r\n".to_string(), action)
}

/// How a [`FakeLauncher`] behaves on each launch
#[derive(Debug, Clone, Default)]
pub struct LaunchPlan {
    pub listen_delay: Duration,
    pub bootstrap: u8,
    pub refuse_first: usize,
    pub never_listen: bool,
    pub fail: bool,
    /// `launch` never returns
    pub hang: bool,
}

/// Launcher that brings up a [`MockTor`] on the configured control port
#[derive(Default)]
pub struct FakeLauncher {
    plan: LaunchPlan,
    journal: Arc<Mutex<Vec<String>>>,
    daemons: Arc<Mutex<Vec<Arc<MockTor>>>>,
}

impl FakeLauncher {
    pub fn new(plan: LaunchPlan) -> Self {
        Self {
            plan,
            ..Self::default()
        }
    }

    /// Daemon that reports full bootstrap as soon as it is asked
    pub fn bootstrapped() -> Self {
        Self::new(LaunchPlan {
            bootstrap: 100,
            ..LaunchPlan::default()
        })
    }

    /// launch / terminate / exit, in order
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    /// The mock brought up by the `index`-th launch
    pub async fn daemon(&self, index: usize) -> Arc<MockTor> {
        eventually("mock daemon to listen", || {
            self.daemons.lock().unwrap().len() > index
        })
        .await;
        self.daemons.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl DaemonLauncher for FakeLauncher {
    async fn launch(&self, args: &LaunchArgs) -> Result<Box<dyn DaemonHandle>, TorError> {
        self.journal.lock().unwrap().push("launch".to_string());
        let plan = &self.plan;
        if plan.hang {
            std::future::pending::<()>().await;
        }
        if plan.fail {
            return Err(TorError::Startup("fake launch failure".to_string()));
        }

        let exited = Arc::new(watch::channel(false).0);
        let handle = FakeHandle {
            exited: exited.clone(),
            journal: self.journal.clone(),
            reported: false,
        };

        if !plan.never_listen {
            let port = args.config.control_port;
            let options = MockOptions {
                password: None,
                bootstrap: plan.bootstrap,
                refuse_first: plan.refuse_first,
            };
            let delay = plan.listen_delay;
            let daemons = self.daemons.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if *exited.borrow() {
                    return;
                }
                let mock = MockTor::bind(port, options, exited)
                    .await
                    .expect("mock control port");
                daemons.lock().unwrap().push(mock);
            });
        }

        Ok(Box::new(handle))
    }
}

struct FakeHandle {
    exited: Arc<watch::Sender<bool>>,
    journal: Arc<Mutex<Vec<String>>>,
    reported: bool,
}

#[async_trait]
impl DaemonHandle for FakeHandle {
    async fn wait(&mut self) -> Result<(), TorError> {
        let mut rx = self.exited.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
        if !self.reported {
            self.reported = true;
            self.journal.lock().unwrap().push("exit".to_string());
        }
        Ok(())
    }

    async fn terminate(&mut self) -> Result<(), TorError> {
        self.journal.lock().unwrap().push("terminate".to_string());
        self.exited.send_replace(true);
        Ok(())
    }
}

/// Observer that remembers everything it is told
#[derive(Default)]
pub struct Recorder {
    statuses: Mutex<Vec<(DaemonStatus, Option<String>)>>,
    logs: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn statuses(&self) -> Vec<DaemonStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|(status, _)| *status)
            .collect()
    }

    pub fn messages(&self) -> Vec<Option<String>> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().unwrap().clone()
    }

    pub async fn wait_statuses(&self, n: usize) {
        eventually("observer notifications", || {
            self.statuses.lock().unwrap().len() >= n
        })
        .await;
    }
}

impl StatusObserver for Recorder {
    fn on_status(&self, status: DaemonStatus, message: Option<&str>) {
        self.statuses
            .lock()
            .unwrap()
            .push((status, message.map(str::to_string)));
    }

    fn on_log(&self, line: &str) {
        self.logs.lock().unwrap().push(line.to_string());
    }
}
