//! Daemon lifecycle supervision
//!
//! `TorSupervisor` owns one daemon instance: it launches it through a
//! [`DaemonLauncher`], connects the control channel, drives the
//! [`StatusMachine`] from bootstrap events and tears everything down on stop.
//!
//! Lifecycle calls (start/stop/restart) are serialized by one async lock; the
//! slow part of start (launching, connecting and bootstrapping) runs outside
//! it so stop can interrupt. Stop retires the current run first, so anything
//! the old run still produces is ignored.
//!
//! A command that times out leaves the control connection out of sync. The
//! next command then replaces the connection before it is sent.

use crate::config::{Config, DaemonConfig, LauncherConfig};
use crate::error::{Result, TorError};
use crate::launcher::{DaemonHandle, DaemonLauncher, LaunchArgs, TorProcess};
use crate::notify::{NotificationHub, ObserverId, StatusObserver};
use crate::queue::CommandQueue;
use crate::status::{DaemonStatus, StatusMachine, StatusSnapshot};
use crate::tor::circuit::{
    parse_circuit_status, parse_router_address, select_exit_circuit, CircuitRecord,
};
use crate::tor::control::{ControlAuth, ControlChannel};
use crate::tor::events::{BootstrapPhase, Severity, TorEvent};
use crate::tor::protocol::ControlResponse;
use crate::util::{rand::jitter, time::format_duration};
use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Asynchronous events the supervisor needs
pub const EVENT_SUBSCRIPTION: &str = "SETEVENTS STATUS_CLIENT STATUS_GENERAL NOTICE WARN ERR CIRC";

/// Runtime knobs derived from [`Config`]
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub control_host: String,
    pub password: Option<String>,
    pub cookie_path: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub kill_timeout: Duration,
    pub launcher: LauncherConfig,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            control_host: config.control.host.clone(),
            password: config.control.password.clone(),
            cookie_path: config.control.cookie_path.clone(),
            connect_timeout: config.control.connect_timeout(),
            command_timeout: config.control.command_timeout(),
            connect_attempts: config.supervisor.connect_attempts,
            retry_delay: Duration::from_millis(config.supervisor.retry_delay_ms),
            startup_timeout: Duration::from_secs(config.supervisor.startup_timeout_secs),
            shutdown_grace: Duration::from_secs(config.supervisor.shutdown_grace_secs),
            kill_timeout: Duration::from_secs(config.supervisor.kill_timeout_secs),
            launcher: config.launcher.clone(),
        }
    }

    fn auth(&self, data_dir: &Path) -> ControlAuth {
        ControlAuth::resolve(
            self.password.as_deref(),
            self.cookie_path.as_deref(),
            data_dir,
        )
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Exclusive use of a data directory within this process
#[derive(Debug)]
struct DirectoryClaim {
    path: PathBuf,
}

fn claimed_directories() -> &'static StdMutex<HashSet<PathBuf>> {
    static CLAIMED: OnceLock<StdMutex<HashSet<PathBuf>>> = OnceLock::new();
    CLAIMED.get_or_init(Default::default)
}

impl DirectoryClaim {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        let mut claimed = claimed_directories()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(path.clone()) {
            return Err(TorError::DirectoryInUse(path));
        }
        Ok(Self { path })
    }
}

impl Drop for DirectoryClaim {
    fn drop(&mut self) {
        claimed_directories()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

/// Control connection of a running session
struct Link {
    channel: Arc<ControlChannel>,
    queue: Arc<CommandQueue>,
    pump: JoinHandle<()>,
    /// Set before a deliberate close so the pump does not report a lost connection
    retired: Arc<AtomicBool>,
}

impl Link {
    async fn close(self) {
        self.retired.store(true, Ordering::SeqCst);
        self.pump.abort();
        self.queue.shutdown();
        self.channel.close().await;
    }
}

/// Everything that belongs to one daemon run
struct Session {
    run: u64,
    config: DaemonConfig,
    /// None until the launcher has returned
    handle: Option<Box<dyn DaemonHandle>>,
    link: Option<Link>,
    _claim: DirectoryClaim,
}

struct Inner {
    settings: SupervisorSettings,
    launcher: Arc<dyn DaemonLauncher>,
    hub: Arc<NotificationHub>,
    machine: StatusMachine,
    config: RwLock<Option<DaemonConfig>>,
    lifecycle: Mutex<()>,
    session: Mutex<Option<Session>>,
}

/// Supervisor for one daemon instance
///
/// Cheap to clone; clones share the same daemon.
#[derive(Clone)]
pub struct TorSupervisor {
    inner: Arc<Inner>,
}

impl TorSupervisor {
    pub fn new(settings: SupervisorSettings, launcher: Arc<dyn DaemonLauncher>) -> Self {
        let hub = Arc::new(NotificationHub::new());
        Self {
            inner: Arc::new(Inner {
                settings,
                launcher,
                machine: StatusMachine::new(hub.clone()),
                hub,
                config: RwLock::new(None),
                lifecycle: Mutex::new(()),
                session: Mutex::new(None),
            }),
        }
    }

    /// Supervisor running the `tor` executable, preconfigured from `config`
    pub fn with_tor_process(config: &Config) -> Self {
        let supervisor = Self::new(
            SupervisorSettings::from_config(config),
            Arc::new(TorProcess::new()),
        );
        *supervisor.config_slot_mut() = Some(config.daemon.clone());
        supervisor
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    // --- Configuration and status queries ---

    /// Replace the daemon configuration; only while Stopped
    pub fn configure(&self, config: DaemonConfig) -> Result<()> {
        let status = self.status();
        if status != DaemonStatus::Stopped {
            return Err(TorError::AlreadyRunning(status));
        }
        *self.config_slot_mut() = Some(config);
        Ok(())
    }

    pub fn config(&self) -> Option<DaemonConfig> {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_configured(&self) -> bool {
        self.config().is_some()
    }

    pub fn status(&self) -> DaemonStatus {
        self.inner.machine.status()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.machine.snapshot()
    }

    pub fn bootstrap_progress(&self) -> u8 {
        self.inner.machine.snapshot().progress
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    /// Watch every status, progress and run change
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.machine.subscribe()
    }

    /// `socks5://host:port` for the configured (or default) SOCKS port
    pub fn socks_proxy_url(&self) -> String {
        let port = self
            .config()
            .map(|c| c.socks_port)
            .unwrap_or_else(|| DaemonConfig::default().socks_port);
        format!("socks5://{}:{}", self.inner.settings.control_host, port)
    }

    pub fn register_observer(&self, observer: &Arc<dyn StatusObserver>) -> ObserverId {
        self.inner.hub.register(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.inner.hub.unregister(id)
    }

    // --- Lifecycle ---

    /// Launch the daemon and wait until it reports 100% bootstrap
    pub async fn start(&self, config: DaemonConfig) -> Result<()> {
        let run = {
            let _lifecycle = self.inner.lifecycle.lock().await;
            self.prepare(config.clone()).await?
        };
        self.launch(run, &config).await?;
        self.bring_up(run, &config).await
    }

    /// Stop the daemon; always ends in Stopped
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.stop_locked().await;
    }

    /// Stop, then start again with the last configuration
    pub async fn restart(&self) -> Result<()> {
        let (run, config) = {
            let _lifecycle = self.inner.lifecycle.lock().await;
            let config = self.config().ok_or_else(|| {
                TorError::Startup("no daemon configuration to restart with".to_string())
            })?;
            self.stop_locked().await;
            let run = self.prepare(config.clone()).await?;
            (run, config)
        };
        self.launch(run, &config).await?;
        self.bring_up(run, &config).await
    }

    /// Claim the directory and open a run in Starting; under the lifecycle lock
    async fn prepare(&self, config: DaemonConfig) -> Result<u64> {
        let inner = &self.inner;

        let status = inner.machine.status();
        if status != DaemonStatus::Stopped {
            return Err(TorError::AlreadyRunning(status));
        }

        let claim = DirectoryClaim::acquire(&config.data_directory)?;
        *self.config_slot_mut() = Some(config.clone());
        let run = inner.machine.begin_start()?;

        *inner.session.lock().await = Some(Session {
            run,
            config,
            handle: None,
            link: None,
            _claim: claim,
        });
        Ok(run)
    }

    /// Call the daemon entry point; stop and the startup timeout both cut it short
    async fn launch(&self, run: u64, config: &DaemonConfig) -> Result<()> {
        let inner = &self.inner;
        let args = LaunchArgs::from_config(config, &inner.settings.launcher);
        let limit = inner.settings.startup_timeout;

        let launched = self
            .until_cancelled(
                run,
                tokio::time::timeout(limit, inner.launcher.launch(&args)),
            )
            .await;

        let handle = match launched {
            Some(Ok(Ok(handle))) => handle,
            Some(Ok(Err(e))) => {
                error!("Failed to launch Tor: {}", e);
                let e = match e {
                    TorError::Startup(_) => e,
                    other => TorError::Startup(other.to_string()),
                };
                return Err(self.abort_start(run, e));
            },
            Some(Err(_)) => {
                let e = TorError::Startup(format!("daemon did not start within {:?}", limit));
                error!("Failed to launch Tor: {}", e);
                return Err(self.abort_start(run, e));
            },
            None => return Err(stopped_during_startup()),
        };

        let mut session = inner.session.lock().await;
        if let Some(current) = session.as_mut() {
            if current.run == run && inner.machine.current_run() == run {
                current.handle = Some(handle);
                return Ok(());
            }
        }
        drop(session);

        // Stopped while the launcher was returning
        let mut handle = handle;
        reap(handle.as_mut(), Instant::now(), inner.settings.kill_timeout).await;
        Err(stopped_during_startup())
    }

    /// Connect, subscribe and wait for Connected
    async fn bring_up(&self, run: u64, config: &DaemonConfig) -> Result<()> {
        let started = Instant::now();
        let inner = &self.inner;

        let channel = match self.until_cancelled(run, self.connect_control(config)).await {
            Some(Ok(channel)) => channel,
            Some(Err(e)) => return Err(self.abort_start(run, e)),
            None => return Err(stopped_during_startup()),
        };

        let link = self.open_link(run, channel);
        let queue = link.queue.clone();
        if !self.attach(run, link).await {
            return Err(stopped_during_startup());
        }

        if let Err(e) = queue
            .execute(EVENT_SUBSCRIPTION)
            .await
            .and_then(ControlResponse::into_result)
        {
            return Err(self.abort_start(run, e));
        }

        // Progress made before the subscription took effect
        match queue
            .execute("GETINFO status/bootstrap-phase")
            .await
            .and_then(ControlResponse::into_result)
        {
            Ok(resp) => {
                if let Some(phase) = resp
                    .value("status/bootstrap-phase")
                    .and_then(BootstrapPhase::parse)
                {
                    inner.machine.apply_event(run, &TorEvent::Bootstrap(phase));
                }
            },
            Err(e) => debug!("Could not read bootstrap phase: {}", e),
        }

        self.await_connected(run).await?;
        info!(
            "Tor connected in {}",
            format_duration(started.elapsed())
        );
        Ok(())
    }

    async fn connect_control(&self, config: &DaemonConfig) -> Result<ControlChannel> {
        let settings = &self.inner.settings;
        let auth = settings.auth(&config.data_directory);
        let host = settings.control_host.as_str();
        let port = config.control_port;
        let timeout = settings.connect_timeout;

        connect_with_retries(settings.connect_attempts, settings.retry_delay, |attempt| {
            debug!("Control port connect attempt {} to {}:{}", attempt, host, port);
            let auth = auth.clone();
            async move { ControlChannel::connect(host, port, timeout, &auth).await }
        })
        .await
    }

    /// Queue and event pump over a fresh channel
    fn open_link(&self, run: u64, channel: ControlChannel) -> Link {
        let channel = Arc::new(channel);
        let queue = Arc::new(CommandQueue::new(
            channel.clone(),
            self.inner.settings.command_timeout,
        ));
        let retired = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(pump_events(
            self.inner.clone(),
            channel.clone(),
            run,
            retired.clone(),
        ));
        Link {
            channel,
            queue,
            pump,
            retired,
        }
    }

    /// Install the link if `run` is still the session's run
    async fn attach(&self, run: u64, link: Link) -> bool {
        let mut session = self.inner.session.lock().await;
        if let Some(current) = session.as_mut() {
            if current.run == run && self.inner.machine.current_run() == run {
                current.link = Some(link);
                return true;
            }
        }
        drop(session);

        link.close().await;
        false
    }

    async fn await_connected(&self, run: u64) -> Result<()> {
        let timeout = self.inner.settings.startup_timeout;
        let mut rx = self.inner.machine.subscribe();

        let outcome = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| {
                s.run != run || matches!(s.status, DaemonStatus::Connected | DaemonStatus::Error)
            }),
        )
        .await;

        let snapshot = match outcome {
            Ok(Ok(snapshot)) => StatusSnapshot::clone(&snapshot),
            Ok(Err(_)) => return Err(TorError::Closed),
            Err(_) => {
                let reason = format!("bootstrap did not complete within {:?}", timeout);
                self.inner.machine.fail(run, &reason);
                return Err(TorError::Startup(reason));
            },
        };

        if snapshot.run != run {
            return Err(stopped_during_startup());
        }
        match snapshot.status {
            DaemonStatus::Connected => Ok(()),
            _ => Err(TorError::Startup(
                snapshot
                    .message
                    .unwrap_or_else(|| "daemon reported a fatal error".to_string()),
            )),
        }
    }

    /// Run `fut` unless the run is retired first
    async fn until_cancelled<F: Future>(&self, run: u64, fut: F) -> Option<F::Output> {
        let mut rx = self.inner.machine.subscribe();
        tokio::select! {
            out = fut => Some(out),
            _ = rx.wait_for(|s| s.run != run) => None,
        }
    }

    fn abort_start(&self, run: u64, error: TorError) -> TorError {
        if self.inner.machine.current_run() != run {
            return stopped_during_startup();
        }
        warn!("Tor startup failed: {}", error);
        self.inner.machine.fail(run, &error.to_string());
        error
    }

    async fn stop_locked(&self) {
        let inner = &self.inner;
        inner.machine.cancel_run();

        let session = inner.session.lock().await.take();
        let Some(mut session) = session else {
            inner.machine.force_stop();
            return;
        };

        info!(
            "Stopping Tor (data directory {})",
            session.config.data_directory.display()
        );
        let grace = inner.settings.shutdown_grace;
        let deadline = Instant::now() + grace;

        if let Some(link) = &session.link {
            match tokio::time::timeout_at(deadline, link.queue.execute("SIGNAL SHUTDOWN")).await {
                Ok(Ok(resp)) if !resp.is_error => debug!("Tor acknowledged shutdown"),
                Ok(Ok(resp)) => warn!(
                    "Tor refused shutdown signal: {} {}",
                    resp.status_code,
                    resp.message()
                ),
                Ok(Err(e)) => warn!("Could not send shutdown signal: {}", e),
                Err(_) => warn!("Shutdown signal not acknowledged within {:?}", grace),
            }
        }

        match session.handle.as_deref_mut() {
            Some(handle) => reap(handle, deadline, inner.settings.kill_timeout).await,
            None => debug!("Launcher had not returned, nothing to wait for"),
        }

        if let Some(link) = session.link.take() {
            link.close().await;
        }
        // Releases the data directory claim
        drop(session);

        inner.machine.force_stop();
        info!("Tor stopped");
    }

    // --- Control commands ---

    /// Queue of the current link, replacing the link first if it has faulted
    async fn queue(&self) -> Result<Arc<CommandQueue>> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        let current = session.as_mut().ok_or(TorError::Closed)?;
        let link = current.link.as_ref().ok_or(TorError::Closed)?;
        if !link.queue.is_faulted() {
            return Ok(link.queue.clone());
        }

        let run = current.run;
        if inner.machine.current_run() != run || !inner.machine.status().is_running() {
            return Err(TorError::Closed);
        }

        warn!("Control connection out of sync, reconnecting");
        let link = match self.until_cancelled(run, self.relink(run, &current.config)).await {
            Some(Ok(link)) => link,
            Some(Err(e)) => {
                inner
                    .machine
                    .fail(run, &format!("control reconnect failed: {}", e));
                return Err(e);
            },
            None => return Err(TorError::Closed),
        };

        let queue = link.queue.clone();
        if let Some(old) = current.link.replace(link) {
            old.close().await;
        }
        info!("Control connection re-established");
        Ok(queue)
    }

    /// New channel, queue and event subscription for `run`
    async fn relink(&self, run: u64, config: &DaemonConfig) -> Result<Link> {
        let channel = self.connect_control(config).await?;
        let link = self.open_link(run, channel);
        match link
            .queue
            .execute(EVENT_SUBSCRIPTION)
            .await
            .and_then(ControlResponse::into_result)
        {
            Ok(_) => Ok(link),
            Err(e) => {
                link.close().await;
                Err(e)
            },
        }
    }

    /// Raw control command through the command queue
    pub async fn send_command(&self, command: &str) -> Result<ControlResponse> {
        self.queue().await?.execute(command).await
    }

    /// `SIGNAL NEWNYM`: fresh circuits for new streams
    pub async fn new_identity(&self) -> Result<()> {
        self.send_command("SIGNAL NEWNYM").await?.into_result()?;
        info!("Requested new identity");
        Ok(())
    }

    pub async fn circuits(&self) -> Result<Vec<CircuitRecord>> {
        let resp = self
            .send_command("GETINFO circuit-status")
            .await?
            .into_result()?;
        let value = resp.value("circuit-status").ok_or_else(|| {
            TorError::Protocol("GETINFO circuit-status reply without a value".to_string())
        })?;
        parse_circuit_status(value)
    }

    /// Address of the exit relay of the first built general circuit
    pub async fn exit_address(&self) -> Result<Option<IpAddr>> {
        let circuits = self.circuits().await?;
        let Some(exit) = select_exit_circuit(&circuits).and_then(CircuitRecord::exit_relay) else {
            return Ok(None);
        };
        if exit.fingerprint.is_empty() {
            return Err(TorError::Protocol(format!(
                "exit relay {} has no fingerprint",
                exit
            )));
        }

        let key = format!("ns/id/{}", exit.fingerprint);
        let resp = self
            .send_command(&format!("GETINFO {}", key))
            .await?
            .into_result()?;
        parse_router_address(resp.value(&key).unwrap_or_default()).map(Some)
    }

    /// Whether the daemon has built at least one circuit
    pub async fn check_connection(&self) -> bool {
        match self
            .send_command("GETINFO status/circuit-established")
            .await
            .and_then(ControlResponse::into_result)
        {
            Ok(resp) => resp.value("status/circuit-established") == Some("1"),
            Err(e) => {
                debug!("Connection check failed: {}", e);
                false
            },
        }
    }

    fn config_slot_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<DaemonConfig>> {
        self.inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read events for `run` until the channel goes away
async fn pump_events(
    inner: Arc<Inner>,
    channel: Arc<ControlChannel>,
    run: u64,
    retired: Arc<AtomicBool>,
) {
    loop {
        let event = match channel.read_event().await {
            Ok(event) => TorEvent::from_event(&event),
            Err(_) => {
                if retired.load(Ordering::SeqCst) {
                    return;
                }
                if inner.machine.fail(run, "control connection lost") {
                    warn!("Lost the Tor control connection");
                }
                return;
            },
        };

        match &event {
            TorEvent::Log { severity, message } => {
                match severity {
                    Severity::Err => error!(target: "tor", "{}", message),
                    Severity::Warn => warn!(target: "tor", "{}", message),
                    Severity::Notice => info!(target: "tor", "{}", message),
                    Severity::Info | Severity::Debug => debug!(target: "tor", "{}", message),
                }
                if let Some(line) = event.log_line() {
                    inner.hub.publish_log(line);
                }
            },
            TorEvent::Bootstrap(phase) => {
                debug!("Bootstrap {}%: {}", phase.progress, phase.summary)
            },
            TorEvent::Circuit(circuit) => {
                debug!("Circuit {} {}", circuit.id, circuit.status)
            },
            _ => {},
        }

        inner.machine.apply_event(run, &event);
    }
}

/// Wait for the daemon to exit by `deadline`, then terminate and wait `kill_timeout`
async fn reap(handle: &mut dyn DaemonHandle, deadline: Instant, kill_timeout: Duration) {
    match tokio::time::timeout_at(deadline, handle.wait()).await {
        Ok(Ok(())) => debug!("Tor exited"),
        Ok(Err(e)) => warn!("Waiting for Tor to exit failed: {}", e),
        Err(_) => {
            warn!("Tor still running, terminating");
            if let Err(e) = handle.terminate().await {
                warn!("Terminate failed: {}", e);
            }
            match tokio::time::timeout(kill_timeout, handle.wait()).await {
                Ok(Ok(())) => debug!("Tor exited after termination"),
                Ok(Err(e)) => warn!("Waiting for Tor to exit failed: {}", e),
                Err(_) => error!("Tor did not exit within {:?} of termination", kill_timeout),
            }
        },
    }
}

/// Call `connect` until it succeeds, fails for good, or attempts run out
pub async fn connect_with_retries<T, F, Fut>(
    attempts: u32,
    delay: Duration,
    mut connect: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match connect(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!("Control port answered after {} attempts", attempt);
                }
                return Ok(value);
            },
            Err(e) if e.is_retryable() => {
                debug!("Attempt {}/{} failed: {}", attempt, attempts, e);
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(jitter(delay)).await;
                }
            },
            Err(e) => return Err(e),
        }
    }

    Err(TorError::Startup(format!(
        "control port not reachable after {} attempts: {}",
        attempts,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn stopped_during_startup() -> TorError {
    TorError::Startup("stopped during startup".to_string())
}
