//! Tor Control Port client
//!
//! Communicates with the local Tor daemon via the control protocol. A reader
//! task owns the read half of the socket and splits incoming lines into
//! command replies and asynchronous events, so neither stream can corrupt the
//! other.

use super::protocol::{format_command, ControlEvent, ControlResponse, Demultiplexer, Frame};
use crate::error::{Result, TorError};
use crate::queue::ControlTransport;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Common cookie file locations of a system-wide Tor
pub const COOKIE_PATHS: &[&str] = &[
    "/run/tor/control.authcookie",
    "/var/run/tor/control.authcookie",
    "/var/lib/tor/control_auth_cookie",
];

/// Cookie file name inside a daemon's data directory
pub const COOKIE_FILE: &str = "control_auth_cookie";

/// Credentials for the AUTHENTICATE exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAuth {
    /// Bare `AUTHENTICATE`, for a daemon with no auth configured
    Null,
    /// Plain-text password, sent hex encoded
    Password(String),
    /// Cookie file that must be readable
    Cookie(PathBuf),
    /// Each readable cookie in turn, then null authentication
    Discover(Vec<PathBuf>),
}

impl ControlAuth {
    /// Password, then explicit cookie, then the cookie in `data_dir`
    pub fn resolve(password: Option<&str>, cookie_path: Option<&Path>, data_dir: &Path) -> Self {
        if let Some(password) = password {
            return ControlAuth::Password(password.to_string());
        }
        if let Some(path) = cookie_path {
            return ControlAuth::Cookie(path.to_path_buf());
        }
        ControlAuth::Discover(vec![data_dir.join(COOKIE_FILE)])
    }

    /// Cookie locations used by a system Tor
    pub fn system() -> Self {
        ControlAuth::Discover(COOKIE_PATHS.iter().map(PathBuf::from).collect())
    }
}

/// Authenticated connection to a Tor control port
///
/// Methods take `&self`; the channel is shared behind an `Arc` between the
/// command queue and the event pump.
pub struct ControlChannel {
    addr: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    responses: Mutex<mpsc::UnboundedReceiver<Result<ControlResponse>>>,
    events: Mutex<mpsc::UnboundedReceiver<ControlEvent>>,
    closed: watch::Sender<bool>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl ControlChannel {
    /// Connect and authenticate
    ///
    /// `timeout` bounds the TCP connect and the handshake separately.
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        auth: &ControlAuth,
    ) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        debug!("Connecting to Tor control port: {}", addr);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TorError::connect(&addr, e)),
            Err(_) => {
                return Err(TorError::connect(
                    &addr,
                    format!("no answer within {:?}", timeout),
                ))
            },
        };

        let channel = Self::from_stream(stream, addr);

        match tokio::time::timeout(timeout, channel.authenticate(auth)).await {
            Ok(Ok(())) => Ok(channel),
            Ok(Err(e)) => {
                channel.close().await;
                Err(e)
            },
            Err(_) => {
                channel.close().await;
                Err(TorError::connect(
                    &channel.addr,
                    "authentication handshake timed out",
                ))
            },
        }
    }

    fn from_stream(stream: TcpStream, addr: String) -> Self {
        let (read, write) = stream.into_split();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let reader = tokio::spawn(read_loop(read, response_tx, event_tx));

        Self {
            addr,
            writer: Mutex::new(Some(write)),
            responses: Mutex::new(response_rx),
            events: Mutex::new(event_rx),
            closed,
            reader: StdMutex::new(Some(reader)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Write one command line
    pub async fn send(&self, command: &str) -> Result<()> {
        if self.is_closed() {
            return Err(TorError::Closed);
        }

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(TorError::Closed)?;

        debug!("-> {}", preview(command));

        let line = format_command(command);
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!("Control write failed: {}", e);
            return Err(TorError::Closed);
        }
        writer.flush().await.map_err(|_| TorError::Closed)?;
        Ok(())
    }

    /// Next complete command reply
    pub async fn read_response(&self) -> Result<ControlResponse> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TorError::Closed);
        }

        let mut responses = self.responses.lock().await;
        tokio::select! {
            next = responses.recv() => next.unwrap_or(Err(TorError::Closed)),
            _ = closed.wait_for(|closed| *closed) => Err(TorError::Closed),
        }
    }

    /// Next asynchronous event
    pub async fn read_event(&self) -> Result<ControlEvent> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TorError::Closed);
        }

        let mut events = self.events.lock().await;
        tokio::select! {
            next = events.recv() => next.ok_or(TorError::Closed),
            _ = closed.wait_for(|closed| *closed) => Err(TorError::Closed),
        }
    }

    /// Release the socket; pending and later reads fail with [`TorError::Closed`]
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        self.abort_reader();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        debug!("Closed control connection to {}", self.addr);
    }

    fn abort_reader(&self) {
        let reader = match self.reader.lock() {
            Ok(mut reader) => reader.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(reader) = reader {
            reader.abort();
        }
    }

    async fn authenticate(&self, auth: &ControlAuth) -> Result<()> {
        match auth {
            ControlAuth::Null => self.authenticate_with(None).await,
            ControlAuth::Password(password) => {
                // Tor expects hex-encoded password when using HashedControlPassword
                let password_hex = data_encoding::HEXLOWER.encode(password.as_bytes());
                self.authenticate_with(Some(password_hex)).await
            },
            ControlAuth::Cookie(path) => {
                let cookie = tokio::fs::read(path).await.map_err(|e| {
                    TorError::Auth(format!("cannot read cookie {}: {}", path.display(), e))
                })?;
                self.authenticate_with(Some(data_encoding::HEXLOWER.encode(&cookie)))
                    .await
            },
            ControlAuth::Discover(paths) => {
                for path in paths {
                    let Ok(cookie) = tokio::fs::read(path).await else {
                        continue;
                    };
                    match self
                        .authenticate_with(Some(data_encoding::HEXLOWER.encode(&cookie)))
                        .await
                    {
                        Ok(()) => {
                            debug!("Authenticated with cookie from {}", path.display());
                            return Ok(());
                        },
                        Err(TorError::Auth(e)) => {
                            debug!("Cookie auth failed with {}: {}", path.display(), e);
                        },
                        Err(e) => return Err(e),
                    }
                }

                // Fallback: null authentication works if no auth is configured
                debug!("Trying null authentication");
                self.authenticate_with(None).await
            },
        }
    }

    async fn authenticate_with(&self, secret: Option<String>) -> Result<()> {
        let command = match secret {
            Some(secret) => format!("AUTHENTICATE {}", secret),
            None => "AUTHENTICATE".to_string(),
        };

        let reply = match self.send(&command).await {
            Ok(()) => self.read_response().await,
            Err(e) => Err(e),
        };

        match reply {
            Ok(resp) if !resp.is_error => {
                info!("Authenticated to Tor control port {}", self.addr);
                Ok(())
            },
            Ok(resp) => Err(TorError::Auth(format!(
                "{} {}",
                resp.status_code,
                resp.message()
            ))),
            Err(TorError::Closed) => Err(TorError::connect(
                &self.addr,
                "connection dropped during authentication",
            )),
            Err(e) => Err(e),
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

#[async_trait]
impl ControlTransport for ControlChannel {
    async fn send(&self, command: &str) -> Result<()> {
        ControlChannel::send(self, command).await
    }

    async fn read_response(&self) -> Result<ControlResponse> {
        ControlChannel::read_response(self).await
    }
}

/// Route each incoming line to the reply or the event stream until EOF
async fn read_loop(
    read: OwnedReadHalf,
    responses: mpsc::UnboundedSender<Result<ControlResponse>>,
    events: mpsc::UnboundedSender<ControlEvent>,
) {
    let mut reader = BufReader::new(read);
    let mut demux = Demultiplexer::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!("Control connection closed by daemon");
                break;
            },
            Ok(_) => {},
            Err(e) => {
                debug!("Control connection read failed: {}", e);
                break;
            },
        }

        // Log lines may carry arbitrary bytes from the network
        let line = String::from_utf8_lossy(&buf);
        trace!("<- {}", line.trim_end());

        match demux.feed(&line) {
            Ok(Some(Frame::Response(resp))) => {
                let _ = responses.send(Ok(resp));
            },
            Ok(Some(Frame::Event(event))) => {
                let _ = events.send(event);
            },
            Ok(None) => {},
            Err(e) => {
                warn!("Dropping control connection: {}", e);
                let _ = responses.send(Err(e));
                break;
            },
        }
    }
}

/// Command text safe for logs: secrets hidden, long commands truncated
fn preview(command: &str) -> String {
    let command = command.trim_end();
    if command.starts_with("AUTHENTICATE ") {
        return "AUTHENTICATE <redacted>".to_string();
    }
    if command.chars().count() > 100 {
        let head: String = command.chars().take(100).collect();
        return format!("{}...", head);
    }
    command.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_hides_credentials() {
        assert_eq!(preview("AUTHENTICATE 68756e74657232"), "AUTHENTICATE <redacted>");
        assert_eq!(preview("GETINFO version\r\n"), "GETINFO version");
        assert!(preview(&"X".repeat(300)).ends_with("..."));
    }

    #[test]
    fn test_auth_resolution_order() {
        let dir = Path::new("/tmp/td");
        assert_eq!(
            ControlAuth::resolve(Some("pw"), None, dir),
            ControlAuth::Password("pw".into())
        );
        assert_eq!(
            ControlAuth::resolve(None, Some(Path::new("/c")), dir),
            ControlAuth::Cookie("/c".into())
        );
        assert_eq!(
            ControlAuth::resolve(None, None, dir),
            ControlAuth::Discover(vec![dir.join(COOKIE_FILE)])
        );
    }
}
