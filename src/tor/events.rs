//! Typed view of asynchronous control events
//!
//! Only the handful of events the supervisor subscribes to get a real shape:
//! bootstrap progress, log lines, other STATUS_* notices and circuit changes.
//! Everything else is passed through as [`TorEvent::Other`].

use super::circuit::CircuitRecord;
use super::protocol::ControlEvent;
use std::fmt;

/// Log messages that mean the daemon cannot continue, even at WARN severity
pub const FATAL_PATTERNS: &[&str] = &[
    "Failed to bind one of the listener ports",
    "Could not bind to",
    "Reading config failed",
    "Failed to parse/validate config",
    "Acting on config options left us in a broken state",
    "It looks like another Tor process is running with the same data directory",
    "Couldn't create private data directory",
    "Error initializing keys",
];

/// Tor log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Notice,
    Warn,
    Err,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEBUG" => Some(Severity::Debug),
            "INFO" => Some(Severity::Info),
            "NOTICE" => Some(Severity::Notice),
            "WARN" => Some(Severity::Warn),
            "ERR" => Some(Severity::Err),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Notice => "NOTICE",
            Severity::Warn => "WARN",
            Severity::Err => "ERR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bootstrap phase as reported by `STATUS_CLIENT ... BOOTSTRAP` or
/// `GETINFO status/bootstrap-phase`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPhase {
    pub severity: Severity,
    /// 0..=100
    pub progress: u8,
    pub tag: String,
    pub summary: String,
}

impl BootstrapPhase {
    /// Parse `NOTICE BOOTSTRAP PROGRESS=50 TAG=... SUMMARY="..."`
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().splitn(3, ' ');
        let severity = Severity::parse(parts.next()?)?;
        if parts.next()? != "BOOTSTRAP" {
            return None;
        }
        let args = keyword_args(parts.next().unwrap_or_default());

        let progress = lookup(&args, "PROGRESS")?.parse::<u8>().ok()?.min(100);

        Some(Self {
            severity,
            progress,
            tag: lookup(&args, "TAG").unwrap_or_default().to_string(),
            summary: lookup(&args, "SUMMARY").unwrap_or_default().to_string(),
        })
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= 100
    }
}

/// Parsed asynchronous event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorEvent {
    Bootstrap(BootstrapPhase),
    Log {
        severity: Severity,
        message: String,
    },
    /// STATUS_GENERAL / STATUS_CLIENT / STATUS_SERVER other than bootstrap
    Status {
        kind: String,
        severity: Severity,
        action: String,
        args: String,
    },
    Circuit(CircuitRecord),
    Other {
        keyword: String,
        body: String,
    },
}

impl TorEvent {
    pub fn from_event(event: &ControlEvent) -> Self {
        let keyword = event.keyword();

        match keyword {
            "STATUS_CLIENT" | "STATUS_GENERAL" | "STATUS_SERVER" => {
                parse_status(keyword, event.body()).unwrap_or_else(|| other(event))
            },
            "DEBUG" | "INFO" | "NOTICE" | "WARN" | "ERR" => {
                let severity = Severity::parse(keyword).unwrap_or(Severity::Notice);
                let message = event
                    .first_line()
                    .strip_prefix(keyword)
                    .unwrap_or_default()
                    .trim_start()
                    .to_string();
                TorEvent::Log { severity, message }
            },
            "CIRC" => CircuitRecord::parse(event.body())
                .map(TorEvent::Circuit)
                .unwrap_or_else(|_| other(event)),
            _ => other(event),
        }
    }

    /// Reason text when this event means the daemon cannot continue
    pub fn fatal_reason(&self) -> Option<String> {
        match self {
            TorEvent::Log { severity, message } => {
                if *severity == Severity::Err || (*severity == Severity::Warn && is_fatal_text(message))
                {
                    Some(message.clone())
                } else {
                    None
                }
            },
            TorEvent::Status {
                severity,
                action,
                args,
                ..
            } => {
                if *severity == Severity::Err || (*severity == Severity::Warn && is_fatal_text(args))
                {
                    Some(format!("{} {}", action, args).trim().to_string())
                } else {
                    None
                }
            },
            _ => None,
        }
    }

    /// Log line forwarded to log observers, if this is a log event
    pub fn log_line(&self) -> Option<String> {
        match self {
            TorEvent::Log { severity, message } => Some(format!("[{}] {}", severity, message)),
            _ => None,
        }
    }
}

fn parse_status(kind: &str, body: &str) -> Option<TorEvent> {
    if kind == "STATUS_CLIENT" {
        if let Some(phase) = BootstrapPhase::parse(body) {
            return Some(TorEvent::Bootstrap(phase));
        }
    }

    let mut parts = body.splitn(3, ' ');
    let severity = Severity::parse(parts.next()?)?;
    let action = parts.next()?.to_string();
    Some(TorEvent::Status {
        kind: kind.to_string(),
        severity,
        action,
        args: parts.next().unwrap_or_default().to_string(),
    })
}

fn other(event: &ControlEvent) -> TorEvent {
    TorEvent::Other {
        keyword: event.keyword().to_string(),
        body: event.body().to_string(),
    }
}

fn is_fatal_text(text: &str) -> bool {
    FATAL_PATTERNS.iter().any(|p| text.contains(p))
}

/// Split `KEY=value KEY2="quoted value"` into pairs
///
/// Quoted values may contain spaces and backslash escapes. Tokens without `=`
/// are skipped.
pub fn keyword_args(text: &str) -> Vec<(String, String)> {
    let mut args = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        while chars.peek() == Some(&' ') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ' ' {
                break;
            }
            key.push(c);
            chars.next();
        }

        if chars.peek() != Some(&'=') {
            continue;
        }
        chars.next();

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    },
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ' ' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }

        args.push((key, value));
    }

    args
}

pub(crate) fn lookup<'a>(args: &'a [(String, String)], key: &str) -> Option<&'a str> {
    args.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
