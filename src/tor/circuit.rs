//! Circuit snapshots parsed from `GETINFO circuit-status` and CIRC events

use super::events::{keyword_args, lookup};
use crate::error::{Result, TorError};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

/// Relay in a circuit path (`$FINGERPRINT~nickname`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayId {
    pub fingerprint: String,
    pub nickname: Option<String>,
}

impl RelayId {
    /// Accepts `$FP~nick`, `$FP=nick`, `$FP` and bare legacy nicknames
    pub fn parse(token: &str) -> Self {
        match token.strip_prefix('$') {
            Some(rest) => {
                let (fingerprint, nickname) = match rest.find(['~', '=']) {
                    Some(pos) => (&rest[..pos], Some(rest[pos + 1..].to_string())),
                    None => (rest, None),
                };
                Self {
                    fingerprint: fingerprint.to_string(),
                    nickname,
                }
            },
            None => Self {
                fingerprint: String::new(),
                nickname: Some(token.to_string()),
            },
        }
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.nickname {
            Some(nick) if !self.fingerprint.is_empty() => write!(f, "${}~{}", self.fingerprint, nick),
            Some(nick) => f.write_str(nick),
            None => write!(f, "${}", self.fingerprint),
        }
    }
}

/// One circuit, read-only after parse
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitRecord {
    pub id: String,
    /// LAUNCHED, BUILT, GUARD_WAIT, EXTENDED, FAILED or CLOSED
    pub status: String,
    /// Entry first, exit last
    pub path: Vec<RelayId>,
    pub purpose: Option<String>,
    pub build_flags: Vec<String>,
}

impl CircuitRecord {
    /// Parse `<id> <status> [<path>] [KEY=value ...]`
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.trim().splitn(3, ' ');
        let id = parts.next().filter(|s| !s.is_empty());
        let status = parts.next().filter(|s| !s.is_empty());

        let (Some(id), Some(status)) = (id, status) else {
            return Err(TorError::Protocol(format!("malformed circuit line: {:?}", line)));
        };

        let rest = parts.next().unwrap_or_default().trim_start();
        let first = rest.split(' ').next().unwrap_or_default();

        // The path is optional; a first token that looks like KEY=value is not a path
        let (path, args) = if !first.is_empty() && (first.starts_with('$') || !first.contains('=')) {
            let path = first.split(',').map(RelayId::parse).collect();
            (path, &rest[first.len()..])
        } else {
            (Vec::new(), rest)
        };

        let args = keyword_args(args);

        Ok(Self {
            id: id.to_string(),
            status: status.to_string(),
            path,
            purpose: lookup(&args, "PURPOSE").map(str::to_string),
            build_flags: lookup(&args, "BUILD_FLAGS")
                .map(|flags| flags.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }

    pub fn is_built(&self) -> bool {
        self.status == "BUILT"
    }

    /// Carries ordinary client traffic
    pub fn is_general(&self) -> bool {
        self.purpose.as_deref().map_or(true, |p| p == "GENERAL")
    }

    pub fn exit_relay(&self) -> Option<&RelayId> {
        self.path.last()
    }
}

/// Parse the value of `GETINFO circuit-status` (one circuit per line)
pub fn parse_circuit_status(value: &str) -> Result<Vec<CircuitRecord>> {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(CircuitRecord::parse)
        .collect()
}

/// First built general-purpose circuit, the one exit traffic would use
pub fn select_exit_circuit(circuits: &[CircuitRecord]) -> Option<&CircuitRecord> {
    circuits
        .iter()
        .find(|c| c.is_built() && c.is_general() && !c.path.is_empty())
}

/// Address field of the `r` line in a `GETINFO ns/id/<fp>` answer
///
/// An empty answer is an error rather than "no address": a client-only daemon
/// returns neutral placeholders for relay-side lookups it does not support.
pub fn parse_router_address(ns: &str) -> Result<IpAddr> {
    let r_line = ns
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("r "))
        .ok_or_else(|| TorError::Protocol(format!("no router status line in {:?}", ns)))?;

    // r <nickname> <identity> [<digest>] <date> <time> <address> <orport> <dirport>
    r_line
        .split_whitespace()
        .skip(3)
        .find_map(|token| token.parse::<IpAddr>().ok())
        .ok_or_else(|| TorError::Protocol(format!("no address in router status {:?}", r_line)))
}
