//! Discovered bridge candidates and the deduplicating candidate set.
//!
//! A [`DiscoveredCandidate`] is a bridge advertisement that has been resolved
//! to a connectable host and port but not yet connected to.  It is transient:
//! it lives only in discovery snapshots and in the "candidate selected" event,
//! and is never persisted.
//!
//! # Deduplication
//!
//! The same bridge is typically seen many times: once per network interface,
//! once per IPv4/IPv6 record, and again on every re-announcement.  The
//! [`CandidateSet`] keys entries by **(host, port)** only.  A later resolution
//! of the same pair replaces the earlier entry in place, so a snapshot never
//! contains two entries for one endpoint.
//!
//! # TXT attributes
//!
//! The bridge advertises free-form `key=value` attributes.  The ones the
//! client understands are exposed through typed accessors; everything else is
//! kept verbatim in [`DiscoveredCandidate::txt`].

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::fingerprint::Fingerprint;

/// Well-known DNS-SD service type advertised by bridges.
pub const SERVICE_TYPE: &str = "_armorclaw._tcp.local.";

/// Reserved TXT attribute carrying the certificate fingerprint out of band.
pub const TXT_FINGERPRINT: &str = "fingerprint";
pub const TXT_VERSION: &str = "version";
pub const TXT_MODE: &str = "mode";
pub const TXT_HARDWARE: &str = "hardware";
pub const TXT_TLS: &str = "tls";
pub const TXT_API_PATH: &str = "api_path";
pub const TXT_WS_PATH: &str = "ws_path";
pub const TXT_MATRIX_HOMESERVER: &str = "matrix_homeserver";
pub const TXT_PUSH_GATEWAY: &str = "push_gateway";

const DEFAULT_API_PATH: &str = "/api";
const DEFAULT_WS_PATH: &str = "/ws";

/// Deduplication key of a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateKey {
    pub host: String,
    pub port: u16,
}

/// A resolved bridge advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredCandidate {
    /// Service instance name (usually the bridge's hostname).
    pub name: String,
    /// Host name or literal address to connect to.
    pub host: String,
    /// Every address the resolver returned; may be empty when `host` is a
    /// literal address.
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    /// Raw advertised attributes.
    #[serde(default)]
    pub txt: BTreeMap<String, String>,
    /// Certificate fingerprint, when advertised under [`TXT_FINGERPRINT`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

impl DiscoveredCandidate {
    /// Builds a candidate from resolver output, extracting the reserved
    /// fingerprint attribute when present and well-formed.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        addresses: Vec<IpAddr>,
        port: u16,
        txt: BTreeMap<String, String>,
    ) -> Self {
        let name = name.into();
        let fingerprint = txt.get(TXT_FINGERPRINT).and_then(|raw| match raw.parse() {
            Ok(fp) => Some(fp),
            Err(e) => {
                debug!("ignoring malformed fingerprint attribute on {name}: {e}");
                None
            }
        });
        Self {
            name,
            host: host.into(),
            addresses,
            port,
            txt,
            fingerprint,
        }
    }

    pub fn key(&self) -> CandidateKey {
        CandidateKey {
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.txt.get(key).map(String::as_str)
    }

    pub fn version(&self) -> Option<&str> {
        self.attribute(TXT_VERSION)
    }

    pub fn mode(&self) -> Option<&str> {
        self.attribute(TXT_MODE)
    }

    pub fn hardware(&self) -> Option<&str> {
        self.attribute(TXT_HARDWARE)
    }

    /// Whether the bridge serves HTTPS.  Absent means yes.
    pub fn uses_tls(&self) -> bool {
        self.attribute(TXT_TLS).map_or(true, |v| v != "false")
    }

    pub fn api_path(&self) -> &str {
        self.attribute(TXT_API_PATH).unwrap_or(DEFAULT_API_PATH)
    }

    pub fn ws_path(&self) -> &str {
        self.attribute(TXT_WS_PATH).unwrap_or(DEFAULT_WS_PATH)
    }

    pub fn matrix_homeserver(&self) -> Option<&str> {
        self.attribute(TXT_MATRIX_HOMESERVER)
    }

    pub fn push_gateway(&self) -> Option<&str> {
        self.attribute(TXT_PUSH_GATEWAY)
    }

    /// `scheme://host:port` with IPv6 literals bracketed.
    pub fn base_url(&self) -> String {
        let scheme = if self.uses_tls() { "https" } else { "http" };
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("{scheme}://{host}:{}", self.port)
    }

    /// JSON-RPC endpoint derived from the advertised API path.
    pub fn rpc_url(&self) -> String {
        format!("{}{}", self.base_url(), normalise_path(self.api_path()))
    }

    /// Push-event WebSocket endpoint derived from the advertised WS path.
    pub fn ws_url(&self) -> String {
        let base = self.base_url();
        let ws_base = base
            .strip_prefix("https://")
            .map(|rest| format!("wss://{rest}"))
            .or_else(|| base.strip_prefix("http://").map(|rest| format!("ws://{rest}")))
            .unwrap_or(base);
        format!("{ws_base}{}", normalise_path(self.ws_path()))
    }
}

fn normalise_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Outcome of inserting into a [`CandidateSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new (host, port) pair was added.
    Added,
    /// An existing entry changed (new name, addresses, or attributes).
    Updated,
    /// The resolution was identical to what the set already held.
    Unchanged,
}

impl Upsert {
    pub fn changed(self) -> bool {
        !matches!(self, Upsert::Unchanged)
    }
}

/// The current set of candidates, deduplicated by (host, port).
#[derive(Debug, Default, Clone)]
pub struct CandidateSet {
    by_key: BTreeMap<CandidateKey, DiscoveredCandidate>,
    /// Instance name → endpoint it last resolved to, so a "lost" notification
    /// (which only carries the name) can find its entry.
    by_name: HashMap<String, CandidateKey>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `candidate`, replacing any entry with the same (host, port).
    ///
    /// If the same instance name previously resolved to a *different*
    /// endpoint, that stale endpoint is dropped.
    pub fn upsert(&mut self, candidate: DiscoveredCandidate) -> Upsert {
        let key = candidate.key();

        if let Some(previous_key) = self.by_name.get(&candidate.name).cloned() {
            if previous_key != key {
                let stale_owned_by_name = self
                    .by_key
                    .get(&previous_key)
                    .is_some_and(|c| c.name == candidate.name);
                if stale_owned_by_name {
                    self.by_key.remove(&previous_key);
                }
            }
        }
        self.by_name.insert(candidate.name.clone(), key.clone());

        let outcome = match self.by_key.get(&key) {
            Some(existing) if *existing == candidate => return Upsert::Unchanged,
            Some(_) => Upsert::Updated,
            None => Upsert::Added,
        };
        self.by_key.insert(key, candidate);
        outcome
    }

    /// Removes the entry advertised under `name`, if it still owns one.
    pub fn remove_by_name(&mut self, name: &str) -> Option<DiscoveredCandidate> {
        let key = self.by_name.remove(name)?;
        match self.by_key.get(&key) {
            Some(c) if c.name == name => self.by_key.remove(&key),
            _ => None,
        }
    }

    pub fn get(&self, key: &CandidateKey) -> Option<&DiscoveredCandidate> {
        self.by_key.get(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Current candidates ordered by (host, port).
    pub fn snapshot(&self) -> Vec<DiscoveredCandidate> {
        self.by_key.values().cloned().collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
