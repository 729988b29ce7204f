//! The single active server configuration and its source precedence.
//!
//! Exactly one [`ActiveServerConfig`] is active at any time.  Where it came
//! from is recorded in [`ConfigSource`]; sources are ordered
//!
//! ```text
//! SignedUrl  >  Manual  >  Cached  >  Default
//! ```
//!
//! and a lower-precedence source may not silently replace a higher one.  Any
//! config except `Default` may carry an expiry; an expired config reverts to
//! `Default` the next time it is loaded.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::candidate::DiscoveredCandidate;

/// Where the active configuration came from.  Declaration order is
/// precedence order (lowest first), which `Ord` relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Default,
    Cached,
    Manual,
    SignedUrl,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigSource::Default => "default",
            ConfigSource::Cached => "cached",
            ConfigSource::Manual => "manual",
            ConfigSource::SignedUrl => "signed_url",
        };
        f.write_str(s)
    }
}

pub const DEFAULT_HOMESERVER_URL: &str = "http://localhost:8008";
pub const DEFAULT_RPC_URL: &str = "https://localhost:8443/api";
pub const DEFAULT_WS_URL: &str = "wss://localhost:8443/ws";
pub const DEFAULT_PUSH_GATEWAY_URL: &str = "http://localhost:5000/_matrix/push/v1/notify";
pub const DEFAULT_SERVER_NAME: &str = "localhost";

/// Everything the client needs to reach one bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveServerConfig {
    pub homeserver_url: String,
    pub rpc_url: String,
    pub ws_url: String,
    pub push_gateway_url: String,
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub source: ConfigSource,
    /// Unix seconds after which this config is no longer valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Identity of the bridge this config points at, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_id: Option<String>,
}

impl Default for ActiveServerConfig {
    fn default() -> Self {
        Self {
            homeserver_url: DEFAULT_HOMESERVER_URL.to_string(),
            rpc_url: DEFAULT_RPC_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            push_gateway_url: DEFAULT_PUSH_GATEWAY_URL.to_string(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            region: None,
            source: ConfigSource::Default,
            expires_at: None,
            bridge_id: None,
        }
    }
}

impl ActiveServerConfig {
    /// Builds a `Manual` config from a candidate the user picked.
    ///
    /// Homeserver and push gateway fall back to the bridge's own base URL
    /// when the advertisement does not name them.
    pub fn from_candidate(candidate: &DiscoveredCandidate, bridge_id: impl Into<String>) -> Self {
        let base = candidate.base_url();
        Self {
            homeserver_url: candidate
                .matrix_homeserver()
                .map(str::to_string)
                .unwrap_or_else(|| base.clone()),
            rpc_url: candidate.rpc_url(),
            ws_url: candidate.ws_url(),
            push_gateway_url: candidate
                .push_gateway()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{base}/_matrix/push/v1/notify")),
            server_name: candidate.name.clone(),
            region: None,
            source: ConfigSource::Manual,
            expires_at: None,
            bridge_id: Some(bridge_id.into()),
        }
    }

    /// `Default` never expires; everything else expires once `now` reaches
    /// `expires_at`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.source != ConfigSource::Default && self.expires_at.is_some_and(|t| now >= t)
    }

    /// Whether `incoming` may replace `self` without an explicit override.
    pub fn may_be_replaced_by(&self, incoming: ConfigSource) -> bool {
        incoming >= self.source
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_source_precedence_order() {
        assert!(ConfigSource::SignedUrl > ConfigSource::Manual);
        assert!(ConfigSource::Manual > ConfigSource::Cached);
        assert!(ConfigSource::Cached > ConfigSource::Default);
    }

    #[test]
    fn test_lower_source_may_not_replace_higher() {
        let mut cfg = ActiveServerConfig::default();
        cfg.source = ConfigSource::Manual;

        assert!(!cfg.may_be_replaced_by(ConfigSource::Cached));
        assert!(!cfg.may_be_replaced_by(ConfigSource::Default));
        assert!(cfg.may_be_replaced_by(ConfigSource::Manual));
        assert!(cfg.may_be_replaced_by(ConfigSource::SignedUrl));
    }

    #[test]
    fn test_expired_cached_config_is_expired() {
        // Arrange
        let cfg = ActiveServerConfig {
            source: ConfigSource::Cached,
            expires_at: Some(1_000),
            ..ActiveServerConfig::default()
        };

        // Act / Assert
        assert!(cfg.is_expired(1_000));
        assert!(cfg.is_expired(2_000));
        assert!(!cfg.is_expired(999));
    }

    #[test]
    fn test_default_config_never_expires() {
        let cfg = ActiveServerConfig {
            expires_at: Some(1),
            ..ActiveServerConfig::default()
        };
        assert!(!cfg.is_expired(u64::MAX));
    }

    #[test]
    fn test_config_without_expiry_never_expires() {
        let cfg = ActiveServerConfig {
            source: ConfigSource::Manual,
            ..ActiveServerConfig::default()
        };
        assert!(!cfg.is_expired(u64::MAX));
    }

    #[test]
    fn test_from_candidate_uses_advertised_urls() {
        // Arrange
        let mut txt = BTreeMap::new();
        txt.insert("matrix_homeserver".to_string(), "https://matrix.home".to_string());
        let candidate =
            DiscoveredCandidate::new("den-bridge", "192.168.1.5", Vec::new(), 8443, txt);

        // Act
        let cfg = ActiveServerConfig::from_candidate(&candidate, "bridge-1");

        // Assert
        assert_eq!(cfg.source, ConfigSource::Manual);
        assert_eq!(cfg.homeserver_url, "https://matrix.home");
        assert_eq!(cfg.rpc_url, "https://192.168.1.5:8443/api");
        assert_eq!(cfg.ws_url, "wss://192.168.1.5:8443/ws");
        assert_eq!(
            cfg.push_gateway_url,
            "https://192.168.1.5:8443/_matrix/push/v1/notify"
        );
        assert_eq!(cfg.server_name, "den-bridge");
        assert_eq!(cfg.bridge_id.as_deref(), Some("bridge-1"));
    }

    #[test]
    fn test_source_serializes_snake_case() {
        let json = serde_json::to_string(&ConfigSource::SignedUrl).unwrap();
        assert_eq!(json, "\"signed_url\"");
        assert_eq!(ConfigSource::SignedUrl.to_string(), "signed_url");
    }
}
