//! Push-event WebSocket framing.
//!
//! The event channel lives next to the RPC endpoint:
//!
//! ```text
//! https://bridge.local:8443/api   →   wss://bridge.local:8443/ws
//! http://10.0.0.5:8080/api        →   ws://10.0.0.5:8080/ws
//! ```
//!
//! and the first frame the client sends after the upgrade is
//!
//! ```json
//! {"type":"register","payload":{"device_id":"<id>"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const WS_PATH_SUFFIX: &str = "ws";
pub const REGISTER_FRAME_TYPE: &str = "register";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WsUrlError {
    #[error("URL has no scheme: {0}")]
    MissingScheme(String),

    #[error("unsupported scheme {0:?}; expected http or https")]
    UnsupportedScheme(String),

    #[error("URL has no host: {0}")]
    MissingHost(String),
}

/// Derives the event-channel URL from an RPC URL.
///
/// The scheme maps http→ws and https→wss (already-ws URLs pass through), the
/// last path segment is replaced by `ws`, and any query or fragment is
/// dropped.
pub fn derive_ws_url(rpc_url: &str) -> Result<String, WsUrlError> {
    let (scheme, rest) = rpc_url
        .trim()
        .split_once("://")
        .ok_or_else(|| WsUrlError::MissingScheme(rpc_url.to_string()))?;

    let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(WsUrlError::UnsupportedScheme(other.to_string())),
    };

    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    if authority.is_empty() {
        return Err(WsUrlError::MissingHost(rpc_url.to_string()));
    }

    let trimmed = path.trim_end_matches('/');
    let parent = match trimmed.rfind('/') {
        Some(idx) => &trimmed[..idx],
        None => "",
    };

    Ok(format!("{ws_scheme}://{authority}{parent}/{WS_PATH_SUFFIX}"))
}

/// Generic push frame: `{"type": …, "payload": …}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RegisterPayload {
    device_id: String,
}

/// Builds the registration frame text for `device_id`.
pub fn registration_frame(device_id: &str) -> String {
    serde_json::json!({
        "type": REGISTER_FRAME_TYPE,
        "payload": RegisterPayload { device_id: device_id.to_string() },
    })
    .to_string()
}

impl PushFrame {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
