//! Signed provisioning links.
//!
//! A bridge that is already trusted can push a new server configuration to
//! the companion device as a deep link (usually rendered as a QR code):
//!
//! ```text
//! armorclaw://config?d=<hex(json)>
//! ```
//!
//! The JSON is the [`ProvisionedConfig`] fields plus a `signature` of the
//! form `hmac-sha256:<hex>`.  The MAC is computed over the canonical JSON of
//! the config *without* the signature, keyed by the provisioning secret that
//! was exchanged with that bridge during pairing.  A valid MAC therefore
//! proves the link came from the bridge we already trust.
//!
//! The bridge's encoder escapes `<`, `>`, `&`, U+2028 and U+2029 inside
//! strings as `\uXXXX`, so the canonical bytes are produced the same way.

use std::io;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;
use sha2::Sha256;
use thiserror::Error;

use crate::domain::server_config::{ActiveServerConfig, ConfigSource};

pub const DEEP_LINK_PREFIX: &str = "armorclaw://config?d=";
pub const SIGNATURE_PREFIX: &str = "hmac-sha256:";

type HmacSha256 = Hmac<Sha256>;

/// Errors produced while decoding or verifying a provisioning link.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignedConfigError {
    #[error("not a provisioning link")]
    NotAProvisioningLink,

    #[error("link payload is not valid hex")]
    InvalidEncoding,

    #[error("link payload is not a valid config: {0}")]
    InvalidPayload(String),

    #[error("signature is missing or malformed")]
    MalformedSignature,

    #[error("signature does not match")]
    BadSignature,

    #[error("link expired at {expires_at}")]
    Expired { expires_at: u64 },
}

/// Configuration fields carried by a provisioning link.
///
/// Field order is the canonical signing order; optional fields are omitted
/// when empty so the signed bytes match what the bridge produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedConfig {
    pub version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_id: String,
    pub matrix_homeserver: String,
    pub rpc_url: String,
    pub ws_url: String,
    pub push_gateway: String,
    pub server_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bridge_public_key: String,
    /// Unix seconds after which the link itself may no longer be used.
    pub expires_at: u64,
}

/// A decoded, not yet verified, provisioning link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedConfigPayload {
    #[serde(flatten)]
    pub config: ProvisionedConfig,
    pub signature: String,
}

impl SignedConfigPayload {
    /// Decodes an `armorclaw://config?d=…` link.
    pub fn from_deep_link(link: &str) -> Result<Self, SignedConfigError> {
        let encoded = link
            .trim()
            .strip_prefix(DEEP_LINK_PREFIX)
            .ok_or(SignedConfigError::NotAProvisioningLink)?;
        // Tolerate further query parameters after the payload.
        let encoded = encoded.split('&').next().unwrap_or_default();
        let bytes = hex::decode(encoded).map_err(|_| SignedConfigError::InvalidEncoding)?;
        serde_json::from_slice(&bytes).map_err(|e| SignedConfigError::InvalidPayload(e.to_string()))
    }

    /// Encodes this payload as a deep link.
    pub fn to_deep_link(&self) -> Result<String, SignedConfigError> {
        let json =
            serde_json::to_vec(self).map_err(|e| SignedConfigError::InvalidPayload(e.to_string()))?;
        Ok(format!("{DEEP_LINK_PREFIX}{}", hex::encode(json)))
    }

    /// Signs `config` with `secret`, producing a payload the verifier accepts.
    pub fn sign(config: ProvisionedConfig, secret: &[u8]) -> Result<Self, SignedConfigError> {
        let mac = compute_mac(&config, secret)?;
        Ok(Self {
            config,
            signature: format!("{SIGNATURE_PREFIX}{}", hex::encode(mac)),
        })
    }

    /// Checks the MAC in constant time and rejects expired links.
    pub fn verify(&self, secret: &[u8], now: u64) -> Result<&ProvisionedConfig, SignedConfigError> {
        let hex_sig = self
            .signature
            .strip_prefix(SIGNATURE_PREFIX)
            .ok_or(SignedConfigError::MalformedSignature)?;
        let provided = hex::decode(hex_sig).map_err(|_| SignedConfigError::MalformedSignature)?;

        let canonical = canonical_json(&self.config)?;
        let mut mac = new_mac(secret)?;
        mac.update(&canonical);
        mac.verify_slice(&provided)
            .map_err(|_| SignedConfigError::BadSignature)?;

        if now >= self.config.expires_at {
            return Err(SignedConfigError::Expired {
                expires_at: self.config.expires_at,
            });
        }
        Ok(&self.config)
    }
}

impl ProvisionedConfig {
    /// Converts a verified payload into the active config it describes.
    ///
    /// The link's own `expires_at` bounds when the link may be redeemed, not
    /// how long the resulting configuration stays valid.
    pub fn into_active(self, bridge_id: Option<String>) -> ActiveServerConfig {
        ActiveServerConfig {
            homeserver_url: self.matrix_homeserver,
            rpc_url: self.rpc_url,
            ws_url: self.ws_url,
            push_gateway_url: self.push_gateway,
            server_name: self.server_name,
            region: (!self.region.is_empty()).then_some(self.region),
            source: ConfigSource::SignedUrl,
            expires_at: None,
            bridge_id,
        }
    }
}

fn new_mac(secret: &[u8]) -> Result<HmacSha256, SignedConfigError> {
    // HMAC accepts keys of any length; the error arm is unreachable in practice.
    HmacSha256::new_from_slice(secret).map_err(|_| SignedConfigError::MalformedSignature)
}

/// Compact JSON with HTML-sensitive characters escaped.
struct HtmlSafeFormatter;

impl Formatter for HtmlSafeFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (i, ch) in fragment.char_indices() {
            let escaped = match ch {
                '<' => "\\u003c",
                '>' => "\\u003e",
                '&' => "\\u0026",
                '\u{2028}' => "\\u2028",
                '\u{2029}' => "\\u2029",
                _ => continue,
            };
            writer.write_all(&fragment.as_bytes()[start..i])?;
            writer.write_all(escaped.as_bytes())?;
            start = i + ch.len_utf8();
        }
        writer.write_all(&fragment.as_bytes()[start..])
    }
}

/// The exact bytes the MAC covers.
fn canonical_json(config: &ProvisionedConfig) -> Result<Vec<u8>, SignedConfigError> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, HtmlSafeFormatter);
    config
        .serialize(&mut ser)
        .map_err(|e| SignedConfigError::InvalidPayload(e.to_string()))?;
    Ok(out)
}

fn compute_mac(config: &ProvisionedConfig, secret: &[u8]) -> Result<Vec<u8>, SignedConfigError> {
    let canonical = canonical_json(config)?;
    let mut mac = new_mac(secret)?;
    mac.update(&canonical);
    Ok(mac.finalize().into_bytes().to_vec())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"provisioning-secret";

    fn sample() -> ProvisionedConfig {
        ProvisionedConfig {
            version: 1,
            token_id: "tok-1".into(),
            matrix_homeserver: "https://matrix.home".into(),
            rpc_url: "https://192.168.1.5:8443/api".into(),
            ws_url: "wss://192.168.1.5:8443/ws".into(),
            push_gateway: "https://192.168.1.5:8443/push".into(),
            server_name: "home".into(),
            region: String::new(),
            bridge_public_key: String::new(),
            expires_at: 2_000,
        }
    }

    #[test]
    fn test_signed_link_verifies_with_same_secret() {
        // Arrange
        let link = SignedConfigPayload::sign(sample(), SECRET)
            .unwrap()
            .to_deep_link()
            .unwrap();

        // Act
        let payload = SignedConfigPayload::from_deep_link(&link).unwrap();
        let verified = payload.verify(SECRET, 1_000);

        // Assert
        assert_eq!(verified, Ok(&sample()));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let payload = SignedConfigPayload::sign(sample(), SECRET).unwrap();
        assert_eq!(
            payload.verify(b"other-secret", 1_000),
            Err(SignedConfigError::BadSignature)
        );
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        // Arrange
        let mut payload = SignedConfigPayload::sign(sample(), SECRET).unwrap();

        // Act: an attacker redirects the RPC endpoint.
        payload.config.rpc_url = "https://10.0.0.66:8443/api".into();

        // Assert
        assert_eq!(payload.verify(SECRET, 1_000), Err(SignedConfigError::BadSignature));
    }

    #[test]
    fn test_expired_link_is_rejected() {
        let payload = SignedConfigPayload::sign(sample(), SECRET).unwrap();
        assert_eq!(
            payload.verify(SECRET, 2_000),
            Err(SignedConfigError::Expired { expires_at: 2_000 })
        );
    }

    #[test]
    fn test_signature_without_prefix_is_malformed() {
        let mut payload = SignedConfigPayload::sign(sample(), SECRET).unwrap();
        payload.signature = payload.signature.replace(SIGNATURE_PREFIX, "");
        assert_eq!(
            payload.verify(SECRET, 1_000),
            Err(SignedConfigError::MalformedSignature)
        );
    }

    #[test]
    fn test_non_provisioning_links_are_rejected() {
        assert_eq!(
            SignedConfigPayload::from_deep_link("armorclaw://invite?code=abc"),
            Err(SignedConfigError::NotAProvisioningLink)
        );
        assert_eq!(
            SignedConfigPayload::from_deep_link("armorclaw://config?d=zz"),
            Err(SignedConfigError::InvalidEncoding)
        );
    }

    #[test]
    fn test_empty_optional_fields_are_omitted_from_canonical_json() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(!json.contains("region"));
        assert!(!json.contains("bridge_public_key"));
        assert!(json.contains("\"token_id\":\"tok-1\""));
    }

    #[test]
    fn test_canonical_json_escapes_html_characters() {
        let config = ProvisionedConfig {
            rpc_url: "https://bridge.home/api?a=1&b=<2>".into(),
            ..sample()
        };

        let canonical = String::from_utf8(canonical_json(&config).unwrap()).unwrap();

        assert!(canonical.contains(r#""rpc_url":"https://bridge.home/api?a=1\u0026b=\u003c2\u003e""#));
        assert!(!canonical.contains('&'));
    }

    #[test]
    fn test_link_signed_over_escaped_json_verifies() {
        // Arrange: sign the bytes exactly as the bridge's encoder writes them.
        let config = ProvisionedConfig {
            push_gateway: "https://push.home/notify?app=bridge&v=1".into(),
            ..sample()
        };
        let bridge_bytes = serde_json::to_string(&config)
            .unwrap()
            .replace('&', "\\u0026");
        let mut mac = HmacSha256::new_from_slice(SECRET).unwrap();
        mac.update(bridge_bytes.as_bytes());
        let payload = SignedConfigPayload {
            config: config.clone(),
            signature: format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())),
        };
        let link = payload.to_deep_link().unwrap();

        // Act
        let decoded = SignedConfigPayload::from_deep_link(&link).unwrap();

        // Assert
        assert_eq!(decoded.verify(SECRET, 1_000), Ok(&config));
    }

    #[test]
    fn test_into_active_marks_signed_source() {
        let cfg = sample().into_active(Some("bridge-1".into()));
        assert_eq!(cfg.source, ConfigSource::SignedUrl);
        assert_eq!(cfg.region, None);
        assert_eq!(cfg.expires_at, None);
        assert_eq!(cfg.server_name, "home");
    }
}
