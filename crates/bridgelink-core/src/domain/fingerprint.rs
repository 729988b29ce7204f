//! Certificate fingerprints used for pinning.
//!
//! A fingerprint is the SHA-256 digest of the bridge's leaf certificate in
//! DER form.  Bridges and users write it in several ways, so parsing accepts:
//!
//! - `sha256:3f9a…` (canonical, also what [`Fingerprint`]'s `Display` prints)
//! - `3f9a…` (bare hex)
//! - `3F:9A:…` (colon-separated, as shown by most certificate viewers)
//!
//! Comparison is on the decoded bytes, so case and separators never matter.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

const PREFIX: &str = "sha256:";
const DIGEST_LEN: usize = 32;

/// Error returned when a fingerprint string cannot be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("fingerprint is not valid hex: {0}")]
    InvalidHex(String),

    #[error("fingerprint must be {DIGEST_LEN} bytes, got {0}")]
    WrongLength(usize),
}

/// SHA-256 digest of a certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; DIGEST_LEN]);

impl Fingerprint {
    /// Computes the fingerprint of a DER-encoded certificate.
    pub fn of_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lower-case hex without prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex digits, handy for log lines and UI summaries.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let has_prefix = trimmed
            .get(..PREFIX.len())
            .is_some_and(|p| p.eq_ignore_ascii_case(PREFIX));
        let body = if has_prefix {
            &trimmed[PREFIX.len()..]
        } else {
            trimmed
        };
        let compact: String = body.chars().filter(|c| *c != ':').collect();

        let decoded =
            hex::decode(&compact).map_err(|e| FingerprintError::InvalidHex(e.to_string()))?;
        let bytes: [u8; DIGEST_LEN] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| FingerprintError::WrongLength(decoded.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({PREFIX}{}…)", self.short())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
