//! Outward events consumed by the UI layer.

use serde::{Deserialize, Serialize};

use crate::domain::candidate::DiscoveredCandidate;
use crate::domain::fingerprint::Fingerprint;
use crate::domain::server_config::{ActiveServerConfig, ConfigSource};

/// A committed replacement of the active server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub previous: ActiveServerConfig,
    pub current: ActiveServerConfig,
    pub source: ConfigSource,
}

/// Everything the secure-link subsystem tells the outside world about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LinkEvent {
    /// The user picked a discovered bridge.
    CandidateSelected(DiscoveredCandidate),
    /// The active server configuration was replaced.
    ConfigChanged(ConfigChange),
    /// A known bridge presented a different certificate.  The UI must block
    /// further traffic to `bridge_id` until the user resolves it.
    IdentityConflict {
        bridge_id: String,
        previous_fingerprint: Fingerprint,
        new_fingerprint: Fingerprint,
    },
}

impl LinkEvent {
    /// Security alerts must be shown prominently, never batched or hidden.
    pub fn is_security_alert(&self) -> bool {
        matches!(self, LinkEvent::IdentityConflict { .. })
    }
}
