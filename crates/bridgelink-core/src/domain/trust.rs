//! Trust-on-first-use records.
//!
//! # State machine
//!
//! ```text
//!            first user-confirmed connection
//! Unknown ──────────────────────────────────────►  Trusted
//!                                                   │   ▲
//!                           same fingerprint:       │   │ re-trust
//!                           last_seen advances      │   │ (explicit)
//!                                                   ▼   │
//!                       different fingerprint ──►  IdentityConflict
//!                                                   │
//!                                                   └─ reject: stays in conflict
//! ```
//!
//! A record in conflict keeps the *originally trusted* fingerprint in
//! [`TrustRecord::fingerprint`] and the new, unconfirmed one in
//! [`TrustRecord::conflicting_fingerprint`].  Nothing short of an explicit
//! re-trust ever moves the new key into `fingerprint`.

use serde::{Deserialize, Serialize};

use crate::domain::fingerprint::Fingerprint;

/// Persistent identity of one bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub bridge_id: String,
    /// The pinned certificate fingerprint.
    pub fingerprint: Fingerprint,
    pub server_name: String,
    /// Unix seconds when the user first confirmed this bridge.
    pub trusted_at: u64,
    /// Unix seconds of the last matching contact.
    pub last_seen: u64,
    /// Fingerprint presented by a later contact that did not match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicting_fingerprint: Option<Fingerprint>,
}

/// What the store knows about a bridge id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustStatus {
    Unknown,
    Trusted(TrustRecord),
    /// The bridge presented a key different from the pinned one.  All
    /// traffic to it must stop until the user resolves the conflict.
    IdentityConflict {
        record: TrustRecord,
        presented: Fingerprint,
    },
}

impl TrustStatus {
    pub fn is_trusted(&self) -> bool {
        matches!(self, TrustStatus::Trusted(_))
    }

    pub fn record(&self) -> Option<&TrustRecord> {
        match self {
            TrustStatus::Unknown => None,
            TrustStatus::Trusted(record) | TrustStatus::IdentityConflict { record, .. } => {
                Some(record)
            }
        }
    }
}

/// Result of comparing a presented fingerprint with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Same key; `last_seen` was advanced.
    Matched,
    /// Different key; the record is now in conflict.
    Conflict,
    /// The record was already in conflict; nothing changed.
    StillInConflict,
}

impl TrustRecord {
    pub fn new(
        bridge_id: impl Into<String>,
        fingerprint: Fingerprint,
        server_name: impl Into<String>,
        now: u64,
    ) -> Self {
        Self {
            bridge_id: bridge_id.into(),
            fingerprint,
            server_name: server_name.into(),
            trusted_at: now,
            last_seen: now,
            conflicting_fingerprint: None,
        }
    }

    pub fn in_conflict(&self) -> bool {
        self.conflicting_fingerprint.is_some()
    }

    pub fn status(&self) -> TrustStatus {
        match self.conflicting_fingerprint {
            Some(presented) => TrustStatus::IdentityConflict {
                record: self.clone(),
                presented,
            },
            None => TrustStatus::Trusted(self.clone()),
        }
    }

    /// Applies a contact presenting `presented` at time `now`.
    ///
    /// A record already in conflict is left untouched: neither the old nor
    /// the new key may silently clear the conflict.
    pub fn observe(&mut self, presented: Fingerprint, now: u64) -> Observation {
        if self.in_conflict() {
            return Observation::StillInConflict;
        }
        if presented == self.fingerprint {
            self.last_seen = self.last_seen.max(now);
            Observation::Matched
        } else {
            self.conflicting_fingerprint = Some(presented);
            Observation::Conflict
        }
    }

    /// Accepts the conflicting key as the new pinned identity.
    ///
    /// Returns `false` when there was no conflict to resolve.
    pub fn retrust(&mut self, now: u64) -> bool {
        match self.conflicting_fingerprint.take() {
            Some(new_key) => {
                self.fingerprint = new_key;
                self.trusted_at = now;
                self.last_seen = now;
                true
            }
            None => false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
