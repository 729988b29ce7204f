//! TrustStore: the durable TOFU table plus per-bridge provisioning secrets.
//!
//! The store answers one question on every connection: "is the certificate
//! this bridge just presented the one the user confirmed before?"
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//! Unknown ──(user confirms first contact)──► Trusted
//! Trusted ──(same fingerprint)──────────────► Trusted, last_seen advances
//! Trusted ──(different fingerprint)─────────► IdentityConflict
//! IdentityConflict ──(user re-trusts)───────► Trusted with the new key
//! IdentityConflict ──(user rejects)─────────► IdentityConflict
//! IdentityConflict ──(user forgets)─────────► Unknown
//! ```
//!
//! A conflict is never resolved automatically.  Entering it publishes a
//! [`LinkEvent::IdentityConflict`] so the UI can block traffic and ask.
//!
//! # Concurrency
//!
//! Every mutation runs read-modify-write under one async mutex, and its
//! event is sent while the mutex is still held, so subscribers observe
//! events in the same order the store committed them.

use std::sync::Arc;

use bridgelink_core::domain::trust::Observation;
use bridgelink_core::{Clock, Fingerprint, LinkEvent, TrustRecord, TrustStatus};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::infrastructure::storage::{
    get_json, put_json, KeyValueStore, StorageError, PROVISIONING_PREFIX, TRUST_PREFIX,
};

#[derive(Debug, Error)]
pub enum TrustError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("no trust record for bridge {0}")]
    UnknownBridge(String),

    #[error("bridge {0} has no pending identity conflict")]
    NoConflict(String),

    /// The bridge presented a key other than the pinned one.
    #[error("identity conflict for bridge {bridge_id}: pinned {pinned}, presented {presented}")]
    IdentityConflict {
        bridge_id: String,
        pinned: Fingerprint,
        presented: Fingerprint,
    },

    #[error("stored provisioning secret for bridge {0} is not valid hex")]
    CorruptSecret(String),
}

/// The user's answer to an identity conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Pin the newly presented key.
    Retrust,
    /// Refuse the new key.  The record stays in conflict and keeps blocking.
    Reject,
    /// Refuse the new key and delete the record entirely.
    Forget,
}

pub struct TrustStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
    events: broadcast::Sender<LinkEvent>,
}

fn trust_key(bridge_id: &str) -> String {
    format!("{TRUST_PREFIX}{bridge_id}")
}

fn secret_key(bridge_id: &str) -> String {
    format!("{PROVISIONING_PREFIX}{bridge_id}")
}

impl TrustStore {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<LinkEvent>,
    ) -> Self {
        Self {
            store,
            clock,
            lock: Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    fn load(&self, bridge_id: &str) -> Result<Option<TrustRecord>, TrustError> {
        Ok(get_json(self.store.as_ref(), &trust_key(bridge_id))?)
    }

    fn save(&self, record: &TrustRecord) -> Result<(), TrustError> {
        Ok(put_json(self.store.as_ref(), &trust_key(&record.bridge_id), record)?)
    }

    /// Read-only view of what is known about `bridge_id`.
    pub async fn status(&self, bridge_id: &str) -> Result<TrustStatus, TrustError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load(bridge_id)?
            .map(|r| r.status())
            .unwrap_or(TrustStatus::Unknown))
    }

    /// Compares the fingerprint presented on a connection with the pinned one.
    ///
    /// `Unknown` bridges are left untouched (first contact needs the user).
    /// A match advances `last_seen`; a mismatch moves the record into
    /// conflict and publishes the alert.
    pub async fn check(
        &self,
        bridge_id: &str,
        presented: Fingerprint,
    ) -> Result<TrustStatus, TrustError> {
        let _guard = self.lock.lock().await;
        let Some(mut record) = self.load(bridge_id)? else {
            debug!(bridge_id, fingerprint = %presented.short(), "no trust record");
            return Ok(TrustStatus::Unknown);
        };
        self.observe_locked(&mut record, presented)?;
        Ok(record.status())
    }

    /// Writes `fingerprint` for `bridge_id`.
    ///
    /// Creates the record when none exists.  An existing record is never
    /// overwritten: the same key refreshes it, a different key puts it into
    /// conflict.  Returns the resulting status.
    pub async fn record(
        &self,
        bridge_id: &str,
        fingerprint: Fingerprint,
        server_name: &str,
    ) -> Result<TrustStatus, TrustError> {
        let _guard = self.lock.lock().await;
        match self.load(bridge_id)? {
            Some(mut record) => {
                self.observe_locked(&mut record, fingerprint)?;
                Ok(record.status())
            }
            None => {
                let record =
                    TrustRecord::new(bridge_id, fingerprint, server_name, self.clock.now_unix());
                self.save(&record)?;
                info!(bridge_id, fingerprint = %fingerprint, "bridge trusted on first use");
                Ok(TrustStatus::Trusted(record))
            }
        }
    }

    /// The user-confirmed first contact.
    ///
    /// Succeeds when the bridge ends up trusted with `fingerprint`; fails with
    /// [`TrustError::IdentityConflict`] when a different key is already pinned.
    pub async fn trust_first_use(
        &self,
        bridge_id: &str,
        fingerprint: Fingerprint,
        server_name: &str,
    ) -> Result<TrustRecord, TrustError> {
        match self.record(bridge_id, fingerprint, server_name).await? {
            TrustStatus::Trusted(record) => Ok(record),
            TrustStatus::IdentityConflict { record, presented } => {
                Err(TrustError::IdentityConflict {
                    bridge_id: record.bridge_id,
                    pinned: record.fingerprint,
                    presented,
                })
            }
            TrustStatus::Unknown => Err(TrustError::UnknownBridge(bridge_id.to_string())),
        }
    }

    fn observe_locked(
        &self,
        record: &mut TrustRecord,
        presented: Fingerprint,
    ) -> Result<(), TrustError> {
        match record.observe(presented, self.clock.now_unix()) {
            Observation::Matched => {
                self.save(record)?;
                debug!(bridge_id = %record.bridge_id, "pinned fingerprint matched");
            }
            Observation::Conflict => {
                self.save(record)?;
                error!(
                    bridge_id = %record.bridge_id,
                    pinned = %record.fingerprint,
                    presented = %presented,
                    "bridge presented a different certificate; possible active attack"
                );
                // No subscribers is fine; the record itself carries the conflict.
                let _ = self.events.send(LinkEvent::IdentityConflict {
                    bridge_id: record.bridge_id.clone(),
                    previous_fingerprint: record.fingerprint,
                    new_fingerprint: presented,
                });
            }
            Observation::StillInConflict => {
                warn!(bridge_id = %record.bridge_id, "bridge is in unresolved identity conflict");
            }
        }
        Ok(())
    }

    /// Applies the user's decision on a pending conflict.
    pub async fn resolve_conflict(
        &self,
        bridge_id: &str,
        resolution: ConflictResolution,
    ) -> Result<TrustStatus, TrustError> {
        let _guard = self.lock.lock().await;
        let mut record = self
            .load(bridge_id)?
            .ok_or_else(|| TrustError::UnknownBridge(bridge_id.to_string()))?;
        if !record.in_conflict() {
            return Err(TrustError::NoConflict(bridge_id.to_string()));
        }

        match resolution {
            ConflictResolution::Retrust => {
                record.retrust(self.clock.now_unix());
                self.save(&record)?;
                warn!(bridge_id, fingerprint = %record.fingerprint, "user re-trusted bridge with new key");
                Ok(record.status())
            }
            ConflictResolution::Reject => {
                info!(bridge_id, "user rejected new bridge key; traffic stays blocked");
                Ok(record.status())
            }
            ConflictResolution::Forget => {
                self.remove_locked(bridge_id)?;
                info!(bridge_id, "user rejected new bridge key and removed the record");
                Ok(TrustStatus::Unknown)
            }
        }
    }

    /// Deletes the trust record and provisioning secret for `bridge_id`.
    ///
    /// Returns `false` when nothing was stored.
    pub async fn remove(&self, bridge_id: &str) -> Result<bool, TrustError> {
        let _guard = self.lock.lock().await;
        let existed = self.load(bridge_id)?.is_some();
        self.remove_locked(bridge_id)?;
        if existed {
            info!(bridge_id, "trust record removed");
        }
        Ok(existed)
    }

    fn remove_locked(&self, bridge_id: &str) -> Result<(), TrustError> {
        self.store.remove(&trust_key(bridge_id))?;
        self.store.remove(&secret_key(bridge_id))?;
        Ok(())
    }

    /// All records, ordered by bridge id.
    pub async fn list(&self) -> Result<Vec<TrustRecord>, TrustError> {
        let _guard = self.lock.lock().await;
        let mut records = Vec::new();
        for key in self.store.keys_with_prefix(TRUST_PREFIX)? {
            if let Some(record) = get_json::<TrustRecord>(self.store.as_ref(), &key)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.bridge_id.cmp(&b.bridge_id));
        Ok(records)
    }

    pub async fn set_provisioning_secret(
        &self,
        bridge_id: &str,
        secret: &[u8],
    ) -> Result<(), TrustError> {
        let _guard = self.lock.lock().await;
        self.store.put(&secret_key(bridge_id), &hex::encode(secret))?;
        debug!(bridge_id, "provisioning secret stored");
        Ok(())
    }

    pub async fn provisioning_secret(&self, bridge_id: &str) -> Result<Option<Vec<u8>>, TrustError> {
        let _guard = self.lock.lock().await;
        match self.store.get(&secret_key(bridge_id))? {
            Some(raw) => hex::decode(raw)
                .map(Some)
                .map_err(|_| TrustError::CorruptSecret(bridge_id.to_string())),
            None => Ok(None),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::{MemoryStore, MockKeyValueStore};
    use bridgelink_core::ManualClock;

    fn make_store() -> (TrustStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let (tx, _) = broadcast::channel(16);
        let store = TrustStore::new(Arc::new(MemoryStore::new()), clock.clone(), tx);
        (store, clock)
    }

    fn fp(tag: &[u8]) -> Fingerprint {
        Fingerprint::of_der(tag)
    }

    #[tokio::test]
    async fn test_unknown_bridge_reports_unknown() {
        let (store, _) = make_store();
        assert_eq!(store.status("b1").await.unwrap(), TrustStatus::Unknown);
        assert_eq!(store.check("b1", fp(b"x")).await.unwrap(), TrustStatus::Unknown);
    }

    #[tokio::test]
    async fn test_first_use_then_matching_check_advances_last_seen() {
        // Arrange
        let (store, clock) = make_store();
        store.trust_first_use("b1", fp(b"cert"), "living-room").await.unwrap();
        clock.advance(60);

        // Act
        let status = store.check("b1", fp(b"cert")).await.unwrap();

        // Assert
        let record = status.record().unwrap();
        assert!(status.is_trusted());
        assert_eq!(record.trusted_at, 1_000);
        assert_eq!(record.last_seen, 1_060);
    }

    #[tokio::test]
    async fn test_different_key_yields_conflict_and_event() {
        // Arrange
        let (store, _) = make_store();
        let mut events = store.subscribe();
        store.trust_first_use("b1", fp(b"cert"), "living-room").await.unwrap();

        // Act
        let status = store.check("b1", fp(b"evil")).await.unwrap();

        // Assert
        match status {
            TrustStatus::IdentityConflict { record, presented } => {
                assert_eq!(record.fingerprint, fp(b"cert"));
                assert_eq!(presented, fp(b"evil"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        let event = events.try_recv().unwrap();
        assert!(event.is_security_alert());
    }

    #[tokio::test]
    async fn test_record_with_different_key_does_not_overwrite() {
        let (store, _) = make_store();
        store.record("b1", fp(b"cert"), "a").await.unwrap();

        store.record("b1", fp(b"evil"), "a").await.unwrap();

        let status = store.status("b1").await.unwrap();
        assert_eq!(status.record().unwrap().fingerprint, fp(b"cert"));
        assert!(matches!(status, TrustStatus::IdentityConflict { .. }));
    }

    #[tokio::test]
    async fn test_trust_first_use_against_pinned_key_is_error() {
        let (store, _) = make_store();
        store.trust_first_use("b1", fp(b"cert"), "a").await.unwrap();

        let result = store.trust_first_use("b1", fp(b"other"), "a").await;

        assert!(matches!(result, Err(TrustError::IdentityConflict { .. })));
    }

    #[tokio::test]
    async fn test_conflict_is_sticky_even_for_original_key() {
        let (store, _) = make_store();
        store.trust_first_use("b1", fp(b"cert"), "a").await.unwrap();
        store.check("b1", fp(b"evil")).await.unwrap();

        let status = store.check("b1", fp(b"cert")).await.unwrap();

        assert!(matches!(status, TrustStatus::IdentityConflict { .. }));
    }

    #[tokio::test]
    async fn test_retrust_pins_new_key() {
        // Arrange
        let (store, _) = make_store();
        store.trust_first_use("b1", fp(b"cert"), "a").await.unwrap();
        store.check("b1", fp(b"rotated")).await.unwrap();

        // Act
        let status = store
            .resolve_conflict("b1", ConflictResolution::Retrust)
            .await
            .unwrap();

        // Assert
        assert!(status.is_trusted());
        assert_eq!(status.record().unwrap().fingerprint, fp(b"rotated"));
    }

    #[tokio::test]
    async fn test_reject_keeps_conflict() {
        let (store, _) = make_store();
        store.trust_first_use("b1", fp(b"cert"), "a").await.unwrap();
        store.check("b1", fp(b"evil")).await.unwrap();

        let status = store
            .resolve_conflict("b1", ConflictResolution::Reject)
            .await
            .unwrap();

        assert!(matches!(status, TrustStatus::IdentityConflict { .. }));
    }

    #[tokio::test]
    async fn test_forget_deletes_record_and_secret() {
        let (store, _) = make_store();
        store.trust_first_use("b1", fp(b"cert"), "a").await.unwrap();
        store.set_provisioning_secret("b1", b"s3cret").await.unwrap();
        store.check("b1", fp(b"evil")).await.unwrap();

        store
            .resolve_conflict("b1", ConflictResolution::Forget)
            .await
            .unwrap();

        assert_eq!(store.status("b1").await.unwrap(), TrustStatus::Unknown);
        assert_eq!(store.provisioning_secret("b1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_resolve_without_conflict_is_error() {
        let (store, _) = make_store();
        store.trust_first_use("b1", fp(b"cert"), "a").await.unwrap();

        let result = store.resolve_conflict("b1", ConflictResolution::Retrust).await;

        assert!(matches!(result, Err(TrustError::NoConflict(_))));
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_remove_reports_existence() {
        let (store, _) = make_store();
        store.trust_first_use("b2", fp(b"2"), "two").await.unwrap();
        store.trust_first_use("b1", fp(b"1"), "one").await.unwrap();

        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|r| r.bridge_id).collect();

        assert_eq!(ids, vec!["b1".to_string(), "b2".to_string()]);
        assert!(store.remove("b1").await.unwrap());
        assert!(!store.remove("b1").await.unwrap());
    }

    #[tokio::test]
    async fn test_provisioning_secret_round_trips() {
        let (store, _) = make_store();
        store.set_provisioning_secret("b1", &[0x00, 0xab, 0xff]).await.unwrap();
        assert_eq!(
            store.provisioning_secret("b1").await.unwrap(),
            Some(vec![0x00, 0xab, 0xff])
        );
    }

    #[tokio::test]
    async fn test_storage_failure_propagates_and_emits_nothing() {
        // Arrange: existing record, but every write fails.
        let existing = TrustRecord::new("b1", fp(b"cert"), "a", 1);
        let existing_json = serde_json::to_string(&existing).unwrap();
        let mut kv = MockKeyValueStore::new();
        kv.expect_get().returning(move |_| Ok(Some(existing_json.clone())));
        kv.expect_put().returning(|key, _| {
            Err(StorageError::Corrupt {
                key: key.to_string(),
                message: "disk full".into(),
            })
        });
        let (tx, mut rx) = broadcast::channel(4);
        let store = TrustStore::new(Arc::new(kv), Arc::new(ManualClock::new(5)), tx);

        // Act
        let result = store.check("b1", fp(b"evil")).await;

        // Assert
        assert!(matches!(result, Err(TrustError::Storage(_))));
        assert!(rx.try_recv().is_err());
    }
}
