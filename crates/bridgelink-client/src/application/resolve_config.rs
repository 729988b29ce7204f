//! ConfigResolver: owner of the single active server configuration.
//!
//! The resolver is constructed once at startup and passed to whoever needs
//! the config.  It loads the persisted singleton, enforces source precedence
//! on every replacement, and publishes a [`LinkEvent::ConfigChanged`] for
//! each committed change.
//!
//! # Precedence (for beginners)
//!
//! ```text
//! SignedUrl  >  Manual  >  Cached  >  Default
//! ```
//!
//! [`ConfigResolver::apply`] refuses to let a lower source replace a higher
//! one.  [`ConfigResolver::override_with`] and
//! [`ConfigResolver::select_candidate`] are explicit user actions and skip
//! that check.  [`ConfigResolver::reset`] always returns to `Default`.
//!
//! # Atomicity
//!
//! Persist, swap, and notify happen under one async mutex, so no subscriber
//! sees an event for a config that was not stored, and no two changes are
//! reported out of order.

use std::sync::Arc;

use bridgelink_core::domain::provisioning::{SignedConfigError, SignedConfigPayload};
use bridgelink_core::{
    ActiveServerConfig, Clock, ConfigChange, ConfigSource, DiscoveredCandidate, LinkEvent,
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::application::trust_store::{TrustError, TrustStore};
use crate::infrastructure::storage::{
    get_json, put_json, KeyValueStore, StorageError, ACTIVE_CONFIG_KEY,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error("provisioning link rejected: {0}")]
    Link(#[from] SignedConfigError),

    /// A lower-precedence source tried to replace a higher one.
    #[error("{incoming} config may not replace the active {active} config")]
    Superseded {
        active: ConfigSource,
        incoming: ConfigSource,
    },

    #[error("no bridge to verify the provisioning link against")]
    NoBridge,

    #[error("bridge {0} is not trusted")]
    Untrusted(String),

    #[error("no provisioning secret stored for bridge {0}")]
    NoProvisioningSecret(String),
}

pub struct ConfigResolver {
    store: Arc<dyn KeyValueStore>,
    trust: Arc<TrustStore>,
    clock: Arc<dyn Clock>,
    active: Mutex<ActiveServerConfig>,
    events: broadcast::Sender<LinkEvent>,
}

impl ConfigResolver {
    /// Loads the persisted config.
    ///
    /// Nothing stored means `Default`.  An expired config also means
    /// `Default`, and the stale entry is removed.
    pub fn load(
        store: Arc<dyn KeyValueStore>,
        trust: Arc<TrustStore>,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<LinkEvent>,
    ) -> Result<Self, ConfigError> {
        let now = clock.now_unix();
        let active = match get_json::<ActiveServerConfig>(store.as_ref(), ACTIVE_CONFIG_KEY)? {
            Some(config) if config.is_expired(now) => {
                info!(source = %config.source, expires_at = ?config.expires_at, "stored config expired; using default");
                store.remove(ACTIVE_CONFIG_KEY)?;
                ActiveServerConfig::default()
            }
            Some(config) => {
                debug!(source = %config.source, rpc_url = %config.rpc_url, "loaded stored config");
                config
            }
            None => ActiveServerConfig::default(),
        };

        Ok(Self {
            store,
            trust,
            clock,
            active: Mutex::new(active),
            events,
        })
    }

    pub async fn current(&self) -> ActiveServerConfig {
        self.active.lock().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Replaces the active config if `config.source` ranks at least as high
    /// as the active one.
    pub async fn apply(&self, config: ActiveServerConfig) -> Result<ConfigChange, ConfigError> {
        let mut active = self.active.lock().await;
        if !active.may_be_replaced_by(config.source) {
            warn!(active = %active.source, incoming = %config.source, "config replacement refused");
            return Err(ConfigError::Superseded {
                active: active.source,
                incoming: config.source,
            });
        }
        self.commit_locked(&mut active, config)
    }

    /// Replaces the active config regardless of precedence.
    pub async fn override_with(
        &self,
        config: ActiveServerConfig,
    ) -> Result<ConfigChange, ConfigError> {
        let mut active = self.active.lock().await;
        self.commit_locked(&mut active, config)
    }

    /// Verifies a provisioning deep link and makes it the active config.
    ///
    /// The link is checked against the provisioning secret of `bridge_id`,
    /// or of the bridge the active config points at when `None`.  That
    /// bridge must be trusted and not in conflict.
    pub async fn apply_signed_link(
        &self,
        link: &str,
        bridge_id: Option<&str>,
    ) -> Result<ConfigChange, ConfigError> {
        let payload = SignedConfigPayload::from_deep_link(link)?;

        let bridge_id = match bridge_id {
            Some(id) => id.to_string(),
            None => self
                .current()
                .await
                .bridge_id
                .ok_or(ConfigError::NoBridge)?,
        };
        if !self.trust.status(&bridge_id).await?.is_trusted() {
            return Err(ConfigError::Untrusted(bridge_id));
        }
        let secret = self
            .trust
            .provisioning_secret(&bridge_id)
            .await?
            .ok_or_else(|| ConfigError::NoProvisioningSecret(bridge_id.clone()))?;

        let config = payload
            .verify(&secret, self.clock.now_unix())
            .map_err(|e| {
                warn!(%bridge_id, error = %e, "provisioning link failed verification");
                e
            })?
            .clone()
            .into_active(Some(bridge_id));
        self.apply(config).await
    }

    /// Records the user's pick of a discovered bridge and points the active
    /// config at it.  The instance name is used as the bridge id.
    pub async fn select_candidate(
        &self,
        candidate: &DiscoveredCandidate,
    ) -> Result<ConfigChange, ConfigError> {
        let config = ActiveServerConfig::from_candidate(candidate, candidate.name.clone());
        let mut active = self.active.lock().await;
        let change = self.commit_locked(&mut active, config)?;
        info!(name = %candidate.name, host = %candidate.host, port = candidate.port, "candidate selected");
        let _ = self
            .events
            .send(LinkEvent::CandidateSelected(candidate.clone()));
        Ok(change)
    }

    /// Returns to the built-in default config.
    pub async fn reset(&self) -> Result<ConfigChange, ConfigError> {
        let mut active = self.active.lock().await;
        self.commit_locked(&mut active, ActiveServerConfig::default())
    }

    fn commit_locked(
        &self,
        active: &mut ActiveServerConfig,
        next: ActiveServerConfig,
    ) -> Result<ConfigChange, ConfigError> {
        if next.source == ConfigSource::Default {
            self.store.remove(ACTIVE_CONFIG_KEY)?;
        } else {
            put_json(self.store.as_ref(), ACTIVE_CONFIG_KEY, &next)?;
        }

        let source = next.source;
        let previous = std::mem::replace(active, next);
        let change = ConfigChange {
            previous,
            current: active.clone(),
            source,
        };
        info!(
            from = %change.previous.source,
            to = %source,
            rpc_url = %change.current.rpc_url,
            "active config changed"
        );
        let _ = self.events.send(LinkEvent::ConfigChanged(change.clone()));
        Ok(change)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::{MemoryStore, MockKeyValueStore};
    use bridgelink_core::domain::provisioning::ProvisionedConfig;
    use bridgelink_core::{Fingerprint, ManualClock};
    use std::collections::BTreeMap;

    struct Fixture {
        store: Arc<MemoryStore>,
        trust: Arc<TrustStore>,
        clock: Arc<ManualClock>,
        events: broadcast::Sender<LinkEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let clock = Arc::new(ManualClock::new(10_000));
            let (events, _) = broadcast::channel(16);
            let trust = Arc::new(TrustStore::new(
                Arc::clone(&store) as Arc<dyn KeyValueStore>,
                Arc::clone(&clock) as Arc<dyn Clock>,
                events.clone(),
            ));
            Self {
                store,
                trust,
                clock,
                events,
            }
        }

        fn resolver(&self) -> ConfigResolver {
            ConfigResolver::load(
                Arc::clone(&self.store) as Arc<dyn KeyValueStore>,
                Arc::clone(&self.trust),
                Arc::clone(&self.clock) as Arc<dyn Clock>,
                self.events.clone(),
            )
            .unwrap()
        }
    }

    fn config(source: ConfigSource) -> ActiveServerConfig {
        ActiveServerConfig {
            rpc_url: format!("https://{source}.example:8443/api"),
            source,
            ..ActiveServerConfig::default()
        }
    }

    fn provisioned(expires_at: u64) -> ProvisionedConfig {
        ProvisionedConfig {
            version: 1,
            token_id: String::new(),
            matrix_homeserver: "https://matrix.den".into(),
            rpc_url: "https://den:8443/api".into(),
            ws_url: "wss://den:8443/ws".into(),
            push_gateway: "https://den:8443/_matrix/push/v1/notify".into(),
            server_name: "den".into(),
            region: String::new(),
            bridge_public_key: String::new(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_nothing_stored_loads_default() {
        let fx = Fixture::new();
        assert_eq!(fx.resolver().current().await, ActiveServerConfig::default());
    }

    #[tokio::test]
    async fn test_expired_cached_config_loads_as_default() {
        // Arrange
        let fx = Fixture::new();
        let stale = ActiveServerConfig {
            expires_at: Some(9_000),
            ..config(ConfigSource::Cached)
        };
        put_json(fx.store.as_ref(), ACTIVE_CONFIG_KEY, &stale).unwrap();

        // Act
        let resolver = fx.resolver();

        // Assert
        assert_eq!(resolver.current().await.source, ConfigSource::Default);
        assert_eq!(fx.store.get(ACTIVE_CONFIG_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_unexpired_config_survives_reload() {
        let fx = Fixture::new();
        let fresh = ActiveServerConfig {
            expires_at: Some(20_000),
            ..config(ConfigSource::Cached)
        };
        fx.resolver().apply(fresh.clone()).await.unwrap();

        assert_eq!(fx.resolver().current().await, fresh);
    }

    #[tokio::test]
    async fn test_apply_emits_change_with_previous_and_current() {
        // Arrange
        let fx = Fixture::new();
        let resolver = fx.resolver();
        let mut rx = resolver.subscribe();

        // Act
        let change = resolver.apply(config(ConfigSource::Manual)).await.unwrap();

        // Assert
        assert_eq!(change.previous.source, ConfigSource::Default);
        assert_eq!(change.current.source, ConfigSource::Manual);
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::ConfigChanged(change));
    }

    #[tokio::test]
    async fn test_lower_source_is_refused_without_event() {
        // Arrange
        let fx = Fixture::new();
        let resolver = fx.resolver();
        resolver.apply(config(ConfigSource::Manual)).await.unwrap();
        let mut rx = resolver.subscribe();

        // Act
        let result = resolver.apply(config(ConfigSource::Cached)).await;

        // Assert
        assert!(matches!(
            result,
            Err(ConfigError::Superseded {
                active: ConfigSource::Manual,
                incoming: ConfigSource::Cached
            })
        ));
        assert_eq!(resolver.current().await.source, ConfigSource::Manual);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_override_ignores_precedence() {
        let fx = Fixture::new();
        let resolver = fx.resolver();
        resolver.apply(config(ConfigSource::SignedUrl)).await.unwrap();

        let change = resolver
            .override_with(config(ConfigSource::Cached))
            .await
            .unwrap();

        assert_eq!(change.previous.source, ConfigSource::SignedUrl);
        assert_eq!(resolver.current().await.source, ConfigSource::Cached);
    }

    #[tokio::test]
    async fn test_reset_removes_stored_config() {
        let fx = Fixture::new();
        let resolver = fx.resolver();
        resolver.apply(config(ConfigSource::Manual)).await.unwrap();

        let change = resolver.reset().await.unwrap();

        assert_eq!(change.source, ConfigSource::Default);
        assert_eq!(fx.store.get(ACTIVE_CONFIG_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_select_candidate_emits_selection_then_change() {
        // Arrange
        let fx = Fixture::new();
        let resolver = fx.resolver();
        resolver.apply(config(ConfigSource::SignedUrl)).await.unwrap();
        let mut rx = resolver.subscribe();
        let candidate =
            DiscoveredCandidate::new("den-bridge", "192.168.1.5", Vec::new(), 8443, BTreeMap::new());

        // Act
        let change = resolver.select_candidate(&candidate).await.unwrap();

        // Assert
        assert_eq!(change.current.source, ConfigSource::Manual);
        assert_eq!(change.current.bridge_id.as_deref(), Some("den-bridge"));
        assert!(matches!(rx.recv().await.unwrap(), LinkEvent::ConfigChanged(_)));
        assert_eq!(
            rx.recv().await.unwrap(),
            LinkEvent::CandidateSelected(candidate)
        );
    }

    #[tokio::test]
    async fn test_signed_link_from_trusted_bridge_is_applied() {
        // Arrange
        let fx = Fixture::new();
        fx.trust
            .trust_first_use("den", Fingerprint::of_der(b"den-cert"), "den")
            .await
            .unwrap();
        fx.trust.set_provisioning_secret("den", b"s3cret").await.unwrap();
        let link = SignedConfigPayload::sign(provisioned(20_000), b"s3cret")
            .unwrap()
            .to_deep_link()
            .unwrap();
        let resolver = fx.resolver();

        // Act
        let change = resolver.apply_signed_link(&link, Some("den")).await.unwrap();

        // Assert
        assert_eq!(change.current.source, ConfigSource::SignedUrl);
        assert_eq!(change.current.rpc_url, "https://den:8443/api");
        assert_eq!(change.current.bridge_id.as_deref(), Some("den"));
        assert_eq!(change.current.expires_at, None);
    }

    #[tokio::test]
    async fn test_signed_link_with_wrong_secret_is_rejected() {
        let fx = Fixture::new();
        fx.trust
            .trust_first_use("den", Fingerprint::of_der(b"den-cert"), "den")
            .await
            .unwrap();
        fx.trust.set_provisioning_secret("den", b"right").await.unwrap();
        let link = SignedConfigPayload::sign(provisioned(20_000), b"wrong")
            .unwrap()
            .to_deep_link()
            .unwrap();
        let resolver = fx.resolver();

        let result = resolver.apply_signed_link(&link, Some("den")).await;

        assert!(matches!(
            result,
            Err(ConfigError::Link(SignedConfigError::BadSignature))
        ));
        assert_eq!(resolver.current().await.source, ConfigSource::Default);
    }

    #[tokio::test]
    async fn test_expired_signed_link_is_rejected() {
        let fx = Fixture::new();
        fx.trust
            .trust_first_use("den", Fingerprint::of_der(b"den-cert"), "den")
            .await
            .unwrap();
        fx.trust.set_provisioning_secret("den", b"k").await.unwrap();
        let link = SignedConfigPayload::sign(provisioned(5_000), b"k")
            .unwrap()
            .to_deep_link()
            .unwrap();

        let result = fx.resolver().apply_signed_link(&link, Some("den")).await;

        assert!(matches!(
            result,
            Err(ConfigError::Link(SignedConfigError::Expired { expires_at: 5_000 }))
        ));
    }

    #[tokio::test]
    async fn test_signed_link_for_untrusted_bridge_is_rejected() {
        let fx = Fixture::new();
        let link = SignedConfigPayload::sign(provisioned(20_000), b"k")
            .unwrap()
            .to_deep_link()
            .unwrap();

        let result = fx.resolver().apply_signed_link(&link, Some("stranger")).await;

        assert!(matches!(result, Err(ConfigError::Untrusted(id)) if id == "stranger"));
    }

    #[tokio::test]
    async fn test_signed_link_without_bridge_needs_active_bridge() {
        let fx = Fixture::new();
        let link = SignedConfigPayload::sign(provisioned(20_000), b"k")
            .unwrap()
            .to_deep_link()
            .unwrap();

        let result = fx.resolver().apply_signed_link(&link, None).await;

        assert!(matches!(result, Err(ConfigError::NoBridge)));
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_old_config_and_emits_nothing() {
        // Arrange
        let fx = Fixture::new();
        let mut failing = MockKeyValueStore::new();
        failing.expect_get().returning(|_| Ok(None));
        failing
            .expect_put()
            .returning(|_, _| Err(StorageError::Poisoned));
        let resolver = ConfigResolver::load(
            Arc::new(failing),
            Arc::clone(&fx.trust),
            Arc::clone(&fx.clock) as Arc<dyn Clock>,
            fx.events.clone(),
        )
        .unwrap();
        let mut rx = resolver.subscribe();

        // Act
        let result = resolver.apply(config(ConfigSource::Manual)).await;

        // Assert
        assert!(matches!(result, Err(ConfigError::Storage(StorageError::Poisoned))));
        assert_eq!(resolver.current().await.source, ConfigSource::Default);
        assert!(rx.try_recv().is_err());
    }
}
