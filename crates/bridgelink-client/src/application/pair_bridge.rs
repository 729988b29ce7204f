//! SecureLink: pairing with a bridge and talking to it safely afterwards.
//!
//! This is where the pieces meet:
//!
//! ```text
//! ConfigResolver ──► which bridge, which URLs
//! TrustStore     ──► which certificate that bridge must present
//! LinkConnector  ──► pinned HTTPS client / first-contact probe
//! RetryExecutor  ──► backoff and the hard deadline around each call
//! ```
//!
//! # Pairing flow (for beginners)
//!
//! 1. Discovery yields a candidate.
//! 2. [`SecureLink::first_contact`] returns the fingerprint the bridge
//!    advertises, or probes one from a TLS handshake.
//! 3. The UI shows it and the user confirms.
//! 4. [`SecureLink::pair`] pins it in the trust store and makes the bridge
//!    the active config.
//!
//! From then on every call is pinned.  If the bridge suddenly presents a
//! different certificate the handshake fails closed, the presented key is
//! probed and handed to the trust store, which raises the identity-conflict
//! alert.  Until the user resolves it, [`SecureLink::establish`] refuses to
//! build a transport for that bridge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bridgelink_core::protocol::RpcParams;
use bridgelink_core::{
    ActiveServerConfig, DiscoveredCandidate, Fingerprint, TransportError, TrustRecord,
    TrustStatus,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::application::resolve_config::{ConfigError, ConfigResolver};
use crate::application::retry::RetryExecutor;
use crate::application::trust_store::{TrustError, TrustStore};
use crate::infrastructure::rpc::{ChannelListener, EventChannel, LinkConnector, RpcClient};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Trust(TrustError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Traffic to this bridge is blocked until the user resolves the
    /// identity conflict.
    #[error("bridge {bridge_id} presented {presented} but {pinned} is pinned")]
    Blocked {
        bridge_id: String,
        pinned: Fingerprint,
        presented: Fingerprint,
    },

    #[error("bridge {0} has not been paired")]
    NotPaired(String),

    #[error("invalid bridge URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

impl From<TrustError> for LinkError {
    fn from(err: TrustError) -> Self {
        match err {
            TrustError::IdentityConflict {
                bridge_id,
                pinned,
                presented,
            } => LinkError::Blocked {
                bridge_id,
                pinned,
                presented,
            },
            other => LinkError::Trust(other),
        }
    }
}

struct Session {
    rpc_url: String,
    pin: Option<Fingerprint>,
    client: Arc<RpcClient>,
}

pub struct SecureLink {
    connector: Arc<dyn LinkConnector>,
    trust: Arc<TrustStore>,
    config: Arc<ConfigResolver>,
    retry: RetryExecutor,
    device_id: String,
    online: Arc<AtomicBool>,
    session: Mutex<Option<Session>>,
}

impl SecureLink {
    pub fn new(
        connector: Arc<dyn LinkConnector>,
        trust: Arc<TrustStore>,
        config: Arc<ConfigResolver>,
        retry: RetryExecutor,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            trust,
            config,
            retry,
            device_id: device_id.into(),
            online: Arc::new(AtomicBool::new(true)),
            session: Mutex::new(None),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// The fingerprint the user should confirm before pairing.
    pub async fn first_contact(
        &self,
        candidate: &DiscoveredCandidate,
    ) -> Result<Fingerprint, LinkError> {
        if let Some(advertised) = candidate.fingerprint {
            debug!(name = %candidate.name, fingerprint = %advertised, "using advertised fingerprint");
            return Ok(advertised);
        }
        Ok(self.connector.probe(&candidate.host, candidate.port).await?)
    }

    /// Pins `fingerprint` for `candidate` and makes it the active bridge.
    ///
    /// The bridge is contacted first; only a certificate that actually
    /// matches `fingerprint` is pinned.
    ///
    /// # Errors
    ///
    /// - `Transport(CertificateError)` when the bridge presents another key
    ///   than the confirmed one.
    /// - [`LinkError::Blocked`] when the bridge is already pinned to another
    ///   key.
    ///
    /// Nothing is recorded in either case.
    pub async fn pair(
        &self,
        candidate: &DiscoveredCandidate,
        fingerprint: Fingerprint,
    ) -> Result<TrustRecord, LinkError> {
        let presented = self.connector.probe(&candidate.host, candidate.port).await?;
        if presented != fingerprint {
            error!(
                name = %candidate.name,
                confirmed = %fingerprint,
                presented = %presented,
                "bridge presented a certificate other than the confirmed one"
            );
            return Err(TransportError::CertificateError(format!(
                "{} presented {presented}, expected {fingerprint}",
                candidate.name
            ))
            .into());
        }

        let record = self
            .trust
            .trust_first_use(&candidate.name, fingerprint, &candidate.name)
            .await?;
        self.config.select_candidate(candidate).await?;
        info!(bridge_id = %record.bridge_id, fingerprint = %record.fingerprint, "bridge paired");
        Ok(record)
    }

    /// Returns an RPC client for the active config, pinned to its bridge.
    ///
    /// A config without a bridge id (the built-in default) uses normal CA
    /// validation.
    pub async fn establish(&self) -> Result<Arc<RpcClient>, LinkError> {
        let config = self.config.current().await;
        let pin = self.pin_for(&config).await?;

        let mut session = self.session.lock().await;
        if let Some(s) = session.as_ref() {
            if s.rpc_url == config.rpc_url && s.pin == pin {
                return Ok(Arc::clone(&s.client));
            }
        }

        let http = self.connector.http_client(pin)?;
        let client = Arc::new(
            RpcClient::new(http, config.rpc_url.clone()).with_connectivity(Arc::clone(&self.online)),
        );
        debug!(rpc_url = %config.rpc_url, pinned = pin.is_some(), "transport established");
        *session = Some(Session {
            rpc_url: config.rpc_url,
            pin,
            client: Arc::clone(&client),
        });
        Ok(client)
    }

    /// Calls `method` on the active bridge with retries and the operation
    /// deadline.
    pub async fn call(&self, method: &str, params: Option<RpcParams>) -> Result<Value, LinkError> {
        let client = self.establish().await?;
        let result = self
            .retry
            .retry_with_timeout(|| {
                let client = Arc::clone(&client);
                let params = params.clone();
                async move { client.call(method, params).await }
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(e) if e.is_security_relevant() => Err(self.certificate_rejected(e).await),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<RpcParams>,
    ) -> Result<T, LinkError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| {
            TransportError::ProtocolViolation(format!("unexpected result shape for {method}: {e}"))
                .into()
        })
    }

    /// Opens the push-event channel to the active bridge.
    ///
    /// The channel does not reconnect; reopen it after `Closed`/`Failure`.
    pub async fn open_events(
        &self,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<EventChannel, LinkError> {
        let config = self.config.current().await;
        let pin = self.pin_for(&config).await?;
        match EventChannel::open(&config.ws_url, &self.device_id, pin, listener).await {
            Ok(channel) => Ok(channel),
            Err(e) if e.is_security_relevant() => Err(self.certificate_rejected(e).await),
            Err(e) => Err(e.into()),
        }
    }

    async fn pin_for(&self, config: &ActiveServerConfig) -> Result<Option<Fingerprint>, LinkError> {
        let Some(bridge_id) = config.bridge_id.as_deref() else {
            return Ok(None);
        };
        match self.trust.status(bridge_id).await? {
            TrustStatus::Trusted(record) => Ok(Some(record.fingerprint)),
            TrustStatus::IdentityConflict { record, presented } => Err(LinkError::Blocked {
                bridge_id: record.bridge_id,
                pinned: record.fingerprint,
                presented,
            }),
            TrustStatus::Unknown => Err(LinkError::NotPaired(bridge_id.to_string())),
        }
    }

    /// A pinned handshake failed.  Probe what the bridge presents now and
    /// let the trust store decide whether it is a conflict.
    async fn certificate_rejected(&self, err: TransportError) -> LinkError {
        *self.session.lock().await = None;
        let config = self.config.current().await;
        let Some(bridge_id) = config.bridge_id.clone() else {
            return err.into();
        };
        error!(%bridge_id, error = %err, "pinned certificate check failed");

        let (host, port) = match host_and_port(&config.rpc_url) {
            Ok(hp) => hp,
            Err(e) => return e,
        };
        let presented = match self.connector.probe(&host, port).await {
            Ok(fp) => fp,
            Err(probe_err) => {
                debug!(%bridge_id, error = %probe_err, "could not probe replacement certificate");
                return err.into();
            }
        };
        match self.trust.check(&bridge_id, presented).await {
            Ok(TrustStatus::IdentityConflict { record, presented }) => LinkError::Blocked {
                bridge_id: record.bridge_id,
                pinned: record.fingerprint,
                presented,
            },
            Ok(_) => err.into(),
            Err(trust_err) => trust_err.into(),
        }
    }
}

fn host_and_port(url: &str) -> Result<(String, u16), LinkError> {
    let invalid = |message: &str| LinkError::InvalidUrl {
        url: url.to_string(),
        message: message.to_string(),
    };
    let parsed = reqwest::Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| invalid("no host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| invalid("no port"))?;
    Ok((host, port))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::rpc::HttpPost;
    use crate::infrastructure::storage::{KeyValueStore, MemoryStore};
    use async_trait::async_trait;
    use bridgelink_core::{BackoffPolicy, Clock, LinkEvent, ManualClock, RpcRequest, RpcResponse};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::broadcast;

    /// Serves the bridge's certificate as `actual`: a pinned client whose
    /// pin differs fails the way the real verifier does.
    struct FakeBridge {
        actual: StdMutex<Fingerprint>,
        pins_requested: StdMutex<Vec<Option<Fingerprint>>>,
        probes: StdMutex<u32>,
    }

    impl FakeBridge {
        fn serving(actual: Fingerprint) -> Arc<Self> {
            Arc::new(Self {
                actual: StdMutex::new(actual),
                pins_requested: StdMutex::new(Vec::new()),
                probes: StdMutex::new(0),
            })
        }

        fn swap_certificate(&self, fp: Fingerprint) {
            *self.actual.lock().expect("lock poisoned") = fp;
        }
    }

    struct FakeHttp {
        bridge: Arc<FakeBridge>,
        pin: Option<Fingerprint>,
    }

    #[async_trait]
    impl HttpPost for FakeHttp {
        async fn post_json(&self, _url: &str, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            let actual = *self.bridge.actual.lock().expect("lock poisoned");
            if self.pin.is_some_and(|pin| pin != actual) {
                return Err(TransportError::CertificateError("pin mismatch".into()));
            }
            let request: RpcRequest = serde_json::from_slice(&body).expect("valid request");
            let reply = RpcResponse::success(request.id, json!({ "method": request.method }));
            Ok(serde_json::to_vec(&reply).expect("encodable"))
        }
    }

    #[async_trait]
    impl LinkConnector for Arc<FakeBridge> {
        fn http_client(
            &self,
            pin: Option<Fingerprint>,
        ) -> Result<Arc<dyn HttpPost>, TransportError> {
            self.pins_requested.lock().expect("lock poisoned").push(pin);
            Ok(Arc::new(FakeHttp {
                bridge: Arc::clone(self),
                pin,
            }))
        }

        async fn probe(&self, _host: &str, _port: u16) -> Result<Fingerprint, TransportError> {
            *self.probes.lock().expect("lock poisoned") += 1;
            Ok(*self.actual.lock().expect("lock poisoned"))
        }
    }

    struct Fixture {
        bridge: Arc<FakeBridge>,
        trust: Arc<TrustStore>,
        config: Arc<ConfigResolver>,
        link: SecureLink,
        events: broadcast::Sender<LinkEvent>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let (events, _) = broadcast::channel(16);
        let trust = Arc::new(TrustStore::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            events.clone(),
        ));
        let config = Arc::new(
            ConfigResolver::load(store, Arc::clone(&trust), clock, events.clone()).unwrap(),
        );
        let bridge = FakeBridge::serving(Fingerprint::of_der(b"den-cert"));
        let retry = RetryExecutor::new(BackoffPolicy {
            max_retries: 0,
            ..BackoffPolicy::default()
        });
        let link = SecureLink::new(
            Arc::new(Arc::clone(&bridge)),
            Arc::clone(&trust),
            Arc::clone(&config),
            retry,
            "phone-1",
        );
        Fixture {
            bridge,
            trust,
            config,
            link,
            events,
        }
    }

    fn den() -> DiscoveredCandidate {
        DiscoveredCandidate::new("den", "192.168.1.5", Vec::new(), 8443, BTreeMap::new())
    }

    #[tokio::test]
    async fn test_first_contact_prefers_advertised_fingerprint() {
        // Arrange
        let fx = fixture();
        let advertised = Fingerprint::of_der(b"advertised");
        let mut txt = BTreeMap::new();
        txt.insert("fingerprint".to_string(), advertised.to_string());
        let candidate = DiscoveredCandidate::new("den", "192.168.1.5", Vec::new(), 8443, txt);

        // Act
        let fp = fx.link.first_contact(&candidate).await.unwrap();

        // Assert
        assert_eq!(fp, advertised);
        assert_eq!(*fx.bridge.probes.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_first_contact_probes_when_nothing_advertised() {
        let fx = fixture();
        let fp = fx.link.first_contact(&den()).await.unwrap();
        assert_eq!(fp, Fingerprint::of_der(b"den-cert"));
        assert_eq!(*fx.bridge.probes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_paired_bridge_calls_are_pinned() {
        // Arrange
        let fx = fixture();
        let fp = fx.link.first_contact(&den()).await.unwrap();
        fx.link.pair(&den(), fp).await.unwrap();

        // Act
        let value = fx.link.call("status", None).await.unwrap();

        // Assert
        assert_eq!(value, json!({ "method": "status" }));
        assert_eq!(
            fx.config.current().await.rpc_url,
            "https://192.168.1.5:8443/api"
        );
        assert_eq!(*fx.bridge.pins_requested.lock().unwrap(), vec![Some(fp)]);
    }

    #[tokio::test]
    async fn test_session_is_reused_between_calls() {
        let fx = fixture();
        fx.link
            .pair(&den(), Fingerprint::of_der(b"den-cert"))
            .await
            .unwrap();

        fx.link.call("a", None).await.unwrap();
        fx.link.call("b", None).await.unwrap();

        assert_eq!(fx.bridge.pins_requested.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_default_config_is_not_pinned() {
        let fx = fixture();
        fx.link.establish().await.unwrap();
        assert_eq!(*fx.bridge.pins_requested.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_unpaired_bridge_is_refused() {
        let fx = fixture();
        fx.config.select_candidate(&den()).await.unwrap();

        let result = fx.link.establish().await;

        assert!(matches!(result, Err(LinkError::NotPaired(id)) if id == "den"));
    }

    #[tokio::test]
    async fn test_substituted_certificate_raises_conflict_and_blocks() {
        // Arrange
        let fx = fixture();
        let original = Fingerprint::of_der(b"den-cert");
        let impostor = Fingerprint::of_der(b"impostor");
        fx.link.pair(&den(), original).await.unwrap();
        let mut rx = fx.events.subscribe();
        fx.bridge.swap_certificate(impostor);

        // Act
        let first = fx.link.call("status", None).await;
        let second = fx.link.call("status", None).await;

        // Assert
        assert!(matches!(
            first,
            Err(LinkError::Blocked { pinned, presented, .. }) if pinned == original && presented == impostor
        ));
        assert!(matches!(second, Err(LinkError::Blocked { .. })));
        assert_eq!(
            rx.recv().await.unwrap(),
            LinkEvent::IdentityConflict {
                bridge_id: "den".into(),
                previous_fingerprint: original,
                new_fingerprint: impostor,
            }
        );
        let status = fx.trust.status("den").await.unwrap();
        assert_eq!(status.record().unwrap().fingerprint, original);
    }

    #[tokio::test]
    async fn test_pairing_over_existing_pin_is_blocked() {
        let fx = fixture();
        fx.link
            .pair(&den(), Fingerprint::of_der(b"den-cert"))
            .await
            .unwrap();
        fx.bridge.swap_certificate(Fingerprint::of_der(b"other"));

        let result = fx.link.pair(&den(), Fingerprint::of_der(b"other")).await;

        assert!(matches!(result, Err(LinkError::Blocked { .. })));
    }

    /// A wrong TXT fingerprint must not be pinned: pairing contacts the
    /// bridge and refuses when the served certificate differs.
    #[tokio::test]
    async fn test_pair_refuses_advertised_fingerprint_the_bridge_does_not_serve() {
        // Arrange
        let fx = fixture();
        let advertised = Fingerprint::of_der(b"spoofed-txt");
        let mut txt = BTreeMap::new();
        txt.insert("fingerprint".to_string(), advertised.to_string());
        let candidate = DiscoveredCandidate::new("den", "192.168.1.5", Vec::new(), 8443, txt);
        let mut rx = fx.events.subscribe();

        // Act
        let confirmed = fx.link.first_contact(&candidate).await.unwrap();
        let result = fx.link.pair(&candidate, confirmed).await;

        // Assert
        assert!(matches!(
            result,
            Err(LinkError::Transport(TransportError::CertificateError(_)))
        ));
        assert_eq!(*fx.bridge.probes.lock().unwrap(), 1);
        assert_eq!(fx.trust.status("den").await.unwrap(), TrustStatus::Unknown);
        assert_eq!(fx.config.current().await, ActiveServerConfig::default());
        assert!(rx.try_recv().is_err(), "no event for a refused pairing");
    }

    #[tokio::test]
    async fn test_pair_with_matching_advertised_fingerprint_verifies_once() {
        let fx = fixture();
        let served = Fingerprint::of_der(b"den-cert");
        let mut txt = BTreeMap::new();
        txt.insert("fingerprint".to_string(), served.to_string());
        let candidate = DiscoveredCandidate::new("den", "192.168.1.5", Vec::new(), 8443, txt);

        let confirmed = fx.link.first_contact(&candidate).await.unwrap();
        let record = fx.link.pair(&candidate, confirmed).await.unwrap();

        assert_eq!(record.fingerprint, served);
        assert_eq!(*fx.bridge.probes.lock().unwrap(), 1);
        assert!(fx.link.call("status", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_offline_call_fails_fast() {
        let fx = fixture();
        fx.link.set_online(false);

        let result = fx.link.call("status", None).await;

        assert!(matches!(
            result,
            Err(LinkError::Transport(TransportError::Offline))
        ));
    }

    #[test]
    fn test_host_and_port_from_url() {
        assert_eq!(
            host_and_port("https://192.168.1.5:8443/api").unwrap(),
            ("192.168.1.5".to_string(), 8443)
        );
        assert_eq!(
            host_and_port("https://bridge.local/api").unwrap(),
            ("bridge.local".to_string(), 443)
        );
        assert_eq!(
            host_and_port("https://[fe80::1]:8443/api").unwrap(),
            ("fe80::1".to_string(), 8443)
        );
        assert!(host_and_port("not a url").is_err());
    }
}
