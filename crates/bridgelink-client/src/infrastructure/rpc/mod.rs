//! JSON-RPC 2.0 over HTTPS POST, plus the push-event channel.
//!
//! # Layers
//!
//! - [`HttpPost`]: "send these bytes to this URL and give me the body back",
//!   with HTTP status codes already mapped onto [`TransportError`].  The real
//!   implementation is [`https::PinnedHttpsClient`]; tests script it.
//! - [`PendingCalls`]: the id → waiter table.  Every call registers its id
//!   before sending and is completed by whichever response carries that id,
//!   regardless of arrival order.
//! - [`RpcClient`]: one call = fresh id, register, POST, route the reply,
//!   apply the result/error resolution rule.
//!
//! The client never retries by itself.  Wrap calls in
//! [`crate::application::retry::RetryExecutor`] to get backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bridgelink_core::protocol::RpcParams;
use bridgelink_core::{Fingerprint, RpcRequest, RpcResponse, TransportError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub mod event_channel;
pub mod https;

pub use event_channel::{ChannelEvent, ChannelListener, EventChannel};
pub use https::{probe_fingerprint, PinnedConnector, PinnedHttpsClient};

/// Sends one JSON body and returns the response body.
#[async_trait]
pub trait HttpPost: Send + Sync {
    /// # Errors
    ///
    /// Non-2xx statuses map through [`classify_status`]; network and TLS
    /// failures map to `ConnectionFailed`, `Timeout` or `CertificateError`.
    async fn post_json(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

/// Builds transports for one bridge.
///
/// Separates "which certificate do we expect" (decided by the trust store)
/// from "how do we talk TLS", so the secure-link layer can be exercised
/// without sockets.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// An HTTP client pinned to `pin`, or using CA validation when `None`.
    fn http_client(&self, pin: Option<Fingerprint>) -> Result<Arc<dyn HttpPost>, TransportError>;

    /// The fingerprint `host:port` presents, without validating it.
    async fn probe(&self, host: &str, port: u16) -> Result<Fingerprint, TransportError>;
}

/// Maps a non-success HTTP status onto the transport taxonomy.
///
/// | Status      | Error                                    |
/// |-------------|------------------------------------------|
/// | 401, 403    | `AuthenticationFailed`                   |
/// | 429         | `RateLimited` with `Retry-After` seconds |
/// | anything else | `ServerError { code }`                 |
pub fn classify_status(status: u16, retry_after: Option<&str>) -> TransportError {
    match status {
        401 | 403 => TransportError::AuthenticationFailed,
        429 => TransportError::RateLimited {
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        code => TransportError::ServerError { code },
    }
}

// ── Pending calls ─────────────────────────────────────────────────────────────

/// Outstanding calls keyed by request id.
#[derive(Debug, Default)]
pub struct PendingCalls {
    waiters: Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>,
}

/// A registered waiter.  Dropping it unregisters the id.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<RpcResponse>,
    calls: Arc<PendingCalls>,
}

impl PendingCalls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<RpcResponse>>> {
        // A panic while holding this lock cannot leave the map inconsistent.
        self.waiters.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Registers a waiter for `id`.
    pub fn register(self: &Arc<Self>, id: u64) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        if self.lock().insert(id, tx).is_some() {
            warn!(id, "request id registered twice; previous waiter dropped");
        }
        PendingCall {
            id,
            rx,
            calls: Arc::clone(self),
        }
    }

    /// Hands `response` to the waiter registered under its id.
    ///
    /// Returns `false` (and drops the response) when nobody is waiting for
    /// that id or the response has no id.
    pub fn complete(&self, response: RpcResponse) -> bool {
        let Some(id) = response.id else {
            return false;
        };
        match self.lock().remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(id, "response for unknown or abandoned request");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, id: u64) {
        self.lock().remove(&id);
    }
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the response routed to this id.
    pub async fn wait(mut self) -> Result<RpcResponse, TransportError> {
        self.routed().await
    }

    /// Like [`wait`](Self::wait) but keeps the registration, so it can be
    /// raced against the HTTP exchange.  Must not be polled again once it
    /// has returned.
    async fn routed(&mut self) -> Result<RpcResponse, TransportError> {
        let id = self.id;
        (&mut self.rx)
            .await
            .map_err(|_| TransportError::ProtocolViolation(format!("request {id} was abandoned")))
    }

    /// Returns the response if one has already been routed here.
    pub fn try_take(&mut self) -> Option<RpcResponse> {
        self.rx.try_recv().ok()
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.calls.forget(self.id);
    }
}

// ── RPC client ────────────────────────────────────────────────────────────────

/// JSON-RPC client for one bridge endpoint.
pub struct RpcClient {
    http: Arc<dyn HttpPost>,
    endpoint: String,
    pending: Arc<PendingCalls>,
    online: Arc<AtomicBool>,
}

impl RpcClient {
    pub fn new(http: Arc<dyn HttpPost>, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            pending: PendingCalls::new(),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Shares `online` with other clients instead of a private flag.
    pub fn with_connectivity(mut self, online: Arc<AtomicBool>) -> Self {
        self.online = online;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn pending(&self) -> &Arc<PendingCalls> {
        &self.pending
    }

    /// Shared connectivity flag; flip it from a platform network callback.
    pub fn connectivity(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.online)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Calls `method` and returns the decoded `result`.
    ///
    /// # Errors
    ///
    /// - `Offline` without touching the network when the flag is down.
    /// - Whatever the HTTP layer reports.
    /// - `Rpc { code, message }` when the reply carries an error.
    /// - `ProtocolViolation` for malformed replies, replies with neither
    ///   result nor error, or replies tagged with another call's id.
    pub async fn call(
        &self,
        method: &str,
        params: Option<RpcParams>,
    ) -> Result<Value, TransportError> {
        if !self.is_online() {
            return Err(TransportError::Offline);
        }

        let request = RpcRequest::new(method, params);
        let id = request.id;
        let body = serde_json::to_vec(&request)
            .map_err(|e| TransportError::ProtocolViolation(format!("unencodable request: {e}")))?;

        let mut waiter = self.pending.register(id);
        debug!(id, method, endpoint = %self.endpoint, "rpc call");

        // A reply for this id may arrive on another caller's exchange.
        let exchange = {
            let post = self.http.post_json(&self.endpoint, body);
            tokio::pin!(post);
            tokio::select! {
                biased;
                routed = waiter.routed() => return routed?.into_result(),
                reply = &mut post => reply,
            }
        };

        let response = match exchange.and_then(|reply| RpcResponse::from_slice(&reply)) {
            Ok(response) if response.id == Some(id) => return response.into_result(),
            Ok(response) => response,
            Err(e) => {
                return match waiter.try_take() {
                    Some(own) => own.into_result(),
                    None => Err(e),
                }
            }
        };

        let reply_id = response.id;
        if self.pending.complete(response) {
            debug!(id, ?reply_id, "reply routed to its own caller");
        }
        match waiter.try_take() {
            Some(own) => own.into_result(),
            None => Err(TransportError::ProtocolViolation(format!(
                "request {id} answered with id {reply_id:?}"
            ))),
        }
    }

    /// [`call`](Self::call) and deserialize the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<RpcParams>,
    ) -> Result<T, TransportError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| {
            TransportError::ProtocolViolation(format!("unexpected result shape for {method}: {e}"))
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Barrier;

    /// Replies to every request with whatever `reply` builds from it.
    struct ScriptedHttp<F> {
        reply: F,
        calls: AtomicUsize,
    }

    impl<F> ScriptedHttp<F> {
        fn new(reply: F) -> Self {
            Self {
                reply,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl<F> HttpPost for ScriptedHttp<F>
    where
        F: Fn(RpcRequest) -> Result<Vec<u8>, TransportError> + Send + Sync,
    {
        async fn post_json(&self, _url: &str, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let request: RpcRequest = serde_json::from_slice(&body).expect("valid request");
            (self.reply)(request)
        }
    }

    fn client_with<F>(reply: F) -> (RpcClient, Arc<ScriptedHttp<F>>)
    where
        F: Fn(RpcRequest) -> Result<Vec<u8>, TransportError> + Send + Sync + 'static,
    {
        let http = Arc::new(ScriptedHttp::new(reply));
        let client = RpcClient::new(http.clone(), "https://bridge.local:8443/api");
        (client, http)
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(401, None), TransportError::AuthenticationFailed);
        assert_eq!(classify_status(403, None), TransportError::AuthenticationFailed);
        assert_eq!(
            classify_status(429, Some("7")),
            TransportError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        assert_eq!(
            classify_status(429, Some("Wed, 21 Oct 2015 07:28:00 GMT")),
            TransportError::RateLimited { retry_after: None }
        );
        assert_eq!(classify_status(503, None), TransportError::ServerError { code: 503 });
    }

    #[tokio::test]
    async fn test_out_of_order_responses_resolve_only_matching_waiter() {
        // Arrange
        let pending = PendingCalls::new();
        let mut call7 = pending.register(7);
        let call8 = pending.register(8);

        // Act: id 8 arrives first.
        assert!(pending.complete(RpcResponse::success(8, json!("eight"))));

        // Assert
        assert!(call7.try_take().is_none(), "id 7 must still be waiting");
        let eight = call8.wait().await.unwrap();
        assert_eq!(eight.result, Some(json!("eight")));

        assert!(pending.complete(RpcResponse::success(7, json!("seven"))));
        assert_eq!(call7.wait().await.unwrap().result, Some(json!("seven")));
    }

    /// Two calls in flight: the first exchange carries the second call's
    /// reply, then the second exchange drops.  Only the second caller is
    /// resolved, with the routed reply.
    struct CrossedHttp {
        ids: Mutex<HashMap<String, u64>>,
        both_sent: Barrier,
    }

    #[async_trait]
    impl HttpPost for CrossedHttp {
        async fn post_json(&self, _url: &str, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            let request: RpcRequest = serde_json::from_slice(&body).expect("valid request");
            self.ids
                .lock()
                .expect("lock poisoned")
                .insert(request.method.clone(), request.id);
            self.both_sent.wait().await;

            if request.method == "first" {
                let second = self.ids.lock().expect("lock poisoned")["second"];
                Ok(serde_json::to_vec(&RpcResponse::success(second, json!("for-second"))).unwrap())
            } else {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(TransportError::ConnectionFailed("link dropped".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_reply_on_other_exchange_resolves_matching_caller() {
        // Arrange
        let http = Arc::new(CrossedHttp {
            ids: Mutex::new(HashMap::new()),
            both_sent: Barrier::new(2),
        });
        let client = RpcClient::new(http, "https://bridge.local:8443/api");

        // Act
        let (first, second) = tokio::join!(client.call("first", None), client.call("second", None));

        // Assert
        assert_eq!(second, Ok(json!("for-second")));
        assert!(matches!(first, Err(TransportError::ProtocolViolation(_))));
        assert!(client.pending().is_empty());
    }

    #[test]
    fn test_dropping_waiter_unregisters_id() {
        let pending = PendingCalls::new();
        let call = pending.register(11);
        assert_eq!(pending.len(), 1);

        drop(call);

        assert!(pending.is_empty());
        assert!(!pending.complete(RpcResponse::success(11, json!(null))));
    }

    #[tokio::test]
    async fn test_call_returns_result() {
        let (client, http) = client_with(|req| {
            Ok(serde_json::to_vec(&RpcResponse::success(req.id, json!({"status": "ok"}))).unwrap())
        });

        let value = client.call("bridge.status", None).await.unwrap();

        assert_eq!(value, json!({"status": "ok"}));
        assert_eq!(http.calls.load(Ordering::SeqCst), 1);
        assert!(client.pending().is_empty());
    }

    #[tokio::test]
    async fn test_call_maps_error_member() {
        let (client, _) = client_with(|req| {
            Ok(serde_json::to_vec(&RpcResponse::failure(req.id, -32601, "Method not found")).unwrap())
        });

        let result = client.call("nope", None).await;

        assert_eq!(
            result,
            Err(TransportError::Rpc {
                code: -32601,
                message: "Method not found".into()
            })
        );
    }

    #[tokio::test]
    async fn test_call_with_neither_result_nor_error_is_protocol_violation() {
        let (client, _) =
            client_with(|req| Ok(format!(r#"{{"jsonrpc":"2.0","id":{}}}"#, req.id).into_bytes()));

        let result = client.call("bridge.status", None).await;

        assert!(matches!(result, Err(TransportError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_reply_for_foreign_id_is_protocol_violation() {
        let (client, _) = client_with(|req| {
            Ok(serde_json::to_vec(&RpcResponse::success(req.id + 1_000_000, json!(1))).unwrap())
        });

        let result = client.call("bridge.status", None).await;

        assert!(matches!(result, Err(TransportError::ProtocolViolation(_))));
        assert!(client.pending().is_empty());
    }

    #[tokio::test]
    async fn test_offline_fails_fast_without_network() {
        // Arrange
        let (client, http) = client_with(|req| {
            Ok(serde_json::to_vec(&RpcResponse::success(req.id, json!(true))).unwrap())
        });
        client.set_online(false);

        // Act
        let result = client.call("bridge.status", None).await;

        // Assert
        assert_eq!(result, Err(TransportError::Offline));
        assert_eq!(http.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_http_error_propagates_and_cleans_up() {
        let (client, _) = client_with(|_| Err(TransportError::ServerError { code: 502 }));

        let result = client.call("bridge.status", None).await;

        assert_eq!(result, Err(TransportError::ServerError { code: 502 }));
        assert!(client.pending().is_empty());
    }

    #[tokio::test]
    async fn test_call_as_decodes_typed_result() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Status {
            version: String,
        }
        let (client, _) = client_with(|req| {
            Ok(serde_json::to_vec(&RpcResponse::success(req.id, json!({"version": "1.4.0"})))
                .unwrap())
        });

        let status: Status = client.call_as("bridge.status", None).await.unwrap();

        assert_eq!(status, Status { version: "1.4.0".into() });
    }

    #[tokio::test]
    async fn test_call_as_shape_mismatch_is_protocol_violation() {
        let (client, _) = client_with(|req| {
            Ok(serde_json::to_vec(&RpcResponse::success(req.id, json!("not an object"))).unwrap())
        });

        let result: Result<HashMap<String, String>, _> = client.call_as("x", None).await;

        assert!(matches!(result, Err(TransportError::ProtocolViolation(_))));
    }
}
