//! Long-lived WebSocket for server-pushed events.
//!
//! On open the channel sends exactly one registration frame naming this
//! device, then forwards every inbound frame and every lifecycle change to
//! the caller's [`ChannelListener`]:
//!
//! ```text
//! Opened → Message* → Closing → Closed
//!        ↘ Failure (connection lost, TLS failure, …)
//! ```
//!
//! The channel never reconnects.  A caller that wants a persistent channel
//! reopens it after `Closed`/`Failure`, typically through the retry
//! executor.

use std::sync::Arc;
use std::time::Duration;

use bridgelink_core::protocol::registration_frame;
use bridgelink_core::{Fingerprint, TransportError};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::classify_status;
use super::https::{pinned_client_config, tls_error_in, DEFAULT_CONNECT_TIMEOUT};

/// Grace period for the peer to acknowledge our close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle and data events delivered to a [`ChannelListener`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened,
    /// One inbound text frame, or a binary frame holding UTF-8.
    Message(String),
    /// One inbound binary frame that is not UTF-8.
    Binary(Vec<u8>),
    /// A close handshake has started (by either side).
    Closing { code: u16, reason: String },
    Closed,
    Failure(TransportError),
}

/// Receives channel events, in order, from the channel's task.
pub trait ChannelListener: Send + Sync {
    fn on_event(&self, event: ChannelEvent);
}

impl ChannelListener for mpsc::UnboundedSender<ChannelEvent> {
    fn on_event(&self, event: ChannelEvent) {
        let _ = self.send(event);
    }
}

/// Handle to an open event channel.  Dropping it closes the channel.
pub struct EventChannel {
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EventChannel {
    /// Connects to `ws_url`, registers `device_id`, and starts forwarding.
    ///
    /// A `pin` requires a `wss://` URL and is enforced on the TLS handshake
    /// exactly as for RPC calls.
    ///
    /// # Errors
    ///
    /// The same failure is also delivered to `listener` as
    /// [`ChannelEvent::Failure`].
    pub async fn open(
        ws_url: &str,
        device_id: &str,
        pin: Option<Fingerprint>,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<Self, TransportError> {
        match Self::connect(ws_url, device_id, pin).await {
            Ok(ws) => {
                info!(%ws_url, device_id, "event channel open");
                listener.on_event(ChannelEvent::Opened);
                let (outbound, rx) = mpsc::unbounded_channel();
                let shutdown = CancellationToken::new();
                let task = tokio::spawn(pump(ws, rx, shutdown.clone(), listener));
                Ok(Self {
                    outbound,
                    shutdown,
                    task: Some(task),
                })
            }
            Err(e) => {
                warn!(%ws_url, error = %e, "event channel failed to open");
                listener.on_event(ChannelEvent::Failure(e.clone()));
                Err(e)
            }
        }
    }

    async fn connect(
        ws_url: &str,
        device_id: &str,
        pin: Option<Fingerprint>,
    ) -> Result<WsStream, TransportError> {
        let connector = match pin {
            Some(pin) => {
                if !ws_url.to_ascii_lowercase().starts_with("wss://") {
                    return Err(TransportError::CertificateError(format!(
                        "pinned channel requires wss://, got {ws_url}"
                    )));
                }
                Some(Connector::Rustls(pinned_client_config(pin)?))
            }
            None => None,
        };

        let (mut ws, _response) = tokio::time::timeout(
            DEFAULT_CONNECT_TIMEOUT,
            connect_async_tls_with_config(ws_url, None, false, connector),
        )
        .await
        .map_err(|_| TransportError::Timeout(DEFAULT_CONNECT_TIMEOUT))?
        .map_err(classify_ws_error)?;

        ws.send(Message::Text(registration_frame(device_id)))
            .await
            .map_err(classify_ws_error)?;
        debug!(device_id, "registration frame sent");
        Ok(ws)
    }

    /// Queues a text frame for the bridge.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| TransportError::ConnectionFailed("event channel is closed".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Starts the close handshake and waits for the channel task to finish.
    pub async fn close(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn pump(
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
    listener: Arc<dyn ChannelListener>,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                close_locally(&mut ws, listener.as_ref()).await;
                return;
            }
            Some(message) = outbound.recv() => {
                if let Err(e) = ws.send(message).await {
                    listener.on_event(ChannelEvent::Failure(classify_ws_error(e)));
                    return;
                }
            }
            inbound = ws.next() => match inbound {
                Some(Ok(Message::Text(text))) => listener.on_event(ChannelEvent::Message(text)),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => listener.on_event(ChannelEvent::Message(text)),
                    Err(e) => listener.on_event(ChannelEvent::Binary(e.into_bytes())),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((u16::from(CloseCode::Status), String::new()));
                    debug!(code, %reason, "bridge closed event channel");
                    listener.on_event(ChannelEvent::Closing { code, reason });
                    drain(&mut ws).await;
                    listener.on_event(ChannelEvent::Closed);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(tungstenite::Error::ConnectionClosed)) | None => {
                    listener.on_event(ChannelEvent::Closed);
                    return;
                }
                Some(Err(e)) => {
                    let err = classify_ws_error(e);
                    warn!(error = %err, "event channel failed");
                    listener.on_event(ChannelEvent::Failure(err));
                    return;
                }
            },
        }
    }
}

async fn close_locally(ws: &mut WsStream, listener: &dyn ChannelListener) {
    let reason = "client closing".to_string();
    listener.on_event(ChannelEvent::Closing {
        code: u16::from(CloseCode::Normal),
        reason: reason.clone(),
    });
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: reason.into(),
    };
    if ws.close(Some(frame)).await.is_ok() {
        let _ = tokio::time::timeout(CLOSE_GRACE, drain(ws)).await;
    }
    listener.on_event(ChannelEvent::Closed);
}

/// Reads until the peer finishes the close handshake.
async fn drain(ws: &mut WsStream) {
    while let Some(Ok(_)) = ws.next().await {}
}

fn classify_ws_error(err: tungstenite::Error) -> TransportError {
    if let Some(tls) = tls_error_in(&err) {
        return TransportError::CertificateError(tls);
    }
    match err {
        tungstenite::Error::Http(response) => {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            classify_status(response.status().as_u16(), retry_after.as_deref())
        }
        other => TransportError::ConnectionFailed(other.to_string()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
