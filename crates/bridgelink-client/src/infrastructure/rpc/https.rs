//! HTTPS transport pinned to a certificate fingerprint.
//!
//! Bridges serve self-signed certificates on a LAN address, so the usual CA
//! chain and hostname checks say nothing useful.  Instead the leaf
//! certificate's SHA-256 is compared with the fingerprint the user trusted.
//! Anything else fails the handshake, which is the primary defence against
//! a man in the middle once a bridge is trusted.
//!
//! # How pinning plugs into rustls (for beginners)
//!
//! rustls asks a [`ServerCertVerifier`] two questions during the handshake:
//!
//! 1. "Is this certificate acceptable?" → [`PinnedCertVerifier`] hashes the
//!    DER bytes and compares with the pin.
//! 2. "Is this handshake signature valid for that certificate?" → delegated
//!    to the crypto provider's standard algorithms, so an attacker cannot
//!    replay a pinned certificate without its private key.
//!
//! The same verifier, in probe mode, records the certificate of a bridge we
//! have never seen so the user can confirm it ([`probe_fingerprint`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridgelink_core::{Fingerprint, TransportError};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

use super::{classify_status, HttpPost, LinkConnector};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy)]
enum VerifyMode {
    Pinned(Fingerprint),
    /// Accept any certificate whose handshake signature checks out.  Only
    /// used to learn a fingerprint, never to carry traffic.
    Probe,
}

/// rustls verifier that accepts exactly one leaf certificate.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    mode: VerifyMode,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedCertVerifier {
    pub fn pinned(pin: Fingerprint) -> Self {
        Self::with_mode(VerifyMode::Pinned(pin))
    }

    fn probe() -> Self {
        Self::with_mode(VerifyMode::Probe)
    }

    fn with_mode(mode: VerifyMode) -> Self {
        Self {
            mode,
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = Fingerprint::of_der(end_entity.as_ref());
        match self.mode {
            VerifyMode::Pinned(pin) if pin == presented => {
                debug!(server = ?server_name, fingerprint = %presented.short(), "pinned certificate matched");
                Ok(ServerCertVerified::assertion())
            }
            VerifyMode::Pinned(pin) => {
                error!(
                    server = ?server_name,
                    pinned = %pin,
                    presented = %presented,
                    "certificate does not match pin; possible active attack"
                );
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
            VerifyMode::Probe => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn client_config(verifier: PinnedCertVerifier) -> Result<ClientConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::CertificateError(format!("TLS setup failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}

/// TLS client configuration that only accepts the certificate hashing to
/// `pin`.  Shared by the HTTPS client and the event channel.
pub fn pinned_client_config(pin: Fingerprint) -> Result<Arc<ClientConfig>, TransportError> {
    client_config(PinnedCertVerifier::pinned(pin)).map(Arc::new)
}

/// Connects to `host:port`, completes a TLS handshake and returns the
/// fingerprint of the certificate the server presented.
///
/// The certificate is *not* validated.  The result is for the user to
/// confirm on first contact.
pub async fn probe_fingerprint(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<Fingerprint, TransportError> {
    let connector = TlsConnector::from(Arc::new(client_config(PinnedCertVerifier::probe())?));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::ConnectionFailed(format!("invalid host {host}: {e}")))?;

    let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
        .map_err(|e| TransportError::ConnectionFailed(format!("{host}:{port}: {e}")))?;

    let tls = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
        .map_err(|e| match tls_error_in(&e) {
            Some(tls) => TransportError::CertificateError(tls),
            None => TransportError::ConnectionFailed(format!("{host}:{port}: {e}")),
        })?;

    let (_, session) = tls.get_ref();
    let leaf = session
        .peer_certificates()
        .and_then(|chain| chain.first())
        .ok_or_else(|| TransportError::CertificateError("server presented no certificate".into()))?;
    let fingerprint = Fingerprint::of_der(leaf.as_ref());
    info!(host, port, %fingerprint, "probed bridge certificate");
    Ok(fingerprint)
}

/// Finds a rustls error anywhere in `err`'s source chain, including inside
/// `std::io::Error` wrappers.
pub(crate) fn tls_error_in(err: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return Some(tls.to_string());
        }
        if let Some(inner) = e
            .downcast_ref::<std::io::Error>()
            .and_then(|io| io.get_ref())
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return Some(inner.to_string());
        }
        current = e.source();
    }
    None
}

/// `reqwest` client whose TLS layer is pinned to one certificate.
#[derive(Debug, Clone)]
pub struct PinnedHttpsClient {
    client: reqwest::Client,
    pin: Option<Fingerprint>,
    request_timeout: Duration,
}

impl PinnedHttpsClient {
    /// Builds a client pinned to `pin`.
    ///
    /// With `pin = None` the platform's normal CA validation applies; that is
    /// only appropriate for bridges fronted by a publicly trusted cert.
    pub fn new(pin: Option<Fingerprint>) -> Result<Self, TransportError> {
        Self::with_timeouts(pin, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeouts(
        pin: Option<Fingerprint>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .user_agent(concat!("bridgelink/", env!("CARGO_PKG_VERSION")));
        if let Some(pin) = pin {
            let config = client_config(PinnedCertVerifier::pinned(pin))?;
            builder = builder.use_preconfigured_tls(config);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::ConnectionFailed(format!("HTTP client setup: {e}")))?;
        Ok(Self {
            client,
            pin,
            request_timeout,
        })
    }

    pub fn pin(&self) -> Option<Fingerprint> {
        self.pin
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if let Some(tls) = tls_error_in(&err) {
            return TransportError::CertificateError(tls);
        }
        if err.is_timeout() {
            return TransportError::Timeout(self.request_timeout);
        }
        TransportError::ConnectionFailed(err.to_string())
    }
}

#[async_trait]
impl HttpPost for PinnedHttpsClient {
    async fn post_json(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            debug!(%url, status = status.as_u16(), "bridge returned non-success status");
            return Err(classify_status(status.as_u16(), retry_after.as_deref()));
        }

        let bytes = response.bytes().await.map_err(|e| self.classify(e))?;
        Ok(bytes.to_vec())
    }
}

/// The production [`LinkConnector`]: reqwest over the pinned verifier, and
/// a tokio-rustls handshake for probes.
#[derive(Debug, Clone, Copy)]
pub struct PinnedConnector {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for PinnedConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[async_trait]
impl LinkConnector for PinnedConnector {
    fn http_client(&self, pin: Option<Fingerprint>) -> Result<Arc<dyn HttpPost>, TransportError> {
        let client =
            PinnedHttpsClient::with_timeouts(pin, self.connect_timeout, self.request_timeout)?;
        Ok(Arc::new(client))
    }

    async fn probe(&self, host: &str, port: u16) -> Result<Fingerprint, TransportError> {
        probe_fingerprint(host, port, self.connect_timeout).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
