//! Typed transport error taxonomy.
//!
//! Every failure that can come out of the network path is one of the
//! variants below.  The retry executor inspects the variant (never the
//! message text) to decide whether another attempt is worthwhile, which is
//! why transport code must never hand back an untyped error.
//!
//! | Variant                | Retryable            | Surfaced to the user      |
//! |------------------------|----------------------|---------------------------|
//! | `ConnectionFailed`     | yes                  | silently during discovery |
//! | `Timeout`              | yes                  | silently during discovery |
//! | `ServerError{code}`    | only for 5xx         | yes                       |
//! | `RateLimited`          | yes                  | no                        |
//! | `AuthenticationFailed` | no                   | yes                       |
//! | `CertificateError`     | no                   | prominently (attack)      |
//! | `Offline`              | no                   | yes                       |
//! | `Rpc{code,message}`    | no                   | yes                       |
//! | `ProtocolViolation`    | no                   | yes                       |
//! | `Cancelled`            | no                   | no                        |

use std::time::Duration;

use thiserror::Error;

/// Errors returned by the RPC transport and the event channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The TCP/TLS connection could not be established or was dropped.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The operation did not complete before its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered with a non-success HTTP status.
    #[error("server returned HTTP {code}")]
    ServerError { code: u16 },

    /// The server rejected our credentials (HTTP 401/403).
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The server's certificate did not match the pinned fingerprint.
    #[error("certificate rejected: {0}")]
    CertificateError(String),

    /// The device reports no network connectivity.
    #[error("device is offline")]
    Offline,

    /// The server asked us to slow down (HTTP 429).
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The JSON-RPC envelope carried a non-null `error` member.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The response did not follow the JSON-RPC contract.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
}

impl TransportError {
    /// Default retry classification.
    ///
    /// Network-classified failures are retryable; anything that indicates a
    /// security problem, a permanent rejection, or a broken peer is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::ConnectionFailed(_) | TransportError::Timeout(_) => true,
            TransportError::ServerError { code } => (500..600).contains(code),
            TransportError::RateLimited { .. } => true,
            TransportError::AuthenticationFailed
            | TransportError::CertificateError(_)
            | TransportError::Offline
            | TransportError::Rpc { .. }
            | TransportError::ProtocolViolation(_)
            | TransportError::Cancelled => false,
        }
    }

    /// Returns `true` for errors that may indicate an active attack and must
    /// be surfaced prominently rather than retried in the background.
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, TransportError::CertificateError(_))
    }

    /// Minimum wait the server asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Free-function form of [`TransportError::is_retryable`], convenient as a
/// predicate argument.
pub fn is_retryable(error: &TransportError) -> bool {
    error.is_retryable()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
