//! # bridgelink-core
//!
//! Shared library for BridgeLink containing the domain entities, wire
//! envelopes, transport error taxonomy, and the pure backoff policy used by
//! the companion-device client.
//!
//! It has zero dependencies on OS APIs, network sockets, or async runtimes.
//!
//! # Architecture overview (for beginners)
//!
//! A companion device (phone, laptop) needs to find a single trusted server
//! on the local network, called the **bridge**, and talk to it safely even
//! though anybody on the same Wi-Fi could pretend to be that bridge.
//!
//! This crate defines the vocabulary the client uses to make that decision:
//!
//! - **`domain`** – Candidates produced by discovery, trust records used for
//!   trust-on-first-use (TOFU) pinning, the single active server
//!   configuration, and the events the UI subscribes to.
//!
//! - **`protocol`** – JSON-RPC 2.0 envelopes, the process-wide request id
//!   counter, the WebSocket URL derivation and its registration frame.
//!
//! - **`error`** – The typed [`TransportError`] taxonomy.  Every transport
//!   failure is a typed value so the retry executor can decide whether a
//!   retry is worthwhile.
//!
//! - **`backoff`** – The exponential backoff formula with jitter.
//!
//! - **`time`** – An injectable wall clock so trust and expiry decisions can
//!   be tested without sleeping.

pub mod backoff;
pub mod domain;
pub mod error;
pub mod protocol;
pub mod time;

// Re-export the most-used types at the crate root so callers can write
// `bridgelink_core::TrustRecord` instead of the full module path.
pub use backoff::BackoffPolicy;
pub use domain::candidate::{CandidateKey, CandidateSet, DiscoveredCandidate};
pub use domain::events::{ConfigChange, LinkEvent};
pub use domain::fingerprint::{Fingerprint, FingerprintError};
pub use domain::server_config::{ActiveServerConfig, ConfigSource};
pub use domain::trust::{TrustRecord, TrustStatus};
pub use error::TransportError;
pub use protocol::rpc::{RpcErrorObject, RpcRequest, RpcResponse};
pub use time::{Clock, ManualClock, SystemClock};
