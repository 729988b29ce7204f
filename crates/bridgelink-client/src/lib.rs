//! bridgelink-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does bridgelink-client do? (for beginners)
//!
//! A companion device (phone, tablet, laptop) talks to one **bridge**
//! server on the local network.  Anybody on the same network could pretend
//! to be that bridge, so the client:
//!
//! 1. Discovers bridges advertising the well-known service type.
//! 2. On first contact, shows the bridge's certificate fingerprint to the
//!    user and pins it once confirmed (trust on first use).
//! 3. Pins every later HTTPS and WebSocket connection to that fingerprint,
//!    and raises an identity-conflict alert if the bridge ever presents a
//!    different one.
//! 4. Makes JSON-RPC calls with exponential backoff and a hard deadline.
//! 5. Keeps exactly one active server configuration, which a trusted bridge
//!    can update through a signed provisioning link.

/// Application layer: use cases for the client.
pub mod application;

/// Infrastructure layer: discovery, transport, and storage adapters.
pub mod infrastructure;
