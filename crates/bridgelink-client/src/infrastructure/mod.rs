//! Infrastructure layer for the BridgeLink client.
//!
//! **Dependency rule**: this layer may depend on `bridgelink_core`, but the
//! `application` layer only reaches it through the traits declared here
//! (`DiscoveryProvider`, `HttpPost`, `LinkConnector`, `KeyValueStore`).
//!
//! # Sub-modules
//!
//! - **`discovery`** – The platform service-discovery capability, a
//!   scriptable mock, and a static-address provider.
//!
//! - **`rpc`** – JSON-RPC over certificate-pinned HTTPS and the push-event
//!   WebSocket.
//!
//! - **`storage`** – Key-value persistence for trust and config state, and
//!   the on-disk settings file.

pub mod discovery;
pub mod rpc;
pub mod storage;
