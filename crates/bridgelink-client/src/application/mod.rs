//! Application layer use cases for the BridgeLink client.
//!
//! - **`discover_bridge`** – Finds bridges on the LAN, either as a continuous
//!   stream of candidate snapshots or as a single-shot race against a
//!   deadline.
//!
//! - **`retry`** – Runs transport operations under the backoff policy with
//!   cancellation and a hard deadline.
//!
//! - **`trust_store`** – Trust-on-first-use pinning of bridge certificates
//!   and the per-bridge provisioning secrets.
//!
//! - **`resolve_config`** – The single active server configuration, its
//!   source precedence and signed provisioning links.
//!
//! - **`pair_bridge`** – Pairing with a discovered bridge and making pinned,
//!   retried calls to it.

pub mod discover_bridge;
pub mod pair_bridge;
pub mod resolve_config;
pub mod retry;
pub mod trust_store;
