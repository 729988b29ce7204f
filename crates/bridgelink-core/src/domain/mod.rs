//! Domain entities for BridgeLink.
//!
//! Pure data and state machines with no infrastructure dependencies.  Code
//! in the client crate (discovery, transport, storage) depends on these
//! types; these types never depend on it.

pub mod candidate;
pub mod events;
pub mod fingerprint;
pub mod provisioning;
pub mod server_config;
pub mod trust;
