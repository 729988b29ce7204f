//! Platform service-discovery capability.
//!
//! mDNS/DNS-SD is provided by the operating system on every target we care
//! about (NSD on Android, Bonjour on Apple platforms, Avahi on Linux), each
//! with its own callback API.  The discovery engine only needs three things
//! from any of them, captured by [`DiscoveryProvider`]:
//!
//! 1. start browsing a service type and get a stream of found/lost instances,
//! 2. stop that browse,
//! 3. resolve one instance to host, port, addresses and TXT attributes.
//!
//! Discovery only *reports* the fingerprint a bridge advertises in its TXT
//! record.  Enforcing it is the TLS layer's job (see
//! [`crate::infrastructure::rpc::https`]).

use std::sync::Arc;

use async_trait::async_trait;
use bridgelink_core::DiscoveredCandidate;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

pub mod mock;
pub mod static_hosts;

pub use mock::MockDiscoveryProvider;
pub use static_hosts::StaticHostsProvider;

/// Provider-assigned handle for one browse operation.
pub type BrowseId = u64;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Browsing could not be started.  Fatal for the discovery call.
    #[error("failed to start browsing {service_type}: platform error {code}")]
    BrowseFailed { service_type: String, code: i32 },

    /// One instance could not be resolved.  Skipped, never fatal.
    #[error("failed to resolve {name}: platform error {code}")]
    ResolveFailed { name: String, code: i32 },

    #[error("discovery cancelled")]
    Cancelled,
}

/// A service instance seen by a browse, not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceInstance {
    pub name: String,
    pub service_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Found(ServiceInstance),
    Lost(ServiceInstance),
}

/// A running browse: its handle and the events it produces.
///
/// The channel closes when the provider ends the browse.
#[derive(Debug)]
pub struct BrowseSession {
    pub id: BrowseId,
    pub events: mpsc::UnboundedReceiver<BrowseEvent>,
}

#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Starts browsing for `service_type`.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::BrowseFailed`] carrying the platform error code.
    fn start_browse(&self, service_type: &str) -> Result<BrowseSession, DiscoveryError>;

    /// Stops a browse.  Unknown or already-stopped ids are ignored.
    fn stop_browse(&self, id: BrowseId);

    /// Resolves `instance` to a connectable candidate.
    ///
    /// Dropping the returned future must cancel the platform resolve.
    async fn resolve(
        &self,
        instance: &ServiceInstance,
    ) -> Result<DiscoveredCandidate, DiscoveryError>;
}

/// Stops the browse it holds when dropped, on every exit path.
pub struct BrowseGuard {
    provider: Arc<dyn DiscoveryProvider>,
    id: BrowseId,
}

impl BrowseGuard {
    pub fn new(provider: Arc<dyn DiscoveryProvider>, id: BrowseId) -> Self {
        Self { provider, id }
    }

    pub fn id(&self) -> BrowseId {
        self.id
    }
}

impl Drop for BrowseGuard {
    fn drop(&mut self) {
        debug!(browse_id = self.id, "stopping browse");
        self.provider.stop_browse(self.id);
    }
}
