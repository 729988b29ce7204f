//! Discovery from a fixed list of bridge addresses.
//!
//! Used on networks where multicast DNS is filtered, and by the CLI on
//! hosts without a platform resolver binding.  Every browse announces the
//! configured bridges once and then ends; resolving an entry looks its host
//! name up with the system resolver.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bridgelink_core::DiscoveredCandidate;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    BrowseEvent, BrowseId, BrowseSession, DiscoveryError, DiscoveryProvider, ServiceInstance,
};
use crate::infrastructure::storage::settings::StaticBridge;

/// Platform-style error code for a host name that did not resolve.
pub const LOOKUP_FAILED: i32 = -1;

pub struct StaticHostsProvider {
    bridges: HashMap<String, StaticBridge>,
    next_id: AtomicU64,
}

impl StaticHostsProvider {
    pub fn new(bridges: impl IntoIterator<Item = StaticBridge>) -> Self {
        Self {
            bridges: bridges.into_iter().map(|b| (b.name.clone(), b)).collect(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }
}

#[async_trait]
impl DiscoveryProvider for StaticHostsProvider {
    fn start_browse(&self, service_type: &str) -> Result<BrowseSession, DiscoveryError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        for name in self.bridges.keys() {
            let _ = tx.send(BrowseEvent::Found(ServiceInstance {
                name: name.clone(),
                service_type: service_type.to_string(),
            }));
        }
        debug!(browse_id = id, count = self.bridges.len(), "announced static bridges");
        // Dropping `tx` ends the browse once the announcements are read.
        Ok(BrowseSession { id, events: rx })
    }

    // Browses end by themselves once every bridge is announced.
    fn stop_browse(&self, id: BrowseId) {
        debug!(browse_id = id, "static browse stopped");
    }

    async fn resolve(
        &self,
        instance: &ServiceInstance,
    ) -> Result<DiscoveredCandidate, DiscoveryError> {
        let unresolved = || DiscoveryError::ResolveFailed {
            name: instance.name.clone(),
            code: LOOKUP_FAILED,
        };
        let bridge = self.bridges.get(&instance.name).ok_or_else(unresolved)?;

        let addresses: Vec<IpAddr> = match bridge.host.parse::<IpAddr>() {
            Ok(literal) => vec![literal],
            Err(_) => tokio::net::lookup_host((bridge.host.as_str(), bridge.port))
                .await
                .map_err(|e| {
                    debug!(host = %bridge.host, error = %e, "static bridge lookup failed");
                    unresolved()
                })?
                .map(|addr| addr.ip())
                .collect(),
        };
        if addresses.is_empty() {
            return Err(unresolved());
        }

        Ok(DiscoveredCandidate::new(
            bridge.name.clone(),
            bridge.host.clone(),
            addresses,
            bridge.port,
            bridge.txt.clone(),
        ))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
