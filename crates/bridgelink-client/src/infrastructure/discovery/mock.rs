//! Mock discovery provider for tests and for running the client without a
//! platform mDNS stack.
//!
//! Services are registered up front with [`MockDiscoveryProvider::add_service`]
//! (announced as soon as a browse starts) or announced later with
//! [`MockDiscoveryProvider::announce`].  Each service carries a scripted
//! resolve outcome and an optional resolve delay.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bridgelink_core::DiscoveredCandidate;
use tokio::sync::mpsc::{self, UnboundedSender};

use super::{
    BrowseEvent, BrowseId, BrowseSession, DiscoveryError, DiscoveryProvider, ServiceInstance,
};

#[derive(Debug, Clone)]
struct ScriptedService {
    outcome: Result<DiscoveredCandidate, DiscoveryError>,
    delay: Duration,
}

/// A scriptable [`DiscoveryProvider`].
#[derive(Debug, Default)]
pub struct MockDiscoveryProvider {
    services: Mutex<BTreeMap<String, ScriptedService>>,
    browses: Mutex<HashMap<BrowseId, (String, UnboundedSender<BrowseEvent>)>>,
    start_error: Mutex<Option<i32>>,
    next_id: AtomicU64,
    stopped: Mutex<Vec<BrowseId>>,
    resolve_calls: AtomicUsize,
}

impl MockDiscoveryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `start_browse` fail with platform `code`.
    pub fn fail_browse_with(&self, code: i32) {
        *self.start_error.lock().expect("lock poisoned") = Some(code);
    }

    /// Registers a service that resolves to `candidate` after `delay`.
    pub fn add_service(&self, candidate: DiscoveredCandidate, delay: Duration) {
        let name = candidate.name.clone();
        self.services.lock().expect("lock poisoned").insert(
            name,
            ScriptedService {
                outcome: Ok(candidate),
                delay,
            },
        );
    }

    /// Registers a service whose resolution fails with platform `code`.
    pub fn add_unresolvable(&self, name: &str, code: i32, delay: Duration) {
        self.services.lock().expect("lock poisoned").insert(
            name.to_string(),
            ScriptedService {
                outcome: Err(DiscoveryError::ResolveFailed {
                    name: name.to_string(),
                    code,
                }),
                delay,
            },
        );
    }

    /// Registers `candidate` and announces it to every running browse.
    pub fn announce(&self, candidate: DiscoveredCandidate, delay: Duration) {
        let name = candidate.name.clone();
        self.add_service(candidate, delay);
        self.broadcast(|service_type| {
            BrowseEvent::Found(ServiceInstance {
                name: name.clone(),
                service_type: service_type.to_string(),
            })
        });
    }

    /// Forgets `name` and tells every running browse it is gone.
    pub fn withdraw(&self, name: &str) {
        self.services.lock().expect("lock poisoned").remove(name);
        self.broadcast(|service_type| {
            BrowseEvent::Lost(ServiceInstance {
                name: name.to_string(),
                service_type: service_type.to_string(),
            })
        });
    }

    /// Ends every running browse from the provider side.
    pub fn end_browses(&self) {
        self.browses.lock().expect("lock poisoned").clear();
    }

    fn broadcast(&self, make: impl Fn(&str) -> BrowseEvent) {
        let browses = self.browses.lock().expect("lock poisoned");
        for (service_type, tx) in browses.values() {
            let _ = tx.send(make(service_type));
        }
    }

    /// Browses that have been started and not yet stopped.
    pub fn active_browses(&self) -> usize {
        self.browses.lock().expect("lock poisoned").len()
    }

    /// Ids passed to `stop_browse`, in call order.
    pub fn stopped_browses(&self) -> Vec<BrowseId> {
        self.stopped.lock().expect("lock poisoned").clone()
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoveryProvider for MockDiscoveryProvider {
    fn start_browse(&self, service_type: &str) -> Result<BrowseSession, DiscoveryError> {
        if let Some(code) = *self.start_error.lock().expect("lock poisoned") {
            return Err(DiscoveryError::BrowseFailed {
                service_type: service_type.to_string(),
                code,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        for name in self.services.lock().expect("lock poisoned").keys() {
            let _ = tx.send(BrowseEvent::Found(ServiceInstance {
                name: name.clone(),
                service_type: service_type.to_string(),
            }));
        }
        self.browses
            .lock()
            .expect("lock poisoned")
            .insert(id, (service_type.to_string(), tx));
        Ok(BrowseSession { id, events: rx })
    }

    fn stop_browse(&self, id: BrowseId) {
        self.browses.lock().expect("lock poisoned").remove(&id);
        self.stopped.lock().expect("lock poisoned").push(id);
    }

    async fn resolve(
        &self,
        instance: &ServiceInstance,
    ) -> Result<DiscoveredCandidate, DiscoveryError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .services
            .lock()
            .expect("lock poisoned")
            .get(&instance.name)
            .cloned();
        match scripted {
            Some(service) => {
                if !service.delay.is_zero() {
                    tokio::time::sleep(service.delay).await;
                }
                service.outcome
            }
            None => Err(DiscoveryError::ResolveFailed {
                name: instance.name.clone(),
                code: -1,
            }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
