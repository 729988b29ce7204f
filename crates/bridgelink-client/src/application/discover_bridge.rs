//! DiscoveryEngine: finds bridges advertising the well-known service type.
//!
//! # Two modes
//!
//! - [`DiscoveryEngine::watch`] is continuous.  It yields a fresh snapshot of
//!   the candidate set every time the set changes, deduplicated by
//!   `(host, port)`.  Instances that stop advertising disappear from later
//!   snapshots.  Nothing starts until the stream is first polled, and
//!   dropping the stream stops the browse and aborts pending resolves.
//! - [`DiscoveryEngine::discover_one`] is single-shot.  It resolves every
//!   instance the browse reports, concurrently, and returns the first one
//!   that resolves.  Nothing by the deadline is `Ok(None)`, not an error.
//!
//! In both modes only a failure to *start* browsing is an error.  A single
//! instance that fails to resolve is logged and skipped.
//!
//! # Handle release
//!
//! The browse handle lives in a [`BrowseGuard`] and in-flight resolves live
//! in a [`JoinSet`].  Both are owned by the call (or the stream), so every
//! exit path, including cancellation and panics, stops the browse and aborts
//! the resolves.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridgelink_core::domain::candidate::SERVICE_TYPE;
use bridgelink_core::{CandidateSet, DiscoveredCandidate};
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::infrastructure::discovery::{
    BrowseEvent, BrowseGuard, DiscoveryError, DiscoveryProvider, ServiceInstance,
};

pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(5_000);

type ResolveOutcome = (String, Result<DiscoveredCandidate, DiscoveryError>);

/// Delivers at most one value, no matter how many tasks race to complete it.
///
/// The flag is claimed with a single compare-exchange; only the winner
/// touches the sender.
pub struct OnceSlot<T> {
    claimed: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> OnceSlot<T> {
    pub fn channel() -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Self {
            claimed: AtomicBool::new(false),
            sender: Mutex::new(Some(tx)),
        });
        (slot, rx)
    }

    /// Returns `true` only for the call that delivered the value.
    pub fn complete(&self, value: T) -> bool {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        sender.is_some_and(|tx| tx.send(value).is_ok())
    }

    pub fn is_completed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

pub struct DiscoveryEngine {
    provider: Arc<dyn DiscoveryProvider>,
    service_type: String,
}

impl DiscoveryEngine {
    pub fn new(provider: Arc<dyn DiscoveryProvider>) -> Self {
        Self::with_service_type(provider, SERVICE_TYPE)
    }

    pub fn with_service_type(
        provider: Arc<dyn DiscoveryProvider>,
        service_type: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            service_type: service_type.into(),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Continuous discovery.
    ///
    /// The first item is `Err` (and the last) when browsing cannot start.
    pub fn watch(&self) -> BoxStream<'static, Result<Vec<DiscoveredCandidate>, DiscoveryError>> {
        let start = WatchState::Idle {
            provider: Arc::clone(&self.provider),
            service_type: self.service_type.clone(),
        };
        stream::unfold(start, |state| async move {
            match state {
                WatchState::Idle {
                    provider,
                    service_type,
                } => match provider.start_browse(&service_type) {
                    Ok(session) => {
                        info!(%service_type, browse_id = session.id, "continuous discovery started");
                        let mut watch = Watch {
                            guard: BrowseGuard::new(Arc::clone(&provider), session.id),
                            provider,
                            events: session.events,
                            candidates: CandidateSet::new(),
                            resolving: JoinSet::new(),
                            pending: HashMap::new(),
                            browse_open: true,
                        };
                        let item = watch.next_snapshot().await?;
                        Some((Ok(item), WatchState::Running(Box::new(watch))))
                    }
                    Err(e) => Some((Err(e), WatchState::Done)),
                },
                WatchState::Running(mut watch) => {
                    let item = watch.next_snapshot().await?;
                    Some((Ok(item), WatchState::Running(watch)))
                }
                WatchState::Done => None,
            }
        })
        .boxed()
    }

    /// Single-shot discovery with the default 5000 ms deadline.
    pub async fn discover(&self) -> Result<Option<DiscoveredCandidate>, DiscoveryError> {
        self.discover_one(DEFAULT_DISCOVERY_TIMEOUT, &CancellationToken::new())
            .await
    }

    /// Returns the first candidate that resolves before `timeout`.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::BrowseFailed`] when browsing cannot start, and
    /// [`DiscoveryError::Cancelled`] when `cancel` fires first.
    pub async fn discover_one(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<DiscoveredCandidate>, DiscoveryError> {
        let session = self.provider.start_browse(&self.service_type)?;
        let _guard = BrowseGuard::new(Arc::clone(&self.provider), session.id);
        let mut events = session.events;
        debug!(service_type = %self.service_type, browse_id = session.id, ?timeout, "single-shot discovery started");

        let (slot, mut found) = OnceSlot::<DiscoveredCandidate>::channel();
        let mut resolving = JoinSet::new();
        let mut browse_open = true;
        let mut deadline = pin!(tokio::time::sleep(timeout));

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("single-shot discovery cancelled");
                    return Err(DiscoveryError::Cancelled);
                }
                winner = &mut found => {
                    let candidate = winner.ok();
                    if let Some(c) = &candidate {
                        info!(name = %c.name, host = %c.host, port = c.port, "bridge found");
                    }
                    return Ok(candidate);
                }
                _ = &mut deadline => {
                    info!(?timeout, "no bridge found before deadline");
                    return Ok(None);
                }
                event = events.recv(), if browse_open => match event {
                    Some(BrowseEvent::Found(instance)) => {
                        let provider = Arc::clone(&self.provider);
                        let slot = Arc::clone(&slot);
                        resolving.spawn(async move {
                            match provider.resolve(&instance).await {
                                Ok(candidate) => {
                                    slot.complete(candidate);
                                }
                                Err(e) => debug!(name = %instance.name, error = %e, "resolve failed; skipping"),
                            }
                        });
                    }
                    Some(BrowseEvent::Lost(instance)) => {
                        debug!(name = %instance.name, "instance lost before resolving");
                    }
                    None => {
                        debug!("browse ended; waiting for pending resolves or deadline");
                        browse_open = false;
                    }
                },
                Some(_) = resolving.join_next(), if !resolving.is_empty() => {}
            }
        }
    }
}

enum WatchState {
    Idle {
        provider: Arc<dyn DiscoveryProvider>,
        service_type: String,
    },
    Running(Box<Watch>),
    Done,
}

struct Watch {
    // Dropped with the stream, which stops the browse.
    guard: BrowseGuard,
    provider: Arc<dyn DiscoveryProvider>,
    events: mpsc::UnboundedReceiver<BrowseEvent>,
    candidates: CandidateSet,
    resolving: JoinSet<ResolveOutcome>,
    pending: HashMap<String, AbortHandle>,
    browse_open: bool,
}

impl Watch {
    /// Drives the browse until the candidate set changes.  `None` once the
    /// browse has ended and nothing is left to resolve.
    async fn next_snapshot(&mut self) -> Option<Vec<DiscoveredCandidate>> {
        loop {
            if !self.browse_open && self.resolving.is_empty() {
                debug!(browse_id = self.guard.id(), "continuous discovery finished");
                return None;
            }

            tokio::select! {
                event = self.events.recv(), if self.browse_open => match event {
                    Some(BrowseEvent::Found(instance)) => self.start_resolve(instance),
                    Some(BrowseEvent::Lost(instance)) => {
                        if let Some(handle) = self.pending.remove(&instance.name) {
                            handle.abort();
                        }
                        if self.candidates.remove_by_name(&instance.name).is_some() {
                            debug!(name = %instance.name, "candidate withdrawn");
                            return Some(self.candidates.snapshot());
                        }
                    }
                    None => self.browse_open = false,
                },
                Some(joined) = self.resolving.join_next(), if !self.resolving.is_empty() => {
                    // Aborted resolves surface as JoinErrors and are ignored.
                    let Ok((name, outcome)) = joined else { continue };
                    self.pending.remove(&name);
                    match outcome {
                        Ok(candidate) => {
                            if self.candidates.upsert(candidate).changed() {
                                return Some(self.candidates.snapshot());
                            }
                        }
                        Err(e) => debug!(%name, error = %e, "resolve failed; skipping"),
                    }
                }
            }
        }
    }

    fn start_resolve(&mut self, instance: ServiceInstance) {
        if let Some(previous) = self.pending.remove(&instance.name) {
            previous.abort();
        }
        let provider = Arc::clone(&self.provider);
        let name = instance.name.clone();
        let handle = self.resolving.spawn(async move {
            let outcome = provider.resolve(&instance).await;
            (instance.name, outcome)
        });
        self.pending.insert(name, handle);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
