//! Fetch coordinator.
//!
//! Decides whether a key needs loading and runs the load at most once per
//! in-flight window. Loads run in their own tokio task so a caller that
//! stops waiting never aborts the network call.

use std::sync::Arc;

use freshet_core::{CacheError, CacheResult, RevalidationPolicy};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::loader::Loader;
use crate::stats::CacheStats;
use crate::store::{CacheStore, CommitOutcome, InFlightClaim, InFlightWaiter, LoadTicket};

/// Options for a single `ensure_fresh` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Bypass the staleness window and supersede any outstanding load.
    pub force: bool,
}

impl FetchOptions {
    pub fn force() -> Self {
        Self { force: true }
    }
}

/// Immediate result of [`FetchCoordinator::begin`].
pub enum Fetch<V> {
    /// The entry was fresh; no I/O happened.
    Ready(Arc<V>),
    /// A load is running (started by this call or joined).
    Pending(InFlightWaiter<V>),
}

impl<V> Fetch<V> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Wait for the value.
    pub async fn resolve(self) -> CacheResult<Arc<V>> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Pending(waiter) => waiter.wait().await,
        }
    }
}

/// Runs loads against a [`CacheStore`].
pub struct FetchCoordinator<V> {
    store: CacheStore<V>,
    runtime: Option<Handle>,
}

impl<V> Clone for FetchCoordinator<V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<V: Send + Sync + 'static> FetchCoordinator<V> {
    /// Create a coordinator. The current tokio runtime, if any, is captured
    /// for loads started from outside a runtime context later on.
    pub fn new(store: CacheStore<V>) -> Self {
        Self {
            store,
            runtime: Handle::try_current().ok(),
        }
    }

    /// Use an explicit runtime for spawned loads.
    pub fn with_runtime(store: CacheStore<V>, runtime: Handle) -> Self {
        Self {
            store,
            runtime: Some(runtime),
        }
    }

    pub fn store(&self) -> &CacheStore<V> {
        &self.store
    }

    pub(crate) fn runtime(&self) -> Option<Handle> {
        Handle::try_current().ok().or_else(|| self.runtime.clone())
    }

    /// Return the cached value if fresh, otherwise start or join a load.
    ///
    /// Never blocks: a needed load is spawned and the returned
    /// [`Fetch::Pending`] resolves when it settles.
    pub fn begin(
        &self,
        key: &str,
        loader: &Arc<dyn Loader<V>>,
        policy: &RevalidationPolicy,
        opts: FetchOptions,
    ) -> Fetch<V> {
        let counters = self.store.counters();

        if !opts.force {
            let entry = self.store.get(key);
            if entry.is_fresh(self.store.clock().now()) {
                if let Some(value) = entry.value {
                    CacheStats::bump(&counters.hits);
                    trace!(key, "Cache hit");
                    return Fetch::Ready(value);
                }
            }
        }

        if opts.force {
            CacheStats::bump(&counters.forced_loads);
        } else {
            CacheStats::bump(&counters.misses);
        }
        match self.store.mark_in_flight(key, opts.force) {
            InFlightClaim::Joined(waiter) => Fetch::Pending(waiter),
            InFlightClaim::Started(ticket) => {
                let waiter = ticket.waiter();
                self.spawn_load(ticket, Arc::clone(loader), *policy);
                Fetch::Pending(waiter)
            }
        }
    }

    /// Ensure `key` is fresh and return its value.
    ///
    /// A loader failure is returned to this caller and to every caller
    /// sharing the same load. Failures are never retried here.
    pub async fn ensure_fresh(
        &self,
        key: &str,
        loader: &Arc<dyn Loader<V>>,
        policy: &RevalidationPolicy,
        opts: FetchOptions,
    ) -> CacheResult<Arc<V>> {
        self.begin(key, loader, policy, opts).resolve().await
    }

    fn spawn_load(&self, ticket: LoadTicket<V>, loader: Arc<dyn Loader<V>>, policy: RevalidationPolicy) {
        let task = run_load(self.store.clone(), ticket, loader, policy);
        match self.runtime() {
            Some(runtime) => {
                runtime.spawn(task);
            }
            None => {
                // Dropping the unpolled task drops its ticket, which abandons the load.
                warn!("No tokio runtime available to run load");
                drop(task);
            }
        }
    }
}

async fn run_load<V: Send + Sync + 'static>(
    store: CacheStore<V>,
    ticket: LoadTicket<V>,
    loader: Arc<dyn Loader<V>>,
    policy: RevalidationPolicy,
) {
    let key = ticket.key().clone();
    let seq = ticket.seq();
    let ctx = ticket.context();
    debug!(key = %key, seq, "Starting load");

    match loader.load(ctx.clone()).await {
        Ok(value) => {
            if store.commit(ticket, value, policy.expiration) == CommitOutcome::Applied {
                debug!(key = %key, seq, expiration_ms = policy.expiration.as_millis() as u64, "Load committed");
            }
        }
        Err(_) if ctx.is_cancelled() => {
            debug!(key = %key, seq, "Load cancelled");
            store.cancel(ticket);
        }
        Err(source) => {
            warn!(key = %key, seq, error = %source, "Load failed");
            store.fail(ticket, CacheError::load_failed(key, source));
        }
    }
}
