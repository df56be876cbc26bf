//! Subscriber binding.
//!
//! A [`Subscription`] is what a UI unit holds while it is mounted: it
//! registers the key with the scheduler, kicks off the initial load and
//! republishes a [`QueryState`] on every store change. Invalidating a
//! mounted key reloads it in the background through the scheduler.
//! Dropping the subscription unmounts.

use std::sync::Arc;

use freshet_core::{CacheEntry, CacheError, CacheKey, CacheResult, Clock, RevalidationPolicy};
use tokio::sync::watch;
use tracing::debug;

use crate::clock::TokioClock;
use crate::coordinator::{FetchCoordinator, FetchOptions};
use crate::events::ListenerHandle;
use crate::invalidation::Invalidator;
use crate::lifecycle::LifecycleEventSource;
use crate::loader::Loader;
use crate::scheduler::{RevalidationScheduler, ScheduleHandle};
use crate::store::CacheStore;

/// What a subscriber renders.
#[derive(Debug)]
pub struct QueryState<V> {
    /// Last committed value, kept through revalidation and failures.
    pub data: Option<Arc<V>>,
    /// First load in progress; nothing to show yet.
    pub is_loading: bool,
    /// Background refresh of existing data in progress.
    pub is_validating: bool,
    pub error: Option<CacheError>,
}

impl<V> QueryState<V> {
    pub fn from_entry(entry: &CacheEntry<V>) -> Self {
        Self {
            data: entry.value.clone(),
            is_loading: entry.value.is_none() && entry.in_flight,
            is_validating: entry.value.is_some() && entry.in_flight,
            error: entry.last_error.clone(),
        }
    }
}

impl<V> Default for QueryState<V> {
    fn default() -> Self {
        Self {
            data: None,
            is_loading: false,
            is_validating: false,
            error: None,
        }
    }
}

impl<V> Clone for QueryState<V> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            is_loading: self.is_loading,
            is_validating: self.is_validating,
            error: self.error.clone(),
        }
    }
}

/// Entry point tying store, coordinator and scheduler together.
pub struct QueryClient<V> {
    store: CacheStore<V>,
    coordinator: FetchCoordinator<V>,
    scheduler: RevalidationScheduler<V>,
}

impl<V> Clone for QueryClient<V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            coordinator: self.coordinator.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<V: Send + Sync + 'static> QueryClient<V> {
    /// Client on the tokio clock.
    pub fn new(lifecycle: Arc<dyn LifecycleEventSource>) -> Self {
        Self::with_clock(Arc::new(TokioClock), lifecycle)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, lifecycle: Arc<dyn LifecycleEventSource>) -> Self {
        let store = CacheStore::new(clock);
        let coordinator = FetchCoordinator::new(store.clone());
        let scheduler = RevalidationScheduler::new(coordinator.clone(), lifecycle);
        Self {
            store,
            coordinator,
            scheduler,
        }
    }

    pub fn store(&self) -> &CacheStore<V> {
        &self.store
    }

    pub fn coordinator(&self) -> &FetchCoordinator<V> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &RevalidationScheduler<V> {
        &self.scheduler
    }

    /// Invalidator over this client's store.
    pub fn invalidator(&self) -> Invalidator {
        Invalidator::new().with_store(&self.store)
    }

    /// One-shot `ensure_fresh` for callers that do not stay subscribed.
    pub async fn fetch(
        &self,
        key: &str,
        loader: Arc<dyn Loader<V>>,
        policy: RevalidationPolicy,
    ) -> CacheResult<Arc<V>> {
        self.coordinator
            .ensure_fresh(key, &loader, &policy, FetchOptions::default())
            .await
    }

    /// Mount a subscriber for `key`.
    ///
    /// Starts a load unless the entry is fresh. Results and failures are
    /// reported through [`Subscription::state`].
    pub fn subscribe(
        &self,
        key: &str,
        loader: Arc<dyn Loader<V>>,
        policy: RevalidationPolicy,
    ) -> Subscription<V> {
        let key = CacheKey::from(key);
        let (state_tx, state_rx) = watch::channel(QueryState::default());
        let state_tx = Arc::new(state_tx);

        // Listen before the first snapshot so no change falls in between.
        let listener = self.store.subscribe(key.as_str(), {
            let store = self.store.clone();
            let state_tx = Arc::clone(&state_tx);
            move |event| {
                let state = store
                    .peek(event.key.as_str())
                    .map(|entry| QueryState::from_entry(&entry))
                    .unwrap_or_default();
                state_tx.send_replace(state);
            }
        });
        state_tx.send_replace(QueryState::from_entry(&self.store.get(key.as_str())));
        let schedule = self
            .scheduler
            .register(key.as_str(), Arc::clone(&loader), policy);

        debug!(key = %key, "Subscriber mounted");
        drop(
            self.coordinator
                .begin(key.as_str(), &loader, &policy, FetchOptions::default()),
        );

        Subscription {
            key,
            state: state_rx,
            loader,
            policy,
            coordinator: self.coordinator.clone(),
            schedule,
            listener,
        }
    }
}

/// A mounted subscriber.
///
/// Dropping it unregisters from the scheduler and the store. A load that
/// is still running completes into the cache but is no longer reported here.
pub struct Subscription<V: Send + Sync + 'static> {
    key: CacheKey,
    state: watch::Receiver<QueryState<V>>,
    loader: Arc<dyn Loader<V>>,
    policy: RevalidationPolicy,
    coordinator: FetchCoordinator<V>,
    schedule: ScheduleHandle<V>,
    listener: ListenerHandle,
}

impl<V: Send + Sync + 'static> Subscription<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn policy(&self) -> &RevalidationPolicy {
        &self.policy
    }

    /// Current state.
    pub fn state(&self) -> QueryState<V> {
        self.state.borrow().clone()
    }

    /// Wait for the next state change.
    pub async fn changed(&mut self) -> QueryState<V> {
        if self.state.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        self.state.borrow_and_update().clone()
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for(&mut self, mut predicate: impl FnMut(&QueryState<V>) -> bool) -> QueryState<V> {
        if let Ok(state) = self.state.wait_for(|state| predicate(state)).await {
            return state.clone();
        }
        self.state()
    }

    /// Reload now, ignoring the staleness window.
    pub async fn refresh(&self) -> CacheResult<Arc<V>> {
        self.coordinator
            .ensure_fresh(self.key.as_str(), &self.loader, &self.policy, FetchOptions::force())
            .await
    }

    /// Unmount.
    pub fn unsubscribe(self) {
        debug!(key = %self.key, "Subscriber unmounted");
    }
}

impl<V: Send + Sync + 'static> std::fmt::Debug for Subscription<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("policy", &self.policy)
            .field("schedule", &self.schedule)
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}
