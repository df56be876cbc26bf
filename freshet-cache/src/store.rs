//! Keyed cache store.
//!
//! The store owns every [`CacheEntry`] and is mutated only through its
//! entry points: [`mark_in_flight`](CacheStore::mark_in_flight),
//! [`commit`](CacheStore::commit), [`fail`](CacheStore::fail),
//! [`invalidate`](CacheStore::invalidate) and [`evict`](CacheStore::evict).
//! Each is one short critical section; listeners run after the lock is
//! released so they may read the store again.
//!
//! # Sequencing
//!
//! Every started load takes the next number from a store-wide sequence and
//! records it as its key's latest. Only the load holding the latest number
//! may write the entry, so a slow load that was superseded by a forced
//! refresh cannot overwrite newer data. The sequence never restarts, so a
//! load issued before an eviction cannot match a load issued after it.
//! Invalidating a key while a load is outstanding marks that load's result
//! as stale on arrival.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use freshet_core::{CacheEntry, CacheError, CacheKey, CacheResult, Clock, LoadSeq};
use tokio::sync::watch;
use tracing::{debug, error, trace};

use crate::events::{CacheEvent, EventKind, Listener, ListenerHandle};
use crate::loader::LoadContext;
use crate::stats::{CacheStats, CacheStatsSnapshot};

type LoadOutcome<V> = CacheResult<Arc<V>>;
type OutcomeSender<V> = watch::Sender<Option<LoadOutcome<V>>>;
type OutcomeReceiver<V> = watch::Receiver<Option<LoadOutcome<V>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of settling a load against its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The entry was updated.
    Applied,
    /// A newer load was issued (or the key was evicted); the entry was left alone.
    Superseded,
}

/// Outcome of [`CacheStore::mark_in_flight`].
pub enum InFlightClaim<V> {
    /// The caller owns a new load and must settle the ticket.
    Started(LoadTicket<V>),
    /// A load is already running; wait on it instead.
    Joined(InFlightWaiter<V>),
}

impl<V> InFlightClaim<V> {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }
}

struct InFlight<V> {
    seq: LoadSeq,
    outcome: OutcomeReceiver<V>,
    cancel: watch::Sender<bool>,
}

struct Slot<V> {
    value: Option<Arc<V>>,
    fetched_at: Option<std::time::Instant>,
    expires_at: Option<std::time::Instant>,
    last_error: Option<CacheError>,
    failed_at: Option<std::time::Instant>,
    latest_seq: LoadSeq,
    /// Loads with a sequence at or below this commit as already stale.
    stale_through: LoadSeq,
    in_flight: Option<InFlight<V>>,
}

impl<V> Slot<V> {
    fn empty() -> Self {
        Self {
            value: None,
            fetched_at: None,
            expires_at: None,
            last_error: None,
            failed_at: None,
            latest_seq: 0,
            stale_through: 0,
            in_flight: None,
        }
    }

    fn snapshot(&self, key: &CacheKey) -> CacheEntry<V> {
        CacheEntry {
            key: key.clone(),
            value: self.value.clone(),
            fetched_at: self.fetched_at,
            expires_at: self.expires_at,
            in_flight: self.in_flight.is_some(),
            last_error: self.last_error.clone(),
            failed_at: self.failed_at,
            latest_seq: self.latest_seq,
        }
    }

    fn clear_in_flight(&mut self, seq: LoadSeq) {
        if self.in_flight.as_ref().is_some_and(|f| f.seq == seq) {
            self.in_flight = None;
        }
    }
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    by_key: HashMap<CacheKey, Vec<(u64, Listener)>>,
}

struct StoreInner<V> {
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<CacheKey, Slot<V>>>,
    listeners: Mutex<ListenerRegistry>,
    next_seq: AtomicU64,
    stats: CacheStats,
}

enum Settlement<V> {
    Value(Arc<V>, Duration),
    Error(CacheError),
    Cancelled,
}

/// Process-wide keyed map from cache key to entry.
pub struct CacheStore<V> {
    inner: Arc<StoreInner<V>>,
}

impl<V> Clone for CacheStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Send + Sync + 'static> CacheStore<V> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                clock,
                slots: Mutex::new(HashMap::new()),
                listeners: Mutex::new(ListenerRegistry::default()),
                next_seq: AtomicU64::new(0),
                stats: CacheStats::new(),
            }),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub(crate) fn counters(&self) -> &CacheStats {
        &self.inner.stats
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Snapshot of the entry, creating an empty one if the key is new.
    pub fn get(&self, key: &str) -> CacheEntry<V> {
        let mut slots = lock(&self.inner.slots);
        let key = CacheKey::from(key);
        let slot = slots.entry(key.clone()).or_insert_with(Slot::empty);
        slot.snapshot(&key)
    }

    /// Snapshot of the entry without creating it.
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        let slots = lock(&self.inner.slots);
        slots
            .get_key_value(key)
            .map(|(key, slot)| slot.snapshot(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.inner.slots).contains_key(key)
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = lock(&self.inner.slots).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The de-duplication gate.
    ///
    /// Without `supersede`, an outstanding load is joined rather than
    /// duplicated. With `supersede`, a new load is always started and the
    /// outstanding one loses the right to write the entry.
    pub fn mark_in_flight(&self, key: &str, supersede: bool) -> InFlightClaim<V> {
        let key = CacheKey::from(key);
        let (ticket, seq) = {
            let mut slots = lock(&self.inner.slots);
            let slot = slots.entry(key.clone()).or_insert_with(Slot::empty);

            if let Some(in_flight) = slot.in_flight.as_ref().filter(|_| !supersede) {
                CacheStats::bump(&self.inner.stats.loads_joined);
                trace!(key = %key, seq = in_flight.seq, "Joining in-flight load");
                return InFlightClaim::Joined(InFlightWaiter {
                    key,
                    outcome: in_flight.outcome.clone(),
                });
            }

            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
            slot.latest_seq = seq;
            let (outcome_tx, outcome_rx) = watch::channel(None);
            let (cancel_tx, cancel_rx) = watch::channel(false);
            if let Some(previous) = slot.in_flight.replace(InFlight {
                seq,
                outcome: outcome_rx,
                cancel: cancel_tx,
            }) {
                debug!(key = %key, superseded = previous.seq, seq, "Superseding in-flight load");
            }

            let ticket = LoadTicket {
                key: key.clone(),
                seq,
                outcome: Some(outcome_tx),
                cancel: cancel_rx,
                store: Arc::downgrade(&self.inner),
            };
            (ticket, seq)
        };

        CacheStats::bump(&self.inner.stats.loads_started);
        self.notify(&key, EventKind::LoadStarted, seq);
        InFlightClaim::Started(ticket)
    }

    /// Record a successful load.
    ///
    /// Sets the value, stamps `fetched_at`, derives `expires_at` from
    /// `expiration` and clears `last_error`. Waiters of the load receive the
    /// value whether or not the entry accepted it.
    pub fn commit(&self, mut ticket: LoadTicket<V>, value: V, expiration: Duration) -> CommitOutcome {
        let value = Arc::new(value);
        let outcome = self.inner.settle(
            &ticket.key,
            ticket.seq,
            Settlement::Value(Arc::clone(&value), expiration),
        );
        ticket.resolve(Ok(value));
        outcome
    }

    /// Record a failed load. Never touches `value` or `fetched_at`.
    pub fn fail(&self, mut ticket: LoadTicket<V>, err: CacheError) -> CommitOutcome {
        let outcome = self
            .inner
            .settle(&ticket.key, ticket.seq, Settlement::Error(err.clone()));
        ticket.resolve(Err(err));
        outcome
    }

    /// End a load that honoured its cancellation signal.
    ///
    /// Clears the in-flight marker without recording an error.
    pub fn cancel(&self, mut ticket: LoadTicket<V>) -> CommitOutcome {
        let outcome = self
            .inner
            .settle(&ticket.key, ticket.seq, Settlement::Cancelled);
        ticket.resolve(Err(CacheError::LoadCancelled {
            key: ticket.key.clone(),
        }));
        outcome
    }

    /// Force the key stale without discarding its value.
    ///
    /// Returns false if the key is unknown.
    pub fn invalidate(&self, key: &str) -> bool {
        let now = self.inner.clock.now();
        let seq = {
            let mut slots = lock(&self.inner.slots);
            match slots.get_mut(key) {
                Some(slot) => {
                    Self::expire_slot(slot, now);
                    slot.latest_seq
                }
                None => return false,
            }
        };
        CacheStats::bump(&self.inner.stats.invalidations);
        debug!(key = %key, "Invalidated");
        self.notify(&CacheKey::from(key), EventKind::Invalidated, seq);
        true
    }

    /// Force stale every key under a dotted namespace.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let now = self.inner.clock.now();
        let touched: Vec<(CacheKey, LoadSeq)> = {
            let mut slots = lock(&self.inner.slots);
            slots
                .iter_mut()
                .filter(|(key, _)| key.in_namespace(prefix))
                .map(|(key, slot)| {
                    Self::expire_slot(slot, now);
                    (key.clone(), slot.latest_seq)
                })
                .collect()
        };
        CacheStats::add(&self.inner.stats.invalidations, touched.len() as u64);
        debug!(prefix, count = touched.len(), "Invalidated namespace");
        for (key, seq) in &touched {
            self.notify(key, EventKind::Invalidated, *seq);
        }
        touched.len()
    }

    fn expire_slot(slot: &mut Slot<V>, now: std::time::Instant) {
        if slot.value.is_some() {
            slot.expires_at = Some(now);
        }
        slot.stale_through = slot.latest_seq;
    }

    /// Remove the entry. An outstanding load is signalled to cancel and
    /// its eventual result is discarded.
    pub fn evict(&self, key: &str) -> bool {
        let removed = lock(&self.inner.slots).remove_entry(key);
        let Some((key, slot)) = removed else {
            return false;
        };
        if let Some(in_flight) = &slot.in_flight {
            in_flight.cancel.send_replace(true);
        }
        CacheStats::bump(&self.inner.stats.evictions);
        debug!(key = %key, "Evicted");
        self.notify(&key, EventKind::Evicted, slot.latest_seq);
        true
    }

    /// Signal the outstanding load for `key` to cancel.
    ///
    /// Only cooperative loaders react; others run to completion.
    pub fn cancel_in_flight(&self, key: &str) -> bool {
        let slots = lock(&self.inner.slots);
        match slots.get(key).and_then(|slot| slot.in_flight.as_ref()) {
            Some(in_flight) => {
                in_flight.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Register a listener for changes to `key`.
    pub fn subscribe<F>(&self, key: &str, listener: F) -> ListenerHandle
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let key = CacheKey::from(key);
        let id = {
            let mut registry = lock(&self.inner.listeners);
            registry.next_id += 1;
            let id = registry.next_id;
            registry
                .by_key
                .entry(key.clone())
                .or_default()
                .push((id, Arc::new(listener)));
            id
        };

        let weak = Arc::downgrade(&self.inner);
        ListenerHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut registry = lock(&inner.listeners);
                if let Some(listeners) = registry.by_key.get_mut(&key) {
                    listeners.retain(|(existing, _)| *existing != id);
                    if listeners.is_empty() {
                        registry.by_key.remove(&key);
                    }
                }
            }
        })
    }

    pub fn listener_count(&self, key: &str) -> usize {
        lock(&self.inner.listeners)
            .by_key
            .get(key)
            .map_or(0, Vec::len)
    }

    fn notify(&self, key: &CacheKey, kind: EventKind, seq: LoadSeq) {
        self.inner.notify(key, kind, seq);
    }
}

impl<V> StoreInner<V> {
    fn settle(&self, key: &CacheKey, seq: LoadSeq, settlement: Settlement<V>) -> CommitOutcome {
        let now = self.clock.now();
        let applied = {
            let mut slots = lock(&self.slots);
            match slots.get_mut(key) {
                Some(slot) if slot.latest_seq == seq => {
                    slot.clear_in_flight(seq);
                    match settlement {
                        Settlement::Value(value, expiration) => {
                            slot.value = Some(value);
                            slot.fetched_at = Some(now);
                            slot.expires_at = if seq <= slot.stale_through {
                                Some(now)
                            } else {
                                Some(now + expiration)
                            };
                            slot.last_error = None;
                            slot.failed_at = None;
                            Some(EventKind::Committed)
                        }
                        Settlement::Error(err) => {
                            slot.last_error = Some(err);
                            slot.failed_at = Some(now);
                            Some(EventKind::Failed)
                        }
                        Settlement::Cancelled => Some(EventKind::Cancelled),
                    }
                }
                Some(slot) => {
                    slot.clear_in_flight(seq);
                    None
                }
                None => None,
            }
        };

        match applied {
            Some(kind) => {
                let counter = match kind {
                    EventKind::Committed => &self.stats.commits,
                    EventKind::Failed => &self.stats.failures,
                    _ => &self.stats.cancellations,
                };
                CacheStats::bump(counter);
                trace!(key = %key, seq, ?kind, "Load settled");
                self.notify(key, kind, seq);
                CommitOutcome::Applied
            }
            None => {
                CacheStats::bump(&self.stats.superseded);
                debug!(key = %key, seq, "Discarding superseded load result");
                CommitOutcome::Superseded
            }
        }
    }

    fn notify(&self, key: &CacheKey, kind: EventKind, seq: LoadSeq) {
        let listeners: Vec<Listener> = lock(&self.listeners)
            .by_key
            .get(key)
            .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        if listeners.is_empty() {
            return;
        }
        let event = CacheEvent {
            key: key.clone(),
            kind,
            seq,
        };
        for listener in listeners {
            listener(&event);
        }
    }
}

/// Ownership of one started load.
///
/// Settle it through [`CacheStore::commit`], [`CacheStore::fail`] or
/// [`CacheStore::cancel`]. A ticket dropped unsettled (the load task
/// panicked or was never polled) records `LoadAbandoned` and releases
/// the in-flight marker.
pub struct LoadTicket<V> {
    key: CacheKey,
    seq: LoadSeq,
    outcome: Option<OutcomeSender<V>>,
    cancel: watch::Receiver<bool>,
    store: Weak<StoreInner<V>>,
}

impl<V> LoadTicket<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn seq(&self) -> LoadSeq {
        self.seq
    }

    /// Context to hand to the loader.
    pub fn context(&self) -> LoadContext {
        LoadContext::new(self.key.clone(), self.seq, self.cancel.clone())
    }

    /// Wait for this load's outcome.
    pub fn waiter(&self) -> InFlightWaiter<V> {
        let outcome = match &self.outcome {
            Some(tx) => tx.subscribe(),
            None => watch::channel(None).1,
        };
        InFlightWaiter {
            key: self.key.clone(),
            outcome,
        }
    }

    fn resolve(&mut self, outcome: LoadOutcome<V>) {
        if let Some(tx) = self.outcome.take() {
            tx.send_replace(Some(outcome));
        }
    }
}

impl<V> Drop for LoadTicket<V> {
    fn drop(&mut self) {
        let Some(tx) = self.outcome.take() else {
            return;
        };
        error!(key = %self.key, seq = self.seq, "Load abandoned before completion");
        let err = CacheError::LoadAbandoned {
            key: self.key.clone(),
        };
        if let Some(inner) = self.store.upgrade() {
            inner.settle(&self.key, self.seq, Settlement::Error(err.clone()));
        }
        tx.send_replace(Some(Err(err)));
    }
}

impl<V> std::fmt::Debug for LoadTicket<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTicket")
            .field("key", &self.key)
            .field("seq", &self.seq)
            .field("settled", &self.outcome.is_none())
            .finish()
    }
}

/// Handle for awaiting an outstanding load.
pub struct InFlightWaiter<V> {
    key: CacheKey,
    outcome: OutcomeReceiver<V>,
}

impl<V> InFlightWaiter<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Wait for the load to settle.
    pub async fn wait(mut self) -> LoadOutcome<V> {
        loop {
            if let Some(outcome) = self.outcome.borrow_and_update().as_ref() {
                return outcome.clone();
            }
            if self.outcome.changed().await.is_err() {
                return Err(CacheError::LoadAbandoned { key: self.key });
            }
        }
    }
}
