//! Background revalidation.
//!
//! The scheduler keeps subscribed keys fresh without subscriber action:
//!
//! - **Timers**: each key with an auto-refresh subscription gets one
//!   repeating timer at the shortest poll interval among them. A tick runs
//!   a non-forced `ensure_fresh`, so a still-fresh entry costs nothing.
//! - **Lifecycle**: returning to the foreground revalidates every
//!   subscribed key. Ticks are skipped while in the background.
//! - **Invalidation**: an invalidated key is revalidated right away. If a
//!   load was already running it commits as stale, so the revalidation is
//!   deferred until that load settles.
//! - **Manual**: [`refresh`](RevalidationScheduler::refresh) forces a reload.
//!
//! Timers and lifecycle listeners exist only while something is
//! subscribed. The last [`ScheduleHandle`] for a key stops its timer and
//! signals the outstanding load to cancel.
//!
//! Automatic revalidation is skipped while a key's last failure is younger
//! than its policy's retry cooldown, so a failing endpoint is hit at most
//! once per cooldown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use freshet_core::{CacheKey, RevalidationPolicy};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::coordinator::{Fetch, FetchCoordinator, FetchOptions};
use crate::events::{CacheEvent, EventKind, ListenerHandle};
use crate::lifecycle::{LifecycleEventSource, LifecycleListener};
use crate::loader::Loader;

// ============================================================================
// METRICS
// ============================================================================

/// Scheduler counters.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    /// Poll timer ticks observed
    pub ticks: AtomicU64,
    /// Ticks ignored because the host was in the background
    pub skipped_background: AtomicU64,
    /// Revalidations skipped because of a recent failure
    pub skipped_cooldown: AtomicU64,
    /// Revalidations that started or joined a load
    pub revalidations: AtomicU64,
    /// Foreground transitions handled
    pub foreground_events: AtomicU64,
    /// Invalidations of subscribed keys observed
    pub invalidations: AtomicU64,
}

impl SchedulerMetrics {
    /// Get current snapshot of metrics.
    pub fn snapshot(&self) -> SchedulerMetricsSnapshot {
        SchedulerMetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            skipped_background: self.skipped_background.load(Ordering::Relaxed),
            skipped_cooldown: self.skipped_cooldown.load(Ordering::Relaxed),
            revalidations: self.revalidations.load(Ordering::Relaxed),
            foreground_events: self.foreground_events.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of scheduler metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerMetricsSnapshot {
    pub ticks: u64,
    pub skipped_background: u64,
    pub skipped_cooldown: u64,
    pub revalidations: u64,
    pub foreground_events: u64,
    pub invalidations: u64,
}

// ============================================================================
// STATE
// ============================================================================

struct Registration<V> {
    id: u64,
    loader: Arc<dyn Loader<V>>,
    policy: RevalidationPolicy,
}

struct PollTimer {
    period: Duration,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Drop for PollTimer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.task.abort();
    }
}

struct KeySchedule<V> {
    registrations: Vec<Registration<V>>,
    timer: Option<PollTimer>,
    /// Invalidated while a load was running; revalidate once it settles.
    reload_after_settle: bool,
    _store_events: ListenerHandle,
}

impl<V> KeySchedule<V> {
    fn desired_period(&self) -> Option<Duration> {
        self.registrations
            .iter()
            .filter(|r| r.policy.auto_refresh && !r.policy.poll_interval.is_zero())
            .map(|r| r.policy.poll_interval)
            .min()
    }

    /// Most recent registration drives loads for the key.
    fn current(&self) -> Option<(Arc<dyn Loader<V>>, RevalidationPolicy)> {
        self.registrations
            .last()
            .map(|r| (Arc::clone(&r.loader), r.policy))
    }
}

struct SchedulerState<V> {
    next_id: u64,
    keys: HashMap<CacheKey, KeySchedule<V>>,
    lifecycle: Option<[LifecycleListener; 2]>,
}

struct SchedulerInner<V> {
    coordinator: FetchCoordinator<V>,
    lifecycle: Arc<dyn LifecycleEventSource>,
    state: Mutex<SchedulerState<V>>,
    backgrounded: AtomicBool,
    metrics: SchedulerMetrics,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Drives background revalidation for subscribed keys.
pub struct RevalidationScheduler<V> {
    inner: Arc<SchedulerInner<V>>,
}

impl<V> Clone for RevalidationScheduler<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Send + Sync + 'static> RevalidationScheduler<V> {
    pub fn new(coordinator: FetchCoordinator<V>, lifecycle: Arc<dyn LifecycleEventSource>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                coordinator,
                lifecycle,
                state: Mutex::new(SchedulerState {
                    next_id: 0,
                    keys: HashMap::new(),
                    lifecycle: None,
                }),
                backgrounded: AtomicBool::new(false),
                metrics: SchedulerMetrics::default(),
            }),
        }
    }

    /// Register interest in `key`.
    ///
    /// The key takes part in foreground revalidation from now on and, for
    /// an auto-refresh policy, gets a poll timer. Dropping the handle
    /// unregisters.
    pub fn register(
        &self,
        key: &str,
        loader: Arc<dyn Loader<V>>,
        policy: RevalidationPolicy,
    ) -> ScheduleHandle<V> {
        let key = CacheKey::from(key);
        let mut state = self.inner.lock_state();
        state.next_id += 1;
        let id = state.next_id;

        if state.lifecycle.is_none() {
            state.lifecycle = Some(self.inner.attach_lifecycle());
            debug!("Lifecycle listeners attached");
        }

        let schedule = state
            .keys
            .entry(key.clone())
            .or_insert_with(|| KeySchedule {
                registrations: Vec::new(),
                timer: None,
                reload_after_settle: false,
                _store_events: self.inner.watch_store(&key),
            });
        schedule.registrations.push(Registration { id, loader, policy });
        self.inner.sync_timer(&key, schedule);
        drop(state);

        ScheduleHandle {
            scheduler: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    /// Force a reload of `key` with its current loader and policy.
    ///
    /// Ignores the staleness window and the failure cooldown. Returns
    /// `None` if nothing is subscribed to the key.
    pub fn refresh(&self, key: &str) -> Option<Fetch<V>> {
        let (loader, policy) = self.inner.current(key)?;
        info!(key, "Manual refresh");
        Some(
            self.inner
                .coordinator
                .begin(key, &loader, &policy, FetchOptions::force()),
        )
    }

    /// Revalidate one key as a background trigger would.
    ///
    /// Returns true if a load was started or joined.
    pub fn revalidate(&self, key: &str) -> bool {
        self.inner.revalidate(key)
    }

    /// Revalidate every subscribed key. Returns the number that loaded.
    pub fn revalidate_all(&self) -> usize {
        self.inner.revalidate_all()
    }

    pub fn is_backgrounded(&self) -> bool {
        self.inner.backgrounded.load(Ordering::SeqCst)
    }

    pub fn subscribed_keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.inner.lock_state().keys.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner
            .lock_state()
            .keys
            .get(key)
            .map_or(0, |s| s.registrations.len())
    }

    /// Poll period of the key's timer, if one is running.
    pub fn poll_period(&self, key: &str) -> Option<Duration> {
        self.inner
            .lock_state()
            .keys
            .get(key)
            .and_then(|s| s.timer.as_ref())
            .map(|t| t.period)
    }

    pub fn has_lifecycle_listeners(&self) -> bool {
        self.inner.lock_state().lifecycle.is_some()
    }

    pub fn metrics(&self) -> SchedulerMetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

impl<V: Send + Sync + 'static> SchedulerInner<V> {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self, key: &str) -> Option<(Arc<dyn Loader<V>>, RevalidationPolicy)> {
        self.lock_state().keys.get(key).and_then(KeySchedule::current)
    }

    fn attach_lifecycle(self: &Arc<Self>) -> [LifecycleListener; 2] {
        let foreground = {
            let weak = Arc::downgrade(self);
            self.lifecycle.on_foreground(Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_foreground();
                }
            }))
        };
        let background = {
            let weak = Arc::downgrade(self);
            self.lifecycle.on_background(Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_background();
                }
            }))
        };
        [foreground, background]
    }

    fn on_foreground(&self) {
        bump(&self.metrics.foreground_events);
        self.backgrounded.store(false, Ordering::SeqCst);
        let loaded = self.revalidate_all();
        info!(loaded, "Returned to foreground");
    }

    fn on_background(&self) {
        self.backgrounded.store(true, Ordering::SeqCst);
        info!("Moved to background; pausing poll timers");
    }

    fn watch_store(self: &Arc<Self>, key: &CacheKey) -> ListenerHandle {
        let weak = Arc::downgrade(self);
        self.coordinator
            .store()
            .subscribe(key.as_str(), move |event: &CacheEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_store_event(event);
                }
            })
    }

    fn on_store_event(&self, event: &CacheEvent) {
        let key = event.key.as_str();
        match event.kind {
            EventKind::Invalidated => self.on_invalidated(key),
            EventKind::Committed | EventKind::Failed | EventKind::Cancelled => {
                if self.take_pending_reload(key) {
                    debug!(key, "Revalidating after load that was invalidated mid-flight");
                    self.revalidate(key);
                }
            }
            EventKind::LoadStarted | EventKind::Evicted => {}
        }
    }

    fn on_invalidated(&self, key: &str) {
        bump(&self.metrics.invalidations);
        if self.backgrounded.load(Ordering::SeqCst) {
            trace!(key, "Invalidated while backgrounded; deferring to foreground");
            return;
        }
        // Flag first so a load settling concurrently picks the reload up.
        self.set_pending_reload(key);
        let in_flight = self
            .coordinator
            .store()
            .peek(key)
            .is_some_and(|entry| entry.in_flight);
        if in_flight {
            trace!(key, "Invalidated during load; revalidating once it settles");
        } else if self.take_pending_reload(key) {
            self.revalidate(key);
        }
    }

    fn set_pending_reload(&self, key: &str) {
        if let Some(schedule) = self.lock_state().keys.get_mut(key) {
            schedule.reload_after_settle = true;
        }
    }

    fn take_pending_reload(&self, key: &str) -> bool {
        self.lock_state()
            .keys
            .get_mut(key)
            .is_some_and(|schedule| std::mem::take(&mut schedule.reload_after_settle))
    }

    fn on_tick(&self, key: &CacheKey) {
        bump(&self.metrics.ticks);
        if self.backgrounded.load(Ordering::SeqCst) {
            bump(&self.metrics.skipped_background);
            trace!(key = %key, "Skipping poll tick while backgrounded");
            return;
        }
        self.revalidate(key.as_str());
    }

    fn revalidate(&self, key: &str) -> bool {
        let Some((loader, policy)) = self.current(key) else {
            return false;
        };
        let store = self.coordinator.store();
        if let Some(entry) = store.peek(key) {
            let now = store.clock().now();
            if !entry.is_fresh(now) && entry.failed_within(policy.retry_cooldown(), now) {
                bump(&self.metrics.skipped_cooldown);
                debug!(key, cooldown_ms = policy.retry_cooldown().as_millis() as u64, "Skipping revalidation after recent failure");
                return false;
            }
        }
        match self.coordinator.begin(key, &loader, &policy, FetchOptions::default()) {
            Fetch::Ready(_) => false,
            Fetch::Pending(_) => {
                bump(&self.metrics.revalidations);
                true
            }
        }
    }

    fn revalidate_all(&self) -> usize {
        let keys: Vec<CacheKey> = self.lock_state().keys.keys().cloned().collect();
        keys.iter()
            .filter(|key| self.revalidate(key.as_str()))
            .count()
    }

    /// Start, restart or stop the key's timer to match its registrations.
    fn sync_timer(self: &Arc<Self>, key: &CacheKey, schedule: &mut KeySchedule<V>) {
        let desired = schedule.desired_period();
        let current = schedule.timer.as_ref().map(|t| t.period);
        if desired == current {
            return;
        }
        schedule.timer = desired.and_then(|period| self.spawn_timer(key.clone(), period));
        match desired {
            Some(period) => info!(key = %key, period_ms = period.as_millis() as u64, "Poll timer started"),
            None => debug!(key = %key, "Poll timer stopped"),
        }
    }

    fn spawn_timer(self: &Arc<Self>, key: CacheKey, period: Duration) -> Option<PollTimer> {
        let runtime = self.coordinator.runtime()?;
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let weak: Weak<Self> = Arc::downgrade(self);
        let start = Instant::now() + period;

        let task = runtime.spawn(async move {
            let mut ticker = interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.on_tick(&key);
                    }
                    _ = shutdown_rx.changed() => {
                        trace!(key = %key, "Poll timer shutting down");
                        break;
                    }
                }
            }
        });

        Some(PollTimer {
            period,
            shutdown,
            task,
        })
    }

    fn unregister(self: &Arc<Self>, key: &CacheKey, id: u64) {
        let mut state = self.lock_state();
        let Some(schedule) = state.keys.get_mut(key) else {
            return;
        };
        schedule.registrations.retain(|r| r.id != id);
        if !schedule.registrations.is_empty() {
            self.sync_timer(key, schedule);
            return;
        }

        let removed = state.keys.remove(key);
        let released = if state.keys.is_empty() {
            state.lifecycle.take()
        } else {
            None
        };
        drop(state);
        drop(removed);

        if self.coordinator.store().cancel_in_flight(key.as_str()) {
            debug!(key = %key, "Last subscriber gone; cancelling load");
        }
        if let Some(listeners) = released {
            drop(listeners);
            debug!("Lifecycle listeners detached");
        }
    }
}

/// Registration returned by [`RevalidationScheduler::register`].
#[must_use = "dropping the handle unregisters the key"]
pub struct ScheduleHandle<V: Send + Sync + 'static> {
    scheduler: Weak<SchedulerInner<V>>,
    key: CacheKey,
    id: u64,
}

impl<V: Send + Sync + 'static> ScheduleHandle<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl<V: Send + Sync + 'static> Drop for ScheduleHandle<V> {
    fn drop(&mut self) {
        if let Some(inner) = self.scheduler.upgrade() {
            inner.unregister(&self.key, self.id);
        }
    }
}

impl<V: Send + Sync + 'static> std::fmt::Debug for ScheduleHandle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleHandle")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::lifecycle::ManualLifecycle;
    use crate::loader::{loader_fn, LoadContext};
    use crate::store::CacheStore;
    use freshet_core::BoxError;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        scheduler: RevalidationScheduler<usize>,
        coordinator: FetchCoordinator<usize>,
        lifecycle: ManualLifecycle,
        calls: Arc<AtomicUsize>,
        loader: Arc<dyn Loader<usize>>,
    }

    fn fixture() -> Fixture {
        let store = CacheStore::new(Arc::new(TokioClock));
        let coordinator = FetchCoordinator::new(store);
        let lifecycle = ManualLifecycle::new();
        let scheduler = RevalidationScheduler::new(coordinator.clone(), Arc::new(lifecycle.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        let loader: Arc<dyn Loader<usize>> = Arc::new(loader_fn({
            let calls = Arc::clone(&calls);
            move |_ctx: LoadContext| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<_, BoxError>(n) }
            }
        }));
        Fixture {
            scheduler,
            coordinator,
            lifecycle,
            calls,
            loader,
        }
    }

    fn polling(expiration_secs: u64, poll_secs: u64) -> RevalidationPolicy {
        RevalidationPolicy::new(Duration::from_secs(expiration_secs))
            .with_polling(Duration::from_secs(poll_secs))
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_reloads_stale_key() {
        let f = fixture();
        let policy = RevalidationPolicy::live_list();
        let _handle = f.scheduler.register("dispatch.list", Arc::clone(&f.loader), policy);
        f.coordinator
            .ensure_fresh("dispatch.list", &f.loader, &policy, FetchOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(4_100)).await;
        settle().await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.scheduler.metrics().ticks, 1);
        assert_eq!(f.scheduler.metrics().revalidations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skips_fresh_key() {
        let f = fixture();
        let policy = polling(10, 4);
        let _handle = f.scheduler.register("dispatch.list", Arc::clone(&f.loader), policy);
        f.coordinator
            .ensure_fresh("dispatch.list", &f.loader, &policy, FetchOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(4_100)).await;
        settle().await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.scheduler.metrics().ticks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_pauses_polling_until_foreground() {
        let f = fixture();
        let policy = polling(1, 4);
        let _handle = f.scheduler.register("dispatch.list", Arc::clone(&f.loader), policy);
        f.coordinator
            .ensure_fresh("dispatch.list", &f.loader, &policy, FetchOptions::default())
            .await
            .unwrap();

        f.lifecycle.emit_background();
        assert!(f.scheduler.is_backgrounded());
        tokio::time::sleep(Duration::from_millis(8_100)).await;
        settle().await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.scheduler.metrics().skipped_background, 2);

        f.lifecycle.emit_foreground();
        settle().await;
        assert!(!f.scheduler.is_backgrounded());
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.scheduler.metrics().foreground_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_revalidates_non_polling_keys() {
        let f = fixture();
        let policy = RevalidationPolicy::on_mutation(Duration::from_secs(300));
        let _handle = f.scheduler.register("receipt.summary", Arc::clone(&f.loader), policy);
        assert_eq!(f.scheduler.poll_period("receipt.summary"), None);

        f.lifecycle.emit_foreground();
        settle().await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);

        f.lifecycle.emit_foreground();
        settle().await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shortest_poll_interval_wins() {
        let f = fixture();
        let slow = f.scheduler.register("dispatch.list", Arc::clone(&f.loader), polling(2, 4));
        let fast = f.scheduler.register("dispatch.list", Arc::clone(&f.loader), polling(2, 1));
        assert_eq!(f.scheduler.poll_period("dispatch.list"), Some(Duration::from_secs(1)));
        assert_eq!(f.scheduler.subscriber_count("dispatch.list"), 2);

        drop(fast);
        assert_eq!(f.scheduler.poll_period("dispatch.list"), Some(Duration::from_secs(4)));

        drop(slow);
        assert_eq!(f.scheduler.poll_period("dispatch.list"), None);
        assert!(f.scheduler.subscribed_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_listeners_follow_subscriptions() {
        let f = fixture();
        assert!(!f.scheduler.has_lifecycle_listeners());

        let a = f.scheduler.register("a", Arc::clone(&f.loader), polling(2, 4));
        let b = f.scheduler.register("b", Arc::clone(&f.loader), polling(2, 4));
        assert!(f.scheduler.has_lifecycle_listeners());
        assert_eq!(f.lifecycle.listener_count(), 2);

        drop(a);
        assert!(f.scheduler.has_lifecycle_listeners());
        drop(b);
        assert!(!f.scheduler.has_lifecycle_listeners());
        assert_eq!(f.lifecycle.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_stops_ticking() {
        let f = fixture();
        let handle = f.scheduler.register("dispatch.list", Arc::clone(&f.loader), polling(1, 1));
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        settle().await;
        let ticks = f.scheduler.metrics().ticks;
        assert_eq!(ticks, 1);

        drop(handle);
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(f.scheduler.metrics().ticks, ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_cooldown_limits_retries() {
        let f = fixture();
        let failures = Arc::new(AtomicUsize::new(0));
        let failing: Arc<dyn Loader<usize>> = Arc::new(loader_fn({
            let failures = Arc::clone(&failures);
            move |_ctx: LoadContext| {
                failures.fetch_add(1, Ordering::SeqCst);
                async move { Err::<usize, BoxError>("503 service unavailable".into()) }
            }
        }));
        let _handle = f.scheduler.register("dispatch.list", failing, polling(1, 2));

        assert!(f.scheduler.revalidate("dispatch.list"));
        settle().await;
        assert!(!f.scheduler.revalidate("dispatch.list"));
        assert_eq!(f.scheduler.metrics().skipped_cooldown, 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(f.scheduler.revalidate("dispatch.list"));
        settle().await;
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_revalidates_non_polling_key() {
        let f = fixture();
        let policy = RevalidationPolicy::on_mutation(Duration::from_secs(300));
        let _handle = f.scheduler.register("receipt.list", Arc::clone(&f.loader), policy);
        f.coordinator
            .ensure_fresh("receipt.list", &f.loader, &policy, FetchOptions::default())
            .await
            .unwrap();

        assert!(f.coordinator.store().invalidate("receipt.list"));
        assert!(f.coordinator.store().get("receipt.list").in_flight);
        settle().await;

        let store = f.coordinator.store();
        let entry = store.get("receipt.list");
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
        assert_eq!(entry.value.as_deref(), Some(&2));
        assert!(entry.is_fresh(store.clock().now()));
        assert_eq!(f.scheduler.metrics().invalidations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_during_load_reloads_after_settle() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let slow: Arc<dyn Loader<usize>> = Arc::new(loader_fn({
            let calls = Arc::clone(&calls);
            move |_ctx: LoadContext| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, BoxError>(n)
                }
            }
        }));
        let policy = RevalidationPolicy::on_mutation(Duration::from_secs(300));
        let _handle = f.scheduler.register("receipt.list", Arc::clone(&slow), policy);
        f.coordinator
            .ensure_fresh("receipt.list", &slow, &policy, FetchOptions::default())
            .await
            .unwrap();

        let running = f.scheduler.refresh("receipt.list").unwrap();
        settle().await;
        f.coordinator.store().invalidate("receipt.list");
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert_eq!(*running.resolve().await.unwrap(), 2);
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;
        let store = f.coordinator.store();
        let entry = store.get("receipt.list");
        assert_eq!(entry.value.as_deref(), Some(&3));
        assert!(entry.is_fresh(store.clock().now()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_while_backgrounded_waits_for_foreground() {
        let f = fixture();
        let policy = RevalidationPolicy::on_mutation(Duration::from_secs(300));
        let _handle = f.scheduler.register("receipt.list", Arc::clone(&f.loader), policy);
        f.coordinator
            .ensure_fresh("receipt.list", &f.loader, &policy, FetchOptions::default())
            .await
            .unwrap();

        f.lifecycle.emit_background();
        f.coordinator.store().invalidate("receipt.list");
        settle().await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);

        f.lifecycle.emit_foreground();
        settle().await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribed_key_is_not_revalidated_on_invalidation() {
        let f = fixture();
        let policy = RevalidationPolicy::on_mutation(Duration::from_secs(300));
        let handle = f.scheduler.register("receipt.list", Arc::clone(&f.loader), policy);
        f.coordinator
            .ensure_fresh("receipt.list", &f.loader, &policy, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(f.coordinator.store().listener_count("receipt.list"), 1);

        drop(handle);
        assert_eq!(f.coordinator.store().listener_count("receipt.list"), 0);
        f.coordinator.store().invalidate("receipt.list");
        settle().await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_ignores_freshness() {
        let f = fixture();
        let policy = RevalidationPolicy::on_mutation(Duration::from_secs(300));
        let _handle = f.scheduler.register("receipt.summary", Arc::clone(&f.loader), policy);
        f.coordinator
            .ensure_fresh("receipt.summary", &f.loader, &policy, FetchOptions::default())
            .await
            .unwrap();

        let fetch = f.scheduler.refresh("receipt.summary").unwrap();
        assert!(!fetch.is_ready());
        assert_eq!(*fetch.resolve().await.unwrap(), 2);
        assert!(f.scheduler.refresh("unknown").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_unsubscribe_cancels_cooperative_load() {
        let f = fixture();
        let cooperative: Arc<dyn Loader<usize>> = Arc::new(loader_fn(|ctx: LoadContext| async move {
            ctx.cancelled().await;
            Err::<usize, BoxError>("request aborted".into())
        }));
        let policy = RevalidationPolicy::on_mutation(Duration::from_secs(60));
        let handle = f.scheduler.register("receipt.summary", Arc::clone(&cooperative), policy);
        assert!(f.scheduler.revalidate("receipt.summary"));
        settle().await;
        assert!(f.coordinator.store().get("receipt.summary").in_flight);

        drop(handle);
        settle().await;
        let entry = f.coordinator.store().get("receipt.summary");
        assert!(!entry.in_flight);
        assert!(entry.last_error.is_none());
    }
}
