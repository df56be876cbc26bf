//! FRESHET Test Utilities
//!
//! Centralized test infrastructure for the FRESHET workspace:
//! - Mock loaders with call counting and scripted outcomes
//! - Proptest generators for keys and policies
//! - Test fixtures for common scenarios
//! - Custom assertions for cache entries and results

pub use freshet_cache::{
    loader_fn, BoxError, CacheEntry, CacheError, CacheKey, CacheResult, CacheStore, LoadContext,
    Loader, ManualClock, ManualLifecycle, QueryClient, RevalidationPolicy,
};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// MOCK LOADERS
// ============================================================================

/// Errors produced by the mock loaders.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TestError {
    #[error("NetworkError: {0}")]
    Network(String),

    #[error("Scripted loader has no steps left")]
    Exhausted,
}

/// Loader that counts its invocations.
///
/// The value for the n-th call (1-based) comes from `make(n)`.
pub struct CountingLoader<V> {
    calls: Arc<AtomicUsize>,
    delay: Duration,
    make: Box<dyn Fn(usize) -> V + Send + Sync>,
}

impl<V> CountingLoader<V> {
    pub fn new(make: impl Fn(usize) -> V + Send + Sync + 'static) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            make: Box::new(make),
        }
    }

    /// Simulated network latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared counter, for reading after the loader has been moved.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> Loader<V> for CountingLoader<V> {
    async fn load(&self, _ctx: LoadContext) -> Result<V, BoxError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok((self.make)(n))
    }
}

struct Step<V> {
    delay: Duration,
    outcome: Result<V, TestError>,
}

/// Loader that replays a fixed script of outcomes, one per call.
pub struct ScriptedLoader<V> {
    steps: Mutex<VecDeque<Step<V>>>,
    calls: AtomicUsize,
}

impl<V> Default for ScriptedLoader<V> {
    fn default() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }
}

impl<V> ScriptedLoader<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_ok(self, value: V) -> Self {
        self.then_ok_after(Duration::ZERO, value)
    }

    pub fn then_ok_after(self, delay: Duration, value: V) -> Self {
        self.push(delay, Ok(value))
    }

    pub fn then_err(self, message: &str) -> Self {
        self.then_err_after(Duration::ZERO, message)
    }

    pub fn then_err_after(self, delay: Duration, message: &str) -> Self {
        self.push(delay, Err(TestError::Network(message.to_string())))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn push(self, delay: Duration, outcome: Result<V, TestError>) -> Self {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Step { delay, outcome });
        self
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> Loader<V> for ScriptedLoader<V> {
    async fn load(&self, _ctx: LoadContext) -> Result<V, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some(step) = step else {
            return Err(TestError::Exhausted.into());
        };
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        step.outcome.map_err(Into::into)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cache keys and policies.

    use super::*;
    use proptest::prelude::*;

    /// Generate a dotted cache key such as `"stock.list"`.
    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        prop::collection::vec("[a-z][a-z_]{0,7}", 1..=3).prop_map(|parts| CacheKey::new(parts.join(".")))
    }

    /// Generate an expiration window between 1ms and 10 minutes.
    pub fn arb_expiration() -> impl Strategy<Value = Duration> {
        (1u64..=600_000).prop_map(Duration::from_millis)
    }

    /// Generate a valid revalidation policy.
    pub fn arb_policy() -> impl Strategy<Value = RevalidationPolicy> {
        (arb_expiration(), any::<bool>(), 1u64..=60_000).prop_map(|(expiration, auto_refresh, poll_ms)| {
            let policy = RevalidationPolicy::new(expiration);
            if auto_refresh {
                policy.with_polling(Duration::from_millis(poll_ms))
            } else {
                policy
            }
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    /// Store on a manual clock.
    pub fn manual_store<V: Send + Sync + 'static>() -> (CacheStore<V>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (CacheStore::new(clock.clone()), clock)
    }

    /// Client on the tokio clock with a manual lifecycle source.
    ///
    /// Pair with `#[tokio::test(start_paused = true)]` for deterministic timing.
    pub fn client<V: Send + Sync + 'static>() -> (QueryClient<V>, ManualLifecycle) {
        let lifecycle = ManualLifecycle::new();
        (QueryClient::new(Arc::new(lifecycle.clone())), lifecycle)
    }

    /// Summary panel that only changes through mutations.
    pub fn summary_policy() -> RevalidationPolicy {
        RevalidationPolicy::on_mutation(Duration::from_secs(300))
    }

    /// The `"summary"` scenario: five second staleness window, no polling.
    pub fn five_second_policy() -> RevalidationPolicy {
        RevalidationPolicy::new(Duration::from_secs(5))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for cache entries and results.

    use super::*;
    use std::time::Instant;

    /// Assert that an entry is fresh at `now`.
    #[track_caller]
    pub fn assert_fresh<V: std::fmt::Debug>(entry: &CacheEntry<V>, now: Instant) {
        assert!(entry.is_fresh(now), "Expected fresh entry, got: {:?}", entry);
    }

    /// Assert that an entry is stale at `now` but still holds a value.
    #[track_caller]
    pub fn assert_stale_with_value<V: std::fmt::Debug>(entry: &CacheEntry<V>, now: Instant) {
        assert!(entry.is_stale(now), "Expected stale entry, got: {:?}", entry);
        assert!(entry.value.is_some(), "Expected stale entry to keep its value");
    }

    /// Assert that a result is a LoadFailed error.
    #[track_caller]
    pub fn assert_load_failed<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::LoadFailed { .. }) => {}
            other => panic!("Expected LoadFailed error, got: {:?}", other),
        }
    }
}
