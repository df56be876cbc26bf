//! Invalidation after mutations.
//!
//! Write paths call into an [`Invalidator`] once a create/update/delete is
//! confirmed. Invalidation only marks entries stale. Subscribed keys are
//! reloaded in the background by the scheduler and other keys on their
//! next read, so the write's latency never includes a cache reload.

use std::sync::Arc;

use tracing::debug;

use crate::store::CacheStore;

/// Something whose entries can be forced stale.
pub trait Invalidate: Send + Sync {
    /// Force `key` stale. Returns false if the key is unknown.
    fn invalidate_key(&self, key: &str) -> bool;

    /// Force stale every key under a dotted namespace.
    fn invalidate_namespace(&self, prefix: &str) -> usize;
}

impl<V: Send + Sync + 'static> Invalidate for CacheStore<V> {
    fn invalidate_key(&self, key: &str) -> bool {
        self.invalidate(key)
    }

    fn invalidate_namespace(&self, prefix: &str) -> usize {
        self.invalidate_prefix(prefix)
    }
}

/// Handle over one or more stores, possibly of different value types.
///
/// ```ignore
/// let invalidator = Invalidator::new().with_store(&summaries).with_store(&lists);
/// let result = api.create_receipt(form).await;
/// invalidator.after_mutation(&result, ["receipt.summary", "receipt.list"]);
/// ```
#[derive(Clone, Default)]
pub struct Invalidator {
    targets: Vec<Arc<dyn Invalidate>>,
}

impl Invalidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store<V: Send + Sync + 'static>(self, store: &CacheStore<V>) -> Self {
        self.with_target(Arc::new(store.clone()))
    }

    pub fn with_target(mut self, target: Arc<dyn Invalidate>) -> Self {
        self.targets.push(target);
        self
    }

    /// Force `key` stale in every store. Returns how many stores held it.
    pub fn invalidate_cache_key(&self, key: &str) -> usize {
        let hits = self
            .targets
            .iter()
            .filter(|target| target.invalidate_key(key))
            .count();
        debug!(key, stores = hits, "Cache key invalidated");
        hits
    }

    /// Force several related keys stale.
    pub fn invalidate_keys<I, K>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        keys.into_iter()
            .map(|key| self.invalidate_cache_key(key.as_ref()))
            .sum()
    }

    /// Force stale every key under `prefix` in every store.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.targets
            .iter()
            .map(|target| target.invalidate_namespace(prefix))
            .sum()
    }

    /// Invalidate `keys` only if the mutation succeeded.
    pub fn after_mutation<T, E, I, K>(&self, result: &Result<T, E>, keys: I) -> usize
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        match result {
            Ok(_) => self.invalidate_keys(keys),
            Err(_) => 0,
        }
    }
}

impl std::fmt::Debug for Invalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invalidator")
            .field("targets", &self.targets.len())
            .finish()
    }
}
