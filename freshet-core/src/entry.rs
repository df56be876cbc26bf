//! Cache entry snapshot and freshness checks.
//!
//! A [`CacheEntry`] is a point-in-time copy of what the store holds for a
//! key. Values are shared through `Arc` so a snapshot is cheap and every
//! reader of one commit sees the same allocation.

use crate::error::CacheError;
use crate::{CacheKey, LoadSeq};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot of a cache entry.
#[derive(Debug)]
pub struct CacheEntry<V> {
    /// Key this entry belongs to.
    pub key: CacheKey,
    /// Last successfully loaded value. `None` until the first commit.
    pub value: Option<Arc<V>>,
    /// When `value` was last committed.
    pub fetched_at: Option<Instant>,
    /// Entry is fresh while `now < expires_at`.
    pub expires_at: Option<Instant>,
    /// Whether a load is outstanding.
    pub in_flight: bool,
    /// Most recent failure, cleared by the next commit.
    pub last_error: Option<CacheError>,
    /// When `last_error` was recorded.
    pub failed_at: Option<Instant>,
    /// Sequence number of the most recently started load.
    pub latest_seq: LoadSeq,
}

impl<V> CacheEntry<V> {
    /// An entry that has never been loaded.
    pub fn empty(key: CacheKey) -> Self {
        Self {
            key,
            value: None,
            fetched_at: None,
            expires_at: None,
            in_flight: false,
            last_error: None,
            failed_at: None,
            latest_seq: 0,
        }
    }

    /// Fresh entries hold a value and have not yet expired.
    pub fn is_fresh(&self, now: Instant) -> bool {
        match (&self.value, self.expires_at) {
            (Some(_), Some(expires_at)) => now < expires_at,
            _ => false,
        }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        !self.is_fresh(now)
    }

    /// Age of the committed value.
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.fetched_at
            .map(|fetched_at| now.saturating_duration_since(fetched_at))
    }

    /// Whether a failure was recorded less than `cooldown` ago.
    pub fn failed_within(&self, cooldown: Duration, now: Instant) -> bool {
        match (&self.last_error, self.failed_at) {
            (Some(_), Some(failed_at)) => now.saturating_duration_since(failed_at) < cooldown,
            _ => false,
        }
    }

    /// Coarse lifecycle state, for display.
    pub fn state(&self, now: Instant) -> EntryState {
        match (&self.value, self.in_flight) {
            (None, true) => EntryState::Loading,
            (None, false) => EntryState::Empty,
            (Some(_), true) => EntryState::Revalidating,
            (Some(_), false) if self.is_fresh(now) => EntryState::Fresh,
            (Some(_), false) => EntryState::Stale,
        }
    }
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            fetched_at: self.fetched_at,
            expires_at: self.expires_at,
            in_flight: self.in_flight,
            last_error: self.last_error.clone(),
            failed_at: self.failed_at,
            latest_seq: self.latest_seq,
        }
    }
}

/// Lifecycle states of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Never loaded, nothing in flight.
    Empty,
    /// First load in flight, nothing to show yet.
    Loading,
    /// Value present and within its expiration window.
    Fresh,
    /// Value present but expired or invalidated.
    Stale,
    /// Value present while a refresh is in flight.
    Revalidating,
}
