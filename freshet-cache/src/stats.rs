//! Cache activity counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for cache activity since the store was created.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Reads served from a fresh entry without I/O
    pub hits: AtomicU64,
    /// Reads that found the entry stale or absent
    pub misses: AtomicU64,
    /// Loads requested with `force`; not counted as misses
    pub forced_loads: AtomicU64,
    /// Loads started
    pub loads_started: AtomicU64,
    /// Requests that attached to an outstanding load
    pub loads_joined: AtomicU64,
    /// Values written to an entry
    pub commits: AtomicU64,
    /// Completions discarded because a newer load was issued
    pub superseded: AtomicU64,
    /// Failed loads recorded on an entry
    pub failures: AtomicU64,
    /// Keys forced stale
    pub invalidations: AtomicU64,
    /// Keys removed
    pub evictions: AtomicU64,
    /// Loads that ended through cooperative cancellation
    pub cancellations: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            forced_loads: self.forced_loads.load(Ordering::Relaxed),
            loads_started: self.loads_started.load(Ordering::Relaxed),
            loads_joined: self.loads_joined.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cache counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub forced_loads: u64,
    pub loads_started: u64,
    pub loads_joined: u64,
    pub commits: u64,
    pub superseded: u64,
    pub failures: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub cancellations: u64,
}

impl CacheStatsSnapshot {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStatsSnapshot {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);
        assert!((CacheStatsSnapshot::default().hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = CacheStats::new();
        CacheStats::bump(&stats.hits);
        CacheStats::add(&stats.invalidations, 3);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.invalidations, 3);
        assert_eq!(snapshot.misses, 0);
    }
}
