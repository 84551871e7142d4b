//! Cache statistics
//!
//! - [`CacheCounters`] - lock-free counters updated on the hot path
//! - [`CacheStats`] - serializable snapshot for monitoring

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a primitive cache
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    build_failures: AtomicU64,
    evictions: AtomicU64,
}

impl CacheCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build(&self) {
        self.builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_failure(&self) {
        self.build_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    /// Snapshot the counters together with the current occupancy
    pub fn snapshot(&self, entries: usize, capacity: Option<usize>) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries,
            capacity,
            hits,
            misses,
            builds: self.builds.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Point-in-time view of a primitive cache
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Primitives currently held
    pub entries: usize,

    /// LRU bound, `None` when unbounded
    pub capacity: Option<usize>,

    pub hits: u64,
    pub misses: u64,

    /// Successful primitive constructions
    pub builds: u64,

    /// Constructions the backend rejected
    pub build_failures: u64,

    pub evictions: u64,

    /// hits / (hits + misses), 0 when no lookups happened
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_hit_rate() {
        let counters = CacheCounters::default();
        counters.record_miss();
        counters.record_build();
        counters.record_hit();
        counters.record_hit();
        counters.record_hit();

        let stats = counters.snapshot(1, Some(4));
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.builds, 1);
        assert!((stats.hit_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_empty_snapshot() {
        let stats = CacheCounters::default().snapshot(0, None);
        assert_eq!(stats.hit_rate, 0.0);
        assert_eq!(stats.capacity, None);
    }

    #[test]
    fn test_cache_stats_serializable() {
        let counters = CacheCounters::default();
        counters.record_eviction();
        let json = serde_json::to_string(&counters.snapshot(2, Some(2))).unwrap();
        assert!(json.contains("\"evictions\":1"));
        assert!(json.contains("\"capacity\":2"));
    }
}
