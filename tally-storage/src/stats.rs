//! Cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about volatile cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served by a fresh entry.
    pub hits: u64,
    /// Reads served by a stale entry.
    pub stale_hits: u64,
    /// Reads that found no entry.
    pub misses: u64,
    /// Entries installed from the durable tier.
    pub durable_hits: u64,
    /// Entries removed by invalidation or shutdown.
    pub evictions: u64,
    /// Fetch results discarded because an invalidation overtook them.
    pub rejected_writes: u64,
    /// Number of entries currently in the volatile tier.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0). Stale hits count as hits.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

/// Statistics about the durable tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub writes: u64,
    pub write_failures: u64,
    pub reads: u64,
    pub read_failures: u64,
    pub deleted: u64,
    pub swept: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StoreCounters {
    pub hits: AtomicU64,
    pub stale_hits: AtomicU64,
    pub misses: AtomicU64,
    pub durable_hits: AtomicU64,
    pub evictions: AtomicU64,
    pub rejected_writes: AtomicU64,
}

impl StoreCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entry_count: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            rejected_writes: self.rejected_writes.load(Ordering::Relaxed),
            entry_count: entry_count as u64,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct PersistenceCounters {
    pub writes: AtomicU64,
    pub write_failures: AtomicU64,
    pub reads: AtomicU64,
    pub read_failures: AtomicU64,
    pub deleted: AtomicU64,
    pub swept: AtomicU64,
}

impl PersistenceCounters {
    pub fn snapshot(&self) -> PersistenceStats {
        PersistenceStats {
            writes: self.writes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }
}
