//! Typed, best-effort view over a [`DurableSubstrate`].
//!
//! Failures never propagate to fetch callers: writes are logged and dropped,
//! unreadable records are logged, removed, and treated as absent.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tally_core::{CacheEntry, CacheKey, KeyPredicate, Origin};

use crate::codec;
use crate::durable::DurableSubstrate;
use crate::stats::{PersistenceCounters, PersistenceStats};

/// Durable mirror for operations registered as durable.
pub struct PersistentAdapter {
    substrate: Arc<dyn DurableSubstrate>,
    capacity: usize,
    counters: PersistenceCounters,
}

impl std::fmt::Debug for PersistentAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentAdapter")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl PersistentAdapter {
    /// Wrap a substrate. `capacity` is the record count a sweep trims down to.
    pub fn new<S: DurableSubstrate + 'static>(substrate: S, capacity: usize) -> Self {
        Self::from_arc(Arc::new(substrate), capacity)
    }

    pub fn from_arc(substrate: Arc<dyn DurableSubstrate>, capacity: usize) -> Self {
        Self {
            substrate,
            capacity,
            counters: PersistenceCounters::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mirror an entry. Returns false if the write was rejected.
    pub async fn store<V: Serialize + Send + Sync>(&self, entry: &CacheEntry<V>) -> bool {
        let encoded = codec::encode_key(entry.key()).and_then(|key| {
            codec::encode_record(entry.fetched_at(), entry.ttl(), entry.value().as_ref())
                .map(|record| (key, record))
        });

        let result = match encoded {
            Ok((key, record)) => self.substrate.write(&key, &record).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %entry.key(), error = %e, "durable write failed, ignoring");
                false
            }
        }
    }

    /// Load the durable record for `key` as a persistent-origin entry.
    pub async fn load<V: DeserializeOwned>(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let encoded_key = match codec::encode_key(key) {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cannot encode durable key");
                return None;
            }
        };

        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        let bytes = match self.substrate.read(&encoded_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                self.counters.read_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %e, "durable read failed, treating as miss");
                return None;
            }
        };

        match codec::decode_record::<V>(&bytes) {
            Ok((fetched_at, ttl, value)) => Some(
                CacheEntry::new(key.clone(), Arc::new(value), fetched_at, ttl)
                    .with_origin(Origin::Persistent),
            ),
            Err(e) => {
                self.counters.read_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %e, "dropping corrupt durable record");
                if let Err(e) = self.substrate.delete(&encoded_key).await {
                    tracing::warn!(key = %key, error = %e, "failed to drop corrupt durable record");
                }
                None
            }
        }
    }

    /// Delete every durable record whose key matches `predicate`.
    ///
    /// Scans only the operation's prefix when the predicate is scoped to one.
    pub async fn delete_matching(&self, predicate: &KeyPredicate) -> usize {
        let prefix = predicate
            .operation()
            .map(codec::operation_prefix)
            .unwrap_or_default();

        let records = match self.substrate.scan_prefix(&prefix).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(pattern = %predicate, error = %e, "durable scan failed");
                return 0;
            }
        };

        let mut deleted = 0;
        for (raw_key, _) in records {
            let matches = codec::decode_key(&raw_key).is_some_and(|key| predicate.matches(&key));
            if !matches {
                continue;
            }
            match self.substrate.delete(&raw_key).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(pattern = %predicate, error = %e, "durable delete failed"),
            }
        }

        self.counters.deleted.fetch_add(deleted as u64, Ordering::Relaxed);
        deleted
    }

    /// Delete oldest-`fetched_at` records until at most `max_entries` remain.
    /// Records whose header cannot be read go first.
    pub async fn sweep(&self, max_entries: usize) -> usize {
        let records = match self.substrate.scan_prefix(&[]).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "durable sweep scan failed");
                return 0;
            }
        };

        if records.len() <= max_entries {
            return 0;
        }

        let mut aged: Vec<_> = records
            .into_iter()
            .map(|(key, record)| {
                let fetched_at = codec::decode_header(&record).ok().map(|(at, _)| at);
                (fetched_at, key)
            })
            .collect();
        // None sorts before Some, so unreadable records are evicted first.
        aged.sort_by(|a, b| a.0.cmp(&b.0));

        let excess = aged.len() - max_entries;
        let mut swept = 0;
        for (_, key) in aged.into_iter().take(excess) {
            match self.substrate.delete(&key).await {
                Ok(true) => swept += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "durable sweep delete failed"),
            }
        }

        self.counters.swept.fetch_add(swept as u64, Ordering::Relaxed);
        tracing::info!(swept, max_entries, "durable sweep complete");
        swept
    }

    /// Sweep down to the configured capacity.
    pub async fn sweep_to_capacity(&self) -> usize {
        self.sweep(self.capacity).await
    }

    /// Number of durable records, zero if the substrate cannot be read.
    pub async fn len(&self) -> usize {
        self.substrate.len().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "durable len failed");
            0
        })
    }

    pub fn stats(&self) -> PersistenceStats {
        self.counters.snapshot()
    }
}
