//! Volatile cache tier.
//!
//! One mutex guards the entries, the last-error side channel, the durable
//! registry and the invalidation journal, so a journal check and the insert
//! that depends on it happen atomically. The lock is never held across an
//! await; durable I/O happens after it is released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tally_core::{
    CacheConfig, CacheEntry, CacheKey, Cacheable, FetchError, KeyPredicate, LastError,
    OperationName,
};

use crate::journal::{InvalidationJournal, Watermark};
use crate::persistent::PersistentAdapter;
use crate::stats::{CacheStats, StoreCounters};

struct StoreState<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    last_errors: HashMap<CacheKey, LastError>,
    durable_ops: HashSet<OperationName>,
    journal: InvalidationJournal,
}

/// Keyed map from cache key to entry, scoped to process lifetime.
pub struct CacheStore<V> {
    state: Mutex<StoreState<V>>,
    persistence: Option<Arc<PersistentAdapter>>,
    counters: StoreCounters,
}

impl<V> std::fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

impl<V: Cacheable> CacheStore<V> {
    /// Create a store whose journal keeps invalidations for `journal_retention`.
    pub fn new(journal_retention: Duration) -> Self {
        Self {
            state: Mutex::new(StoreState {
                entries: HashMap::new(),
                last_errors: HashMap::new(),
                durable_ops: HashSet::new(),
                journal: InvalidationJournal::new(journal_retention),
            }),
            persistence: None,
            counters: StoreCounters::default(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.journal_retention)
    }

    /// Attach a durable tier.
    pub fn with_persistence(mut self, adapter: Arc<PersistentAdapter>) -> Self {
        self.persistence = Some(adapter);
        self
    }

    pub fn persistence(&self) -> Option<&Arc<PersistentAdapter>> {
        self.persistence.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mirror successful results of `operation` to the durable tier.
    pub fn register_durable(&self, operation: OperationName) {
        self.lock().durable_ops.insert(operation);
    }

    pub fn is_durable(&self, operation: &OperationName) -> bool {
        self.persistence.is_some() && self.lock().durable_ops.contains(operation)
    }

    /// Current invalidation watermark.
    pub fn watermark(&self) -> Watermark {
        self.lock().journal.current()
    }

    /// Look up an entry, recording a fresh hit, stale hit or miss.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let entry = self.lock().entries.get(key).cloned();
        match &entry {
            Some(e) if e.is_fresh() => StoreCounters::bump(&self.counters.hits),
            Some(_) => StoreCounters::bump(&self.counters.stale_hits),
            None => StoreCounters::bump(&self.counters.misses),
        }
        entry
    }

    /// Look up an entry without touching statistics.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        self.lock().entries.get(key).cloned()
    }

    /// Insert unconditionally, replacing any previous entry.
    pub async fn put(&self, key: CacheKey, value: Arc<V>, ttl: Duration) -> CacheEntry<V> {
        let entry = CacheEntry::new(key, value, Utc::now(), ttl);
        let (durable, after) = {
            let mut state = self.lock();
            state.last_errors.remove(entry.key());
            state.entries.insert(entry.key().clone(), entry.clone());
            (
                state.durable_ops.contains(entry.key().operation()),
                state.journal.current(),
            )
        };
        if durable {
            self.mirror(&entry, &after).await;
        }
        entry
    }

    /// Insert only if no invalidation matching `key` was recorded after
    /// `since`. Returns `None` when the write was rejected.
    pub async fn put_since(
        &self,
        key: CacheKey,
        value: Arc<V>,
        ttl: Duration,
        since: &Watermark,
    ) -> Option<CacheEntry<V>> {
        let entry = CacheEntry::new(key, value, Utc::now(), ttl);
        let (durable, after) = {
            let mut state = self.lock();
            if state.journal.invalidated_since(since, entry.key()) {
                drop(state);
                StoreCounters::bump(&self.counters.rejected_writes);
                tracing::debug!(key = %entry.key(), "discarding result overtaken by invalidation");
                return None;
            }
            state.last_errors.remove(entry.key());
            state.entries.insert(entry.key().clone(), entry.clone());
            (
                state.durable_ops.contains(entry.key().operation()),
                state.journal.current(),
            )
        };
        if durable {
            self.mirror(&entry, &after).await;
        }
        Some(entry)
    }

    async fn mirror(&self, entry: &CacheEntry<V>, after: &Watermark) {
        let Some(adapter) = &self.persistence else {
            return;
        };
        if !adapter.store(entry).await {
            return;
        }
        // An invalidation may have run its durable delete before this write landed.
        let overtaken = self.lock().journal.invalidated_since(after, entry.key());
        if overtaken {
            adapter
                .delete_matching(&KeyPredicate::Exact(entry.key().clone()))
                .await;
        }
    }

    /// Install an entry loaded from the durable tier.
    ///
    /// Rejected if a matching invalidation was recorded after `since` or at or
    /// after the entry's `fetched_at`, or if a newer volatile entry exists.
    pub fn install(&self, entry: CacheEntry<V>, since: &Watermark) -> bool {
        let mut state = self.lock();
        if state.journal.invalidated_since(since, entry.key())
            || state
                .journal
                .invalidated_at_or_after(entry.fetched_at(), entry.key())
        {
            tracing::debug!(key = %entry.key(), "durable record predates an invalidation");
            return false;
        }
        if let Some(existing) = state.entries.get(entry.key()) {
            if existing.fetched_at() >= entry.fetched_at() {
                return false;
            }
        }
        state.entries.insert(entry.key().clone(), entry);
        drop(state);
        StoreCounters::bump(&self.counters.durable_hits);
        true
    }

    /// Warm-start `key` from the durable tier and install it.
    pub async fn load_durable(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let adapter = self.persistence.as_ref()?;
        if !self.is_durable(key.operation()) {
            return None;
        }
        let since = self.watermark();
        let entry = adapter.load::<V>(key).await?;
        if self.install(entry.clone(), &since) {
            Some(entry)
        } else {
            None
        }
    }

    /// Mark every matching entry stale. Returns the number marked.
    pub fn mark_stale(&self, predicate: &KeyPredicate) -> usize {
        let mut state = self.lock();
        let mut marked = 0;
        for (key, entry) in state.entries.iter_mut() {
            if predicate.matches(key) {
                entry.mark_stale();
                marked += 1;
            }
        }
        marked
    }

    /// Delete every matching volatile entry and its last error, and record
    /// the invalidation in the journal. Idempotent.
    pub fn delete(&self, predicate: &KeyPredicate) -> usize {
        let mut state = self.lock();
        state.journal.record(predicate.clone());
        state.last_errors.retain(|key, _| !predicate.matches(key));
        let before = state.entries.len();
        state.entries.retain(|key, _| !predicate.matches(key));
        let removed = before - state.entries.len();
        drop(state);
        StoreCounters::add(&self.counters.evictions, removed as u64);
        removed
    }

    /// Delete every matching durable record.
    pub async fn delete_durable(&self, predicate: &KeyPredicate) -> usize {
        let Some(adapter) = &self.persistence else {
            return 0;
        };
        let relevant = match predicate.operation() {
            Some(op) => self.lock().durable_ops.contains(op),
            None => true,
        };
        if !relevant {
            return 0;
        }
        adapter.delete_matching(predicate).await
    }

    /// Record a failed fetch for `key`. Cached data is left untouched.
    pub fn record_error(&self, key: &CacheKey, error: FetchError) {
        let mut state = self.lock();
        let consecutive_failures = state
            .last_errors
            .get(key)
            .map_or(1, |prev| prev.consecutive_failures.saturating_add(1));
        state.last_errors.insert(
            key.clone(),
            LastError {
                error,
                at: Utc::now(),
                consecutive_failures,
            },
        );
    }

    pub fn last_error(&self, key: &CacheKey) -> Option<LastError> {
        self.lock().last_errors.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently cached, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop every volatile entry, as on shutdown.
    pub fn clear(&self) -> usize {
        self.delete(&KeyPredicate::All)
    }

    pub fn stats(&self) -> CacheStats {
        let count = self.len();
        self.counters.snapshot(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::InMemorySubstrate;
    use tally_core::{Origin, Params};

    const TTL: Duration = Duration::from_secs(60);

    fn key(op: &str, entity: &str) -> CacheKey {
        CacheKey::new(op, Params::builder().param("entity", entity).build().unwrap()).unwrap()
    }

    fn store() -> CacheStore<String> {
        CacheStore::new(Duration::from_secs(600))
    }

    fn durable_store() -> (CacheStore<String>, Arc<PersistentAdapter>) {
        let adapter = Arc::new(PersistentAdapter::new(InMemorySubstrate::new(), 100));
        let store = store().with_persistence(adapter.clone());
        store.register_durable(OperationName::new("list-vouchers").unwrap());
        (store, adapter)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = store();
        let k = key("list-vouchers", "E1");
        assert!(store.get(&k).is_none());

        store.put(k.clone(), Arc::new("v1".to_string()), TTL).await;
        let entry = store.get(&k).expect("entry should exist");
        assert_eq!(entry.value().as_str(), "v1");
        assert!(entry.is_fresh());

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_put_replaces_wholesale() {
        let store = store();
        let k = key("list-vouchers", "E1");
        store.put(k.clone(), Arc::new("v1".to_string()), TTL).await;
        store.mark_stale(&KeyPredicate::Exact(k.clone()));
        store.put(k.clone(), Arc::new("v2".to_string()), TTL).await;

        let entry = store.peek(&k).unwrap();
        assert_eq!(entry.value().as_str(), "v2");
        assert!(!entry.is_marked_stale());
    }

    #[tokio::test]
    async fn test_mark_stale_keeps_value() {
        let store = store();
        let k = key("list-vouchers", "E1");
        store.put(k.clone(), Arc::new("v1".to_string()), TTL).await;

        let op = OperationName::new("list-vouchers").unwrap();
        assert_eq!(store.mark_stale(&KeyPredicate::Operation(op)), 1);

        let entry = store.get(&k).unwrap();
        assert!(!entry.is_fresh());
        assert_eq!(entry.value().as_str(), "v1");
        assert_eq!(store.stats().stale_hits, 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = store();
        store.put(key("list-vouchers", "E1"), Arc::new("a".into()), TTL).await;
        store.put(key("list-vouchers", "E2"), Arc::new("b".into()), TTL).await;
        store.put(key("list-invoices", "E1"), Arc::new("c".into()), TTL).await;

        let pred = KeyPredicate::Operation(OperationName::new("list-vouchers").unwrap());
        assert_eq!(store.delete(&pred), 2);
        let keys_after_first = store.keys();
        assert_eq!(store.delete(&pred), 0);
        assert_eq!(store.keys(), keys_after_first);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().evictions, 2);
    }

    #[tokio::test]
    async fn test_put_since_rejects_overtaken_result() {
        let store = store();
        let k = key("list-vouchers", "E1");
        let since = store.watermark();

        store.delete(&KeyPredicate::Exact(k.clone()));
        let written = store
            .put_since(k.clone(), Arc::new("old".to_string()), TTL, &since)
            .await;
        assert!(written.is_none());
        assert!(store.peek(&k).is_none());
        assert_eq!(store.stats().rejected_writes, 1);

        // An unrelated invalidation does not block the write.
        let since = store.watermark();
        store.delete(&KeyPredicate::Exact(key("list-vouchers", "E2")));
        assert!(store
            .put_since(k.clone(), Arc::new("new".to_string()), TTL, &since)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_last_error_side_channel() {
        let store = store();
        let k = key("list-vouchers", "E1");
        store.put(k.clone(), Arc::new("v1".to_string()), TTL).await;

        store.record_error(&k, FetchError::transient("list-vouchers", "503"));
        store.record_error(&k, FetchError::transient("list-vouchers", "503"));
        let last = store.last_error(&k).expect("error recorded");
        assert_eq!(last.consecutive_failures, 2);
        // Prior value is untouched.
        assert_eq!(store.peek(&k).unwrap().value().as_str(), "v1");

        store.put(k.clone(), Arc::new("v2".to_string()), TTL).await;
        assert!(store.last_error(&k).is_none());
    }

    #[tokio::test]
    async fn test_delete_forgets_last_error() {
        let store = store();
        let e1 = key("list-vouchers", "E1");
        let e2 = key("list-vouchers", "E2");
        store.record_error(&e1, FetchError::transient("list-vouchers", "503"));
        store.record_error(&e2, FetchError::transient("list-vouchers", "503"));

        assert_eq!(store.delete(&KeyPredicate::Exact(e1.clone())), 0);
        assert!(store.last_error(&e1).is_none());
        assert_eq!(store.last_error(&e2).unwrap().consecutive_failures, 1);

        store.clear();
        assert!(store.last_error(&e2).is_none());
    }

    #[tokio::test]
    async fn test_durable_mirror_and_warm_start() {
        let (store, adapter) = durable_store();
        let k = key("list-vouchers", "E1");
        store.put(k.clone(), Arc::new("v1".to_string()), TTL).await;
        assert_eq!(adapter.len().await, 1);

        // Fresh process sharing the same durable tier.
        let restarted = CacheStore::<String>::new(Duration::from_secs(600))
            .with_persistence(adapter.clone());
        restarted.register_durable(OperationName::new("list-vouchers").unwrap());
        assert!(restarted.peek(&k).is_none());

        let loaded = restarted.load_durable(&k).await.expect("warm start");
        assert_eq!(loaded.origin(), Origin::Persistent);
        assert_eq!(restarted.peek(&k).unwrap().value().as_str(), "v1");
        assert_eq!(restarted.stats().durable_hits, 1);
    }

    #[tokio::test]
    async fn test_volatile_operation_not_mirrored() {
        let (store, adapter) = durable_store();
        store
            .put(key("list-invoices", "E1"), Arc::new("i".to_string()), TTL)
            .await;
        assert_eq!(adapter.len().await, 0);
        assert!(store.load_durable(&key("list-invoices", "E1")).await.is_none());
    }

    #[tokio::test]
    async fn test_install_rejected_after_invalidation() {
        let (store, _adapter) = durable_store();
        let k = key("list-vouchers", "E1");
        let since = store.watermark();
        let entry = CacheEntry::new(
            k.clone(),
            Arc::new("old".to_string()),
            Utc::now() - chrono::Duration::seconds(5),
            TTL,
        )
        .with_origin(Origin::Persistent);

        store.delete(&KeyPredicate::Exact(k.clone()));
        assert!(!store.install(entry.clone(), &store.watermark()));
        assert!(!store.install(entry, &since));
        assert!(store.peek(&k).is_none());
    }

    #[tokio::test]
    async fn test_delete_durable() {
        let (store, adapter) = durable_store();
        let k = key("list-vouchers", "E1");
        store.put(k.clone(), Arc::new("v1".to_string()), TTL).await;

        let pred = KeyPredicate::Exact(k.clone());
        store.delete(&pred);
        assert_eq!(store.delete_durable(&pred).await, 1);
        assert_eq!(adapter.len().await, 0);
        assert!(store.load_durable(&k).await.is_none());
    }

    #[tokio::test]
    async fn test_clear() {
        let store = store();
        store.put(key("list-vouchers", "E1"), Arc::new("a".into()), TTL).await;
        store.put(key("list-vouchers", "E2"), Arc::new("b".into()), TTL).await;
        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
    }
}
