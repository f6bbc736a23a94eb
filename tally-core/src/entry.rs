//! Cache entries and read results.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::{CacheKey, FetchError};

/// Marker trait for values that can be cached.
///
/// Values are shared between joined callers behind an `Arc`, and durable
/// operations serialize them, hence the serde bounds.
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Which tier an entry was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Fetched during this process lifetime.
    Volatile,
    /// Loaded from the durable tier on a warm start.
    Persistent,
}

/// A cached value with its freshness metadata.
///
/// Entries are replaced wholesale on refresh; nothing mutates the value of
/// an existing entry.
#[derive(Debug)]
pub struct CacheEntry<V> {
    key: CacheKey,
    value: Arc<V>,
    fetched_at: DateTime<Utc>,
    ttl: Duration,
    origin: Origin,
    marked_stale: bool,
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
            ttl: self.ttl,
            origin: self.origin,
            marked_stale: self.marked_stale,
        }
    }
}

impl<V> CacheEntry<V> {
    pub fn new(key: CacheKey, value: Arc<V>, fetched_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            key,
            value,
            fetched_at,
            ttl,
            origin: Origin::Volatile,
            marked_stale: false,
        }
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> &Arc<V> {
        &self.value
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Age of the entry at `now`; zero if `fetched_at` lies in the future.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Fresh while `now - fetched_at < ttl` and not explicitly marked stale.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        !self.marked_stale && self.age_at(now) < self.ttl
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }

    pub fn is_marked_stale(&self) -> bool {
        self.marked_stale
    }

    pub fn mark_stale(&mut self) {
        self.marked_stale = true;
    }
}

/// How a read was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Fresh entry in the cache.
    FreshHit,
    /// Stale entry served while a refresh runs in the background.
    StaleHit,
    /// No usable entry; the caller waited on a coordinated fetch.
    Fetched,
}

/// Result of a cache read, carrying staleness metadata.
#[derive(Debug)]
pub struct CacheRead<V> {
    value: Arc<V>,
    fetched_at: DateTime<Utc>,
    origin: Origin,
    source: ReadSource,
}

impl<V> Clone for CacheRead<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
            origin: self.origin,
            source: self.source,
        }
    }
}

impl<V> CacheRead<V> {
    /// Read served from a cache entry.
    pub fn from_entry(entry: &CacheEntry<V>, source: ReadSource) -> Self {
        Self {
            value: Arc::clone(entry.value()),
            fetched_at: entry.fetched_at(),
            origin: entry.origin(),
            source,
        }
    }

    /// Read satisfied by a coordinated fetch.
    pub fn fetched(value: Arc<V>) -> Self {
        Self {
            value,
            fetched_at: Utc::now(),
            origin: Origin::Volatile,
            source: ReadSource::Fetched,
        }
    }

    pub fn into_value(self) -> Arc<V> {
        self.value
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    pub fn was_cache_hit(&self) -> bool {
        !matches!(self.source, ReadSource::Fetched)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.source, ReadSource::StaleHit)
    }

    /// Duration since the value was fetched.
    pub fn staleness(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

impl<V> AsRef<V> for CacheRead<V> {
    fn as_ref(&self) -> &V {
        &self.value
    }
}

/// Most recent failure recorded for a key, used for caller backoff decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub error: FetchError,
    pub at: DateTime<Utc>,
    pub consecutive_failures: u32,
}
