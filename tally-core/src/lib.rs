//! Tally Core - Data Types
//!
//! Pure data structures shared by the storage and fetch crates: canonical
//! cache keys, entries, per-operation policies, invalidation patterns and the
//! error taxonomy. This crate performs no I/O and has no async code.

pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod pattern;

pub use config::{CacheConfig, OperationPolicy, DEFAULT_BULK_THRESHOLD};
pub use entry::{CacheEntry, CacheRead, Cacheable, LastError, Origin, ReadSource};
pub use error::{ConfigError, FetchError, KeyError, PersistenceError, TallyError, TallyResult};
pub use key::{CacheKey, OperationName, ParamValue, Params, ParamsBuilder};
pub use pattern::{
    ContextPredicate, InvalidationRule, KeyPattern, KeyPredicate, MutationContext, ParamSource,
};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
