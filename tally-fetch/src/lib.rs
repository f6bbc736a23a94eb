//! Tally Fetch - Coordination Layer
//!
//! The entry point is [`FetchCache`]: callers register each remote read
//! operation with a policy and an executor, then fetch through the cache.
//!
//! - Concurrent fetches of one key share a single executor call.
//! - Multi-key fetches above a threshold become one bulk call, split back
//!   into per-key entries.
//! - Stale entries are served at once and refreshed in the background.
//! - Mutations invalidate matching entries through declared rules, and
//!   results fetched before an invalidation are never written back.

pub mod batch;
pub mod executor;
pub mod facade;
pub mod inflight;
pub mod invalidator;

pub use batch::{demultiplex, BatchPlanner, BatchRequest, BulkKey, BulkOutcome, ExecutionPlan};
pub use executor::{
    bulk_executor_fn, executor_fn, BulkExecutor, Executor, FnBulkExecutor, FnExecutor, WithTimeout,
};
pub use facade::{FetchCache, FetchStats, InvalidationReport, Settled};
pub use inflight::{CoordinatorStats, InFlightCoordinator, InFlightHandle, Role, SharedOutcome};
pub use invalidator::Invalidator;

pub use tally_core::{
    CacheConfig, CacheKey, CacheRead, FetchError, InvalidationRule, KeyPattern, KeyPredicate,
    MutationContext, OperationPolicy, Params, ReadSource,
};
