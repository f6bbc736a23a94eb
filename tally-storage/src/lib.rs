//! Tally Storage - Volatile and Durable Cache Tiers
//!
//! The [`CacheStore`] is the process-lifetime tier consulted on every read.
//! The optional [`PersistentAdapter`] mirrors operations registered as
//! durable onto a [`DurableSubstrate`] so they survive restarts. The
//! [`InvalidationJournal`] lets the store refuse writes that an invalidation
//! has already overtaken.

pub mod codec;
pub mod durable;
pub mod journal;
pub mod persistent;
pub mod stats;
pub mod store;

pub use durable::{DurableSubstrate, InMemorySubstrate, LmdbSubstrate};
pub use journal::{InvalidationJournal, Watermark};
pub use persistent::PersistentAdapter;
pub use stats::{CacheStats, PersistenceStats};
pub use store::CacheStore;
