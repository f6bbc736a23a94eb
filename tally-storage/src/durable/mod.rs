//! Byte-level durable substrates.
//!
//! A substrate stores opaque byte records under opaque byte keys. Encoding
//! lives in [`crate::codec`]; the typed view lives in
//! [`crate::PersistentAdapter`].

mod lmdb;
mod memory;

pub use lmdb::LmdbSubstrate;
pub use memory::InMemorySubstrate;

use async_trait::async_trait;
use tally_core::PersistenceError;

/// A key/value store that survives process restarts.
#[async_trait]
pub trait DurableSubstrate: Send + Sync {
    /// Read the record stored under `key`.
    async fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Store `value` under `key`, replacing any previous record.
    async fn write(&self, key: &[u8], value: &[u8]) -> Result<(), PersistenceError>;

    /// Remove the record under `key`. Returns true if one existed.
    async fn delete(&self, key: &[u8]) -> Result<bool, PersistenceError>;

    /// All records whose key starts with `prefix`. An empty prefix scans everything.
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PersistenceError>;

    /// Number of stored records.
    async fn len(&self) -> Result<usize, PersistenceError>;
}
