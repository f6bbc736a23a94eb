//! LMDB-backed durable substrate.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! key-value store for cached fetch results.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The substrate uses:
//! - Read transactions for `read`, `scan_prefix` and `len`
//! - Write transactions for `write` and `delete`

use std::path::Path;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use tally_core::PersistenceError;

use super::DurableSubstrate;

/// LMDB substrate over a single unnamed database.
///
/// # Example
///
/// ```ignore
/// use tally_storage::{LmdbSubstrate, PersistentAdapter};
///
/// let substrate = LmdbSubstrate::open("/var/lib/console/cache", 64)?;
/// let adapter = PersistentAdapter::new(substrate, 5000);
/// ```
pub struct LmdbSubstrate {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbSubstrate {
    /// Open or create an LMDB environment.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `map_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::EnvOpen`] if the map size overflows, the
    /// directory cannot be created, or the environment or database cannot
    /// be opened.
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, PersistenceError> {
        let map_size = map_size_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| PersistenceError::EnvOpen {
                reason: format!("map size of {map_size_mb} MB overflows usize"),
            })?;

        std::fs::create_dir_all(&path).map_err(|e| PersistenceError::EnvOpen {
            reason: e.to_string(),
        })?;

        // SAFETY: the environment is opened once per directory by this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(env_open)?;

        let mut wtxn = env.write_txn().map_err(env_open)?;
        let db: Database<Bytes, Bytes> = env.create_database(&mut wtxn, None).map_err(env_open)?;
        wtxn.commit().map_err(env_open)?;

        Ok(Self { env, db })
    }
}

fn env_open(e: heed::Error) -> PersistenceError {
    PersistenceError::EnvOpen {
        reason: e.to_string(),
    }
}

fn read_failed(e: heed::Error) -> PersistenceError {
    PersistenceError::ReadFailed {
        reason: e.to_string(),
    }
}

fn write_failed(e: heed::Error) -> PersistenceError {
    PersistenceError::WriteFailed {
        reason: e.to_string(),
    }
}

fn delete_failed(e: heed::Error) -> PersistenceError {
    PersistenceError::DeleteFailed {
        reason: e.to_string(),
    }
}

#[async_trait]
impl DurableSubstrate for LmdbSubstrate {
    async fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PersistenceError> {
        let rtxn = self.env.read_txn().map_err(read_failed)?;
        let value = self.db.get(&rtxn, key).map_err(read_failed)?;
        Ok(value.map(<[u8]>::to_vec))
    }

    async fn write(&self, key: &[u8], value: &[u8]) -> Result<(), PersistenceError> {
        let mut wtxn = self.env.write_txn().map_err(write_failed)?;
        self.db.put(&mut wtxn, key, value).map_err(write_failed)?;
        wtxn.commit().map_err(write_failed)
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, PersistenceError> {
        let mut wtxn = self.env.write_txn().map_err(delete_failed)?;
        let deleted = self.db.delete(&mut wtxn, key).map_err(delete_failed)?;
        wtxn.commit().map_err(delete_failed)?;
        Ok(deleted)
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PersistenceError> {
        let rtxn = self.env.read_txn().map_err(read_failed)?;
        let iter = self.db.iter(&rtxn).map_err(read_failed)?;

        let mut records = Vec::new();
        for result in iter {
            match result {
                Ok((key, value)) => {
                    if key.starts_with(prefix) {
                        records.push((key.to_vec(), value.to_vec()));
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable LMDB record");
                    continue;
                }
            }
        }
        Ok(records)
    }

    async fn len(&self) -> Result<usize, PersistenceError> {
        let rtxn = self.env.read_txn().map_err(read_failed)?;
        let len = self.db.len(&rtxn).map_err(read_failed)?;
        Ok(len as usize)
    }
}
