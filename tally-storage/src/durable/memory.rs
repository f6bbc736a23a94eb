//! In-memory substrate for tests and for clients without a durable store.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tally_core::PersistenceError;

use super::DurableSubstrate;

/// Substrate backed by a sorted map.
#[derive(Debug, Default)]
pub struct InMemorySubstrate {
    records: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl InMemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> PersistenceError {
    PersistenceError::ReadFailed {
        reason: "in-memory substrate lock poisoned".to_string(),
    }
}

#[async_trait]
impl DurableSubstrate for InMemorySubstrate {
    async fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PersistenceError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(key).cloned())
    }

    async fn write(&self, key: &[u8], value: &[u8]) -> Result<(), PersistenceError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        records.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, PersistenceError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        Ok(records.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PersistenceError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn len(&self) -> Result<usize, PersistenceError> {
        Ok(self.records.read().map_err(|_| poisoned())?.len())
    }
}
