//! Byte layout of durable keys and records.
//!
//! # Key format
//!
//! `[operation name: UTF-8][separator: 0xFF][params: canonical JSON]`
//!
//! 0xFF never occurs in UTF-8, so the first separator byte unambiguously ends
//! the operation name, and `operation + 0xFF` is a prefix shared by every key
//! of that operation. Params serialize from a sorted map, so equal keys always
//! encode to equal bytes.
//!
//! # Record format
//!
//! `[fetched_at: i64 millis LE][ttl: u64 millis LE][value: JSON]`

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tally_core::{CacheKey, OperationName, Params, PersistenceError};

/// Separator byte between the operation name and the params.
const SEPARATOR: u8 = 0xFF;

/// Length of the record header.
pub const HEADER_LEN: usize = 16;

/// Encode a cache key for the durable tier.
pub fn encode_key(key: &CacheKey) -> Result<Vec<u8>, PersistenceError> {
    let params = serde_json::to_vec(key.params()).map_err(|e| PersistenceError::Serialization {
        reason: e.to_string(),
    })?;
    let mut bytes = operation_prefix(key.operation());
    bytes.extend_from_slice(&params);
    Ok(bytes)
}

/// Decode a durable key. Returns `None` for bytes not produced by [`encode_key`].
pub fn decode_key(bytes: &[u8]) -> Option<CacheKey> {
    let split = bytes.iter().position(|b| *b == SEPARATOR)?;
    let operation = std::str::from_utf8(&bytes[..split]).ok()?;
    let operation = OperationName::new(operation).ok()?;
    let params: Params = serde_json::from_slice(&bytes[split + 1..]).ok()?;
    Some(CacheKey::from_parts(operation, params))
}

/// Prefix shared by every durable key of `operation`.
pub fn operation_prefix(operation: &OperationName) -> Vec<u8> {
    let name = operation.as_str().as_bytes();
    let mut prefix = Vec::with_capacity(name.len() + 1);
    prefix.extend_from_slice(name);
    prefix.push(SEPARATOR);
    prefix
}

/// Encode a value with its freshness header.
pub fn encode_record<V: Serialize>(
    fetched_at: DateTime<Utc>,
    ttl: Duration,
    value: &V,
) -> Result<Vec<u8>, PersistenceError> {
    let value_bytes = serde_json::to_vec(value).map_err(|e| PersistenceError::Serialization {
        reason: e.to_string(),
    })?;
    let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);

    let mut bytes = Vec::with_capacity(HEADER_LEN + value_bytes.len());
    bytes.extend_from_slice(&fetched_at.timestamp_millis().to_le_bytes());
    bytes.extend_from_slice(&ttl_millis.to_le_bytes());
    bytes.extend_from_slice(&value_bytes);
    Ok(bytes)
}

/// Decode only the header of a record.
pub fn decode_header(bytes: &[u8]) -> Result<(DateTime<Utc>, Duration), PersistenceError> {
    if bytes.len() < HEADER_LEN {
        return Err(PersistenceError::Corrupt {
            reason: format!("record is {} bytes, header needs {}", bytes.len(), HEADER_LEN),
        });
    }

    let fetched_bytes: [u8; 8] = bytes[0..8].try_into().map_err(|_| PersistenceError::Corrupt {
        reason: "invalid timestamp".into(),
    })?;
    let ttl_bytes: [u8; 8] = bytes[8..16].try_into().map_err(|_| PersistenceError::Corrupt {
        reason: "invalid ttl".into(),
    })?;

    let fetched_at = DateTime::from_timestamp_millis(i64::from_le_bytes(fetched_bytes)).ok_or_else(
        || PersistenceError::Corrupt {
            reason: "timestamp out of range".into(),
        },
    )?;
    let ttl = Duration::from_millis(u64::from_le_bytes(ttl_bytes));
    Ok((fetched_at, ttl))
}

/// Decode a full record.
pub fn decode_record<V: DeserializeOwned>(
    bytes: &[u8],
) -> Result<(DateTime<Utc>, Duration, V), PersistenceError> {
    let (fetched_at, ttl) = decode_header(bytes)?;
    let value = serde_json::from_slice(&bytes[HEADER_LEN..]).map_err(|e| PersistenceError::Corrupt {
        reason: e.to_string(),
    })?;
    Ok((fetched_at, ttl, value))
}
