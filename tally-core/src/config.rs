//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ConfigError, TallyResult};

/// Default bulk threshold: a bulk call is used once more than this many keys
/// are requested together.
pub const DEFAULT_BULK_THRESHOLD: usize = 2;

/// Per-operation cache policy, registered once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPolicy {
    /// How long a fetched value is considered fresh.
    pub ttl: Duration,
    /// Whether successful results are mirrored to the durable tier.
    pub durable: bool,
    /// Member count that must be exceeded before a bulk call is chosen.
    pub bulk_threshold: usize,
}

impl OperationPolicy {
    /// Create a volatile policy with the given TTL and the default bulk threshold.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            durable: false,
            bulk_threshold: DEFAULT_BULK_THRESHOLD,
        }
    }

    /// Mirror results to the durable tier.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Set the bulk threshold.
    pub fn with_bulk_threshold(mut self, threshold: usize) -> Self {
        self.bulk_threshold = threshold;
        self
    }

    /// Validate the policy.
    ///
    /// A zero TTL is rejected: every read would be stale and trigger a
    /// background refresh.
    pub fn validate(&self) -> TallyResult<()> {
        if self.ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "ttl".to_string(),
                value: format!("{:?}", self.ttl),
                reason: "ttl must be positive".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Global cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL used by [`CacheConfig::default_policy`].
    pub default_ttl: Duration,
    /// Bulk threshold used by [`CacheConfig::default_policy`].
    pub default_bulk_threshold: usize,
    /// How long invalidation records are kept in the journal.
    pub journal_retention: Duration,
    /// Maximum number of records kept by the durable tier after a sweep.
    pub durable_capacity: usize,
    /// LMDB map size in megabytes.
    pub durable_map_size_mb: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            default_bulk_threshold: DEFAULT_BULK_THRESHOLD,
            journal_retention: Duration::from_secs(600),
            durable_capacity: 5_000,
            durable_map_size_mb: 64,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_bulk_threshold(mut self, threshold: usize) -> Self {
        self.default_bulk_threshold = threshold;
        self
    }

    pub fn with_journal_retention(mut self, retention: Duration) -> Self {
        self.journal_retention = retention;
        self
    }

    pub fn with_durable_capacity(mut self, capacity: usize) -> Self {
        self.durable_capacity = capacity;
        self
    }

    pub fn with_map_size_mb(mut self, size_mb: usize) -> Self {
        self.durable_map_size_mb = size_mb;
        self
    }

    /// Policy built from the global defaults.
    pub fn default_policy(&self) -> OperationPolicy {
        OperationPolicy::new(self.default_ttl).with_bulk_threshold(self.default_bulk_threshold)
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `TALLY_CACHE_DEFAULT_TTL_MS`: default TTL in milliseconds (default: 60000)
    /// - `TALLY_CACHE_BULK_THRESHOLD`: default bulk threshold (default: 2)
    /// - `TALLY_CACHE_JOURNAL_RETENTION_MS`: journal retention (default: 600000)
    /// - `TALLY_CACHE_DURABLE_CAPACITY`: durable records kept by a sweep (default: 5000)
    /// - `TALLY_CACHE_DURABLE_MAP_SIZE_MB`: LMDB map size (default: 64)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            default_ttl: env_parse::<u64>("TALLY_CACHE_DEFAULT_TTL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.default_ttl),
            default_bulk_threshold: env_parse("TALLY_CACHE_BULK_THRESHOLD")
                .unwrap_or(defaults.default_bulk_threshold),
            journal_retention: env_parse::<u64>("TALLY_CACHE_JOURNAL_RETENTION_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.journal_retention),
            durable_capacity: env_parse("TALLY_CACHE_DURABLE_CAPACITY")
                .unwrap_or(defaults.durable_capacity),
            durable_map_size_mb: env_parse("TALLY_CACHE_DURABLE_MAP_SIZE_MB")
                .unwrap_or(defaults.durable_map_size_mb),
        }
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - default_ttl and journal_retention are positive
    /// - durable_capacity > 0
    /// - durable_map_size_mb > 0
    pub fn validate(&self) -> TallyResult<()> {
        if self.default_ttl.is_zero() {
            return Err(invalid("default_ttl", format!("{:?}", self.default_ttl), "default_ttl must be positive"));
        }

        if self.journal_retention.is_zero() {
            return Err(invalid(
                "journal_retention",
                format!("{:?}", self.journal_retention),
                "journal_retention must be positive",
            ));
        }

        if self.durable_capacity == 0 {
            return Err(invalid(
                "durable_capacity",
                self.durable_capacity.to_string(),
                "durable_capacity must be greater than 0",
            ));
        }

        if self.durable_map_size_mb == 0 {
            return Err(invalid(
                "durable_map_size_mb",
                self.durable_map_size_mb.to_string(),
                "durable_map_size_mb must be greater than 0",
            ));
        }

        if self.durable_map_size_mb.checked_mul(1024 * 1024).is_none() {
            return Err(invalid(
                "durable_map_size_mb",
                self.durable_map_size_mb.to_string(),
                "durable_map_size_mb overflows the address space",
            ));
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn invalid(field: &str, value: String, reason: &str) -> crate::TallyError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    }
    .into()
}
