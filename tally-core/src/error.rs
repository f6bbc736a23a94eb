//! Error types for Tally operations

use std::time::Duration;
use thiserror::Error;

/// Key canonicalization errors.
///
/// These are programmer errors: the caller supplied an operation name or
/// parameters that cannot be turned into a canonical cache key. They are
/// never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Operation name must not be empty")]
    EmptyOperation,

    #[error("Invalid operation name {name:?}: {reason}")]
    InvalidOperation { name: String, reason: String },

    #[error("Parameter name must not be empty")]
    EmptyParamName,

    #[error("Conflicting values supplied for parameter {name}")]
    ConflictingParam { name: String },

    #[error("Unsupported value for parameter {name}: {reason}")]
    UnsupportedValue { name: String, reason: String },

    #[error("Parameters must be a JSON object, got {kind}")]
    NotAnObject { kind: String },

    #[error("Mutation context is missing field {field}")]
    MissingContextField { field: String },

    #[error("Field {name} is bound on predicate pattern {pattern}, which takes no parameters")]
    UnusedBinding { name: String, pattern: String },
}

/// Fetch outcome errors.
///
/// Every caller joined on the same in-flight operation receives a clone of
/// the same error, so this type is `Clone + PartialEq`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Transient fetch failure for {operation}: {reason}")]
    Transient { operation: String, reason: String },

    #[error("Fetch for {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Bulk response for {operation} is missing member {key}")]
    PartialBatch { operation: String, key: String },

    #[error("Invalid cache key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("No executor registered for operation {operation}")]
    UnknownOperation { operation: String },

    #[error("Mutation kind {kind} has no declared invalidation rules")]
    UndeclaredMutation { kind: String },

    #[error("Coordinated task for {operation} was aborted: {reason}")]
    Aborted { operation: String, reason: String },
}

impl FetchError {
    /// Build a transient failure.
    pub fn transient(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if a caller may safely retry the fetch.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Timeout { .. } | Self::PartialBatch { .. } | Self::Aborted { .. }
        )
    }

    /// Returns true for errors caused by the caller rather than the remote side.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidKey(_) | Self::UnknownOperation { .. } | Self::UndeclaredMutation { .. }
        )
    }
}

/// Durable tier errors.
///
/// Never surfaced to `fetch` callers; the persistent adapter logs and
/// swallows them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Failed to open durable environment: {reason}")]
    EnvOpen { reason: String },

    #[error("Durable read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("Durable write rejected: {reason}")]
    WriteFailed { reason: String },

    #[error("Durable delete failed: {reason}")]
    DeleteFailed { reason: String },

    #[error("Corrupt durable record: {reason}")]
    Corrupt { reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Operation {operation} is already configured")]
    AlreadyConfigured { operation: String },

    #[error("Operation {operation} must be configured before {what} can be registered")]
    NotConfigured { operation: String, what: String },
}

/// Master error type for all Tally errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TallyError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Tally operations.
pub type TallyResult<T> = Result<T, TallyError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_is_retryable() {
        let err = FetchError::transient("list-vouchers", "connection reset");
        assert!(err.is_retryable());
        assert!(!err.is_programmer_error());
        assert!(format!("{}", err).contains("connection reset"));
    }

    #[test]
    fn test_invalid_key_is_not_retryable() {
        let err = FetchError::from(KeyError::EmptyOperation);
        assert!(!err.is_retryable());
        assert!(err.is_programmer_error());
    }

    #[test]
    fn test_timeout_display() {
        let err = FetchError::Timeout {
            operation: "list-invoices".to_string(),
            after: Duration::from_millis(250),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("list-invoices"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn test_tally_error_from_conversions() {
        let err: TallyError = PersistenceError::WriteFailed {
            reason: "disk full".to_string(),
        }
        .into();
        assert!(matches!(err, TallyError::Persistence(_)));

        let err: TallyError = ConfigError::AlreadyConfigured {
            operation: "list-vouchers".to_string(),
        }
        .into();
        assert!(format!("{}", err).contains("already configured"));
    }

    #[test]
    fn test_fetch_errors_compare_by_value() {
        let a = FetchError::transient("op", "boom");
        let b = a.clone();
        assert_eq!(a, b);
    }
}
