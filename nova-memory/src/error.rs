//! Engine Error Types
//!
//! Defines the error taxonomy for the memory engine.

use thiserror::Error;

/// Engine result type alias
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Memory engine errors
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigValidationError),

    /// Raw database error (classified and retried by the storage layer)
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Persistence failed after bounded retries
    #[error("storage failure during {operation} after {attempts} attempt(s): {message}")]
    StorageFailure {
        operation: String,
        attempts: u32,
        message: String,
    },

    /// Entry not found (or expired)
    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: String, id: String },

    /// Cross-owner access
    #[error("access to {id} denied for owner {owner_id}")]
    Forbidden { owner_id: String, id: String },

    /// Write would exceed the owner's quota
    #[error("quota exceeded for {owner_id}: {used} + {requested} bytes exceeds limit of {limit}")]
    QuotaExceeded {
        owner_id: String,
        used: u64,
        requested: u64,
        limit: u64,
    },

    /// Validator rejected content outright
    #[error("constitutional violation: {}", categories.join(", "))]
    ConstitutionalViolation { categories: Vec<String> },

    /// A promotion or lifecycle rule was not satisfied
    #[error("rule violation: {message}")]
    RuleViolation { message: String },

    /// Embedding generation failed or timed out (degraded, non-fatal)
    #[error("embedding unavailable: {reason}")]
    EmbeddingUnavailable { reason: String },

    /// Policy validation failed or timed out (promotion deferred)
    #[error("validation unavailable: {reason}")]
    ValidationUnavailable { reason: String },

    /// At-most-once promotion guarantee was violated
    #[error("concurrent promotion conflict on {id}")]
    ConcurrentPromotionConflict { id: String },

    /// Policy or rule set error
    #[error("policy error: {message}")]
    Policy { message: String },

    /// Invalid operation
    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },

    /// Timeout error
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MemoryError {
    /// Create a not found error
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create a forbidden error
    pub fn forbidden(owner_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Forbidden {
            owner_id: owner_id.into(),
            id: id.into(),
        }
    }

    /// Create a rule violation error
    pub fn rule_violation(message: impl Into<String>) -> Self {
        Self::RuleViolation {
            message: message.into(),
        }
    }

    /// Create an embedding unavailable error
    pub fn embedding_unavailable(reason: impl Into<String>) -> Self {
        Self::EmbeddingUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a validation unavailable error
    pub fn validation_unavailable(reason: impl Into<String>) -> Self {
        Self::ValidationUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a policy error
    pub fn policy(message: impl Into<String>) -> Self {
        Self::Policy {
            message: message.into(),
        }
    }

    /// Create an invalid operation error
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error is a forbidden error
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }

    /// Check if this error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Degraded conditions are absorbed by callers and never surface to users
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingUnavailable { .. } | Self::ValidationUnavailable { .. }
        )
    }

    /// Transient storage errors (busy / locked) that are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = MemoryError::not_found("MemoryRecord", "123");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("MemoryRecord"));
        assert!(err.to_string().contains("123"));

        let err = MemoryError::forbidden("owner-a", "mem-1");
        assert!(err.is_forbidden());
        assert!(err.to_string().contains("owner-a"));

        let err = MemoryError::timeout(5000);
        assert!(err.is_timeout());
        assert!(err.to_string().contains("5000"));
    }

    #[test]
    fn test_degraded_errors() {
        assert!(MemoryError::embedding_unavailable("model missing").is_degraded());
        assert!(MemoryError::validation_unavailable("timeout").is_degraded());
        assert!(!MemoryError::rule_violation("nope").is_degraded());
    }

    #[test]
    fn test_constitutional_violation_message() {
        let err = MemoryError::ConstitutionalViolation {
            categories: vec!["violence".into(), "cybercrime".into()],
        };
        assert_eq!(
            err.to_string(),
            "constitutional violation: violence, cybercrime"
        );
    }

    #[test]
    fn test_busy_is_retryable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(MemoryError::from(busy).is_retryable());
        assert!(!MemoryError::from(rusqlite::Error::QueryReturnedNoRows).is_retryable());
    }
}
