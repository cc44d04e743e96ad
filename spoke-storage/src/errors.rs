//! Error taxonomy for the storage core.
//!
//! Every operation surfaces one of a closed set of error kinds so that the
//! HTTP layer above can map them to status codes without inspecting
//! backend-specific details. Transient transport errors are retried inside
//! the adapters and only surface as `Unavailable` once the retry budget is
//! exhausted; logical conflicts surface unchanged and are never retried.

use thiserror::Error;

/// Unified error type for all storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("operation canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("internal storage error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Stable label for metrics and structured logs.
    pub fn kind_label(&self) -> &'static str {
        match self {
            StorageError::NotFound(_) => "not_found",
            StorageError::AlreadyExists(_) => "already_exists",
            StorageError::InvalidArgument(_) => "invalid_argument",
            StorageError::Precondition(_) => "precondition",
            StorageError::Canceled => "canceled",
            StorageError::DeadlineExceeded => "deadline_exceeded",
            StorageError::Unavailable(_) => "unavailable",
            StorageError::Internal(_) => "internal",
        }
    }

    /// Whether a bounded local retry may help. Logical conflicts and
    /// context errors never qualify.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(e.to_string()),
            std::io::ErrorKind::TimedOut => StorageError::DeadlineExceeded,
            _ => StorageError::Internal(format!("io: {}", e)),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Internal(format!("serialization: {}", e))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StorageError::NotFound("row".to_string()),
            sqlx::Error::PoolTimedOut => {
                StorageError::Unavailable("metadata pool exhausted".to_string())
            }
            sqlx::Error::PoolClosed => {
                StorageError::Unavailable("metadata pool closed".to_string())
            }
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                StorageError::Unavailable(format!("metadata transport: {}", e))
            }
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // unique_violation
                Some("23505") => StorageError::AlreadyExists(db.message().to_string()),
                // foreign_key_violation: the referenced entity is gone
                Some("23503") => StorageError::NotFound(db.message().to_string()),
                // check_violation
                Some("23514") => StorageError::InvalidArgument(db.message().to_string()),
                _ => StorageError::Internal(format!("metadata: {}", db.message())),
            },
            _ => StorageError::Internal(format!("metadata: {}", e)),
        }
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped()
        {
            StorageError::Unavailable(format!("cache transport: {}", e))
        } else {
            StorageError::Internal(format!("cache: {}", e))
        }
    }
}

/// Errors detected while loading or validating configuration. These are
/// fatal at bootstrap.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    #[error("invalid configuration for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels_are_stable() {
        assert_eq!(StorageError::NotFound("x".into()).kind_label(), "not_found");
        assert_eq!(StorageError::Canceled.kind_label(), "canceled");
        assert_eq!(
            StorageError::DeadlineExceeded.kind_label(),
            "deadline_exceeded"
        );
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(StorageError::Unavailable("x".into()).is_transient());
        assert!(!StorageError::NotFound("x".into()).is_transient());
        assert!(!StorageError::AlreadyExists("x".into()).is_transient());
        assert!(!StorageError::Canceled.is_transient());
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StorageError = io.into();
        assert!(err.is_not_found());
    }
}
