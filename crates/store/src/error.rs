//! Error types for the index store.
//!
//! Errors are grouped by category the same way callers need to react to them:
//! resource state, concurrency (some of which are retried at the operation
//! boundary), validation, backend failures and per-message ingest problems.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

use crate::dialect::{DatabaseTranslator, ErrorCategory, SqliteTranslator};

/// The primary error type for all storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Resource state errors
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Concurrency and versioning errors
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// Validation errors
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Backend-specific errors
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Index message errors
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Errors related to resource state.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The requested resource was not found.
    #[error("resource not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    /// The current version of the resource is a delete marker.
    #[error("resource deleted: {resource_type}/{id}")]
    Gone {
        resource_type: String,
        id: String,
        version_id: i32,
    },

    /// The requested version of the resource was not found.
    #[error("version not found: {resource_type}/{id}/_history/{version_id}")]
    VersionNotFound {
        resource_type: String,
        id: String,
        version_id: i32,
    },
}

/// Errors related to concurrency control.
#[derive(Error, Debug)]
pub enum ConcurrencyError {
    /// Another writer created the logical resource first. The whole write
    /// has to be restarted because the winner now holds the row lock.
    #[error("identity conflict creating {resource_type}/{id}")]
    IdentityConflict { resource_type: String, id: String },

    /// The version pointer did not match what was read under lock.
    #[error("version conflict on {resource_type}/{id}: expected {expected_version}, found {actual_version}")]
    VersionConflict {
        resource_type: String,
        id: String,
        expected_version: i32,
        actual_version: i32,
    },

    /// Deadlock detected by the engine.
    #[error("deadlock detected: {message}")]
    Deadlock { message: String },

    /// Lock acquisition timed out.
    #[error("lock timeout: {message}")]
    LockTimeout { message: String },
}

/// Errors related to request validation.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// The resource type is not configured in this store.
    #[error("unsupported resource type: {resource_type}")]
    UnsupportedResourceType { resource_type: String },

    /// The logical id does not match the allowed id syntax.
    #[error("invalid logical id '{id}' for {resource_type}")]
    InvalidLogicalId { resource_type: String, id: String },

    /// A reindex cutoff later than the current time.
    #[error("reindex cutoff {cutoff} is in the future")]
    InvalidCutoff { cutoff: String },

    /// The payload is not usable for this resource.
    #[error("invalid resource: {message}")]
    InvalidResource { message: String },
}

/// Errors originating from the database backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Connection to the backend failed or was lost.
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    /// Connection pool exhausted.
    #[error("connection pool exhausted for {backend_name}")]
    PoolExhausted { backend_name: String },

    /// Unique constraint hit. Expected during dictionary races.
    #[error("duplicate value: {message}")]
    DuplicateValue { message: String },

    /// A table, sequence or column the core expects does not exist.
    #[error("undefined object: {message}")]
    UndefinedObject { message: String },

    /// Catch-all data access failure.
    #[error("data access error: {message}")]
    DataAccess {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

/// Per-message problems in the distributed index path. These drop the
/// offending message and never abort the enclosing batch.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("malformed index message: {message}")]
    Malformed { message: String },

    #[error("unsupported message version {version}, minimum is {minimum}")]
    UnsupportedVersion { version: u32, minimum: u32 },

    #[error("message for tenant '{actual}' delivered to tenant '{expected}'")]
    TenantMismatch { expected: String, actual: String },
}

/// User-visible classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// Version conflict; re-read and reapply.
    Conflict,
    /// The resource or version does not exist.
    NotFound,
    /// The resource is deleted.
    Gone,
    /// The request was invalid.
    Invalid,
    /// Transient; the caller may retry.
    Retry,
    /// Unexpected engine failure.
    Internal,
}

impl fmt::Display for ErrorOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorOutcome::Conflict => write!(f, "conflict"),
            ErrorOutcome::NotFound => write!(f, "not found"),
            ErrorOutcome::Gone => write!(f, "gone"),
            ErrorOutcome::Invalid => write!(f, "invalid request"),
            ErrorOutcome::Retry => write!(f, "temporarily unavailable, retry"),
            ErrorOutcome::Internal => write!(f, "internal error"),
        }
    }
}

impl StorageError {
    /// Returns true when the failed operation can be retried as a whole.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Concurrency(
                ConcurrencyError::IdentityConflict { .. }
                    | ConcurrencyError::Deadlock { .. }
                    | ConcurrencyError::LockTimeout { .. }
            ) | StorageError::Backend(
                BackendError::ConnectionFailed { .. } | BackendError::PoolExhausted { .. }
            )
        )
    }

    /// Returns true for a unique constraint violation.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StorageError::Backend(BackendError::DuplicateValue { .. }))
    }

    /// Maps the error to what a caller outside the store gets to see.
    pub fn outcome(&self) -> ErrorOutcome {
        match self {
            StorageError::Resource(ResourceError::Gone { .. }) => ErrorOutcome::Gone,
            StorageError::Resource(_) => ErrorOutcome::NotFound,
            StorageError::Concurrency(ConcurrencyError::VersionConflict { .. }) => {
                ErrorOutcome::Conflict
            }
            StorageError::Validation(_) | StorageError::Message(_) => ErrorOutcome::Invalid,
            err if err.is_retryable() => ErrorOutcome::Retry,
            _ => ErrorOutcome::Internal,
        }
    }

    /// Builds a storage error from a classified engine failure.
    pub fn from_category(category: ErrorCategory, message: String) -> Self {
        match category {
            ErrorCategory::DuplicateValue => BackendError::DuplicateValue { message }.into(),
            ErrorCategory::LockTimeout => ConcurrencyError::LockTimeout { message }.into(),
            ErrorCategory::Deadlock => ConcurrencyError::Deadlock { message }.into(),
            ErrorCategory::UndefinedObject => BackendError::UndefinedObject { message }.into(),
            ErrorCategory::ConnectionLost => BackendError::ConnectionFailed {
                backend_name: "database".to_string(),
                message,
            }
            .into(),
            ErrorCategory::Other => BackendError::DataAccess {
                message,
                source: None,
            }
            .into(),
        }
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Shorthand for a fatal data access failure with context.
pub(crate) fn data_access(message: impl Into<String>) -> StorageError {
    StorageError::Backend(BackendError::DataAccess {
        message: message.into(),
        source: None,
    })
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(BackendError::SerializationError {
            message: err.to_string(),
        })
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match SqliteTranslator.classify_sqlite(&err) {
            ErrorCategory::Other => StorageError::Backend(BackendError::DataAccess {
                message: err.to_string(),
                source: Some(Box::new(err)),
            }),
            category => StorageError::from_category(category, err.to_string()),
        }
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(_err: r2d2::Error) -> Self {
        StorageError::Backend(BackendError::PoolExhausted {
            backend_name: "sqlite".to_string(),
        })
    }
}
