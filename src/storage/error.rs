//! Storage layer error types
//!
//! All errors an [`ItemStore`](crate::storage::ItemStore) can report are defined here.
//! A failed precondition is its own variant so callers can tell a lost race
//! apart from a broken store.

use std::path::PathBuf;

use thiserror::Error;

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// an expected-value precondition did not hold
    #[error("conditional check failed on table {table}")]
    ConditionFailed { table: String },

    /// the requested table was not found
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// the table already exists
    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    /// the item would exceed the store's per-item size limit
    #[error("item too large for table {table}: {size} bytes exceeds limit of {limit}")]
    ItemTooLarge {
        table: String,
        size: usize,
        limit: usize,
    },

    /// a key is missing attributes or carries non-key ones
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// an update could not be applied to the stored value
    #[error("invalid update on attribute {attribute}: {reason}")]
    InvalidUpdate { attribute: String, reason: String },

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// a persisted table file could not be understood
    #[error("corrupted data at {path}: {reason}")]
    CorruptedData { path: PathBuf, reason: String },

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// check if this error is a failed precondition
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, StorageError::ConditionFailed { .. })
    }

    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::TableNotFound(_))
    }

    /// check if this error is recoverable by retry
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageError::ConditionFailed { .. } | StorageError::Io(_))
    }

    pub(crate) fn condition_failed(table: &str) -> Self {
        StorageError::ConditionFailed {
            table: table.to_string(),
        }
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
