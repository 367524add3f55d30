//! Transaction error types.

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A request or log record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The request has an unsupported or malformed shape.
    #[error("invalid request in transaction {}: {reason}", display_tx(.tx_id))]
    InvalidRequest {
        tx_id: Option<String>,
        reason: String,
    },

    /// The transaction already holds a different request on the same item.
    #[error("transaction {tx_id} already has a request on {table} {key}")]
    DuplicateRequest {
        tx_id: String,
        table: String,
        key: String,
    },

    /// Lost the lock on an item to another transaction.
    #[error("transaction {tx_id} could not lock {table} {key} (held by {})", display_tx(.owner))]
    ItemNotLocked {
        tx_id: String,
        owner: Option<String>,
        table: String,
        key: String,
    },

    /// The transaction has committed; no further changes are possible.
    #[error("transaction {tx_id} has already committed")]
    TransactionCommitted { tx_id: String },

    /// The transaction has rolled back; no further changes are possible.
    #[error("transaction {tx_id} has been rolled back")]
    TransactionRolledBack { tx_id: String },

    /// No log record exists for the transaction.
    #[error("transaction not found: {tx_id}")]
    TransactionNotFound { tx_id: String },

    /// The final state of a transaction could not be determined.
    #[error("completion of transaction {tx_id} is unknown: {reason}")]
    UnknownCompletedTransaction { tx_id: String, reason: String },

    /// An internal invariant does not hold.
    #[error("assertion failed in transaction {tx_id}: {reason}")]
    TransactionAssertion { tx_id: String, reason: String },

    /// The transaction is still pending and cannot be deleted.
    #[error("transaction {tx_id} is still pending")]
    StillPending { tx_id: String },

    /// A committed read kept racing with transactions completing underneath it.
    #[error("ran out of attempts ({attempts}) to read a committed image from {table}")]
    ReadRetriesExhausted { table: String, attempts: u32 },
}

fn display_tx(tx_id: &Option<String>) -> &str {
    tx_id.as_deref().unwrap_or("<none>")
}

impl TransactionError {
    /// Check if this error is retryable.
    ///
    /// Retryable errors mean the caller may retry the whole top-level call
    /// (possibly in a new transaction); they never mean the data is broken.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransactionError::ItemNotLocked { .. }
            | TransactionError::TransactionRolledBack { .. }
            | TransactionError::UnknownCompletedTransaction { .. }
            | TransactionError::ReadRetriesExhausted { .. } => true,
            TransactionError::Storage(e) => e.is_retriable(),
            _ => false,
        }
    }

    /// Check if the transaction reached a terminal state.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            TransactionError::TransactionCommitted { .. }
                | TransactionError::TransactionRolledBack { .. }
        )
    }

    pub(crate) fn invalid(tx_id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            tx_id: Some(tx_id.to_string()),
            reason: reason.into(),
        }
    }

    pub(crate) fn assertion(tx_id: &str, reason: impl Into<String>) -> Self {
        Self::TransactionAssertion {
            tx_id: tx_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let contended = TransactionError::ItemNotLocked {
            tx_id: "tx001".to_string(),
            owner: Some("tx002".to_string()),
            table: "users".to_string(),
            key: "{Id: \"a\"}".to_string(),
        };
        assert!(contended.is_retryable());
        assert!(!contended.is_completed());

        let duplicate = TransactionError::DuplicateRequest {
            tx_id: "tx001".to_string(),
            table: "users".to_string(),
            key: "{Id: \"a\"}".to_string(),
        };
        assert!(!duplicate.is_retryable());

        let committed = TransactionError::TransactionCommitted {
            tx_id: "tx001".to_string(),
        };
        assert!(!committed.is_retryable());
        assert!(committed.is_completed());

        let raced = TransactionError::Storage(StorageError::ConditionFailed {
            table: "users".to_string(),
        });
        assert!(raced.is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = TransactionError::InvalidRequest {
            tx_id: None,
            reason: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "invalid request in transaction <none>: missing key");

        let err = TransactionError::ItemNotLocked {
            tx_id: "t1".to_string(),
            owner: None,
            table: "users".to_string(),
            key: "k".to_string(),
        };
        assert!(err.to_string().contains("held by <none>"));
    }
}
