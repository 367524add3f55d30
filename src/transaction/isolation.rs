//! Isolation levels for reads made outside a transaction.
//!
//! kvtx supports two isolation levels:
//! - ReadUncommitted: reads see in-flight writes of pending transactions
//! - ReadCommitted: reads see only values written by committed transactions
//!
//! Both are implemented by an [`IsolationHandler`] that turns an item as
//! stored (possibly locked) into what the caller is allowed to see.

use std::fmt;

use crate::storage::{display_item, Item};
use crate::transaction::attributes;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::item::{TransactionItem, TransactionState};
use crate::transaction::manager::TransactionManager;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read Uncommitted isolation.
    ///
    /// Each read returns the item as currently stored, including writes of
    /// transactions that may still roll back. Only a placeholder that was
    /// never written reads as missing.
    Uncommitted,

    /// Read Committed isolation.
    ///
    /// Each read returns the most recently committed value. A value written by
    /// a transaction that has not committed is replaced by the image saved
    /// before that write.
    #[default]
    Committed,
}

impl IsolationLevel {
    /// Get a human-readable description of this isolation level.
    pub fn description(&self) -> &'static str {
        match self {
            IsolationLevel::Uncommitted => "Each read sees the latest written data, committed or not",
            IsolationLevel::Committed => "Each read sees the latest committed data",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::Uncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::Committed => write!(f, "READ COMMITTED"),
        }
    }
}

/// Parse isolation level from string.
impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "READ UNCOMMITTED" | "READ_UNCOMMITTED" | "UNCOMMITTED" => Ok(IsolationLevel::Uncommitted),
            "READ COMMITTED" | "READ_COMMITTED" | "COMMITTED" => Ok(IsolationLevel::Committed),
            _ => Err(format!("unknown isolation level: {}", s)),
        }
    }
}

/// Decides what a reader sees of an item read straight from the store.
pub trait IsolationHandler {
    /// Map a stored item to its visible value, without lock attributes.
    /// `None` means the item reads as missing.
    fn handle_item(&self, item: Item, table: &str) -> TransactionResult<Option<Item>>;
}

/// Handler for [`IsolationLevel::Uncommitted`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadUncommitted;

impl IsolationHandler for ReadUncommitted {
    fn handle_item(&self, item: Item, _table: &str) -> TransactionResult<Option<Item>> {
        if attributes::is_transient(&item) && !attributes::is_applied(&item) {
            return Ok(None);
        }
        Ok(Some(attributes::strip_lock_attributes(item)))
    }
}

/// Handler for [`IsolationLevel::Committed`].
#[derive(Debug, Clone)]
pub struct ReadCommitted {
    manager: TransactionManager,
}

impl ReadCommitted {
    pub fn new(manager: TransactionManager) -> Self {
        Self { manager }
    }

    /// Resolve one observed item version.
    ///
    /// `UnknownCompletedTransaction` and `TransactionNotFound` mean the owner
    /// finished while we looked; the caller re-reads the item.
    fn resolve(&self, item: Item, table: &str) -> TransactionResult<Option<Item>> {
        let Some(owner) = attributes::owner(&item).map(str::to_string) else {
            return Ok(Some(item));
        };
        let transient = attributes::is_transient(&item);
        if !attributes::is_applied(&item) {
            return Ok((!transient).then(|| attributes::strip_lock_attributes(item)));
        }

        let other = TransactionItem::load(self.manager.clone(), &owner)?;
        if other.state() == TransactionState::Committed {
            return Ok(Some(attributes::strip_lock_attributes(item)));
        }
        if transient {
            return Ok(None);
        }

        let key = self.manager.key_schema(table)?.project(&item)?;
        let request = other.request_for(table, &key)?.ok_or_else(|| {
            TransactionError::assertion(
                &owner,
                format!("item {} in {} is locked without a request", display_item(&key), table),
            )
        })?;
        let rid = request
            .rid
            .ok_or_else(|| TransactionError::assertion(&owner, "logged request has no rid"))?;

        match other.load_item_image(rid)? {
            Some(image) => Ok(Some(image)),
            None => Err(TransactionError::UnknownCompletedTransaction {
                tx_id: owner,
                reason: format!("image for request {} is gone", rid),
            }),
        }
    }
}

impl IsolationHandler for ReadCommitted {
    fn handle_item(&self, item: Item, table: &str) -> TransactionResult<Option<Item>> {
        let attempts = self.manager.config().committed_read_attempts.max(1);
        let key = self.manager.key_schema(table)?.project(&item)?;
        let mut current = item;

        for attempt in 1..=attempts {
            match self.resolve(current, table) {
                Ok(visible) => return Ok(visible),
                Err(e @ TransactionError::UnknownCompletedTransaction { .. })
                | Err(e @ TransactionError::TransactionNotFound { .. }) => {
                    tracing::debug!(table, attempt, error = %e, "owner completed during committed read, re-reading");
                }
                Err(e) => return Err(e),
            }
            match self.manager.store().get_item(table, &key, true)? {
                Some(item) => current = item,
                None => return Ok(None),
            }
        }

        Err(TransactionError::ReadRetriesExhausted {
            table: table.to_string(),
            attempts,
        })
    }
}
