//! Transaction manager - the entry point for transactions and isolated reads.
//!
//! The TransactionManager handles:
//! - Transaction creation and resumption
//! - Reads outside a transaction, at a chosen isolation level
//! - Key schema lookups, cached per table
//! - Sweeping stale transactions out of the log table

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::storage::{AttributeValue, Item, ItemStore, Key, KeySchema, StorageError};
use crate::transaction::attributes::{self, IMAGE_ID, TX_ID};
use crate::transaction::config::TransactionConfig;
use crate::transaction::context::{SweepAction, Transaction};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::isolation::{IsolationHandler, IsolationLevel, ReadCommitted, ReadUncommitted};

/// Transaction manager - coordinates all transaction operations.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<TransactionManagerInner>,
}

struct TransactionManagerInner {
    /// The underlying store.
    store: Arc<dyn ItemStore>,
    config: TransactionConfig,
    /// Key schemas by table name, fetched once.
    key_schemas: RwLock<HashMap<String, KeySchema>>,
}

/// Outcome of [`TransactionManager::sweep_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Log records examined.
    pub scanned: usize,
    pub rolled_back: usize,
    /// Terminal transactions whose cleanup was re-driven.
    pub completed: usize,
    pub deleted: usize,
    /// Records whose sweep failed; they are retried on the next run.
    pub failed: usize,
}

impl SweepReport {
    fn record(&mut self, action: SweepAction) {
        match action {
            SweepAction::None => {}
            SweepAction::RolledBack => self.rolled_back += 1,
            SweepAction::Completed(_) => self.completed += 1,
            SweepAction::Deleted => self.deleted += 1,
        }
    }
}

impl std::fmt::Display for SweepReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "scanned {}, rolled back {}, completed {}, deleted {}, failed {}",
            self.scanned, self.rolled_back, self.completed, self.deleted, self.failed
        )
    }
}

impl TransactionManager {
    /// Create a new transaction manager over a store, with default configuration.
    pub fn new<S: ItemStore + 'static>(store: S) -> Self {
        Self::with_config(store, TransactionConfig::default())
    }

    /// Create a new transaction manager with explicit configuration.
    pub fn with_config<S: ItemStore + 'static>(store: S, config: TransactionConfig) -> Self {
        Self {
            inner: Arc::new(TransactionManagerInner {
                store: Arc::new(store),
                config,
                key_schemas: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Get a reference to the underlying store.
    pub fn store(&self) -> &dyn ItemStore {
        self.inner.store.as_ref()
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.inner.config
    }

    /// The key schema of a table, cached after the first lookup.
    pub fn key_schema(&self, table: &str) -> TransactionResult<KeySchema> {
        if let Some(schema) = self.inner.key_schemas.read().get(table) {
            return Ok(schema.clone());
        }
        let schema = self.inner.store.key_schema(table)?;
        self.inner
            .key_schemas
            .write()
            .insert(table.to_string(), schema.clone());
        Ok(schema)
    }

    /// Create the log and image tables if they do not exist yet.
    pub fn ensure_tables(&self) -> TransactionResult<()> {
        let config = self.config();
        for (table, hash) in [(&config.log_table, TX_ID), (&config.image_table, IMAGE_ID)] {
            match self.inner.store.create_table(table, KeySchema::hash(hash)) {
                Ok(()) => tracing::info!(table = %table, "created transaction table"),
                Err(StorageError::TableAlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Begin a new transaction.
    pub fn new_transaction(&self) -> Transaction {
        Transaction::new(self.clone())
    }

    /// Pick up an existing transaction by id.
    pub fn resume_transaction(&self, tx_id: &str) -> TransactionResult<Transaction> {
        Transaction::resume(self.clone(), tx_id)
    }

    /// Execute a function within a transaction, automatically committing or rolling back.
    ///
    /// If the function returns Ok, the transaction is committed.
    /// If the function returns Err, the transaction is rolled back and the
    /// function's error is returned.
    pub fn with_transaction<F, T>(&self, f: F) -> TransactionResult<T>
    where
        F: FnOnce(&mut Transaction) -> TransactionResult<T>,
    {
        let mut tx = self.new_transaction();

        match f(&mut tx) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(tx_id = %tx.id(), error = %rollback_err, "rollback after failed closure also failed");
                }
                Err(e)
            }
        }
    }

    fn handler(&self, isolation: IsolationLevel) -> Box<dyn IsolationHandler> {
        match isolation {
            IsolationLevel::Uncommitted => Box::new(ReadUncommitted),
            IsolationLevel::Committed => Box::new(ReadCommitted::new(self.clone())),
        }
    }

    fn isolate(&self, handler: &dyn IsolationHandler, table: &str, items: Vec<Item>) -> TransactionResult<Vec<Item>> {
        let mut visible = Vec::with_capacity(items.len());
        for item in items {
            if let Some(item) = handler.handle_item(item, table)? {
                visible.push(item);
            }
        }
        Ok(visible)
    }

    /// Read one item outside any transaction.
    pub fn get_item(&self, table: &str, key: &Key, isolation: IsolationLevel) -> TransactionResult<Option<Item>> {
        match self.store().get_item(table, key, true)? {
            Some(item) => self.handler(isolation).handle_item(item, table),
            None => Ok(None),
        }
    }

    /// Every visible item with the given hash key value.
    pub fn query(&self, table: &str, hash_value: &AttributeValue, isolation: IsolationLevel) -> TransactionResult<Vec<Item>> {
        let items = self.store().query(table, hash_value)?;
        self.isolate(self.handler(isolation).as_ref(), table, items)
    }

    /// Every visible item in a table.
    pub fn scan(&self, table: &str, isolation: IsolationLevel) -> TransactionResult<Vec<Item>> {
        let items = self.store().scan(table)?;
        self.isolate(self.handler(isolation).as_ref(), table, items)
    }

    /// Read many items across tables. Items that read as missing are left out.
    pub fn batch_get_item(
        &self,
        requests: &BTreeMap<String, Vec<Key>>,
        isolation: IsolationLevel,
    ) -> TransactionResult<BTreeMap<String, Vec<Item>>> {
        let handler = self.handler(isolation);
        let mut results = BTreeMap::new();
        for (table, items) in self.store().batch_get(requests)? {
            let visible = self.isolate(handler.as_ref(), &table, items)?;
            results.insert(table, visible);
        }
        Ok(results)
    }

    /// Sweep every transaction in the log table.
    ///
    /// Failures are logged and counted, not returned: one broken record must
    /// not stop the sweep of the rest.
    pub fn sweep_all(&self, rollback_after: Duration, delete_after: Duration) -> TransactionResult<SweepReport> {
        let mut report = SweepReport::default();
        for record in self.store().scan(&self.config().log_table)? {
            let Some(tx_id) = attributes::owner(&record) else {
                continue;
            };
            report.scanned += 1;

            let result = self
                .resume_transaction(tx_id)
                .and_then(|mut tx| tx.sweep(rollback_after, delete_after));
            match result {
                Ok(action) => report.record(action),
                Err(TransactionError::TransactionNotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!(tx_id, error = %e, "failed to sweep transaction");
                    report.failed += 1;
                }
            }
        }
        tracing::info!(%report, "sweep finished");
        Ok(report)
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.inner.config)
            .finish()
    }
}
