//! In-memory store.
//!
//! Thread-safe and cheap to clone; every clone sees the same tables. Useful
//! for embedding and for tests that need several "processes" sharing one
//! store.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::storage::condition::{Expected, Updates};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::store::{ItemStore, DEFAULT_MAX_ITEM_SIZE};
use crate::storage::table::{validate_table_name, Table};
use crate::storage::types::{AttributeValue, Item, Key, KeySchema};

/// An [`ItemStore`] that keeps every table in memory.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

struct MemoryStoreInner {
    tables: RwLock<BTreeMap<String, Table>>,
    max_item_size: usize,
}

impl MemoryStore {
    /// Create an empty store with the default item size limit.
    pub fn new() -> Self {
        Self::with_max_item_size(DEFAULT_MAX_ITEM_SIZE)
    }

    /// Create an empty store with a custom item size limit.
    pub fn with_max_item_size(max_item_size: usize) -> Self {
        Self {
            inner: Arc::new(MemoryStoreInner {
                tables: RwLock::new(BTreeMap::new()),
                max_item_size,
            }),
        }
    }

    /// Number of items in a table.
    pub fn item_count(&self, table: &str) -> StorageResult<usize> {
        self.with_table(table, |t| Ok(t.len()))
    }

    fn with_table<F, T>(&self, table: &str, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Table) -> StorageResult<T>,
    {
        let tables = self.inner.tables.read();
        let t = tables
            .get(table)
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;
        f(t)
    }

    fn with_table_mut<F, T>(&self, table: &str, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Table) -> StorageResult<T>,
    {
        let mut tables = self.inner.tables.write();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;
        f(t)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemStore for MemoryStore {
    fn create_table(&self, table: &str, schema: KeySchema) -> StorageResult<()> {
        validate_table_name(table)?;
        let mut tables = self.inner.tables.write();
        if tables.contains_key(table) {
            return Err(StorageError::TableAlreadyExists(table.to_string()));
        }
        tables.insert(table.to_string(), Table::new(table, schema));
        Ok(())
    }

    fn key_schema(&self, table: &str) -> StorageResult<KeySchema> {
        self.with_table(table, |t| Ok(t.schema.clone()))
    }

    fn list_tables(&self) -> StorageResult<Vec<String>> {
        Ok(self.inner.tables.read().keys().cloned().collect())
    }

    fn get_item(&self, table: &str, key: &Key, _consistent_read: bool) -> StorageResult<Option<Item>> {
        self.with_table(table, |t| t.get(key))
    }

    fn put_item(&self, table: &str, item: Item, expected: &Expected) -> StorageResult<Option<Item>> {
        let limit = self.inner.max_item_size;
        self.with_table_mut(table, |t| t.put(item, expected, limit))
    }

    fn update_item(
        &self,
        table: &str,
        key: &Key,
        updates: &Updates,
        expected: &Expected,
    ) -> StorageResult<Item> {
        let limit = self.inner.max_item_size;
        self.with_table_mut(table, |t| t.update(key, updates, expected, limit))
    }

    fn delete_item(&self, table: &str, key: &Key, expected: &Expected) -> StorageResult<Option<Item>> {
        self.with_table_mut(table, |t| t.delete(key, expected))
    }

    fn query(&self, table: &str, hash_value: &AttributeValue) -> StorageResult<Vec<Item>> {
        self.with_table(table, |t| Ok(t.query(hash_value)))
    }

    fn scan(&self, table: &str) -> StorageResult<Vec<Item>> {
        self.with_table(table, |t| Ok(t.scan()))
    }

    fn max_item_size(&self) -> usize {
        self.inner.max_item_size
    }
}
