//! The key-value store contract the transaction protocol is built on.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::storage::condition::{Expected, Updates};
use crate::storage::error::StorageResult;
use crate::storage::types::{AttributeValue, Item, Key, KeySchema};

/// Default per-item size limit in bytes.
pub const DEFAULT_MAX_ITEM_SIZE: usize = 400 * 1024;

/// A key-value store offering single-item conditional writes.
///
/// This is the whole surface the transaction layer needs. Every write takes
/// an [`Expected`] set which the store checks atomically with the write; a
/// failed check is reported as
/// [`StorageError::ConditionFailed`](crate::storage::StorageError::ConditionFailed)
/// and nothing is written. The store gives no multi-item atomicity.
pub trait ItemStore: Send + Sync {
    /// Create a table with the given key schema.
    fn create_table(&self, table: &str, schema: KeySchema) -> StorageResult<()>;

    /// The key schema a table was created with.
    fn key_schema(&self, table: &str) -> StorageResult<KeySchema>;

    /// Names of every table.
    fn list_tables(&self) -> StorageResult<Vec<String>>;

    /// Read one item.
    fn get_item(&self, table: &str, key: &Key, consistent_read: bool) -> StorageResult<Option<Item>>;

    /// Replace a whole item, returning the previous one.
    fn put_item(&self, table: &str, item: Item, expected: &Expected) -> StorageResult<Option<Item>>;

    /// Update (or create) an item, returning its new image.
    fn update_item(
        &self,
        table: &str,
        key: &Key,
        updates: &Updates,
        expected: &Expected,
    ) -> StorageResult<Item>;

    /// Delete an item, returning it if it existed.
    fn delete_item(&self, table: &str, key: &Key, expected: &Expected) -> StorageResult<Option<Item>>;

    /// Every item whose hash key equals the value.
    fn query(&self, table: &str, hash_value: &AttributeValue) -> StorageResult<Vec<Item>>;

    /// Every item in a table.
    fn scan(&self, table: &str) -> StorageResult<Vec<Item>>;

    /// Read many items across tables. Missing items are left out.
    fn batch_get(
        &self,
        requests: &BTreeMap<String, Vec<Key>>,
    ) -> StorageResult<BTreeMap<String, Vec<Item>>> {
        let mut results = BTreeMap::new();
        for (table, keys) in requests {
            let mut items = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(item) = self.get_item(table, key, false)? {
                    items.push(item);
                }
            }
            results.insert(table.clone(), items);
        }
        Ok(results)
    }

    /// Largest item the store accepts, in bytes.
    fn max_item_size(&self) -> usize {
        DEFAULT_MAX_ITEM_SIZE
    }
}

impl<S: ItemStore + ?Sized> ItemStore for Arc<S> {
    fn create_table(&self, table: &str, schema: KeySchema) -> StorageResult<()> {
        (**self).create_table(table, schema)
    }

    fn key_schema(&self, table: &str) -> StorageResult<KeySchema> {
        (**self).key_schema(table)
    }

    fn list_tables(&self) -> StorageResult<Vec<String>> {
        (**self).list_tables()
    }

    fn get_item(&self, table: &str, key: &Key, consistent_read: bool) -> StorageResult<Option<Item>> {
        (**self).get_item(table, key, consistent_read)
    }

    fn put_item(&self, table: &str, item: Item, expected: &Expected) -> StorageResult<Option<Item>> {
        (**self).put_item(table, item, expected)
    }

    fn update_item(
        &self,
        table: &str,
        key: &Key,
        updates: &Updates,
        expected: &Expected,
    ) -> StorageResult<Item> {
        (**self).update_item(table, key, updates, expected)
    }

    fn delete_item(&self, table: &str, key: &Key, expected: &Expected) -> StorageResult<Option<Item>> {
        (**self).delete_item(table, key, expected)
    }

    fn query(&self, table: &str, hash_value: &AttributeValue) -> StorageResult<Vec<Item>> {
        (**self).query(table, hash_value)
    }

    fn scan(&self, table: &str) -> StorageResult<Vec<Item>> {
        (**self).scan(table)
    }

    fn batch_get(
        &self,
        requests: &BTreeMap<String, Vec<Key>>,
    ) -> StorageResult<BTreeMap<String, Vec<Item>>> {
        (**self).batch_get(requests)
    }

    fn max_item_size(&self) -> usize {
        (**self).max_item_size()
    }
}
