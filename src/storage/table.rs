//! In-memory table with single-item conditional writes.
//!
//! Both reference stores keep their tables as [`Table`] values. All
//! precondition checking and update application lives here so the stores only
//! differ in how they lock and persist.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage::condition::{apply_updates, Expected, Updates};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{encode_key, item_size, AttributeValue, Item, Key, KeySchema};

/// longest table name accepted
const MAX_TABLE_NAME_LEN: usize = 255;

/// validate a table name
///
/// Valid names are 1-255 characters of ASCII alphanumerics, `_`, `-` and `.`,
/// and cannot start with `.` (table names double as file names).
pub fn validate_table_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::InvalidKey("table name cannot be empty".into()));
    }
    if name.len() > MAX_TABLE_NAME_LEN {
        return Err(StorageError::InvalidKey(format!(
            "table name too long: {} characters",
            name.len()
        )));
    }
    if name.starts_with('.') {
        return Err(StorageError::InvalidKey(format!(
            "table name cannot start with '.': {}",
            name
        )));
    }
    for (i, c) in name.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' && c != '.' {
            return Err(StorageError::InvalidKey(format!(
                "invalid character '{}' at position {} in table name",
                c, i
            )));
        }
    }
    Ok(())
}

/// One table: its key schema and items indexed by encoded key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Table {
    pub name: String,
    pub schema: KeySchema,
    items: BTreeMap<String, Item>,
}

impl Table {
    pub fn new(name: impl Into<String>, schema: KeySchema) -> Self {
        Self {
            name: name.into(),
            schema,
            items: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    fn index(&self, key: &Key) -> StorageResult<String> {
        self.schema.check_key(key)?;
        encode_key(key)
    }

    fn check_size(&self, item: &Item, limit: usize) -> StorageResult<()> {
        let size = item_size(item);
        if size > limit {
            return Err(StorageError::ItemTooLarge {
                table: self.name.clone(),
                size,
                limit,
            });
        }
        Ok(())
    }

    fn check_expected(&self, current: Option<&Item>, expected: &Expected) -> StorageResult<()> {
        if expected.check(current) {
            Ok(())
        } else {
            Err(StorageError::condition_failed(&self.name))
        }
    }

    pub fn get(&self, key: &Key) -> StorageResult<Option<Item>> {
        let index = self.index(key)?;
        Ok(self.items.get(&index).cloned())
    }

    /// replace a whole item, returning the previous one
    pub fn put(&mut self, item: Item, expected: &Expected, limit: usize) -> StorageResult<Option<Item>> {
        let key = self.schema.project(&item)?;
        let index = encode_key(&key)?;
        self.check_expected(self.items.get(&index), expected)?;
        self.check_size(&item, limit)?;
        Ok(self.items.insert(index, item))
    }

    /// update (or create) an item, returning the new image
    pub fn update(
        &mut self,
        key: &Key,
        updates: &Updates,
        expected: &Expected,
        limit: usize,
    ) -> StorageResult<Item> {
        let index = self.index(key)?;
        if let Some(name) = updates.keys().find(|name| self.schema.is_key_attribute(name)) {
            return Err(StorageError::InvalidUpdate {
                attribute: name.clone(),
                reason: "key attributes cannot be updated".into(),
            });
        }
        let current = self.items.get(&index);
        self.check_expected(current, expected)?;

        let mut next = current.cloned().unwrap_or_else(|| key.clone());
        apply_updates(&mut next, updates)?;
        self.check_size(&next, limit)?;
        self.items.insert(index, next.clone());
        Ok(next)
    }

    /// delete an item, returning it if it existed
    pub fn delete(&mut self, key: &Key, expected: &Expected) -> StorageResult<Option<Item>> {
        let index = self.index(key)?;
        self.check_expected(self.items.get(&index), expected)?;
        Ok(self.items.remove(&index))
    }

    /// every item whose hash attribute equals the value
    pub fn query(&self, hash_value: &AttributeValue) -> Vec<Item> {
        self.items
            .values()
            .filter(|item| item.get(&self.schema.hash) == Some(hash_value))
            .cloned()
            .collect()
    }

    pub fn scan(&self) -> Vec<Item> {
        self.items.values().cloned().collect()
    }
}
