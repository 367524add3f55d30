//! JSON-file-backed durable store.
//!
//! Each table lives in `{dir}/{table}.table.json`. Every successful write
//! rewrites that file atomically (temp file + rename), so a process that dies
//! at any point leaves either the old or the new table on disk. Reopening the
//! directory picks up exactly what was persisted.
//!
//! Only one open `FileStore` per directory is supported; clones share state.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tempfile::NamedTempFile;

use crate::storage::condition::{Expected, Updates};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::store::{ItemStore, DEFAULT_MAX_ITEM_SIZE};
use crate::storage::table::{validate_table_name, Table};
use crate::storage::types::{AttributeValue, Item, Key, KeySchema};

const TABLE_SUFFIX: &str = ".table.json";

/// An [`ItemStore`] that persists every table as a JSON file.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<FileStoreInner>,
}

struct FileStoreInner {
    dir: PathBuf,
    tables: RwLock<BTreeMap<String, Table>>,
    max_item_size: usize,
}

impl FileStore {
    /// Open a data directory, creating it if missing, and load every table in it.
    pub fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut tables = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(name) = file_name.strip_suffix(TABLE_SUFFIX).map(str::to_string) else {
                continue;
            };
            let table = load_table(&path)?;
            if table.name != name {
                return Err(StorageError::CorruptedData {
                    path,
                    reason: format!(
                        "table name mismatch: file name suggests '{}' but content has '{}'",
                        name, table.name
                    ),
                });
            }
            tables.insert(table.name.clone(), table);
        }

        tracing::debug!(dir = %dir.display(), tables = tables.len(), "opened file store");

        Ok(Self {
            inner: Arc::new(FileStoreInner {
                dir,
                tables: RwLock::new(tables),
                max_item_size: DEFAULT_MAX_ITEM_SIZE,
            }),
        })
    }

    /// The data directory.
    pub fn path(&self) -> &Path {
        &self.inner.dir
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.inner.dir.join(format!("{}{}", table, TABLE_SUFFIX))
    }

    fn persist(&self, table: &Table) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(table)?;
        let mut tmp = NamedTempFile::new_in(&self.inner.dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.table_path(&table.name))
            .map_err(|e| StorageError::Io(e.error))?;
        Ok(())
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

    /// Run a mutation against a copy of the table and persist it before
    /// making it visible. A failed mutation or write leaves the table as it was.
    fn with_table_mut<F, T>(&self, table: &str, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Table) -> StorageResult<T>,
    {
        let mut tables = self.inner.tables.write();
        let current = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;
        let mut next = current.clone();
        let result = f(&mut next)?;
        self.persist(&next)?;
        *current = next;
        Ok(result)
    }
}

fn load_table(path: &Path) -> StorageResult<Table> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| StorageError::CorruptedData {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

impl ItemStore for FileStore {
    fn create_table(&self, table: &str, schema: KeySchema) -> StorageResult<()> {
        validate_table_name(table)?;
        let mut tables = self.inner.tables.write();
        if tables.contains_key(table) {
            return Err(StorageError::TableAlreadyExists(table.to_string()));
        }
        let t = Table::new(table, schema);
        self.persist(&t)?;
        tables.insert(table.to_string(), t);
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
