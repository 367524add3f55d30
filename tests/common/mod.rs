//! Shared fixtures for the protocol scenario tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use kvtx::storage::{
    AttributeValue, Expected, Item, ItemStore, Key, KeySchema, MemoryStore, StorageError,
    StorageResult, UpdateAction, Updates,
};
use kvtx::transaction::attributes::APPLIED;
use kvtx::transaction::{TransactionConfig, TransactionManager};

pub const USERS: &str = "users";

pub fn key(id: &str) -> Key {
    let mut key = Key::new();
    key.insert("Id".into(), AttributeValue::s(id));
    key
}

pub fn user(id: &str, v: i64) -> Item {
    let mut item = key(id);
    item.insert("v".into(), AttributeValue::n(v));
    item
}

/// A memory store with a `users` table and the transaction tables.
pub fn setup() -> (FaultyStore, TransactionManager) {
    setup_with(TransactionConfig::default())
}

pub fn setup_with(config: TransactionConfig) -> (FaultyStore, TransactionManager) {
    let store = FaultyStore::new();
    store.create_table(USERS, KeySchema::hash("Id")).unwrap();
    let manager = TransactionManager::with_config(store.clone(), config);
    manager.ensure_tables().unwrap();
    (store, manager)
}

/// A store that can be told to fail the next write that applies a request.
///
/// The write fails before reaching the store, which leaves the item locked
/// but unapplied: the state a process crash between lock and apply leaves.
///
/// It can also run a hook just before the next update of a given table, to
/// interleave another holder's work with a protocol step.
#[derive(Clone, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    fail_apply: Arc<AtomicBool>,
    before_update: Arc<Mutex<Option<(String, UpdateHook)>>>,
}

type UpdateHook = Box<dyn FnOnce() + Send>;

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_apply(&self) {
        self.fail_apply.store(true, Ordering::SeqCst);
    }

    /// Run `hook` once, before the next update of `table` reaches the store.
    pub fn before_next_update(&self, table: &str, hook: impl FnOnce() + Send + 'static) {
        *self.before_update.lock() = Some((table.to_string(), Box::new(hook)));
    }

    fn run_update_hook(&self, table: &str) {
        let hook = {
            let mut slot = self.before_update.lock();
            match slot.take() {
                Some((target, hook)) if target == table => Some(hook),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    /// The item exactly as stored, lock attributes included.
    pub fn raw(&self, table: &str, key: &Key) -> Option<Item> {
        self.inner.get_item(table, key, true).unwrap()
    }

    pub fn count(&self, table: &str) -> usize {
        self.inner.item_count(table).unwrap()
    }

    fn check_fault(&self, applies: bool) -> StorageResult<()> {
        if applies && self.fail_apply.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Internal("injected apply failure".into()));
        }
        Ok(())
    }
}

impl ItemStore for FaultyStore {
    fn create_table(&self, table: &str, schema: KeySchema) -> StorageResult<()> {
        self.inner.create_table(table, schema)
    }

    fn key_schema(&self, table: &str) -> StorageResult<KeySchema> {
        self.inner.key_schema(table)
    }

    fn list_tables(&self) -> StorageResult<Vec<String>> {
        self.inner.list_tables()
    }

    fn get_item(&self, table: &str, key: &Key, consistent_read: bool) -> StorageResult<Option<Item>> {
        self.inner.get_item(table, key, consistent_read)
    }

    fn put_item(&self, table: &str, item: Item, expected: &Expected) -> StorageResult<Option<Item>> {
        self.check_fault(item.contains_key(APPLIED))?;
        self.inner.put_item(table, item, expected)
    }

    fn update_item(
        &self,
        table: &str,
        key: &Key,
        updates: &Updates,
        expected: &Expected,
    ) -> StorageResult<Item> {
        self.run_update_hook(table);
        self.check_fault(matches!(updates.get(APPLIED), Some(u) if u.action == UpdateAction::Put))?;
        self.inner.update_item(table, key, updates, expected)
    }

    fn delete_item(&self, table: &str, key: &Key, expected: &Expected) -> StorageResult<Option<Item>> {
        self.inner.delete_item(table, key, expected)
    }

    fn query(&self, table: &str, hash_value: &AttributeValue) -> StorageResult<Vec<Item>> {
        self.inner.query(table, hash_value)
    }

    fn scan(&self, table: &str) -> StorageResult<Vec<Item>> {
        self.inner.scan(table)
    }

    fn batch_get(
        &self,
        requests: &BTreeMap<String, Vec<Key>>,
    ) -> StorageResult<BTreeMap<String, Vec<Item>>> {
        self.inner.batch_get(requests)
    }
}
