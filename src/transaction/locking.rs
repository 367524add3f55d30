//! Item-level steps of the protocol: lock, apply, release.
//!
//! Each step is one conditional write on the target item, guarded by the
//! lock owner recorded in `_TxId`. A lost condition is never an error by
//! itself; the item is re-read and the step decides again from what it finds.

use crate::storage::{display_item, AttributeUpdate, AttributeValue, Expected, Item, Key, StorageError, Updates};
use crate::transaction::attributes::{self, APPLIED, DATE, ITEM_LOCK_ATTRIBUTES, TRANSIENT, TX_ID};
use crate::transaction::context::Transaction;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::item::{completed_error, now_millis, TransactionState};
use crate::transaction::request::{Operation, Request};

/// Updates that remove every lock attribute from an item.
fn strip_updates() -> Updates {
    ITEM_LOCK_ATTRIBUTES
        .iter()
        .map(|name| (name.to_string(), AttributeUpdate::delete()))
        .collect()
}

impl Transaction {
    fn owned_by_me(&self) -> Expected {
        Expected::none().equals(TX_ID, AttributeValue::s(self.id()))
    }

    /// Lock the target item of a request, returning it as stored under the lock.
    ///
    /// A missing item is locked by writing a transient placeholder holding
    /// only its key. An item locked by another transaction is resolved
    /// through that transaction's own rollback before trying again.
    pub(crate) fn lock_item(&mut self, request: &Request) -> TransactionResult<Item> {
        let table = request.table.as_str();
        let key = request.key()?.clone();
        let schema = self.manager.key_schema(table)?;
        let mut last_owner = None;

        for attempt in 1..=self.manager.config().lock_attempts.max(1) {
            let current = self.manager.store().get_item(table, &key, true)?;
            let written = match current {
                Some(item) => match attributes::owner(&item).map(str::to_string) {
                    Some(owner) if owner == self.id() => return Ok(item),
                    Some(owner) => {
                        self.resolve_contention(table, &key, &item, &owner)?;
                        last_owner = Some(owner);
                        continue;
                    }
                    None => {
                        let mut updates = Updates::new();
                        updates.insert(TX_ID.to_string(), AttributeUpdate::put(AttributeValue::s(self.id())));
                        updates.insert(DATE.to_string(), AttributeUpdate::put(AttributeValue::n(now_millis())));
                        let expected = Expected::none().absent(TX_ID).exists(schema.hash.as_str());
                        self.manager.store().update_item(table, &key, &updates, &expected)
                    }
                },
                None => {
                    let mut placeholder = key.clone();
                    placeholder.insert(TX_ID.to_string(), AttributeValue::s(self.id()));
                    placeholder.insert(DATE.to_string(), AttributeValue::n(now_millis()));
                    placeholder.insert(TRANSIENT.to_string(), attributes::marker());
                    let expected = schema
                        .attribute_names()
                        .fold(Expected::none(), |expected, name| expected.absent(name));
                    self.manager
                        .store()
                        .put_item(table, placeholder.clone(), &expected)
                        .map(|_| placeholder)
                }
            };

            match written {
                Ok(item) => {
                    tracing::debug!(tx_id = %self.id(), table, key = %display_item(&key), "locked item");
                    return Ok(item);
                }
                Err(StorageError::ConditionFailed { .. }) => {
                    tracing::debug!(tx_id = %self.id(), table, attempt, "lost lock race, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(TransactionError::ItemNotLocked {
            tx_id: self.id().to_string(),
            owner: last_owner,
            table: table.to_string(),
            key: display_item(&key),
        })
    }

    /// Get another transaction's lock out of the way, or fail with `ItemNotLocked`.
    fn resolve_contention(&mut self, table: &str, key: &Key, item: &Item, owner: &str) -> TransactionResult<()> {
        let mut other = match Transaction::resume(self.manager.clone(), owner) {
            Ok(other) => other,
            Err(TransactionError::TransactionNotFound { .. }) => {
                tracing::warn!(tx_id = %self.id(), owner, table, "releasing lock of a deleted transaction");
                return self.release_orphan(table, key, item, owner);
            }
            Err(e) => return Err(e),
        };

        let grace = self.manager.config().pending_owner_grace;
        if other.state() == TransactionState::Pending && other.item.idle_for() < grace {
            return Err(TransactionError::ItemNotLocked {
                tx_id: self.id().to_string(),
                owner: Some(owner.to_string()),
                table: table.to_string(),
                key: display_item(key),
            });
        }

        tracing::warn!(tx_id = %self.id(), owner, state = %other.state(), table, "resolving contended lock");
        match other.rollback() {
            Ok(()) => Ok(()),
            Err(e) if e.is_completed() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Release a lock whose owner has no log record left.
    fn release_orphan(&self, table: &str, key: &Key, item: &Item, owner: &str) -> TransactionResult<()> {
        let expected = Expected::none().equals(TX_ID, AttributeValue::s(owner));
        let result = if attributes::is_transient(item) && !attributes::is_applied(item) {
            self.manager.store().delete_item(table, key, &expected).map(|_| ())
        } else {
            self.manager
                .store()
                .update_item(table, key, &strip_updates(), &expected)
                .map(|_| ())
        };
        match result {
            Ok(()) | Err(StorageError::ConditionFailed { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Materialize a put or update on a locked item. Exactly once: the
    /// write requires `_Applied` to be absent.
    pub(crate) fn apply(&mut self, request: &Request, locked: Item) -> TransactionResult<Item> {
        if attributes::is_applied(&locked) {
            return Ok(locked);
        }
        let table = request.table.as_str();
        let key = request.key()?;
        let expected = self.owned_by_me().absent(APPLIED);

        let result = match &request.operation {
            Operation::Put { item } => {
                let mut applied = item.clone();
                for name in [TX_ID, DATE, TRANSIENT] {
                    if let Some(value) = locked.get(name) {
                        applied.insert(name.to_string(), value.clone());
                    }
                }
                applied.insert(APPLIED.to_string(), attributes::marker());
                self.manager
                    .store()
                    .put_item(table, applied.clone(), &expected)
                    .map(|_| applied)
            }
            Operation::Update { updates } => {
                let mut updates = updates.clone();
                updates.insert(APPLIED.to_string(), AttributeUpdate::put(attributes::marker()));
                self.manager.store().update_item(table, key, &updates, &expected)
            }
            Operation::Get { .. } | Operation::Delete => return Ok(locked),
        };

        match result {
            Ok(item) => {
                tracing::debug!(tx_id = %self.id(), request = %request, "applied request");
                Ok(item)
            }
            Err(StorageError::ConditionFailed { .. }) => {
                let current = self.manager.store().get_item(table, key, true)?;
                let owner = current.as_ref().and_then(attributes::owner).map(str::to_string);
                match current {
                    Some(item) if owner.as_deref() == Some(self.id()) && attributes::is_applied(&item) => Ok(item),
                    _ => {
                        self.item.reload()?;
                        if self.state().is_terminal() {
                            return Err(completed_error(self.id(), self.state()));
                        }
                        Err(TransactionError::ItemNotLocked {
                            tx_id: self.id().to_string(),
                            owner,
                            table: table.to_string(),
                            key: display_item(key),
                        })
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release one item of a committed transaction.
    ///
    /// Deletes are carried out here; every other request just loses its lock.
    /// Items no longer locked by this transaction are left alone.
    pub(crate) fn unlock_committed(&self, request: &Request) -> TransactionResult<()> {
        self.release_item(request, |tx, item| {
            let transient_unwritten = attributes::is_transient(item) && !attributes::is_applied(item);
            match request.operation {
                Operation::Delete => Ok(Release::Delete),
                Operation::Get { .. } if transient_unwritten => Ok(Release::Delete),
                Operation::Get { .. } => Ok(Release::Strip),
                _ if attributes::is_applied(item) => Ok(Release::Strip),
                _ => Err(TransactionError::assertion(
                    tx.id(),
                    format!("committed request {} was never applied", request),
                )),
            }
        })
    }

    /// Undo one item of a rolled-back transaction.
    ///
    /// Transient items are removed. Items with a saved image get it back.
    /// Untouched items just lose their lock.
    pub(crate) fn restore_rolled_back(&self, request: &Request) -> TransactionResult<()> {
        let rid = self.rid_of(request)?;
        self.release_item(request, |tx, item| {
            if attributes::is_transient(item) {
                return Ok(Release::Delete);
            }
            if request.mutates_on_apply() {
                if let Some(image) = tx.item.load_item_image(rid)? {
                    return Ok(Release::Restore(image));
                }
            }
            if attributes::is_applied(item) {
                return Err(TransactionError::assertion(
                    tx.id(),
                    format!("no image to roll back applied request {}", request),
                ));
            }
            Ok(Release::Strip)
        })
    }

    /// Re-read the item and release it the way `decide` says, retrying lost
    /// conditions until the item is released or no longer ours.
    fn release_item<F>(&self, request: &Request, decide: F) -> TransactionResult<()>
    where
        F: Fn(&Transaction, &Item) -> TransactionResult<Release>,
    {
        let table = request.table.as_str();
        let key = request.key()?;
        let store = self.manager.store();
        let attempts = self.manager.config().lock_attempts.max(1);

        for _ in 0..attempts {
            let Some(item) = store.get_item(table, key, true)? else {
                return Ok(());
            };
            if attributes::owner(&item) != Some(self.id()) {
                return Ok(());
            }

            let expected = self.owned_by_me();
            let result = match decide(self, &item)? {
                Release::Strip => store.update_item(table, key, &strip_updates(), &expected).map(|_| ()),
                Release::Delete => store.delete_item(table, key, &expected).map(|_| ()),
                Release::Restore(image) => store.put_item(table, image, &expected).map(|_| ()),
            };
            match result {
                Ok(()) => {
                    tracing::debug!(tx_id = %self.id(), request = %request, "released item");
                    return Ok(());
                }
                Err(StorageError::ConditionFailed { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(TransactionError::Storage(StorageError::ConditionFailed {
            table: table.to_string(),
        }))
    }
}

/// How a completed transaction lets go of one item.
enum Release {
    /// Remove the lock attributes.
    Strip,
    /// Remove the item.
    Delete,
    /// Put the pre-write image back.
    Restore(Item),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::storage::{ItemStore, KeySchema, MemoryStore};
    use crate::transaction::{TransactionConfig, TransactionManager};

    use super::*;

    fn setup(config: TransactionConfig) -> (MemoryStore, TransactionManager) {
        let store = MemoryStore::new();
        store.create_table("users", KeySchema::hash("Id")).unwrap();
        let manager = TransactionManager::with_config(store.clone(), config);
        manager.ensure_tables().unwrap();
        (store, manager)
    }

    fn key(id: &str) -> Key {
        let mut key = Key::new();
        key.insert("Id".into(), AttributeValue::s(id));
        key
    }

    fn user(id: &str, v: i64) -> Item {
        let mut item = key(id);
        item.insert("v".into(), AttributeValue::n(v));
        item
    }

    #[test]
    fn test_lock_missing_item_writes_placeholder() {
        let (store, manager) = setup(TransactionConfig::default());
        let mut tx = manager.new_transaction();
        tx.get_item("users", key("a")).unwrap();

        let placeholder = store.get_item("users", &key("a"), true).unwrap().unwrap();
        assert_eq!(attributes::owner(&placeholder), Some(tx.id()));
        assert!(attributes::is_transient(&placeholder));
        assert!(!attributes::is_applied(&placeholder));
        assert_eq!(attributes::strip_lock_attributes(placeholder), key("a"));

        tx.commit().unwrap();
        assert_eq!(store.get_item("users", &key("a"), true).unwrap(), None);
    }

    #[test]
    fn test_contender_rolls_back_pending_owner() {
        let (store, manager) = setup(TransactionConfig::default());
        store.put_item("users", user("a", 1), &Expected::none()).unwrap();

        let mut t1 = manager.new_transaction();
        t1.put_item("users", user("a", 2)).unwrap();

        let mut t2 = manager.new_transaction();
        assert_eq!(t2.get_item("users", key("a")).unwrap(), Some(user("a", 1)));
        t2.commit().unwrap();

        assert!(matches!(t1.commit(), Err(TransactionError::TransactionRolledBack { .. })));
        assert_eq!(store.get_item("users", &key("a"), true).unwrap(), Some(user("a", 1)));
    }

    #[test]
    fn test_grace_period_protects_fresh_owner() {
        let config = TransactionConfig::default().pending_owner_grace(Duration::from_secs(3600));
        let (store, manager) = setup(config);

        let mut t1 = manager.new_transaction();
        t1.put_item("users", user("a", 1)).unwrap();

        let mut t2 = manager.new_transaction();
        match t2.put_item("users", user("a", 2)) {
            Err(TransactionError::ItemNotLocked { owner, .. }) => assert_eq!(owner.as_deref(), Some(t1.id())),
            other => panic!("expected ItemNotLocked, got {:?}", other),
        }

        let locked = store.get_item("users", &key("a"), true).unwrap().unwrap();
        assert_eq!(attributes::owner(&locked), Some(t1.id()));
        t1.commit().unwrap();
        assert_eq!(store.get_item("users", &key("a"), true).unwrap(), Some(user("a", 1)));
    }

    #[test]
    fn test_orphaned_lock_is_released() {
        let (store, manager) = setup(TransactionConfig::default());
        let mut orphan = user("a", 1);
        orphan.insert(TX_ID.into(), AttributeValue::s("gone"));
        orphan.insert(DATE.into(), AttributeValue::n(0));
        store.put_item("users", orphan, &Expected::none()).unwrap();

        let mut tx = manager.new_transaction();
        assert_eq!(tx.get_item("users", key("a")).unwrap(), Some(user("a", 1)));
        tx.commit().unwrap();
        assert_eq!(store.get_item("users", &key("a"), true).unwrap(), Some(user("a", 1)));
    }

    #[test]
    fn test_apply_is_exactly_once() {
        let (store, manager) = setup(TransactionConfig::default());
        let mut updates = Updates::new();
        updates.insert("v".into(), AttributeUpdate::add(AttributeValue::n(5)));

        let mut tx = manager.new_transaction();
        tx.update_item("users", key("a"), updates.clone()).unwrap();
        tx.update_item("users", key("a"), updates).unwrap();

        let mut resumed = manager.resume_transaction(tx.id()).unwrap();
        resumed.commit().unwrap();
        tx.commit().unwrap();

        assert_eq!(store.get_item("users", &key("a"), true).unwrap(), Some(user("a", 5)));
    }
}
