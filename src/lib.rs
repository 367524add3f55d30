//! kvtx - Multi-item transactions over a conditional-write key-value store
//!
//! This crate adds all-or-nothing transactions across many items to a store
//! that only offers atomic, conditional writes of a single item. Items are
//! locked in place, writes are applied under the lock with a saved pre-write
//! image, and a per-transaction log record decides the outcome. Any process
//! holding a transaction id can finish or undo that transaction, so a crash
//! never leaves data stuck.
//!
//! # Example
//!
//! ```no_run
//! use kvtx::storage::{AttributeValue, FileStore, Item, ItemStore, KeySchema};
//! use kvtx::transaction::TransactionManager;
//!
//! let store = FileStore::open("./data").unwrap();
//! store.create_table("accounts", KeySchema::hash("Id")).unwrap();
//! let manager = TransactionManager::new(store);
//! manager.ensure_tables().unwrap();
//!
//! manager.with_transaction(|tx| {
//!     let mut from = Item::new();
//!     from.insert("Id".into(), AttributeValue::s("alice"));
//!     from.insert("balance".into(), AttributeValue::n(90));
//!     tx.put_item("accounts", from)?;
//!
//!     let mut to = Item::new();
//!     to.insert("Id".into(), AttributeValue::s("bob"));
//!     to.insert("balance".into(), AttributeValue::n(110));
//!     tx.put_item("accounts", to)?;
//!     Ok(())
//! }).unwrap();
//! ```

pub mod storage;
pub mod transaction;
