//! Multi-item transactions over a conditional-write store.
//!
//! A transaction locks each item it touches by writing its id into the item's
//! `_TxId` attribute, applies its writes in place, and keeps a pre-write image
//! of every item it changes. A single log record per transaction holds its
//! state and the list of requests it made. Commit and rollback flip that
//! state with one conditional write and then release the items; both can be
//! re-driven by anyone who knows the transaction id.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionManager                        │
//! │  (Creates/resumes transactions, isolated reads, sweeping)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ Transaction │──────►│ Transaction │       │  Isolation  │
//!  │  (engine)   │       │    Item     │       │  Handlers   │
//!  └─────────────┘       │ (log record)│       └─────────────┘
//!        │               └─────────────┘
//!        ▼
//!  ┌─────────────────────────────────────────────────────────────┐
//!  │      ItemStore: items, log table, image table               │
//!  └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use kvtx::storage::{AttributeValue, Item, Key, KeySchema, ItemStore, MemoryStore};
//! use kvtx::transaction::{IsolationLevel, TransactionManager};
//!
//! let store = MemoryStore::new();
//! store.create_table("users", KeySchema::hash("Id")).unwrap();
//! let manager = TransactionManager::new(store);
//! manager.ensure_tables().unwrap();
//!
//! let mut item = Item::new();
//! item.insert("Id".into(), AttributeValue::s("a"));
//!
//! let mut tx = manager.new_transaction();
//! tx.put_item("users", item.clone()).unwrap();
//!
//! let mut key = Key::new();
//! key.insert("Id".into(), AttributeValue::s("a"));
//! assert_eq!(manager.get_item("users", &key, IsolationLevel::Committed).unwrap(), None);
//!
//! tx.commit().unwrap();
//! assert_eq!(manager.get_item("users", &key, IsolationLevel::Committed).unwrap(), Some(item));
//! ```

pub mod attributes;
mod config;
mod context;
mod error;
mod isolation;
mod item;
mod locking;
mod manager;
mod request;

pub use config::TransactionConfig;
pub use context::{SweepAction, Transaction};
pub use error::{TransactionError, TransactionResult};
pub use isolation::{IsolationHandler, IsolationLevel, ReadCommitted, ReadUncommitted};
pub use item::{TransactionItem, TransactionState};
pub use manager::{SweepReport, TransactionManager};
pub use request::{Conditions, Operation, Request};
