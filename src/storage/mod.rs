//! storage layer for kvtx
//!
//! this module defines the key-value store contract the transaction protocol
//! runs on, plus two reference implementations of it. The upper layer
//! (transactions, isolation) only talks to [`ItemStore`] and never assumes
//! anything beyond single-item conditional writes.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ItemStore                             │
//! │   (get / conditional put, update, delete / query / scan)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┴──────────────┐
//!               ▼                             ▼
//!        ┌─────────────┐               ┌─────────────┐
//!        │ MemoryStore │               │  FileStore  │
//!        │  (shared)   │               │  (durable)  │
//!        └─────────────┘               └─────────────┘
//!               │                             │
//!               └──────────────┬──────────────┘
//!                              ▼
//!                       ┌─────────────┐
//!                       │    Table    │
//!                       │ (conditions)│
//!                       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use kvtx::storage::{AttributeValue, Expected, Item, ItemStore, KeySchema, MemoryStore};
//!
//! let store = MemoryStore::new();
//! store.create_table("users", KeySchema::hash("Id")).unwrap();
//!
//! let mut item = Item::new();
//! item.insert("Id".to_string(), AttributeValue::s("alice"));
//!
//! // put only if nothing is stored under that key yet
//! store.put_item("users", item.clone(), &Expected::none().absent("Id")).unwrap();
//! let again = store.put_item("users", item, &Expected::none().absent("Id"));
//! assert!(again.unwrap_err().is_condition_failed());
//! ```

mod condition;
mod error;
mod file;
mod memory;
mod store;
mod table;
mod types;

// Re-export public API
pub use condition::{apply_updates, AttributeUpdate, Expected, ExpectedValue, UpdateAction, Updates};
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::{ItemStore, DEFAULT_MAX_ITEM_SIZE};
pub use table::validate_table_name;
pub use types::{display_item, encode_key, item_size, AttributeValue, Item, Key, KeySchema};
