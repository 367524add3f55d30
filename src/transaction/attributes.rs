//! Reserved attribute names and helpers for reading lock state off items.
//!
//! These names are part of the storage contract: a caller item that uses any
//! of them as an ordinary attribute is rejected.

use crate::storage::{AttributeValue, Item};

/// Owning transaction id on a locked item; hash key of the log table.
pub const TX_ID: &str = "_TxId";
/// Lock acquisition time on a locked item; last update time on a log record.
pub const DATE: &str = "_TxD";
/// Marks an item that did not exist before the locking transaction.
pub const TRANSIENT: &str = "_Transient";
/// Marks an item whose transactional write has been materialized.
pub const APPLIED: &str = "_Applied";
/// Hash key of the image table (`{tx_id}#{rid}`).
pub const IMAGE_ID: &str = "_TxI";

/// Log record: transaction state.
pub const STATE: &str = "_TxS";
/// Log record: optimistic version.
pub const VERSION: &str = "_TxV";
/// Log record: serialized requests, in insertion order.
pub const REQUESTS: &str = "_TxR";
/// Log record: every touched item has been released.
pub const FINALIZED: &str = "_TxF";

/// Attributes the protocol writes onto caller items.
pub const ITEM_LOCK_ATTRIBUTES: [&str; 4] = [TX_ID, DATE, TRANSIENT, APPLIED];

/// Every reserved name, on items and records alike.
pub const RESERVED: [&str; 9] = [
    TX_ID, DATE, TRANSIENT, APPLIED, IMAGE_ID, STATE, VERSION, REQUESTS, FINALIZED,
];

/// Marker value stored in `_Transient` and `_Applied`.
pub(crate) fn marker() -> AttributeValue {
    AttributeValue::s("1")
}

pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name)
}

/// The transaction holding the lock on an item, if any.
pub fn owner(item: &Item) -> Option<&str> {
    item.get(TX_ID).and_then(AttributeValue::as_s)
}

pub fn is_transient(item: &Item) -> bool {
    item.contains_key(TRANSIENT)
}

pub fn is_applied(item: &Item) -> bool {
    item.contains_key(APPLIED)
}

/// Remove every lock attribute, leaving the caller's view of the item.
pub fn strip_lock_attributes(mut item: Item) -> Item {
    for name in ITEM_LOCK_ATTRIBUTES {
        item.remove(name);
    }
    item
}

/// Keep only the named attributes (all of them when `projection` is `None`).
pub fn project(item: Item, projection: Option<&[String]>) -> Item {
    match projection {
        None => item,
        Some(names) => item
            .into_iter()
            .filter(|(name, _)| names.iter().any(|n| n == name))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_state_helpers() {
        let mut item = Item::new();
        item.insert("Id".into(), AttributeValue::s("a"));
        assert_eq!(owner(&item), None);

        item.insert(TX_ID.into(), AttributeValue::s("tx1"));
        item.insert(DATE.into(), AttributeValue::n(1));
        item.insert(TRANSIENT.into(), marker());
        assert_eq!(owner(&item), Some("tx1"));
        assert!(is_transient(&item));
        assert!(!is_applied(&item));

        let stripped = strip_lock_attributes(item);
        assert_eq!(stripped.len(), 1);
        assert!(stripped.contains_key("Id"));
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved("_TxId"));
        assert!(is_reserved("_Applied"));
        assert!(!is_reserved("Id"));
        assert!(!is_reserved("_txid"));
    }

    #[test]
    fn test_project() {
        let mut item = Item::new();
        item.insert("a".into(), AttributeValue::n(1));
        item.insert("b".into(), AttributeValue::n(2));
        let names = vec!["b".to_string()];
        assert_eq!(project(item.clone(), Some(&names)).len(), 1);
        assert_eq!(project(item, None).len(), 2);
    }
}
