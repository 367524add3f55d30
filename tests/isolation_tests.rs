//! Isolation Tests
//!
//! What readers outside a transaction see while a transaction is in flight,
//! after it commits and after it rolls back.

mod common;

use common::{key, setup, user, USERS};
use kvtx::storage::{AttributeUpdate, AttributeValue, ItemStore, Updates};
use kvtx::transaction::attributes::{self, RESERVED};
use kvtx::transaction::IsolationLevel;

#[test]
fn test_uncommitted_put_visible_only_to_dirty_reads() {
    let (store, manager) = setup();
    let mut item = key("a");
    item.insert("name".into(), AttributeValue::s("Alice"));

    let mut tx = manager.new_transaction();
    tx.put_item(USERS, item.clone()).unwrap();

    assert_eq!(
        manager.get_item(USERS, &key("a"), IsolationLevel::Uncommitted).unwrap(),
        Some(item.clone())
    );
    assert_eq!(manager.get_item(USERS, &key("a"), IsolationLevel::Committed).unwrap(), None);

    tx.commit().unwrap();

    for isolation in [IsolationLevel::Uncommitted, IsolationLevel::Committed] {
        assert_eq!(manager.get_item(USERS, &key("a"), isolation).unwrap(), Some(item.clone()));
    }
    let stored = store.raw(USERS, &key("a")).unwrap();
    assert!(stored.keys().all(|name| !RESERVED.contains(&name.as_str())));
}

#[test]
fn test_committed_read_returns_image_of_pending_update() {
    let (store, manager) = setup();
    store.put_item(USERS, user("a", 1), &Default::default()).unwrap();

    let mut updates = Updates::new();
    updates.insert("v".into(), AttributeUpdate::add(AttributeValue::n(10)));
    let mut tx = manager.new_transaction();
    assert_eq!(tx.update_item(USERS, key("a"), updates).unwrap(), user("a", 11));

    assert_eq!(
        manager.get_item(USERS, &key("a"), IsolationLevel::Committed).unwrap(),
        Some(user("a", 1))
    );
    assert_eq!(
        manager.get_item(USERS, &key("a"), IsolationLevel::Uncommitted).unwrap(),
        Some(user("a", 11))
    );

    tx.commit().unwrap();
    assert_eq!(
        manager.get_item(USERS, &key("a"), IsolationLevel::Committed).unwrap(),
        Some(user("a", 11))
    );
}

#[test]
fn test_read_lock_placeholder_is_invisible() {
    let (store, manager) = setup();
    let mut tx = manager.new_transaction();
    assert_eq!(tx.get_item(USERS, key("ghost")).unwrap(), None);
    assert!(store.raw(USERS, &key("ghost")).is_some());

    for isolation in [IsolationLevel::Uncommitted, IsolationLevel::Committed] {
        assert_eq!(manager.get_item(USERS, &key("ghost"), isolation).unwrap(), None);
        assert!(manager.scan(USERS, isolation).unwrap().is_empty());
    }

    tx.rollback().unwrap();
    assert_eq!(store.raw(USERS, &key("ghost")), None);
}

#[test]
fn test_committed_scan_mixes_images_and_committed_values() {
    let (store, manager) = setup();
    store.put_item(USERS, user("a", 1), &Default::default()).unwrap();
    store.put_item(USERS, user("b", 2), &Default::default()).unwrap();

    let mut done = manager.new_transaction();
    done.put_item(USERS, user("a", 100)).unwrap();
    done.commit().unwrap();

    let mut pending = manager.new_transaction();
    pending.put_item(USERS, user("b", 200)).unwrap();
    pending.put_item(USERS, user("c", 300)).unwrap();

    let committed = manager.scan(USERS, IsolationLevel::Committed).unwrap();
    assert_eq!(committed, vec![user("a", 100), user("b", 2)]);

    let dirty = manager.scan(USERS, IsolationLevel::Uncommitted).unwrap();
    assert_eq!(dirty, vec![user("a", 100), user("b", 200), user("c", 300)]);

    pending.rollback().unwrap();
    let after = manager.scan(USERS, IsolationLevel::Uncommitted).unwrap();
    assert_eq!(after, vec![user("a", 100), user("b", 2)]);
    for item in after {
        assert_eq!(attributes::owner(&item), None);
    }
}
