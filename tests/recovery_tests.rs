//! Recovery Tests
//!
//! Transactions abandoned or interrupted mid-protocol, then finished by a
//! different holder of the same id, by a contender, or by the sweeper.

mod common;

use std::time::Duration;

use common::{key, setup, setup_with, user, FaultyStore, USERS};
use kvtx::storage::{
    AttributeUpdate, AttributeValue, Expected, FileStore, Item, ItemStore, Key, KeySchema,
    StorageError, Updates,
};
use kvtx::transaction::attributes::{self, STATE, TX_ID, VERSION};
use kvtx::transaction::{
    IsolationLevel, SweepAction, TransactionConfig, TransactionError, TransactionManager,
    TransactionState,
};
use tempfile::TempDir;

#[test]
fn test_resumed_transaction_completes_interrupted_apply() {
    let (store, manager) = setup();

    let mut t1 = manager.new_transaction();
    let tx_id = t1.id().to_string();
    store.fail_next_apply();
    let err = t1.put_item(USERS, user("a", 1)).unwrap_err();
    assert!(matches!(err, TransactionError::Storage(StorageError::Internal(_))));
    drop(t1);

    let stranded = store.raw(USERS, &key("a")).unwrap();
    assert_eq!(attributes::owner(&stranded), Some(tx_id.as_str()));
    assert!(!attributes::is_applied(&stranded));

    let mut t2 = manager.resume_transaction(&tx_id).unwrap();
    assert_eq!(t2.record().requests().count(), 1);
    t2.commit().unwrap();

    assert_eq!(store.raw(USERS, &key("a")), Some(user("a", 1)));
}

#[test]
fn test_interrupted_update_is_applied_exactly_once() {
    let (store, manager) = setup();
    store.put_item(USERS, user("a", 1), &Default::default()).unwrap();

    let mut updates = Updates::new();
    updates.insert("v".into(), AttributeUpdate::add(AttributeValue::n(10)));

    let mut t1 = manager.new_transaction();
    store.fail_next_apply();
    assert!(t1.update_item(USERS, key("a"), updates).is_err());

    let mut t2 = manager.resume_transaction(t1.id()).unwrap();
    t2.commit().unwrap();
    t1.commit().unwrap();
    let mut t3 = manager.resume_transaction(t1.id()).unwrap();
    t3.commit().unwrap();

    assert_eq!(store.raw(USERS, &key("a")), Some(user("a", 11)));
}

/// Just before `tx_id` flips its state, have another holder log a put of
/// `late` whose apply fails, leaving it locked but unapplied.
fn add_request_during_commit(store: &FaultyStore, manager: &TransactionManager, tx_id: &str, late: Item) {
    let (hook_store, manager, tx_id) = (store.clone(), manager.clone(), tx_id.to_string());
    store.before_next_update("Transactions", move || {
        let mut other = manager.resume_transaction(&tx_id).unwrap();
        hook_store.fail_next_apply();
        assert!(other.put_item(USERS, late).is_err());
    });
}

#[test]
fn test_commit_drives_request_added_during_commit() {
    let (store, manager) = setup();
    let mut tx = manager.new_transaction();
    tx.put_item(USERS, user("a", 1)).unwrap();

    add_request_during_commit(&store, &manager, tx.id(), user("b", 2));
    tx.commit().unwrap();

    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(tx.record().requests().count(), 2);
    assert_eq!(store.raw(USERS, &key("a")), Some(user("a", 1)));
    assert_eq!(store.raw(USERS, &key("b")), Some(user("b", 2)));
}

#[test]
fn test_commit_gives_up_when_record_keeps_changing() {
    let (store, manager) = setup_with(TransactionConfig::default().version_attempts(1));
    let mut tx = manager.new_transaction();
    tx.put_item(USERS, user("a", 1)).unwrap();

    add_request_during_commit(&store, &manager, tx.id(), user("b", 2));
    assert!(matches!(
        tx.commit(),
        Err(TransactionError::UnknownCompletedTransaction { .. })
    ));
    assert_eq!(tx.state(), TransactionState::Pending);
    let stranded = store.raw(USERS, &key("b")).unwrap();
    assert!(!attributes::is_applied(&stranded));

    let mut resumed = manager.resume_transaction(tx.id()).unwrap();
    resumed.commit().unwrap();
    assert_eq!(store.raw(USERS, &key("b")), Some(user("b", 2)));
}

#[test]
fn test_commit_and_rollback_are_idempotent_across_holders() {
    let (store, manager) = setup();

    let mut committer = manager.new_transaction();
    committer.put_item(USERS, user("a", 1)).unwrap();
    let mut other = manager.resume_transaction(committer.id()).unwrap();
    committer.commit().unwrap();
    other.commit().unwrap();
    committer.commit().unwrap();
    assert!(matches!(other.rollback(), Err(TransactionError::TransactionCommitted { .. })));
    assert_eq!(store.raw(USERS, &key("a")), Some(user("a", 1)));

    let mut roller = manager.new_transaction();
    roller.put_item(USERS, user("b", 1)).unwrap();
    let mut other = manager.resume_transaction(roller.id()).unwrap();
    roller.rollback().unwrap();
    other.rollback().unwrap();
    roller.rollback().unwrap();
    assert!(matches!(other.commit(), Err(TransactionError::TransactionRolledBack { .. })));
    assert_eq!(store.raw(USERS, &key("b")), None);
}

#[test]
fn test_rollback_restores_every_touched_item() {
    let (store, manager) = setup();
    let mut rich = user("a", 1);
    rich.insert("tags".into(), AttributeValue::L(vec![AttributeValue::s("x")]));
    rich.insert("blob".into(), AttributeValue::B(vec![0, 1, 2]));
    store.put_item(USERS, rich.clone(), &Default::default()).unwrap();
    store.put_item(USERS, user("b", 2), &Default::default()).unwrap();
    store.put_item(USERS, user("c", 3), &Default::default()).unwrap();
    store.put_item(USERS, user("d", 4), &Default::default()).unwrap();

    let mut tx = manager.new_transaction();
    tx.put_item(USERS, user("a", 100)).unwrap();
    let mut updates = Updates::new();
    updates.insert("v".into(), AttributeUpdate::delete());
    updates.insert("extra".into(), AttributeUpdate::put(AttributeValue::Bool(true)));
    tx.update_item(USERS, key("b"), updates).unwrap();
    tx.delete_item(USERS, key("c")).unwrap();
    tx.get_item(USERS, key("d")).unwrap();
    tx.put_item(USERS, user("new", 5)).unwrap();
    tx.get_item(USERS, key("missing")).unwrap();
    tx.rollback().unwrap();

    assert_eq!(store.raw(USERS, &key("a")), Some(rich));
    assert_eq!(store.raw(USERS, &key("b")), Some(user("b", 2)));
    assert_eq!(store.raw(USERS, &key("c")), Some(user("c", 3)));
    assert_eq!(store.raw(USERS, &key("d")), Some(user("d", 4)));
    assert_eq!(store.raw(USERS, &key("new")), None);
    assert_eq!(store.raw(USERS, &key("missing")), None);
    assert_eq!(store.count(USERS), 4);
    assert_eq!(store.count("TransactionImages"), 0);
}

#[test]
fn test_sweep_rolls_back_stale_and_deletes_finished() {
    let (store, manager) = setup();
    store.put_item(USERS, user("a", 1), &Default::default()).unwrap();

    let mut stale = manager.new_transaction();
    stale.put_item(USERS, user("a", 2)).unwrap();
    assert_eq!(store.count("TransactionImages"), 1);

    let mut sweeper = manager.resume_transaction(stale.id()).unwrap();
    assert_eq!(
        sweeper.sweep(Duration::from_secs(3600), Duration::from_secs(3600)).unwrap(),
        SweepAction::None
    );
    assert_eq!(
        sweeper.sweep(Duration::ZERO, Duration::from_secs(3600)).unwrap(),
        SweepAction::RolledBack
    );
    assert_eq!(store.raw(USERS, &key("a")), Some(user("a", 1)));
    assert!(matches!(stale.commit(), Err(TransactionError::TransactionRolledBack { .. })));

    let mut finished = manager.new_transaction();
    finished.put_item(USERS, user("b", 1)).unwrap();
    finished.commit().unwrap();

    let mut sweeper = manager.resume_transaction(finished.id()).unwrap();
    assert_eq!(
        sweeper.sweep(Duration::ZERO, Duration::ZERO).unwrap(),
        SweepAction::Deleted
    );
    assert!(matches!(
        manager.resume_transaction(finished.id()),
        Err(TransactionError::TransactionNotFound { .. })
    ));
    assert_eq!(store.count("TransactionImages"), 0);
    assert_eq!(store.raw(USERS, &key("b")), Some(user("b", 1)));
}

#[test]
fn test_sweep_finishes_interrupted_commit_cleanup() {
    let (store, manager) = setup();
    let mut tx = manager.new_transaction();
    tx.put_item(USERS, user("a", 1)).unwrap();

    // a holder that flips the state but dies before releasing anything
    let mut record_key = Key::new();
    record_key.insert(TX_ID.into(), AttributeValue::s(tx.id()));
    let mut updates = Updates::new();
    updates.insert(STATE.into(), AttributeUpdate::put(AttributeValue::s("COMMITTED")));
    updates.insert(VERSION.into(), AttributeUpdate::add(AttributeValue::n(1)));
    store
        .update_item("Transactions", &record_key, &updates, &Expected::none())
        .unwrap();
    assert_eq!(attributes::owner(&store.raw(USERS, &key("a")).unwrap()), Some(tx.id()));

    let mut sweeper = manager.resume_transaction(tx.id()).unwrap();
    assert_eq!(sweeper.state(), TransactionState::Committed);
    assert_eq!(
        sweeper.sweep(Duration::ZERO, Duration::from_secs(3600)).unwrap(),
        SweepAction::Completed(TransactionState::Committed)
    );
    assert_eq!(store.raw(USERS, &key("a")), Some(user("a", 1)));
}

#[test]
fn test_file_store_transaction_resumes_after_reopen() {
    let dir = TempDir::new().unwrap();

    let tx_id = {
        let store = FileStore::open(dir.path()).unwrap();
        store.create_table(USERS, KeySchema::hash("Id")).unwrap();
        let manager = TransactionManager::new(store);
        manager.ensure_tables().unwrap();

        let mut tx = manager.new_transaction();
        tx.put_item(USERS, user("a", 1)).unwrap();
        tx.put_item(USERS, user("b", 2)).unwrap();
        tx.id().to_string()
    };

    let manager = TransactionManager::new(FileStore::open(dir.path()).unwrap());
    manager.ensure_tables().unwrap();
    assert_eq!(manager.get_item(USERS, &key("a"), IsolationLevel::Committed).unwrap(), None);

    let mut tx = manager.resume_transaction(&tx_id).unwrap();
    assert_eq!(tx.state(), TransactionState::Pending);
    tx.commit().unwrap();

    let reopened = FileStore::open(dir.path()).unwrap();
    let items: Vec<Item> = reopened.scan(USERS).unwrap();
    assert_eq!(items, vec![user("a", 1), user("b", 2)]);
}
