//! The durable log record of one transaction.
//!
//! A [`TransactionItem`] is the only shared state a transaction has. Every
//! mutation is a conditional write against the stored `_TxV` version, so two
//! processes driving the same transaction serialize on the record instead of
//! overwriting each other. A lost version race is resolved by reloading and
//! trying again, a bounded number of times.
//!
//! The record also owns the item images of its transaction: pre-write
//! snapshots kept in the image table under `{tx_id}#{rid}`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::storage::{AttributeUpdate, AttributeValue, Expected, Item, Key, StorageError, Updates};
use crate::transaction::attributes::{
    self, DATE, FINALIZED, IMAGE_ID, REQUESTS, STATE, TX_ID, VERSION,
};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::manager::TransactionManager;
use crate::transaction::request::Request;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Pending,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Pending => "PENDING",
            TransactionState::Committed => "COMMITTED",
            TransactionState::RolledBack => "ROLLED_BACK",
        }
    }

    /// Committed and rolled back are final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionState::Pending)
    }

    fn to_attribute(self) -> AttributeValue {
        AttributeValue::s(self.as_str())
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransactionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionState::Pending),
            "COMMITTED" => Ok(TransactionState::Committed),
            "ROLLED_BACK" => Ok(TransactionState::RolledBack),
            _ => Err(format!("unknown transaction state: {}", s)),
        }
    }
}

/// The error an operation gets when the transaction is already terminal.
pub(crate) fn completed_error(tx_id: &str, state: TransactionState) -> TransactionError {
    match state {
        TransactionState::Committed => TransactionError::TransactionCommitted {
            tx_id: tx_id.to_string(),
        },
        TransactionState::RolledBack => TransactionError::TransactionRolledBack {
            tx_id: tx_id.to_string(),
        },
        TransactionState::Pending => {
            TransactionError::assertion(tx_id, "pending transaction reported as completed")
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A transaction's log record, as last read or written by this process.
pub struct TransactionItem {
    manager: TransactionManager,
    tx_id: String,
    state: TransactionState,
    version: u64,
    last_update: i64,
    finalized: bool,
    /// Every logged request, in insertion order.
    log: Vec<Request>,
    /// Position in `log` of the live request for each (table, key).
    live: BTreeMap<(String, String), usize>,
    /// Whether the record exists in the log table yet.
    persisted: bool,
}

impl TransactionItem {
    /// A fresh record that is only written once the first request arrives.
    pub(crate) fn new(manager: TransactionManager, tx_id: String) -> Self {
        Self {
            manager,
            tx_id,
            state: TransactionState::Pending,
            version: 0,
            last_update: now_millis(),
            finalized: false,
            log: Vec::new(),
            live: BTreeMap::new(),
            persisted: false,
        }
    }

    /// Load an existing record.
    pub(crate) fn load(manager: TransactionManager, tx_id: &str) -> TransactionResult<Self> {
        let mut item = Self::new(manager, tx_id.to_string());
        match item.fetch()? {
            Some(record) => {
                item.apply_record(&record)?;
                Ok(item)
            }
            None => Err(TransactionError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.tx_id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Time of the last write to the record.
    pub fn last_update(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_update)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// How long the record has gone without a write.
    pub fn idle_for(&self) -> Duration {
        let elapsed = now_millis().saturating_sub(self.last_update).max(0);
        Duration::from_millis(elapsed as u64)
    }

    /// The live requests, in the order they joined the transaction.
    pub fn requests(&self) -> impl Iterator<Item = &Request> {
        let live: Vec<usize> = {
            let mut positions: Vec<usize> = self.live.values().copied().collect();
            positions.sort_unstable();
            positions
        };
        live.into_iter().map(move |i| &self.log[i])
    }

    /// Owned copies of the live requests, for passes that write as they go.
    pub(crate) fn live_requests(&self) -> Vec<Request> {
        self.requests().cloned().collect()
    }

    /// Every rid ever assigned, superseded read locks included.
    pub(crate) fn logged_rids(&self) -> Vec<u32> {
        self.log.iter().filter_map(|r| r.rid).collect()
    }

    /// The live request on an item, if the transaction has one.
    pub fn request_for(&self, table: &str, key: &Key) -> TransactionResult<Option<&Request>> {
        let id = (table.to_string(), crate::storage::encode_key(key)?);
        Ok(self.live.get(&id).map(|&i| &self.log[i]))
    }

    fn record_key(&self) -> Key {
        let mut key = Key::new();
        key.insert(TX_ID.to_string(), AttributeValue::s(&self.tx_id));
        key
    }

    fn log_table(&self) -> &str {
        &self.manager.config().log_table
    }

    fn fetch(&self) -> TransactionResult<Option<Item>> {
        Ok(self
            .manager
            .store()
            .get_item(self.log_table(), &self.record_key(), true)?)
    }

    /// Re-read the record after losing a version race.
    pub(crate) fn reload(&mut self) -> TransactionResult<()> {
        let was_persisted = self.persisted;
        if self.reload_if_exists()? || !was_persisted {
            return Ok(());
        }
        Err(TransactionError::UnknownCompletedTransaction {
            tx_id: self.tx_id.clone(),
            reason: "log record was deleted".into(),
        })
    }

    /// Re-read the record, reporting whether it still exists.
    pub(crate) fn reload_if_exists(&mut self) -> TransactionResult<bool> {
        match self.fetch()? {
            Some(record) => {
                self.apply_record(&record)?;
                Ok(true)
            }
            None => {
                self.persisted = false;
                Ok(false)
            }
        }
    }

    fn apply_record(&mut self, record: &Item) -> TransactionResult<()> {
        let corrupt = |what: &str| {
            TransactionError::assertion(&self.tx_id, format!("log record has bad {}", what))
        };

        let state = record
            .get(STATE)
            .and_then(AttributeValue::as_s)
            .ok_or_else(|| corrupt(STATE))?
            .parse::<TransactionState>()
            .map_err(|_| corrupt(STATE))?;
        let version = record
            .get(VERSION)
            .and_then(AttributeValue::as_i64)
            .ok_or_else(|| corrupt(VERSION))?;
        let last_update = record
            .get(DATE)
            .and_then(AttributeValue::as_i64)
            .ok_or_else(|| corrupt(DATE))?;

        let mut log = Vec::new();
        let mut live = BTreeMap::new();
        if let Some(value) = record.get(REQUESTS) {
            let AttributeValue::L(entries) = value else {
                return Err(corrupt(REQUESTS));
            };
            for entry in entries {
                let AttributeValue::B(bytes) = entry else {
                    return Err(corrupt(REQUESTS));
                };
                let request = Request::from_bytes(bytes)?;
                live.insert(request.item_id()?, log.len());
                log.push(request);
            }
        }

        self.state = state;
        self.version = version as u64;
        self.last_update = last_update;
        self.finalized = matches!(record.get(FINALIZED), Some(AttributeValue::Bool(true)));
        self.log = log;
        self.live = live;
        self.persisted = true;
        Ok(())
    }

    fn new_record(&self, state: TransactionState, requests: Vec<AttributeValue>) -> Item {
        let mut record = self.record_key();
        record.insert(STATE.to_string(), state.to_attribute());
        record.insert(VERSION.to_string(), AttributeValue::n(1));
        record.insert(DATE.to_string(), AttributeValue::n(now_millis()));
        record.insert(REQUESTS.to_string(), AttributeValue::L(requests));
        record
    }

    /// Create the record if this process never wrote it.
    fn create(&mut self, record: Item) -> TransactionResult<bool> {
        let expected = Expected::none().absent(TX_ID);
        match self
            .manager
            .store()
            .put_item(self.log_table(), record.clone(), &expected)
        {
            Ok(_) => {
                self.apply_record(&record)?;
                tracing::debug!(tx_id = %self.tx_id, "created transaction record");
                Ok(true)
            }
            Err(StorageError::ConditionFailed { .. }) => {
                self.reload()?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Conditionally update the record against the version last read.
    ///
    /// Returns `false` after a lost race, with the record reloaded.
    fn update(&mut self, mut updates: Updates, expected: Expected) -> TransactionResult<bool> {
        updates.insert(VERSION.to_string(), AttributeUpdate::add(AttributeValue::n(1)));
        updates.insert(DATE.to_string(), AttributeUpdate::put(AttributeValue::n(now_millis())));
        let expected = expected
            .exists(TX_ID)
            .equals(VERSION, AttributeValue::n(self.version));
        let key = self.record_key();
        match self
            .manager
            .store()
            .update_item(self.log_table(), &key, &updates, &expected)
        {
            Ok(record) => {
                self.apply_record(&record)?;
                Ok(true)
            }
            Err(StorageError::ConditionFailed { .. }) => {
                tracing::debug!(tx_id = %self.tx_id, version = self.version, "lost version race on transaction record");
                self.reload()?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn version_race(&self) -> TransactionError {
        TransactionError::Storage(StorageError::ConditionFailed {
            table: self.log_table().to_string(),
        })
    }

    /// Add a request to the log and return it as logged, with its rid.
    ///
    /// Re-adding a request that is already logged succeeds and returns the
    /// logged copy, as does a read lock on an item the transaction already
    /// holds. A write replaces an earlier read lock on the same item. Any
    /// other second request on an item is a [`TransactionError::DuplicateRequest`].
    pub(crate) fn add_request(&mut self, request: Request) -> TransactionResult<Request> {
        let item_id = request.item_id()?;
        let mut last_err = None;

        for _ in 0..self.manager.config().version_attempts.max(1) {
            if self.state.is_terminal() {
                return Err(completed_error(&self.tx_id, self.state));
            }
            if let Some(&i) = self.live.get(&item_id) {
                let existing = &self.log[i];
                if request.is_read() || existing.same_as(&request) {
                    return Ok(existing.clone());
                }
                if !existing.is_read() {
                    return Err(TransactionError::DuplicateRequest {
                        tx_id: self.tx_id.clone(),
                        table: request.table.clone(),
                        key: crate::storage::display_item(request.key()?),
                    });
                }
            }

            let mut logged = request.clone();
            logged.rid = Some(self.log.len() as u32 + 1);
            let entry = AttributeValue::B(logged.to_bytes()?);

            let written = if self.persisted {
                let mut updates = Updates::new();
                updates.insert(
                    REQUESTS.to_string(),
                    AttributeUpdate::add(AttributeValue::L(vec![entry])),
                );
                self.update(
                    updates,
                    Expected::none().equals(STATE, TransactionState::Pending.to_attribute()),
                )?
            } else {
                self.create(self.new_record(TransactionState::Pending, vec![entry]))?
            };

            if written {
                tracing::debug!(tx_id = %self.tx_id, request = %logged, "logged request");
                return Ok(logged);
            }
            last_err = Some(self.version_race());
        }

        Err(last_err.unwrap_or_else(|| self.version_race()))
    }

    /// Move the record from PENDING to a terminal state.
    ///
    /// Succeeds if the record is already in `target`. Fails with the matching
    /// completed error if it reached the other terminal state, and with
    /// [`TransactionError::UnknownCompletedTransaction`] if the record vanished.
    pub(crate) fn transition(&mut self, target: TransactionState) -> TransactionResult<()> {
        for _ in 0..self.manager.config().version_attempts.max(1) {
            if self.try_transition(target)? {
                return Ok(());
            }
        }
        Err(self.version_race())
    }

    /// One attempt at [`TransactionItem::transition`] against the version
    /// last read. Returns `false` if a newer PENDING version won the race.
    pub(crate) fn try_transition(&mut self, target: TransactionState) -> TransactionResult<bool> {
        if self.state == target {
            return Ok(true);
        }
        if self.state.is_terminal() {
            return Err(completed_error(&self.tx_id, self.state));
        }

        let written = if self.persisted {
            let mut updates = Updates::new();
            updates.insert(STATE.to_string(), AttributeUpdate::put(target.to_attribute()));
            self.update(
                updates,
                Expected::none().equals(STATE, TransactionState::Pending.to_attribute()),
            )?
        } else {
            self.create(self.new_record(target, Vec::new()))?
        };
        if written {
            tracing::info!(tx_id = %self.tx_id, state = %target, "transaction state changed");
            return Ok(true);
        }

        match self.state {
            TransactionState::Pending => Ok(false),
            state if state == target => Ok(true),
            state => Err(completed_error(&self.tx_id, state)),
        }
    }

    /// Mark a terminal record as fully cleaned up.
    pub(crate) fn finalize(&mut self) -> TransactionResult<()> {
        if !self.state.is_terminal() {
            return Err(TransactionError::assertion(
                &self.tx_id,
                "cannot finalize a pending transaction",
            ));
        }
        for _ in 0..self.manager.config().version_attempts.max(1) {
            if self.finalized {
                return Ok(());
            }
            let mut updates = Updates::new();
            updates.insert(FINALIZED.to_string(), AttributeUpdate::put(AttributeValue::Bool(true)));
            if self.update(updates, Expected::none().equals(STATE, self.state.to_attribute()))? {
                return Ok(());
            }
        }
        if self.finalized {
            return Ok(());
        }
        Err(self.version_race())
    }

    /// Delete the record. Deleting an absent record succeeds.
    pub(crate) fn delete(&mut self) -> TransactionResult<()> {
        for _ in 0..self.manager.config().version_attempts.max(1) {
            if !self.persisted {
                return Ok(());
            }
            let expected = Expected::none().equals(VERSION, AttributeValue::n(self.version));
            let key = self.record_key();
            match self
                .manager
                .store()
                .delete_item(self.log_table(), &key, &expected)
            {
                Ok(_) => {
                    self.persisted = false;
                    tracing::info!(tx_id = %self.tx_id, "deleted transaction record");
                    return Ok(());
                }
                Err(StorageError::ConditionFailed { .. }) => match self.fetch()? {
                    Some(record) => self.apply_record(&record)?,
                    None => {
                        self.persisted = false;
                        return Ok(());
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
        Err(self.version_race())
    }

    fn image_key(&self, rid: u32) -> Key {
        let mut key = Key::new();
        key.insert(
            IMAGE_ID.to_string(),
            AttributeValue::s(format!("{}#{}", self.tx_id, rid)),
        );
        key
    }

    /// Save the pre-write image for a request. The first saved image wins.
    pub(crate) fn save_item_image(&self, rid: u32, item: &Item) -> TransactionResult<()> {
        let mut image = attributes::strip_lock_attributes(item.clone());
        image.extend(self.image_key(rid));
        let expected = Expected::none().absent(IMAGE_ID);
        match self
            .manager
            .store()
            .put_item(&self.manager.config().image_table, image, &expected)
        {
            Ok(_) => Ok(()),
            Err(StorageError::ConditionFailed { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the pre-write image for a request, if one was saved.
    pub(crate) fn load_item_image(&self, rid: u32) -> TransactionResult<Option<Item>> {
        let image = self.manager.store().get_item(
            &self.manager.config().image_table,
            &self.image_key(rid),
            true,
        )?;
        Ok(image.map(|mut image| {
            image.remove(IMAGE_ID);
            image
        }))
    }

    pub(crate) fn delete_item_image(&self, rid: u32) -> TransactionResult<()> {
        self.manager.store().delete_item(
            &self.manager.config().image_table,
            &self.image_key(rid),
            &Expected::none(),
        )?;
        Ok(())
    }
}

impl fmt::Debug for TransactionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionItem")
            .field("tx_id", &self.tx_id)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("finalized", &self.finalized)
            .field("requests", &self.live.len())
            .finish()
    }
}
