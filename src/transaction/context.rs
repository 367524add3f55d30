//! The transaction protocol engine.
//!
//! A [`Transaction`] drives requests through the lock, image, apply sequence
//! and completes them with [`Transaction::commit`] or
//! [`Transaction::rollback`]. Every step is a conditional write that can be
//! repeated, so any holder of the transaction id (the original caller, a
//! contender, a sweeper) can re-drive a transaction to the same end state.
//!
//! ```text
//!   put/update/delete/get
//!          │
//!          ▼
//!   log request ──► lock item ──► save image ──► verify PENDING ──► apply
//!                                                                   │
//!      commit: re-drive all ─► COMMITTED ─► unlock items ─► drop images ─► finalize
//!    rollback: ROLLED_BACK ─► restore images / drop transients ─► drop images ─► finalize
//! ```

use std::fmt;
use std::time::Duration;

use ulid::Ulid;

use crate::storage::{Item, Key, Updates};
use crate::transaction::attributes;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::item::{completed_error, TransactionItem, TransactionState};
use crate::transaction::manager::TransactionManager;
use crate::transaction::request::{Operation, Request};

/// What a single [`Transaction::sweep`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Nothing was due.
    None,
    /// A stale PENDING transaction was rolled back.
    RolledBack,
    /// Cleanup of a terminal transaction was re-driven.
    Completed(TransactionState),
    /// The log record and its images were removed.
    Deleted,
}

impl fmt::Display for SweepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepAction::None => write!(f, "none"),
            SweepAction::RolledBack => write!(f, "rolled back"),
            SweepAction::Completed(state) => write!(f, "completed {}", state),
            SweepAction::Deleted => write!(f, "deleted"),
        }
    }
}

/// A multi-item transaction.
///
/// Several `Transaction` values may hold the same id at once, in this process
/// or others. They coordinate only through the log record and item locks.
pub struct Transaction {
    pub(crate) manager: TransactionManager,
    pub(crate) item: TransactionItem,
}

impl Transaction {
    /// Start a new transaction. Its log record is written on first use.
    pub(crate) fn new(manager: TransactionManager) -> Self {
        let tx_id = Ulid::new().to_string().to_lowercase();
        let item = TransactionItem::new(manager.clone(), tx_id);
        Self { manager, item }
    }

    /// Wrap an existing log record.
    pub(crate) fn resume(manager: TransactionManager, tx_id: &str) -> TransactionResult<Self> {
        let item = TransactionItem::load(manager.clone(), tx_id)?;
        Ok(Self { manager, item })
    }

    /// Get the transaction ID.
    pub fn id(&self) -> &str {
        self.item.id()
    }

    /// State as of the last read or write of the log record.
    pub fn state(&self) -> TransactionState {
        self.item.state()
    }

    /// The underlying log record.
    pub fn record(&self) -> &TransactionItem {
        &self.item
    }

    // ==================== Requests ====================

    /// Read an item and hold a lock on it until the transaction completes.
    pub fn get_item(&mut self, table: &str, key: Key) -> TransactionResult<Option<Item>> {
        self.execute(Request::get(table, key))
    }

    /// Insert or replace an item. Returns the item as written.
    pub fn put_item(&mut self, table: &str, item: Item) -> TransactionResult<Item> {
        self.execute(Request::put(table, item))?
            .ok_or_else(|| TransactionError::assertion(self.id(), "put returned no item"))
    }

    /// Update (or create) an item. Returns the item after the update.
    pub fn update_item(&mut self, table: &str, key: Key, updates: Updates) -> TransactionResult<Item> {
        self.execute(Request::update(table, key, updates))?
            .ok_or_else(|| TransactionError::assertion(self.id(), "update returned no item"))
    }

    /// Delete an item when the transaction commits. Returns the value being deleted.
    pub fn delete_item(&mut self, table: &str, key: Key) -> TransactionResult<Option<Item>> {
        self.execute(Request::delete(table, key))
    }

    /// Run a pre-built request inside the transaction.
    pub fn execute(&mut self, mut request: Request) -> TransactionResult<Option<Item>> {
        if self.state().is_terminal() {
            return Err(completed_error(self.id(), self.state()));
        }
        request.validate(self.item.id(), &self.manager)?;
        let logged = self.item.add_request(request.clone())?;
        tracing::debug!(tx_id = %self.id(), request = %logged, "driving request");

        let current = self.drive(&logged)?;
        Ok(self.result_for(&request, &logged, current))
    }

    /// Lock, save the image, verify the record is still PENDING, apply.
    ///
    /// Every step is idempotent, so a logged request can be driven again by
    /// any holder of the transaction.
    fn drive(&mut self, request: &Request) -> TransactionResult<Item> {
        let locked = self.lock_item(request)?;

        if request.mutates_on_apply()
            && !attributes::is_applied(&locked)
            && !attributes::is_transient(&locked)
        {
            let rid = self.rid_of(request)?;
            self.item.save_item_image(rid, &locked)?;
        }

        self.item.reload()?;
        if self.state().is_terminal() {
            tracing::debug!(tx_id = %self.id(), state = %self.state(), "completed while locking");
            self.release()?;
            return Err(completed_error(self.id(), self.state()));
        }

        self.apply(request, locked)
    }

    /// What the caller sees for a request, given the item it ended on.
    fn result_for(&self, asked: &Request, logged: &Request, current: Item) -> Option<Item> {
        let deleted_here = asked.is_read() && matches!(logged.operation, Operation::Delete);
        let never_written = attributes::is_transient(&current) && !attributes::is_applied(&current);
        if never_written || deleted_here {
            return None;
        }
        let item = attributes::strip_lock_attributes(current);
        match &asked.operation {
            Operation::Get { projection } => Some(attributes::project(item, projection.as_deref())),
            _ => Some(item),
        }
    }

    pub(crate) fn rid_of(&self, request: &Request) -> TransactionResult<u32> {
        request
            .rid
            .ok_or_else(|| TransactionError::assertion(self.id(), format!("request {} has no rid", request)))
    }

    // ==================== Completion ====================

    /// Commit the transaction.
    ///
    /// Safe to call again, from this or any other holder of the id. Fails
    /// with [`TransactionError::TransactionRolledBack`] if the transaction was
    /// rolled back first, after finishing that rollback's cleanup.
    pub fn commit(&mut self) -> TransactionResult<()> {
        self.item.reload()?;
        let attempts = self.manager.config().version_attempts.max(1);
        let mut races = 0;

        while self.state() == TransactionState::Pending {
            let version = self.item.version();
            for request in self.item.live_requests() {
                if let Err(e) = self.drive(&request) {
                    return Err(self.settle_after(e)?);
                }
            }

            let committed = self.item.version() == version
                && match self.item.try_transition(TransactionState::Committed) {
                    Ok(written) => written,
                    Err(e) if e.is_completed() => break,
                    Err(e) => return Err(e),
                };
            if committed {
                break;
            }
            races += 1;
            if races >= attempts {
                return Err(TransactionError::UnknownCompletedTransaction {
                    tx_id: self.id().to_string(),
                    reason: format!("log record kept changing during {} commit attempts", races),
                });
            }
        }

        self.release()?;
        match self.state() {
            TransactionState::Committed => {
                tracing::info!(tx_id = %self.id(), "transaction committed");
                Ok(())
            }
            state => Err(completed_error(self.id(), state)),
        }
    }

    /// Roll the transaction back.
    ///
    /// Safe to call again, from this or any other holder of the id. Fails
    /// with [`TransactionError::TransactionCommitted`] if the transaction
    /// committed first, after finishing that commit's cleanup.
    pub fn rollback(&mut self) -> TransactionResult<()> {
        self.item.reload()?;
        match self.item.transition(TransactionState::RolledBack) {
            Ok(()) => {}
            Err(e) if e.is_completed() => {}
            Err(e) => return Err(e),
        }

        self.release()?;
        match self.state() {
            TransactionState::RolledBack => {
                tracing::info!(tx_id = %self.id(), "transaction rolled back");
                Ok(())
            }
            state => Err(completed_error(self.id(), state)),
        }
    }

    /// After a failed re-drive: if the transaction was completed underneath
    /// us, finish that completion and report it instead of the raw failure.
    fn settle_after(&mut self, err: TransactionError) -> TransactionResult<TransactionError> {
        if err.is_completed() || !self.item.reload_if_exists()? || !self.state().is_terminal() {
            return Ok(err);
        }
        self.release()?;
        Ok(completed_error(self.id(), self.state()))
    }

    /// Release every item for the terminal state, drop images, finalize.
    fn release(&mut self) -> TransactionResult<()> {
        let state = self.state();
        for request in self.item.live_requests() {
            match state {
                TransactionState::Committed => self.unlock_committed(&request)?,
                TransactionState::RolledBack => self.restore_rolled_back(&request)?,
                TransactionState::Pending => {
                    return Err(TransactionError::assertion(self.id(), "cannot release a pending transaction"))
                }
            }
        }
        for rid in self.item.logged_rids() {
            self.item.delete_item_image(rid)?;
        }
        self.item.finalize()
    }

    /// Delete the log record and its images.
    ///
    /// Returns `false` without deleting anything if the record was updated
    /// less than `min_age` ago. A terminal transaction whose cleanup never
    /// finished has it re-driven first, which refreshes its age.
    pub fn delete(&mut self, min_age: Duration) -> TransactionResult<bool> {
        let exists = self.item.reload_if_exists()?;
        if self.state() == TransactionState::Pending {
            return Err(TransactionError::StillPending {
                tx_id: self.id().to_string(),
            });
        }
        if !exists {
            return Ok(true);
        }
        if !self.item.is_finalized() {
            self.release()?;
        }
        if self.item.idle_for() < min_age {
            return Ok(false);
        }

        for rid in self.item.logged_rids() {
            self.item.delete_item_image(rid)?;
        }
        self.item.delete()?;
        Ok(true)
    }

    /// Take whatever corrective action a stale transaction is due.
    ///
    /// A PENDING transaction idle for at least `rollback_after` is rolled
    /// back. A terminal one with unfinished cleanup idle that long has its
    /// cleanup re-driven. A finalized one is deleted once `delete_after` old.
    pub fn sweep(&mut self, rollback_after: Duration, delete_after: Duration) -> TransactionResult<SweepAction> {
        if !self.item.reload_if_exists()? {
            return Ok(SweepAction::None);
        }
        let idle = self.item.idle_for();

        let action = match self.state() {
            TransactionState::Pending if idle >= rollback_after => match self.rollback() {
                Ok(()) => SweepAction::RolledBack,
                Err(e) if e.is_completed() => SweepAction::Completed(self.state()),
                Err(e) => return Err(e),
            },
            TransactionState::Pending => SweepAction::None,
            state if !self.item.is_finalized() => {
                if idle < rollback_after {
                    SweepAction::None
                } else {
                    self.release()?;
                    SweepAction::Completed(state)
                }
            }
            _ => {
                if self.delete(delete_after)? {
                    SweepAction::Deleted
                } else {
                    SweepAction::None
                }
            }
        };

        if action != SweepAction::None {
            tracing::info!(tx_id = %self.id(), action = %action, idle_ms = idle.as_millis() as u64, "swept transaction");
        }
        Ok(action)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("tx_id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
