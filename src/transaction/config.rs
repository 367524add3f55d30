//! Transaction manager configuration.

use std::time::Duration;

/// Configuration options for a [`TransactionManager`](super::TransactionManager).
///
/// Retry counts bound the internal loops that resolve lock and version races.
/// They are tuning knobs, not protocol constants; the defaults are only a
/// reasonable starting point.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Table holding one log record per transaction.
    pub log_table: String,
    /// Table holding pre-write item images.
    pub image_table: String,
    /// Attempts to lock a single item before giving up with `ItemNotLocked`.
    pub lock_attempts: u32,
    /// Attempts to win a version race on the log record.
    pub version_attempts: u32,
    /// Attempts a committed read makes before giving up.
    pub committed_read_attempts: u32,
    /// A pending lock owner updated more recently than this is left alone:
    /// the contender fails with `ItemNotLocked` instead of rolling it back.
    /// Zero means pending owners are always rolled back.
    pub pending_owner_grace: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            log_table: "Transactions".to_string(),
            image_table: "TransactionImages".to_string(),
            lock_attempts: 3,
            version_attempts: 3,
            committed_read_attempts: 3,
            pending_owner_grace: Duration::ZERO,
        }
    }
}

impl TransactionConfig {
    /// Create a configuration with the given backing table names.
    pub fn new(log_table: impl Into<String>, image_table: impl Into<String>) -> Self {
        Self {
            log_table: log_table.into(),
            image_table: image_table.into(),
            ..Default::default()
        }
    }

    /// Set the per-item lock attempt budget.
    pub fn lock_attempts(mut self, value: u32) -> Self {
        self.lock_attempts = value;
        self
    }

    /// Set the log record version-race budget.
    pub fn version_attempts(mut self, value: u32) -> Self {
        self.version_attempts = value;
        self
    }

    /// Set the committed-read retry budget.
    pub fn committed_read_attempts(mut self, value: u32) -> Self {
        self.committed_read_attempts = value;
        self
    }

    /// Set how long a pending lock owner is protected from contenders.
    pub fn pending_owner_grace(mut self, value: Duration) -> Self {
        self.pending_owner_grace = value;
        self
    }
}
