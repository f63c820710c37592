//! Error taxonomy for the ledger.
//!
//! `LedgerError` covers the store and input validation. The three operations
//! wrap it in their own enums so callers (the HTTP layer, the scheduler) can
//! tell a rejected request from a missing document from an infrastructure
//! failure without string matching.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("migration v{version} failed: {source}")]
    Migration {
        version: i32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("database connection lock poisoned")]
    LockPoisoned,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the daily aggregation run. Every variant aborts the run; none
/// of them leave a partially written day behind.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("invalid business date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("aggregation for {date_id} failed: {source}")]
    Store {
        date_id: String,
        #[source]
        source: LedgerError,
    },
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("invalid harvest key")]
    InvalidCredential,

    #[error("deviceId is required")]
    MissingDeviceId,

    #[error("no unharvested aggregates for device {device_id}")]
    NothingToHarvest { device_id: String },

    /// The conditioned update touched a different number of rows than were
    /// selected, i.e. another settlement won the race. Rolled back.
    #[error("concurrent settlement for device {device_id}: selected {selected}, updated {updated}")]
    Conflict {
        device_id: String,
        selected: usize,
        updated: usize,
    },

    #[error(transparent)]
    Store(#[from] LedgerError),
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("branch {0} not found")]
    BranchNotFound(String),

    #[error(transparent)]
    Store(#[from] LedgerError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

impl From<rusqlite::Error> for HarvestError {
    fn from(e: rusqlite::Error) -> Self {
        HarvestError::Store(LedgerError::Database(e))
    }
}
