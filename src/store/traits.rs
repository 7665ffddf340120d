//! Store trait and error types

use crate::page::Offer;
use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Trait for offer store backends.
///
/// Implementations must make `upsert_by_key` idempotent: the same key with
/// the same record reports "new" only the first time, and a conflicting
/// record for an existing key overwrites it (last-write-wins) after logging
/// a data-consistency warning.
pub trait OfferStore: Send {
    /// Inserts or replaces the record stored under `key`.
    ///
    /// Returns `true` if the key was not present before.
    fn upsert_by_key(&mut self, key: i64, record: &Offer) -> StoreResult<bool>;

    /// Materializes the full records for the given keys, skipping keys with
    /// no stored record. Order follows `keys`.
    fn records_by_keys(&self, keys: &[i64]) -> StoreResult<Vec<Offer>>;
}
