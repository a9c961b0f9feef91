//! Storage traits and error types
//!
//! This module defines the trait interface for record stores and the
//! associated error types.

use serde_json::{Map, Value};
use thiserror::Error;

/// A row as a JSON object of column name to value
pub type Record = Map<String, Value>;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Record in '{collection}' is missing conflict column '{column}'")]
    MissingKey { collection: String, column: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Separator between conflict-column values inside a record key
const KEY_SEPARATOR: char = '\u{1f}';

/// Derives the record key of `record` from its conflict columns
///
/// String values are used verbatim, anything else by its JSON text, so
/// `{"id": "abc"}` and `{"id": 7}` key as `abc` and `7`. A missing or null
/// conflict column is an error: such a record can never be addressed again.
pub fn record_key(
    collection: &str,
    conflict_keys: &[String],
    record: &Record,
) -> StoreResult<String> {
    let mut parts = Vec::with_capacity(conflict_keys.len());
    for column in conflict_keys {
        match record.get(column) {
            Some(Value::String(s)) => parts.push(s.clone()),
            Some(Value::Null) | None => {
                return Err(StoreError::MissingKey {
                    collection: collection.to_string(),
                    column: column.clone(),
                })
            }
            Some(other) => parts.push(other.to_string()),
        }
    }
    Ok(parts.join(&KEY_SEPARATOR.to_string()))
}

/// Trait for record store implementations
///
/// Collections are addressed by name; each caller supplies the conflict
/// columns that identify a row within a collection. Implementations must be
/// safe to share between tasks.
pub trait RecordStore: Send + Sync {
    /// Returns the stored rows for the given record keys, skipping unknown keys
    fn select(&self, collection: &str, keys: &[String]) -> StoreResult<Vec<Record>>;

    /// Inserts rows whose key is not yet present, leaving existing rows untouched
    ///
    /// # Returns
    ///
    /// The number of rows actually inserted
    fn insert(
        &self,
        collection: &str,
        conflict_keys: &[String],
        records: &[Record],
    ) -> StoreResult<usize>;

    /// Replaces an existing row; returns false when no row has that key
    fn update(&self, collection: &str, conflict_keys: &[String], record: &Record)
        -> StoreResult<bool>;

    /// Inserts or replaces all rows atomically
    ///
    /// Either every record in `records` is written or none is.
    fn upsert(
        &self,
        collection: &str,
        conflict_keys: &[String],
        records: &[Record],
    ) -> StoreResult<usize>;

    /// Deletes rows by record key
    fn delete(&self, collection: &str, keys: &[String]) -> StoreResult<usize>;

    /// Counts rows in a collection
    fn count(&self, collection: &str) -> StoreResult<u64>;

    /// Lists every collection with its row count, sorted by name
    fn collections(&self) -> StoreResult<Vec<(String, u64)>>;
}
