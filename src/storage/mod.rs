//! Storage module for persisting harvested records
//!
//! This module handles all database operations for the harvester:
//! - SQLite database initialization and schema management
//! - Keyed JSON records grouped into named collections
//! - Atomic chunk upserts and insert-if-missing for placeholder rows

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStore;
pub use traits::{record_key, Record, RecordStore, StoreError, StoreResult};

use std::path::Path;

/// Initializes or opens a record store
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
pub fn open_store(path: &Path) -> StoreResult<SqliteStore> {
    SqliteStore::new(path)
}
