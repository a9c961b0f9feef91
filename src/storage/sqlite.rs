//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the RecordStore trait.

use crate::storage::schema::initialize_schema;
use crate::storage::traits::{record_key, Record, RecordStore, StoreError, StoreResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite record store
///
/// The connection sits behind a mutex so the store can be shared between the
/// writer and the CLI; every call holds the lock only for its own statements.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates a store at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStore)` - Successfully opened/created database
    /// * `Err(StoreError)` - Failed to open database
    pub fn new(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA mmap_size = 268435456;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory store (for testing and dry runs)
    pub fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection mutex poisoned".to_string()))
    }
}

fn decode_body(body: &str) -> StoreResult<Record> {
    match serde_json::from_str::<Value>(body)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Serialization(format!(
            "stored body is not an object: {}",
            other
        ))),
    }
}

impl RecordStore for SqliteStore {
    fn select(&self, collection: &str, keys: &[String]) -> StoreResult<Vec<Record>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("SELECT body FROM records WHERE collection = ?1 AND record_key = ?2")?;

        let mut rows = Vec::new();
        for key in keys {
            let body: Option<String> = stmt
                .query_row(params![collection, key], |row| row.get(0))
                .optional()?;
            if let Some(body) = body {
                rows.push(decode_body(&body)?);
            }
        }
        Ok(rows)
    }

    fn insert(
        &self,
        collection: &str,
        conflict_keys: &[String],
        records: &[Record],
    ) -> StoreResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO records (collection, record_key, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
            )?;
            for record in records {
                let key = record_key(collection, conflict_keys, record)?;
                let body = serde_json::to_string(record)?;
                inserted += stmt.execute(params![collection, key, body, now])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn update(
        &self,
        collection: &str,
        conflict_keys: &[String],
        record: &Record,
    ) -> StoreResult<bool> {
        let key = record_key(collection, conflict_keys, record)?;
        let body = serde_json::to_string(record)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE records SET body = ?1, updated_at = ?2 WHERE collection = ?3 AND record_key = ?4",
            params![body, Utc::now().to_rfc3339(), collection, key],
        )?;
        Ok(changed > 0)
    }

    fn upsert(
        &self,
        collection: &str,
        conflict_keys: &[String],
        records: &[Record],
    ) -> StoreResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO records (collection, record_key, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(collection, record_key)
                 DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            )?;
            for record in records {
                let key = record_key(collection, conflict_keys, record)?;
                let body = serde_json::to_string(record)?;
                stmt.execute(params![collection, key, body, now])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn delete(&self, collection: &str, keys: &[String]) -> StoreResult<usize> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare_cached("DELETE FROM records WHERE collection = ?1 AND record_key = ?2")?;
        let mut deleted = 0;
        for key in keys {
            deleted += stmt.execute(params![collection, key])?;
        }
        Ok(deleted)
    }

    fn count(&self, collection: &str) -> StoreResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn collections(&self) -> StoreResult<Vec<(String, u64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT collection, COUNT(*) FROM records GROUP BY collection ORDER BY collection",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
