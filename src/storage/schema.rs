//! Database schema definitions
//!
//! Every collection shares one table; rows are JSON documents addressed by
//! `(collection, record_key)`.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    record_key TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (collection, record_key)
);

CREATE INDEX IF NOT EXISTS idx_records_updated ON records(collection, updated_at);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
