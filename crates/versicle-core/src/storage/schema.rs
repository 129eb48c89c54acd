//! SQLite schema for local, non-replicated state
//!
//! The database holds the checkpoint store and the lexicon mirror. Neither is
//! synced; the shared document remains the source of truth for the lexicon.
//! The schema version lives in SQLite's `user_version` pragma.

use rusqlite::{Connection, Result};

pub const SCHEMA_VERSION: i32 = 1;

const TABLES: &str = r#"
    -- Append-only document snapshots, pruned to the newest few
    CREATE TABLE IF NOT EXISTS checkpoints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        trigger TEXT NOT NULL,
        blob BLOB NOT NULL,
        size INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_checkpoints_trigger ON checkpoints(trigger, timestamp);

    -- Local lexicon store, mirrored into the document
    CREATE TABLE IF NOT EXISTS lexicon_rules (
        id TEXT PRIMARY KEY,
        original TEXT NOT NULL,
        replacement TEXT NOT NULL,
        is_regex INTEGER NOT NULL DEFAULT 0,
        book_id TEXT,
        sort_order INTEGER,
        created INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_lexicon_rules_book_id ON lexicon_rules(book_id);
"#;

/// Create missing tables and stamp the version
///
/// Safe to run on an existing database; rows are kept.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(TABLES)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
}

pub fn schema_version(conn: &Connection) -> Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

/// True for a fresh database or one written by an older build
pub fn needs_init(conn: &Connection) -> bool {
    schema_version(conn).map_or(true, |v| v < SCHEMA_VERSION)
}
