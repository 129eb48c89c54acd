//! Storage layer
//!
//! Handles local persistence of the shared document and the SQLite
//! database for non-replicated state.
//!
//! ## Architecture
//!
//! - **Automerge**: Source of truth, stored as a binary file
//! - **SQLite**: Checkpoint store and the local lexicon mirror
//!
//! After a pull, the lexicon table is rebuilt from the document.

pub mod error;
pub mod lexicon;
pub mod persistence;
pub mod schema;

use std::path::Path;

use rusqlite::Connection;

pub use error::{IoFailure, StorageError, StorageResult};
pub use lexicon::SqliteLexiconStore;
pub use persistence::DocumentPersistence;
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};

/// Open (or create) the SQLite database and make sure the schema is current
pub fn open_database(path: &Path) -> StorageResult<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
    }

    let conn = Connection::open(path)?;
    prepare_connection(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing)
pub fn open_in_memory() -> StorageResult<Connection> {
    let conn = Connection::open_in_memory()?;
    prepare_connection(&conn)?;
    Ok(conn)
}

fn prepare_connection(conn: &Connection) -> StorageResult<()> {
    // Checkpoint and lexicon stores share the file
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    if needs_init(conn) {
        init_schema(conn)?;
    }
    Ok(())
}
