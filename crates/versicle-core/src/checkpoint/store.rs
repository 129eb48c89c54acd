//! SQLite checkpoint store
//!
//! Rows are append-only: a checkpoint is inserted once, read by restore and
//! the inspector, and eventually deleted by pruning. Nothing updates a row.

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::config::Config;
use crate::storage::{open_database, open_in_memory, StorageResult};

/// A stored checkpoint including its blob
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub id: i64,
    /// Creation time, epoch milliseconds
    pub timestamp: i64,
    pub trigger: String,
    pub blob: Vec<u8>,
    /// Approximate size in KB
    pub size: i64,
}

/// Checkpoint metadata without the blob
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointInfo {
    pub id: i64,
    pub timestamp: i64,
    pub trigger: String,
    pub size: i64,
}

impl From<Checkpoint> for CheckpointInfo {
    fn from(cp: Checkpoint) -> Self {
        Self {
            id: cp.id,
            timestamp: cp.timestamp,
            trigger: cp.trigger,
            size: cp.size,
        }
    }
}

pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    pub fn open(config: &Config) -> StorageResult<Self> {
        Ok(Self::from_connection(open_database(&config.sqlite_path())?))
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Ok(Self::from_connection(open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a checkpoint and return its id
    pub fn insert(&self, timestamp: i64, trigger: &str, blob: &[u8], size: i64) -> rusqlite::Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO checkpoints (timestamp, trigger, blob, size) VALUES (?, ?, ?, ?)",
            params![timestamp, trigger, blob, size],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> rusqlite::Result<Option<Checkpoint>> {
        self.conn()
            .query_row(
                "SELECT id, timestamp, trigger, blob, size FROM checkpoints WHERE id = ?",
                params![id],
                |row| {
                    Ok(Checkpoint {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        trigger: row.get(2)?,
                        blob: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
                        size: row.get(4)?,
                    })
                },
            )
            .optional()
    }

    /// All checkpoints, newest first
    pub fn list(&self) -> rusqlite::Result<Vec<CheckpointInfo>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, trigger, size FROM checkpoints ORDER BY timestamp DESC, id DESC",
        )?;
        let rows = stmt
            .query_map([], info_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent checkpoint created with `trigger`
    pub fn latest_for_trigger(&self, trigger: &str) -> rusqlite::Result<Option<CheckpointInfo>> {
        self.conn()
            .query_row(
                r#"
                SELECT id, timestamp, trigger, size FROM checkpoints
                WHERE trigger = ?
                ORDER BY timestamp DESC, id DESC
                LIMIT 1
                "#,
                params![trigger],
                info_from_row,
            )
            .optional()
    }

    /// Delete the oldest checkpoints (by id) until at most `keep` remain
    pub fn prune(&self, keep: usize) -> rusqlite::Result<usize> {
        self.conn().execute(
            r#"
            DELETE FROM checkpoints
            WHERE id NOT IN (SELECT id FROM checkpoints ORDER BY id DESC LIMIT ?)
            "#,
            params![keep as i64],
        )
    }

    pub fn delete(&self, id: i64) -> rusqlite::Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM checkpoints WHERE id = ?", params![id])?;
        Ok(removed > 0)
    }

    pub fn count(&self) -> rusqlite::Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM checkpoints", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn info_from_row(row: &Row<'_>) -> rusqlite::Result<CheckpointInfo> {
    Ok(CheckpointInfo {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        trigger: row.get(2)?,
        size: row.get(3)?,
    })
}
