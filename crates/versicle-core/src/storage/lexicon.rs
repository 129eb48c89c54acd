//! SQLite lexicon store
//!
//! The app reads pronunciation rules from a plain local table. The table is
//! mirrored with the `lexicon` container of the shared document:
//!
//! - after a pull, the table is rebuilt from the document (full projection)
//! - before a push, local rules are upserted into the document
//!
//! The push direction never deletes rules from the document.

use std::sync::Mutex;

use rusqlite::{params, Connection, Transaction};
use tracing::debug;

use crate::config::Config;
use crate::document::{DocumentError, SharedDocument};
use crate::models::{LexiconRule, Record};
use crate::storage::error::StorageResult;
use crate::storage::{open_database, open_in_memory};

/// SQLite-backed lexicon store
pub struct SqliteLexiconStore {
    conn: Mutex<Connection>,
}

impl SqliteLexiconStore {
    /// Open or create the store in the data directory's database
    pub fn open(config: &Config) -> StorageResult<Self> {
        Ok(Self::from_connection(open_database(&config.sqlite_path())?))
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        Ok(Self::from_connection(open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> StorageResult<T>) -> StorageResult<T> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut conn)
    }

    /// Rebuild the table from the document's lexicon container
    ///
    /// Clears and repopulates in one SQLite transaction.
    pub fn project_from(&self, doc: &SharedDocument) -> Result<usize, LexiconSyncError> {
        let rules = doc.records::<LexiconRule>()?;

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM lexicon_rules", [])?;
            for rule in &rules {
                insert_rule(&tx, rule)?;
            }
            tx.commit()?;
            Ok(())
        })?;

        debug!(count = rules.len(), "Projected lexicon from document");
        Ok(rules.len())
    }

    /// Upsert every local rule into the document
    ///
    /// Rules already equal in the document produce no operations.
    pub fn mirror_into(&self, doc: &mut SharedDocument) -> Result<usize, LexiconSyncError> {
        let rules = self.all_rules()?;
        if rules.is_empty() {
            return Ok(0);
        }

        doc.transact(|tx| {
            for rule in &rules {
                tx.put_record(rule)?;
            }
            Ok(())
        })?;

        debug!(count = rules.len(), "Mirrored local lexicon into document");
        Ok(rules.len())
    }

    // ==================== Local store access ====================

    /// All rules ordered by explicit order, then creation time
    pub fn all_rules(&self) -> StorageResult<Vec<LexiconRule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, original, replacement, is_regex, book_id, sort_order, created
                FROM lexicon_rules
                ORDER BY sort_order IS NULL, sort_order, created
                "#,
            )?;

            let rules = stmt
                .query_map([], |row| {
                    Ok(LexiconRule {
                        id: row.get(0)?,
                        original: row.get(1)?,
                        replacement: row.get(2)?,
                        is_regex: row.get(3)?,
                        book_id: row.get(4)?,
                        order: row.get(5)?,
                        created: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rules)
        })
    }

    /// Insert or replace one rule
    pub fn upsert(&self, rule: &LexiconRule) -> StorageResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            insert_rule(&tx, rule)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Delete a rule from the local store
    pub fn delete(&self, id: &str) -> StorageResult<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM lexicon_rules WHERE id = ?", params![id])?;
            Ok(removed > 0)
        })
    }

    pub fn count(&self) -> StorageResult<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM lexicon_rules", [], |row| row.get(0))?)
        })
    }
}

/// Failure while moving rules between the document and the local table
#[derive(thiserror::Error, Debug)]
pub enum LexiconSyncError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

fn insert_rule(tx: &Transaction, rule: &LexiconRule) -> StorageResult<()> {
    tx.execute(
        r#"
        INSERT OR REPLACE INTO lexicon_rules
            (id, original, replacement, is_regex, book_id, sort_order, created)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            rule.key(),
            rule.original,
            rule.replacement,
            rule.is_regex,
            rule.book_id,
            rule.order,
            rule.created,
        ],
    )?;
    Ok(())
}
