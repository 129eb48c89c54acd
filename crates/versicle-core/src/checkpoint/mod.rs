//! Checkpoints
//!
//! Local, append-only snapshots of the shared document that protect against
//! destructive merges. Checkpoints are never synced.
//!
//! - `store`: SQLite table access
//! - `service`: create / restore / prune
//! - `inspector`: structural diff against the live document

pub mod inspector;
pub mod service;
pub mod store;

use thiserror::Error;

use crate::document::DocumentError;
use crate::storage::StorageError;

pub use inspector::{deep_diff, diff_checkpoint, DiffResult, ModifiedValue};
pub use service::{CheckpointService, MAX_CHECKPOINTS, PRE_SYNC_TRIGGER};
pub use store::{Checkpoint, CheckpointInfo, CheckpointStore};

/// Errors that can occur during checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint {0} not found")]
    NotFound(i64),

    #[error("Checkpoint {id} is corrupted: {details}")]
    Corrupted { id: i64, details: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
}
