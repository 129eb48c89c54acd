//! Checkpoint service
//!
//! Captures, restores and prunes snapshots of the shared document. The
//! service does not own the document; callers pass the handle they hold.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::checkpoint::inspector::{diff_checkpoint, DiffResult};
use crate::checkpoint::store::{Checkpoint, CheckpointInfo, CheckpointStore};
use crate::checkpoint::CheckpointError;
use crate::config::Config;
use crate::document::SharedDocument;
use crate::models::now_ms;

/// Number of checkpoints kept after pruning
pub const MAX_CHECKPOINTS: usize = 10;

/// Trigger label for checkpoints taken before merging remote data
pub const PRE_SYNC_TRIGGER: &str = "pre-sync";

pub struct CheckpointService {
    store: CheckpointStore,
    max_checkpoints: usize,
}

impl CheckpointService {
    pub fn new(store: CheckpointStore) -> Self {
        Self {
            store,
            max_checkpoints: MAX_CHECKPOINTS,
        }
    }

    pub fn open(config: &Config) -> Result<Self, CheckpointError> {
        Ok(Self::new(CheckpointStore::open(config)?))
    }

    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        Ok(Self::new(CheckpointStore::open_in_memory()?))
    }

    /// Snapshot the document and prune old checkpoints
    pub fn create_checkpoint(&self, doc: &mut SharedDocument, trigger: &str) -> Result<i64, CheckpointError> {
        let blob = doc.encode_state();
        let size = size_kb(blob.len());
        let id = self.store.insert(now_ms(), trigger, &blob, size)?;
        info!(id, trigger, size_kb = size, "Created checkpoint");

        match self.store.prune(self.max_checkpoints) {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "Pruned old checkpoints"),
            Err(e) => warn!("Failed to prune checkpoints: {}", e),
        }

        Ok(id)
    }

    /// Create a checkpoint unless one with the same trigger is recent enough
    ///
    /// Returns `None` when skipped.
    pub fn create_automatic_checkpoint(
        &self,
        doc: &mut SharedDocument,
        trigger: &str,
        interval: Duration,
    ) -> Result<Option<i64>, CheckpointError> {
        if let Some(latest) = self.store.latest_for_trigger(trigger)? {
            let age = now_ms().saturating_sub(latest.timestamp);
            if age < i64::try_from(interval.as_millis()).unwrap_or(i64::MAX) {
                debug!(trigger, age_ms = age, "Recent checkpoint exists, skipping");
                return Ok(None);
            }
        }

        self.create_checkpoint(doc, trigger).map(Some)
    }

    /// Replace the live document's content with a checkpoint
    ///
    /// The blob is decoded before anything is touched, and the replacement
    /// runs as one transaction. Returns the restored container names.
    pub fn restore_checkpoint(&self, doc: &mut SharedDocument, id: i64) -> Result<Vec<String>, CheckpointError> {
        let checkpoint = self.load(id)?;
        let source = SharedDocument::load(&checkpoint.blob).map_err(|e| CheckpointError::Corrupted {
            id,
            details: e.to_string(),
        })?;

        let restored = doc.replace_with(&source)?;
        info!(id, containers = restored.len(), "Restored checkpoint");
        Ok(restored)
    }

    /// Diff the live document against a stored checkpoint
    pub fn diff_checkpoint(
        &self,
        doc: &SharedDocument,
        id: i64,
    ) -> Result<BTreeMap<String, DiffResult>, CheckpointError> {
        let checkpoint = self.load(id)?;
        diff_checkpoint(doc, &checkpoint.blob).map_err(|e| CheckpointError::Corrupted {
            id,
            details: e.to_string(),
        })
    }

    /// All checkpoints, newest first
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        Ok(self.store.list()?)
    }

    pub fn get_checkpoint(&self, id: i64) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.store.get(id)?)
    }

    pub fn delete_checkpoint(&self, id: i64) -> Result<bool, CheckpointError> {
        Ok(self.store.delete(id)?)
    }

    fn load(&self, id: i64) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = self.store.get(id)?.ok_or(CheckpointError::NotFound(id))?;
        if checkpoint.blob.is_empty() {
            return Err(CheckpointError::Corrupted {
                id,
                details: "missing blob".to_string(),
            });
        }
        Ok(checkpoint)
    }
}

/// Approximate size in KB, never below 1
fn size_kb(bytes: usize) -> i64 {
    (((bytes as f64) / 1024.0).round() as i64).max(1)
}
