//! Checkpoint inspector
//!
//! Structural diff between the live document and a checkpoint blob. The blob
//! is hydrated into its own document; the live document is only read.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

use crate::document::{ContainerSnapshot, DocumentError, SharedDocument};

/// A value present on both sides with different content
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModifiedValue {
    pub old: Value,
    pub new: Value,
}

/// Per-container diff between live state and a candidate
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    /// Keys only in the candidate
    pub added: BTreeMap<String, Value>,
    /// Keys only in live state
    pub removed: BTreeMap<String, Value>,
    /// Keys in both with different values
    pub modified: BTreeMap<String, ModifiedValue>,
    pub unchanged_count: usize,
}

impl DiffResult {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.modified.is_empty()
    }
}

/// Compare two container snapshots
pub fn deep_diff(live: &ContainerSnapshot, candidate: &ContainerSnapshot) -> DiffResult {
    let mut result = DiffResult::default();

    for (key, old) in live {
        match candidate.get(key) {
            None => {
                result.removed.insert(key.clone(), old.clone());
            }
            Some(new) if new != old => {
                result.modified.insert(
                    key.clone(),
                    ModifiedValue {
                        old: old.clone(),
                        new: new.clone(),
                    },
                );
            }
            Some(_) => result.unchanged_count += 1,
        }
    }

    for (key, new) in candidate {
        if !live.contains_key(key) {
            result.added.insert(key.clone(), new.clone());
        }
    }

    result
}

/// Diff every known container of `live` against the checkpoint in `blob`
pub fn diff_checkpoint(
    live: &SharedDocument,
    blob: &[u8],
) -> Result<BTreeMap<String, DiffResult>, DocumentError> {
    let candidate = SharedDocument::load(blob)?;

    let live_snapshot = live.snapshot()?;
    let candidate_snapshot = candidate.snapshot()?;

    let names: BTreeSet<&String> = live_snapshot.keys().chain(candidate_snapshot.keys()).collect();
    let empty = ContainerSnapshot::new();

    Ok(names
        .into_iter()
        .map(|name| {
            let diff = deep_diff(
                live_snapshot.get(name).unwrap_or(&empty),
                candidate_snapshot.get(name).unwrap_or(&empty),
            );
            (name.clone(), diff)
        })
        .collect())
}
