//! Sync state persistence
//!
//! Remembers when this device last completed a sync, between sessions.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Persistent sync state
#[derive(Debug, Default)]
pub struct SyncState {
    record: SyncRecord,
    /// Path to persist state
    path: Option<PathBuf>,
}

/// What is stored on disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    /// Completion time of the last successful sync, epoch milliseconds
    pub last_sync: Option<i64>,
    pub last_trigger: Option<String>,
}

impl SyncState {
    /// Create a new sync state (in-memory only)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sync state that persists to disk
    pub fn with_path(path: PathBuf) -> Result<Self> {
        let mut state = Self {
            record: SyncRecord::default(),
            path: Some(path.clone()),
        };

        if path.exists() {
            state.load()?;
        }

        Ok(state)
    }

    pub fn record(&self) -> &SyncRecord {
        &self.record
    }

    pub fn last_sync(&self) -> Option<i64> {
        self.record.last_sync
    }

    /// Record a completed sync and save
    pub fn record_sync(&mut self, timestamp: i64, trigger: &str) -> Result<()> {
        self.record.last_sync = Some(timestamp);
        self.record.last_trigger = Some(trigger.to_string());
        self.save()
    }

    /// Save state to disk
    pub fn save(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(&self.record)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, json).context("Failed to save sync state")?;
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        let json = fs::read_to_string(path).context("Failed to read sync state")?;
        self.record = serde_json::from_str(&json).context("Failed to parse sync state")?;
        Ok(())
    }

    /// Forget the last sync
    pub fn clear(&mut self) -> Result<()> {
        self.record = SyncRecord::default();
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sync_state_new() {
        let state = SyncState::new();
        assert!(state.last_sync().is_none());
    }

    #[test]
    fn test_sync_state_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sync_state.json");

        {
            let mut state = SyncState::with_path(path.clone()).unwrap();
            state.record_sync(1_700_000_000_000, "manual").unwrap();
        }

        {
            let state = SyncState::with_path(path.clone()).unwrap();
            assert_eq!(state.last_sync(), Some(1_700_000_000_000));
            assert_eq!(state.record().last_trigger.as_deref(), Some("manual"));
        }

        let json = fs::read_to_string(path).unwrap();
        assert!(json.contains("lastSync"));
    }

    #[test]
    fn test_sync_state_clear() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sync_state.json");

        let mut state = SyncState::with_path(path.clone()).unwrap();
        state.record_sync(1, "startup").unwrap();
        state.clear().unwrap();

        let reloaded = SyncState::with_path(path).unwrap();
        assert!(reloaded.last_sync().is_none());
    }

    #[test]
    fn test_sync_state_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sync_state.json");
        fs::write(&path, "not json").unwrap();
        assert!(SyncState::with_path(path).is_err());
    }
}
