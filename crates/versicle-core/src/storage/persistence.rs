//! Local document persistence
//!
//! Saves the shared document to `document.automerge` in the data directory.
//! Uses atomic writes (write to temp file, then rename) to prevent corruption.
//! A file that cannot be decoded is moved aside rather than overwritten.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::Config;
use crate::document::SharedDocument;
use crate::storage::error::{StorageError, StorageResult};

/// Persistence layer for the shared document
pub struct DocumentPersistence {
    path: PathBuf,
}

impl DocumentPersistence {
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.automerge_path(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if a document exists on disk
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Save the document using an atomic write
    pub fn save(&self, doc: &mut SharedDocument) -> StorageResult<()> {
        let bytes = doc.encode_state();
        atomic_write(&self.path, &bytes)?;
        debug!(bytes = bytes.len(), path = ?self.path, "Saved document");
        Ok(())
    }

    /// Load the document from disk
    ///
    /// Returns `None` if the file doesn't exist. A file that exists but can't
    /// be decoded is renamed to `*.corrupt` and reported as corrupted.
    pub fn load(&self) -> StorageResult<Option<SharedDocument>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&self.path).map_err(|e| StorageError::from_io(e, self.path.clone()))?;

        match SharedDocument::load(&bytes) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) => {
                let backup_path = self.path.with_extension("automerge.corrupt");
                warn!(path = ?self.path, "Stored document is corrupted, moving it aside");
                fs::rename(&self.path, &backup_path)
                    .map_err(|source| StorageError::from_io(source, backup_path.clone()))?;
                Err(StorageError::CorruptDocument {
                    path: self.path.clone(),
                    backup_path,
                    details: e.to_string(),
                })
            }
        }
    }

    /// Load the existing document or create and save a new one
    pub fn load_or_create(&self) -> StorageResult<SharedDocument> {
        if let Some(doc) = self.load()? {
            return Ok(doc);
        }

        let mut doc = SharedDocument::new();
        self.save(&mut doc)?;
        Ok(doc)
    }
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path).map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|e| StorageError::from_io(e, path.to_path_buf()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookSummary;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> Config {
        Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = DocumentPersistence::new(&test_config(&temp_dir));

        assert!(!persistence.exists());
        assert!(persistence.load().unwrap().is_none());

        let mut doc = SharedDocument::new();
        let book = BookSummary::new("moby", "Moby Dick");
        doc.transact(|tx| tx.put_record(&book)).unwrap();

        persistence.save(&mut doc).unwrap();
        assert!(persistence.exists());

        let loaded = persistence.load().unwrap().unwrap();
        assert_eq!(loaded.get_record::<BookSummary>("moby").unwrap(), Some(book));
    }

    #[test]
    fn test_load_or_create_new() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = DocumentPersistence::new(&test_config(&temp_dir));

        let doc = persistence.load_or_create().unwrap();
        assert!(persistence.exists());
        assert!(doc.is_library_empty().unwrap());
    }

    #[test]
    fn test_load_or_create_existing() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = DocumentPersistence::new(&test_config(&temp_dir));

        let mut doc = persistence.load_or_create().unwrap();
        doc.transact(|tx| tx.put_record(&BookSummary::new("b1", "Dune")))
            .unwrap();
        persistence.save(&mut doc).unwrap();

        let loaded = persistence.load_or_create().unwrap();
        assert_eq!(loaded.len("library").unwrap(), 1);
    }

    #[test]
    fn test_corrupt_document_is_moved_aside() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = DocumentPersistence::new(&test_config(&temp_dir));
        fs::write(persistence.path(), b"definitely not automerge").unwrap();

        let err = persistence.load().err().unwrap();
        match err {
            StorageError::CorruptDocument { backup_path, .. } => {
                assert!(backup_path.exists());
                assert!(!persistence.exists());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let nested_path = temp_dir.path().join("a").join("b").join("file.txt");

        atomic_write(&nested_path, b"test data").unwrap();

        assert_eq!(fs::read_to_string(&nested_path).unwrap(), "test data");
        assert!(!nested_path.with_extension("tmp").exists());
    }
}
