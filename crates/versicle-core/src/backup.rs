//! Export and import
//!
//! A backup is the legacy manifest wrapped in an envelope that records who
//! wrote it and a blake3 checksum of the serialized payload:
//!
//! ```text
//! {
//!   "meta": { "exporter", "version", "schemaVersion", "timestamp", "deviceId", "checksum" },
//!   "data": { "manifest": { ... } }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::document::{DocumentError, SharedDocument};
use crate::manifest::SyncManifest;
use crate::models::now_ms;
use crate::storage::persistence::atomic_write;
use crate::storage::StorageError;

/// Name written into `meta.exporter`
pub const EXPORTER: &str = "versicle";

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Invalid backup: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Backup schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u64, supported: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Envelope metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupMeta {
    pub exporter: String,
    /// Version of the exporting build
    pub version: String,
    pub schema_version: u64,
    pub timestamp: i64,
    pub device_id: String,
    /// blake3 hex digest of the serialized `data`
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupData {
    pub manifest: SyncManifest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Backup {
    pub meta: BackupMeta,
    pub data: BackupData,
}

/// What an import brought in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub books: usize,
    pub annotations: usize,
    pub lexicon_rules: usize,
    pub reading_list: usize,
}

impl Backup {
    /// Capture the document as a backup
    pub fn export(doc: &SharedDocument, device_id: &str) -> Result<Self, BackupError> {
        let data = BackupData {
            manifest: SyncManifest::from_document(doc, device_id)?,
        };
        let checksum = checksum(&data)?;

        Ok(Self {
            meta: BackupMeta {
                exporter: EXPORTER.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                schema_version: doc.schema_version()?,
                timestamp: now_ms(),
                device_id: device_id.to_string(),
                checksum,
            },
            data,
        })
    }

    pub fn to_json(&self) -> Result<String, BackupError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a backup and verify its checksum
    pub fn from_json(json: &str) -> Result<Self, BackupError> {
        let backup: Backup = serde_json::from_str(json)?;
        backup.verify()?;
        Ok(backup)
    }

    pub fn verify(&self) -> Result<(), BackupError> {
        let actual = checksum(&self.data)?;
        if actual != self.meta.checksum {
            return Err(BackupError::ChecksumMismatch {
                expected: self.meta.checksum.clone(),
                actual,
            });
        }
        if self.meta.schema_version > crate::document::CURRENT_SCHEMA_VERSION {
            return Err(BackupError::UnsupportedVersion {
                found: self.meta.schema_version,
                supported: crate::document::CURRENT_SCHEMA_VERSION,
            });
        }
        Ok(())
    }

    /// Merge the backup into the document
    ///
    /// Records present in the backup overwrite their live counterparts;
    /// everything else in the document is kept.
    pub fn import_into(&self, doc: &mut SharedDocument, device_id: &str) -> Result<ImportSummary, BackupError> {
        let manifest = &self.data.manifest;
        manifest.apply_to(doc, device_id)?;

        let summary = ImportSummary {
            books: manifest.books.len(),
            annotations: manifest.books.values().map(|b| b.annotations.len()).sum(),
            lexicon_rules: manifest.lexicon.len(),
            reading_list: manifest.reading_list.len(),
        };
        info!(
            books = summary.books,
            annotations = summary.annotations,
            source_device = %self.meta.device_id,
            "Imported backup"
        );
        Ok(summary)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), BackupError> {
        let json = self.to_json()?;
        atomic_write(path, json.as_bytes())?;
        debug!(path = %path.display(), bytes = json.len(), "Wrote backup");
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self, BackupError> {
        let json = std::fs::read_to_string(path).map_err(|source| BackupError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }
}

fn checksum(data: &BackupData) -> Result<String, BackupError> {
    let bytes = serde_json::to_vec(data)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::names;
    use crate::models::{Annotation, BookSummary, LexiconRule};
    use tempfile::TempDir;

    fn sample_document() -> SharedDocument {
        let mut doc = SharedDocument::new();
        doc.transact(|tx| {
            tx.put_record(&BookSummary::new("b1", "Moby Dick").with_author("Herman Melville"))?;
            tx.put_record(&Annotation::new("b1", "epubcfi(/6/4!/4/2)", "Call me Ishmael"))?;
            tx.put_record(&LexiconRule::new("Ahab", "Captain Ahab"))
        })
        .unwrap();
        doc
    }

    #[test]
    fn test_export_envelope_shape() {
        let doc = sample_document();
        let backup = Backup::export(&doc, "device-a").unwrap();
        let value: serde_json::Value = serde_json::from_str(&backup.to_json().unwrap()).unwrap();

        for key in ["exporter", "version", "schemaVersion", "timestamp", "deviceId", "checksum"] {
            assert!(value["meta"].get(key).is_some(), "missing meta.{}", key);
        }
        assert_eq!(value["meta"]["exporter"], EXPORTER);
        assert_eq!(value["meta"]["checksum"].as_str().unwrap().len(), 64);
        assert_eq!(
            value["data"]["manifest"]["books"]["b1"]["metadata"]["title"],
            "Moby Dick"
        );
    }

    #[test]
    fn test_import_into_clean_document() {
        let backup = Backup::export(&sample_document(), "device-a").unwrap();
        let parsed = Backup::from_json(&backup.to_json().unwrap()).unwrap();

        let mut target = SharedDocument::new();
        let summary = parsed.import_into(&mut target, "device-b").unwrap();

        assert_eq!(summary.books, 1);
        assert_eq!(summary.annotations, 1);
        assert_eq!(summary.lexicon_rules, 1);
        assert_eq!(target.len(names::LIBRARY).unwrap(), 1);
        assert_eq!(target.len(names::ANNOTATIONS).unwrap(), 1);
        assert_eq!(target.len(names::LEXICON).unwrap(), 1);
    }

    #[test]
    fn test_import_keeps_unrelated_records() {
        let backup = Backup::export(&sample_document(), "device-a").unwrap();

        let mut target = SharedDocument::new();
        target
            .transact(|tx| tx.put_record(&BookSummary::new("b2", "Walden")))
            .unwrap();
        backup.import_into(&mut target, "device-b").unwrap();

        assert_eq!(target.len(names::LIBRARY).unwrap(), 2);
    }

    #[test]
    fn test_tampered_backup_is_rejected() {
        let backup = Backup::export(&sample_document(), "device-a").unwrap();
        let json = backup.to_json().unwrap().replace("Moby Dick", "Moby Duck");

        let result = Backup::from_json(&json);
        assert!(matches!(result, Err(BackupError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let mut backup = Backup::export(&sample_document(), "device-a").unwrap();
        backup.meta.schema_version = crate::document::CURRENT_SCHEMA_VERSION + 1;

        assert!(matches!(
            backup.verify(),
            Err(BackupError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backup.json");

        let backup = Backup::export(&sample_document(), "device-a").unwrap();
        backup.write_to(&path).unwrap();

        let loaded = Backup::read_from(&path).unwrap();
        assert_eq!(loaded, backup);
    }

    #[test]
    fn test_garbage_is_a_format_error() {
        assert!(matches!(
            Backup::from_json("{\"meta\": 1}"),
            Err(BackupError::Format(_))
        ));
    }
}
