//! Storage error handling
//!
//! Errors from the document file, the SQLite database and other local state,
//! with a hint the CLI can show next to the message.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse class of a filesystem failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFailure {
    PermissionDenied,
    DiskFull,
    NotFound,
    Other,
}

impl IoFailure {
    fn classify(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => IoFailure::PermissionDenied,
            io::ErrorKind::NotFound => IoFailure::NotFound,
            _ => {
                let msg = error.to_string().to_lowercase();
                if ["no space left", "disk full", "quota exceeded", "not enough space"]
                    .iter()
                    .any(|needle| msg.contains(needle))
                {
                    IoFailure::DiskFull
                } else {
                    IoFailure::Other
                }
            }
        }
    }
}

impl fmt::Display for IoFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IoFailure::PermissionDenied => "Permission denied",
            IoFailure::DiskFull => "Disk full",
            IoFailure::NotFound => "Not found",
            IoFailure::Other => "I/O failure",
        })
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{kind} at '{path}': {source}")]
    Io {
        path: PathBuf,
        kind: IoFailure,
        #[source]
        source: io::Error,
    },

    /// The stored document could not be decoded and was moved aside
    #[error("Document at '{path}' is corrupted: {details}. It was moved to '{backup_path}'.")]
    CorruptDocument {
        path: PathBuf,
        backup_path: PathBuf,
        details: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Wrap an I/O error with the path it concerns
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        StorageError::Io {
            path,
            kind: IoFailure::classify(&error),
            source: error,
        }
    }

    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::Io {
                kind: IoFailure::DiskFull,
                ..
            } => Some("Free up disk space, or prune old checkpoints, and try again."),
            StorageError::Io {
                kind: IoFailure::PermissionDenied,
                ..
            } => Some("Check permissions on the data directory (see `versicle config show`)."),
            StorageError::CorruptDocument { .. } => Some(
                "Restore a checkpoint with `versicle checkpoint restore`, or import a backup.",
            ),
            _ => None,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
