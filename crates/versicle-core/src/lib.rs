//! Versicle Core Library
//!
//! The CRDT sync and disaster-recovery engine behind Versicle, a local-first
//! EPUB reader. A reader's library, progress, annotations and pronunciation
//! lexicon live in one shared Automerge document that every device merges.
//!
//! # Architecture
//!
//! - **Automerge**: Source of truth for data, merged conflict-free
//! - **SQLite**: Local checkpoints and the lexicon mirror, never synced
//! - **Providers**: Remote locations the encoded document is pushed to
//!
//! # Quick Start
//!
//! ```text
//! let engine = SyncEngine::open()?;
//!
//! // Pull, merge and push
//! engine.orchestrator().sync(SyncTrigger::Manual).await;
//!
//! // Protect against a bad merge
//! let id = engine.create_checkpoint("manual").await?;
//! let diff = engine.diff_checkpoint(id).await?;
//! ```
//!
//! # Modules
//!
//! - `engine`: Composition root (main entry point)
//! - `document`: Shared Automerge document and transactions
//! - `containers`: Known container names and kinds
//! - `checkpoint`: Snapshots, restore and structural diff
//! - `provider`: Remote storage providers
//! - `sync`: Orchestration, realtime sessions and bootstrap
//! - `manifest`: Legacy JSON manifest and its field-level merge
//! - `backup`: Checksummed export/import
//! - `storage`: Local persistence and SQLite
//! - `config`: Application configuration

pub mod backup;
pub mod checkpoint;
pub mod config;
pub mod containers;
pub mod document;
pub mod engine;
pub mod identity;
pub mod manifest;
pub mod models;
pub mod provider;
pub mod storage;
pub mod sync;

pub use backup::{Backup, BackupError, ImportSummary};
pub use checkpoint::{CheckpointError, CheckpointInfo, CheckpointService, DiffResult};
pub use config::{Config, ProviderKind};
pub use containers::{ContainerKind, ContainerRegistry};
pub use document::{DocumentError, DocumentHandle, DocumentUpdate, SharedDocument, UpdateOrigin};
pub use engine::{EngineStatus, SyncEngine};
pub use identity::DeviceIdentity;
pub use manifest::SyncManifest;
pub use models::{Annotation, BookSummary, LexiconRule, ReadingListEntry, ReadingProgress};
pub use provider::{ProviderConfig, ProviderError, ProviderErrorKind, ProviderEvent, RemoteStorageProvider};
pub use storage::{DocumentPersistence, StorageError};
pub use sync::{SyncOrchestrator, SyncOutcome, SyncTrigger};
