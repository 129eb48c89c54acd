//! Composition root
//!
//! `SyncEngine` builds every long-lived service exactly once from a
//! [`Config`] and hands out shared handles:
//!
//! - the live document handle, loaded from (and saved to) the data directory
//! - the checkpoint service and the lexicon mirror, sharing `versicle.db`
//! - the sync orchestrator with the configured provider
//! - a realtime connection manager when the realtime provider is selected
//!
//! ## Usage
//!
//! ```ignore
//! let engine = SyncEngine::open()?;
//! engine.orchestrator().sync(SyncTrigger::Startup).await;
//! engine.shutdown().await?;
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::backup::{Backup, ImportSummary};
use crate::checkpoint::{CheckpointInfo, CheckpointService, DiffResult};
use crate::config::{Config, ProviderKind};
use crate::containers::names;
use crate::document::DocumentHandle;
use crate::identity::DeviceIdentity;
use crate::provider::{build_provider, ProviderConfig, RemoteStorageProvider};
use crate::storage::{DocumentPersistence, SqliteLexiconStore};
use crate::sync::{
    ConnectionManager, ConnectionOptions, OrchestratorOptions, OrchestratorParts, RealtimeProvider,
    RealtimeTransport, SyncOrchestrator, SyncRecord, SyncState, WebSocketTransport,
};

/// Trigger label for checkpoints taken before an import
pub const PRE_IMPORT_TRIGGER: &str = "pre-import";

/// Snapshot of the engine for status displays
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub device_id: String,
    pub provider: Option<&'static str>,
    pub sync_enabled: bool,
    pub last_sync: SyncRecord,
    pub capacity_blocked: bool,
    pub books: usize,
    pub annotations: usize,
    pub checkpoints: usize,
    pub document_bytes: usize,
}

pub struct SyncEngine {
    config: Config,
    identity: DeviceIdentity,
    doc: DocumentHandle,
    persistence: DocumentPersistence,
    checkpoints: Arc<CheckpointService>,
    lexicon: Arc<SqliteLexiconStore>,
    orchestrator: Arc<SyncOrchestrator>,
    connection: Option<ConnectionManager>,
}

impl SyncEngine {
    /// Open the engine with the configuration from disk and environment
    pub fn open() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Self::open_with_config(config)
    }

    /// Open the engine with a specific configuration
    pub fn open_with_config(config: Config) -> Result<Self> {
        let transport: Option<Arc<dyn RealtimeTransport>> =
            match (config.provider, config.sync_url.as_deref()) {
                (ProviderKind::Realtime, Some(url)) => Some(Arc::new(WebSocketTransport::new(url))),
                _ => None,
            };
        Self::assemble(config, transport)
    }

    /// Open the engine with a custom realtime transport
    ///
    /// The transport backs both the realtime provider and the connection
    /// manager, whatever `provider` the config names.
    pub fn open_with_transport(mut config: Config, transport: Arc<dyn RealtimeTransport>) -> Result<Self> {
        config.provider = ProviderKind::Realtime;
        Self::assemble(config, Some(transport))
    }

    fn assemble(config: Config, transport: Option<Arc<dyn RealtimeTransport>>) -> Result<Self> {
        let identity = DeviceIdentity::load_or_create(&config).context("Failed to resolve device id")?;

        let persistence = DocumentPersistence::new(&config);
        let mut doc = persistence
            .load_or_create()
            .context("Failed to load or create document")?;
        if doc
            .migrate(|from, _tx| {
                info!(from, "Migrating document schema");
                Ok(())
            })
            .context("Failed to migrate document")?
        {
            persistence
                .save(&mut doc)
                .context("Failed to save migrated document")?;
        }
        let doc = doc.into_handle();

        let checkpoints =
            Arc::new(CheckpointService::open(&config).context("Failed to open checkpoint store")?);
        let lexicon = Arc::new(SqliteLexiconStore::open(&config).context("Failed to open lexicon store")?);

        let provider: Option<Box<dyn RemoteStorageProvider>> = if !config.sync_enabled {
            None
        } else {
            match (&transport, config.provider) {
                (Some(transport), ProviderKind::Realtime) => {
                    Some(Box::new(RealtimeProvider::with_transport(transport.clone())))
                }
                _ => build_provider(&config)?,
            }
        };

        let state = SyncState::with_path(config.sync_state_path()).context("Failed to load sync state")?;
        let orchestrator = Arc::new(SyncOrchestrator::new(OrchestratorParts {
            doc: doc.clone(),
            provider,
            provider_config: ProviderConfig::from_config(&config, identity.device_id()),
            checkpoints: checkpoints.clone(),
            lexicon: lexicon.clone(),
            persistence: Some(DocumentPersistence::new(&config)),
            state,
            options: OrchestratorOptions::from_config(&config),
        }));

        let connection = transport.filter(|_| config.sync_enabled).map(|transport| {
            ConnectionManager::new(
                transport,
                doc.clone(),
                checkpoints.clone(),
                lexicon.clone(),
                ConnectionOptions::from_config(&config),
            )
        });

        debug!(
            device_id = identity.device_id(),
            provider = %config.provider,
            sync_enabled = config.sync_enabled,
            "Engine assembled"
        );

        Ok(Self {
            config,
            identity,
            doc,
            persistence,
            checkpoints,
            lexicon,
            orchestrator,
            connection,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    /// Shared handle to the live document
    pub fn document(&self) -> DocumentHandle {
        self.doc.clone()
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointService> {
        &self.checkpoints
    }

    pub fn lexicon(&self) -> &Arc<SqliteLexiconStore> {
        &self.lexicon
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// The realtime connection manager, when realtime sync is configured
    pub fn connection(&self) -> Option<&ConnectionManager> {
        self.connection.as_ref()
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig::from_config(&self.config, self.device_id())
    }

    /// Persist the live document
    pub async fn save(&self) -> Result<()> {
        let mut doc = self.doc.lock().await;
        self.persistence.save(&mut doc).context("Failed to save document")
    }

    // ==================== Checkpoints ====================

    pub async fn create_checkpoint(&self, trigger: &str) -> Result<i64> {
        let mut doc = self.doc.lock().await;
        self.checkpoints
            .create_checkpoint(&mut doc, trigger)
            .context("Failed to create checkpoint")
    }

    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointInfo>> {
        self.checkpoints
            .list_checkpoints()
            .context("Failed to list checkpoints")
    }

    /// Replace the live content with a checkpoint and save it
    pub async fn restore_checkpoint(&self, id: i64) -> Result<Vec<String>> {
        let mut doc = self.doc.lock().await;
        let restored = self
            .checkpoints
            .restore_checkpoint(&mut doc, id)
            .with_context(|| format!("Failed to restore checkpoint {}", id))?;
        // The next push mirrors the local table, so it must match the restored content
        self.lexicon
            .project_from(&doc)
            .context("Failed to project restored lexicon")?;
        self.persistence
            .save(&mut doc)
            .context("Failed to save restored document")?;
        Ok(restored)
    }

    pub async fn diff_checkpoint(&self, id: i64) -> Result<BTreeMap<String, DiffResult>> {
        let doc = self.doc.lock().await;
        self.checkpoints
            .diff_checkpoint(&doc, id)
            .with_context(|| format!("Failed to diff checkpoint {}", id))
    }

    // ==================== Export / Import ====================

    pub async fn export_backup(&self, path: &Path) -> Result<Backup> {
        let doc = self.doc.lock().await;
        let backup = Backup::export(&doc, self.device_id()).context("Failed to export document")?;
        backup
            .write_to(path)
            .with_context(|| format!("Failed to write backup: {}", path.display()))?;
        info!(path = %path.display(), books = backup.data.manifest.books.len(), "Exported backup");
        Ok(backup)
    }

    /// Import a backup, checkpointing the live content first
    pub async fn import_backup(&self, path: &Path) -> Result<ImportSummary> {
        let backup = Backup::read_from(path)
            .with_context(|| format!("Failed to read backup: {}", path.display()))?;

        let mut doc = self.doc.lock().await;
        self.checkpoints
            .create_checkpoint(&mut doc, PRE_IMPORT_TRIGGER)
            .context("Failed to checkpoint before import")?;
        let summary = backup
            .import_into(&mut doc, self.device_id())
            .context("Failed to import backup")?;
        self.lexicon
            .project_from(&doc)
            .context("Failed to project imported lexicon")?;
        self.persistence
            .save(&mut doc)
            .context("Failed to save imported document")?;
        Ok(summary)
    }

    // ==================== Status ====================

    pub async fn status(&self) -> Result<EngineStatus> {
        let checkpoints = self.list_checkpoints()?.len();
        let provider = self.orchestrator.provider_name().await;

        let mut doc = self.doc.lock().await;
        let books = doc.len(names::LIBRARY)?;
        let annotations = doc.len(names::ANNOTATIONS)?;
        let document_bytes = doc.encode_state().len();

        Ok(EngineStatus {
            device_id: self.device_id().to_string(),
            provider,
            sync_enabled: self.config.sync_enabled,
            last_sync: self.orchestrator.last_sync(),
            capacity_blocked: self.orchestrator.is_capacity_blocked(),
            books,
            annotations,
            checkpoints,
            document_bytes,
        })
    }

    /// Stop background work, close the live session and save
    pub async fn shutdown(&self) -> Result<()> {
        self.orchestrator.shutdown();
        if let Some(connection) = &self.connection {
            connection.sign_out().await;
        }
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookSummary, LexiconRule};
    use crate::sync::{BootstrapOutcome, MockRealtimeHub, SyncOutcome, SyncTrigger};
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> Config {
        Config {
            data_dir: temp_dir.path().to_path_buf(),
            device_id: Some("device-a".to_string()),
            ..Config::default()
        }
    }

    async fn add_book(engine: &SyncEngine, id: &str, title: &str) {
        engine
            .document()
            .lock()
            .await
            .transact(|tx| tx.put_record(&BookSummary::new(id, title)))
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_creates_data_files() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let engine = SyncEngine::open_with_config(config.clone()).unwrap();
        assert_eq!(engine.device_id(), "device-a");
        assert!(engine.connection().is_none());
        assert!(config.automerge_path().exists());
        assert!(config.sqlite_path().exists());

        let status = engine.status().await.unwrap();
        assert_eq!(status.books, 0);
        assert!(status.provider.is_none());
    }

    #[tokio::test]
    async fn test_document_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();

        {
            let engine = SyncEngine::open_with_config(test_config(&temp_dir)).unwrap();
            add_book(&engine, "b1", "Moby Dick").await;
            engine.shutdown().await.unwrap();
        }

        let engine = SyncEngine::open_with_config(test_config(&temp_dir)).unwrap();
        assert_eq!(engine.status().await.unwrap().books, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_restore_and_diff() {
        let temp_dir = TempDir::new().unwrap();
        let engine = SyncEngine::open_with_config(test_config(&temp_dir)).unwrap();

        add_book(&engine, "b1", "Moby Dick").await;
        let id = engine.create_checkpoint("manual").await.unwrap();
        add_book(&engine, "bX", "Walden").await;

        let diff = engine.diff_checkpoint(id).await.unwrap();
        assert!(diff[names::LIBRARY].removed.contains_key("bX"));

        engine.restore_checkpoint(id).await.unwrap();
        let status = engine.status().await.unwrap();
        assert_eq!(status.books, 1);
        assert_eq!(engine.list_checkpoints().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_export_then_import_into_fresh_engine() {
        let temp_dir = TempDir::new().unwrap();
        let backup_path = temp_dir.path().join("backup.json");

        let source = SyncEngine::open_with_config(test_config(&temp_dir)).unwrap();
        add_book(&source, "b1", "Moby Dick").await;
        source.export_backup(&backup_path).await.unwrap();

        let other_dir = TempDir::new().unwrap();
        let target = SyncEngine::open_with_config(Config {
            device_id: Some("device-b".to_string()),
            ..test_config(&other_dir)
        })
        .unwrap();
        let summary = target.import_backup(&backup_path).await.unwrap();

        assert_eq!(summary.books, 1);
        assert_eq!(target.status().await.unwrap().books, 1);
        let checkpoints = target.list_checkpoints().unwrap();
        assert_eq!(checkpoints[0].trigger, PRE_IMPORT_TRIGGER);
    }

    #[tokio::test]
    async fn test_mock_provider_sync_between_engines() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();

        let remote_config = |dir: &TempDir, device: &str| Config {
            sync_enabled: true,
            provider: ProviderKind::Mock,
            device_id: Some(device.to_string()),
            ..test_config(dir)
        };
        let engine_a = SyncEngine::open_with_config(remote_config(&dir_a, "device-a")).unwrap();
        add_book(&engine_a, "b1", "Moby Dick").await;
        engine_a
            .lexicon()
            .upsert(&LexiconRule::new("Ahab", "Captain Ahab"))
            .unwrap();

        assert!(matches!(
            engine_a.orchestrator().sync(SyncTrigger::Manual).await,
            SyncOutcome::Synced { .. } | SyncOutcome::Pushed
        ));
        // The mock remote lives in the data dir
        std::fs::copy(
            dir_a.path().join("mock_remote.crdt"),
            dir_b.path().join("mock_remote.crdt"),
        )
        .unwrap();

        let engine_b = SyncEngine::open_with_config(remote_config(&dir_b, "device-b")).unwrap();
        assert!(engine_b.orchestrator().sync(SyncTrigger::Startup).await.is_success());

        assert_eq!(engine_b.status().await.unwrap().books, 1);
        assert_eq!(engine_b.lexicon().count().unwrap(), 1);
        assert!(engine_b.status().await.unwrap().last_sync.last_sync.is_some());
    }

    #[tokio::test]
    async fn test_restored_lexicon_is_not_resurrected_by_push() {
        let temp_dir = TempDir::new().unwrap();
        let engine = SyncEngine::open_with_config(Config {
            sync_enabled: true,
            provider: ProviderKind::Mock,
            ..test_config(&temp_dir)
        })
        .unwrap();

        let id = engine.create_checkpoint("manual").await.unwrap();
        engine
            .lexicon()
            .upsert(&LexiconRule::new("Ahab", "Captain Ahab"))
            .unwrap();
        assert!(engine.orchestrator().sync(SyncTrigger::Manual).await.is_success());
        assert_eq!(
            engine.document().lock().await.records::<LexiconRule>().unwrap().len(),
            1
        );

        engine.restore_checkpoint(id).await.unwrap();
        assert_eq!(engine.lexicon().count().unwrap(), 0);

        assert!(engine
            .orchestrator()
            .force_push(SyncTrigger::Background)
            .await
            .is_success());
        assert!(engine
            .document()
            .lock()
            .await
            .records::<LexiconRule>()
            .unwrap()
            .is_empty());
        assert_eq!(engine.lexicon().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_import_projects_lexicon() {
        let temp_dir = TempDir::new().unwrap();
        let backup_path = temp_dir.path().join("backup.json");

        let source = SyncEngine::open_with_config(test_config(&temp_dir)).unwrap();
        source
            .document()
            .lock()
            .await
            .transact(|tx| tx.put_record(&LexiconRule::new("Dr.", "Doctor")))
            .unwrap();
        source.export_backup(&backup_path).await.unwrap();

        let other_dir = TempDir::new().unwrap();
        let target = SyncEngine::open_with_config(test_config(&other_dir)).unwrap();
        target.import_backup(&backup_path).await.unwrap();

        let rules = target.lexicon().all_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].replacement, "Doctor");
    }

    #[tokio::test]
    async fn test_realtime_engine_signs_in() {
        let temp_dir = TempDir::new().unwrap();
        let hub = MockRealtimeHub::new().with_token("secret");

        let config = Config {
            sync_enabled: true,
            access_token: Some("secret".to_string()),
            user_id: Some("user-1".to_string()),
            ..test_config(&temp_dir)
        };
        let engine = SyncEngine::open_with_transport(config, Arc::new(hub.clone())).unwrap();
        assert_eq!(engine.orchestrator().provider_name().await, Some("realtime"));

        let connection = engine.connection().unwrap();
        let outcome = connection.sign_in(&engine.provider_config()).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::FirstDevice);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_disabled_has_no_provider() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            provider: ProviderKind::Mock,
            ..test_config(&temp_dir)
        };
        let engine = SyncEngine::open_with_config(config).unwrap();

        assert!(engine.orchestrator().provider_name().await.is_none());
        assert!(!engine.orchestrator().sync(SyncTrigger::Manual).await.is_success());
    }
}
