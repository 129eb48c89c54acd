//! Legacy manifest provider
//!
//! Keeps the pre-CRDT JSON manifest as the remote format. Uploads convert the
//! encoded document to a manifest and merge it field by field with whatever
//! the remote already holds; downloads convert the manifest back into a
//! document that the caller merges like any other snapshot.
//!
//! Downloads are applied onto the document built from the previous download,
//! so an unchanged manifest encodes to the same state and merges as a no-op.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::document::SharedDocument;
use crate::manifest::{merge_manifests, SyncManifest};
use crate::provider::file_store::{FileSlot, FileStore};
use crate::provider::{ProviderConfig, ProviderError, RemoteStorageProvider};

/// Well-known name of the manifest file
pub const MANIFEST_FILE_NAME: &str = "versicle_sync.json";

pub struct ManifestProvider {
    slot: FileSlot,
    /// Document rebuilt from downloaded manifests
    base: Option<SharedDocument>,
}

impl ManifestProvider {
    pub fn new(store: Box<dyn FileStore>) -> Self {
        Self {
            slot: FileSlot::new(store, MANIFEST_FILE_NAME),
            base: None,
        }
    }

    async fn remote_manifest(&mut self) -> Result<Option<SyncManifest>, ProviderError> {
        let Some(bytes) = self.slot.download().await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ProviderError::Protocol(format!("invalid manifest: {}", e)))
    }
}

#[async_trait]
impl RemoteStorageProvider for ManifestProvider {
    fn name(&self) -> &'static str {
        "manifest"
    }

    async fn initialize(&mut self, config: &ProviderConfig) -> Result<(), ProviderError> {
        self.base = None;
        self.slot.initialize(config).await
    }

    fn is_authenticated(&self) -> bool {
        self.slot.is_authenticated()
    }

    async fn upload_snapshot(&mut self, bytes: &[u8]) -> Result<(), ProviderError> {
        let device_id = self.slot.config()?.device_id.clone();
        let doc = SharedDocument::load(bytes).map_err(|e| ProviderError::Protocol(e.to_string()))?;
        let local = SyncManifest::from_document(&doc, &device_id)
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;

        let merged = match self.remote_manifest().await {
            Ok(Some(remote)) => merge_manifests(&local, &remote),
            Ok(None) => local,
            Err(ProviderError::Protocol(e)) => {
                warn!("Overwriting unreadable remote manifest: {}", e);
                local
            }
            Err(e) => return Err(e),
        };

        let json = serde_json::to_vec(&merged).map_err(|e| ProviderError::Protocol(e.to_string()))?;
        debug!(books = merged.books.len(), bytes = json.len(), "Uploading manifest");
        self.slot.upload(&json).await
    }

    async fn download_snapshot(&mut self) -> Result<Option<Vec<u8>>, ProviderError> {
        let Some(manifest) = self.remote_manifest().await? else {
            return Ok(None);
        };

        let doc = self.base.get_or_insert_with(SharedDocument::new);
        manifest
            .apply_to(doc, &manifest.device_id)
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;
        Ok(Some(doc.encode_state()))
    }

    async fn get_last_modified(&mut self) -> Result<Option<i64>, ProviderError> {
        self.slot.last_modified().await
    }

    fn sign_out(&mut self) {
        self.base = None;
        self.slot.sign_out();
    }
}
