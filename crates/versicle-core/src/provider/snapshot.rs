//! Binary snapshot provider
//!
//! Stores the full encoded document as a single file in the application's
//! private folder on a cloud file store.

use async_trait::async_trait;

use crate::provider::file_store::{FileSlot, FileStore};
use crate::provider::{ProviderConfig, ProviderError, RemoteStorageProvider};

/// Well-known name of the snapshot file
pub const SNAPSHOT_FILE_NAME: &str = "versicle_state.crdt";

pub struct SnapshotProvider {
    slot: FileSlot,
}

impl SnapshotProvider {
    pub fn new(store: Box<dyn FileStore>) -> Self {
        Self {
            slot: FileSlot::new(store, SNAPSHOT_FILE_NAME),
        }
    }
}

#[async_trait]
impl RemoteStorageProvider for SnapshotProvider {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    async fn initialize(&mut self, config: &ProviderConfig) -> Result<(), ProviderError> {
        self.slot.initialize(config).await
    }

    fn is_authenticated(&self) -> bool {
        self.slot.is_authenticated()
    }

    async fn upload_snapshot(&mut self, bytes: &[u8]) -> Result<(), ProviderError> {
        self.slot.upload(bytes).await
    }

    async fn download_snapshot(&mut self) -> Result<Option<Vec<u8>>, ProviderError> {
        self.slot.download().await
    }

    async fn get_last_modified(&mut self) -> Result<Option<i64>, ProviderError> {
        self.slot.last_modified().await
    }

    fn sign_out(&mut self) {
        self.slot.sign_out();
    }
}
