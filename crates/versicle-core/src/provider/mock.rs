//! Mock provider
//!
//! An in-process remote for tests and offline development. Several
//! providers can share one [`MockRemote`] to simulate multiple devices, and
//! faults can be injected to exercise error paths.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::models::now_ms;
use crate::provider::{ProviderConfig, ProviderError, RemoteStorageProvider};
use crate::storage::persistence::atomic_write;
use crate::storage::{StorageError, StorageResult};

/// Faults applied to every call on a [`MockRemote`]
#[derive(Debug, Clone, Default)]
pub struct FaultInjection {
    pub fail_auth: bool,
    pub fail_network: bool,
    /// Reject uploads larger than this many bytes
    pub capacity_limit: Option<usize>,
    /// Delay before every remote call
    pub latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct RemoteState {
    blob: Option<Vec<u8>>,
    modified_ms: Option<i64>,
    uploads: usize,
    downloads: usize,
    faults: FaultInjection,
    path: Option<PathBuf>,
}

/// Shared remote storage; clones refer to the same blob
#[derive(Debug, Clone, Default)]
pub struct MockRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// A remote backed by a file, surviving process restarts
    pub fn persistent(path: PathBuf) -> StorageResult<Self> {
        let blob = if path.exists() {
            Some(fs::read(&path).map_err(|e| StorageError::from_io(e, path.clone()))?)
        } else {
            None
        };
        let modified_ms = blob.as_ref().map(|_| now_ms());

        Ok(Self {
            state: Arc::new(Mutex::new(RemoteState {
                blob,
                modified_ms,
                path: Some(path),
                ..RemoteState::default()
            })),
        })
    }

    pub fn set_faults(&self, faults: FaultInjection) {
        self.lock().faults = faults;
    }

    pub fn set_network_failure(&self, fail: bool) {
        self.lock().faults.fail_network = fail;
    }

    pub fn blob(&self) -> Option<Vec<u8>> {
        self.lock().blob.clone()
    }

    /// Overwrite the remote content directly
    pub fn put_blob(&self, bytes: &[u8]) {
        let mut state = self.lock();
        state.blob = Some(bytes.to_vec());
        state.modified_ms = Some(now_ms());
    }

    pub fn upload_count(&self) -> usize {
        self.lock().uploads
    }

    pub fn download_count(&self) -> usize {
        self.lock().downloads
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn delay(&self) {
        let latency = self.lock().faults.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_network(&self) -> Result<(), ProviderError> {
        if self.lock().faults.fail_network {
            return Err(ProviderError::Network("simulated network failure".to_string()));
        }
        Ok(())
    }
}

pub struct MockProvider {
    remote: MockRemote,
    authenticated: bool,
}

impl MockProvider {
    pub fn new(remote: MockRemote) -> Self {
        Self {
            remote,
            authenticated: false,
        }
    }

    pub fn remote(&self) -> &MockRemote {
        &self.remote
    }

    fn require_auth(&self) -> Result<(), ProviderError> {
        if !self.authenticated {
            return Err(ProviderError::Authentication("provider not initialized".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStorageProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn initialize(&mut self, _config: &ProviderConfig) -> Result<(), ProviderError> {
        self.remote.delay().await;
        if self.remote.lock().faults.fail_auth {
            self.authenticated = false;
            return Err(ProviderError::Authentication("simulated auth failure".to_string()));
        }
        self.authenticated = true;
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn upload_snapshot(&mut self, bytes: &[u8]) -> Result<(), ProviderError> {
        self.require_auth()?;
        self.remote.delay().await;
        self.remote.check_network()?;

        let mut state = self.remote.lock();
        if let Some(limit) = state.faults.capacity_limit {
            if bytes.len() > limit {
                return Err(ProviderError::Capacity(format!("{} > {} bytes", bytes.len(), limit)));
            }
        }

        if let Some(path) = &state.path {
            if let Err(e) = atomic_write(path, bytes) {
                warn!("Failed to persist mock remote: {}", e);
                return Err(ProviderError::Network(e.to_string()));
            }
        }

        state.blob = Some(bytes.to_vec());
        state.modified_ms = Some(now_ms());
        state.uploads += 1;
        debug!(bytes = bytes.len(), "Mock upload");
        Ok(())
    }

    async fn download_snapshot(&mut self) -> Result<Option<Vec<u8>>, ProviderError> {
        self.require_auth()?;
        self.remote.delay().await;
        self.remote.check_network()?;

        let mut state = self.remote.lock();
        state.downloads += 1;
        Ok(state.blob.clone())
    }

    async fn get_last_modified(&mut self) -> Result<Option<i64>, ProviderError> {
        self.require_auth()?;
        self.remote.check_network()?;
        Ok(self.remote.lock().modified_ms)
    }

    fn sign_out(&mut self) {
        self.authenticated = false;
    }
}
