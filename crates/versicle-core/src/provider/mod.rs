//! Remote storage providers
//!
//! A provider moves the encoded document to and from one remote location.
//! Every provider owns its own authentication state and caches the handle
//! of the remote blob it last located; re-authenticating drops that cache.
//!
//! ## Implementations
//!
//! - [`SnapshotProvider`]: binary CRDT snapshot over a [`FileStore`]
//! - [`ManifestProvider`]: legacy JSON manifest over a [`FileStore`]
//! - [`crate::sync::RealtimeProvider`]: realtime WebSocket backend
//! - [`MockProvider`]: in-memory, with fault injection

pub mod file_store;
pub mod manifest;
pub mod mock;
pub mod snapshot;

use std::fmt;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{Config, ProviderKind};
use crate::sync::realtime::{RealtimeProvider, WebSocketTransport};

pub use file_store::{FileStore, HttpFileStore, MemoryFileStore, RemoteFile};
pub use manifest::{ManifestProvider, MANIFEST_FILE_NAME};
pub use mock::{FaultInjection, MockProvider, MockRemote};
pub use snapshot::{SnapshotProvider, SNAPSHOT_FILE_NAME};

/// Classification of provider failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Configuration,
    Authentication,
    Network,
    Capacity,
    NotFound,
    Protocol,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderErrorKind::Configuration => "configuration",
            ProviderErrorKind::Authentication => "authentication",
            ProviderErrorKind::Network => "network",
            ProviderErrorKind::Capacity => "capacity",
            ProviderErrorKind::NotFound => "not-found",
            ProviderErrorKind::Protocol => "protocol",
        };
        f.write_str(name)
    }
}

/// Errors returned by remote storage providers
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    Configuration(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote storage rejected the payload as too large: {0}")]
    Capacity(String),

    #[error("Remote object not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ProviderError {
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            ProviderError::Configuration(_) => ProviderErrorKind::Configuration,
            ProviderError::Authentication(_) => ProviderErrorKind::Authentication,
            ProviderError::Network(_) => ProviderErrorKind::Network,
            ProviderError::Capacity(_) => ProviderErrorKind::Capacity,
            ProviderError::NotFound(_) => ProviderErrorKind::NotFound,
            ProviderError::Protocol(_) => ProviderErrorKind::Protocol,
        }
    }
}

/// Why a save was rejected by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaveRejection {
    /// Document exceeds the backend's size limit; the user should export and prune
    PayloadTooLarge,
    /// Retries ran out; the user should check connectivity
    RetryExhausted,
}

/// Notifications emitted by realtime-capable providers
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Connected,
    Disconnected,
    /// Local and remote state have converged
    Synced,
    Error {
        kind: ProviderErrorKind,
        message: String,
    },
    SaveRejected {
        kind: SaveRejection,
        details: String,
    },
}

/// Settings a provider needs to reach its backend
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProviderConfig {
    pub endpoint: Option<String>,
    pub access_token: Option<String>,
    pub user_id: Option<String>,
    /// Application-private folder on file stores
    pub folder: String,
    pub environment: String,
    pub device_id: String,
}

impl ProviderConfig {
    pub fn from_config(config: &Config, device_id: &str) -> Self {
        Self {
            endpoint: config.sync_url.clone(),
            access_token: config.access_token.clone(),
            user_id: config.user_id.clone(),
            folder: config.remote_folder.clone(),
            environment: config.environment.clone(),
            device_id: device_id.to_string(),
        }
    }

    /// The access token, or a configuration error
    pub fn require_token(&self) -> Result<&str, ProviderError> {
        self.access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::Configuration("missing access token".to_string()))
    }
}

/// A remote location holding one encoded document
#[async_trait]
pub trait RemoteStorageProvider: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Authenticate and prepare the provider
    ///
    /// Fails with a configuration or authentication error when credentials
    /// are absent or invalid. Calling it again with the same config is a
    /// no-op while authenticated.
    async fn initialize(&mut self, config: &ProviderConfig) -> Result<(), ProviderError>;

    fn is_authenticated(&self) -> bool;

    /// Upsert the remote blob
    async fn upload_snapshot(&mut self, bytes: &[u8]) -> Result<(), ProviderError>;

    /// Fetch the remote blob; `None` before the first upload
    async fn download_snapshot(&mut self) -> Result<Option<Vec<u8>>, ProviderError>;

    /// Last modification time of the remote blob, epoch milliseconds
    async fn get_last_modified(&mut self) -> Result<Option<i64>, ProviderError>;

    /// Forget in-memory authentication state
    fn sign_out(&mut self) {}
}

/// Build the provider selected by the configuration
///
/// Returns `None` for `provider = "none"`.
pub fn build_provider(config: &Config) -> Result<Option<Box<dyn RemoteStorageProvider>>> {
    let provider: Box<dyn RemoteStorageProvider> = match config.provider {
        ProviderKind::None => return Ok(None),
        ProviderKind::Snapshot => Box::new(SnapshotProvider::new(Box::new(http_store(config)?))),
        ProviderKind::Manifest => Box::new(ManifestProvider::new(Box::new(http_store(config)?))),
        ProviderKind::Realtime => {
            let url = config
                .sync_url
                .as_deref()
                .context("The realtime provider requires sync_url")?;
            Box::new(RealtimeProvider::new(WebSocketTransport::new(url)))
        }
        ProviderKind::Mock => {
            let remote = MockRemote::persistent(config.data_dir.join("mock_remote.crdt"))
                .context("Failed to open mock remote")?;
            Box::new(MockProvider::new(remote))
        }
    };
    Ok(Some(provider))
}

fn http_store(config: &Config) -> Result<HttpFileStore> {
    let url = config
        .sync_url
        .as_deref()
        .with_context(|| format!("The {} provider requires sync_url", config.provider))?;
    HttpFileStore::new(url).context("Failed to create HTTP client")
}
