//! Generic cloud file store
//!
//! The boundary to a cloud drive SDK: find a file by name in a folder,
//! create it, overwrite it, download it. [`HttpFileStore`] speaks a small
//! REST API; [`MemoryFileStore`] keeps files in memory for tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::models::now_ms;
use crate::provider::{ProviderConfig, ProviderError};

/// A file located on the store
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: String,
    /// Last modification, epoch milliseconds
    pub modified_ms: i64,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Verify the token and use it for subsequent calls
    async fn authenticate(&mut self, token: &str) -> Result<(), ProviderError>;

    async fn find(&self, folder: &str, name: &str) -> Result<Option<RemoteFile>, ProviderError>;

    async fn create(&self, folder: &str, name: &str, bytes: &[u8]) -> Result<RemoteFile, ProviderError>;

    async fn update(&self, id: &str, bytes: &[u8]) -> Result<RemoteFile, ProviderError>;

    async fn download(&self, id: &str) -> Result<Vec<u8>, ProviderError>;
}

// ==================== HTTP ====================

#[derive(Debug, Deserialize)]
struct FileList {
    files: Vec<RemoteFile>,
}

/// REST file store
///
/// - `GET  {base}/me`
/// - `GET  {base}/folders/{folder}/files?name={name}`
/// - `POST {base}/folders/{folder}/files?name={name}` (body: content)
/// - `PUT  {base}/files/{id}/content` (body: content)
/// - `GET  {base}/files/{id}/content`
pub struct HttpFileStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpFileStore {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("versicle/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    fn token(&self) -> Result<&str, ProviderError> {
        self.token
            .as_deref()
            .ok_or_else(|| ProviderError::Authentication("not authenticated".to_string()))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        let response = request
            .bearer_auth(self.token()?)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        check_status(response)
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, ProviderError> {
        response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("invalid response body: {}", e)))
    }
}

/// Map HTTP status codes onto provider errors
fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = format!("{} {}", status.as_u16(), response.url().path());
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Authentication(message),
        StatusCode::NOT_FOUND => ProviderError::NotFound(message),
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE => {
            ProviderError::Capacity(message)
        }
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => ProviderError::Network(message),
        _ => ProviderError::Protocol(message),
    })
}

#[async_trait]
impl FileStore for HttpFileStore {
    async fn authenticate(&mut self, token: &str) -> Result<(), ProviderError> {
        self.token = Some(token.to_string());
        let url = format!("{}/me", self.base_url);
        if let Err(e) = self.send(self.client.get(url)).await {
            self.token = None;
            return Err(e);
        }
        Ok(())
    }

    async fn find(&self, folder: &str, name: &str) -> Result<Option<RemoteFile>, ProviderError> {
        let url = format!("{}/folders/{}/files", self.base_url, folder);
        let response = self.send(self.client.get(url).query(&[("name", name)])).await?;
        let list: FileList = Self::json(response).await?;
        Ok(list.files.into_iter().next())
    }

    async fn create(&self, folder: &str, name: &str, bytes: &[u8]) -> Result<RemoteFile, ProviderError> {
        let url = format!("{}/folders/{}/files", self.base_url, folder);
        let request = self
            .client
            .post(url)
            .query(&[("name", name)])
            .body(bytes.to_vec());
        Self::json(self.send(request).await?).await
    }

    async fn update(&self, id: &str, bytes: &[u8]) -> Result<RemoteFile, ProviderError> {
        let url = format!("{}/files/{}/content", self.base_url, id);
        Self::json(self.send(self.client.put(url).body(bytes.to_vec())).await?).await
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, ProviderError> {
        let url = format!("{}/files/{}/content", self.base_url, id);
        let response = self.send(self.client.get(url)).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

// ==================== In memory ====================

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<String, MemoryFile>,
    next_id: u64,
    required_token: Option<String>,
    offline: bool,
    max_bytes: Option<usize>,
    writes: usize,
}

#[derive(Debug, Clone)]
struct MemoryFile {
    folder: String,
    name: String,
    bytes: Vec<u8>,
    modified_ms: i64,
}

/// In-memory file store; clones share the same files
#[derive(Debug, Clone, Default)]
pub struct MemoryFileStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept this token
    pub fn with_token(self, token: &str) -> Self {
        self.lock().required_token = Some(token.to_string());
        self
    }

    /// Reject writes larger than `max_bytes`
    pub fn with_capacity(self, max_bytes: usize) -> Self {
        self.lock().max_bytes = Some(max_bytes);
        self
    }

    /// Fail every call with a network error while offline
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn file_count(&self) -> usize {
        self.lock().files.len()
    }

    /// Number of create/update calls that succeeded
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Content of a file by name
    pub fn read(&self, name: &str) -> Option<Vec<u8>> {
        self.lock()
            .files
            .values()
            .find(|f| f.name == name)
            .map(|f| f.bytes.clone())
    }

    /// Delete a file behind the provider's back
    pub fn remove(&self, name: &str) {
        self.lock().files.retain(|_, f| f.name != name);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, state: &MemoryState, bytes: Option<&[u8]>) -> Result<(), ProviderError> {
        if state.offline {
            return Err(ProviderError::Network("store offline".to_string()));
        }
        if let (Some(max), Some(bytes)) = (state.max_bytes, bytes) {
            if bytes.len() > max {
                return Err(ProviderError::Capacity(format!("{} > {} bytes", bytes.len(), max)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn authenticate(&mut self, token: &str) -> Result<(), ProviderError> {
        let state = self.lock();
        self.check(&state, None)?;
        match &state.required_token {
            Some(required) if required != token => {
                Err(ProviderError::Authentication("invalid token".to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn find(&self, folder: &str, name: &str) -> Result<Option<RemoteFile>, ProviderError> {
        let state = self.lock();
        self.check(&state, None)?;
        Ok(state
            .files
            .iter()
            .find(|(_, f)| f.folder == folder && f.name == name)
            .map(|(id, f)| RemoteFile {
                id: id.clone(),
                modified_ms: f.modified_ms,
            }))
    }

    async fn create(&self, folder: &str, name: &str, bytes: &[u8]) -> Result<RemoteFile, ProviderError> {
        let mut state = self.lock();
        self.check(&state, Some(bytes))?;

        state.next_id += 1;
        let id = format!("file-{}", state.next_id);
        let modified_ms = now_ms();
        state.files.insert(
            id.clone(),
            MemoryFile {
                folder: folder.to_string(),
                name: name.to_string(),
                bytes: bytes.to_vec(),
                modified_ms,
            },
        );
        state.writes += 1;
        debug!(id = %id, name, "Created file");
        Ok(RemoteFile { id, modified_ms })
    }

    async fn update(&self, id: &str, bytes: &[u8]) -> Result<RemoteFile, ProviderError> {
        let mut state = self.lock();
        self.check(&state, Some(bytes))?;

        let modified_ms = now_ms();
        let file = state
            .files
            .get_mut(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        file.bytes = bytes.to_vec();
        file.modified_ms = modified_ms;
        state.writes += 1;
        Ok(RemoteFile {
            id: id.to_string(),
            modified_ms,
        })
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, ProviderError> {
        let state = self.lock();
        self.check(&state, None)?;
        state
            .files
            .get(id)
            .map(|f| f.bytes.clone())
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }
}

// ==================== Shared slot logic ====================

/// One well-known file in the store, with authentication and a cached id
///
/// Shared by the snapshot and manifest providers, which differ only in the
/// file name and what they put in it.
pub(crate) struct FileSlot {
    store: Box<dyn FileStore>,
    name: &'static str,
    config: Option<ProviderConfig>,
    authenticated: bool,
    file_id: Option<String>,
}

impl FileSlot {
    pub(crate) fn new(store: Box<dyn FileStore>, name: &'static str) -> Self {
        Self {
            store,
            name,
            config: None,
            authenticated: false,
            file_id: None,
        }
    }

    pub(crate) async fn initialize(&mut self, config: &ProviderConfig) -> Result<(), ProviderError> {
        if self.authenticated && self.config.as_ref() == Some(config) {
            return Ok(());
        }

        let token = config.require_token()?;
        self.authenticated = false;
        self.file_id = None;
        self.store.authenticate(token).await?;

        self.config = Some(config.clone());
        self.authenticated = true;
        debug!(file = self.name, "File store authenticated");
        Ok(())
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub(crate) fn config(&self) -> Result<&ProviderConfig, ProviderError> {
        match (&self.config, self.authenticated) {
            (Some(config), true) => Ok(config),
            _ => Err(ProviderError::Authentication("provider not initialized".to_string())),
        }
    }

    pub(crate) fn sign_out(&mut self) {
        self.authenticated = false;
        self.file_id = None;
    }

    async fn locate(&mut self) -> Result<Option<RemoteFile>, ProviderError> {
        let folder = self.config()?.folder.clone();
        let found = self.store.find(&folder, self.name).await?;
        self.file_id = found.as_ref().map(|f| f.id.clone());
        Ok(found)
    }

    pub(crate) async fn upload(&mut self, bytes: &[u8]) -> Result<(), ProviderError> {
        let folder = self.config()?.folder.clone();

        let id = match &self.file_id {
            Some(id) => Some(id.clone()),
            None => self.locate().await?.map(|f| f.id),
        };

        let written = match id {
            Some(id) => match self.store.update(&id, bytes).await {
                Err(ProviderError::NotFound(_)) => {
                    debug!(file = self.name, "Cached file vanished, recreating");
                    self.store.create(&folder, self.name, bytes).await?
                }
                other => other?,
            },
            None => self.store.create(&folder, self.name, bytes).await?,
        };

        self.file_id = Some(written.id);
        Ok(())
    }

    pub(crate) async fn download(&mut self) -> Result<Option<Vec<u8>>, ProviderError> {
        self.config()?;

        let id = match &self.file_id {
            Some(id) => id.clone(),
            None => match self.locate().await? {
                Some(file) => file.id,
                None => return Ok(None),
            },
        };

        match self.store.download(&id).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(ProviderError::NotFound(_)) => {
                self.file_id = None;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn last_modified(&mut self) -> Result<Option<i64>, ProviderError> {
        self.config()?;
        Ok(self.locate().await?.map(|f| f.modified_ms))
    }
}
