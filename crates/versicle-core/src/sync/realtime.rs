//! Realtime backend
//!
//! A long-lived subscription to the user's document path. Local commits are
//! published as they happen and remote updates are merged as they arrive.
//! Handles reconnection automatically with exponential backoff.
//!
//! The wire format is in [`super::message`]. [`WebSocketTransport`] carries
//! it over a WebSocket; [`MockRealtimeHub`] is an in-process backend for
//! tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_bytes::ByteBuf;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::message::{ClientMessage, ProbeResult, ServerMessage};
use crate::document::{DocumentHandle, SharedDocument, UpdateOrigin};
use crate::models::now_ms;
use crate::provider::{
    ProviderConfig, ProviderError, ProviderErrorKind, ProviderEvent, RemoteStorageProvider, SaveRejection,
};

/// Initial reconnect delay
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Maximum reconnect delay
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// How long to wait for a reply to a request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ==================== Transport ====================

/// Opens connections to the realtime backend
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RealtimeChannel>, ProviderError>;
}

/// One open connection
#[async_trait]
pub trait RealtimeChannel: Send {
    async fn send(&mut self, msg: &ClientMessage) -> Result<(), ProviderError>;

    /// Next server message; `None` once the connection is closed
    async fn recv(&mut self) -> Result<Option<ServerMessage>, ProviderError>;

    async fn close(&mut self);
}

/// CBOR messages over a WebSocket
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: &str) -> Self {
        Self { url: url.to_string() }
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn connect(&self) -> Result<Box<dyn RealtimeChannel>, ProviderError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ProviderError::Network(format!("Failed to connect to {}: {}", self.url, e)))?;
        Ok(Box::new(WebSocketChannel { stream }))
    }
}

struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeChannel for WebSocketChannel {
    async fn send(&mut self, msg: &ClientMessage) -> Result<(), ProviderError> {
        let bytes = msg.encode().map_err(|e| ProviderError::Protocol(e.to_string()))?;
        self.stream
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>, ProviderError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(e) => debug!("Ignoring undecodable server message: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ProviderError::Network(e.to_string())),
            }
        }
    }

    async fn close(&mut self) {
        self.stream.close(None).await.ok();
    }
}

// ==================== Endpoint ====================

/// The user's document path on a transport, with credentials
#[derive(Clone)]
pub struct RealtimeEndpoint {
    transport: Arc<dyn RealtimeTransport>,
    path: String,
    token: String,
}

impl RealtimeEndpoint {
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: &ProviderConfig) -> Result<Self, ProviderError> {
        let token = config.require_token()?.to_string();
        let user_id = config
            .user_id
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ProviderError::Configuration("missing user id".to_string()))?;

        Ok(Self {
            transport,
            path: document_path(user_id, &config.environment),
            token,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Connect and subscribe to the document path
    pub async fn connect(&self) -> Result<Box<dyn RealtimeChannel>, ProviderError> {
        let mut channel = self.transport.connect().await?;
        channel
            .send(&ClientMessage::Subscribe {
                path: self.path.clone(),
                token: self.token.clone(),
            })
            .await?;

        let result = wait_for_reply(channel.as_mut(), |msg| match msg {
            ServerMessage::Subscribed { .. } => Some(Ok(())),
            ServerMessage::Error { message } => Some(Err(ProviderError::Authentication(message))),
            _ => None,
        })
        .await;

        match result {
            Ok(()) => Ok(channel),
            Err(e) => {
                channel.close().await;
                Err(e)
            }
        }
    }

    /// Whether the path holds a document or pending updates
    pub async fn probe(&self) -> Result<ProbeResult, ProviderError> {
        let mut channel = self.connect().await?;
        let result = async {
            channel
                .send(&ClientMessage::Probe {
                    path: self.path.clone(),
                })
                .await?;
            wait_for_reply(channel.as_mut(), |msg| match msg {
                ServerMessage::ProbeResult {
                    has_document,
                    pending_updates,
                } => Some(Ok(ProbeResult {
                    has_document,
                    pending_updates,
                })),
                ServerMessage::Error { message } => Some(Err(ProviderError::Protocol(message))),
                _ => None,
            })
            .await
        }
        .await;
        channel.close().await;
        result
    }

    /// Fetch the merged state and its modification time
    pub async fn fetch(&self) -> Result<(Option<Vec<u8>>, Option<i64>), ProviderError> {
        let mut channel = self.connect().await?;
        let result = self.request_snapshot(channel.as_mut()).await;
        channel.close().await;
        result
    }

    /// Publish a full document state and wait until the backend took it
    pub async fn publish(&self, bytes: &[u8]) -> Result<(), ProviderError> {
        let mut channel = self.connect().await?;
        let result = async {
            channel.send(&ClientMessage::update(&self.path, bytes.to_vec())).await?;
            // The snapshot reply is ordered after the update's outcome
            self.request_snapshot(channel.as_mut()).await.map(|_| ())
        }
        .await;
        channel.close().await;
        result
    }

    async fn request_snapshot(
        &self,
        channel: &mut dyn RealtimeChannel,
    ) -> Result<(Option<Vec<u8>>, Option<i64>), ProviderError> {
        channel
            .send(&ClientMessage::Snapshot {
                path: self.path.clone(),
            })
            .await?;
        wait_for_reply(channel, |msg| match msg {
            ServerMessage::Snapshot { data, last_modified } => {
                Some(Ok((data.map(ByteBuf::into_vec), last_modified)))
            }
            ServerMessage::SaveRejected { reason, details } => Some(Err(rejection_error(reason, details))),
            ServerMessage::Error { message } => Some(Err(ProviderError::Protocol(message))),
            _ => None,
        })
        .await
    }

    /// Start a live session merging into `doc`
    pub fn attach(&self, doc: DocumentHandle, events: mpsc::UnboundedSender<ProviderEvent>) -> RealtimeSession {
        let (command_tx, command_rx) = mpsc::channel(16);
        let task = tokio::spawn(session_loop(self.clone(), doc, command_rx, events));
        RealtimeSession { command_tx, task }
    }
}

/// Path of a user's document
pub fn document_path(user_id: &str, environment: &str) -> String {
    format!("users/{}/versicle/{}", user_id, environment)
}

fn rejection_error(reason: SaveRejection, details: String) -> ProviderError {
    match reason {
        SaveRejection::PayloadTooLarge => ProviderError::Capacity(details),
        SaveRejection::RetryExhausted => ProviderError::Network(format!("retries exhausted: {}", details)),
    }
}

/// Wait for the first message `f` maps to a result
async fn wait_for_reply<T>(
    channel: &mut dyn RealtimeChannel,
    mut f: impl FnMut(ServerMessage) -> Option<Result<T, ProviderError>> + Send,
) -> Result<T, ProviderError>
where
    T: Send,
{
    let wait = async {
        loop {
            match channel.recv().await? {
                Some(msg) => {
                    if let Some(result) = f(msg) {
                        return result;
                    }
                }
                None => {
                    return Err(ProviderError::Network(
                        "Realtime backend closed connection".to_string(),
                    ))
                }
            }
        }
    };

    tokio::time::timeout(REQUEST_TIMEOUT, wait)
        .await
        .map_err(|_| ProviderError::Network("Timeout waiting for realtime backend".to_string()))?
}

// ==================== Session ====================

/// Commands sent to the session task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Publish the full local state now
    PushState,
    Shutdown,
}

/// Handle to a running live session
pub struct RealtimeSession {
    command_tx: mpsc::Sender<SessionCommand>,
    task: JoinHandle<()>,
}

impl RealtimeSession {
    pub async fn push(&self) {
        let _ = self.command_tx.send(SessionCommand::PushState).await;
    }

    /// Stop the session and wait for the connection to close
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(SessionCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("Realtime session task failed: {}", e);
        }
    }
}

/// Session loop with reconnection
async fn session_loop(
    endpoint: RealtimeEndpoint,
    doc: DocumentHandle,
    mut command_rx: mpsc::Receiver<SessionCommand>,
    events: mpsc::UnboundedSender<ProviderEvent>,
) {
    let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

    loop {
        match run_connection(&endpoint, &doc, &mut command_rx, &events).await {
            Ok(true) => break,
            Ok(false) => {
                // Closed by the backend, reset backoff
                reconnect_delay = INITIAL_RECONNECT_DELAY;
            }
            Err(e) => {
                warn!(path = %endpoint.path, "Realtime connection error: {}", e);
                let fatal = matches!(
                    e.kind(),
                    ProviderErrorKind::Authentication | ProviderErrorKind::Configuration
                );
                let _ = events.send(ProviderEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                if fatal {
                    return;
                }
            }
        }

        let _ = events.send(ProviderEvent::Disconnected);

        // Wait before reconnecting, but check for shutdown
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {
                reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
            }
            cmd = command_rx.recv() => match cmd {
                Some(SessionCommand::Shutdown) | None => return,
                // State is published on reconnect anyway
                Some(SessionCommand::PushState) => {}
            }
        }
    }

    let _ = events.send(ProviderEvent::Disconnected);
}

/// Run one connection until it closes; `Ok(true)` means shut down
async fn run_connection(
    endpoint: &RealtimeEndpoint,
    doc: &DocumentHandle,
    command_rx: &mut mpsc::Receiver<SessionCommand>,
    events: &mpsc::UnboundedSender<ProviderEvent>,
) -> Result<bool, ProviderError> {
    let mut channel = endpoint.connect().await?;
    let mut updates = doc.lock().await.subscribe();

    info!(path = %endpoint.path, "Realtime session connected");
    let _ = events.send(ProviderEvent::Connected);
    publish_state(channel.as_mut(), endpoint, doc).await?;

    loop {
        tokio::select! {
            cmd = command_rx.recv() => match cmd {
                Some(SessionCommand::PushState) => publish_state(channel.as_mut(), endpoint, doc).await?,
                Some(SessionCommand::Shutdown) | None => {
                    channel.close().await;
                    return Ok(true);
                }
            },

            update = updates.recv() => match update {
                Ok(update) if update.origin != UpdateOrigin::Remote => {
                    publish_state(channel.as_mut(), endpoint, doc).await?;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Document notifications lagged, publishing full state");
                    publish_state(channel.as_mut(), endpoint, doc).await?;
                }
                Err(RecvError::Closed) => {
                    channel.close().await;
                    return Ok(true);
                }
            },

            msg = channel.recv() => match msg? {
                Some(msg) => handle_server_message(msg, doc, events).await,
                None => return Ok(false),
            },
        }
    }
}

async fn publish_state(
    channel: &mut dyn RealtimeChannel,
    endpoint: &RealtimeEndpoint,
    doc: &DocumentHandle,
) -> Result<(), ProviderError> {
    let bytes = doc.lock().await.encode_state();
    debug!(bytes = bytes.len(), "Publishing document state");
    channel.send(&ClientMessage::update(&endpoint.path, bytes)).await
}

async fn handle_server_message(
    msg: ServerMessage,
    doc: &DocumentHandle,
    events: &mpsc::UnboundedSender<ProviderEvent>,
) {
    let event = match msg {
        ServerMessage::Update { data } => match doc.lock().await.apply_update(&data) {
            Ok(_) => ProviderEvent::Synced,
            Err(e) => {
                warn!("Failed to merge realtime update: {}", e);
                ProviderEvent::Error {
                    kind: ProviderErrorKind::Protocol,
                    message: e.to_string(),
                }
            }
        },
        ServerMessage::SaveRejected { reason, details } => {
            warn!(?reason, "Backend rejected save: {}", details);
            ProviderEvent::SaveRejected { kind: reason, details }
        }
        ServerMessage::SyncFailed { attempts } => ProviderEvent::Error {
            kind: ProviderErrorKind::Network,
            message: format!("Sync failed after {} attempts", attempts),
        },
        ServerMessage::Error { message } => ProviderEvent::Error {
            kind: ProviderErrorKind::Protocol,
            message,
        },
        _ => return,
    };
    let _ = events.send(event);
}

// ==================== Provider ====================

/// Snapshot-style access to the realtime backend
pub struct RealtimeProvider {
    transport: Arc<dyn RealtimeTransport>,
    config: Option<ProviderConfig>,
    endpoint: Option<RealtimeEndpoint>,
}

impl RealtimeProvider {
    pub fn new(transport: impl RealtimeTransport + 'static) -> Self {
        Self::with_transport(Arc::new(transport))
    }

    pub fn with_transport(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self {
            transport,
            config: None,
            endpoint: None,
        }
    }

    fn endpoint(&self) -> Result<&RealtimeEndpoint, ProviderError> {
        self.endpoint
            .as_ref()
            .ok_or_else(|| ProviderError::Authentication("provider not initialized".to_string()))
    }
}

#[async_trait]
impl RemoteStorageProvider for RealtimeProvider {
    fn name(&self) -> &'static str {
        "realtime"
    }

    async fn initialize(&mut self, config: &ProviderConfig) -> Result<(), ProviderError> {
        if self.endpoint.is_some() && self.config.as_ref() == Some(config) {
            return Ok(());
        }

        self.endpoint = None;
        let endpoint = RealtimeEndpoint::new(self.transport.clone(), config)?;
        let mut channel = endpoint.connect().await?;
        channel.close().await;

        self.config = Some(config.clone());
        self.endpoint = Some(endpoint);
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        self.endpoint.is_some()
    }

    async fn upload_snapshot(&mut self, bytes: &[u8]) -> Result<(), ProviderError> {
        self.endpoint()?.publish(bytes).await
    }

    async fn download_snapshot(&mut self) -> Result<Option<Vec<u8>>, ProviderError> {
        Ok(self.endpoint()?.fetch().await?.0)
    }

    async fn get_last_modified(&mut self) -> Result<Option<i64>, ProviderError> {
        Ok(self.endpoint()?.fetch().await?.1)
    }

    fn sign_out(&mut self) {
        self.endpoint = None;
        self.config = None;
    }
}

// ==================== In-process backend ====================

struct HubConnection {
    tx: mpsc::UnboundedSender<ServerMessage>,
    path: Option<String>,
}

struct HubPath {
    doc: SharedDocument,
    has_data: bool,
    updates: u64,
    last_modified: Option<i64>,
}

impl HubPath {
    fn new() -> Self {
        Self {
            doc: SharedDocument::new(),
            has_data: false,
            updates: 0,
            last_modified: None,
        }
    }
}

#[derive(Default)]
struct HubState {
    paths: HashMap<String, HubPath>,
    connections: HashMap<u64, HubConnection>,
    required_token: Option<String>,
    offline: bool,
    rejection: Option<(SaveRejection, String)>,
    max_update_bytes: Option<usize>,
    withhold_state: bool,
}

/// In-process realtime backend
///
/// Merges every published state per path and forwards changes to the other
/// subscribers of the path. Clones share the same backend.
#[derive(Clone, Default)]
pub struct MockRealtimeHub {
    state: Arc<StdMutex<HubState>>,
    next_id: Arc<AtomicU64>,
}

impl MockRealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept this token
    pub fn with_token(self, token: &str) -> Self {
        self.lock().required_token = Some(token.to_string());
        self
    }

    /// Refuse new connections
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Reject every update with the given reason
    pub fn reject_saves(&self, rejection: Option<(SaveRejection, String)>) {
        self.lock().rejection = rejection;
    }

    /// Reject updates larger than `max_bytes` as too large
    pub fn set_max_update_bytes(&self, max_bytes: Option<usize>) {
        self.lock().max_update_bytes = max_bytes;
    }

    /// Do not send the stored state to new subscribers
    pub fn withhold_state(&self, withhold: bool) {
        self.lock().withhold_state = withhold;
    }

    /// Store state on a path as if another client had published it
    pub fn seed(&self, path: &str, bytes: &[u8]) -> Result<(), ProviderError> {
        let mut state = self.lock();
        let entry = state.paths.entry(path.to_string()).or_insert_with(HubPath::new);
        entry
            .doc
            .apply_update(bytes)
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;
        entry.has_data = true;
        entry.updates += 1;
        entry.last_modified = Some(now_ms());
        Ok(())
    }

    /// Merged state stored for a path
    pub fn document(&self, path: &str) -> Option<Vec<u8>> {
        let mut state = self.lock();
        state
            .paths
            .get_mut(path)
            .filter(|p| p.has_data)
            .map(|p| p.doc.encode_state())
    }

    /// Tell every subscriber of `path` that persisting failed
    pub fn fail_sync(&self, path: &str, attempts: u32) {
        let state = self.lock();
        for conn in state.connections.values() {
            if conn.path.as_deref() == Some(path) {
                let _ = conn.tx.send(ServerMessage::SyncFailed { attempts });
            }
        }
    }

    /// Drop every open connection
    pub fn disconnect_all(&self) {
        self.lock().connections.clear();
    }

    pub fn subscriber_count(&self, path: &str) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|c| c.path.as_deref() == Some(path))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn unregister(&self, id: u64) {
        self.lock().connections.remove(&id);
    }

    fn handle(&self, id: u64, msg: &ClientMessage) -> Result<(), ProviderError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(conn) = state.connections.get(&id) else {
            return Err(ProviderError::Network("connection closed".to_string()));
        };
        let reply = conn.tx.clone();
        let send = |msg: ServerMessage| {
            let _ = reply.send(msg);
        };

        match msg {
            ClientMessage::Subscribe { path, token } => {
                if let Some(required) = &state.required_token {
                    if required != token {
                        send(ServerMessage::Error {
                            message: "permission denied".to_string(),
                        });
                        return Ok(());
                    }
                }
                if let Some(conn) = state.connections.get_mut(&id) {
                    conn.path = Some(path.clone());
                }
                send(ServerMessage::Subscribed { path: path.clone() });

                let entry = state.paths.entry(path.clone()).or_insert_with(HubPath::new);
                if entry.has_data && !state.withhold_state {
                    send(ServerMessage::Update {
                        data: entry.doc.encode_state(),
                    });
                }
            }
            ClientMessage::Update { path, data } => {
                if let Some(max) = state.max_update_bytes.filter(|max| data.len() > *max) {
                    send(ServerMessage::SaveRejected {
                        reason: SaveRejection::PayloadTooLarge,
                        details: format!("{} bytes exceeds the {} byte limit", data.len(), max),
                    });
                    return Ok(());
                }
                if let Some((reason, details)) = &state.rejection {
                    send(ServerMessage::SaveRejected {
                        reason: *reason,
                        details: details.clone(),
                    });
                    return Ok(());
                }

                let entry = state.paths.entry(path.clone()).or_insert_with(HubPath::new);
                match entry.doc.apply_update(data) {
                    Err(e) => send(ServerMessage::Error {
                        message: e.to_string(),
                    }),
                    Ok(false) => {}
                    Ok(true) => {
                        entry.has_data = true;
                        entry.updates += 1;
                        entry.last_modified = Some(now_ms());
                        let merged = entry.doc.encode_state();
                        for (other_id, other) in &state.connections {
                            if *other_id != id && other.path.as_deref() == Some(path.as_str()) {
                                let _ = other.tx.send(ServerMessage::Update { data: merged.clone() });
                            }
                        }
                    }
                }
            }
            ClientMessage::Probe { path } => {
                let (has_document, pending_updates) = state
                    .paths
                    .get(path)
                    .map(|p| (p.has_data, p.updates))
                    .unwrap_or((false, 0));
                send(ServerMessage::ProbeResult {
                    has_document,
                    pending_updates,
                });
            }
            ClientMessage::Snapshot { path } => {
                let (data, last_modified) = match state.paths.get_mut(path) {
                    Some(p) if p.has_data => (Some(ByteBuf::from(p.doc.encode_state())), p.last_modified),
                    _ => (None, None),
                };
                send(ServerMessage::Snapshot { data, last_modified });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RealtimeTransport for MockRealtimeHub {
    async fn connect(&self) -> Result<Box<dyn RealtimeChannel>, ProviderError> {
        let mut state = self.lock();
        if state.offline {
            return Err(ProviderError::Network("realtime backend unreachable".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, inbox) = mpsc::unbounded_channel();
        state.connections.insert(id, HubConnection { tx, path: None });

        Ok(Box::new(MockChannel {
            hub: self.clone(),
            id,
            inbox,
        }))
    }
}

struct MockChannel {
    hub: MockRealtimeHub,
    id: u64,
    inbox: mpsc::UnboundedReceiver<ServerMessage>,
}

#[async_trait]
impl RealtimeChannel for MockChannel {
    async fn send(&mut self, msg: &ClientMessage) -> Result<(), ProviderError> {
        self.hub.handle(self.id, msg)
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>, ProviderError> {
        Ok(self.inbox.recv().await)
    }

    async fn close(&mut self) {
        self.hub.unregister(self.id);
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PATH: &str = "users/u1/versicle/production";

    fn config() -> ProviderConfig {
        ProviderConfig {
            access_token: Some("token".into()),
            user_id: Some("u1".into()),
            environment: "production".into(),
            device_id: "laptop".into(),
            ..ProviderConfig::default()
        }
    }

    fn endpoint(hub: &MockRealtimeHub) -> RealtimeEndpoint {
        RealtimeEndpoint::new(Arc::new(hub.clone()), &config()).unwrap()
    }

    async fn wait_until<F>(doc: &DocumentHandle, mut check: F)
    where
        F: FnMut(&SharedDocument) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if check(&*doc.lock().await) {
                return;
            }
            assert!(tokio::time::Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ProviderEvent>) -> ProviderEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_document_path() {
        assert_eq!(document_path("u1", "production"), PATH);
    }

    #[test]
    fn test_endpoint_requires_credentials() {
        let hub: Arc<dyn RealtimeTransport> = Arc::new(MockRealtimeHub::new());

        let mut missing_user = config();
        missing_user.user_id = None;
        assert!(matches!(
            RealtimeEndpoint::new(hub.clone(), &missing_user),
            Err(ProviderError::Configuration(_))
        ));

        let mut missing_token = config();
        missing_token.access_token = None;
        assert!(matches!(
            RealtimeEndpoint::new(hub, &missing_token),
            Err(ProviderError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_provider_rejects_bad_token() {
        let hub = MockRealtimeHub::new().with_token("secret");
        let mut provider = RealtimeProvider::new(hub);
        let result = provider.initialize(&config()).await;
        assert!(matches!(result, Err(ProviderError::Authentication(_))));
        assert!(!provider.is_authenticated());
    }

    #[tokio::test]
    async fn test_provider_round_trip() {
        let hub = MockRealtimeHub::new();
        let mut provider = RealtimeProvider::new(hub.clone());
        provider.initialize(&config()).await.unwrap();

        assert!(provider.download_snapshot().await.unwrap().is_none());
        assert!(provider.get_last_modified().await.unwrap().is_none());

        let mut doc = SharedDocument::new();
        doc.transact(|tx| tx.set("library", "moby", &json!({ "title": "Moby Dick" })))
            .unwrap();
        provider.upload_snapshot(&doc.encode_state()).await.unwrap();

        let bytes = provider.download_snapshot().await.unwrap().unwrap();
        let remote = SharedDocument::load(&bytes).unwrap();
        assert!(remote.get("library", "moby").unwrap().is_some());
        assert!(provider.get_last_modified().await.unwrap().is_some());
        assert_eq!(hub.subscriber_count(PATH), 0);
    }

    #[tokio::test]
    async fn test_provider_upload_too_large() {
        let hub = MockRealtimeHub::new();
        hub.set_max_update_bytes(Some(8));
        let mut provider = RealtimeProvider::new(hub);
        provider.initialize(&config()).await.unwrap();

        let bytes = SharedDocument::new().encode_state();
        let err = provider.upload_snapshot(&bytes).await.unwrap_err();
        assert_eq!(err.kind(), ProviderErrorKind::Capacity);
    }

    #[tokio::test]
    async fn test_probe() {
        let hub = MockRealtimeHub::new();
        let endpoint = endpoint(&hub);
        assert!(!endpoint.probe().await.unwrap().has_data());

        let mut doc = SharedDocument::new();
        doc.transact(|tx| tx.set("library", "a", &json!({ "title": "A" })))
            .unwrap();
        hub.seed(PATH, &doc.encode_state()).unwrap();

        let probe = endpoint.probe().await.unwrap();
        assert!(probe.has_document);
        assert_eq!(probe.pending_updates, 1);
    }

    #[tokio::test]
    async fn test_sessions_exchange_updates() {
        let hub = MockRealtimeHub::new();
        let endpoint = endpoint(&hub);

        let laptop = SharedDocument::new().into_handle();
        let phone = SharedDocument::new().into_handle();
        let (laptop_tx, mut laptop_events) = mpsc::unbounded_channel();
        let (phone_tx, mut phone_events) = mpsc::unbounded_channel();

        let laptop_session = endpoint.attach(laptop.clone(), laptop_tx);
        assert_eq!(next_event(&mut laptop_events).await, ProviderEvent::Connected);
        let phone_session = endpoint.attach(phone.clone(), phone_tx);
        assert_eq!(next_event(&mut phone_events).await, ProviderEvent::Connected);

        laptop
            .lock()
            .await
            .transact(|tx| tx.set("library", "moby", &json!({ "title": "Moby Dick" })))
            .unwrap();

        wait_until(&phone, |doc| doc.get("library", "moby").unwrap().is_some()).await;
        assert_eq!(next_event(&mut phone_events).await, ProviderEvent::Synced);

        laptop_session.shutdown().await;
        phone_session.shutdown().await;
        assert_eq!(hub.subscriber_count(PATH), 0);
        assert!(hub.document(PATH).is_some());
    }

    #[tokio::test]
    async fn test_session_receives_existing_state() {
        let hub = MockRealtimeHub::new();
        let mut remote = SharedDocument::new();
        remote
            .transact(|tx| tx.set("library", "emma", &json!({ "title": "Emma" })))
            .unwrap();
        hub.seed(PATH, &remote.encode_state()).unwrap();

        let doc = SharedDocument::new().into_handle();
        let (tx, _events) = mpsc::unbounded_channel();
        let session = endpoint(&hub).attach(doc.clone(), tx);

        wait_until(&doc, |doc| doc.get("library", "emma").unwrap().is_some()).await;
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_reports_rejections() {
        let hub = MockRealtimeHub::new();
        hub.reject_saves(Some((SaveRejection::RetryExhausted, "offline".into())));

        let doc = SharedDocument::new().into_handle();
        let (tx, mut events) = mpsc::unbounded_channel();
        let session = endpoint(&hub).attach(doc, tx);

        assert_eq!(next_event(&mut events).await, ProviderEvent::Connected);
        assert_eq!(
            next_event(&mut events).await,
            ProviderEvent::SaveRejected {
                kind: SaveRejection::RetryExhausted,
                details: "offline".into(),
            }
        );

        hub.fail_sync(PATH, 5);
        match next_event(&mut events).await {
            ProviderEvent::Error { kind, message } => {
                assert_eq!(kind, ProviderErrorKind::Network);
                assert!(message.contains('5'));
            }
            other => panic!("Expected error event, got {:?}", other),
        }

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_stops_on_bad_credentials() {
        let hub = MockRealtimeHub::new().with_token("secret");
        let doc = SharedDocument::new().into_handle();
        let (tx, mut events) = mpsc::unbounded_channel();
        let session = endpoint(&hub).attach(doc, tx);

        match next_event(&mut events).await {
            ProviderEvent::Error { kind, .. } => assert_eq!(kind, ProviderErrorKind::Authentication),
            other => panic!("Expected error event, got {:?}", other),
        }
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_reconnects_after_drop() {
        let hub = MockRealtimeHub::new();
        let doc = SharedDocument::new().into_handle();
        let (tx, mut events) = mpsc::unbounded_channel();
        let session = endpoint(&hub).attach(doc, tx);

        assert_eq!(next_event(&mut events).await, ProviderEvent::Connected);
        hub.disconnect_all();

        assert_eq!(next_event(&mut events).await, ProviderEvent::Disconnected);
        assert_eq!(next_event(&mut events).await, ProviderEvent::Connected);
        session.shutdown().await;
    }
}
