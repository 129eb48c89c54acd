//! Realtime connection manager
//!
//! Ties the realtime session to the authentication state. Signing in takes a
//! safety checkpoint, bootstraps a clean client from the remote if needed,
//! then attaches the live document. Transport events are mapped onto a
//! connection state and forwarded as user-visible notifications.
//!
//! ## Clean-client bootstrap
//!
//! A device with an empty library must not push its empty state over the
//! user's data. When the remote has data, the manager first attaches a
//! temporary document, waits for the first update plus a short settle
//! window (bounded by a timeout), merges the temporary state into the live
//! document and only then attaches the live document.
//!
//! While attached, merged remote updates that touch the lexicon are
//! projected into the local lexicon table so a later push does not mirror
//! stale rules back into the document.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointService, PRE_SYNC_TRIGGER};
use crate::config::Config;
use crate::containers::names;
use crate::document::{DocumentHandle, DocumentUpdate, SharedDocument, UpdateOrigin};
use crate::provider::{ProviderConfig, ProviderError, ProviderEvent};
use crate::storage::SqliteLexiconStore;
use crate::sync::realtime::{RealtimeEndpoint, RealtimeSession, RealtimeTransport};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// What sign-in did before attaching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The local library already had content
    NotNeeded,
    /// The remote had nothing; this is the first device
    FirstDevice,
    /// Remote content was merged before attaching
    Hydrated,
    /// No update arrived in time; proceeding as first device
    TimedOut,
}

/// Timing knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub checkpoint_interval: Duration,
    pub bootstrap_timeout: Duration,
    pub settle_window: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(24 * 60 * 60),
            bootstrap_timeout: Duration::from_secs(8),
            settle_window: Duration::from_millis(500),
        }
    }
}

impl ConnectionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            checkpoint_interval: config.pre_sync_checkpoint_interval(),
            bootstrap_timeout: config.bootstrap_timeout(),
            settle_window: config.bootstrap_settle(),
        }
    }
}

struct ActiveSession {
    session: RealtimeSession,
    forwarder: JoinHandle<()>,
    projector: JoinHandle<()>,
}

pub struct ConnectionManager {
    transport: Arc<dyn RealtimeTransport>,
    doc: DocumentHandle,
    checkpoints: Arc<CheckpointService>,
    lexicon: Arc<SqliteLexiconStore>,
    options: ConnectionOptions,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    notify_tx: mpsc::UnboundedSender<ProviderEvent>,
    notify_rx: StdMutex<Option<mpsc::UnboundedReceiver<ProviderEvent>>>,
    active: Mutex<Option<ActiveSession>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        doc: DocumentHandle,
        checkpoints: Arc<CheckpointService>,
        lexicon: Arc<SqliteLexiconStore>,
        options: ConnectionOptions,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        Self {
            transport,
            doc,
            checkpoints,
            lexicon,
            options,
            state_tx: Arc::new(state_tx),
            state_rx,
            notify_tx,
            notify_rx: StdMutex::new(Some(notify_rx)),
            active: Mutex::new(None),
        }
    }

    /// Get the current state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Take the notification receiver (can only be called once)
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<ProviderEvent>> {
        self.notify_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Sign in and attach the live document
    ///
    /// Any previous session is torn down first.
    pub async fn sign_in(&self, config: &ProviderConfig) -> Result<BootstrapOutcome, ProviderError> {
        self.sign_out().await;
        self.set_state(ConnectionState::Connecting);

        {
            let mut doc = self.doc.lock().await;
            match self.checkpoints.create_automatic_checkpoint(
                &mut doc,
                PRE_SYNC_TRIGGER,
                self.options.checkpoint_interval,
            ) {
                Ok(Some(id)) => debug!(id, "Sign-in checkpoint created"),
                Ok(None) => {}
                Err(e) => warn!("Failed to create sign-in checkpoint: {}", e),
            }
        }

        let result = async {
            let endpoint = RealtimeEndpoint::new(self.transport.clone(), config)?;
            let outcome = self.bootstrap(&endpoint).await?;
            self.attach(&endpoint).await;
            Ok::<_, ProviderError>(outcome)
        }
        .await;

        if let Err(e) = &result {
            warn!("Sign-in failed: {}", e);
            self.set_state(ConnectionState::Error);
            let _ = self.notify_tx.send(ProviderEvent::Error {
                kind: e.kind(),
                message: e.to_string(),
            });
        }
        result
    }

    /// Tear down the session; local content is kept
    pub async fn sign_out(&self) {
        if let Some(active) = self.active.lock().await.take() {
            active.session.shutdown().await;
            active.forwarder.abort();
            active.projector.abort();
            info!("Signed out of realtime sync");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Ask the live session to publish the full local state
    pub async fn push(&self) {
        if let Some(active) = self.active.lock().await.as_ref() {
            active.session.push().await;
        }
    }

    async fn bootstrap(&self, endpoint: &RealtimeEndpoint) -> Result<BootstrapOutcome, ProviderError> {
        let empty = self
            .doc
            .lock()
            .await
            .is_library_empty()
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;
        if !empty {
            return Ok(BootstrapOutcome::NotNeeded);
        }

        let probe = endpoint.probe().await?;
        if !probe.has_data() {
            info!("Remote is empty, connecting as first device");
            return Ok(BootstrapOutcome::FirstDevice);
        }

        info!(pending_updates = probe.pending_updates, "Bootstrapping clean client from remote");
        let temp = SharedDocument::new().into_handle();
        let mut updates = temp.lock().await.subscribe();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let session = endpoint.attach(temp.clone(), events_tx);

        let settle = self.options.settle_window;
        let waited = tokio::time::timeout(self.options.bootstrap_timeout, async {
            loop {
                match updates.recv().await {
                    Ok(update) if update.origin == UpdateOrigin::Remote => break,
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
            tokio::time::sleep(settle).await;
        })
        .await;
        session.shutdown().await;

        if waited.is_err() {
            warn!(
                timeout_secs = self.options.bootstrap_timeout.as_secs(),
                "Bootstrap timed out, proceeding as first device"
            );
        }

        let bytes = temp.lock().await.encode_state();
        let merged = {
            let mut doc = self.doc.lock().await;
            let merged = doc
                .apply_update(&bytes)
                .map_err(|e| ProviderError::Protocol(e.to_string()))?;
            if merged {
                if let Err(e) = self.lexicon.project_from(&doc) {
                    warn!("Failed to project lexicon after bootstrap: {}", e);
                }
            }
            merged
        };

        Ok(if merged || waited.is_ok() {
            BootstrapOutcome::Hydrated
        } else {
            BootstrapOutcome::TimedOut
        })
    }

    async fn attach(&self, endpoint: &RealtimeEndpoint) {
        let updates = self.doc.lock().await.subscribe();
        let projector = project_remote_lexicon(self.doc.clone(), self.lexicon.clone(), updates);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = endpoint.attach(self.doc.clone(), events_tx);

        let state_tx = self.state_tx.clone();
        let notify_tx = self.notify_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let state = match &event {
                    ProviderEvent::Connected | ProviderEvent::Synced => ConnectionState::Connected,
                    ProviderEvent::Disconnected => ConnectionState::Disconnected,
                    ProviderEvent::Error { .. } | ProviderEvent::SaveRejected { .. } => ConnectionState::Error,
                };
                state_tx.send_replace(state);
                let _ = notify_tx.send(event);
            }
        });

        *self.active.lock().await = Some(ActiveSession {
            session,
            forwarder,
            projector,
        });
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

/// Rebuild the lexicon table whenever a merge or restore touches it
fn project_remote_lexicon(
    doc: DocumentHandle,
    lexicon: Arc<SqliteLexiconStore>,
    mut updates: broadcast::Receiver<DocumentUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) if update.origin != UpdateOrigin::Local && update.containers.contains(names::LEXICON) => {}
                Ok(_) => continue,
                // Missed notifications may have included the lexicon
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }

            let current = doc.lock().await;
            match lexicon.project_from(&current) {
                Ok(rules) => debug!(rules, "Lexicon projected after live update"),
                Err(e) => warn!("Failed to project lexicon after live update: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LexiconRule;
    use crate::provider::{ProviderErrorKind, SaveRejection};
    use crate::sync::realtime::{document_path, MockRealtimeHub};
    use serde_json::json;

    const PATH: &str = "users/u1/versicle/production";

    fn config() -> ProviderConfig {
        ProviderConfig {
            access_token: Some("token".into()),
            user_id: Some("u1".into()),
            environment: "production".into(),
            device_id: "phone".into(),
            ..ProviderConfig::default()
        }
    }

    fn manager(hub: &MockRealtimeHub) -> (ConnectionManager, DocumentHandle, Arc<CheckpointService>) {
        let (manager, doc, checkpoints, _) = manager_with_lexicon(hub);
        (manager, doc, checkpoints)
    }

    fn manager_with_lexicon(
        hub: &MockRealtimeHub,
    ) -> (ConnectionManager, DocumentHandle, Arc<CheckpointService>, Arc<SqliteLexiconStore>) {
        let doc = SharedDocument::new().into_handle();
        let checkpoints = Arc::new(CheckpointService::open_in_memory().unwrap());
        let lexicon = Arc::new(SqliteLexiconStore::open_in_memory().unwrap());
        let manager = ConnectionManager::new(
            Arc::new(hub.clone()),
            doc.clone(),
            checkpoints.clone(),
            lexicon.clone(),
            ConnectionOptions::default(),
        );
        (manager, doc, checkpoints, lexicon)
    }

    async fn wait_for_rules(lexicon: &SqliteLexiconStore, expected: i64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while lexicon.count().unwrap() != expected {
            assert!(tokio::time::Instant::now() < deadline, "lexicon never reached {} rules", expected);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn remote_library() -> Vec<u8> {
        let mut doc = SharedDocument::new();
        doc.transact(|tx| tx.set("library", "moby", &json!({ "title": "Moby Dick" })))
            .unwrap();
        doc.encode_state()
    }

    async fn wait_for_state(manager: &ConnectionManager, expected: ConnectionState) {
        let mut rx = manager.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == expected))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_sign_in_first_device() {
        let hub = MockRealtimeHub::new();
        let (manager, _doc, checkpoints) = manager(&hub);

        let outcome = manager.sign_in(&config()).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::FirstDevice);
        wait_for_state(&manager, ConnectionState::Connected).await;

        // Sign-in checkpoint
        assert_eq!(checkpoints.list_checkpoints().unwrap().len(), 1);

        manager.sign_out().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(hub.subscriber_count(PATH), 0);
    }

    #[tokio::test]
    async fn test_sign_in_with_content_skips_bootstrap() {
        let hub = MockRealtimeHub::new();
        hub.seed(PATH, &remote_library()).unwrap();
        let (manager, doc, _) = manager(&hub);
        doc.lock()
            .await
            .transact(|tx| tx.set("library", "emma", &json!({ "title": "Emma" })))
            .unwrap();

        let outcome = manager.sign_in(&config()).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::NotNeeded);
        manager.sign_out().await;
    }

    #[tokio::test]
    async fn test_clean_client_bootstrap_hydrates() {
        let hub = MockRealtimeHub::new();
        hub.seed(PATH, &remote_library()).unwrap();
        let (manager, doc, _) = manager(&hub);

        let outcome = manager.sign_in(&config()).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Hydrated);
        assert!(doc.lock().await.get("library", "moby").unwrap().is_some());

        manager.sign_out().await;
        // The remote was not overwritten by an empty state
        let remote = SharedDocument::load(&hub.document(PATH).unwrap()).unwrap();
        assert!(remote.get("library", "moby").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_timeout_proceeds_as_first_device() {
        let hub = MockRealtimeHub::new();
        hub.seed(PATH, &remote_library()).unwrap();
        hub.withhold_state(true);
        let (manager, doc, _) = manager(&hub);

        let start = tokio::time::Instant::now();
        let outcome = manager.sign_in(&config()).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(8));
        assert!(doc.lock().await.is_library_empty().unwrap());
        manager.sign_out().await;
    }

    #[tokio::test]
    async fn test_sign_in_requires_credentials() {
        let hub = MockRealtimeHub::new();
        let (manager, _, _) = manager(&hub);
        let mut notifications = manager.take_notifications().unwrap();
        assert!(manager.take_notifications().is_none());

        let err = manager.sign_in(&ProviderConfig::default()).await.unwrap_err();
        assert_eq!(err.kind(), ProviderErrorKind::Configuration);
        assert_eq!(manager.state(), ConnectionState::Error);
        assert!(matches!(
            notifications.recv().await,
            Some(ProviderEvent::Error {
                kind: ProviderErrorKind::Configuration,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_save_rejection_notifies_and_sets_error() {
        let hub = MockRealtimeHub::new();
        let (manager, doc, _) = manager(&hub);
        let mut notifications = manager.take_notifications().unwrap();

        manager.sign_in(&config()).await.unwrap();
        wait_for_state(&manager, ConnectionState::Connected).await;

        hub.set_max_update_bytes(Some(8));
        doc.lock()
            .await
            .transact(|tx| tx.set("library", "big", &json!({ "title": "War and Peace" })))
            .unwrap();
        wait_for_state(&manager, ConnectionState::Error).await;

        let mut rejected = false;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), notifications.recv()).await {
            if let ProviderEvent::SaveRejected { kind, .. } = event {
                assert_eq!(kind, SaveRejection::PayloadTooLarge);
                rejected = true;
                break;
            }
        }
        assert!(rejected);
        manager.sign_out().await;
    }

    #[tokio::test]
    async fn test_live_edits_reach_remote() {
        let hub = MockRealtimeHub::new();
        let (manager, doc, _) = manager(&hub);
        manager.sign_in(&config()).await.unwrap();
        wait_for_state(&manager, ConnectionState::Connected).await;

        doc.lock()
            .await
            .transact(|tx| tx.set("library", "emma", &json!({ "title": "Emma" })))
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(bytes) = hub.document(&document_path("u1", "production")) {
                let remote = SharedDocument::load(&bytes).unwrap();
                if remote.get("library", "emma").unwrap().is_some() {
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.sign_out().await;
    }

    #[tokio::test]
    async fn test_remote_lexicon_changes_reach_local_table() {
        let hub = MockRealtimeHub::new();
        let (phone, _phone_doc, _, phone_lexicon) = manager_with_lexicon(&hub);
        let (laptop, laptop_doc, _, _) = manager_with_lexicon(&hub);
        phone.sign_in(&config()).await.unwrap();
        laptop.sign_in(&config()).await.unwrap();
        wait_for_state(&phone, ConnectionState::Connected).await;
        wait_for_state(&laptop, ConnectionState::Connected).await;

        let rule = LexiconRule::new("Ahab", "Captain Ahab");
        laptop_doc
            .lock()
            .await
            .transact(|tx| tx.put_record(&rule))
            .unwrap();
        wait_for_rules(&phone_lexicon, 1).await;

        // A deletion on another device must not be resurrected locally
        laptop_doc
            .lock()
            .await
            .transact(|tx| tx.delete(names::LEXICON, &rule.id))
            .unwrap();
        wait_for_rules(&phone_lexicon, 0).await;

        phone.sign_out().await;
        laptop.sign_out().await;
    }

    #[tokio::test]
    async fn test_bootstrap_projects_remote_lexicon() {
        let hub = MockRealtimeHub::new();
        let mut remote = SharedDocument::new();
        remote
            .transact(|tx| {
                tx.set("library", "moby", &json!({ "title": "Moby Dick" }))?;
                tx.put_record(&LexiconRule::new("Dr.", "Doctor"))
            })
            .unwrap();
        hub.seed(PATH, &remote.encode_state()).unwrap();
        let (manager, _doc, _, lexicon) = manager_with_lexicon(&hub);

        let outcome = manager.sign_in(&config()).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Hydrated);
        assert_eq!(lexicon.all_rules().unwrap()[0].replacement, "Doctor");
        manager.sign_out().await;
    }
}
