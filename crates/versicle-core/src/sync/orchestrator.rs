//! Sync orchestrator
//!
//! Runs the pull → merge → push cycle against the configured provider:
//!
//! 1. Download the remote snapshot
//! 2. Take a rate-limited pre-sync checkpoint, merge, project the lexicon
//! 3. Mirror the local lexicon into the document, encode, upload
//!
//! At most one cycle runs at a time. Local edits call
//! [`SyncOrchestrator::schedule_sync`], which coalesces them into a single
//! push after the debounce delay.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointService, PRE_SYNC_TRIGGER};
use crate::config::Config;
use crate::document::{DocumentError, DocumentHandle, SharedDocument};
use crate::models::now_ms;
use crate::provider::{ProviderConfig, ProviderError, ProviderErrorKind, RemoteStorageProvider};
use crate::storage::lexicon::LexiconSyncError;
use crate::storage::{DocumentPersistence, SqliteLexiconStore};
use crate::sync::state::{SyncRecord, SyncState};

/// Why a sync cycle was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Startup,
    Background,
    Debounce,
    Manual,
    Periodic,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Startup => "startup",
            SyncTrigger::Background => "background",
            SyncTrigger::Debounce => "debounce",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Periodic => "periodic",
        }
    }

    /// Everything except an explicit user request
    pub fn is_automatic(&self) -> bool {
        !matches!(self, SyncTrigger::Manual)
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that abort a sync cycle
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("No remote provider is configured")]
    NoProvider,

    #[error("Automatic sync is paused: the remote rejected the document as too large. Export and prune, then retry.")]
    CapacityBlocked,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Lexicon error: {0}")]
    Lexicon(#[from] LexiconSyncError),
}

/// Result of a sync or push request
#[derive(Debug)]
pub enum SyncOutcome {
    /// Pull and push completed; `merged` is whether the pull changed anything
    Synced { merged: bool },
    Pushed,
    /// Dropped because another cycle was running
    AlreadySyncing,
    Failed(SyncError),
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Synced { .. } | SyncOutcome::Pushed)
    }
}

/// Timing knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    pub debounce: Duration,
    pub pre_sync_checkpoint_interval: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(60),
            pre_sync_checkpoint_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl OrchestratorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debounce: config.debounce(),
            pre_sync_checkpoint_interval: config.pre_sync_checkpoint_interval(),
        }
    }
}

/// Everything the orchestrator is built from
pub struct OrchestratorParts {
    pub doc: DocumentHandle,
    pub provider: Option<Box<dyn RemoteStorageProvider>>,
    pub provider_config: ProviderConfig,
    pub checkpoints: Arc<CheckpointService>,
    pub lexicon: Arc<SqliteLexiconStore>,
    /// Where to save the document after merges; `None` keeps it in memory
    pub persistence: Option<DocumentPersistence>,
    pub state: SyncState,
    pub options: OrchestratorOptions,
}

/// Clears the syncing flag on every exit path
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncOrchestrator {
    doc: DocumentHandle,
    provider: Mutex<Option<Box<dyn RemoteStorageProvider>>>,
    provider_config: StdMutex<ProviderConfig>,
    checkpoints: Arc<CheckpointService>,
    lexicon: Arc<SqliteLexiconStore>,
    persistence: Option<DocumentPersistence>,
    state: StdMutex<SyncState>,
    options: OrchestratorOptions,
    is_syncing: AtomicBool,
    capacity_blocked: AtomicBool,
    debounce: StdMutex<Option<JoinHandle<()>>>,
    debounce_generation: AtomicU64,
    periodic: StdMutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SyncOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            doc: parts.doc,
            provider: Mutex::new(parts.provider),
            provider_config: StdMutex::new(parts.provider_config),
            checkpoints: parts.checkpoints,
            lexicon: parts.lexicon,
            persistence: parts.persistence,
            state: StdMutex::new(parts.state),
            options: parts.options,
            is_syncing: AtomicBool::new(false),
            capacity_blocked: AtomicBool::new(false),
            debounce: StdMutex::new(None),
            debounce_generation: AtomicU64::new(0),
            periodic: StdMutex::new(None),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::Acquire)
    }

    pub fn is_capacity_blocked(&self) -> bool {
        self.capacity_blocked.load(Ordering::Acquire)
    }

    /// Resume automatic pushes after the user pruned the document
    pub fn clear_capacity_block(&self) {
        if self.capacity_blocked.swap(false, Ordering::AcqRel) {
            info!("Capacity block cleared, automatic sync resumed");
        }
    }

    pub fn last_sync(&self) -> SyncRecord {
        lock(&self.state).record().clone()
    }

    pub async fn provider_name(&self) -> Option<&'static str> {
        self.provider.lock().await.as_ref().map(|p| p.name())
    }

    /// Authenticate the provider with the current settings
    pub async fn initialize(&self) -> Result<(), SyncError> {
        let config = lock(&self.provider_config).clone();
        let mut slot = self.provider.lock().await;
        let provider = slot.as_mut().ok_or(SyncError::NoProvider)?;
        provider.initialize(&config).await?;
        info!(provider = provider.name(), "Provider initialized");
        Ok(())
    }

    /// Swap the provider, signing the old one out
    pub async fn replace_provider(&self, provider: Option<Box<dyn RemoteStorageProvider>>) {
        let mut slot = self.provider.lock().await;
        if let Some(old) = slot.as_mut() {
            old.sign_out();
        }
        *slot = provider;
    }

    // ==================== Triggers ====================

    /// Pull, merge and push
    ///
    /// A no-op while another cycle is running. Errors are logged and returned
    /// in the outcome.
    pub async fn sync(&self, trigger: SyncTrigger) -> SyncOutcome {
        let Some(_guard) = SyncGuard::acquire(&self.is_syncing) else {
            debug!(trigger = %trigger, "Sync already in progress, skipping");
            return SyncOutcome::AlreadySyncing;
        };

        info!(trigger = %trigger, "Starting sync");
        let result = async {
            let merged = self.pull(trigger).await?;
            self.push(trigger).await?;
            Ok::<_, SyncError>(merged)
        }
        .await;

        match result {
            Ok(merged) => {
                if let Err(e) = lock(&self.state).record_sync(now_ms(), trigger.as_str()) {
                    warn!("Failed to save sync state: {}", e);
                }
                info!(trigger = %trigger, merged, "Sync complete");
                SyncOutcome::Synced { merged }
            }
            Err(e) => {
                warn!(trigger = %trigger, "Sync failed: {}", e);
                SyncOutcome::Failed(e)
            }
        }
    }

    /// Cancel any pending debounce and push now
    pub async fn force_push(&self, trigger: SyncTrigger) -> SyncOutcome {
        self.cancel_debounce();

        let Some(_guard) = SyncGuard::acquire(&self.is_syncing) else {
            debug!(trigger = %trigger, "Sync already in progress, skipping push");
            return SyncOutcome::AlreadySyncing;
        };

        match self.push(trigger).await {
            Ok(()) => SyncOutcome::Pushed,
            Err(e) => {
                warn!(trigger = %trigger, "Push failed: {}", e);
                SyncOutcome::Failed(e)
            }
        }
    }

    /// (Re)arm the debounce timer; firing pushes with the `debounce` trigger
    pub fn schedule_sync(self: &Arc<Self>) {
        let generation = self.debounce_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let delay = self.options.debounce;
        let this = Arc::clone(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = lock(&this.debounce);
                if this.debounce_generation.load(Ordering::Acquire) != generation {
                    return;
                }
                // Disarm without aborting ourselves
                slot.take();
            }
            this.force_push(SyncTrigger::Debounce).await;
        });

        if let Some(previous) = lock(&self.debounce).replace(handle) {
            previous.abort();
        }
        debug!(delay_secs = delay.as_secs(), "Sync scheduled");
    }

    pub fn has_pending_debounce(&self) -> bool {
        lock(&self.debounce).as_ref().is_some_and(|h| !h.is_finished())
    }

    fn cancel_debounce(&self) {
        self.debounce_generation.fetch_add(1, Ordering::AcqRel);
        if let Some(handle) = lock(&self.debounce).take() {
            handle.abort();
            debug!("Pending debounce cancelled");
        }
    }

    /// The app went to the background
    pub async fn on_app_backgrounded(&self) -> SyncOutcome {
        self.force_push(SyncTrigger::Background).await
    }

    /// Provider settings changed: re-initialize and sync
    pub async fn on_settings_changed(&self, config: ProviderConfig) -> SyncOutcome {
        *lock(&self.provider_config) = config;
        if let Err(e) = self.initialize().await {
            warn!("Failed to initialize provider after settings change: {}", e);
            return SyncOutcome::Failed(e);
        }
        self.sync(SyncTrigger::Startup).await
    }

    /// Sync every `interval` until [`Self::shutdown`]
    pub fn start_periodic(self: &Arc<Self>, interval: Duration) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.sync(SyncTrigger::Periodic).await;
            }
        });

        if let Some(previous) = lock(&self.periodic).replace(handle) {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "Periodic sync started");
    }

    /// Stop the debounce timer and the periodic loop
    pub fn shutdown(&self) {
        self.cancel_debounce();
        if let Some(handle) = lock(&self.periodic).take() {
            handle.abort();
        }
    }

    // ==================== Phases ====================

    async fn ready<'a>(
        &self,
        slot: &'a mut Option<Box<dyn RemoteStorageProvider>>,
    ) -> Result<&'a mut Box<dyn RemoteStorageProvider>, SyncError> {
        let provider = slot.as_mut().ok_or(SyncError::NoProvider)?;
        if !provider.is_authenticated() {
            let config = lock(&self.provider_config).clone();
            provider.initialize(&config).await?;
        }
        Ok(provider)
    }

    /// Download and merge; returns whether anything changed
    async fn pull(&self, trigger: SyncTrigger) -> Result<bool, SyncError> {
        let remote = {
            let mut slot = self.provider.lock().await;
            let provider = self.ready(&mut slot).await?;
            provider.download_snapshot().await?
        };

        let Some(bytes) = remote else {
            debug!(trigger = %trigger, "Remote is empty, nothing to pull");
            return Ok(false);
        };

        let mut doc = self.doc.lock().await;
        if let Err(e) = self.checkpoints.create_automatic_checkpoint(
            &mut doc,
            PRE_SYNC_TRIGGER,
            self.options.pre_sync_checkpoint_interval,
        ) {
            warn!("Failed to create pre-sync checkpoint: {}", e);
        }

        let merged = doc.apply_update(&bytes)?;
        if merged {
            let rules = self.lexicon.project_from(&doc)?;
            debug!(rules, "Lexicon projected after merge");
            self.persist(&mut doc);
        }

        info!(trigger = %trigger, bytes = bytes.len(), merged, "Pulled remote state");
        Ok(merged)
    }

    /// Mirror local stores into the document and upload the full state
    async fn push(&self, trigger: SyncTrigger) -> Result<(), SyncError> {
        if trigger.is_automatic() && self.is_capacity_blocked() {
            warn!(trigger = %trigger, "Skipping push while remote storage is full");
            return Err(SyncError::CapacityBlocked);
        }

        let bytes = {
            let mut doc = self.doc.lock().await;
            self.lexicon.mirror_into(&mut doc)?;
            self.persist(&mut doc);
            doc.encode_state()
        };

        let mut slot = self.provider.lock().await;
        let provider = self.ready(&mut slot).await?;
        match provider.upload_snapshot(&bytes).await {
            Ok(()) => {
                self.clear_capacity_block();
                info!(trigger = %trigger, bytes = bytes.len(), "Pushed local state");
                Ok(())
            }
            Err(e) if e.kind() == ProviderErrorKind::Capacity => {
                self.capacity_blocked.store(true, Ordering::Release);
                error!(bytes = bytes.len(), "Remote storage is full, automatic sync paused: {}", e);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, doc: &mut SharedDocument) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save(doc) {
                warn!("Failed to save document: {}", e);
            }
        }
    }
}
