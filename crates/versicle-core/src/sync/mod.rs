//! Sync
//!
//! Moves the shared document between this device and the remote.
//!
//! ## Components
//!
//! - `orchestrator`: pull → merge → push cycles over any provider, with
//!   debouncing, mutual exclusion and lifecycle triggers
//! - `realtime`: live subscription transport (CBOR over WebSocket)
//! - `connection`: realtime session lifecycle and clean-client bootstrap
//! - `state`: last-sync bookkeeping persisted between sessions
//!
//! ## Usage
//!
//! ```ignore
//! let orchestrator = Arc::new(SyncOrchestrator::new(parts));
//! orchestrator.sync(SyncTrigger::Startup).await;
//! orchestrator.schedule_sync();
//! ```

pub mod connection;
pub mod message;
pub mod orchestrator;
pub mod realtime;
pub mod state;

pub use connection::{BootstrapOutcome, ConnectionManager, ConnectionOptions, ConnectionState};
pub use message::{ClientMessage, ProbeResult, ServerMessage};
pub use orchestrator::{
    OrchestratorOptions, OrchestratorParts, SyncError, SyncOrchestrator, SyncOutcome, SyncTrigger,
};
pub use realtime::{
    MockRealtimeHub, RealtimeEndpoint, RealtimeProvider, RealtimeSession, RealtimeTransport,
    WebSocketTransport,
};
pub use state::{SyncRecord, SyncState};
