//! Sync command handlers

use std::time::Duration;

use anyhow::{bail, Result};
use tracing::info;

use versicle_core::sync::BootstrapOutcome;
use versicle_core::{ProviderEvent, SyncEngine, SyncOutcome, SyncTrigger};

use crate::output::Output;

fn require_sync(engine: &SyncEngine) -> Result<()> {
    if !engine.config().sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             versicle config set sync_enabled true\n  \
             versicle config set provider snapshot\n  \
             versicle config set sync_url https://files.example.com/api"
        );
    }
    Ok(())
}

fn report(outcome: SyncOutcome, output: &Output) -> Result<()> {
    match outcome {
        SyncOutcome::Synced { merged: true } => output.success("Sync complete - remote changes merged"),
        SyncOutcome::Synced { merged: false } => output.success("Sync complete - already up to date"),
        SyncOutcome::Pushed => output.success("Pushed local state"),
        SyncOutcome::AlreadySyncing => output.message("A sync is already running"),
        SyncOutcome::Failed(e) => bail!("Sync failed: {}", e),
    }
    Ok(())
}

/// Pull, merge and push once
pub async fn sync(engine: &SyncEngine, output: &Output) -> Result<()> {
    require_sync(engine)?;
    output.message("Syncing...");

    let orchestrator = engine.orchestrator();
    // An explicit sync is the user's intervention after a capacity rejection
    orchestrator.clear_capacity_block();
    report(orchestrator.sync(SyncTrigger::Manual).await, output)?;

    let status = engine.status().await?;
    output.message(&format!(
        "  Books: {}, Annotations: {}",
        status.books, status.annotations
    ));
    Ok(())
}

/// Push the local state without pulling
pub async fn push(engine: &SyncEngine, output: &Output) -> Result<()> {
    require_sync(engine)?;
    let orchestrator = engine.orchestrator();
    orchestrator.clear_capacity_block();
    report(orchestrator.force_push(SyncTrigger::Manual).await, output)
}

/// Stay connected until interrupted
///
/// With the realtime provider this holds a live session; otherwise it syncs
/// on startup and then periodically.
pub async fn watch(engine: &SyncEngine, interval_secs: u64, output: &Output) -> Result<()> {
    require_sync(engine)?;

    match engine.connection() {
        Some(connection) => {
            let mut events = connection.take_notifications();
            let outcome = connection.sign_in(&engine.provider_config()).await?;
            match outcome {
                BootstrapOutcome::Hydrated => output.success("Connected - library restored from the cloud"),
                BootstrapOutcome::TimedOut => {
                    output.warning("Timed out waiting for cloud data; continuing as a new device")
                }
                BootstrapOutcome::FirstDevice | BootstrapOutcome::NotNeeded => output.success("Connected"),
            }
            output.message("Watching for changes (Ctrl-C to stop)...");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = async {
                        match events.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => match event {
                        Some(event) => print_event(&event, output),
                        None => break,
                    },
                }
            }
        }
        None => {
            let orchestrator = engine.orchestrator();
            report(orchestrator.sync(SyncTrigger::Startup).await, output)?;
            orchestrator.start_periodic(Duration::from_secs(interval_secs.max(1)));
            output.message(&format!(
                "Syncing every {}s (Ctrl-C to stop)...",
                interval_secs.max(1)
            ));

            tokio::signal::ctrl_c().await?;
            // Flush before exit, as when the app is backgrounded
            if let SyncOutcome::Failed(e) = orchestrator.on_app_backgrounded().await {
                output.warning(&format!("Final push failed: {}", e));
            }
        }
    }

    info!("Watch stopped");
    output.message("Stopped.");
    Ok(())
}

fn print_event(event: &ProviderEvent, output: &Output) {
    match event {
        ProviderEvent::Connected => output.message("connected"),
        ProviderEvent::Disconnected => output.warning("disconnected, reconnecting"),
        ProviderEvent::Synced => output.message("synced"),
        ProviderEvent::Error { kind, message } => output.warning(&format!("{} error: {}", kind, message)),
        ProviderEvent::SaveRejected { kind, details } => {
            output.warning(&format!("save rejected ({:?}): {}", kind, details))
        }
    }
}
