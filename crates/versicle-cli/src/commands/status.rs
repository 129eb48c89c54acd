//! Status command handler

use anyhow::Result;

use versicle_core::SyncEngine;

use crate::output::{format_bytes, format_timestamp, Output, OutputFormat};

/// Show status information
pub async fn show(engine: &SyncEngine, output: &Output) -> Result<()> {
    let status = engine.status().await?;
    let config = engine.config();
    let connection = engine.connection().map(|c| format!("{:?}", c.state()));

    match output.format {
        OutputFormat::Json => {
            output.print_json(&serde_json::json!({
                "device_id": status.device_id,
                "sync_enabled": status.sync_enabled,
                "provider": status.provider,
                "sync_url": config.sync_url,
                "connection": connection,
                "last_sync": status.last_sync,
                "capacity_blocked": status.capacity_blocked,
                "counts": {
                    "books": status.books,
                    "annotations": status.annotations,
                    "checkpoints": status.checkpoints
                },
                "document_bytes": status.document_bytes
            }));
        }
        OutputFormat::Quiet => {
            println!("{}", status.device_id);
        }
        OutputFormat::Human => {
            println!("Versicle Status");
            println!("===============");
            println!();
            println!("Device: {}", status.device_id);
            println!();
            println!("Sync:");
            println!(
                "  Status:   {}",
                if status.sync_enabled { "enabled" } else { "disabled" }
            );
            println!("  Provider: {}", status.provider.unwrap_or("none"));
            if let Some(ref url) = config.sync_url {
                println!("  Server:   {}", url);
            }
            match status.last_sync.last_sync {
                Some(ts) => println!(
                    "  Last:     {} ({})",
                    format_timestamp(ts),
                    status.last_sync.last_trigger.as_deref().unwrap_or("unknown")
                ),
                None => println!("  Last:     never"),
            }
            if status.capacity_blocked {
                println!("  Automatic sync is paused: remote storage is full");
            }
            println!();
            println!("Storage:");
            println!("  Location: {}", config.data_dir.display());
            println!("  Document: {}", format_bytes(status.document_bytes));
            println!();
            println!("Contents:");
            println!("  Books:       {}", status.books);
            println!("  Annotations: {}", status.annotations);
            println!("  Checkpoints: {}", status.checkpoints);
        }
    }

    Ok(())
}
