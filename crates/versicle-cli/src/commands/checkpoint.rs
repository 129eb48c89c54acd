//! Checkpoint command handlers

use std::io::{self, Write};

use anyhow::{bail, Result};

use versicle_core::SyncEngine;

use crate::output::Output;

/// Take a checkpoint of the live document
pub async fn create(engine: &SyncEngine, trigger: String, output: &Output) -> Result<()> {
    let id = engine.create_checkpoint(&trigger).await?;
    if output.is_quiet() {
        println!("{}", id);
    } else {
        output.success(&format!("Created checkpoint {} ({})", id, trigger));
    }
    Ok(())
}

pub fn list(engine: &SyncEngine, output: &Output) -> Result<()> {
    let checkpoints = engine.list_checkpoints()?;
    output.print_checkpoints(&checkpoints);
    Ok(())
}

/// Show what restoring a checkpoint would change
pub async fn diff(engine: &SyncEngine, id: i64, output: &Output) -> Result<()> {
    let diff = engine.diff_checkpoint(id).await?;
    output.print_diff(id, &diff);
    Ok(())
}

/// Replace the live document with a checkpoint
pub async fn restore(engine: &SyncEngine, id: i64, yes: bool, output: &Output) -> Result<()> {
    if !yes {
        if !output.should_prompt() {
            bail!("Restoring replaces all current data. Pass --yes to confirm.");
        }
        print!(
            "Restore checkpoint {}? Current data will be replaced. [y/N] ",
            id
        );
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !matches!(input.trim(), "y" | "Y" | "yes") {
            output.message("Cancelled.");
            return Ok(());
        }
    }

    let restored = engine.restore_checkpoint(id).await?;
    output.success(&format!(
        "Restored checkpoint {} ({} containers)",
        id,
        restored.len()
    ));

    if engine.config().sync_enabled {
        output.message("Run `versicle push` to publish the restored state.");
    }
    Ok(())
}
