//! Export and import command handlers

use std::path::PathBuf;

use anyhow::Result;

use versicle_core::SyncEngine;

use crate::output::Output;

pub async fn export(engine: &SyncEngine, path: PathBuf, output: &Output) -> Result<()> {
    let backup = engine.export_backup(&path).await?;
    let books = backup.data.manifest.books.len();

    if output.is_json() {
        output.print_json(&serde_json::json!({
            "path": path,
            "books": books,
            "checksum": backup.meta.checksum,
        }));
    } else {
        output.success(&format!("Exported {} book(s) to {}", books, path.display()));
    }
    Ok(())
}

/// Import a backup; a checkpoint of the current state is taken first
pub async fn import(engine: &SyncEngine, path: PathBuf, output: &Output) -> Result<()> {
    let summary = engine.import_backup(&path).await?;

    if output.is_json() {
        output.print_json(&serde_json::json!({
            "books": summary.books,
            "annotations": summary.annotations,
            "lexicon_rules": summary.lexicon_rules,
            "reading_list": summary.reading_list,
        }));
    } else {
        output.success(&format!(
            "Imported {} book(s), {} annotation(s), {} lexicon rule(s), {} reading list entr(ies)",
            summary.books, summary.annotations, summary.lexicon_rules, summary.reading_list
        ));
    }
    Ok(())
}
