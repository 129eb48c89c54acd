//! Versicle CLI
//!
//! Command-line front end for the Versicle sync and recovery engine.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use versicle_core::{Config, StorageError, SyncEngine};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "versicle")]
#[command(about = "Versicle - sync and disaster recovery for your reading library")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull, merge and push now
    Sync,
    /// Push the local state without pulling
    Push,
    /// Stay connected and keep syncing until interrupted
    Watch {
        /// Seconds between syncs for non-realtime providers
        #[arg(long, default_value_t = 300)]
        interval: u64,
    },
    /// Manage local checkpoints
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Export the library to a checksummed JSON backup
    Export {
        /// Destination file
        path: PathBuf,
    },
    /// Import a JSON backup into the library
    Import {
        /// Backup file
        path: PathBuf,
    },
    /// Show device, sync and storage status
    Status,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// Take a checkpoint now
    Create {
        /// Label stored with the checkpoint
        #[arg(short, long, default_value = "manual")]
        trigger: String,
    },
    /// List checkpoints, newest first
    #[command(alias = "ls")]
    List,
    /// Replace the library with a checkpoint
    Restore {
        id: i64,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Show how the library differs from a checkpoint
    Diff { id: i64 },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, provider, sync_url, sync_enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands work without opening the engine
    if let Commands::Config { command } = &cli.command {
        return match command {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key.clone(), value.clone(), config_path, &output)
            }
        };
    }

    let config = match config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;
    init_logging(&config);

    let engine = SyncEngine::open_with_config(config)?;

    let result = match cli.command {
        Commands::Sync => commands::sync::sync(&engine, &output).await,
        Commands::Push => commands::sync::push(&engine, &output).await,
        Commands::Watch { interval } => commands::sync::watch(&engine, interval, &output).await,
        Commands::Checkpoint { command } => match command {
            CheckpointCommands::Create { trigger } => {
                commands::checkpoint::create(&engine, trigger, &output).await
            }
            CheckpointCommands::List => commands::checkpoint::list(&engine, &output),
            CheckpointCommands::Restore { id, yes } => {
                commands::checkpoint::restore(&engine, id, yes, &output).await
            }
            CheckpointCommands::Diff { id } => commands::checkpoint::diff(&engine, id, &output).await,
        },
        Commands::Export { path } => commands::backup::export(&engine, path, &output).await,
        Commands::Import { path } => commands::backup::import(&engine, path, &output).await,
        Commands::Status => commands::status::show(&engine, &output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    };

    // Save even when the command failed part-way
    if let Err(e) = engine.shutdown().await {
        output.warning(&format!("Failed to save document: {}", e));
    }

    if let Err(e) = &result {
        if let Some(hint) = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<StorageError>())
            .and_then(StorageError::recovery_suggestion)
        {
            output.warning(hint);
        }
    }

    result
}

/// Initialize logging
///
/// Level comes from `log_level`; `VERSICLE_LOG` takes precedence. Logs go to
/// `log_file` when set, otherwise to stderr.
fn init_logging(config: &Config) {
    let level = std::env::var("VERSICLE_LOG").unwrap_or_else(|_| config.log_level.clone());
    let env_filter = EnvFilter::new(format!("versicle_core={},versicle_cli={}", level, level));

    match &config.log_file {
        Some(log_path) => {
            let log_file = match OpenOptions::new().create(true).append(true).open(log_path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
                    return;
                }
            };
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(log_file)
                .try_init();
            info!("Logging initialized to {:?}", log_path);
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}
