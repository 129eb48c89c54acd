//! Config command handlers

use std::path::PathBuf;

use anyhow::{Context, Result};

use versicle_core::Config;

use crate::output::{Output, OutputFormat};

fn load(config_path: Option<&PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

/// Show current configuration
///
/// The access token is never printed, only whether one is set.
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config = load(config_path)?;
    let token_state = if config.access_token.is_some() {
        "(set)"
    } else {
        "(not set)"
    };

    match output.format {
        OutputFormat::Json => {
            output.print_json(&serde_json::json!({
                "data_dir": config.data_dir,
                "device_id": config.device_id,
                "sync_enabled": config.sync_enabled,
                "provider": config.provider,
                "sync_url": config.sync_url,
                "access_token": config.access_token.is_some(),
                "user_id": config.user_id,
                "remote_folder": config.remote_folder,
                "environment": config.environment,
                "debounce_secs": config.debounce_secs,
                "pre_sync_checkpoint_hours": config.pre_sync_checkpoint_hours,
                "bootstrap_timeout_secs": config.bootstrap_timeout_secs,
                "bootstrap_settle_ms": config.bootstrap_settle_ms,
                "log_level": config.log_level,
                "log_file": config.log_file,
            }));
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            let not_set = || "(not set)".to_string();

            println!("Configuration:");
            println!("  data_dir:                  {}", config.data_dir.display());
            println!(
                "  device_id:                 {}",
                config.device_id.clone().unwrap_or_else(|| "(generated)".to_string())
            );
            println!("  sync_enabled:              {}", config.sync_enabled);
            println!("  provider:                  {}", config.provider);
            println!(
                "  sync_url:                  {}",
                config.sync_url.clone().unwrap_or_else(not_set)
            );
            println!("  access_token:              {}", token_state);
            println!(
                "  user_id:                   {}",
                config.user_id.clone().unwrap_or_else(not_set)
            );
            println!("  remote_folder:             {}", config.remote_folder);
            println!("  environment:               {}", config.environment);
            println!("  debounce_secs:             {}", config.debounce_secs);
            println!("  pre_sync_checkpoint_hours: {}", config.pre_sync_checkpoint_hours);
            println!("  bootstrap_timeout_secs:    {}", config.bootstrap_timeout_secs);
            println!("  bootstrap_settle_ms:       {}", config.bootstrap_settle_ms);
            println!("  log_level:                 {}", config.log_level);
            println!(
                "  log_file:                  {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(not_set)
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let mut config = load(config_path)?;
    config.set_value(&key, &value)?;

    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    let shown = if key == "access_token" { "***" } else { value.as_str() };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}
