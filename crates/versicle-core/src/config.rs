//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/versicle/config.toml)
//! 3. Environment variables (VERSICLE_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix
const ENV_PREFIX: &str = "VERSICLE";

/// Which remote storage provider to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local only, no remote sync
    #[default]
    None,
    /// Legacy JSON manifest over the file store
    Manifest,
    /// Binary CRDT snapshot over the file store
    Snapshot,
    /// Realtime WebSocket backend
    Realtime,
    /// In-memory mock (testing and demos)
    Mock,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::None => "none",
            ProviderKind::Manifest => "manifest",
            ProviderKind::Snapshot => "snapshot",
            ProviderKind::Realtime => "realtime",
            ProviderKind::Mock => "mock",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(ProviderKind::None),
            "manifest" => Ok(ProviderKind::Manifest),
            "snapshot" => Ok(ProviderKind::Snapshot),
            "realtime" => Ok(ProviderKind::Realtime),
            "mock" => Ok(ProviderKind::Mock),
            other => anyhow::bail!("Unknown provider: {}", other),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (Automerge doc, SQLite db, sync state)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Device id override (normally generated and stored in the data dir)
    #[serde(default)]
    pub device_id: Option<String>,

    /// Whether sync is enabled
    #[serde(default)]
    pub sync_enabled: bool,

    /// Remote storage provider
    #[serde(default)]
    pub provider: ProviderKind,

    /// Remote endpoint (REST base URL or WebSocket URL)
    #[serde(default)]
    pub sync_url: Option<String>,

    /// Bearer token for the remote endpoint
    #[serde(default)]
    pub access_token: Option<String>,

    /// Authenticated user id (realtime path)
    #[serde(default)]
    pub user_id: Option<String>,

    /// Application-private folder on the file store
    #[serde(default = "default_remote_folder")]
    pub remote_folder: String,

    /// Deployment environment (realtime path)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Debounce delay for scheduled syncs
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// Minimum age of the last pre-sync checkpoint before taking another
    #[serde(default = "default_pre_sync_checkpoint_hours")]
    pub pre_sync_checkpoint_hours: u64,

    /// How long the clean-client bootstrap waits for remote data
    #[serde(default = "default_bootstrap_timeout_secs")]
    pub bootstrap_timeout_secs: u64,

    /// Settle window after the first bootstrap update
    #[serde(default = "default_bootstrap_settle_ms")]
    pub bootstrap_settle_ms: u64,

    /// Log level for the versicle crates
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log file path (logs go to stderr when unset)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            device_id: None,
            sync_enabled: false,
            provider: ProviderKind::None,
            sync_url: None,
            access_token: None,
            user_id: None,
            remote_folder: default_remote_folder(),
            environment: default_environment(),
            debounce_secs: default_debounce_secs(),
            pre_sync_checkpoint_hours: default_pre_sync_checkpoint_hours(),
            bootstrap_timeout_secs: default_bootstrap_timeout_secs(),
            bootstrap_settle_ms: default_bootstrap_settle_ms(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (VERSICLE_DATA_DIR, VERSICLE_PROVIDER, ...)
    /// 2. Config file (~/.config/versicle/config.toml or VERSICLE_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(val) = env_var("DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }

        if let Some(val) = env_var("SYNC_ENABLED") {
            self.sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Some(val) = env_var("PROVIDER") {
            self.provider = val
                .parse()
                .with_context(|| format!("Invalid {}_PROVIDER", ENV_PREFIX))?;
        }

        // Empty strings clear optional values
        if let Some(val) = env_var("SYNC_URL") {
            self.sync_url = non_empty(val);
        }
        if let Some(val) = env_var("ACCESS_TOKEN") {
            self.access_token = non_empty(val);
        }
        if let Some(val) = env_var("USER_ID") {
            self.user_id = non_empty(val);
        }

        if let Some(val) = env_var("ENVIRONMENT") {
            if !val.is_empty() {
                self.environment = val;
            }
        }

        Ok(())
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Set a single value by key (used by `versicle config set`)
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "device_id" => self.device_id = non_empty(value.to_string()),
            "sync_enabled" => {
                self.sync_enabled = value
                    .parse()
                    .with_context(|| format!("Invalid boolean: {}", value))?
            }
            "provider" => self.provider = value.parse()?,
            "sync_url" => self.sync_url = non_empty(value.to_string()),
            "access_token" => self.access_token = non_empty(value.to_string()),
            "user_id" => self.user_id = non_empty(value.to_string()),
            "remote_folder" => self.remote_folder = value.to_string(),
            "environment" => self.environment = value.to_string(),
            "debounce_secs" => self.debounce_secs = parse_number(value)?,
            "pre_sync_checkpoint_hours" => self.pre_sync_checkpoint_hours = parse_number(value)?,
            "bootstrap_timeout_secs" => self.bootstrap_timeout_secs = parse_number(value)?,
            "bootstrap_settle_ms" => self.bootstrap_settle_ms = parse_number(value)?,
            "log_level" => self.log_level = value.to_string(),
            "log_file" => self.log_file = non_empty(value.to_string()).map(PathBuf::from),
            other => anyhow::bail!("Unknown config key: {}", other),
        }
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with VERSICLE_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Some(path) = env_var("CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("versicle")
            .join("config.toml")
    }

    /// Get the path to the Automerge document file
    pub fn automerge_path(&self) -> PathBuf {
        self.data_dir.join("document.automerge")
    }

    /// Get the path to the SQLite database (checkpoints, lexicon)
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("versicle.db")
    }

    /// Get the path to the persisted sync state
    pub fn sync_state_path(&self) -> PathBuf {
        self.data_dir.join("sync_state.json")
    }

    /// Get the path to the stored device id
    pub fn device_id_path(&self) -> PathBuf {
        self.data_dir.join("device_id")
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn pre_sync_checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.pre_sync_checkpoint_hours * 60 * 60)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    pub fn bootstrap_settle(&self) -> Duration {
        Duration::from_millis(self.bootstrap_settle_ms)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn non_empty(val: String) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

fn parse_number(value: &str) -> Result<u64> {
    value
        .parse()
        .with_context(|| format!("Invalid number: {}", value))
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("versicle")
}

fn default_remote_folder() -> String {
    "appDataFolder".to_string()
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_debounce_secs() -> u64 {
    60
}

fn default_pre_sync_checkpoint_hours() -> u64 {
    24
}

fn default_bootstrap_timeout_secs() -> u64 {
    8
}

fn default_bootstrap_settle_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "VERSICLE_DATA_DIR",
        "VERSICLE_SYNC_URL",
        "VERSICLE_SYNC_ENABLED",
        "VERSICLE_PROVIDER",
        "VERSICLE_ACCESS_TOKEN",
        "VERSICLE_USER_ID",
        "VERSICLE_ENVIRONMENT",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.sync_enabled);
        assert!(config.sync_url.is_none());
        assert_eq!(config.provider, ProviderKind::None);
        assert_eq!(config.debounce(), Duration::from_secs(60));
        assert_eq!(config.pre_sync_checkpoint_interval(), Duration::from_secs(86_400));
        assert_eq!(config.bootstrap_timeout(), Duration::from_secs(8));
        assert_eq!(config.bootstrap_settle(), Duration::from_millis(500));
        assert!(config.data_dir.ends_with("versicle"));
    }

    #[test]
    fn test_file_paths() {
        let config = Config::default();
        assert!(config.automerge_path().ends_with("document.automerge"));
        assert!(config.sqlite_path().ends_with("versicle.db"));
        assert!(config.sync_state_path().ends_with("sync_state.json"));
        assert!(config.device_id_path().ends_with("device_id"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("VERSICLE_DATA_DIR", "/tmp/versicle-test");
        config.apply_env_overrides().unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/versicle-test"));
    }

    #[test]
    fn test_env_override_sync_enabled() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("VERSICLE_SYNC_ENABLED", "true");
        config.apply_env_overrides().unwrap();
        assert!(config.sync_enabled);

        env::set_var("VERSICLE_SYNC_ENABLED", "false");
        config.apply_env_overrides().unwrap();
        assert!(!config.sync_enabled);
    }

    #[test]
    fn test_env_override_provider_and_credentials() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("VERSICLE_PROVIDER", "Snapshot");
        env::set_var("VERSICLE_ACCESS_TOKEN", "secret");
        env::set_var("VERSICLE_USER_ID", "");
        config.user_id = Some("old".to_string());
        config.apply_env_overrides().unwrap();

        assert_eq!(config.provider, ProviderKind::Snapshot);
        assert_eq!(config.access_token.as_deref(), Some("secret"));
        assert!(config.user_id.is_none());

        env::set_var("VERSICLE_PROVIDER", "carrier-pigeon");
        assert!(config.apply_env_overrides().is_err());
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            provider = "realtime"
            sync_url = "ws://example.com"
            sync_enabled = true
            bootstrap_settle_ms = 250
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.provider, ProviderKind::Realtime);
        assert_eq!(config.sync_url, Some("ws://example.com".to_string()));
        assert_eq!(config.bootstrap_settle(), Duration::from_millis(250));
        assert_eq!(config.debounce_secs, 60);
    }

    #[test]
    fn test_serialization_round_trip() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/versicle"),
            provider: ProviderKind::Manifest,
            sync_url: Some("https://files.example.com".to_string()),
            sync_enabled: true,
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("provider = \"manifest\""));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.provider, config.provider);
        assert_eq!(parsed.sync_url, config.sync_url);
    }

    #[test]
    fn test_set_value() {
        let mut config = Config::default();
        config.set_value("provider", "mock").unwrap();
        config.set_value("debounce_secs", "5").unwrap();
        config.set_value("sync_url", "").unwrap();

        assert_eq!(config.provider, ProviderKind::Mock);
        assert_eq!(config.debounce_secs, 5);
        assert!(config.sync_url.is_none());
        assert!(config.set_value("debounce_secs", "soon").is_err());
        assert!(config.set_value("favorite_tag", "x").is_err());
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = tempfile::TempDir::new().unwrap();
        env::set_var("VERSICLE_DATA_DIR", temp_dir.path());

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert!(!config.sync_enabled);
        assert_eq!(config.data_dir, temp_dir.path());
    }
}
