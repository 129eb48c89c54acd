//! Device identity
//!
//! Every device gets a stable id, generated on first run and stored in the
//! data directory. It keys per-device progress and the device's
//! `preferences/<deviceId>` container.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;

/// Stable identity of this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    device_id: String,
}

impl DeviceIdentity {
    /// Resolve the device id for a configuration
    ///
    /// An explicit `device_id` in the config wins. Otherwise the stored id is
    /// used, or a new one is generated and stored.
    pub fn load_or_create(config: &Config) -> Result<Self> {
        if let Some(id) = &config.device_id {
            return Ok(Self {
                device_id: id.clone(),
            });
        }
        Self::load_or_create_at(&config.device_id_path())
    }

    fn load_or_create_at(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read device id: {:?}", path))?;
            let device_id = content.trim().to_string();
            if !device_id.is_empty() {
                return Ok(Self { device_id });
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let device_id = Uuid::new_v4().to_string();
        std::fs::write(path, &device_id)
            .with_context(|| format!("Failed to write device id: {:?}", path))?;
        info!(device_id = %device_id, "Generated new device id");

        Ok(Self { device_id })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}
