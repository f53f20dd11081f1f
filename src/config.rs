// Settings save/restore functionality

use crate::projection::SortState;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_DIR: &str = "connwatch";
const CONFIG_FILE: &str = "settings.json";

/// Name of the process that may never be killed from the connection list
pub const DEFAULT_PROTECTED_PROCESS: &str = "System";

/// Settings file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Delay between refresh cycles, in milliseconds
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Last active sort column and direction
    #[serde(default)]
    pub sort: Option<SortState>,

    /// Preferred connection table backend
    #[serde(default)]
    pub preferred_backend: Option<String>,

    /// Process name rejected by the kill action (case-insensitive)
    #[serde(default = "default_protected_process_name")]
    pub protected_process_name: String,
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

fn default_protected_process_name() -> String {
    DEFAULT_PROTECTED_PROCESS.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval_ms(),
            sort: None,
            preferred_backend: None,
            protected_process_name: default_protected_process_name(),
        }
    }
}

impl Config {
    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine the user config directory")?
            .join(CONFIG_DIR);

        // Create config directory if it doesn't exist
        fs::create_dir_all(&config_dir).context(format!(
            "Failed to create config directory: {:?}",
            config_dir
        ))?;

        Ok(config_dir.join(CONFIG_FILE))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            log::debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        let contents =
            fs::read_to_string(&path).context(format!("Failed to read config file: {:?}", path))?;

        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents).context(format!("Failed to write config file: {:?}", path))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Refresh interval, never shorter than 100ms
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(100))
    }
}
