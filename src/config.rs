// src/config.rs
//! Mailbox settings stored as JSON

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "mailbox";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Directory holding the database
    pub data_dir: PathBuf,

    /// Database file name inside `data_dir`
    pub database_file: String,

    /// Delivery worker tick
    pub poll_interval_ms: u64,

    /// Inbound messages buffered per contact before the reader waits
    pub inbound_buffer: usize,

    /// Capacity of the event channel
    pub event_buffer: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,

    pub log_level: String,

    /// Go online on startup
    pub auto_connect: bool,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from(APP_DIR));
        Self {
            data_dir,
            database_file: "mailbox.db".to_string(),
            poll_interval_ms: 500,
            inbound_buffer: 16,
            event_buffer: 100,
            log_file: None,
            log_level: "info".to_string(),
            auto_connect: false,
        }
    }
}

/// Directory the default configuration file lives in
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join(APP_DIR);
    Ok(config_dir)
}

impl MailboxConfig {
    /// Configuration for a database inside `dir`, used by tests and tools
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            data_dir: dir.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening config {}", path.display()))?;
        let config: Self =
            serde_json::from_reader(file).with_context(|| format!("Parsing config {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Load the user's configuration file, or defaults when there is none
    pub fn load_or_default() -> Result<Self> {
        let path = get_config_dir()?.join(CONFIG_FILE);
        if !path.exists() {
            debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
