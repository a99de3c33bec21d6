//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the API
//! base URL, request timeout, the storage key the session lives under, and
//! which backend holds the durable tier.
//!
//! Configuration is stored at `~/.config/<app_name>/config.json`; environment
//! variables (and a `.env` file) override it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::{FileStorage, KeyringStorage, Storage, DEFAULT_STORAGE_KEY};

/// Application name used for config/data directory paths
const APP_NAME: &str = "sessionsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080/api";

/// Per-call transport timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

const ENV_BASE_URL: &str = "SESSIONSYNC_BASE_URL";
const ENV_TIMEOUT_SECS: &str = "SESSIONSYNC_TIMEOUT_SECS";
const ENV_STORAGE_KEY: &str = "SESSIONSYNC_STORAGE_KEY";
const ENV_DURABLE_BACKEND: &str = "SESSIONSYNC_DURABLE_BACKEND";

/// Where the durable tier is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurableBackend {
    /// JSON file in the platform data directory.
    #[default]
    File,
    /// OS keychain entry.
    Keyring,
}

impl std::str::FromStr for DurableBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "keyring" | "keychain" => Ok(Self::Keyring),
            other => Err(anyhow::anyhow!("Unknown durable backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub timeout_secs: u64,
    pub storage_key: String,
    pub durable_backend: DurableBackend,
    pub app_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            durable_backend: DurableBackend::default(),
            app_name: APP_NAME.to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents).context("Failed to parse config file")?)
        } else {
            Ok(Self::default())
        }
    }

    /// Load the config file, then apply `.env` and environment overrides.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (silently ignore if not found)
        let _ = dotenvy::dotenv();
        let mut config = Self::load()?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var(ENV_BASE_URL) {
            self.base_url = url;
        }
        if let Some(secs) = var(ENV_TIMEOUT_SECS) {
            self.timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {}", ENV_TIMEOUT_SECS, secs))?;
        }
        if let Some(key) = var(ENV_STORAGE_KEY) {
            self.storage_key = key;
        }
        if let Some(backend) = var(ENV_DURABLE_BACKEND) {
            self.durable_backend = backend.parse()?;
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(&self.app_name))
    }

    /// Build the configured durable storage area.
    pub fn durable_storage(&self) -> Result<Arc<dyn Storage>> {
        let storage: Arc<dyn Storage> = match self.durable_backend {
            DurableBackend::File => Arc::new(FileStorage::new(self.data_dir()?)) as Arc<dyn Storage>,
            DurableBackend::Keyring => Arc::new(KeyringStorage::new(self.app_name.clone())),
        };
        Ok(storage)
    }
}

// ============================================================================
// Tests
// ============================================================================
