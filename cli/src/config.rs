// Configuration management for the DriftGuard CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/driftguard/config.json
// - Linux: ~/.config/driftguard/config.json
// - Windows: %APPDATA%\driftguard\config.json

use anyhow::{Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the relay binds to
    pub bind_address: String,

    /// Port the relay listens on
    pub listen_port: u16,

    /// Relay WebSocket endpoint used by `track` and `watch`
    pub relay_url: String,

    /// Base URL for the REST reads
    pub api_url: String,

    /// Credential used when `--token` is not given
    pub token: Option<String>,

    /// JSON file of identity records loaded by `serve`
    pub users_file: Option<String>,

    /// Secret credentials are signed with (generated on first run)
    pub token_secret: String,

    /// Tracking settings
    pub tracking: TrackingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Minimum time between location updates, in milliseconds
    pub min_interval_ms: u64,

    /// Stop tracking after this many consecutive location errors
    pub max_consecutive_failures: u32,

    /// Relay liveness probe interval, in seconds
    pub probe_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            listen_port: 8080,
            relay_url: "ws://127.0.0.1:8080/ws".to_string(),
            api_url: "http://127.0.0.1:8080".to_string(),
            token: None,
            users_file: None,
            token_secret: generate_secret(),
            tracking: TrackingConfig::default(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 2000,
            max_consecutive_failures: 3,
            probe_interval_secs: 30,
        }
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("driftguard");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            // Persist any defaults filled in for missing keys, the secret included
            config.save_to(path)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value (in memory; call `save` to persist)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "bind_address" => self.bind_address = value.to_string(),
            "listen_port" => {
                self.listen_port = value.parse().context("Invalid port number")?;
            }
            "relay_url" => self.relay_url = value.to_string(),
            "api_url" => self.api_url = value.trim_end_matches('/').to_string(),
            "token" => self.token = optional(value),
            "users_file" => self.users_file = optional(value),
            "token_secret" => {
                if value.is_empty() {
                    anyhow::bail!("token_secret cannot be empty");
                }
                self.token_secret = value.to_string();
            }
            "min_interval_ms" => {
                self.tracking.min_interval_ms = value.parse().context("Invalid number")?;
            }
            "max_consecutive_failures" => {
                self.tracking.max_consecutive_failures =
                    value.parse().context("Invalid number")?;
            }
            "probe_interval_secs" => {
                let secs: u64 = value.parse().context("Invalid number")?;
                if secs == 0 {
                    anyhow::bail!("probe_interval_secs must be at least 1");
                }
                self.tracking.probe_interval_secs = secs;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "bind_address" => Some(self.bind_address.clone()),
            "listen_port" => Some(self.listen_port.to_string()),
            "relay_url" => Some(self.relay_url.clone()),
            "api_url" => Some(self.api_url.clone()),
            "token" => self.token.clone(),
            "users_file" => self.users_file.clone(),
            "token_secret" => Some(self.token_secret.clone()),
            "min_interval_ms" => Some(self.tracking.min_interval_ms.to_string()),
            "max_consecutive_failures" => Some(self.tracking.max_consecutive_failures.to_string()),
            "probe_interval_secs" => Some(self.tracking.probe_interval_secs.to_string()),
            _ => None,
        }
    }

    /// List all config values (secrets masked)
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("bind_address".to_string(), self.bind_address.clone()),
            ("listen_port".to_string(), self.listen_port.to_string()),
            ("relay_url".to_string(), self.relay_url.clone()),
            ("api_url".to_string(), self.api_url.clone()),
            (
                "token".to_string(),
                self.token
                    .as_ref()
                    .map(|_| "(set)".to_string())
                    .unwrap_or_else(|| "(none)".to_string()),
            ),
            (
                "users_file".to_string(),
                self.users_file.clone().unwrap_or_else(|| "(none)".to_string()),
            ),
            ("token_secret".to_string(), "(hidden)".to_string()),
            (
                "min_interval_ms".to_string(),
                self.tracking.min_interval_ms.to_string(),
            ),
            (
                "max_consecutive_failures".to_string(),
                self.tracking.max_consecutive_failures.to_string(),
            ),
            (
                "probe_interval_secs".to_string(),
                format!("{}s", self.tracking.probe_interval_secs),
            ),
        ]
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
