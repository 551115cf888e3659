// Configuration management for the wsstar CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/wsstar/config.json
// - Linux: ~/.config/wsstar/config.json
// - Windows: %APPDATA%\wsstar\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use wsstar_core::{SignalServerConfig, TransportConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address `wsstar server` binds when `--bind` is not given
    pub bind: String,

    /// Seconds `wsstar dial` waits for a reply
    pub reply_timeout: u64,

    /// Identity key file; defaults to `identity.key` in the data directory
    pub identity_path: Option<String>,

    /// Client transport settings
    pub transport: TransportConfig,

    /// Signaling server settings
    pub server: SignalServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9090".to_string(),
            reply_timeout: 10,
            identity_path: None,
            transport: TransportConfig::default(),
            server: SignalServerConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("wsstar");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("wsstar");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the default config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Config file to use: `explicit` when given, else the default location
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        match explicit {
            Some(path) => Ok(path.to_path_buf()),
            None => Self::config_file(),
        }
    }

    /// Load config from `path`, writing the defaults there if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Save config to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Identity key file, from the config or the data directory
    pub fn identity_file(&self) -> Result<PathBuf> {
        match &self.identity_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("identity.key")),
        }
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "bind" => self.bind = value.to_string(),
            "reply_timeout" => {
                self.reply_timeout = value.parse().context("Invalid number")?;
            }
            "identity_path" => {
                self.identity_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "reconnect_interval_ms" => {
                self.transport.reconnect_interval_ms = value.parse().context("Invalid number")?;
            }
            "max_reconnect_attempts" => {
                self.transport.max_reconnect_attempts = value.parse().context("Invalid number")?;
            }
            "max_challenge_rounds" => {
                self.transport.max_challenge_rounds = value.parse().context("Invalid number")?;
            }
            "max_connections" => {
                self.server.max_connections = value.parse().context("Invalid number")?;
            }
            "require_proof" => {
                self.server.require_proof = value.parse().context("Invalid boolean value")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("bind".to_string(), self.bind.clone()),
            ("reply_timeout".to_string(), format!("{}s", self.reply_timeout)),
            (
                "identity_path".to_string(),
                self.identity_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "reconnect_interval_ms".to_string(),
                self.transport.reconnect_interval_ms.to_string(),
            ),
            (
                "max_reconnect_attempts".to_string(),
                self.transport.max_reconnect_attempts.to_string(),
            ),
            (
                "max_challenge_rounds".to_string(),
                self.transport.max_challenge_rounds.to_string(),
            ),
            ("max_connections".to_string(), self.server.max_connections.to_string()),
            ("require_proof".to_string(), self.server.require_proof.to_string()),
        ]
    }
}

// ============================================================================
// TESTS
// ============================================================================
