//! Agent configuration

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use cladnet_core::CoreConfig;

/// Main agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Engine and host settings
    pub tunnel: CoreConfig,
    /// Where the networking rule comes from
    #[serde(default)]
    pub rule: RuleConfig,
    /// Peer public keys known ahead of time
    #[serde(default)]
    pub keyring: KeyringConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Networking rule source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    /// JSON file with `{ "cladnet_id": ..., "peers": [...] }`
    pub path: Option<PathBuf>,
}

/// Static keyring entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyringConfig {
    /// host id -> base64 public key
    #[serde(default)]
    pub peers: BTreeMap<String, String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        let mut tunnel = CoreConfig::default();
        if let Some(dirs) = directories::ProjectDirs::from("net", "cladnet", "cladnet") {
            tunnel.key_dir = dirs.data_dir().join("keys");
            tunnel.state_dir = dirs.data_dir().to_path_buf();
        }

        Self {
            tunnel,
            rule: RuleConfig::default(),
            keyring: KeyringConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load or create default configuration
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.tunnel.validate().map_err(anyhow::Error::msg)?;

        if self.keyring.peers.keys().any(|host_id| host_id.is_empty()) {
            anyhow::bail!("keyring entries need a host id");
        }

        Ok(())
    }
}
