//! Configuration system for inter-master daemons.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $INTERMASTER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/intermaster/config.toml
//!   3. ~/.config/intermaster/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::HANDSHAKE_TIMEOUT_SECS;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the Ed25519 seed. Generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP address the session listener binds.
    pub listen_addr: String,
    /// This master's externally reachable base address, sent to peers
    /// during the handshake.
    pub public_url: String,
    /// Upper bound for one handshake, in seconds.
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// If true, peers seen for the first time during a handshake are
    /// approved immediately.
    pub auto_approve: bool,
    /// Peer identities (hex) approved up front.
    pub approved_peers: Vec<String>,
    /// Peers registered by the operator and dialed at startup.
    pub peers: Vec<PeerConfig>,
}

/// A peer registered by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// The peer's base address, as it reports it during the handshake.
    pub url: String,
    /// TCP address of the peer's session listener.
    pub addr: String,
    /// Expected identity (hex). The handshake fails if the peer proves a
    /// different one.
    pub public_key: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("identity.key"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:47100".to_string(),
            public_url: "http://localhost:8080/".to_string(),
            handshake_timeout_secs: HANDSHAKE_TIMEOUT_SECS,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("intermaster")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MasterConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            MasterConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("INTERMASTER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MasterConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply INTERMASTER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("INTERMASTER_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("INTERMASTER_NETWORK__PUBLIC_URL") {
            self.network.public_url = v;
        }
        if let Ok(v) = std::env::var("INTERMASTER_REGISTRY__AUTO_APPROVE") {
            self.registry.auto_approve = v == "true" || v == "1";
        }
    }
}
