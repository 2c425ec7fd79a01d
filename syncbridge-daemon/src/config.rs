//! Daemon Configuration
//!
//! TOML configuration for the syncbridge daemon, with defaults that work
//! out of the box against a local relay.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use syncbridge_protocol::{RegistryConfig, RelayLinkConfig, TransferConfig};

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device configuration
    pub device: DeviceConfig,

    /// Relay endpoints and reconnect behavior
    #[serde(default)]
    pub relay: RelaySection,

    /// Peer registry intervals
    #[serde(default)]
    pub registry: RegistrySection,

    /// Transfer engine tunables and paths
    #[serde(default)]
    pub transfer: TransferSection,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name shown to peers
    pub name: String,

    /// Device ID (auto-generated on first run if not set)
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Relay endpoints, primary first
    #[serde(default = "default_relay_urls")]
    pub urls: Vec<String>,

    /// Seconds between reconnect attempts
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,
}

/// Registry intervals, all in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_announce_secs")]
    pub announce_secs: u64,

    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,

    #[serde(default = "default_cleanup_secs")]
    pub cleanup_secs: u64,

    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
}

/// Transfer engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    /// Where assembled files land (default: the user's download directory)
    #[serde(default)]
    pub download_dir: Option<PathBuf>,

    /// Where incoming chunks are staged
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// Chunk size on the relay path, in bytes
    #[serde(default = "default_relay_chunk_size")]
    pub relay_chunk_size: usize,

    /// Chunk size on direct channels, in bytes
    #[serde(default = "default_direct_chunk_size")]
    pub direct_chunk_size: usize,

    /// Delivery attempts per chunk
    #[serde(default = "default_chunk_retries")]
    pub max_chunk_retries: u32,

    /// Seconds between delivery attempts
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

fn default_relay_urls() -> Vec<String> {
    vec!["ws://127.0.0.1:9000/ws".to_string()]
}

fn default_reconnect_secs() -> u64 {
    5
}

fn default_announce_secs() -> u64 {
    30
}

fn default_refresh_secs() -> u64 {
    60
}

fn default_cleanup_secs() -> u64 {
    120
}

fn default_peer_timeout_secs() -> u64 {
    300
}

fn default_relay_chunk_size() -> usize {
    syncbridge_protocol::RELAY_CHUNK_SIZE
}

fn default_direct_chunk_size() -> usize {
    syncbridge_protocol::DIRECT_CHUNK_SIZE
}

fn default_chunk_retries() -> u32 {
    3
}

fn default_retry_backoff_secs() -> u64 {
    1
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            urls: default_relay_urls(),
            reconnect_secs: default_reconnect_secs(),
        }
    }
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            announce_secs: default_announce_secs(),
            refresh_secs: default_refresh_secs(),
            cleanup_secs: default_cleanup_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            download_dir: None,
            staging_dir: None,
            relay_chunk_size: default_relay_chunk_size(),
            direct_chunk_size: default_direct_chunk_size(),
            max_chunk_retries: default_chunk_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                name: hostname(),
                device_id: None,
            },
            relay: RelaySection::default(),
            registry: RegistrySection::default(),
            transfer: TransferSection::default(),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "syncbridge".to_string())
}

impl Config {
    /// Default location: `<config dir>/syncbridge/config.toml`.
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir().context("no config directory on this platform")?;
        Ok(base.join("syncbridge").join("config.toml"))
    }

    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Write the config back, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn relay_link_config(&self) -> RelayLinkConfig {
        RelayLinkConfig {
            reconnect_delay: Duration::from_secs(self.relay.reconnect_secs),
            ..Default::default()
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            announce_interval: Duration::from_secs(self.registry.announce_secs),
            refresh_interval: Duration::from_secs(self.registry.refresh_secs),
            cleanup_interval: Duration::from_secs(self.registry.cleanup_secs),
            peer_timeout: Duration::from_secs(self.registry.peer_timeout_secs),
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        let defaults = TransferConfig::default();
        TransferConfig {
            relay_chunk_size: self.transfer.relay_chunk_size,
            direct_chunk_size: self.transfer.direct_chunk_size,
            max_chunk_retries: self.transfer.max_chunk_retries,
            retry_backoff: Duration::from_secs(self.transfer.retry_backoff_secs),
            staging_dir: self
                .transfer
                .staging_dir
                .clone()
                .unwrap_or(defaults.staging_dir),
            download_dir: self
                .transfer
                .download_dir
                .clone()
                .or_else(dirs::download_dir)
                .unwrap_or(defaults.download_dir),
            terminal_retention: defaults.terminal_retention,
        }
    }
}
