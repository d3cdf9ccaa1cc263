//! Daemon configuration.
//!
//! Loaded from a TOML file; every field has a default so a minimal file
//! (or none at all) yields a working LAN daemon. Validation runs before
//! any listener starts and configuration errors are fatal.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sentinel_transport::SelectionStrategy;

/// Configuration errors; all fatal before listen.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML syntax or type error
    #[error("cannot parse config: {0}")]
    Parse(String),

    /// Semantically invalid option combination
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which carriers to instantiate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportsEnabled {
    /// Direct TCP
    #[serde(default = "default_true")]
    pub tcp: bool,
    /// QUIC over UDP
    #[serde(default)]
    pub quic: bool,
    /// Signalled WebRTC-style channel
    #[serde(default)]
    pub webrtc: bool,
    /// Relay tunnelling
    #[serde(default = "default_true")]
    pub relay: bool,
}

impl Default for TransportsEnabled {
    fn default() -> Self {
        Self {
            tcp: true,
            quic: false,
            webrtc: false,
            relay: true,
        }
    }
}

impl TransportsEnabled {
    /// Whether any carrier is enabled.
    #[must_use]
    pub fn any(&self) -> bool {
        self.tcp || self.quic || self.webrtc || self.relay
    }
}

/// Serialisable strategy names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum StrategyName {
    /// TCP > QUIC > WebRTC > Relay
    PreferDirect,
    /// Lowest EWMA RTT
    PreferFast,
    /// Lowest EWMA loss
    PreferReliable,
    /// Bound transport, then priority order
    #[default]
    FallbackChain,
    /// Context-weighted score
    Adaptive,
}

impl From<StrategyName> for SelectionStrategy {
    fn from(name: StrategyName) -> Self {
        match name {
            StrategyName::PreferDirect => Self::PreferDirect,
            StrategyName::PreferFast => Self::PreferFast,
            StrategyName::PreferReliable => Self::PreferReliable,
            StrategyName::FallbackChain => Self::FallbackChain,
            StrategyName::Adaptive => Self::Adaptive,
        }
    }
}

/// Discovery options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    /// UDP announcement port
    #[serde(default = "default_discovery_port")]
    pub udp_port: u16,
    /// Broadcast tick interval in milliseconds
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_ms: u64,
    /// Stale-peer timeout in seconds
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_sec: u64,
    /// Enable UDP broadcast discovery
    #[serde(default = "default_true")]
    pub enable_udp: bool,
    /// Enable the mDNS stub
    #[serde(default)]
    pub enable_mdns: bool,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            udp_port: default_discovery_port(),
            broadcast_interval_ms: default_broadcast_interval(),
            peer_timeout_sec: default_peer_timeout(),
            enable_udp: true,
            enable_mdns: false,
        }
    }
}

/// Relay server target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Relay server host; empty = do not connect
    #[serde(default)]
    pub host: String,
    /// Relay server port
    #[serde(default = "default_relay_port")]
    pub port: u16,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_relay_port(),
        }
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Shared session code; empty disables membership filtering
    #[serde(default)]
    pub session_code: String,
    /// Encrypt application payloads in envelopes
    #[serde(default)]
    pub encryption_enabled: bool,
    /// Carriers to instantiate
    #[serde(default)]
    pub transports_enabled: TransportsEnabled,
    /// Selection strategy
    #[serde(default)]
    pub transport_strategy: StrategyName,
    /// TCP/QUIC listen port (0 = ephemeral)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Connection pool cap; LRU eviction beyond
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Reconnect dropped outbound TCP peers
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Global upload cap in bytes per second (0 = unlimited)
    #[serde(default)]
    pub global_upload_bps: u64,
    /// Global download cap in bytes per second (0 = unlimited)
    #[serde(default)]
    pub global_download_bps: u64,
    /// Discovery options
    #[serde(default)]
    pub discovery: DiscoverySection,
    /// Relay server target
    #[serde(default)]
    pub relay: RelaySection,
    /// Directory tree to watch and sync
    #[serde(default = "default_watch_root")]
    pub watch_root: PathBuf,
    /// Broadcast changes to peers
    #[serde(default = "default_true")]
    pub sync_enabled: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        // Round-trips through serde so the defaults live in one place.
        toml::from_str("").expect("empty config must deserialize")
    }
}

fn default_true() -> bool {
    true
}
fn default_discovery_port() -> u16 {
    9999
}
fn default_broadcast_interval() -> u64 {
    5_000
}
fn default_peer_timeout() -> u64 {
    60
}
fn default_relay_port() -> u16 {
    9471
}
fn default_listen_port() -> u16 {
    9470
}
fn default_max_connections() -> usize {
    64
}
fn default_watch_root() -> PathBuf {
    PathBuf::from(".")
}

impl DaemonConfig {
    /// Load and validate a TOML config file.
    ///
    /// # Errors
    ///
    /// I/O, parse or validation failures; all fatal.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate option combinations.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.session_code.is_empty() && self.session_code.len() < 6 {
            return Err(ConfigError::Invalid(
                "session_code must be at least 6 characters".into(),
            ));
        }
        if self.encryption_enabled && self.session_code.is_empty() {
            return Err(ConfigError::Invalid(
                "encryption_enabled requires a session_code".into(),
            ));
        }
        if !self.transports_enabled.any() {
            return Err(ConfigError::Invalid(
                "at least one transport must be enabled".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.discovery.broadcast_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "discovery.broadcast_interval_ms must be positive".into(),
            ));
        }
        if self.watch_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("watch_root must be set".into()));
        }
        Ok(())
    }

    /// Serialise back to TOML (for `init-config`).
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}
