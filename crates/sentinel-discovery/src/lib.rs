//! # SentinelFS Discovery
//!
//! LAN peer discovery for the SentinelFS daemon.
//!
//! This crate provides:
//! - UDP broadcast announcements with exponential backoff
//! - Session-code filtering of inbound announcements (by hash, the code
//!   itself never leaves the process)
//! - Stale-peer pruning
//! - An mDNS extension point (`_sentinelfs._tcp`), currently a stub
//!
//! Announcements are single datagrams of pipe-delimited text:
//!
//! ```text
//! FALCON_DISCOVERY|peer_id|tcp_port|session_code_hash|version|platform
//! ```
//!
//! The legacy `SENTINEL_DISCOVERY` tag is accepted inbound.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod mdns;
pub mod udp;

pub use udp::{
    DiscoveredPeer, DiscoveryCallback, DiscoveryConfig, DiscoveryService, DiscoveryStats,
};

use thiserror::Error;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Socket could not bind
    #[error("failed to bind discovery socket: {0}")]
    Bind(String),

    /// I/O failure on the discovery socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested mechanism is not available on this build
    #[error("discovery mechanism unavailable: {0}")]
    Unsupported(&'static str),
}

/// Default discovery UDP port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9999;

/// Modern announcement tag.
pub const DISCOVERY_TAG: &str = "FALCON_DISCOVERY";

/// Legacy announcement tag, accepted inbound only.
pub const LEGACY_DISCOVERY_TAG: &str = "SENTINEL_DISCOVERY";
