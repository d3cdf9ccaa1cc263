//! # SentinelFS Transport
//!
//! Multi-carrier transport layer for the SentinelFS peer network.
//!
//! This crate provides:
//! - **Transport contract**: one [`PeerTransport`] trait implemented by every
//!   carrier, so upper layers never know which wire bytes travel on
//! - **TCP transport**: length-prefixed framing, connection pool with LRU
//!   eviction, opt-in auto-reconnect
//! - **QUIC transport**: quinn/rustls carrier, one uni stream per message
//! - **WebRTC-style transport**: signalled connection setup with a
//!   reliable-ordered datagram channel (no listening port)
//! - **Relay transport + server**: rendezvous forwarding for peers that
//!   cannot reach each other directly
//! - **Authenticated handshake**: three-phase session-code handshake run
//!   over any stream carrier
//! - **Registry & selector**: per-peer transport binding, quality cache,
//!   five selection strategies, failover
//! - **Bandwidth limiting**: token buckets with optional LEDBAT-style
//!   delay-based rate control
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                TransportRegistry (selection)              │
//! ├──────────┬───────────┬──────────────┬─────────────────────┤
//! │   TCP    │   QUIC    │   WebRTC     │       Relay         │
//! ├──────────┴───────────┴──────────────┴─────────────────────┤
//! │        Handshake · Framing · BandwidthManager             │
//! └───────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bandwidth;
pub mod error;
#[cfg(test)]
pub(crate) mod test_support;
pub mod framing;
pub mod handshake;
pub mod quality;
pub mod quic;
pub mod registry;
pub mod relay;
pub mod tcp;
pub mod transport;
pub mod webrtc;

pub use bandwidth::{BandwidthLimiter, BandwidthManager, CongestionStats};
pub use error::TransportError;
pub use handshake::HandshakeAuth;
pub use quality::{ConnectionQuality, SelectionContext};
pub use quic::QuicTransport;
pub use registry::{SelectionStrategy, TransportBinding, TransportRegistry};
pub use relay::{RelayServer, RelayTransport, RelayTransportConfig};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use transport::{
    ConnectionState, EventSink, PeerTransport, TransportEvent, TransportEventData, TransportKind,
};
pub use webrtc::{SignalKind, SignalMessage, WebRtcTransport};

/// Protocol version carried in handshake and discovery messages.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum framed payload size: 100 MiB. Oversized frames close the
/// connection.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Handshake receive timeout per message.
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Connect timeout for outbound stream connections.
pub const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
