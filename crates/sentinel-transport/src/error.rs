//! Error types for the SentinelFS transport layer.

use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport has been shut down
    #[error("transport is closed")]
    Closed,

    /// No connection exists for the requested peer
    #[error("peer not connected: {0}")]
    NotConnected(String),

    /// Handshake did not complete within the timeout
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Remote side rejected the handshake
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Handshake message was malformed or out of sequence
    #[error("handshake protocol violation: {0}")]
    HandshakeProtocol(String),

    /// Frame exceeded the maximum allowed size
    #[error("oversize frame: {0} bytes")]
    Oversize(usize),

    /// Listener could not bind
    #[error("failed to bind: {0}")]
    BindFailed(String),

    /// Outbound connection failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection pool is at capacity and nothing could be evicted
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Signalled transport has no signalling channel wired
    #[error("signalling channel unavailable")]
    SignalingUnavailable,

    /// Peer identifier exceeds the wire limit
    #[error("peer identifier too long: {0} bytes")]
    PeerIdTooLong(usize),

    /// TLS / certificate setup failure (QUIC)
    #[error("TLS configuration error: {0}")]
    Tls(String),
}
