//! Transport contract shared by every carrier.
//!
//! All transports (TCP, QUIC, WebRTC, relay) expose this exact interface;
//! the registry and the network façade never special-case a carrier. Peers
//! are addressed by their printable identifier, established during the
//! handshake.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::TransportError;
use crate::quality::ConnectionQuality;

/// Carrier kinds, ordered by direct-connection priority.
///
/// The `Ord` derive encodes the failover priority: TCP > QUIC > WebRTC >
/// Relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportKind {
    /// Direct TCP with length-prefixed framing
    Tcp,
    /// QUIC over UDP (quinn)
    Quic,
    /// Signalled data channel (WebRTC-style)
    WebRtc,
    /// Tunnelled through a rendezvous relay server
    Relay,
}

impl TransportKind {
    /// All kinds in failover priority order.
    pub const PRIORITY_ORDER: [TransportKind; 4] = [
        TransportKind::Tcp,
        TransportKind::Quic,
        TransportKind::WebRtc,
        TransportKind::Relay,
    ];
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Quic => write!(f, "QUIC"),
            Self::WebRtc => write!(f, "WebRTC"),
            Self::Relay => write!(f, "Relay"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "quic" => Ok(Self::Quic),
            "webrtc" => Ok(Self::WebRtc),
            "relay" => Ok(Self::Relay),
            _ => Err(()),
        }
    }
}

/// Per-peer connection state machine.
///
/// `Disconnected → Connecting → Connected → {Reconnecting, Disconnected,
/// Failed}`. `Connected` is only entered after a completed handshake;
/// `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Handshake complete, traffic flowing
    Connected,
    /// Lost connection, automatic reconnect in progress
    Reconnecting,
    /// Connection attempt failed permanently
    Failed,
}

/// Transport event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// Peer finished the handshake
    Connected,
    /// Peer went away; always the last event for a peer
    Disconnected,
    /// A complete payload frame arrived
    DataReceived,
    /// Quality metrics changed significantly
    QualityChanged,
    /// Asynchronous carrier failure
    Error,
}

/// Payload delivered to the event sink.
#[derive(Debug, Clone)]
pub struct TransportEventData {
    /// What happened
    pub event: TransportEvent,
    /// Which carrier reported it
    pub transport: TransportKind,
    /// Affected peer
    pub peer_id: String,
    /// Human-readable detail for `Error` events
    pub message: String,
    /// Frame payload for `DataReceived`
    pub data: Vec<u8>,
    /// Snapshot for `QualityChanged`
    pub quality: Option<ConnectionQuality>,
}

impl TransportEventData {
    /// Convenience constructor without payload.
    #[must_use]
    pub fn new(event: TransportEvent, transport: TransportKind, peer_id: impl Into<String>) -> Self {
        Self {
            event,
            transport,
            peer_id: peer_id.into(),
            message: String::new(),
            data: Vec::new(),
            quality: None,
        }
    }
}

/// Callback invoked for every transport event.
///
/// `Connected` precedes any `DataReceived` for the same peer and
/// `Disconnected` is last; sinks must not block.
pub type EventSink = Arc<dyn Fn(TransportEventData) + Send + Sync>;

/// Contract implemented by every carrier.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Carrier kind.
    fn kind(&self) -> TransportKind;

    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Start accepting inbound connections on `port`.
    ///
    /// Carriers without a listening concept return `Ok(())` without doing
    /// anything.
    async fn start_listening(&self, port: u16) -> Result<(), TransportError>;

    /// Stop accepting inbound connections. Established peers stay up.
    async fn stop_listening(&self);

    /// Connect to a remote peer and run the handshake.
    ///
    /// Returns the authenticated peer identifier.
    async fn connect(
        &self,
        address: &str,
        port: u16,
        expected_peer: Option<&str>,
    ) -> Result<String, TransportError>;

    /// Tear down the connection to `peer`.
    async fn disconnect(&self, peer: &str);

    /// Send one framed payload to `peer`, respecting the bandwidth limiter.
    ///
    /// Sends to the same peer are serialised and delivered in submission
    /// order.
    async fn send(&self, peer: &str, data: &[u8]) -> Result<(), TransportError>;

    /// Whether `peer` currently has a completed connection.
    fn is_connected(&self, peer: &str) -> bool;

    /// Connection state for `peer`.
    fn state(&self, peer: &str) -> ConnectionState;

    /// Quality snapshot for `peer`.
    fn quality(&self, peer: &str) -> ConnectionQuality;

    /// Identifiers of all connected peers.
    fn connected_peers(&self) -> Vec<String>;

    /// Measure round-trip time to `peer` in milliseconds; -1 on failure.
    async fn measure_rtt(&self, peer: &str) -> i64;

    /// Install the event sink. Replaces any previous sink.
    fn set_event_sink(&self, sink: EventSink);

    /// Shut the transport down. Idempotent; outstanding sends fail with
    /// [`TransportError::Closed`].
    async fn shutdown(&self);
}
