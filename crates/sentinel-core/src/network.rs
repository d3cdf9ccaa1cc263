//! Network façade: the one surface upper layers talk to.
//!
//! Owns the transport registry, bandwidth manager, discovery service and
//! session manager, and fans transport events onto the event bus:
//!
//! - outbound: seal with the session manager (when encryption is on),
//!   pick a carrier through the registry, hand the envelope over
//! - inbound: account, decrypt (drops are silent, counted), then either
//!   route WebRTC signalling or publish a [`BusEvent::Message`]
//! - `Connected` binds the peer in the registry and upserts storage;
//!   `Disconnected` unbinds and purges cached RTT
//!
//! WebRTC signalling rides inside ordinary payloads over whichever
//! carrier already connects the two peers, prefixed `FALCON_SIGNAL`.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use sentinel_discovery::{DiscoveryConfig, DiscoveryService};
use sentinel_transport::{
    BandwidthManager, ConnectionQuality, PeerTransport, QuicTransport, RelayTransport,
    RelayTransportConfig, SelectionContext, TcpTransport, TcpTransportConfig, TransportError,
    TransportEvent, TransportEventData, TransportKind, TransportRegistry, WebRtcTransport,
    webrtc::{SignalKind, SignalMessage},
};

use crate::bus::{BusEvent, EventBus, topics};
use crate::config::DaemonConfig;
use crate::metrics::Metrics;
use crate::session::{SessionError, SessionManager};
use crate::storage::{PeerRecord, PeerStatus, StorageGateway};

/// Signalling prefix on the wire (legacy prefix accepted inbound).
const SIGNAL_TAG: &str = "FALCON_SIGNAL";
const LEGACY_SIGNAL_TAG: &str = "SENTINEL_SIGNAL";

/// Façade-level errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// No usable transport for the peer
    #[error("no transport available for peer {0}")]
    NoTransport(String),

    /// Carrier failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Envelope sealing failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Discovery failure
    #[error(transparent)]
    Discovery(#[from] sentinel_discovery::DiscoveryError),
}

struct NetInner {
    config: DaemonConfig,
    session: Arc<SessionManager>,
    registry: Arc<TransportRegistry>,
    bandwidth: Arc<BandwidthManager>,
    discovery: Arc<DiscoveryService>,
    storage: Arc<dyn StorageGateway>,
    bus: EventBus,
    metrics: Arc<Metrics>,
    tcp: Option<Arc<TcpTransport>>,
    relay: Option<Arc<RelayTransport>>,
    webrtc: Option<Arc<WebRtcTransport>>,
    rtt_cache: DashMap<String, i64>,
}

impl NetInner {
    fn on_transport_event(&self, event: TransportEventData) {
        match event.event {
            TransportEvent::Connected => {
                self.registry.bind_peer(&event.peer_id, event.transport);
                self.metrics
                    .connections
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

                // Keep the peer table current; discovery may already have
                // recorded an address for this peer.
                if self
                    .storage
                    .update_peer_status(&event.peer_id, PeerStatus::Active)
                    .is_err()
                {
                    let _ = self
                        .storage
                        .add_peer(PeerRecord::new(event.peer_id.clone(), "", 0));
                }

                self.bus.publish(
                    topics::PEER_CONNECTED,
                    &BusEvent::PeerConnected {
                        peer_id: event.peer_id.clone(),
                        transport: event.transport.to_string(),
                    },
                );
            }
            TransportEvent::Disconnected => {
                // Only dissolve the binding if this carrier held it.
                if let Some(binding) = self.registry.binding(&event.peer_id) {
                    if binding.active == event.transport {
                        self.registry.unbind_peer(&event.peer_id);
                    }
                }
                self.rtt_cache.remove(&event.peer_id);
                self.metrics
                    .disconnections
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let _ = self
                    .storage
                    .update_peer_status(&event.peer_id, PeerStatus::Disconnected);

                self.bus.publish(
                    topics::PEER_DISCONNECTED,
                    &BusEvent::PeerDisconnected {
                        peer_id: event.peer_id.clone(),
                    },
                );
            }
            TransportEvent::DataReceived => {
                self.metrics.add_bytes_received(event.data.len() as u64);
                self.handle_payload(&event.peer_id, event.data);
            }
            TransportEvent::QualityChanged => {
                if let Some(quality) = event.quality {
                    let rtt = quality.ewma_rtt_ms;
                    self.registry
                        .update_quality(&event.peer_id, event.transport, quality);
                    self.bus.publish(
                        topics::QUALITY_CHANGED,
                        &BusEvent::QualityChanged {
                            peer_id: event.peer_id.clone(),
                            transport: event.transport.to_string(),
                            rtt_ms: rtt,
                        },
                    );
                }
            }
            TransportEvent::Error => {
                self.metrics
                    .transport_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                debug!(
                    peer = event.peer_id,
                    transport = %event.transport,
                    message = event.message,
                    "transport error"
                );
            }
        }
    }

    /// Decrypt (when enabled), route signalling, publish everything else.
    fn handle_payload(&self, peer: &str, payload: Vec<u8>) {
        let plaintext = if self.session.encryption_enabled() {
            match self.session.decrypt(&payload, peer) {
                Ok(pt) => pt,
                Err(SessionError::Replay { .. }) => {
                    self.metrics
                        .replay_drops
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return;
                }
                Err(_) => {
                    self.metrics
                        .auth_failures
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return;
                }
            }
        } else {
            payload
        };

        self.metrics
            .messages_received
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        // Signalling for the WebRTC carrier rides inside the payload
        // stream of whichever carrier already connects the peers.
        if let Ok(text) = std::str::from_utf8(&plaintext) {
            if text.starts_with(SIGNAL_TAG) || text.starts_with(LEGACY_SIGNAL_TAG) {
                if let Some(signal) = parse_signal(text) {
                    if signal.to == self.session.peer_id() {
                        if let Some(webrtc) = self.webrtc.clone() {
                            tokio::spawn(async move {
                                webrtc.handle_signal(signal).await;
                            });
                        }
                    }
                }
                return;
            }
        }

        self.bus.publish(
            topics::MESSAGE,
            &BusEvent::Message {
                peer_id: peer.to_string(),
                payload: plaintext,
            },
        );
    }

    async fn send_to_peer(&self, peer: &str, payload: &[u8]) -> Result<(), NetworkError> {
        let wire = if self.session.encryption_enabled() {
            match self.session.encrypt(payload, peer) {
                Ok(wire) => wire,
                Err(err) => {
                    self.metrics
                        .encryption_errors
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return Err(err.into());
                }
            }
        } else {
            payload.to_vec()
        };

        let context = SelectionContext {
            peer_id: peer.to_string(),
            payload_size: wire.len(),
            requires_reliability: true,
            low_latency: false,
        };
        let transport = self
            .registry
            .select_transport(peer, &context)
            .ok_or_else(|| NetworkError::NoTransport(peer.to_string()))?;

        transport.send(peer, &wire).await?;
        self.metrics.add_bytes_sent(wire.len() as u64);
        self.metrics
            .messages_sent
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}

/// Serialise a signalling message for the wire.
fn encode_signal(msg: &SignalMessage) -> String {
    let kind = match msg.kind {
        SignalKind::Offer => "OFFER",
        SignalKind::Answer => "ANSWER",
        SignalKind::Bye => "BYE",
    };
    format!(
        "{SIGNAL_TAG}|{kind}|{}|{}|{}|{}|{}|{}",
        msg.from, msg.to, msg.candidate, msg.code_hash, msg.nonce, msg.digest
    )
}

/// Parse a signalling message from the wire.
fn parse_signal(text: &str) -> Option<SignalMessage> {
    let body = text
        .strip_prefix(SIGNAL_TAG)
        .or_else(|| text.strip_prefix(LEGACY_SIGNAL_TAG))?
        .strip_prefix('|')?;
    let parts: Vec<&str> = body.split('|').collect();
    if parts.len() < 7 {
        return None;
    }
    let kind = match parts[0] {
        "OFFER" => SignalKind::Offer,
        "ANSWER" => SignalKind::Answer,
        "BYE" => SignalKind::Bye,
        _ => return None,
    };
    Some(SignalMessage {
        kind,
        from: parts[1].to_string(),
        to: parts[2].to_string(),
        candidate: parts[3].to_string(),
        code_hash: parts[4].to_string(),
        nonce: parts[5].to_string(),
        digest: parts[6].to_string(),
    })
}

/// The public network service.
pub struct NetworkService {
    inner: Arc<NetInner>,
}

impl NetworkService {
    /// Assemble the service from its collaborators and the configuration.
    ///
    /// Transports are instantiated per the enabled set and wired to the
    /// shared event sink; nothing listens until [`NetworkService::start`].
    #[must_use]
    pub fn new(
        config: DaemonConfig,
        session: Arc<SessionManager>,
        storage: Arc<dyn StorageGateway>,
        bus: EventBus,
        metrics: Arc<Metrics>,
    ) -> Self {
        let bandwidth = Arc::new(BandwidthManager::new(
            config.global_upload_bps,
            config.global_download_bps,
        ));
        let registry = Arc::new(TransportRegistry::new());
        registry.set_strategy(config.transport_strategy.into());

        let auth: Arc<dyn sentinel_transport::HandshakeAuth> = session.clone();

        let tcp = config.transports_enabled.tcp.then(|| {
            Arc::new(TcpTransport::new(
                auth.clone(),
                bandwidth.clone(),
                TcpTransportConfig {
                    max_connections: config.max_connections,
                    auto_reconnect: config.auto_reconnect,
                    ..Default::default()
                },
            ))
        });
        let quic = config
            .transports_enabled
            .quic
            .then(|| Arc::new(QuicTransport::new(auth.clone(), bandwidth.clone())));
        let webrtc = config
            .transports_enabled
            .webrtc
            .then(|| Arc::new(WebRtcTransport::new(auth.clone(), bandwidth.clone())));
        let relay = config.transports_enabled.relay.then(|| {
            Arc::new(RelayTransport::new(
                auth.clone(),
                bandwidth.clone(),
                RelayTransportConfig::default(),
            ))
        });

        let discovery = Arc::new(DiscoveryService::new(DiscoveryConfig {
            udp_port: config.discovery.udp_port,
            broadcast_interval_ms: config.discovery.broadcast_interval_ms,
            peer_timeout_sec: config.discovery.peer_timeout_sec,
            enable_udp: config.discovery.enable_udp,
            enable_mdns: config.discovery.enable_mdns,
        }));

        let inner = Arc::new(NetInner {
            config,
            session,
            registry: registry.clone(),
            bandwidth,
            discovery,
            storage,
            bus,
            metrics,
            tcp: tcp.clone(),
            relay: relay.clone(),
            webrtc: webrtc.clone(),
            rtt_cache: DashMap::new(),
        });

        // One shared sink for every carrier.
        let sink_inner = inner.clone();
        let sink: sentinel_transport::EventSink = Arc::new(move |event| {
            sink_inner.on_transport_event(event);
        });

        if let Some(t) = &tcp {
            t.set_event_sink(sink.clone());
            registry.register(t.clone());
        }
        if let Some(t) = &quic {
            t.set_event_sink(sink.clone());
            registry.register(t.clone());
        }
        if let Some(t) = &webrtc {
            t.set_event_sink(sink.clone());
            registry.register(t.clone());

            // Outbound signalling goes through ordinary sends.
            let signal_inner = inner.clone();
            t.set_signal_sender(Arc::new(move |signal| {
                let inner = signal_inner.clone();
                let to = signal.to.clone();
                let encoded = encode_signal(&signal);
                tokio::spawn(async move {
                    if let Err(err) = inner.send_to_peer(&to, encoded.as_bytes()).await {
                        warn!(peer = to, %err, "could not route signalling message");
                    }
                });
            }));
        }
        if let Some(t) = &relay {
            t.set_event_sink(sink.clone());
            registry.register(t.clone());
        }

        // Binding changes surface on the bus.
        let binding_inner = inner.clone();
        registry.set_binding_listener(Arc::new(move |peer, kind| {
            binding_inner.bus.publish(
                topics::BINDING_CHANGED,
                &BusEvent::BindingChanged {
                    peer_id: peer.to_string(),
                    transport: kind.map(|k| k.to_string()),
                },
            );
        }));

        // Discovered peers land in storage and on the bus.
        let discovery_inner = inner.clone();
        inner.discovery.set_discovery_callback(Arc::new(move |peer| {
            let _ = discovery_inner.storage.add_peer(PeerRecord::new(
                peer.peer_id.clone(),
                peer.address.clone(),
                peer.port,
            ));
            discovery_inner.bus.publish(
                topics::PEER_DISCOVERED,
                &BusEvent::PeerDiscovered {
                    peer_id: peer.peer_id.clone(),
                    address: peer.address.clone(),
                    port: peer.port,
                },
            );
        }));

        Self { inner }
    }

    /// Apply the configured session code, start listeners, discovery and
    /// the relay link.
    ///
    /// # Errors
    ///
    /// Listener bind failures are fatal; a missing relay server is not
    /// (the transport retries).
    pub async fn start(&self) -> Result<(), NetworkError> {
        let config = &self.inner.config;

        if !config.session_code.is_empty() && self.inner.session.session_code().is_empty() {
            self.inner
                .session
                .set_session_code(&config.session_code, config.encryption_enabled)?;
        }

        if let Some(tcp) = &self.inner.tcp {
            tcp.start_listening(config.listen_port).await?;
        }
        if let Some(quic) = self.inner.registry.get(TransportKind::Quic) {
            quic.start_listening(config.listen_port).await?;
        }

        if let Some(relay) = &self.inner.relay {
            if !config.relay.host.is_empty() {
                if let Err(err) = relay
                    .connect_server(&config.relay.host, config.relay.port)
                    .await
                {
                    warn!(%err, "relay server unavailable, will retry");
                }
            }
        }

        if config.discovery.enable_udp {
            self.inner.discovery.set_local_peer(
                self.inner.session.peer_id(),
                self.tcp_listen_port(),
                &sentinel_transport::HandshakeAuth::session_code_hash(&*self.inner.session),
            );
            self.inner.discovery.start().await?;
        }

        info!(
            peer = self.inner.session.peer_id(),
            tcp_port = self.tcp_listen_port(),
            "network service started"
        );
        Ok(())
    }

    /// Actual TCP listen port (resolves ephemeral binds).
    #[must_use]
    pub fn tcp_listen_port(&self) -> u16 {
        self.inner
            .tcp
            .as_ref()
            .map(|t| t.listening_port())
            .unwrap_or(0)
    }

    /// Connect to a peer at `address:port` using the best available
    /// carrier.
    ///
    /// # Errors
    ///
    /// [`NetworkError::NoTransport`] with nothing registered, otherwise
    /// carrier errors.
    pub async fn connect(&self, address: &str, port: u16) -> Result<String, NetworkError> {
        let context = SelectionContext {
            peer_id: String::new(),
            ..Default::default()
        };
        let transport = self
            .inner
            .registry
            .select_transport("", &context)
            .ok_or_else(|| NetworkError::NoTransport(address.to_string()))?;
        Ok(transport.connect(address, port, None).await?)
    }

    /// Connect using a specific carrier.
    pub async fn connect_via(
        &self,
        kind: TransportKind,
        address: &str,
        port: u16,
        expected_peer: Option<&str>,
    ) -> Result<String, NetworkError> {
        let transport = self
            .inner
            .registry
            .get(kind)
            .ok_or_else(|| NetworkError::NoTransport(address.to_string()))?;
        Ok(transport.connect(address, port, expected_peer).await?)
    }

    /// Disconnect a peer on whatever carrier holds it.
    pub async fn disconnect(&self, peer: &str) {
        for kind in self.inner.registry.kinds() {
            if let Some(transport) = self.inner.registry.get(kind) {
                if transport.is_connected(peer) {
                    transport.disconnect(peer).await;
                }
            }
        }
    }

    /// Send an application payload to a peer (sealed when encryption is
    /// on).
    ///
    /// # Errors
    ///
    /// Sealing, selection or carrier failures.
    pub async fn send(&self, peer: &str, payload: &[u8]) -> Result<(), NetworkError> {
        self.inner.send_to_peer(peer, payload).await
    }

    /// Measure RTT to a peer on its bound (or best) carrier; records the
    /// result in storage and the quality cache.
    pub async fn measure_rtt(&self, peer: &str) -> i64 {
        let transport = match self
            .inner
            .registry
            .select_transport(peer, &SelectionContext::default())
        {
            Some(t) => t,
            None => return -1,
        };
        let rtt = transport.measure_rtt(peer).await;
        if rtt >= 0 {
            self.inner.rtt_cache.insert(peer.to_string(), rtt);
            let _ = self.inner.storage.update_latency(peer, rtt);
        }
        rtt
    }

    /// Cached RTT from the last measurement.
    #[must_use]
    pub fn cached_rtt(&self, peer: &str) -> Option<i64> {
        self.inner.rtt_cache.get(peer).map(|v| *v)
    }

    /// Replace the session code at runtime.
    ///
    /// # Errors
    ///
    /// Key derivation failures.
    pub fn set_session_code(&self, code: &str, encryption: bool) -> Result<(), NetworkError> {
        self.inner.session.set_session_code(code, encryption)?;
        self.inner.discovery.set_local_peer(
            self.inner.session.peer_id(),
            self.tcp_listen_port(),
            &sentinel_transport::HandshakeAuth::session_code_hash(&*self.inner.session),
        );
        Ok(())
    }

    /// Update the global upload cap (0 = unlimited).
    pub async fn set_upload_limit(&self, bytes_per_second: u64) {
        self.inner
            .bandwidth
            .set_global_upload_limit(bytes_per_second)
            .await;
    }

    /// Update the global download cap (0 = unlimited).
    pub async fn set_download_limit(&self, bytes_per_second: u64) {
        self.inner
            .bandwidth
            .set_global_download_limit(bytes_per_second)
            .await;
    }

    /// Connect to a relay server.
    ///
    /// # Errors
    ///
    /// [`NetworkError::NoTransport`] when the relay carrier is disabled.
    pub async fn connect_relay(&self, host: &str, port: u16) -> Result<(), NetworkError> {
        let relay = self
            .inner
            .relay
            .as_ref()
            .ok_or_else(|| NetworkError::NoTransport("relay".into()))?;
        Ok(relay.connect_server(host, port).await?)
    }

    /// Drop the relay server link.
    pub async fn disconnect_relay(&self) {
        if let Some(relay) = &self.inner.relay {
            relay.disconnect_server().await;
        }
    }

    /// Send one discovery announcement now.
    pub async fn broadcast_presence(&self) -> bool {
        self.inner.discovery.broadcast_presence().await
    }

    /// Peers connected on any carrier.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = Vec::new();
        for kind in self.inner.registry.kinds() {
            if let Some(transport) = self.inner.registry.get(kind) {
                for peer in transport.connected_peers() {
                    if !peers.contains(&peer) {
                        peers.push(peer);
                    }
                }
            }
        }
        peers
    }

    /// Whether any carrier holds a live connection to `peer`.
    #[must_use]
    pub fn is_connected(&self, peer: &str) -> bool {
        self.inner
            .registry
            .kinds()
            .iter()
            .filter_map(|k| self.inner.registry.get(*k))
            .any(|t| t.is_connected(peer))
    }

    /// Quality on the peer's bound carrier.
    #[must_use]
    pub fn quality(&self, peer: &str) -> ConnectionQuality {
        self.inner
            .registry
            .binding(peer)
            .and_then(|b| self.inner.registry.get(b.active))
            .map(|t| t.quality(peer))
            .unwrap_or_default()
    }

    /// Force a failover for `peer`; returns the new carrier kind.
    #[must_use]
    pub fn handle_failover(&self, peer: &str) -> Option<TransportKind> {
        self.inner.registry.handle_failover(peer).map(|t| t.kind())
    }

    /// The transport registry.
    #[must_use]
    pub fn registry(&self) -> Arc<TransportRegistry> {
        self.inner.registry.clone()
    }

    /// The session manager.
    #[must_use]
    pub fn session(&self) -> Arc<SessionManager> {
        self.inner.session.clone()
    }

    /// The event bus.
    #[must_use]
    pub fn bus(&self) -> EventBus {
        self.inner.bus.clone()
    }

    /// The metrics collector.
    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// The storage gateway.
    #[must_use]
    pub fn storage(&self) -> Arc<dyn StorageGateway> {
        self.inner.storage.clone()
    }

    /// The bandwidth manager.
    #[must_use]
    pub fn bandwidth(&self) -> Arc<BandwidthManager> {
        self.inner.bandwidth.clone()
    }

    /// Stop discovery and shut every carrier down. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.discovery.stop().await;
        self.inner.registry.shutdown_all().await;
        info!("network service shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::Mutex;
    use std::time::Duration;

    fn make_service(peer_id: &str, code: &str, encryption: bool) -> NetworkService {
        let session = Arc::new(SessionManager::with_kdf_iterations(peer_id, 1_000));
        if !code.is_empty() {
            session.set_session_code(code, encryption).unwrap();
        }
        let config = DaemonConfig {
            listen_port: 0,
            transports_enabled: crate::config::TransportsEnabled {
                tcp: true,
                quic: false,
                webrtc: false,
                relay: false,
            },
            discovery: crate::config::DiscoverySection {
                enable_udp: false,
                ..Default::default()
            },
            ..Default::default()
        };
        NetworkService::new(
            config,
            session,
            Arc::new(MemoryStore::new()),
            EventBus::new(),
            Arc::new(Metrics::new()),
        )
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if probe() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_connect_and_plaintext_message_flow() {
        let alpha = make_service("peer-alpha", "", false);
        let beta = make_service("peer-beta", "", false);
        alpha.start().await.unwrap();
        beta.start().await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let _sub = beta.bus().subscribe(
            topics::MESSAGE,
            Arc::new(move |event| {
                if let BusEvent::Message { peer_id, payload } = event {
                    sink.lock().unwrap().push((peer_id.clone(), payload.clone()));
                }
            }),
        );

        let port = beta.tcp_listen_port();
        let peer = alpha.connect("127.0.0.1", port).await.unwrap();
        assert_eq!(peer, "peer-beta");

        let received_probe = received.clone();
        {
            let alpha_ref = &alpha;
            wait_until(move || alpha_ref.is_connected("peer-beta")).await;
        }

        alpha.send("peer-beta", b"hello over tcp").await.unwrap();
        wait_until(move || !received_probe.lock().unwrap().is_empty()).await;

        let got = received.lock().unwrap();
        assert_eq!(got[0].0, "peer-alpha");
        assert_eq!(got[0].1, b"hello over tcp");

        assert_eq!(alpha.metrics().snapshot().messages_sent, 1);
        assert_eq!(beta.metrics().snapshot().messages_received, 1);

        alpha.shutdown().await;
        beta.shutdown().await;
    }

    #[tokio::test]
    async fn test_encrypted_message_flow_and_binding() {
        let alpha = make_service("peer-alpha", "abcdef", true);
        let beta = make_service("peer-beta", "abcdef", true);
        alpha.start().await.unwrap();
        beta.start().await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let _sub = beta.bus().subscribe(
            topics::MESSAGE,
            Arc::new(move |event| {
                if let BusEvent::Message { payload, .. } = event {
                    sink.lock().unwrap().push(payload.clone());
                }
            }),
        );

        let port = beta.tcp_listen_port();
        alpha.connect("127.0.0.1", port).await.unwrap();

        // Connected event binds the peer to TCP.
        {
            let alpha_ref = &alpha;
            wait_until(move || alpha_ref.registry().binding("peer-beta").is_some()).await;
        }
        assert_eq!(
            alpha.registry().binding("peer-beta").unwrap().active,
            TransportKind::Tcp
        );

        alpha.send("peer-beta", b"sealed payload").await.unwrap();
        let received_probe = received.clone();
        wait_until(move || !received_probe.lock().unwrap().is_empty()).await;
        assert_eq!(received.lock().unwrap()[0], b"sealed payload");

        alpha.shutdown().await;
        beta.shutdown().await;
    }

    #[tokio::test]
    async fn test_mismatched_codes_cannot_connect() {
        let alpha = make_service("peer-alpha", "abcdef", true);
        let beta = make_service("peer-beta", "zzzzzz", true);
        alpha.start().await.unwrap();
        beta.start().await.unwrap();

        let port = beta.tcp_listen_port();
        assert!(alpha.connect("127.0.0.1", port).await.is_err());
        assert!(!alpha.is_connected("peer-beta"));

        alpha.shutdown().await;
        beta.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let alpha = make_service("peer-alpha", "", false);
        alpha.start().await.unwrap();
        assert!(alpha.send("peer-ghost", b"x").await.is_err());
        alpha.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_unbinds_and_publishes() {
        let alpha = make_service("peer-alpha", "", false);
        let beta = make_service("peer-beta", "", false);
        alpha.start().await.unwrap();
        beta.start().await.unwrap();

        let disconnects = Arc::new(Mutex::new(0));
        let sink = disconnects.clone();
        let _sub = alpha.bus().subscribe(
            topics::PEER_DISCONNECTED,
            Arc::new(move |_| {
                *sink.lock().unwrap() += 1;
            }),
        );

        let port = beta.tcp_listen_port();
        alpha.connect("127.0.0.1", port).await.unwrap();
        {
            let alpha_ref = &alpha;
            wait_until(move || alpha_ref.is_connected("peer-beta")).await;
        }

        alpha.disconnect("peer-beta").await;
        let probe = disconnects.clone();
        wait_until(move || *probe.lock().unwrap() > 0).await;
        assert!(alpha.registry().binding("peer-beta").is_none());
        assert!(alpha.cached_rtt("peer-beta").is_none());

        alpha.shutdown().await;
        beta.shutdown().await;
    }

    #[tokio::test]
    async fn test_measure_rtt_updates_storage() {
        let alpha = make_service("peer-alpha", "", false);
        let beta = make_service("peer-beta", "", false);
        alpha.start().await.unwrap();
        beta.start().await.unwrap();

        let port = beta.tcp_listen_port();
        alpha.connect("127.0.0.1", port).await.unwrap();
        {
            let alpha_ref = &alpha;
            wait_until(move || alpha_ref.is_connected("peer-beta")).await;
        }

        let rtt = alpha.measure_rtt("peer-beta").await;
        assert!(rtt >= 1);
        assert_eq!(alpha.cached_rtt("peer-beta"), Some(rtt));

        alpha.shutdown().await;
        beta.shutdown().await;
    }

    #[test]
    fn test_signal_codec_roundtrip() {
        let msg = SignalMessage {
            kind: SignalKind::Answer,
            from: "peer-a".into(),
            to: "peer-b".into(),
            candidate: "10.0.0.1:5000".into(),
            code_hash: "cafe".into(),
            nonce: "0011".into(),
            digest: "beef".into(),
        };
        let encoded = encode_signal(&msg);
        assert!(encoded.starts_with("FALCON_SIGNAL|ANSWER|"));
        let parsed = parse_signal(&encoded).unwrap();
        assert_eq!(parsed.kind, SignalKind::Answer);
        assert_eq!(parsed.from, "peer-a");
        assert_eq!(parsed.to, "peer-b");
        assert_eq!(parsed.candidate, "10.0.0.1:5000");
        assert_eq!(parsed.digest, "beef");
    }

    #[test]
    fn test_signal_codec_rejects_garbage() {
        assert!(parse_signal("UPDATE_AVAILABLE|f|h|1").is_none());
        assert!(parse_signal("FALCON_SIGNAL|NOPE|a|b|c|d|e|f").is_none());
        assert!(parse_signal("FALCON_SIGNAL|OFFER|a|b").is_none());
    }

    #[test]
    fn test_legacy_signal_prefix_accepted() {
        let raw = "SENTINEL_SIGNAL|BYE|peer-a|peer-b||||";
        let parsed = parse_signal(raw).unwrap();
        assert_eq!(parsed.kind, SignalKind::Bye);
    }
}
