//! Client-side relay transport.
//!
//! Maintains a single TCP connection to a rendezvous server and tunnels
//! all peer traffic through it. `start_listening` is a no-op: the relay
//! connects outward. The connection is re-established automatically after
//! a fixed delay while the transport is running, and a heartbeat keeps
//! the server-side registration alive (and doubles as the RTT probe).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::protocol::{
    RelayMessageType, RelayPeerInfo, encode_data_payload, encode_message, parse_data_payload,
    parse_peer_list, read_message,
};
use crate::CONNECT_TIMEOUT;
use crate::bandwidth::BandwidthManager;
use crate::error::TransportError;
use crate::handshake::HandshakeAuth;
use crate::quality::ConnectionQuality;
use crate::transport::{
    ConnectionState, EventSink, PeerTransport, TransportEvent, TransportEventData, TransportKind,
};

/// Relay transport tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayTransportConfig {
    /// Delay before reconnecting after losing the server
    pub reconnect_delay: Duration,
    /// Heartbeat interval
    pub heartbeat_interval: Duration,
}

impl Default for RelayTransportConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

struct Inner {
    auth: Arc<dyn HandshakeAuth>,
    bandwidth: Arc<BandwidthManager>,
    config: RelayTransportConfig,
    /// Tunnel write queue; present while the server link is up.
    write_tx: std::sync::RwLock<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    server_target: std::sync::Mutex<Option<(String, u16)>>,
    server_connected: AtomicBool,
    peer_states: DashMap<String, ConnectionState>,
    peer_quality: DashMap<String, ConnectionQuality>,
    relay_peers: DashMap<String, RelayPeerInfo>,
    connect_waiters: DashMap<String, Arc<Notify>>,
    event_sink: std::sync::RwLock<Option<EventSink>>,
    running: AtomicBool,
    heartbeat_sent: std::sync::Mutex<Option<Instant>>,
    heartbeat_rtt_ms: AtomicI64,
}

impl Inner {
    fn emit(&self, data: TransportEventData) {
        let sink = self.event_sink.read().unwrap().clone();
        if let Some(sink) = sink {
            sink(data);
        }
    }

    fn emit_simple(&self, event: TransportEvent, peer: &str) {
        self.emit(TransportEventData::new(event, TransportKind::Relay, peer));
    }

    fn queue(&self, kind: RelayMessageType, payload: &[u8]) -> Result<(), TransportError> {
        let guard = self.write_tx.read().unwrap();
        match guard.as_ref() {
            Some(tx) => tx
                .send(encode_message(kind, payload))
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::NotConnected("relay server".into())),
        }
    }

    fn drop_all_peers(&self) {
        let peers: Vec<String> = self.peer_states.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            self.peer_states.remove(&peer);
            self.peer_quality.remove(&peer);
            self.emit_simple(TransportEvent::Disconnected, &peer);
        }
        self.relay_peers.clear();
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf, mut stop: watch::Receiver<bool>) {
        loop {
            let message = tokio::select! {
                _ = stop.changed() => break,
                message = read_message(&mut reader) => message,
            };
            let (kind, payload) = match message {
                Ok(msg) => msg,
                Err(err) => {
                    if self.running.load(Ordering::SeqCst) {
                        warn!(%err, "relay server connection lost");
                    }
                    break;
                }
            };
            self.handle_message(kind, payload).await;
        }

        self.server_connected.store(false, Ordering::SeqCst);
        *self.write_tx.write().unwrap() = None;
        self.drop_all_peers();
        self.schedule_reconnect();
    }

    async fn handle_message(&self, kind: RelayMessageType, payload: Vec<u8>) {
        match kind {
            RelayMessageType::RegisterAck => {
                info!("relay registration acknowledged");
            }
            RelayMessageType::PeerList => {
                let peers = parse_peer_list(&payload);
                let local = self.auth.local_peer_id();
                self.relay_peers.clear();
                for peer in peers {
                    if peer.peer_id == local {
                        continue;
                    }
                    // Listed peers are reachable through the tunnel.
                    self.peer_states
                        .insert(peer.peer_id.clone(), ConnectionState::Connected);
                    self.relay_peers.insert(peer.peer_id.clone(), peer);
                }
                debug!(count = self.relay_peers.len(), "relay peer list updated");
            }
            RelayMessageType::ConnectAck => {
                let peer = String::from_utf8_lossy(&payload).to_string();
                self.peer_states
                    .insert(peer.clone(), ConnectionState::Connected);
                if let Some(waiter) = self.connect_waiters.get(&peer) {
                    waiter.notify_waiters();
                }
                info!(peer, "relay peer connected");
                self.emit_simple(TransportEvent::Connected, &peer);
            }
            RelayMessageType::Data => {
                let Some((peer, bytes)) = parse_data_payload(&payload) else {
                    return;
                };
                self.bandwidth.request_download(&peer, bytes.len()).await;
                self.emit(TransportEventData {
                    event: TransportEvent::DataReceived,
                    transport: TransportKind::Relay,
                    peer_id: peer,
                    message: String::new(),
                    data: bytes,
                    quality: None,
                });
            }
            RelayMessageType::Disconnect => {
                let peer = String::from_utf8_lossy(&payload).to_string();
                self.peer_states.remove(&peer);
                self.peer_quality.remove(&peer);
                self.relay_peers.remove(&peer);
                self.emit_simple(TransportEvent::Disconnected, &peer);
            }
            RelayMessageType::Heartbeat => {
                let sent = self.heartbeat_sent.lock().unwrap().take();
                if let Some(sent) = sent {
                    let rtt = sent.elapsed().as_millis().max(1) as i64;
                    self.heartbeat_rtt_ms.store(rtt, Ordering::Relaxed);
                }
            }
            RelayMessageType::Error => {
                let reason = String::from_utf8_lossy(&payload).to_string();
                debug!(reason, "relay error");
                self.emit(TransportEventData {
                    event: TransportEvent::Error,
                    transport: TransportKind::Relay,
                    peer_id: String::new(),
                    message: reason,
                    data: Vec::new(),
                    quality: None,
                });
            }
            RelayMessageType::Register | RelayMessageType::Connect => {}
        }
    }

    fn schedule_reconnect(self: Arc<Self>) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let target = self.server_target.lock().unwrap().clone();
        let Some((host, port)) = target else {
            return;
        };
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.reconnect_delay).await;
            if !inner.running.load(Ordering::SeqCst)
                || inner.server_connected.load(Ordering::SeqCst)
            {
                return;
            }
            info!(host, port, "reconnecting to relay server");
            if let Err(err) = inner.clone().connect_server(&host, port).await {
                warn!(%err, "relay reconnect failed");
                inner.schedule_reconnect();
            }
        });
    }

    async fn connect_server(self: Arc<Self>, host: &str, port: u16) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("{host}:{port}: timed out")))?
            .map_err(|e| TransportError::ConnectionFailed(format!("{host}:{port}: {e}")))?;
        stream.set_nodelay(true).ok();
        let (reader, mut writer) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if writer.write_all(&message).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        *self.server_target.lock().unwrap() = Some((host.to_string(), port));
        *self.write_tx.write().unwrap() = Some(tx);
        self.server_connected.store(true, Ordering::SeqCst);

        // Register and ask who else is here.
        let registration = format!(
            "{}|{}",
            self.auth.local_peer_id(),
            self.auth.session_code_hash()
        );
        self.queue(RelayMessageType::Register, registration.as_bytes())?;
        self.queue(RelayMessageType::PeerList, b"")?;

        let (stop_tx, stop_rx) = watch::channel(false);
        // Stop the read loop when the transport shuts down; tie the stop
        // sender to the heartbeat task which exits on `running == false`.
        let inner = self.clone();
        tokio::spawn(async move {
            inner.read_loop(reader, stop_rx).await;
        });

        let hb = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hb.config.heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !hb.running.load(Ordering::SeqCst)
                    || !hb.server_connected.load(Ordering::SeqCst)
                {
                    let _ = stop_tx.send(true);
                    break;
                }
                *hb.heartbeat_sent.lock().unwrap() = Some(Instant::now());
                if hb.queue(RelayMessageType::Heartbeat, b"").is_err() {
                    break;
                }
            }
        });

        info!(host, port, "connected to relay server");
        Ok(())
    }
}

/// Relay carrier implementing [`PeerTransport`].
pub struct RelayTransport {
    inner: Arc<Inner>,
}

impl RelayTransport {
    /// Create a relay transport.
    #[must_use]
    pub fn new(
        auth: Arc<dyn HandshakeAuth>,
        bandwidth: Arc<BandwidthManager>,
        config: RelayTransportConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                auth,
                bandwidth,
                config,
                write_tx: std::sync::RwLock::new(None),
                server_target: std::sync::Mutex::new(None),
                server_connected: AtomicBool::new(false),
                peer_states: DashMap::new(),
                peer_quality: DashMap::new(),
                relay_peers: DashMap::new(),
                connect_waiters: DashMap::new(),
                event_sink: std::sync::RwLock::new(None),
                running: AtomicBool::new(true),
                heartbeat_sent: std::sync::Mutex::new(None),
                heartbeat_rtt_ms: AtomicI64::new(-1),
            }),
        }
    }

    /// Connect and register with a relay server.
    ///
    /// # Errors
    ///
    /// Fails when the server is unreachable; an established link that
    /// later drops reconnects automatically.
    pub async fn connect_server(&self, host: &str, port: u16) -> Result<(), TransportError> {
        self.inner.clone().connect_server(host, port).await
    }

    /// Disconnect from the relay server and stop reconnecting to it.
    pub async fn disconnect_server(&self) {
        *self.inner.server_target.lock().unwrap() = None;
        self.inner.server_connected.store(false, Ordering::SeqCst);
        let _ = self.inner.queue(RelayMessageType::Disconnect, b"");
        *self.inner.write_tx.write().unwrap() = None;
        self.inner.drop_all_peers();
    }

    /// Whether the server link is up.
    #[must_use]
    pub fn server_connected(&self) -> bool {
        self.inner.server_connected.load(Ordering::SeqCst)
    }

    /// Peers currently advertised by the relay.
    #[must_use]
    pub fn relay_peers(&self) -> Vec<RelayPeerInfo> {
        self.inner
            .relay_peers
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    /// Ask the server for a fresh peer list.
    pub fn request_peer_list(&self) {
        let _ = self.inner.queue(RelayMessageType::PeerList, b"");
    }
}

#[async_trait]
impl PeerTransport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn name(&self) -> &'static str {
        "relay"
    }

    async fn start_listening(&self, _port: u16) -> Result<(), TransportError> {
        // The relay connects outward; nothing listens locally.
        Ok(())
    }

    async fn stop_listening(&self) {}

    async fn connect(
        &self,
        address: &str,
        _port: u16,
        expected_peer: Option<&str>,
    ) -> Result<String, TransportError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.server_connected() {
            return Err(TransportError::NotConnected("relay server".into()));
        }

        // Through a relay "address" is the peer identifier.
        let target = expected_peer
            .filter(|p| !p.is_empty())
            .unwrap_or(address)
            .to_string();

        if self.is_connected(&target) {
            return Ok(target);
        }

        let waiter = Arc::new(Notify::new());
        self.inner
            .connect_waiters
            .insert(target.clone(), waiter.clone());
        self.inner
            .peer_states
            .insert(target.clone(), ConnectionState::Connecting);

        // Register interest before the request so the ack cannot slip
        // between send and wait.
        let notified = waiter.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        self.inner
            .queue(RelayMessageType::Connect, target.as_bytes())?;

        let _ = timeout(CONNECT_TIMEOUT, &mut notified).await;
        self.inner.connect_waiters.remove(&target);

        if self.is_connected(&target) {
            return Ok(target);
        }
        self.inner.peer_states.remove(&target);
        Err(TransportError::ConnectionFailed(format!(
            "relay connect to {target} timed out"
        )))
    }

    async fn disconnect(&self, peer: &str) {
        let _ = self
            .inner
            .queue(RelayMessageType::Disconnect, peer.as_bytes());
        if self.inner.peer_states.remove(peer).is_some() {
            self.inner.peer_quality.remove(peer);
            self.inner.relay_peers.remove(peer);
            self.inner.emit_simple(TransportEvent::Disconnected, peer);
        }
    }

    async fn send(&self, peer: &str, data: &[u8]) -> Result<(), TransportError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.server_connected() {
            return Err(TransportError::NotConnected("relay server".into()));
        }

        self.inner.bandwidth.request_upload(peer, data.len()).await;
        let payload = encode_data_payload(peer, data)?;
        self.inner.queue(RelayMessageType::Data, &payload)
    }

    fn is_connected(&self, peer: &str) -> bool {
        self.inner
            .peer_states
            .get(peer)
            .map(|s| *s == ConnectionState::Connected)
            .unwrap_or(false)
    }

    fn state(&self, peer: &str) -> ConnectionState {
        self.inner
            .peer_states
            .get(peer)
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn quality(&self, peer: &str) -> ConnectionQuality {
        self.inner
            .peer_quality
            .get(peer)
            .map(|q| q.clone())
            .unwrap_or_default()
    }

    fn connected_peers(&self) -> Vec<String> {
        self.inner
            .peer_states
            .iter()
            .filter(|e| *e.value() == ConnectionState::Connected)
            .map(|e| e.key().clone())
            .collect()
    }

    async fn measure_rtt(&self, peer: &str) -> i64 {
        if !self.is_connected(peer) {
            return -1;
        }
        // The tunnel RTT dominates; reuse the heartbeat measurement and
        // fall back to a conservative relay estimate.
        let hb = self.inner.heartbeat_rtt_ms.load(Ordering::Relaxed);
        let rtt = if hb > 0 { hb } else { 100 };

        let mut entry = self
            .inner
            .peer_quality
            .entry(peer.to_string())
            .or_default();
        let jitter = if entry.rtt_ms >= 0.0 {
            (rtt as f64 - entry.rtt_ms).abs()
        } else {
            0.0
        };
        let loss = entry.loss_percent;
        entry.update_ewma(rtt as f64, jitter, loss);
        rtt
    }

    fn set_event_sink(&self, sink: EventSink) {
        *self.inner.event_sink.write().unwrap() = Some(sink);
    }

    async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.disconnect_server().await;
        info!("relay transport shut down");
    }
}
