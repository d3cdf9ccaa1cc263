//! TCP transport: length-prefixed framed byte streams.
//!
//! - Accept loop per listening socket; every accepted socket runs the
//!   server handshake in its own task before entering the pool.
//! - One read task per peer. Read tasks hold no table lock during I/O.
//! - Connection pool with a configurable cap; at capacity the
//!   least-recently-active peer is evicted.
//! - Opt-in auto-reconnect keyed by peer identifier: outbound targets are
//!   remembered and retried after a connection drop.
//! - Sends to one peer are serialised through the write half's mutex.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bandwidth::BandwidthManager;
use crate::error::TransportError;
use crate::framing::{read_frame, write_frame};
use crate::handshake::{HandshakeAuth, client_handshake, server_handshake};
use crate::quality::ConnectionQuality;
use crate::transport::{
    ConnectionState, EventSink, PeerTransport, TransportEvent, TransportEventData, TransportKind,
};
use crate::{CONNECT_TIMEOUT, MAX_FRAME_SIZE};

/// TCP transport tuning knobs.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection pool cap; beyond it the least-recently-active peer is
    /// evicted
    pub max_connections: usize,
    /// Remember outbound targets and reconnect after drops
    pub auto_reconnect: bool,
    /// Delay between reconnect attempts
    pub reconnect_delay: Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

struct TcpPeer {
    writer: Mutex<OwnedWriteHalf>,
    state: std::sync::Mutex<ConnectionState>,
    quality: std::sync::Mutex<ConnectionQuality>,
    last_activity: std::sync::Mutex<Instant>,
    address: String,
    port: u16,
    incoming: bool,
    stop: watch::Sender<bool>,
}

impl TcpPeer {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }
}

struct Inner {
    auth: Arc<dyn HandshakeAuth>,
    bandwidth: Arc<BandwidthManager>,
    config: TcpTransportConfig,
    connections: DashMap<String, Arc<TcpPeer>>,
    reconnect_targets: DashMap<String, (String, u16)>,
    reconnecting: DashMap<String, ()>,
    event_sink: std::sync::RwLock<Option<EventSink>>,
    listener_stop: std::sync::Mutex<Option<watch::Sender<bool>>>,
    listen_port: AtomicU32,
    running: AtomicBool,
}

impl Inner {
    fn emit(&self, data: TransportEventData) {
        let sink = self.event_sink.read().unwrap().clone();
        if let Some(sink) = sink {
            sink(data);
        }
    }

    fn emit_simple(&self, event: TransportEvent, peer: &str) {
        self.emit(TransportEventData::new(event, TransportKind::Tcp, peer));
    }

    /// Make room for one more connection. Must only be called while no
    /// table entry for the new peer exists yet.
    fn ensure_capacity(&self) -> bool {
        if self.connections.len() < self.config.max_connections {
            return true;
        }

        let oldest = self
            .connections
            .iter()
            .min_by_key(|e| *e.value().last_activity.lock().unwrap())
            .map(|e| e.key().clone());

        if let Some(peer) = oldest {
            debug!(peer, "evicting least-recently-active connection");
            self.drop_connection(&peer);
        }
        self.connections.len() < self.config.max_connections
    }

    /// Remove a peer's entry, signal its read task and emit Disconnected.
    /// The entry removal is the once-only guard: whoever wins the remove
    /// emits the event.
    fn drop_connection(&self, peer: &str) {
        if let Some((_, entry)) = self.connections.remove(peer) {
            let _ = entry.stop.send(true);
            *entry.state.lock().unwrap() = ConnectionState::Disconnected;
            self.emit_simple(TransportEvent::Disconnected, peer);
        }
    }

    /// Insert a freshly handshaken connection and start its read task.
    ///
    /// Duplicate connections for an already-pooled peer are closed
    /// quietly.
    fn register(
        self: Arc<Self>,
        peer_id: &str,
        stream: TcpStream,
        address: String,
        port: u16,
        incoming: bool,
    ) -> Result<(), TransportError> {
        if self.connections.contains_key(peer_id) {
            debug!(peer = peer_id, "duplicate connection, keeping existing");
            return Ok(());
        }
        if !self.ensure_capacity() {
            return Err(TransportError::PoolExhausted);
        }

        let (read_half, write_half) = stream.into_split();
        let (stop_tx, stop_rx) = watch::channel(false);
        let entry = Arc::new(TcpPeer {
            writer: Mutex::new(write_half),
            state: std::sync::Mutex::new(ConnectionState::Connected),
            quality: std::sync::Mutex::new(ConnectionQuality::default()),
            last_activity: std::sync::Mutex::new(Instant::now()),
            address,
            port,
            incoming,
            stop: stop_tx,
        });
        self.connections.insert(peer_id.to_string(), entry);
        self.reconnecting.remove(peer_id);

        info!(peer = peer_id, incoming, "tcp peer connected");
        self.emit_simple(TransportEvent::Connected, peer_id);

        let inner = self.clone();
        let peer = peer_id.to_string();
        tokio::spawn(async move {
            inner.read_loop(peer, read_half, stop_rx).await;
        });
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        peer: String,
        mut reader: OwnedReadHalf,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = stop.changed() => break,
                frame = read_frame(&mut reader, MAX_FRAME_SIZE) => frame,
            };

            match frame {
                Ok(payload) => {
                    self.bandwidth
                        .request_download(&peer, 4 + payload.len())
                        .await;
                    if let Some(entry) = self.connections.get(&peer) {
                        entry.touch();
                    }
                    self.emit(TransportEventData {
                        event: TransportEvent::DataReceived,
                        transport: TransportKind::Tcp,
                        peer_id: peer.clone(),
                        message: String::new(),
                        data: payload,
                        quality: None,
                    });
                }
                Err(TransportError::Oversize(len)) => {
                    warn!(peer, len, "oversize frame, dropping connection");
                    self.emit(TransportEventData {
                        event: TransportEvent::Error,
                        transport: TransportKind::Tcp,
                        peer_id: peer.clone(),
                        message: format!("oversize frame: {len} bytes"),
                        data: Vec::new(),
                        quality: None,
                    });
                    break;
                }
                Err(err) => {
                    if self.running.load(Ordering::SeqCst) {
                        debug!(peer, %err, "read loop ended");
                    }
                    break;
                }
            }
        }

        self.drop_connection(&peer);
        self.maybe_reconnect(&peer);
    }

    fn maybe_reconnect(self: Arc<Self>, peer: &str) {
        if !self.config.auto_reconnect || !self.running.load(Ordering::SeqCst) {
            return;
        }
        let Some(target) = self.reconnect_targets.get(peer).map(|t| t.clone()) else {
            return;
        };
        if self.reconnecting.insert(peer.to_string(), ()).is_some() {
            return;
        }

        let inner = self.clone();
        let peer = peer.to_string();
        let (address, port) = target;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(inner.config.reconnect_delay).await;
                if !inner.running.load(Ordering::SeqCst)
                    || !inner.reconnect_targets.contains_key(&peer)
                    || inner.connections.contains_key(&peer)
                {
                    break;
                }
                debug!(peer, "attempting reconnect");
                match inner.clone().dial(&address, port, Some(&peer)).await {
                    Ok(_) => break,
                    Err(err) => debug!(peer, %err, "reconnect attempt failed"),
                }
            }
            inner.reconnecting.remove(&peer);
        });
    }

    async fn dial(
        self: Arc<Self>,
        address: &str,
        port: u16,
        expected_peer: Option<&str>,
    ) -> Result<String, TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let target = format!("{address}:{port}");
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&target))
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("{target}: timed out")))?
            .map_err(|e| TransportError::ConnectionFailed(format!("{target}: {e}")))?;
        stream.set_nodelay(true).ok();

        let peer_id = client_handshake(&mut stream, self.auth.as_ref()).await?;

        if let Some(expected) = expected_peer {
            if !expected.is_empty() && expected != peer_id {
                return Err(TransportError::ConnectionFailed(format!(
                    "expected peer {expected}, reached {peer_id}"
                )));
            }
        }

        self.reconnect_targets
            .insert(peer_id.clone(), (address.to_string(), port));
        self.register(&peer_id, stream, address.to_string(), port, false)?;
        Ok(peer_id)
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = stop.changed() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "inbound tcp connection");
                    let inner = self.clone();
                    tokio::spawn(async move {
                        inner.handle_incoming(stream, addr.ip().to_string(), addr.port()).await;
                    });
                }
                Err(err) => {
                    if self.running.load(Ordering::SeqCst) {
                        warn!(%err, "accept failed");
                    }
                    break;
                }
            }
        }
    }

    async fn handle_incoming(self: Arc<Self>, mut stream: TcpStream, address: String, port: u16) {
        stream.set_nodelay(true).ok();
        match server_handshake(&mut stream, self.auth.as_ref()).await {
            Ok(peer_id) => {
                if let Err(err) = self.register(&peer_id, stream, address, port, true) {
                    warn!(peer = peer_id, %err, "rejecting inbound connection");
                }
            }
            Err(err) => {
                debug!(address, %err, "inbound handshake failed");
            }
        }
    }
}

/// TCP carrier implementing [`PeerTransport`].
pub struct TcpTransport {
    inner: Arc<Inner>,
}

impl TcpTransport {
    /// Create a TCP transport with the given handshake state and
    /// bandwidth manager.
    #[must_use]
    pub fn new(
        auth: Arc<dyn HandshakeAuth>,
        bandwidth: Arc<BandwidthManager>,
        config: TcpTransportConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                auth,
                bandwidth,
                config,
                connections: DashMap::new(),
                reconnect_targets: DashMap::new(),
                reconnecting: DashMap::new(),
                event_sink: std::sync::RwLock::new(None),
                listener_stop: std::sync::Mutex::new(None),
                listen_port: AtomicU32::new(0),
                running: AtomicBool::new(true),
            }),
        }
    }

    /// Port the listener is bound to, or 0 when not listening. Useful
    /// when listening on an ephemeral port.
    #[must_use]
    pub fn listening_port(&self) -> u16 {
        self.inner.listen_port.load(Ordering::SeqCst) as u16
    }

    /// Number of pooled connections (any state).
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn start_listening(&self, port: u16) -> Result<(), TransportError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| TransportError::BindFailed(format!("port {port}: {e}")))?;
        let bound = listener
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?
            .port();

        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut guard = self.inner.listener_stop.lock().unwrap();
            if let Some(old) = guard.replace(stop_tx) {
                let _ = old.send(true);
            }
        }
        self.inner.listen_port.store(u32::from(bound), Ordering::SeqCst);

        info!(port = bound, "tcp listener started");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.accept_loop(listener, stop_rx).await;
        });
        Ok(())
    }

    async fn stop_listening(&self) {
        let stop = self.inner.listener_stop.lock().unwrap().take();
        if let Some(stop) = stop {
            let _ = stop.send(true);
            info!("tcp listener stopped");
        }
        self.inner.listen_port.store(0, Ordering::SeqCst);
    }

    async fn connect(
        &self,
        address: &str,
        port: u16,
        expected_peer: Option<&str>,
    ) -> Result<String, TransportError> {
        self.inner.clone().dial(address, port, expected_peer).await
    }

    async fn disconnect(&self, peer: &str) {
        self.inner.reconnect_targets.remove(peer);
        if let Some(entry) = self.inner.connections.get(peer).map(|e| e.value().clone()) {
            let mut writer = entry.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        self.inner.drop_connection(peer);
    }

    async fn send(&self, peer: &str, data: &[u8]) -> Result<(), TransportError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let entry = self
            .inner
            .connections
            .get(peer)
            .map(|e| e.value().clone())
            .ok_or_else(|| TransportError::NotConnected(peer.to_string()))?;
        if entry.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected(peer.to_string()));
        }

        self.inner.bandwidth.request_upload(peer, 4 + data.len()).await;

        let mut writer = entry.writer.lock().await;
        match write_frame(&mut *writer, data).await {
            Ok(()) => {
                entry.touch();
                Ok(())
            }
            Err(err) => {
                drop(writer);
                warn!(peer, %err, "send failed, dropping connection");
                self.inner.drop_connection(peer);
                Err(err)
            }
        }
    }

    fn is_connected(&self, peer: &str) -> bool {
        self.inner
            .connections
            .get(peer)
            .map(|e| e.state() == ConnectionState::Connected)
            .unwrap_or(false)
    }

    fn state(&self, peer: &str) -> ConnectionState {
        if let Some(entry) = self.inner.connections.get(peer) {
            return entry.state();
        }
        if self.inner.reconnecting.contains_key(peer) {
            return ConnectionState::Reconnecting;
        }
        ConnectionState::Disconnected
    }

    fn quality(&self, peer: &str) -> ConnectionQuality {
        self.inner
            .connections
            .get(peer)
            .map(|e| e.quality.lock().unwrap().clone())
            .unwrap_or_default()
    }

    fn connected_peers(&self) -> Vec<String> {
        self.inner
            .connections
            .iter()
            .filter(|e| e.value().state() == ConnectionState::Connected)
            .map(|e| e.key().clone())
            .collect()
    }

    async fn measure_rtt(&self, peer: &str) -> i64 {
        // Time a fresh connect to the peer's known address. Coarser than
        // an in-band ping but reflects a real network round trip instead
        // of local socket writability.
        let target = self
            .inner
            .connections
            .get(peer)
            .map(|e| (e.address.clone(), e.port))
            .or_else(|| self.inner.reconnect_targets.get(peer).map(|t| t.clone()));
        let Some((address, port)) = target else {
            return -1;
        };

        let start = Instant::now();
        match timeout(Duration::from_secs(2), TcpStream::connect((address.as_str(), port))).await {
            Ok(Ok(probe)) => {
                drop(probe);
                let rtt = start.elapsed().as_millis().max(1) as i64;
                if let Some(entry) = self.inner.connections.get(peer) {
                    let quality = {
                        let mut q = entry.quality.lock().unwrap();
                        let jitter = if q.rtt_ms >= 0.0 {
                            (rtt as f64 - q.rtt_ms).abs()
                        } else {
                            0.0
                        };
                        let loss_percent = q.loss_percent;
                        q.update_ewma(rtt as f64, jitter, loss_percent);
                        q.clone()
                    };
                    self.inner.emit(TransportEventData {
                        event: TransportEvent::QualityChanged,
                        transport: TransportKind::Tcp,
                        peer_id: peer.to_string(),
                        message: String::new(),
                        data: Vec::new(),
                        quality: Some(quality),
                    });
                }
                rtt
            }
            _ => -1,
        }
    }

    fn set_event_sink(&self, sink: EventSink) {
        *self.inner.event_sink.write().unwrap() = Some(sink);
    }

    async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_listening().await;
        self.inner.reconnect_targets.clear();

        let peers: Vec<String> = self
            .inner
            .connections
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for peer in peers {
            if let Some(entry) = self.inner.connections.get(&peer).map(|e| e.value().clone()) {
                let mut writer = entry.writer.lock().await;
                let _ = writer.shutdown().await;
            }
            self.inner.drop_connection(&peer);
        }
        info!("tcp transport shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StaticAuth;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    fn transport(id: &str, code: Option<&str>) -> TcpTransport {
        TcpTransport::new(
            Arc::new(StaticAuth::new(id, code)),
            Arc::new(BandwidthManager::new(0, 0)),
            TcpTransportConfig::default(),
        )
    }

    fn event_channel(t: &TcpTransport) -> mpsc::UnboundedReceiver<TransportEventData> {
        let (tx, rx) = mpsc::unbounded_channel();
        t.set_event_sink(Arc::new(move |ev| {
            let _ = tx.send(ev);
        }));
        rx
    }

    async fn wait_for_event(
        rx: &mut mpsc::UnboundedReceiver<TransportEventData>,
        event: TransportEvent,
    ) -> TransportEventData {
        loop {
            let data = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if data.event == event {
                return data;
            }
        }
    }

    #[tokio::test]
    async fn test_loopback_connect_and_send() {
        let server = transport("peer-server", Some("abcdef"));
        let client = transport("peer-client", Some("abcdef"));
        let mut server_events = event_channel(&server);
        let mut client_events = event_channel(&client);

        server.start_listening(0).await.unwrap();
        let port = server.listening_port();
        assert_ne!(port, 0);

        let peer = client.connect("127.0.0.1", port, None).await.unwrap();
        assert_eq!(peer, "peer-server");
        assert!(client.is_connected("peer-server"));

        wait_for_event(&mut client_events, TransportEvent::Connected).await;
        wait_for_event(&mut server_events, TransportEvent::Connected).await;
        assert!(server.is_connected("peer-client"));

        client.send("peer-server", b"hi").await.unwrap();
        let data = wait_for_event(&mut server_events, TransportEvent::DataReceived).await;
        assert_eq!(data.peer_id, "peer-client");
        assert_eq!(data.data, b"hi");

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_byte_send() {
        let server = transport("peer-server", None);
        let client = transport("peer-client", None);
        let mut server_events = event_channel(&server);

        server.start_listening(0).await.unwrap();
        let port = server.listening_port();
        client.connect("127.0.0.1", port, None).await.unwrap();

        wait_for_event(&mut server_events, TransportEvent::Connected).await;
        client.send("peer-server", b"").await.unwrap();
        let data = wait_for_event(&mut server_events, TransportEvent::DataReceived).await;
        assert!(data.data.is_empty());

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_code_mismatch_refused() {
        let server = transport("peer-server", Some("abcdef"));
        let client = transport("peer-client", Some("zzzzzz"));

        server.start_listening(0).await.unwrap();
        let port = server.listening_port();

        let result = client.connect("127.0.0.1", port, None).await;
        assert!(result.is_err());
        assert!(!server.is_connected("peer-client"));

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let client = transport("peer-client", None);
        assert!(matches!(
            client.send("peer-ghost", b"x").await,
            Err(TransportError::NotConnected(_))
        ));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_emits_event_and_clears_state() {
        let server = transport("peer-server", None);
        let client = transport("peer-client", None);
        let mut client_events = event_channel(&client);

        server.start_listening(0).await.unwrap();
        let port = server.listening_port();
        client.connect("127.0.0.1", port, None).await.unwrap();
        wait_for_event(&mut client_events, TransportEvent::Connected).await;

        client.disconnect("peer-server").await;
        wait_for_event(&mut client_events, TransportEvent::Disconnected).await;
        assert_eq!(client.state("peer-server"), ConnectionState::Disconnected);
        assert!(!client.is_connected("peer-server"));

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_drop_detected() {
        let server = transport("peer-server", None);
        let client = transport("peer-client", None);
        let mut client_events = event_channel(&client);
        let mut server_events = event_channel(&server);

        server.start_listening(0).await.unwrap();
        let port = server.listening_port();
        client.connect("127.0.0.1", port, None).await.unwrap();
        wait_for_event(&mut server_events, TransportEvent::Connected).await;
        wait_for_event(&mut client_events, TransportEvent::Connected).await;

        // Server side closes; client must observe Disconnected.
        server.shutdown().await;
        wait_for_event(&mut client_events, TransportEvent::Disconnected).await;

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let server = TcpTransport::new(
            Arc::new(StaticAuth::new("peer-server", None)),
            Arc::new(BandwidthManager::new(0, 0)),
            TcpTransportConfig {
                max_connections: 2,
                auto_reconnect: false,
                ..Default::default()
            },
        );
        let mut server_events = event_channel(&server);
        server.start_listening(0).await.unwrap();
        let port = server.listening_port();

        let c1 = transport("peer-one", None);
        let c2 = transport("peer-two", None);
        let c3 = transport("peer-three", None);

        c1.connect("127.0.0.1", port, None).await.unwrap();
        wait_for_event(&mut server_events, TransportEvent::Connected).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        c2.connect("127.0.0.1", port, None).await.unwrap();
        wait_for_event(&mut server_events, TransportEvent::Connected).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Third connection evicts the least recently active (peer-one).
        c3.connect("127.0.0.1", port, None).await.unwrap();
        let dropped = wait_for_event(&mut server_events, TransportEvent::Disconnected).await;
        assert_eq!(dropped.peer_id, "peer-one");
        assert!(server.connection_count() <= 2);

        for t in [c1, c2, c3] {
            t.shutdown().await;
        }
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_measure_rtt_live_peer() {
        let server = transport("peer-server", None);
        let client = transport("peer-client", None);
        let mut client_events = event_channel(&client);

        server.start_listening(0).await.unwrap();
        let port = server.listening_port();
        client.connect("127.0.0.1", port, None).await.unwrap();
        wait_for_event(&mut client_events, TransportEvent::Connected).await;

        let rtt = client.measure_rtt("peer-server").await;
        assert!(rtt >= 1);
        let quality = client.quality("peer-server");
        assert!(quality.rtt_ms >= 1.0);
        assert!(quality.ewma_rtt_ms >= 1.0);

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_measure_rtt_unknown_peer() {
        let client = transport("peer-client", None);
        assert_eq!(client.measure_rtt("peer-ghost").await, -1);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_sends_are_ordered() {
        let server = transport("peer-server", None);
        let client = transport("peer-client", None);

        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink_store = received.clone();
        server.set_event_sink(Arc::new(move |ev| {
            if ev.event == TransportEvent::DataReceived {
                sink_store.lock().unwrap().push(ev.data.clone());
            }
        }));

        server.start_listening(0).await.unwrap();
        let port = server.listening_port();
        client.connect("127.0.0.1", port, None).await.unwrap();

        for i in 0u32..50 {
            client
                .send("peer-server", &i.to_be_bytes())
                .await
                .unwrap();
        }

        // Allow delivery to drain.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if received.lock().unwrap().len() == 50 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("messages did not all arrive");

        let got = received.lock().unwrap();
        for (i, frame) in got.iter().enumerate() {
            assert_eq!(frame.as_slice(), (i as u32).to_be_bytes());
        }

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_closes_sends() {
        let client = transport("peer-client", None);
        client.shutdown().await;
        client.shutdown().await;
        assert!(matches!(
            client.send("peer-x", b"data").await,
            Err(TransportError::Closed)
        ));
        assert!(client.start_listening(0).await.is_err());
    }
}
