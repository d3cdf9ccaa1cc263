//! QUIC transport built on quinn.
//!
//! Transport security (TLS 1.3) comes from the QUIC stack itself with a
//! self-signed node certificate; peer authentication is still the
//! session-code handshake, run over the first bidirectional stream of
//! every connection. Each subsequent logical message travels on its own
//! unidirectional stream, which gives framing for free and keeps
//! per-message ordering concerns out of the carrier.
//!
//! Certificate verification is intentionally disabled: peers are mutually
//! anonymous at the TLS layer and trust is established by the handshake
//! digest, exactly as on TCP.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bandwidth::BandwidthManager;
use crate::error::TransportError;
use crate::handshake::{HandshakeAuth, client_handshake, server_handshake};
use crate::quality::ConnectionQuality;
use crate::transport::{
    ConnectionState, EventSink, PeerTransport, TransportEvent, TransportEventData, TransportKind,
};
use crate::{CONNECT_TIMEOUT, MAX_FRAME_SIZE};

/// TLS server name presented by every node; never verified.
const TLS_SERVER_NAME: &str = "sentinelfs";

/// Both halves of a bidirectional stream as one duplex pipe, so the
/// handshake drivers can run unchanged over QUIC.
struct BiStream {
    send: SendStream,
    recv: RecvStream,
}

impl AsyncRead for BiStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for BiStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().send).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().send).poll_shutdown(cx)
    }
}

/// Accepts any server certificate; authenticity comes from the
/// session-code handshake, not TLS identity.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<rustls::crypto::CryptoProvider>);

impl AcceptAnyCertificate {
    fn new() -> Arc<Self> {
        Arc::new(Self(Arc::new(rustls::crypto::ring::default_provider())))
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn tls_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(e.to_string())
}

fn client_config() -> Result<ClientConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let crypto = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?
        .dangerous()
        .with_custom_certificate_verifier(AcceptAnyCertificate::new())
        .with_no_client_auth();
    Ok(ClientConfig::new(Arc::new(
        QuicClientConfig::try_from(crypto).map_err(tls_error)?,
    )))
}

fn server_config() -> Result<ServerConfig, TransportError> {
    let certified = rcgen::generate_simple_self_signed(vec![TLS_SERVER_NAME.to_string()])
        .map_err(tls_error)?;
    let cert_der = certified.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let crypto = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .map_err(tls_error)?;
    Ok(ServerConfig::with_crypto(Arc::new(
        QuicServerConfig::try_from(crypto).map_err(tls_error)?,
    )))
}

struct QuicPeer {
    conn: Connection,
    quality: std::sync::Mutex<ConnectionQuality>,
    last_activity: std::sync::Mutex<Instant>,
}

struct Inner {
    auth: Arc<dyn HandshakeAuth>,
    bandwidth: Arc<BandwidthManager>,
    connections: DashMap<String, Arc<QuicPeer>>,
    endpoint: Mutex<Option<Endpoint>>,
    event_sink: std::sync::RwLock<Option<EventSink>>,
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
        self.emit(TransportEventData::new(event, TransportKind::Quic, peer));
    }

    fn drop_connection(&self, peer: &str, close: bool) {
        if let Some((_, entry)) = self.connections.remove(peer) {
            if close {
                entry.conn.close(0u32.into(), b"disconnect");
            }
            self.emit_simple(TransportEvent::Disconnected, peer);
        }
    }

    fn register(self: Arc<Self>, peer_id: &str, conn: Connection) {
        if self.connections.contains_key(peer_id) {
            debug!(peer = peer_id, "duplicate quic connection, closing new one");
            conn.close(0u32.into(), b"duplicate");
            return;
        }
        let entry = Arc::new(QuicPeer {
            conn: conn.clone(),
            quality: std::sync::Mutex::new(ConnectionQuality::default()),
            last_activity: std::sync::Mutex::new(Instant::now()),
        });
        self.connections.insert(peer_id.to_string(), entry);

        info!(peer = peer_id, "quic peer connected");
        self.emit_simple(TransportEvent::Connected, peer_id);

        let inner = self.clone();
        let peer = peer_id.to_string();
        tokio::spawn(async move {
            inner.receive_loop(peer, conn).await;
        });
    }

    /// Drain unidirectional streams (one logical message each) until the
    /// connection dies.
    async fn receive_loop(self: Arc<Self>, peer: String, conn: Connection) {
        loop {
            match conn.accept_uni().await {
                Ok(stream) => {
                    let inner = self.clone();
                    let peer = peer.clone();
                    tokio::spawn(async move {
                        inner.read_message(peer, stream).await;
                    });
                }
                Err(err) => {
                    debug!(peer, %err, "quic connection closed");
                    break;
                }
            }
        }
        self.drop_connection(&peer, false);
    }

    async fn read_message(self: Arc<Self>, peer: String, mut stream: RecvStream) {
        match stream.read_to_end(MAX_FRAME_SIZE).await {
            Ok(payload) => {
                self.bandwidth.request_download(&peer, payload.len()).await;
                if let Some(entry) = self.connections.get(&peer) {
                    *entry.last_activity.lock().unwrap() = Instant::now();
                }
                self.emit(TransportEventData {
                    event: TransportEvent::DataReceived,
                    transport: TransportKind::Quic,
                    peer_id: peer,
                    message: String::new(),
                    data: payload,
                    quality: None,
                });
            }
            Err(err) => {
                warn!(peer, %err, "quic stream read failed");
                self.emit(TransportEventData {
                    event: TransportEvent::Error,
                    transport: TransportKind::Quic,
                    peer_id: peer,
                    message: err.to_string(),
                    data: Vec::new(),
                    quality: None,
                });
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, endpoint: Endpoint) {
        while let Some(incoming) = endpoint.accept().await {
            let inner = self.clone();
            tokio::spawn(async move {
                let remote = incoming.remote_address();
                match incoming.await {
                    Ok(conn) => inner.handle_inbound(conn).await,
                    Err(err) => debug!(%remote, %err, "inbound quic connection failed"),
                }
            });
        }
    }

    async fn handle_inbound(self: Arc<Self>, conn: Connection) {
        let stream = match timeout(CONNECT_TIMEOUT, conn.accept_bi()).await {
            Ok(Ok((send, recv))) => BiStream { send, recv },
            Ok(Err(err)) => {
                debug!(%err, "no handshake stream");
                return;
            }
            Err(_) => {
                debug!("timed out waiting for handshake stream");
                conn.close(0u32.into(), b"handshake timeout");
                return;
            }
        };

        let mut stream = stream;
        match server_handshake(&mut stream, self.auth.as_ref()).await {
            Ok(peer_id) => {
                let _ = stream.send.finish();
                self.register(&peer_id, conn);
            }
            Err(err) => {
                debug!(%err, "quic inbound handshake failed");
                conn.close(0u32.into(), b"handshake failed");
            }
        }
    }

    /// Get the endpoint, creating a client-only one on first use.
    async fn endpoint(&self) -> Result<Endpoint, TransportError> {
        let mut guard = self.endpoint.lock().await;
        if let Some(ep) = guard.as_ref() {
            return Ok(ep.clone());
        }
        let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        endpoint.set_default_client_config(client_config()?);
        *guard = Some(endpoint.clone());
        Ok(endpoint)
    }
}

/// QUIC carrier implementing [`PeerTransport`].
pub struct QuicTransport {
    inner: Arc<Inner>,
}

impl QuicTransport {
    /// Create a QUIC transport.
    #[must_use]
    pub fn new(auth: Arc<dyn HandshakeAuth>, bandwidth: Arc<BandwidthManager>) -> Self {
        Self {
            inner: Arc::new(Inner {
                auth,
                bandwidth,
                connections: DashMap::new(),
                endpoint: Mutex::new(None),
                event_sink: std::sync::RwLock::new(None),
                listen_port: AtomicU32::new(0),
                running: AtomicBool::new(true),
            }),
        }
    }

    /// Bound UDP port, or 0 when not listening.
    #[must_use]
    pub fn listening_port(&self) -> u16 {
        self.inner.listen_port.load(Ordering::SeqCst) as u16
    }
}

#[async_trait]
impl PeerTransport for QuicTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Quic
    }

    fn name(&self) -> &'static str {
        "quic"
    }

    async fn start_listening(&self, port: u16) -> Result<(), TransportError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut endpoint = Endpoint::server(
            server_config()?,
            format!("0.0.0.0:{port}").parse().unwrap(),
        )
        .map_err(|e| TransportError::BindFailed(format!("udp port {port}: {e}")))?;
        endpoint.set_default_client_config(client_config()?);

        let bound = endpoint
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?
            .port();
        self.inner.listen_port.store(u32::from(bound), Ordering::SeqCst);

        {
            let mut guard = self.inner.endpoint.lock().await;
            if let Some(old) = guard.replace(endpoint.clone()) {
                old.close(0u32.into(), b"rebind");
            }
        }

        info!(port = bound, "quic listener started");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.accept_loop(endpoint).await;
        });
        Ok(())
    }

    async fn stop_listening(&self) {
        // Closing the endpoint also drops established connections; QUIC
        // multiplexes them over the same socket.
        let endpoint = self.inner.endpoint.lock().await.take();
        if let Some(endpoint) = endpoint {
            endpoint.close(0u32.into(), b"stop listening");
            info!("quic listener stopped");
        }
        self.inner.listen_port.store(0, Ordering::SeqCst);
    }

    async fn connect(
        &self,
        address: &str,
        port: u16,
        expected_peer: Option<&str>,
    ) -> Result<String, TransportError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let endpoint = self.inner.endpoint().await?;
        let addr = format!("{address}:{port}")
            .parse()
            .map_err(|_| TransportError::ConnectionFailed(format!("bad address {address}")))?;

        let connecting = endpoint
            .connect(addr, TLS_SERVER_NAME)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let conn = timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("{addr}: timed out")))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let mut stream = BiStream { send, recv };
        let peer_id = client_handshake(&mut stream, self.inner.auth.as_ref()).await?;
        let _ = stream.send.finish();

        if let Some(expected) = expected_peer {
            if !expected.is_empty() && expected != peer_id {
                conn.close(0u32.into(), b"unexpected peer");
                return Err(TransportError::ConnectionFailed(format!(
                    "expected peer {expected}, reached {peer_id}"
                )));
            }
        }

        self.inner.clone().register(&peer_id, conn);
        Ok(peer_id)
    }

    async fn disconnect(&self, peer: &str) {
        self.inner.drop_connection(peer, true);
    }

    async fn send(&self, peer: &str, data: &[u8]) -> Result<(), TransportError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if data.len() > MAX_FRAME_SIZE {
            return Err(TransportError::Oversize(data.len()));
        }
        let entry = self
            .inner
            .connections
            .get(peer)
            .map(|e| e.value().clone())
            .ok_or_else(|| TransportError::NotConnected(peer.to_string()))?;

        self.inner.bandwidth.request_upload(peer, data.len()).await;

        let mut stream = entry
            .conn
            .open_uni()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        stream
            .write_all(data)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        stream
            .finish()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        *entry.last_activity.lock().unwrap() = Instant::now();
        Ok(())
    }

    fn is_connected(&self, peer: &str) -> bool {
        self.inner.connections.contains_key(peer)
    }

    fn state(&self, peer: &str) -> ConnectionState {
        if self.inner.connections.contains_key(peer) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn quality(&self, peer: &str) -> ConnectionQuality {
        self.inner
            .connections
            .get(peer)
            .map(|e| {
                let mut q = e.quality.lock().unwrap().clone();
                // The stack keeps a live RTT estimate; surface it.
                let rtt = e.conn.rtt().as_millis().max(1) as f64;
                q.rtt_ms = rtt;
                q
            })
            .unwrap_or_default()
    }

    fn connected_peers(&self) -> Vec<String> {
        self.inner.connections.iter().map(|e| e.key().clone()).collect()
    }

    async fn measure_rtt(&self, peer: &str) -> i64 {
        let Some(entry) = self.inner.connections.get(peer).map(|e| e.value().clone()) else {
            return -1;
        };
        let rtt = entry.conn.rtt().as_millis().max(1) as i64;
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
            transport: TransportKind::Quic,
            peer_id: peer.to_string(),
            message: String::new(),
            data: Vec::new(),
            quality: Some(quality),
        });
        rtt
    }

    fn set_event_sink(&self, sink: EventSink) {
        *self.inner.event_sink.write().unwrap() = Some(sink);
    }

    async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let peers: Vec<String> = self
            .inner
            .connections
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for peer in peers {
            self.inner.drop_connection(&peer, true);
        }
        let endpoint = self.inner.endpoint.lock().await.take();
        if let Some(endpoint) = endpoint {
            endpoint.close(0u32.into(), b"shutdown");
        }
        info!("quic transport shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StaticAuth;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn transport(id: &str, code: Option<&str>) -> QuicTransport {
        QuicTransport::new(
            Arc::new(StaticAuth::new(id, code)),
            Arc::new(BandwidthManager::new(0, 0)),
        )
    }

    fn event_channel(t: &QuicTransport) -> mpsc::UnboundedReceiver<TransportEventData> {
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
            let data = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if data.event == event {
                return data;
            }
        }
    }

    #[tokio::test]
    async fn test_quic_loopback_connect_and_send() {
        let server = transport("peer-server", Some("abcdef"));
        let client = transport("peer-client", Some("abcdef"));
        let mut server_events = event_channel(&server);

        server.start_listening(0).await.unwrap();
        let port = server.listening_port();
        assert_ne!(port, 0);

        let peer = client.connect("127.0.0.1", port, None).await.unwrap();
        assert_eq!(peer, "peer-server");
        assert!(client.is_connected("peer-server"));

        wait_for_event(&mut server_events, TransportEvent::Connected).await;

        client.send("peer-server", b"over quic").await.unwrap();
        let data = wait_for_event(&mut server_events, TransportEvent::DataReceived).await;
        assert_eq!(data.peer_id, "peer-client");
        assert_eq!(data.data, b"over quic");

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_quic_session_code_mismatch_refused() {
        let server = transport("peer-server", Some("abcdef"));
        let client = transport("peer-client", Some("wrong!"));

        server.start_listening(0).await.unwrap();
        let port = server.listening_port();

        assert!(client.connect("127.0.0.1", port, None).await.is_err());
        assert!(!server.is_connected("peer-client"));

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_quic_rtt_measured() {
        let server = transport("peer-server", None);
        let client = transport("peer-client", None);

        server.start_listening(0).await.unwrap();
        let port = server.listening_port();
        client.connect("127.0.0.1", port, None).await.unwrap();

        let rtt = client.measure_rtt("peer-server").await;
        assert!(rtt >= 1);
        assert_eq!(client.measure_rtt("peer-ghost").await, -1);

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_quic_disconnect_emits_event() {
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

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_quic_send_unknown_peer() {
        let client = transport("peer-client", None);
        assert!(matches!(
            client.send("peer-ghost", b"x").await,
            Err(TransportError::NotConnected(_))
        ));
        client.shutdown().await;
    }
}
