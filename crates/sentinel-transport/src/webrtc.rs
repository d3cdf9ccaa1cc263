//! WebRTC-style signalled transport.
//!
//! Connection establishment requires an out-of-band offer/answer exchange;
//! the network façade routes these [`SignalMessage`]s through another
//! transport or the event bus, the same way browsers ship SDP through a
//! signalling server. There is no listening port: `start_listening` is a
//! no-op success.
//!
//! Authentication follows the fingerprint-in-SDP pattern: the offer and
//! answer carry the session-code hash plus a nonce each, the answer proves
//! key knowledge with an HMAC digest over both nonces and both peer
//! identifiers, and the offerer proves the opposite direction inside its
//! channel-opening SYN. Only then does either side report `Connected`.
//!
//! The data channel is ordered and reliable: messages are fragmented into
//! small datagrams, each acknowledged and retransmitted on loss, with
//! senders serialised per peer (stop-and-wait per fragment).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use sentinel_crypto::constant_time::ct_eq;

use crate::MAX_FRAME_SIZE;
use crate::bandwidth::BandwidthManager;
use crate::error::TransportError;
use crate::handshake::HandshakeAuth;
use crate::quality::ConnectionQuality;
use crate::transport::{
    ConnectionState, EventSink, PeerTransport, TransportEvent, TransportEventData, TransportKind,
};

/// Datagram magic byte.
const MAGIC: u8 = 0xDC;

/// Fragment payload ceiling, conservative for typical MTUs.
const MAX_FRAGMENT: usize = 1152;

/// Per-fragment retransmit attempts before the send fails.
const MAX_RETRIES: u32 = 10;

/// Ack wait per attempt.
const ACK_TIMEOUT: Duration = Duration::from_millis(250);

/// Overall deadline for a signalled connection attempt.
const SIGNAL_TIMEOUT: Duration = Duration::from_secs(10);

const TYPE_DATA: u8 = 1;
const TYPE_ACK: u8 = 2;
const TYPE_SYN: u8 = 3;
const TYPE_SYNACK: u8 = 4;
const TYPE_BYE: u8 = 5;
const TYPE_PING: u8 = 6;
const TYPE_PONG: u8 = 7;

/// Signalling message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Connection offer with a candidate address
    Offer,
    /// Answer to an offer, including the authentication digest
    Answer,
    /// Teardown notification
    Bye,
}

/// Out-of-band signalling payload, routed by the façade.
#[derive(Debug, Clone)]
pub struct SignalMessage {
    /// Message kind
    pub kind: SignalKind,
    /// Sending peer identifier
    pub from: String,
    /// Target peer identifier
    pub to: String,
    /// Candidate address `ip:port`
    pub candidate: String,
    /// Hex SHA-256 of the sender's session code
    pub code_hash: String,
    /// Hex random nonce bound into the auth digests
    pub nonce: String,
    /// Hex HMAC digest (answers only)
    pub digest: String,
}

/// Callback delivering signalling messages to the outside world.
pub type SignalSender = Arc<dyn Fn(SignalMessage) + Send + Sync>;

fn encode_datagram(kind: u8, msg_id: u32, frag_idx: u32, frag_total: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + payload.len());
    out.push(MAGIC);
    out.push(kind);
    out.extend_from_slice(&msg_id.to_be_bytes());
    out.extend_from_slice(&frag_idx.to_be_bytes());
    out.extend_from_slice(&frag_total.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn decode_header(buf: &[u8]) -> Option<(u8, u32, u32, u32, &[u8])> {
    if buf.len() < 14 || buf[0] != MAGIC {
        return None;
    }
    let kind = buf[1];
    let msg_id = u32::from_be_bytes(buf[2..6].try_into().ok()?);
    let frag_idx = u32::from_be_bytes(buf[6..10].try_into().ok()?);
    let frag_total = u32::from_be_bytes(buf[10..14].try_into().ok()?);
    Some((kind, msg_id, frag_idx, frag_total, &buf[14..]))
}

struct SendState {
    next_msg_id: u32,
    ack_rx: mpsc::UnboundedReceiver<(u32, u32)>,
}

struct RtcPeer {
    socket: Arc<UdpSocket>,
    state: std::sync::Mutex<ConnectionState>,
    quality: std::sync::Mutex<ConnectionQuality>,
    send_state: Mutex<SendState>,
    ack_tx: mpsc::UnboundedSender<(u32, u32)>,
    /// Digest expected inside the peer's SYN (answerer side).
    expected_syn_digest: Option<[u8; 32]>,
    synack_tx: watch::Sender<bool>,
    pong_waiter: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    stop: watch::Sender<bool>,
}

struct PendingOffer {
    socket: Arc<UdpSocket>,
    nonce: [u8; 16],
    done: oneshot::Sender<Result<(), TransportError>>,
}

struct Inner {
    auth: Arc<dyn HandshakeAuth>,
    bandwidth: Arc<BandwidthManager>,
    peers: DashMap<String, Arc<RtcPeer>>,
    pending_offers: DashMap<String, PendingOffer>,
    signal_sender: std::sync::RwLock<Option<SignalSender>>,
    event_sink: std::sync::RwLock<Option<EventSink>>,
    running: AtomicBool,
    ping_counter: AtomicU32,
}

impl Inner {
    fn emit(&self, data: TransportEventData) {
        let sink = self.event_sink.read().unwrap().clone();
        if let Some(sink) = sink {
            sink(data);
        }
    }

    fn emit_simple(&self, event: TransportEvent, peer: &str) {
        self.emit(TransportEventData::new(event, TransportKind::WebRtc, peer));
    }

    fn send_signal(&self, msg: SignalMessage) -> Result<(), TransportError> {
        let sender = self.signal_sender.read().unwrap().clone();
        match sender {
            Some(sender) => {
                sender(msg);
                Ok(())
            }
            None => Err(TransportError::SignalingUnavailable),
        }
    }

    fn drop_peer(&self, peer: &str) {
        if let Some((_, entry)) = self.peers.remove(peer) {
            let _ = entry.stop.send(true);
            *entry.state.lock().unwrap() = ConnectionState::Disconnected;
            self.emit_simple(TransportEvent::Disconnected, peer);
        }
    }

    /// Digest covering offer → answer direction.
    fn answer_digest(
        &self,
        offer_nonce: &[u8],
        answer_nonce: &[u8],
        offerer: &str,
        answerer: &str,
    ) -> Option<[u8; 32]> {
        self.auth
            .auth_digest(offer_nonce, answer_nonce, offerer, answerer)
    }

    /// Digest covering answer → offer direction (inside the SYN).
    fn syn_digest(
        &self,
        offer_nonce: &[u8],
        answer_nonce: &[u8],
        offerer: &str,
        answerer: &str,
    ) -> Option<[u8; 32]> {
        self.auth
            .auth_digest(answer_nonce, offer_nonce, answerer, offerer)
    }

    fn install_peer(
        self: Arc<Self>,
        peer_id: &str,
        socket: Arc<UdpSocket>,
        state: ConnectionState,
        expected_syn_digest: Option<[u8; 32]>,
    ) -> Arc<RtcPeer> {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (synack_tx, _) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);
        let entry = Arc::new(RtcPeer {
            socket: socket.clone(),
            state: std::sync::Mutex::new(state),
            quality: std::sync::Mutex::new(ConnectionQuality::default()),
            send_state: Mutex::new(SendState {
                next_msg_id: 1,
                ack_rx,
            }),
            ack_tx,
            expected_syn_digest,
            synack_tx,
            pong_waiter: std::sync::Mutex::new(None),
            stop: stop_tx,
        });
        self.peers.insert(peer_id.to_string(), entry.clone());

        let inner = self.clone();
        let peer = peer_id.to_string();
        let loop_entry = entry.clone();
        tokio::spawn(async move {
            inner.io_loop(peer, loop_entry, stop_rx).await;
        });
        entry
    }

    async fn io_loop(
        self: Arc<Self>,
        peer: String,
        entry: Arc<RtcPeer>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; 2048];
        // msg_id -> (total, fragments)
        let mut assembly: HashMap<u32, (u32, Vec<Option<Vec<u8>>>)> = HashMap::new();
        let mut last_delivered: u32 = 0;

        loop {
            let received = tokio::select! {
                _ = stop.changed() => break,
                received = entry.socket.recv(&mut buf) => received,
            };
            let len = match received {
                Ok(len) => len,
                Err(err) => {
                    debug!(peer, %err, "datagram receive failed");
                    break;
                }
            };
            let Some((kind, msg_id, frag_idx, frag_total, payload)) = decode_header(&buf[..len])
            else {
                continue;
            };

            match kind {
                TYPE_DATA => {
                    // Ack every fragment, even duplicates.
                    let ack = encode_datagram(TYPE_ACK, msg_id, frag_idx, frag_total, &[]);
                    let _ = entry.socket.send(&ack).await;

                    if msg_id <= last_delivered || frag_total == 0 {
                        continue;
                    }
                    let slot = assembly
                        .entry(msg_id)
                        .or_insert_with(|| (frag_total, vec![None; frag_total as usize]));
                    if frag_idx < slot.0 {
                        slot.1[frag_idx as usize] = Some(payload.to_vec());
                    }
                    if slot.1.iter().all(Option::is_some) {
                        let (_, frags) = assembly.remove(&msg_id).unwrap();
                        let message: Vec<u8> =
                            frags.into_iter().flatten().flatten().collect();
                        last_delivered = msg_id;
                        assembly.retain(|id, _| *id > msg_id);

                        self.bandwidth.request_download(&peer, message.len()).await;
                        self.emit(TransportEventData {
                            event: TransportEvent::DataReceived,
                            transport: TransportKind::WebRtc,
                            peer_id: peer.clone(),
                            message: String::new(),
                            data: message,
                            quality: None,
                        });
                    }
                }
                TYPE_ACK => {
                    let _ = entry.ack_tx.send((msg_id, frag_idx));
                }
                TYPE_SYN => {
                    // Verify the offerer's direction before completing.
                    let ok = match &entry.expected_syn_digest {
                        Some(expected) => ct_eq(payload, expected),
                        None => true,
                    };
                    if !ok {
                        warn!(peer, "SYN digest mismatch, ignoring");
                        continue;
                    }
                    let synack = encode_datagram(TYPE_SYNACK, msg_id, 0, 0, &[]);
                    let _ = entry.socket.send(&synack).await;

                    let was_connected = {
                        let mut st = entry.state.lock().unwrap();
                        let was = *st == ConnectionState::Connected;
                        *st = ConnectionState::Connected;
                        was
                    };
                    if !was_connected {
                        info!(peer, "data channel established (answerer)");
                        self.emit_simple(TransportEvent::Connected, &peer);
                    }
                }
                TYPE_SYNACK => {
                    let _ = entry.synack_tx.send(true);
                }
                TYPE_BYE => {
                    debug!(peer, "peer sent BYE");
                    break;
                }
                TYPE_PING => {
                    let pong = encode_datagram(TYPE_PONG, msg_id, 0, 0, &[]);
                    let _ = entry.socket.send(&pong).await;
                }
                TYPE_PONG => {
                    if let Some(waiter) = entry.pong_waiter.lock().unwrap().take() {
                        let _ = waiter.send(());
                    }
                }
                _ => {}
            }
        }

        self.drop_peer(&peer);
    }

    /// Reliable ordered message send: fragments with per-fragment acks.
    async fn reliable_send(
        &self,
        peer: &str,
        entry: &Arc<RtcPeer>,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut send_state = entry.send_state.lock().await;
        let msg_id = send_state.next_msg_id;
        send_state.next_msg_id += 1;

        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[][..]]
        } else {
            data.chunks(MAX_FRAGMENT).collect()
        };
        let total = chunks.len() as u32;
        for (idx, chunk) in chunks.into_iter().enumerate() {
            let frag = encode_datagram(TYPE_DATA, msg_id, idx as u32, total, chunk);
            let mut acked = false;
            for _attempt in 0..MAX_RETRIES {
                entry
                    .socket
                    .send(&frag)
                    .await
                    .map_err(TransportError::Io)?;

                let deadline = tokio::time::sleep(ACK_TIMEOUT);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = &mut deadline => break,
                        ack = send_state.ack_rx.recv() => match ack {
                            Some((m, f)) if m == msg_id && f == idx as u32 => {
                                acked = true;
                                break;
                            }
                            Some(_) => continue,
                            None => return Err(TransportError::Closed),
                        },
                    }
                }
                if acked {
                    break;
                }
            }
            if !acked {
                return Err(TransportError::ConnectionFailed(format!(
                    "{peer}: fragment {idx} unacknowledged"
                )));
            }
        }
        Ok(())
    }
}

/// WebRTC-style carrier implementing [`PeerTransport`].
pub struct WebRtcTransport {
    inner: Arc<Inner>,
}

impl WebRtcTransport {
    /// Create a signalled transport.
    #[must_use]
    pub fn new(auth: Arc<dyn HandshakeAuth>, bandwidth: Arc<BandwidthManager>) -> Self {
        Self {
            inner: Arc::new(Inner {
                auth,
                bandwidth,
                peers: DashMap::new(),
                pending_offers: DashMap::new(),
                signal_sender: std::sync::RwLock::new(None),
                event_sink: std::sync::RwLock::new(None),
                running: AtomicBool::new(true),
                ping_counter: AtomicU32::new(1),
            }),
        }
    }

    /// Wire the outbound signalling channel.
    pub fn set_signal_sender(&self, sender: SignalSender) {
        *self.inner.signal_sender.write().unwrap() = Some(sender);
    }

    /// Deliver an inbound signalling message (offer/answer/bye) that the
    /// façade received for us.
    pub async fn handle_signal(&self, msg: SignalMessage) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        match msg.kind {
            SignalKind::Offer => self.handle_offer(msg).await,
            SignalKind::Answer => self.handle_answer(msg).await,
            SignalKind::Bye => {
                self.inner.drop_peer(&msg.from);
            }
        }
    }

    async fn handle_offer(&self, msg: SignalMessage) {
        let local_hash = self.inner.auth.session_code_hash();
        if !local_hash.is_empty() && msg.code_hash != local_hash {
            debug!(peer = msg.from, "offer with mismatching session code, ignoring");
            return;
        }
        if msg.from == self.inner.auth.local_peer_id() {
            return;
        }

        let Ok(offer_nonce) = hex::decode(&msg.nonce) else {
            return;
        };
        let remote: std::net::SocketAddr = match msg.candidate.parse() {
            Ok(addr) => addr,
            Err(_) => {
                debug!(candidate = msg.candidate, "unparseable candidate");
                return;
            }
        };

        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "could not bind answer socket");
                return;
            }
        };
        if socket.connect(remote).await.is_err() {
            return;
        }
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        let my_id = self.inner.auth.local_peer_id();
        let answer_nonce = sentinel_crypto::random::handshake_nonce();
        let digest = self
            .inner
            .answer_digest(&offer_nonce, &answer_nonce, &msg.from, &my_id);
        let expected_syn =
            self.inner
                .syn_digest(&offer_nonce, &answer_nonce, &msg.from, &my_id);

        // When a session code is set both digests must be computable.
        if !local_hash.is_empty() && (digest.is_none() || expected_syn.is_none()) {
            warn!("session keys unavailable for signalled connection");
            return;
        }

        let candidate = format!("{}:{}", local_candidate_ip(remote), local_addr.port());
        let answer = SignalMessage {
            kind: SignalKind::Answer,
            from: my_id,
            to: msg.from.clone(),
            candidate,
            code_hash: local_hash,
            nonce: hex::encode(answer_nonce),
            digest: digest.map(hex::encode).unwrap_or_default(),
        };

        self.inner.clone().install_peer(
            &msg.from,
            Arc::new(socket),
            ConnectionState::Connecting,
            expected_syn,
        );
        if let Err(err) = self.inner.send_signal(answer) {
            warn!(%err, "cannot answer offer");
            self.inner.drop_peer(&msg.from);
        }
    }

    async fn handle_answer(&self, msg: SignalMessage) {
        let Some((_, pending)) = self.inner.pending_offers.remove(&msg.from) else {
            debug!(peer = msg.from, "answer without pending offer");
            return;
        };

        let result = self.complete_offer(&msg, &pending).await;
        if let Err(ref err) = result {
            warn!(peer = msg.from, %err, "signalled connection failed");
            self.inner.drop_peer(&msg.from);
        }
        let _ = pending.done.send(result);
    }

    async fn complete_offer(
        &self,
        msg: &SignalMessage,
        pending: &PendingOffer,
    ) -> Result<(), TransportError> {
        let local_hash = self.inner.auth.session_code_hash();
        let my_id = self.inner.auth.local_peer_id();

        let answer_nonce = hex::decode(&msg.nonce)
            .map_err(|_| TransportError::HandshakeProtocol("bad answer nonce".into()))?;

        // Verify the answerer's digest when keys are in play.
        if !local_hash.is_empty() {
            if msg.code_hash != local_hash {
                return Err(TransportError::HandshakeRejected(
                    "session code mismatch".into(),
                ));
            }
            let expected = self
                .inner
                .answer_digest(&pending.nonce, &answer_nonce, &my_id, &msg.from)
                .ok_or_else(|| {
                    TransportError::HandshakeProtocol("session keys unavailable".into())
                })?;
            let presented = hex::decode(&msg.digest)
                .map_err(|_| TransportError::HandshakeProtocol("bad digest".into()))?;
            if !ct_eq(&presented, &expected) {
                return Err(TransportError::HandshakeRejected("digest mismatch".into()));
            }
        }

        let remote: std::net::SocketAddr = msg
            .candidate
            .parse()
            .map_err(|_| TransportError::HandshakeProtocol("bad candidate".into()))?;
        pending.socket.connect(remote).await?;

        let syn_payload = self
            .inner
            .syn_digest(&pending.nonce, &answer_nonce, &my_id, &msg.from)
            .map(|d| d.to_vec())
            .unwrap_or_default();

        let entry = self.inner.clone().install_peer(
            &msg.from,
            pending.socket.clone(),
            ConnectionState::Connecting,
            None,
        );

        // SYN/SYNACK with retries establishes the channel.
        let mut synack_rx = entry.synack_tx.subscribe();
        let syn = encode_datagram(TYPE_SYN, 0, 0, 0, &syn_payload);
        let mut established = false;
        for _ in 0..MAX_RETRIES {
            entry.socket.send(&syn).await?;
            if timeout(ACK_TIMEOUT, synack_rx.changed()).await.is_ok() {
                established = true;
                break;
            }
        }
        if !established {
            return Err(TransportError::ConnectionFailed(
                "channel open timed out".into(),
            ));
        }

        *entry.state.lock().unwrap() = ConnectionState::Connected;
        self.inner.auth.on_peer_authenticated(&msg.from);
        info!(peer = msg.from, "data channel established (offerer)");
        self.inner.emit_simple(TransportEvent::Connected, &msg.from);
        Ok(())
    }
}

/// Pick the IP to advertise for a candidate: the interface a socket to
/// `remote` would use.
fn local_candidate_ip(remote: std::net::SocketAddr) -> std::net::IpAddr {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect(remote).and_then(|()| s.local_addr()));
    match probe {
        Ok(addr) => addr.ip(),
        Err(_) => std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebRtc
    }

    fn name(&self) -> &'static str {
        "webrtc"
    }

    async fn start_listening(&self, _port: u16) -> Result<(), TransportError> {
        // Signalled transport: there is nothing to listen on.
        Ok(())
    }

    async fn stop_listening(&self) {}

    async fn connect(
        &self,
        address: &str,
        port: u16,
        expected_peer: Option<&str>,
    ) -> Result<String, TransportError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let target = expected_peer
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                TransportError::ConnectionFailed("signalled connect requires a peer id".into())
            })?
            .to_string();

        if self.inner.peers.contains_key(&target) {
            return Ok(target);
        }

        let socket = Arc::new(
            UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| TransportError::BindFailed(e.to_string()))?,
        );
        let local_port = socket
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?
            .port();

        // `address:port` is a routing hint for choosing the advertised
        // interface; the actual path is negotiated by the answer.
        let hint: std::net::SocketAddr = format!("{address}:{port}")
            .parse()
            .unwrap_or_else(|_| "8.8.8.8:80".parse().unwrap());
        let candidate = format!("{}:{}", local_candidate_ip(hint), local_port);

        let nonce = sentinel_crypto::random::handshake_nonce();
        let (done_tx, done_rx) = oneshot::channel();
        self.inner.pending_offers.insert(
            target.clone(),
            PendingOffer {
                socket,
                nonce,
                done: done_tx,
            },
        );

        let offer = SignalMessage {
            kind: SignalKind::Offer,
            from: self.inner.auth.local_peer_id(),
            to: target.clone(),
            candidate,
            code_hash: self.inner.auth.session_code_hash(),
            nonce: hex::encode(nonce),
            digest: String::new(),
        };
        if let Err(err) = self.inner.send_signal(offer) {
            self.inner.pending_offers.remove(&target);
            return Err(err);
        }

        match timeout(SIGNAL_TIMEOUT, done_rx).await {
            Ok(Ok(Ok(()))) => Ok(target),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) | Err(_) => {
                self.inner.pending_offers.remove(&target);
                Err(TransportError::ConnectionFailed(
                    "no answer to offer".into(),
                ))
            }
        }
    }

    async fn disconnect(&self, peer: &str) {
        if let Some(entry) = self.inner.peers.get(peer).map(|e| e.value().clone()) {
            let bye = encode_datagram(TYPE_BYE, 0, 0, 0, &[]);
            let _ = entry.socket.send(&bye).await;
        }
        let _ = self.inner.send_signal(SignalMessage {
            kind: SignalKind::Bye,
            from: self.inner.auth.local_peer_id(),
            to: peer.to_string(),
            candidate: String::new(),
            code_hash: String::new(),
            nonce: String::new(),
            digest: String::new(),
        });
        self.inner.drop_peer(peer);
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
            .peers
            .get(peer)
            .map(|e| e.value().clone())
            .ok_or_else(|| TransportError::NotConnected(peer.to_string()))?;
        if *entry.state.lock().unwrap() != ConnectionState::Connected {
            return Err(TransportError::NotConnected(peer.to_string()));
        }

        self.inner.bandwidth.request_upload(peer, data.len()).await;
        self.inner.reliable_send(peer, &entry, data).await
    }

    fn is_connected(&self, peer: &str) -> bool {
        self.inner
            .peers
            .get(peer)
            .map(|e| *e.state.lock().unwrap() == ConnectionState::Connected)
            .unwrap_or(false)
    }

    fn state(&self, peer: &str) -> ConnectionState {
        self.inner
            .peers
            .get(peer)
            .map(|e| *e.state.lock().unwrap())
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn quality(&self, peer: &str) -> ConnectionQuality {
        self.inner
            .peers
            .get(peer)
            .map(|e| e.quality.lock().unwrap().clone())
            .unwrap_or_default()
    }

    fn connected_peers(&self) -> Vec<String> {
        self.inner
            .peers
            .iter()
            .filter(|e| *e.value().state.lock().unwrap() == ConnectionState::Connected)
            .map(|e| e.key().clone())
            .collect()
    }

    async fn measure_rtt(&self, peer: &str) -> i64 {
        let Some(entry) = self.inner.peers.get(peer).map(|e| e.value().clone()) else {
            return -1;
        };
        let (tx, rx) = oneshot::channel();
        *entry.pong_waiter.lock().unwrap() = Some(tx);

        let id = self.inner.ping_counter.fetch_add(1, Ordering::Relaxed);
        let ping = encode_datagram(TYPE_PING, id, 0, 0, &[]);
        let start = Instant::now();
        if entry.socket.send(&ping).await.is_err() {
            return -1;
        }

        match timeout(Duration::from_secs(2), rx).await {
            Ok(Ok(())) => {
                let rtt = start.elapsed().as_millis().max(1) as i64;
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
                    transport: TransportKind::WebRtc,
                    peer_id: peer.to_string(),
                    message: String::new(),
                    data: Vec::new(),
                    quality: Some(quality),
                });
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
        let peers: Vec<String> = self.inner.peers.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            if let Some(entry) = self.inner.peers.get(&peer).map(|e| e.value().clone()) {
                let bye = encode_datagram(TYPE_BYE, 0, 0, 0, &[]);
                let _ = entry.socket.send(&bye).await;
            }
            self.inner.drop_peer(&peer);
        }
        self.inner.pending_offers.clear();
        info!("webrtc transport shut down");
    }
}
