//! UDP broadcast discovery.
//!
//! Announces the local peer on the LAN and collects announcements from
//! others. Broadcast cadence backs off exponentially (base 1 s, doubling,
//! capped at 30 s) and resets to the base whenever a new peer appears.
//! Peers unseen for `peer_timeout_sec` are pruned.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{DEFAULT_DISCOVERY_PORT, DISCOVERY_TAG, DiscoveryError, LEGACY_DISCOVERY_TAG};

/// Broadcast backoff base.
const BASE_INTERVAL: Duration = Duration::from_secs(1);

/// Broadcast backoff ceiling.
const MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Doubling stops after this many consecutive broadcasts.
const MAX_CONSECUTIVE: u32 = 5;

/// Discovery configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port for announcements (send and receive)
    pub udp_port: u16,
    /// Broadcast loop tick interval in milliseconds
    pub broadcast_interval_ms: u64,
    /// Prune peers unseen for this many seconds
    pub peer_timeout_sec: u64,
    /// Enable the UDP broadcast mechanism
    pub enable_udp: bool,
    /// Enable the mDNS mechanism (stub)
    pub enable_mdns: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_DISCOVERY_PORT,
            broadcast_interval_ms: 5_000,
            peer_timeout_sec: 60,
            enable_udp: true,
            enable_mdns: false,
        }
    }
}

/// A peer learned from the LAN.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    /// Announced peer identifier
    pub peer_id: String,
    /// Source address of the announcement
    pub address: String,
    /// Announced TCP port
    pub port: u16,
    /// Announced session-code hash ("" = open)
    pub code_hash: String,
    /// Announced software version
    pub version: String,
    /// Announced platform
    pub platform: String,
    /// First seen
    pub discovered_at: Instant,
    /// Most recently seen
    pub last_seen: Instant,
}

/// Callback invoked once per newly discovered peer.
pub type DiscoveryCallback = Arc<dyn Fn(&DiscoveredPeer) + Send + Sync>;

/// Discovery statistics.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryStats {
    /// Announcements sent
    pub broadcasts_sent: u64,
    /// Announcements received (any validity)
    pub broadcasts_received: u64,
    /// Distinct peers ever discovered
    pub total_discovered: u64,
    /// Peers currently in the cache
    pub active_peers: usize,
}

struct LocalPeer {
    peer_id: String,
    tcp_port: u16,
    code_hash: String,
}

struct Inner {
    config: DiscoveryConfig,
    local: std::sync::Mutex<LocalPeer>,
    peers: std::sync::Mutex<HashMap<String, DiscoveredPeer>>,
    callback: std::sync::RwLock<Option<DiscoveryCallback>>,
    socket: tokio::sync::Mutex<Option<Arc<UdpSocket>>>,
    running: AtomicBool,
    stop: watch::Sender<bool>,
    consecutive_broadcasts: AtomicU32,
    last_broadcast: std::sync::Mutex<Option<Instant>>,
    broadcasts_sent: AtomicU64,
    broadcasts_received: AtomicU64,
    total_discovered: AtomicU64,
}

impl Inner {
    fn announcement(&self) -> String {
        let local = self.local.lock().unwrap();
        format!(
            "{DISCOVERY_TAG}|{}|{}|{}|{}|{}",
            local.peer_id,
            local.tcp_port,
            local.code_hash,
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
        )
    }

    /// Current backoff window based on consecutive broadcasts.
    fn backoff(&self) -> Duration {
        let consecutive = self.consecutive_broadcasts.load(Ordering::Relaxed);
        if consecutive == 0 {
            return BASE_INTERVAL;
        }
        let exp = consecutive.min(MAX_CONSECUTIVE);
        (BASE_INTERVAL * 2u32.pow(exp)).min(MAX_INTERVAL)
    }

    async fn send_broadcast(&self) -> bool {
        {
            let last = self.last_broadcast.lock().unwrap();
            if let Some(last) = *last {
                if last.elapsed() < self.backoff() {
                    return false;
                }
            }
        }

        let socket = {
            let guard = self.socket.lock().await;
            guard.clone()
        };
        let Some(socket) = socket else {
            return false;
        };

        let message = self.announcement();
        let target = SocketAddr::from(([255, 255, 255, 255], self.config.udp_port));
        match socket.send_to(message.as_bytes(), target).await {
            Ok(_) => {
                *self.last_broadcast.lock().unwrap() = Some(Instant::now());
                self.consecutive_broadcasts.fetch_add(1, Ordering::Relaxed);
                self.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                debug!(%err, "broadcast send failed");
                false
            }
        }
    }

    /// Parse and apply one inbound announcement. Returns the peer when it
    /// was new.
    fn handle_message(&self, message: &str, sender_ip: &str) -> Option<DiscoveredPeer> {
        self.broadcasts_received.fetch_add(1, Ordering::Relaxed);

        let body = message
            .strip_prefix(DISCOVERY_TAG)
            .or_else(|| message.strip_prefix(LEGACY_DISCOVERY_TAG))?
            .strip_prefix('|')?;

        let parts: Vec<&str> = body.split('|').collect();
        if parts.len() < 3 {
            return None;
        }
        let peer_id = parts[0].to_string();
        let port: u16 = parts[1].parse().ok()?;
        let code_hash = parts[2].to_string();

        let (local_id, local_hash) = {
            let local = self.local.lock().unwrap();
            (local.peer_id.clone(), local.code_hash.clone())
        };
        if peer_id == local_id {
            return None;
        }
        if !local_hash.is_empty() && code_hash != local_hash {
            return None;
        }

        let now = Instant::now();
        let mut peers = self.peers.lock().unwrap();
        match peers.get_mut(&peer_id) {
            Some(existing) => {
                existing.last_seen = now;
                existing.address = sender_ip.to_string();
                existing.port = port;
                None
            }
            None => {
                let peer = DiscoveredPeer {
                    peer_id: peer_id.clone(),
                    address: sender_ip.to_string(),
                    port,
                    code_hash,
                    version: parts.get(3).unwrap_or(&"").to_string(),
                    platform: parts.get(4).unwrap_or(&"").to_string(),
                    discovered_at: now,
                    last_seen: now,
                };
                peers.insert(peer_id, peer.clone());
                self.total_discovered.fetch_add(1, Ordering::Relaxed);
                // Fresh peer on the LAN: announce eagerly again.
                self.consecutive_broadcasts.store(0, Ordering::Relaxed);
                Some(peer)
            }
        }
    }

    fn prune_stale(&self) {
        let timeout = Duration::from_secs(self.config.peer_timeout_sec);
        let mut peers = self.peers.lock().unwrap();
        peers.retain(|peer_id, peer| {
            let alive = peer.last_seen.elapsed() < timeout;
            if !alive {
                debug!(peer = peer_id, "pruning stale discovered peer");
            }
            alive
        });
    }

    fn notify(&self, peer: &DiscoveredPeer) {
        let callback = self.callback.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(peer);
        }
    }
}

/// UDP broadcast discovery service.
pub struct DiscoveryService {
    inner: Arc<Inner>,
}

impl DiscoveryService {
    /// Create a stopped discovery service.
    #[must_use]
    pub fn new(config: DiscoveryConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                local: std::sync::Mutex::new(LocalPeer {
                    peer_id: String::new(),
                    tcp_port: 0,
                    code_hash: String::new(),
                }),
                peers: std::sync::Mutex::new(HashMap::new()),
                callback: std::sync::RwLock::new(None),
                socket: tokio::sync::Mutex::new(None),
                running: AtomicBool::new(false),
                stop,
                consecutive_broadcasts: AtomicU32::new(0),
                last_broadcast: std::sync::Mutex::new(None),
                broadcasts_sent: AtomicU64::new(0),
                broadcasts_received: AtomicU64::new(0),
                total_discovered: AtomicU64::new(0),
            }),
        }
    }

    /// Set the identity to announce.
    pub fn set_local_peer(&self, peer_id: &str, tcp_port: u16, code_hash: &str) {
        let mut local = self.inner.local.lock().unwrap();
        local.peer_id = peer_id.to_string();
        local.tcp_port = tcp_port;
        local.code_hash = code_hash.to_string();
    }

    /// Install the new-peer callback.
    pub fn set_discovery_callback(&self, callback: DiscoveryCallback) {
        *self.inner.callback.write().unwrap() = Some(callback);
    }

    /// Bind the socket and start the listen/broadcast loops.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Bind`] when the discovery port is unavailable.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.inner.config.enable_udp {
            info!("udp discovery disabled by configuration");
            return Ok(());
        }

        let port = self.inner.config.udp_port;
        let socket = bind_broadcast_socket(port)
            .map_err(|e| DiscoveryError::Bind(format!("port {port}: {e}")))?;
        let socket = Arc::new(socket);
        *self.inner.socket.lock().await = Some(socket.clone());

        info!(port, "udp discovery started");

        // Listen loop.
        let inner = self.inner.clone();
        let listen_socket = socket.clone();
        let mut stop_rx = self.inner.stop.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                let received = tokio::select! {
                    _ = stop_rx.changed() => break,
                    received = listen_socket.recv_from(&mut buf) => received,
                };
                match received {
                    Ok((len, sender)) => {
                        let Ok(message) = std::str::from_utf8(&buf[..len]) else {
                            continue;
                        };
                        if let Some(peer) =
                            inner.handle_message(message, &sender.ip().to_string())
                        {
                            info!(
                                peer = peer.peer_id,
                                address = peer.address,
                                port = peer.port,
                                "discovered peer"
                            );
                            inner.notify(&peer);
                        }
                    }
                    Err(err) => {
                        if inner.running.load(Ordering::SeqCst) {
                            warn!(%err, "discovery receive failed");
                        }
                        break;
                    }
                }
            }
        });

        // Broadcast + prune loop.
        let inner = self.inner.clone();
        let mut stop_rx = self.inner.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(inner.config.broadcast_interval_ms));
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        if !inner.running.load(Ordering::SeqCst) {
                            break;
                        }
                        inner.send_broadcast().await;
                        inner.prune_stale();
                    }
                }
            }
        });

        Ok(())
    }

    /// Send one announcement immediately (subject to backoff).
    pub async fn broadcast_presence(&self) -> bool {
        if !self.inner.running.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.send_broadcast().await
    }

    /// Stop loops and release the socket. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.stop.send(true);
        *self.inner.socket.lock().await = None;
        info!("udp discovery stopped");
    }

    /// All currently known peers.
    #[must_use]
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.inner.peers.lock().unwrap().values().cloned().collect()
    }

    /// One peer by identifier.
    #[must_use]
    pub fn peer(&self, peer_id: &str) -> Option<DiscoveredPeer> {
        self.inner.peers.lock().unwrap().get(peer_id).cloned()
    }

    /// Forget a peer.
    pub fn remove_peer(&self, peer_id: &str) {
        self.inner.peers.lock().unwrap().remove(peer_id);
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> DiscoveryStats {
        DiscoveryStats {
            broadcasts_sent: self.inner.broadcasts_sent.load(Ordering::Relaxed),
            broadcasts_received: self.inner.broadcasts_received.load(Ordering::Relaxed),
            total_discovered: self.inner.total_discovered.load(Ordering::Relaxed),
            active_peers: self.inner.peers.lock().unwrap().len(),
        }
    }

    #[cfg(test)]
    fn handle_message(&self, message: &str, sender_ip: &str) -> Option<DiscoveredPeer> {
        self.inner.handle_message(message, sender_ip)
    }

    #[cfg(test)]
    fn prune_stale(&self) {
        self.inner.prune_stale();
    }
}

/// Bind a reusable broadcast-capable UDP socket on `port`.
fn bind_broadcast_socket(port: u16) -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
