//! Rendezvous relay server.
//!
//! Accepts TCP clients speaking the Relay Message Protocol, groups them by
//! session-code hash, and forwards `DATA` between members of the same
//! group. The server only ever sees envelope bytes; with encryption on it
//! cannot read the application payload.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::protocol::{
    RELAY_MAX_PEER_ID, RelayMessageType, RelayPeerInfo, encode_data_payload, encode_message,
    encode_peer_list, parse_data_payload, read_message,
};
use crate::error::TransportError;

/// Relay server tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum concurrently registered clients
    pub max_clients: usize,
    /// Drop clients with no traffic (heartbeats included) for this long
    pub client_timeout: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            client_timeout: Duration::from_secs(90),
        }
    }
}

struct ClientHandle {
    code_hash: String,
    address: String,
    port: u16,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    last_seen: std::sync::Mutex<Instant>,
}

impl ClientHandle {
    fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    fn send(&self, kind: RelayMessageType, payload: &[u8]) {
        let _ = self.tx.send(encode_message(kind, payload));
    }
}

/// The rendezvous server.
pub struct RelayServer {
    listener: TcpListener,
    clients: Arc<DashMap<String, Arc<ClientHandle>>>,
    config: RelayServerConfig,
    stop: watch::Sender<bool>,
}

impl RelayServer {
    /// Bind the server to `addr` (e.g. `0.0.0.0:9471`).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] when the socket cannot bind.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        Self::bind_with_config(addr, RelayServerConfig::default()).await
    }

    /// Bind with explicit configuration.
    pub async fn bind_with_config(
        addr: &str,
        config: RelayServerConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        let (stop, _) = watch::channel(false);
        Ok(Self {
            listener,
            clients: Arc::new(DashMap::new()),
            config,
            stop,
        })
    }

    /// Port the server is listening on.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Number of registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Signal the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.stop.send(true);
    }

    /// Run the accept loop until [`RelayServer::shutdown`] is called.
    pub async fn run(&self) {
        info!(port = self.local_port(), "relay server listening");
        let mut stop_rx = self.stop.subscribe();

        // Prune silent clients periodically.
        let prune_clients = self.clients.clone();
        let timeout = self.config.client_timeout;
        let mut prune_stop = self.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = prune_stop.changed() => break,
                    _ = ticker.tick() => {
                        prune_clients.retain(|peer, handle| {
                            let alive = handle.last_seen.lock().unwrap().elapsed() < timeout;
                            if !alive {
                                debug!(peer, "pruning silent relay client");
                            }
                            alive
                        });
                    }
                }
            }
        });

        loop {
            let accepted = tokio::select! {
                _ = stop_rx.changed() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "relay client connected");
                    let clients = self.clients.clone();
                    let max_clients = self.config.max_clients;
                    tokio::spawn(async move {
                        handle_client(stream, addr.ip().to_string(), addr.port(), clients, max_clients)
                            .await;
                    });
                }
                Err(err) => {
                    warn!(%err, "relay accept failed");
                    break;
                }
            }
        }
        info!("relay server stopped");
    }
}

async fn handle_client(
    stream: TcpStream,
    address: String,
    port: u16,
    clients: Arc<DashMap<String, Arc<ClientHandle>>>,
    max_clients: usize,
) {
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if writer.write_all(&message).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut registered: Option<String> = None;

    loop {
        match serve_one(&mut reader, &address, port, &clients, &tx, &mut registered, max_clients)
            .await
        {
            Ok(true) => {}
            Ok(false) | Err(_) => break,
        }
    }

    if let Some(peer_id) = registered {
        if let Some((_, handle)) = clients.remove(&peer_id) {
            // Tell the rest of the group.
            for other in clients.iter() {
                if other.value().code_hash == handle.code_hash {
                    other
                        .value()
                        .send(RelayMessageType::Disconnect, peer_id.as_bytes());
                }
            }
        }
        debug!(peer = peer_id, "relay client gone");
    }
    writer_task.abort();
}

/// Process one inbound message; `Ok(false)` ends the session cleanly.
async fn serve_one(
    reader: &mut OwnedReadHalf,
    address: &str,
    port: u16,
    clients: &Arc<DashMap<String, Arc<ClientHandle>>>,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    registered: &mut Option<String>,
    max_clients: usize,
) -> Result<bool, TransportError> {
    let (kind, payload) = read_message(reader).await?;

    if let Some(peer_id) = registered.as_ref() {
        if let Some(handle) = clients.get(peer_id) {
            handle.touch();
        }
    }

    match kind {
        RelayMessageType::Register => {
            let text = String::from_utf8_lossy(&payload);
            let mut parts = text.splitn(2, '|');
            let peer_id = parts.next().unwrap_or("").to_string();
            let code_hash = parts.next().unwrap_or("").to_string();

            if peer_id.is_empty() || peer_id.len() > RELAY_MAX_PEER_ID {
                let _ = tx.send(encode_message(RelayMessageType::Error, b"bad registration"));
                return Ok(false);
            }
            if clients.len() >= max_clients && !clients.contains_key(&peer_id) {
                let _ = tx.send(encode_message(RelayMessageType::Error, b"server full"));
                return Ok(false);
            }

            clients.insert(
                peer_id.clone(),
                Arc::new(ClientHandle {
                    code_hash,
                    address: address.to_string(),
                    port,
                    tx: tx.clone(),
                    last_seen: std::sync::Mutex::new(Instant::now()),
                }),
            );
            *registered = Some(peer_id.clone());
            let _ = tx.send(encode_message(RelayMessageType::RegisterAck, b"OK"));
            info!(peer = peer_id, "relay client registered");
        }
        RelayMessageType::PeerList => {
            let Some(me) = registered.as_ref() else {
                let _ = tx.send(encode_message(RelayMessageType::Error, b"not registered"));
                return Ok(true);
            };
            let my_hash = clients.get(me).map(|h| h.code_hash.clone()).unwrap_or_default();
            let peers: Vec<RelayPeerInfo> = clients
                .iter()
                .filter(|e| e.key() != me && e.value().code_hash == my_hash)
                .map(|e| RelayPeerInfo {
                    peer_id: e.key().clone(),
                    address: e.value().address.clone(),
                    port: e.value().port,
                    nat_type: "unknown".to_string(),
                })
                .collect();
            let _ = tx.send(encode_message(
                RelayMessageType::PeerList,
                &encode_peer_list(&peers),
            ));
        }
        RelayMessageType::Connect => {
            let Some(me) = registered.clone() else {
                let _ = tx.send(encode_message(RelayMessageType::Error, b"not registered"));
                return Ok(true);
            };
            let target = String::from_utf8_lossy(&payload).to_string();
            let my_hash = clients.get(&me).map(|h| h.code_hash.clone()).unwrap_or_default();

            match clients.get(&target) {
                Some(handle) if handle.code_hash == my_hash => {
                    // Both ends learn about each other.
                    handle.send(RelayMessageType::ConnectAck, me.as_bytes());
                    let _ = tx.send(encode_message(
                        RelayMessageType::ConnectAck,
                        target.as_bytes(),
                    ));
                }
                _ => {
                    let _ = tx.send(encode_message(RelayMessageType::Error, b"peer not found"));
                }
            }
        }
        RelayMessageType::Data => {
            let Some(me) = registered.clone() else {
                let _ = tx.send(encode_message(RelayMessageType::Error, b"not registered"));
                return Ok(true);
            };
            let Some((target, bytes)) = parse_data_payload(&payload) else {
                let _ = tx.send(encode_message(RelayMessageType::Error, b"bad data payload"));
                return Ok(true);
            };
            let my_hash = clients.get(&me).map(|h| h.code_hash.clone()).unwrap_or_default();

            match clients.get(&target) {
                Some(handle) if handle.code_hash == my_hash => {
                    // Rewrite the address header: receiver sees the source.
                    if let Ok(forward) = encode_data_payload(&me, &bytes) {
                        handle.send(RelayMessageType::Data, &forward);
                    }
                }
                _ => {
                    let _ = tx.send(encode_message(RelayMessageType::Error, b"peer not found"));
                }
            }
        }
        RelayMessageType::Heartbeat => {
            let _ = tx.send(encode_message(RelayMessageType::Heartbeat, b""));
        }
        RelayMessageType::Disconnect => {
            return Ok(false);
        }
        RelayMessageType::RegisterAck
        | RelayMessageType::ConnectAck
        | RelayMessageType::Error => {
            // Server-to-client messages; ignore when sent at us.
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::{parse_peer_list, write_message};
    use tokio::net::TcpStream;

    async fn start_server() -> (Arc<RelayServer>, u16) {
        let server = Arc::new(RelayServer::bind("127.0.0.1:0").await.unwrap());
        let port = server.local_port();
        let runner = server.clone();
        tokio::spawn(async move {
            runner.run().await;
        });
        (server, port)
    }

    async fn register(
        port: u16,
        peer: &str,
        hash: &str,
    ) -> (OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf) {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (mut read, mut write) = stream.into_split();
        let reg = format!("{peer}|{hash}");
        write_message(&mut write, RelayMessageType::Register, reg.as_bytes())
            .await
            .unwrap();
        let (kind, payload) = read_message(&mut read).await.unwrap();
        assert_eq!(kind, RelayMessageType::RegisterAck);
        assert_eq!(payload, b"OK");
        (read, write)
    }

    #[tokio::test]
    async fn test_register_and_peer_list() {
        let (server, port) = start_server().await;

        let (_ra, mut wa) = register(port, "peer-a", "hash1").await;
        let (mut rb, mut wb) = register(port, "peer-b", "hash1").await;
        let (_rc, _wc) = register(port, "peer-c", "hash2").await;
        assert_eq!(server.client_count(), 3);

        write_message(&mut wb, RelayMessageType::PeerList, b"")
            .await
            .unwrap();
        let (kind, payload) = read_message(&mut rb).await.unwrap();
        assert_eq!(kind, RelayMessageType::PeerList);
        let peers = parse_peer_list(&payload);
        // Only the same-hash peer shows up.
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, "peer-a");

        let _ = wa.shutdown().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_data_forwarding_rewrites_source() {
        let (server, port) = start_server().await;

        let (mut ra, _wa) = register(port, "peer-a", "shared").await;
        let (_rb, mut wb) = register(port, "peer-b", "shared").await;

        let data = encode_data_payload("peer-a", b"tunnelled").unwrap();
        write_message(&mut wb, RelayMessageType::Data, &data)
            .await
            .unwrap();

        let (kind, payload) = read_message(&mut ra).await.unwrap();
        assert_eq!(kind, RelayMessageType::Data);
        let (source, bytes) = parse_data_payload(&payload).unwrap();
        assert_eq!(source, "peer-b");
        assert_eq!(bytes, b"tunnelled");

        server.shutdown();
    }

    #[tokio::test]
    async fn test_data_across_groups_refused() {
        let (server, port) = start_server().await;

        let (_ra, _wa) = register(port, "peer-a", "group1").await;
        let (mut rb, mut wb) = register(port, "peer-b", "group2").await;

        let data = encode_data_payload("peer-a", b"nope").unwrap();
        write_message(&mut wb, RelayMessageType::Data, &data)
            .await
            .unwrap();

        let (kind, payload) = read_message(&mut rb).await.unwrap();
        assert_eq!(kind, RelayMessageType::Error);
        assert_eq!(payload, b"peer not found");

        server.shutdown();
    }

    #[tokio::test]
    async fn test_connect_acks_both_sides() {
        let (server, port) = start_server().await;

        let (mut ra, _wa) = register(port, "peer-a", "shared").await;
        let (mut rb, mut wb) = register(port, "peer-b", "shared").await;

        write_message(&mut wb, RelayMessageType::Connect, b"peer-a")
            .await
            .unwrap();

        let (kind, payload) = read_message(&mut rb).await.unwrap();
        assert_eq!(kind, RelayMessageType::ConnectAck);
        assert_eq!(payload, b"peer-a");

        let (kind, payload) = read_message(&mut ra).await.unwrap();
        assert_eq!(kind, RelayMessageType::ConnectAck);
        assert_eq!(payload, b"peer-b");

        server.shutdown();
    }

    #[tokio::test]
    async fn test_heartbeat_echo() {
        let (server, port) = start_server().await;
        let (mut ra, mut wa) = register(port, "peer-a", "h").await;

        write_message(&mut wa, RelayMessageType::Heartbeat, b"")
            .await
            .unwrap();
        let (kind, _) = read_message(&mut ra).await.unwrap();
        assert_eq!(kind, RelayMessageType::Heartbeat);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_unregistered_requests_refused() {
        let (server, port) = start_server().await;
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (mut read, mut write) = stream.into_split();

        write_message(&mut write, RelayMessageType::PeerList, b"")
            .await
            .unwrap();
        let (kind, payload) = read_message(&mut read).await.unwrap();
        assert_eq!(kind, RelayMessageType::Error);
        assert_eq!(payload, b"not registered");

        server.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_notifies_group() {
        let (server, port) = start_server().await;

        let (mut ra, _wa) = register(port, "peer-a", "shared").await;
        let (_rb, mut wb) = register(port, "peer-b", "shared").await;

        write_message(&mut wb, RelayMessageType::Disconnect, b"")
            .await
            .unwrap();

        let (kind, payload) = read_message(&mut ra).await.unwrap();
        assert_eq!(kind, RelayMessageType::Disconnect);
        assert_eq!(payload, b"peer-b");

        server.shutdown();
    }
}
