//! In-process typed event bus.
//!
//! Topic-keyed publish/subscribe decoupling producers from consumers.
//! Handlers run synchronously on the publisher's task; the subscriber
//! list lock is released before any handler is invoked, so handlers may
//! publish or subscribe without deadlocking. Subscriptions are
//! lifetime-bounded: dropping the [`Subscription`] guard unsubscribes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Well-known topic names.
pub mod topics {
    /// A peer completed a handshake on some transport.
    pub const PEER_CONNECTED: &str = "peer.connected";
    /// A peer went away.
    pub const PEER_DISCONNECTED: &str = "peer.disconnected";
    /// Discovery found a peer in our session.
    pub const PEER_DISCOVERED: &str = "peer.discovered";
    /// A decrypted application payload arrived.
    pub const MESSAGE: &str = "net.message";
    /// A peer's transport binding changed.
    pub const BINDING_CHANGED: &str = "net.binding";
    /// Fresh quality metrics for a peer.
    pub const QUALITY_CHANGED: &str = "net.quality";
}

/// Events carried by the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Peer connected on `transport`
    PeerConnected {
        /// Peer identifier
        peer_id: String,
        /// Carrier name
        transport: String,
    },
    /// Peer disconnected
    PeerDisconnected {
        /// Peer identifier
        peer_id: String,
    },
    /// Discovery announcement accepted
    PeerDiscovered {
        /// Peer identifier
        peer_id: String,
        /// Announced address
        address: String,
        /// Announced TCP port
        port: u16,
    },
    /// Decrypted application payload
    Message {
        /// Source peer
        peer_id: String,
        /// Plaintext payload
        payload: Vec<u8>,
    },
    /// Registry binding change; `None` transport = unbound
    BindingChanged {
        /// Peer identifier
        peer_id: String,
        /// New carrier, if any
        transport: Option<String>,
    },
    /// Quality update
    QualityChanged {
        /// Peer identifier
        peer_id: String,
        /// Carrier name
        transport: String,
        /// EWMA round-trip time in milliseconds
        rtt_ms: f64,
    },
}

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

struct Inner {
    next_id: AtomicU64,
    subscribers: std::sync::Mutex<HashMap<String, Vec<(u64, Handler)>>>,
}

/// The bus handle; cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                subscribers: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe `handler` to `topic`. The subscription lives as long as
    /// the returned guard.
    #[must_use]
    pub fn subscribe(&self, topic: &str, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        Subscription {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            id,
        }
    }

    /// Publish `event` to every subscriber of `topic`, synchronously.
    pub fn publish(&self, topic: &str, event: &BusEvent) {
        // Snapshot under the lock, invoke outside it.
        let handlers: Vec<Handler> = {
            let subscribers = self.inner.subscribers.lock().unwrap();
            match subscribers.get(topic) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of live subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard representing one live subscription; dropping it unsubscribes.
pub struct Subscription {
    inner: Arc<Inner>,
    topic: String,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        if let Some(list) = subscribers.get_mut(&self.topic) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                subscribers.remove(&self.topic);
            }
        }
    }
}
