//! Transport registry and adaptive selector.
//!
//! Owns one instance of each registered carrier, binds every peer to at
//! most one of them, caches per-peer quality per carrier and picks the
//! carrier for each send according to the configured strategy. Failover
//! advances a peer to the next registered carrier in priority order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::quality::{ConnectionQuality, SelectionContext};
use crate::transport::{PeerTransport, TransportKind};

/// Transport selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Direct-connection priority: TCP > QUIC > WebRTC > Relay
    PreferDirect,
    /// Lowest EWMA round-trip time wins
    PreferFast,
    /// Lowest EWMA packet loss wins
    PreferReliable,
    /// Bound transport while connected, priority order otherwise
    #[default]
    FallbackChain,
    /// Context-weighted composite score
    Adaptive,
}

/// A peer's commitment to one carrier.
#[derive(Debug, Clone)]
pub struct TransportBinding {
    /// Bound peer
    pub peer_id: String,
    /// Carrier currently in use
    pub active: TransportKind,
    /// Carrier the peer should return to when possible
    pub preferred: TransportKind,
    /// Times this binding has failed over
    pub failover_count: u32,
    /// When the current binding was made
    pub bound_at: Instant,
}

/// Callback invoked when a peer's binding changes; `None` means the peer
/// ran out of carriers.
pub type BindingListener = Arc<dyn Fn(&str, Option<TransportKind>) + Send + Sync>;

#[derive(Default)]
struct State {
    bindings: HashMap<String, TransportBinding>,
    quality_cache: HashMap<String, HashMap<TransportKind, ConnectionQuality>>,
    strategy: SelectionStrategy,
}

/// Registry of carriers plus per-peer bindings.
pub struct TransportRegistry {
    // BTreeMap iteration order is the priority order (TransportKind: Ord).
    transports: std::sync::RwLock<BTreeMap<TransportKind, Arc<dyn PeerTransport>>>,
    state: std::sync::Mutex<State>,
    binding_listener: std::sync::RwLock<Option<BindingListener>>,
}

impl TransportRegistry {
    /// Create an empty registry with the default strategy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            transports: std::sync::RwLock::new(BTreeMap::new()),
            state: std::sync::Mutex::new(State::default()),
            binding_listener: std::sync::RwLock::new(None),
        }
    }

    /// Register a carrier instance. Replaces any previous instance of the
    /// same kind.
    pub fn register(&self, transport: Arc<dyn PeerTransport>) {
        let kind = transport.kind();
        self.transports.write().unwrap().insert(kind, transport);
        info!(%kind, "transport registered");
    }

    /// Remove a carrier; its bindings dissolve on the next failover.
    pub fn unregister(&self, kind: TransportKind) -> Option<Arc<dyn PeerTransport>> {
        self.transports.write().unwrap().remove(&kind)
    }

    /// Look up a carrier by kind.
    #[must_use]
    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn PeerTransport>> {
        self.transports.read().unwrap().get(&kind).cloned()
    }

    /// Whether a carrier of this kind is registered.
    #[must_use]
    pub fn has(&self, kind: TransportKind) -> bool {
        self.transports.read().unwrap().contains_key(&kind)
    }

    /// Registered carrier kinds in priority order.
    #[must_use]
    pub fn kinds(&self) -> Vec<TransportKind> {
        self.transports.read().unwrap().keys().copied().collect()
    }

    /// Replace the selection strategy.
    pub fn set_strategy(&self, strategy: SelectionStrategy) {
        self.state.lock().unwrap().strategy = strategy;
    }

    /// Current selection strategy.
    #[must_use]
    pub fn strategy(&self) -> SelectionStrategy {
        self.state.lock().unwrap().strategy
    }

    /// Install a binding-change listener.
    pub fn set_binding_listener(&self, listener: BindingListener) {
        *self.binding_listener.write().unwrap() = Some(listener);
    }

    fn notify_binding(&self, peer: &str, kind: Option<TransportKind>) {
        let listener = self.binding_listener.read().unwrap().clone();
        if let Some(listener) = listener {
            listener(peer, kind);
        }
    }

    /// Bind `peer` to `kind`, replacing any previous binding (a peer never
    /// holds two).
    pub fn bind_peer(&self, peer: &str, kind: TransportKind) {
        {
            let mut state = self.state.lock().unwrap();
            state.bindings.insert(
                peer.to_string(),
                TransportBinding {
                    peer_id: peer.to_string(),
                    active: kind,
                    preferred: kind,
                    failover_count: 0,
                    bound_at: Instant::now(),
                },
            );
        }
        debug!(peer, %kind, "peer bound to transport");
        self.notify_binding(peer, Some(kind));
    }

    /// Remove `peer`'s binding and cached qualities.
    pub fn unbind_peer(&self, peer: &str) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.quality_cache.remove(peer);
            state.bindings.remove(peer).is_some()
        };
        if removed {
            self.notify_binding(peer, None);
        }
    }

    /// Current binding for `peer`.
    #[must_use]
    pub fn binding(&self, peer: &str) -> Option<TransportBinding> {
        self.state.lock().unwrap().bindings.get(peer).cloned()
    }

    /// Record an externally measured quality.
    pub fn update_quality(&self, peer: &str, kind: TransportKind, quality: ConnectionQuality) {
        self.state
            .lock()
            .unwrap()
            .quality_cache
            .entry(peer.to_string())
            .or_default()
            .insert(kind, quality);
    }

    /// Cached quality for one peer/carrier pair.
    #[must_use]
    pub fn cached_quality(&self, peer: &str, kind: TransportKind) -> Option<ConnectionQuality> {
        self.state
            .lock()
            .unwrap()
            .quality_cache
            .get(peer)
            .and_then(|m| m.get(&kind))
            .cloned()
    }

    /// Pick the carrier for a send to `peer`.
    ///
    /// A connected binding always wins; otherwise the configured strategy
    /// decides among registered carriers.
    #[must_use]
    pub fn select_transport(
        &self,
        peer: &str,
        context: &SelectionContext,
    ) -> Option<Arc<dyn PeerTransport>> {
        // Bound and still connected: stay put.
        if let Some(binding) = self.binding(peer) {
            if let Some(transport) = self.get(binding.active) {
                if transport.is_connected(peer) {
                    return Some(transport);
                }
            }
        }
        self.select_by_strategy(peer, context)
    }

    fn select_by_strategy(
        &self,
        peer: &str,
        context: &SelectionContext,
    ) -> Option<Arc<dyn PeerTransport>> {
        let strategy = self.strategy();
        match strategy {
            SelectionStrategy::PreferFast => self
                .best_by(peer, |q| {
                    if q.ewma_rtt_ms >= 0.0 {
                        Some(q.ewma_rtt_ms)
                    } else {
                        None
                    }
                })
                .or_else(|| self.first_registered(peer)),
            SelectionStrategy::PreferReliable => self
                .best_by(peer, |q| Some(q.ewma_loss_percent))
                .or_else(|| self.first_registered(peer)),
            SelectionStrategy::Adaptive => self
                .best_by(peer, |q| {
                    let score = q.compute_score(context);
                    if score.is_finite() { Some(score) } else { None }
                })
                .or_else(|| self.first_registered(peer)),
            SelectionStrategy::PreferDirect | SelectionStrategy::FallbackChain => {
                self.first_registered(peer)
            }
        }
    }

    /// Lowest-keyed carrier according to `metric` over the quality cache.
    fn best_by<F>(&self, peer: &str, metric: F) -> Option<Arc<dyn PeerTransport>>
    where
        F: Fn(&ConnectionQuality) -> Option<f64>,
    {
        let candidates: Vec<(TransportKind, f64)> = {
            let state = self.state.lock().unwrap();
            let Some(qualities) = state.quality_cache.get(peer) else {
                return None;
            };
            qualities
                .iter()
                .filter_map(|(kind, q)| metric(q).map(|score| (*kind, score)))
                .collect()
        };

        candidates
            .into_iter()
            .filter(|(kind, _)| self.has(*kind))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .and_then(|(kind, _)| self.get(kind))
    }

    /// First registered carrier in priority order, preferring one that is
    /// already connected to the peer.
    fn first_registered(&self, peer: &str) -> Option<Arc<dyn PeerTransport>> {
        let transports = self.transports.read().unwrap();
        transports
            .values()
            .find(|t| t.is_connected(peer))
            .or_else(|| transports.values().next())
            .cloned()
    }

    /// Advance `peer` to the next registered carrier after the currently
    /// bound one, skipping the current. Returns the new carrier, or
    /// `None` (and unbinds) when no alternative exists.
    pub fn handle_failover(&self, peer: &str) -> Option<Arc<dyn PeerTransport>> {
        let current = {
            let mut state = self.state.lock().unwrap();
            match state.bindings.get_mut(peer) {
                Some(binding) => {
                    binding.failover_count += 1;
                    binding.active
                }
                None => TransportKind::Tcp,
            }
        };

        let next = {
            let transports = self.transports.read().unwrap();
            TransportKind::PRIORITY_ORDER
                .iter()
                .copied()
                .skip_while(|k| *k != current)
                .skip(1)
                .find(|k| transports.contains_key(k))
        };

        match next {
            Some(kind) => {
                {
                    let mut state = self.state.lock().unwrap();
                    let failovers = state
                        .bindings
                        .get(peer)
                        .map(|b| b.failover_count)
                        .unwrap_or(1);
                    state.bindings.insert(
                        peer.to_string(),
                        TransportBinding {
                            peer_id: peer.to_string(),
                            active: kind,
                            preferred: current,
                            failover_count: failovers,
                            bound_at: Instant::now(),
                        },
                    );
                }
                info!(peer, from = %current, to = %kind, "transport failover");
                self.notify_binding(peer, Some(kind));
                self.get(kind)
            }
            None => {
                debug!(peer, "failover exhausted all transports");
                self.unbind_peer(peer);
                None
            }
        }
    }

    /// Shut down every registered carrier and clear all state.
    pub async fn shutdown_all(&self) {
        let transports: Vec<Arc<dyn PeerTransport>> = {
            let mut guard = self.transports.write().unwrap();
            let all = guard.values().cloned().collect();
            guard.clear();
            all
        };
        for transport in transports {
            transport.shutdown().await;
        }
        let mut state = self.state.lock().unwrap();
        state.bindings.clear();
        state.quality_cache.clear();
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}
