//! Shared helpers for SentinelFS integration tests.

use std::sync::Arc;
use std::time::Duration;

use sentinel_core::{
    DaemonConfig, EventBus, MemoryStore, Metrics, NetworkService, SessionManager,
    config::{DiscoverySection, TransportsEnabled},
};

/// KDF cost for tests; production uses the OWASP-level default.
pub const TEST_KDF_ITERATIONS: u32 = 1_000;

/// A network service plus handles to its collaborators.
pub struct TestNode {
    /// The façade under test
    pub network: Arc<NetworkService>,
    /// Shared session manager
    pub session: Arc<SessionManager>,
    /// Backing store
    pub storage: Arc<MemoryStore>,
}

/// Build a TCP-only node on an ephemeral port with discovery disabled.
pub fn make_node(peer_id: &str, code: &str, encryption: bool) -> TestNode {
    let session = Arc::new(SessionManager::with_kdf_iterations(
        peer_id,
        TEST_KDF_ITERATIONS,
    ));
    if !code.is_empty() {
        session.set_session_code(code, encryption).unwrap();
    }
    let storage = Arc::new(MemoryStore::new());
    let config = DaemonConfig {
        listen_port: 0,
        transports_enabled: TransportsEnabled {
            tcp: true,
            quic: false,
            webrtc: false,
            relay: false,
        },
        discovery: DiscoverySection {
            enable_udp: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let network = Arc::new(NetworkService::new(
        config,
        session.clone(),
        storage.clone(),
        EventBus::new(),
        Arc::new(Metrics::new()),
    ));
    TestNode {
        network,
        session,
        storage,
    }
}

/// Poll `probe` until it returns true, panicking after five seconds.
pub async fn wait_until(mut probe: impl FnMut() -> bool) {
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
