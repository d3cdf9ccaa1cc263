//! Shared fixtures for in-crate transport tests.

use std::sync::Mutex;

use sentinel_crypto::cipher::hmac_sha256;

use crate::handshake::{CLIENT_AUTH_LABEL, HandshakeAuth};

/// Handshake state backed by static strings; the MAC key is derived
/// directly from the code so two fixtures with the same code agree.
pub struct StaticAuth {
    pub id: String,
    pub code_hash: String,
    pub mac_key: Option<Vec<u8>>,
    pub authenticated: Mutex<Vec<String>>,
}

impl StaticAuth {
    pub fn new(id: &str, code: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            code_hash: code
                .map(sentinel_crypto::session_code_hash)
                .unwrap_or_default(),
            mac_key: code.map(|c| format!("mac:{c}").into_bytes()),
            authenticated: Mutex::new(Vec::new()),
        }
    }
}

impl HandshakeAuth for StaticAuth {
    fn local_peer_id(&self) -> String {
        self.id.clone()
    }

    fn session_code_hash(&self) -> String {
        self.code_hash.clone()
    }

    fn auth_digest(
        &self,
        client_nonce: &[u8],
        server_nonce: &[u8],
        client_id: &str,
        server_id: &str,
    ) -> Option<[u8; 32]> {
        let key = self.mac_key.as_ref()?;
        hmac_sha256(
            key,
            &[
                client_nonce,
                server_nonce,
                client_id.as_bytes(),
                server_id.as_bytes(),
                CLIENT_AUTH_LABEL,
            ],
        )
        .ok()
    }

    fn on_peer_authenticated(&self, peer_id: &str) {
        self.authenticated.lock().unwrap().push(peer_id.to_string());
    }
}
