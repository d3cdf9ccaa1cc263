//! Session management: keys, envelope crypto, replay counters and peer
//! authentication state.
//!
//! One session manager per daemon. The session code is the membership
//! secret: every peer with the same code derives the same key pair and
//! can authenticate and decrypt. Rotation keeps the previous keys valid
//! for one grace window so envelopes in flight still open.
//!
//! Replay protection is per peer and per direction: outbound envelopes
//! take a strictly increasing sequence; inbound envelopes must exceed the
//! stored high-water mark to be accepted, and acceptance raises the mark.

use std::collections::HashMap;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroize;

use sentinel_crypto::{
    CryptoError, DerivedKeys, Envelope, EnvelopeVersion, cipher::hmac_sha256,
    constant_time::ct_eq, derive_key_pair, kdf::rotation_salt, open_envelope, seal_envelope,
    session_code_hash,
};
use sentinel_transport::handshake::{CLIENT_AUTH_LABEL, HandshakeAuth};

/// Wipe replaced key material before letting go of it.
fn wipe_keys(keys: &mut Option<DerivedKeys>) {
    if let Some(k) = keys.as_mut() {
        k.zeroize();
    }
    *keys = None;
}

/// Peer authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// Never seen
    #[default]
    Unknown,
    /// Handshake in progress
    HandshakePending,
    /// Handshake completed successfully
    Authenticated,
    /// Handshake failed
    Rejected,
    /// Authentication aged out
    Expired,
}

/// Session-layer errors, mapped onto the envelope failure taxonomy.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Keys are missing or the KDF refused the input
    #[error("encryption unavailable: {0}")]
    Encryption(String),

    /// Envelope failed authentication
    #[error("envelope authentication failed")]
    Auth,

    /// Envelope sequence did not exceed the high-water mark
    #[error("replayed envelope: sequence {sequence} <= high water {high_water}")]
    Replay {
        /// Sequence presented by the envelope
        sequence: u64,
        /// Stored inbound high-water mark
        high_water: u64,
    },

    /// Unknown envelope version byte
    #[error("unsupported envelope version: {0}")]
    Version(u8),

    /// Envelope could not be parsed
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

impl From<CryptoError> for SessionError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Auth => Self::Auth,
            CryptoError::UnknownVersion(v) => Self::Version(v),
            CryptoError::Truncated { .. } | CryptoError::Padding => {
                Self::Malformed(err.to_string())
            }
            CryptoError::KeyLength | CryptoError::Cipher(_) => Self::Encryption(err.to_string()),
        }
    }
}

#[derive(Default)]
struct PeerSession {
    auth_state: AuthState,
    outbound_counter: u64,
    inbound_high_water: u64,
    authenticated_at: Option<Instant>,
}

struct State {
    session_code: String,
    code_hash: String,
    encryption_enabled: bool,
    keys: Option<DerivedKeys>,
    previous_keys: Option<DerivedKeys>,
    rotation_counter: u32,
    peers: HashMap<String, PeerSession>,
}

/// The daemon's session manager.
pub struct SessionManager {
    local_peer_id: String,
    kdf_iterations: u32,
    state: std::sync::Mutex<State>,
}

impl SessionManager {
    /// Create a manager with the production KDF cost.
    #[must_use]
    pub fn new(local_peer_id: impl Into<String>) -> Self {
        Self::with_kdf_iterations(local_peer_id, sentinel_crypto::DEFAULT_KDF_ITERATIONS)
    }

    /// Create a manager with an explicit KDF cost (tests use a low one).
    #[must_use]
    pub fn with_kdf_iterations(local_peer_id: impl Into<String>, kdf_iterations: u32) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            kdf_iterations,
            state: std::sync::Mutex::new(State {
                session_code: String::new(),
                code_hash: String::new(),
                encryption_enabled: false,
                keys: None,
                previous_keys: None,
                rotation_counter: 0,
                peers: HashMap::new(),
            }),
        }
    }

    /// The local peer identifier.
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Install a session code and (re)derive keys.
    ///
    /// Clears all per-peer state: counters and authentication do not
    /// survive a membership change. Keys are derived whenever a non-empty
    /// code is set, independent of `enable_encryption`, because the
    /// handshake digest needs the MAC key either way.
    ///
    /// # Errors
    ///
    /// [`SessionError::Encryption`] when derivation fails.
    pub fn set_session_code(
        &self,
        code: &str,
        enable_encryption: bool,
    ) -> Result<(), SessionError> {
        let new_keys = if code.is_empty() {
            None
        } else {
            Some(
                derive_key_pair(code, &rotation_salt(0), self.kdf_iterations)
                    .map_err(|e| SessionError::Encryption(e.to_string()))?,
            )
        };

        let mut state = self.state.lock().unwrap();
        wipe_keys(&mut state.keys);
        wipe_keys(&mut state.previous_keys);
        state.keys = new_keys;
        state.rotation_counter = 0;
        state.session_code = code.to_string();
        state.code_hash = if code.is_empty() {
            String::new()
        } else {
            session_code_hash(code)
        };
        state.encryption_enabled = enable_encryption && !code.is_empty();
        state.peers.clear();

        info!(
            encryption = state.encryption_enabled,
            "session code updated"
        );
        Ok(())
    }

    /// Current session code (empty = none).
    #[must_use]
    pub fn session_code(&self) -> String {
        self.state.lock().unwrap().session_code.clone()
    }

    /// Whether envelope encryption is active.
    #[must_use]
    pub fn encryption_enabled(&self) -> bool {
        self.state.lock().unwrap().encryption_enabled
    }

    /// Toggle envelope encryption (requires keys to enable).
    pub fn set_encryption_enabled(&self, enable: bool) {
        let mut state = self.state.lock().unwrap();
        state.encryption_enabled = enable && state.keys.is_some();
    }

    /// Constant-time comparison of a presented code with the local one.
    #[must_use]
    pub fn verify_session_code(&self, code: &str) -> bool {
        let state = self.state.lock().unwrap();
        if state.code_hash.is_empty() {
            return true;
        }
        ct_eq(session_code_hash(code).as_bytes(), state.code_hash.as_bytes())
    }

    /// Rotate to fresh keys; the previous pair stays valid for inbound
    /// envelopes until the next rotation.
    ///
    /// # Errors
    ///
    /// [`SessionError::Encryption`] when no code is set.
    pub fn rotate_key(&self) -> Result<u32, SessionError> {
        let (code, next) = {
            let state = self.state.lock().unwrap();
            if state.session_code.is_empty() {
                return Err(SessionError::Encryption("no session code".into()));
            }
            (state.session_code.clone(), state.rotation_counter + 1)
        };

        // Derivation is slow; run it outside the lock.
        let new_keys = derive_key_pair(&code, &rotation_salt(next), self.kdf_iterations)
            .map_err(|e| SessionError::Encryption(e.to_string()))?;

        let mut state = self.state.lock().unwrap();
        let old = state.keys.take();
        wipe_keys(&mut state.previous_keys);
        state.previous_keys = old;
        state.keys = Some(new_keys);
        state.rotation_counter = next;
        info!(rotation = next, "session keys rotated");
        Ok(next)
    }

    /// Current rotation counter.
    #[must_use]
    pub fn rotation_counter(&self) -> u32 {
        self.state.lock().unwrap().rotation_counter
    }

    /// Next outbound envelope sequence for `peer` (strictly increasing,
    /// starts at 1).
    #[must_use]
    pub fn next_outbound_counter(&self, peer: &str) -> u64 {
        let mut state = self.state.lock().unwrap();
        let session = state.peers.entry(peer.to_string()).or_default();
        session.outbound_counter += 1;
        session.outbound_counter
    }

    /// Accept `counter` iff it exceeds the inbound high-water mark, then
    /// raise the mark.
    #[must_use]
    pub fn verify_inbound_counter(&self, peer: &str, counter: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        let session = state.peers.entry(peer.to_string()).or_default();
        if counter <= session.inbound_high_water {
            return false;
        }
        session.inbound_high_water = counter;
        true
    }

    /// Encrypt `plaintext` for `peer` into envelope wire bytes (GCM).
    ///
    /// # Errors
    ///
    /// [`SessionError::Encryption`] when keys are missing.
    pub fn encrypt(&self, plaintext: &[u8], peer: &str) -> Result<Vec<u8>, SessionError> {
        self.encrypt_with_version(plaintext, peer, EnvelopeVersion::Gcm)
    }

    /// Encrypt with an explicit envelope version (legacy peers use v1).
    pub fn encrypt_with_version(
        &self,
        plaintext: &[u8],
        peer: &str,
        version: EnvelopeVersion,
    ) -> Result<Vec<u8>, SessionError> {
        let (keys, sequence) = {
            let mut state = self.state.lock().unwrap();
            let keys = state
                .keys
                .clone()
                .ok_or_else(|| SessionError::Encryption("no session keys".into()))?;
            let session = state.peers.entry(peer.to_string()).or_default();
            session.outbound_counter += 1;
            (keys, session.outbound_counter)
        };

        let envelope = seal_envelope(&keys, version, sequence, plaintext)?;
        Ok(envelope.serialize())
    }

    /// Decrypt envelope wire bytes from `peer`.
    ///
    /// Verifies the replay counter, authenticates with the current keys
    /// (falling back to the previous pair during the rotation grace
    /// window) and only then raises the high-water mark. Never returns
    /// partial plaintext.
    ///
    /// # Errors
    ///
    /// [`SessionError::Replay`] for stale sequences, [`SessionError::Auth`]
    /// for tag mismatches, [`SessionError::Version`] for unknown layouts.
    pub fn decrypt(&self, bytes: &[u8], peer: &str) -> Result<Vec<u8>, SessionError> {
        let envelope = Envelope::deserialize(bytes)?;

        let (keys, previous, high_water) = {
            let mut state = self.state.lock().unwrap();
            let keys = state
                .keys
                .clone()
                .ok_or_else(|| SessionError::Encryption("no session keys".into()))?;
            let previous = state.previous_keys.clone();
            let session = state.peers.entry(peer.to_string()).or_default();
            (keys, previous, session.inbound_high_water)
        };

        if envelope.sequence <= high_water {
            debug!(
                peer,
                sequence = envelope.sequence,
                high_water,
                "replayed envelope dropped"
            );
            return Err(SessionError::Replay {
                sequence: envelope.sequence,
                high_water,
            });
        }

        let plaintext = match open_envelope(&keys, &envelope) {
            Ok(pt) => pt,
            Err(CryptoError::Auth) => match &previous {
                Some(prev) => open_envelope(prev, &envelope)?,
                None => return Err(SessionError::Auth),
            },
            Err(other) => return Err(other.into()),
        };

        // Authenticated and fresh: raise the mark. A concurrent accept of
        // a higher sequence must not move it backwards.
        let mut state = self.state.lock().unwrap();
        let session = state.peers.entry(peer.to_string()).or_default();
        if envelope.sequence > session.inbound_high_water {
            session.inbound_high_water = envelope.sequence;
        } else {
            return Err(SessionError::Replay {
                sequence: envelope.sequence,
                high_water: session.inbound_high_water,
            });
        }
        Ok(plaintext)
    }

    /// Record a peer entering the handshake.
    pub fn register_peer(&self, peer: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .peers
            .entry(peer.to_string())
            .or_default()
            .auth_state = AuthState::HandshakePending;
    }

    /// Drop all state for a peer.
    pub fn unregister_peer(&self, peer: &str) {
        self.state.lock().unwrap().peers.remove(peer);
    }

    /// Authentication state for a peer.
    #[must_use]
    pub fn peer_auth_state(&self, peer: &str) -> AuthState {
        self.state
            .lock()
            .unwrap()
            .peers
            .get(peer)
            .map(|s| s.auth_state)
            .unwrap_or_default()
    }

    /// Whether a peer finished the handshake.
    #[must_use]
    pub fn is_peer_authenticated(&self, peer: &str) -> bool {
        self.peer_auth_state(peer) == AuthState::Authenticated
    }

    /// Force a peer's authentication state.
    pub fn update_peer_auth_state(&self, peer: &str, auth_state: AuthState) {
        let mut state = self.state.lock().unwrap();
        let session = state.peers.entry(peer.to_string()).or_default();
        session.auth_state = auth_state;
        if auth_state == AuthState::Authenticated {
            session.authenticated_at = Some(Instant::now());
        }
    }

    /// Peers currently tracked.
    #[must_use]
    pub fn known_peers(&self) -> Vec<String> {
        self.state.lock().unwrap().peers.keys().cloned().collect()
    }
}

impl HandshakeAuth for SessionManager {
    fn local_peer_id(&self) -> String {
        self.local_peer_id.clone()
    }

    fn session_code_hash(&self) -> String {
        self.state.lock().unwrap().code_hash.clone()
    }

    fn auth_digest(
        &self,
        client_nonce: &[u8],
        server_nonce: &[u8],
        client_id: &str,
        server_id: &str,
    ) -> Option<[u8; 32]> {
        let mac_key = {
            let state = self.state.lock().unwrap();
            state.keys.as_ref().map(|k| k.mac_key)
        }?;
        let digest = hmac_sha256(
            &mac_key,
            &[
                client_nonce,
                server_nonce,
                client_id.as_bytes(),
                server_id.as_bytes(),
                CLIENT_AUTH_LABEL,
            ],
        )
        .ok();
        // Local copy of the key; scrub it.
        let mut key = mac_key;
        key.zeroize();
        digest
    }

    fn on_peer_authenticated(&self, peer_id: &str) {
        self.update_peer_auth_state(peer_id, AuthState::Authenticated);
    }
}
