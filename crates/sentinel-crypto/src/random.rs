//! Secure random generation for nonces and peer identifiers.

use rand::{Rng, RngCore, rngs::OsRng};

use crate::{CBC_IV_SIZE, GCM_NONCE_SIZE, HANDSHAKE_NONCE_SIZE};

/// Fill a buffer with cryptographically secure random bytes.
pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Generate a random GCM nonce.
#[must_use]
pub fn gcm_nonce() -> [u8; GCM_NONCE_SIZE] {
    let mut nonce = [0u8; GCM_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Generate a random CBC initialisation vector.
#[must_use]
pub fn cbc_iv() -> [u8; CBC_IV_SIZE] {
    let mut iv = [0u8; CBC_IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Generate a random handshake nonce.
#[must_use]
pub fn handshake_nonce() -> [u8; HANDSHAKE_NONCE_SIZE] {
    let mut nonce = [0u8; HANDSHAKE_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Generate a random printable peer identifier.
///
/// Identifiers are assigned once per daemon start and never persisted.
#[must_use]
pub fn peer_identifier() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = OsRng;
    let suffix: String = (0..12)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("peer-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_sizes() {
        assert_eq!(gcm_nonce().len(), GCM_NONCE_SIZE);
        assert_eq!(cbc_iv().len(), CBC_IV_SIZE);
        assert_eq!(handshake_nonce().len(), HANDSHAKE_NONCE_SIZE);
    }

    #[test]
    fn test_nonces_are_distinct() {
        // Collisions in 96 random bits would indicate a broken RNG.
        assert_ne!(gcm_nonce(), gcm_nonce());
        assert_ne!(handshake_nonce(), handshake_nonce());
    }

    #[test]
    fn test_peer_identifier_shape() {
        let id = peer_identifier();
        assert!(id.starts_with("peer-"));
        assert_eq!(id.len(), "peer-".len() + 12);
        assert!(id.chars().all(|c| c.is_ascii_graphic()));
    }

    #[test]
    fn test_peer_identifiers_unique() {
        let a = peer_identifier();
        let b = peer_identifier();
        assert_ne!(a, b);
    }
}
