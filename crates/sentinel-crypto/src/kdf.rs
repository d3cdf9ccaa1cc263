//! Session key derivation.
//!
//! Keys are derived from the human-shareable session code with a slow
//! password KDF. The code itself never appears on the wire; only its
//! SHA-256 hash is stored or compared.

use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{KEY_SIZE, MAC_SIZE, error::CryptoError};

/// OWASP-recommended iteration count for PBKDF2-HMAC-SHA256.
pub const DEFAULT_KDF_ITERATIONS: u32 = 310_000;

/// Fixed derivation salt, extended with the rotation counter.
pub const DEFAULT_SALT: &[u8] = b"sentinelfs-session-v1";

/// Encryption and MAC keys derived from a session code.
///
/// Key material is wiped when the struct is dropped or replaced.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    /// AES-256 encryption key
    pub enc_key: [u8; KEY_SIZE],
    /// HMAC-SHA256 key
    pub mac_key: [u8; MAC_SIZE],
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("DerivedKeys(..)")
    }
}

/// Derive an (encryption, MAC) key pair from a session code.
///
/// Produces 64 bytes of PBKDF2-HMAC-SHA256 output, split into a 32-byte
/// encryption key and a 32-byte MAC key. The intermediate buffer is wiped.
///
/// # Errors
///
/// Returns [`CryptoError::KeyLength`] when the session code is empty.
pub fn derive_key_pair(
    session_code: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<DerivedKeys, CryptoError> {
    if session_code.is_empty() {
        return Err(CryptoError::KeyLength);
    }

    let mut output = [0u8; KEY_SIZE + MAC_SIZE];
    pbkdf2_hmac::<Sha256>(session_code.as_bytes(), salt, iterations, &mut output);

    let mut keys = DerivedKeys {
        enc_key: [0u8; KEY_SIZE],
        mac_key: [0u8; MAC_SIZE],
    };
    keys.enc_key.copy_from_slice(&output[..KEY_SIZE]);
    keys.mac_key.copy_from_slice(&output[KEY_SIZE..]);
    output.zeroize();

    Ok(keys)
}

/// Build the salt for a given rotation counter.
///
/// Rotation 0 uses the fixed salt unchanged so that fresh daemons and
/// long-running ones agree on the initial keys.
#[must_use]
pub fn rotation_salt(rotation: u32) -> Vec<u8> {
    if rotation == 0 {
        return DEFAULT_SALT.to_vec();
    }
    let mut salt = DEFAULT_SALT.to_vec();
    salt.extend_from_slice(&rotation.to_be_bytes());
    salt
}

/// SHA-256 hash of a session code, hex-encoded.
///
/// This is the only form of the code that may be persisted or exchanged.
#[must_use]
pub fn session_code_hash(session_code: &str) -> String {
    let digest = Sha256::digest(session_code.as_bytes());
    hex::encode(digest)
}
