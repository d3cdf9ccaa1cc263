//! Encrypted message envelope codec.
//!
//! Authoritative wire layout for every encrypted application message,
//! independent of the transport carrying it:
//!
//! ```text
//! v1: version(1) ‖ sequence(8 BE) ‖ IV(16)    ‖ ciphertext ‖ HMAC(32)
//! v2: version(1) ‖ sequence(8 BE) ‖ nonce(12) ‖ ciphertext+tag(16)
//! ```
//!
//! The sequence number is the per-peer replay counter; it is authenticated
//! in both layouts (as associated data for GCM, as HMAC input for CBC).
//! Replay enforcement itself lives with the per-peer counter state in the
//! session manager, not here.

use crate::{
    CBC_IV_SIZE, GCM_NONCE_SIZE, GCM_TAG_SIZE, MAC_SIZE,
    cipher::{
        aes256_cbc_decrypt, aes256_cbc_encrypt, aes256_gcm_decrypt, aes256_gcm_encrypt,
        hmac_sha256,
    },
    constant_time::ct_eq,
    error::CryptoError,
    kdf::DerivedKeys,
    random,
};

/// Envelope header size: version byte plus big-endian sequence.
const HEADER_SIZE: usize = 1 + 8;

/// Envelope format versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeVersion {
    /// Version 1: AES-256-CBC with trailing HMAC-SHA256 (legacy peers)
    CbcHmac,
    /// Version 2: AES-256-GCM with authenticated header
    Gcm,
}

impl EnvelopeVersion {
    /// Wire value of this version.
    #[must_use]
    pub fn wire_value(self) -> u8 {
        match self {
            Self::CbcHmac => 1,
            Self::Gcm => 2,
        }
    }
}

/// A parsed encrypted envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Format version byte as received
    pub version: u8,
    /// Per-peer monotonic sequence number
    pub sequence: u64,
    /// IV (16 bytes, v1) or nonce (12 bytes, v2)
    pub iv: Vec<u8>,
    /// Ciphertext; includes the GCM tag for v2
    pub ciphertext: Vec<u8>,
    /// Trailing HMAC, present for v1 only
    pub hmac: Option<[u8; MAC_SIZE]>,
}

impl Envelope {
    /// Serialise to the wire layout.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_SIZE + self.iv.len() + self.ciphertext.len() + MAC_SIZE,
        );
        out.push(self.version);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        if let Some(mac) = &self.hmac {
            out.extend_from_slice(mac);
        }
        out
    }

    /// Parse an envelope from wire bytes.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Truncated`] when the input cannot hold the layout for
    /// its version byte, [`CryptoError::UnknownVersion`] for anything other
    /// than version 1 or 2.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < HEADER_SIZE + 1 {
            return Err(CryptoError::Truncated {
                expected: HEADER_SIZE + 1,
                actual: bytes.len(),
            });
        }

        let version = bytes[0];
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[1..9]);
        let sequence = u64::from_be_bytes(seq);
        let body = &bytes[HEADER_SIZE..];

        match version {
            1 => {
                let min = CBC_IV_SIZE + MAC_SIZE;
                if body.len() < min {
                    return Err(CryptoError::Truncated {
                        expected: HEADER_SIZE + min,
                        actual: bytes.len(),
                    });
                }
                let iv = body[..CBC_IV_SIZE].to_vec();
                let ct_end = body.len() - MAC_SIZE;
                let ciphertext = body[CBC_IV_SIZE..ct_end].to_vec();
                let mut mac = [0u8; MAC_SIZE];
                mac.copy_from_slice(&body[ct_end..]);
                Ok(Self {
                    version,
                    sequence,
                    iv,
                    ciphertext,
                    hmac: Some(mac),
                })
            }
            2 => {
                let min = GCM_NONCE_SIZE + GCM_TAG_SIZE;
                if body.len() < min {
                    return Err(CryptoError::Truncated {
                        expected: HEADER_SIZE + min,
                        actual: bytes.len(),
                    });
                }
                Ok(Self {
                    version,
                    sequence,
                    iv: body[..GCM_NONCE_SIZE].to_vec(),
                    ciphertext: body[GCM_NONCE_SIZE..].to_vec(),
                    hmac: None,
                })
            }
            other => Err(CryptoError::UnknownVersion(other)),
        }
    }
}

/// Associated data / MAC prefix: version byte followed by the sequence.
fn header_bytes(version: u8, sequence: u64) -> [u8; HEADER_SIZE] {
    let mut aad = [0u8; HEADER_SIZE];
    aad[0] = version;
    aad[1..].copy_from_slice(&sequence.to_be_bytes());
    aad
}

/// Encrypt a plaintext into an envelope.
///
/// # Errors
///
/// Propagates cipher failures; key material of the wrong shape surfaces as
/// [`CryptoError::KeyLength`].
pub fn seal_envelope(
    keys: &DerivedKeys,
    version: EnvelopeVersion,
    sequence: u64,
    plaintext: &[u8],
) -> Result<Envelope, CryptoError> {
    match version {
        EnvelopeVersion::Gcm => {
            let nonce = random::gcm_nonce();
            let aad = header_bytes(version.wire_value(), sequence);
            let ciphertext = aes256_gcm_encrypt(&keys.enc_key, &nonce, &aad, plaintext)?;
            Ok(Envelope {
                version: version.wire_value(),
                sequence,
                iv: nonce.to_vec(),
                ciphertext,
                hmac: None,
            })
        }
        EnvelopeVersion::CbcHmac => {
            let iv = random::cbc_iv();
            let ciphertext = aes256_cbc_encrypt(&keys.enc_key, &iv, plaintext)?;
            let header = header_bytes(version.wire_value(), sequence);
            let mac = hmac_sha256(&keys.mac_key, &[&header[..], &iv[..], &ciphertext])?;
            Ok(Envelope {
                version: version.wire_value(),
                sequence,
                iv: iv.to_vec(),
                ciphertext,
                hmac: Some(mac),
            })
        }
    }
}

/// Decrypt an envelope, verifying authenticity first.
///
/// Never returns partial plaintext: any verification failure yields an
/// error and nothing else.
///
/// # Errors
///
/// [`CryptoError::Auth`] on tag or HMAC mismatch,
/// [`CryptoError::UnknownVersion`] for unsupported versions.
pub fn open_envelope(keys: &DerivedKeys, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
    match envelope.version {
        1 => {
            let mac = envelope.hmac.as_ref().ok_or(CryptoError::Auth)?;
            let header = header_bytes(envelope.version, envelope.sequence);
            let expected =
                hmac_sha256(&keys.mac_key, &[&header[..], &envelope.iv, &envelope.ciphertext])?;
            if !ct_eq(mac, &expected) {
                return Err(CryptoError::Auth);
            }
            let mut iv = [0u8; CBC_IV_SIZE];
            iv.copy_from_slice(&envelope.iv);
            aes256_cbc_decrypt(&keys.enc_key, &iv, &envelope.ciphertext)
        }
        2 => {
            let mut nonce = [0u8; GCM_NONCE_SIZE];
            nonce.copy_from_slice(&envelope.iv);
            let aad = header_bytes(envelope.version, envelope.sequence);
            aes256_gcm_decrypt(&keys.enc_key, &nonce, &aad, &envelope.ciphertext)
        }
        other => Err(CryptoError::UnknownVersion(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::{DEFAULT_SALT, derive_key_pair};

    fn keys() -> DerivedKeys {
        derive_key_pair("abcdef", DEFAULT_SALT, 1_000).unwrap()
    }

    #[test]
    fn test_gcm_seal_open_roundtrip() {
        let keys = keys();
        let env = seal_envelope(&keys, EnvelopeVersion::Gcm, 7, b"hello peers").unwrap();
        assert_eq!(env.version, 2);
        assert_eq!(env.sequence, 7);
        assert_eq!(env.iv.len(), GCM_NONCE_SIZE);
        assert_eq!(open_envelope(&keys, &env).unwrap(), b"hello peers");
    }

    #[test]
    fn test_cbc_seal_open_roundtrip() {
        let keys = keys();
        let env = seal_envelope(&keys, EnvelopeVersion::CbcHmac, 3, b"legacy peers").unwrap();
        assert_eq!(env.version, 1);
        assert!(env.hmac.is_some());
        assert_eq!(open_envelope(&keys, &env).unwrap(), b"legacy peers");
    }

    #[test]
    fn test_serialize_deserialize_gcm() {
        let keys = keys();
        let env = seal_envelope(&keys, EnvelopeVersion::Gcm, 42, b"wire").unwrap();
        let parsed = Envelope::deserialize(&env.serialize()).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_serialize_deserialize_cbc() {
        let keys = keys();
        let env = seal_envelope(&keys, EnvelopeVersion::CbcHmac, 42, b"wire").unwrap();
        let parsed = Envelope::deserialize(&env.serialize()).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_sequence_is_authenticated_gcm() {
        let keys = keys();
        let mut env = seal_envelope(&keys, EnvelopeVersion::Gcm, 1, b"data").unwrap();
        env.sequence = 2;
        assert!(matches!(open_envelope(&keys, &env), Err(CryptoError::Auth)));
    }

    #[test]
    fn test_sequence_is_authenticated_cbc() {
        let keys = keys();
        let mut env = seal_envelope(&keys, EnvelopeVersion::CbcHmac, 1, b"data").unwrap();
        env.sequence = 2;
        assert!(matches!(open_envelope(&keys, &env), Err(CryptoError::Auth)));
    }

    #[test]
    fn test_wrong_keys_rejected() {
        let keys = keys();
        let other = derive_key_pair("not-the-code", DEFAULT_SALT, 1_000).unwrap();
        let env = seal_envelope(&keys, EnvelopeVersion::Gcm, 1, b"data").unwrap();
        assert!(open_envelope(&other, &env).is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = vec![9u8];
        bytes.extend_from_slice(&0u64.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 40]);
        assert!(matches!(
            Envelope::deserialize(&bytes),
            Err(CryptoError::UnknownVersion(9))
        ));
    }

    #[test]
    fn test_truncated_inputs_rejected() {
        assert!(matches!(
            Envelope::deserialize(&[2u8; 5]),
            Err(CryptoError::Truncated { .. })
        ));
        // Valid header, body too small for GCM nonce + tag.
        let mut bytes = vec![2u8];
        bytes.extend_from_slice(&1u64.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            Envelope::deserialize(&bytes),
            Err(CryptoError::Truncated { .. })
        ));
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let keys = keys();
        for version in [EnvelopeVersion::Gcm, EnvelopeVersion::CbcHmac] {
            let env = seal_envelope(&keys, version, 5, b"").unwrap();
            assert_eq!(open_envelope(&keys, &env).unwrap(), b"");
        }
    }

    #[test]
    fn test_nonce_uniqueness_across_seals() {
        let keys = keys();
        let a = seal_envelope(&keys, EnvelopeVersion::Gcm, 1, b"x").unwrap();
        let b = seal_envelope(&keys, EnvelopeVersion::Gcm, 2, b"x").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(16))]

            #[test]
            fn prop_roundtrip_any_payload(payload in proptest::collection::vec(any::<u8>(), 0..512),
                                          seq in any::<u64>()) {
                let keys = keys();
                for version in [EnvelopeVersion::Gcm, EnvelopeVersion::CbcHmac] {
                    let env = seal_envelope(&keys, version, seq, &payload).unwrap();
                    let wire = env.serialize();
                    let parsed = Envelope::deserialize(&wire).unwrap();
                    prop_assert_eq!(&parsed, &env);
                    prop_assert_eq!(open_envelope(&keys, &parsed).unwrap(), payload.clone());
                }
            }
        }
    }
}
