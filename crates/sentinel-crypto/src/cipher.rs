//! Symmetric cipher primitives backing the envelope layer.
//!
//! Thin wrappers over the RustCrypto implementations. Callers are the
//! envelope codec and the handshake digest computation; nothing else in the
//! workspace touches raw cipher state.

use aes::Aes256;
use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, Payload},
};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{CBC_IV_SIZE, GCM_NONCE_SIZE, KEY_SIZE, MAC_SIZE, error::CryptoError};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// AES-256-GCM encryption. Returns ciphertext with the 16-byte tag appended.
pub fn aes256_gcm_encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; GCM_NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyLength)?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::Cipher(e.to_string()))
}

/// AES-256-GCM decryption of a tag-suffixed ciphertext.
pub fn aes256_gcm_decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; GCM_NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyLength)?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Auth)
}

/// AES-256-CBC encryption with PKCS#7 padding (legacy envelope path).
pub fn aes256_cbc_encrypt(
    key: &[u8; KEY_SIZE],
    iv: &[u8; CBC_IV_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let enc = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CryptoError::KeyLength)?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// AES-256-CBC decryption with PKCS#7 padding removal.
///
/// Callers must verify the envelope HMAC before invoking this; padding
/// errors after a valid MAC indicate key mismatch, not tampering.
pub fn aes256_cbc_decrypt(
    key: &[u8; KEY_SIZE],
    iv: &[u8; CBC_IV_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let dec = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::KeyLength)?;
    dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Padding)
}

/// HMAC-SHA256 over a sequence of input parts.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; MAC_SIZE], CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::KeyLength)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; KEY_SIZE] {
        [0x42u8; KEY_SIZE]
    }

    #[test]
    fn test_gcm_roundtrip() {
        let nonce = [7u8; GCM_NONCE_SIZE];
        let ct = aes256_gcm_encrypt(&key(), &nonce, b"aad", b"payload").unwrap();
        assert_eq!(ct.len(), b"payload".len() + crate::GCM_TAG_SIZE);
        let pt = aes256_gcm_decrypt(&key(), &nonce, b"aad", &ct).unwrap();
        assert_eq!(pt, b"payload");
    }

    #[test]
    fn test_gcm_wrong_aad_fails() {
        let nonce = [7u8; GCM_NONCE_SIZE];
        let ct = aes256_gcm_encrypt(&key(), &nonce, b"aad", b"payload").unwrap();
        assert!(matches!(
            aes256_gcm_decrypt(&key(), &nonce, b"bad", &ct),
            Err(CryptoError::Auth)
        ));
    }

    #[test]
    fn test_gcm_tampered_ciphertext_fails() {
        let nonce = [7u8; GCM_NONCE_SIZE];
        let mut ct = aes256_gcm_encrypt(&key(), &nonce, b"", b"payload").unwrap();
        ct[0] ^= 0xFF;
        assert!(aes256_gcm_decrypt(&key(), &nonce, b"", &ct).is_err());
    }

    #[test]
    fn test_gcm_empty_plaintext() {
        let nonce = [9u8; GCM_NONCE_SIZE];
        let ct = aes256_gcm_encrypt(&key(), &nonce, b"aad", b"").unwrap();
        assert_eq!(ct.len(), crate::GCM_TAG_SIZE);
        assert_eq!(aes256_gcm_decrypt(&key(), &nonce, b"aad", &ct).unwrap(), b"");
    }

    #[test]
    fn test_cbc_roundtrip() {
        let iv = [3u8; CBC_IV_SIZE];
        let ct = aes256_cbc_encrypt(&key(), &iv, b"legacy payload").unwrap();
        assert_eq!(ct.len() % 16, 0);
        let pt = aes256_cbc_decrypt(&key(), &iv, &ct).unwrap();
        assert_eq!(pt, b"legacy payload");
    }

    #[test]
    fn test_cbc_block_aligned_input_gains_full_pad_block() {
        let iv = [3u8; CBC_IV_SIZE];
        let pt = [0u8; 32];
        let ct = aes256_cbc_encrypt(&key(), &iv, &pt).unwrap();
        assert_eq!(ct.len(), 48);
        assert_eq!(aes256_cbc_decrypt(&key(), &iv, &ct).unwrap(), pt);
    }

    #[test]
    fn test_cbc_wrong_key_padding_error() {
        let iv = [3u8; CBC_IV_SIZE];
        let ct = aes256_cbc_encrypt(&key(), &iv, b"legacy payload").unwrap();
        let wrong = [0x13u8; KEY_SIZE];
        // Wrong key almost always produces invalid padding.
        assert!(aes256_cbc_decrypt(&wrong, &iv, &ct).is_err());
    }

    #[test]
    fn test_hmac_parts_equivalent_to_concatenation() {
        let split = hmac_sha256(b"mac key", &[b"ab".as_slice(), b"cd"]).unwrap();
        let joined = hmac_sha256(b"mac key", &[b"abcd".as_slice()]).unwrap();
        assert_eq!(split, joined);
    }

    #[test]
    fn test_hmac_key_sensitivity() {
        let a = hmac_sha256(b"key-a", &[b"msg".as_slice()]).unwrap();
        let b = hmac_sha256(b"key-b", &[b"msg".as_slice()]).unwrap();
        assert_ne!(a, b);
    }
}
