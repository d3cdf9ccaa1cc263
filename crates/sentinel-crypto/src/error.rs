//! Error types for SentinelFS cryptographic operations.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Authentication tag or HMAC verification failed
    #[error("authentication failed")]
    Auth,

    /// Envelope version byte is not recognised
    #[error("unknown envelope version: {0}")]
    UnknownVersion(u8),

    /// Input is too short to contain a well-formed envelope
    #[error("envelope truncated: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum size required for this layout
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// PKCS#7 padding is malformed after decryption
    #[error("invalid padding")]
    Padding,

    /// Key material has the wrong length
    #[error("invalid key length")]
    KeyLength,

    /// Underlying cipher refused the operation
    #[error("cipher failure: {0}")]
    Cipher(String),
}
