//! # SentinelFS Crypto
//!
//! Cryptographic primitives for the SentinelFS sync protocol.
//!
//! This crate provides:
//! - Encrypted message envelopes (AES-256-GCM, plus the legacy
//!   CBC-then-HMAC layout for version-1 peers)
//! - Session key derivation from shared session codes
//!   (PBKDF2-HMAC-SHA256, OWASP-level iteration count)
//! - Constant-time comparison helpers
//! - Secure random generation for nonces and peer identifiers
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | AEAD (v2 envelopes) | AES-256-GCM |
//! | Legacy envelopes (v1) | AES-256-CBC + HMAC-SHA256 |
//! | KDF | PBKDF2-HMAC-SHA256 (≥ 310 000 iterations) |
//! | Content / code hashing | SHA-256 |
//!
//! The envelope wire layout is fixed and shared by every transport:
//!
//! ```text
//! version (1B) ‖ sequence (8B BE) ‖ nonce/IV ‖ ciphertext [‖ HMAC]
//! ```
//!
//! Version `1` carries a 16-byte IV and a trailing 32-byte HMAC over
//! `version ‖ sequence ‖ IV ‖ ciphertext`. Versions `>= 2` carry a 12-byte
//! nonce and authenticate `version ‖ sequence` as associated data, with the
//! 16-byte GCM tag appended to the ciphertext.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cipher;
pub mod constant_time;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod random;

pub use envelope::{Envelope, EnvelopeVersion, open_envelope, seal_envelope};
pub use error::CryptoError;
pub use kdf::{DEFAULT_KDF_ITERATIONS, DerivedKeys, derive_key_pair, session_code_hash};

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;

/// HMAC-SHA256 output size in bytes
pub const MAC_SIZE: usize = 32;

/// GCM nonce size in bytes (envelope versions >= 2)
pub const GCM_NONCE_SIZE: usize = 12;

/// GCM authentication tag size in bytes
pub const GCM_TAG_SIZE: usize = 16;

/// CBC initialisation vector size in bytes (envelope version 1)
pub const CBC_IV_SIZE: usize = 16;

/// Handshake nonce size in bytes
pub const HANDSHAKE_NONCE_SIZE: usize = 16;
