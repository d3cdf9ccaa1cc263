// Property-based tests for the codec and classification laws.

use std::path::{Path, PathBuf};

use proptest::prelude::*;

use sentinel_core::SessionManager;
use sentinel_crypto::{
    DEFAULT_KDF_ITERATIONS, Envelope, EnvelopeVersion, derive_key_pair, kdf::DEFAULT_SALT,
    open_envelope, seal_envelope,
};
use sentinel_integration_tests::TEST_KDF_ITERATIONS;
use sentinel_sync::{IgnoreMatcher, SyncCommand};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// decrypt(encrypt(m)) == m for both envelope versions, and the
    /// serialised form parses back identically.
    #[test]
    fn prop_envelope_roundtrip(
        payload in proptest::collection::vec(any::<u8>(), 0..1024),
        seq in 1u64..u64::MAX,
    ) {
        let keys = derive_key_pair("abcdef", DEFAULT_SALT, TEST_KDF_ITERATIONS).unwrap();
        for version in [EnvelopeVersion::Gcm, EnvelopeVersion::CbcHmac] {
            let env = seal_envelope(&keys, version, seq, &payload).unwrap();
            let parsed = Envelope::deserialize(&env.serialize()).unwrap();
            prop_assert_eq!(&parsed, &env);
            prop_assert_eq!(open_envelope(&keys, &parsed).unwrap(), payload.clone());
        }
    }

    /// A session manager pair agrees end to end and never accepts the
    /// same sequence twice.
    #[test]
    fn prop_session_roundtrip_no_duplicate_sequences(
        payloads in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..128),
            1..8,
        ),
    ) {
        let alice = SessionManager::with_kdf_iterations("peer-alice", TEST_KDF_ITERATIONS);
        alice.set_session_code("abcdef", true).unwrap();
        let bob = SessionManager::with_kdf_iterations("peer-bob", TEST_KDF_ITERATIONS);
        bob.set_session_code("abcdef", true).unwrap();

        let mut seen = std::collections::HashSet::new();
        for payload in &payloads {
            let wire = alice.encrypt(payload, "peer-bob").unwrap();
            let envelope = Envelope::deserialize(&wire).unwrap();
            prop_assert!(seen.insert(envelope.sequence), "sequence reused");
            prop_assert_eq!(&bob.decrypt(&wire, "peer-alice").unwrap(), payload);
            // Every replay of the same bytes is refused.
            prop_assert!(bob.decrypt(&wire, "peer-alice").is_err());
        }
    }

    /// Sync command wire encoding round-trips.
    #[test]
    fn prop_sync_command_roundtrip(
        path in "[a-z0-9/._-]{1,40}",
        hash in "[0-9a-f]{64}",
        size in any::<u64>(),
    ) {
        // Paths with our delimiter are out of the codec's domain.
        prop_assume!(!path.contains('|'));

        let update = SyncCommand::UpdateAvailable {
            path: path.clone(),
            hash,
            size,
        };
        prop_assert_eq!(SyncCommand::parse(&update.encode()).unwrap(), update);

        let delete = SyncCommand::DeleteFile { path };
        prop_assert_eq!(SyncCommand::parse(&delete.encode()).unwrap(), delete);
    }

    /// Ignore classification is pure and stable.
    #[test]
    fn prop_ignore_classification_stable(
        segments in proptest::collection::vec("[a-z0-9_.-]{1,10}", 1..4),
        user_pattern in "[a-z*?.]{1,8}",
    ) {
        let matcher = IgnoreMatcher::new(vec![user_pattern]);
        let mut path = PathBuf::from("/watch");
        for segment in &segments {
            path.push(segment);
        }
        let first = matcher.should_ignore(Path::new("/watch"), &path);
        for _ in 0..5 {
            prop_assert_eq!(matcher.should_ignore(Path::new("/watch"), &path), first);
        }
    }
}

/// The production KDF cost meets the OWASP floor.
#[test]
fn test_kdf_iteration_floor() {
    assert!(DEFAULT_KDF_ITERATIONS >= 310_000);
}

/// Tampering with any single byte of an envelope breaks authentication.
#[test]
fn test_envelope_tamper_detection() {
    let keys = derive_key_pair("abcdef", DEFAULT_SALT, TEST_KDF_ITERATIONS).unwrap();
    for version in [EnvelopeVersion::Gcm, EnvelopeVersion::CbcHmac] {
        let env = seal_envelope(&keys, version, 9, b"tamper target").unwrap();
        let wire = env.serialize();
        // Flip one byte at a few representative offsets.
        for offset in [0usize, 5, wire.len() / 2, wire.len() - 1] {
            let mut mutated = wire.clone();
            mutated[offset] ^= 0x01;
            let result = Envelope::deserialize(&mutated)
                .and_then(|e| open_envelope(&keys, &e));
            assert!(result.is_err(), "tamper at {offset} went unnoticed");
        }
    }
}
