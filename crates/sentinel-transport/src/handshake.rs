//! Three-phase authenticated handshake.
//!
//! Runs over any stream carrier before a peer may enter `Connected`:
//!
//! ```text
//! client                                server
//!   |-- HELLO(version, id, code-hash, c-nonce) -->|
//!   |<- CHALLENGE(version, id, c-nonce, s-nonce) -|   (or REJECT)
//!   |-- AUTH(id, digest) ------------------------>|
//!   |<- WELCOME(version, id) ---------------------|
//! ```
//!
//! `digest = HMAC(mac_key, c-nonce ‖ s-nonce ‖ client-id ‖ server-id ‖
//! "client-auth")`, verified in constant time. The session code itself is
//! never on the wire; the HELLO carries its SHA-256 hash. A server with no
//! session code configured accepts any HELLO with a bare WELCOME (legacy
//! two-message exchange). Inbound messages with the legacy `SENTINEL_`
//! prefix are accepted; only `FALCON_` is emitted.
//!
//! Each receive is bounded by [`crate::HANDSHAKE_TIMEOUT`]. A peer
//! presenting our own identifier is rejected to prevent loopback
//! connections.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use sentinel_crypto::{HANDSHAKE_NONCE_SIZE, constant_time::ct_eq, random};

use crate::error::TransportError;
use crate::framing::{read_frame, write_frame};
use crate::{HANDSHAKE_TIMEOUT, PROTOCOL_VERSION};

/// Ceiling for a single handshake frame.
const HANDSHAKE_MAX_FRAME: usize = 4096;

/// Label mixed into the client authentication digest.
pub const CLIENT_AUTH_LABEL: &[u8] = b"client-auth";

/// Session state consulted by the handshake drivers.
///
/// Implemented by the session manager; transports only ever hold a trait
/// object so the carrier crates stay independent of session bookkeeping.
pub trait HandshakeAuth: Send + Sync {
    /// Local peer identifier.
    fn local_peer_id(&self) -> String;

    /// Hex SHA-256 of the local session code; empty when no code is set.
    fn session_code_hash(&self) -> String;

    /// Compute the client authentication digest, or `None` when no keys
    /// are available (no session code configured).
    fn auth_digest(
        &self,
        client_nonce: &[u8],
        server_nonce: &[u8],
        client_id: &str,
        server_id: &str,
    ) -> Option<[u8; 32]>;

    /// Record a successfully authenticated peer.
    fn on_peer_authenticated(&self, peer_id: &str);
}

/// Parsed handshake messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// Client opening message
    Hello {
        /// Protocol version
        version: u32,
        /// Client peer identifier
        peer_id: String,
        /// Hex SHA-256 of the client's session code ("" = none)
        code_hash: String,
        /// Random client nonce
        nonce: [u8; HANDSHAKE_NONCE_SIZE],
    },
    /// Server challenge, echoing the client nonce
    Challenge {
        /// Protocol version
        version: u32,
        /// Server peer identifier
        peer_id: String,
        /// Echoed client nonce
        client_nonce: [u8; HANDSHAKE_NONCE_SIZE],
        /// Random server nonce
        server_nonce: [u8; HANDSHAKE_NONCE_SIZE],
    },
    /// Client authentication proof
    Auth {
        /// Client peer identifier
        peer_id: String,
        /// HMAC digest over both nonces, both identifiers and the label
        digest: [u8; 32],
    },
    /// Server acceptance
    Welcome {
        /// Protocol version
        version: u32,
        /// Server peer identifier
        peer_id: String,
    },
    /// Rejection with reason; the connection closes afterwards
    Reject {
        /// Human-readable reason
        reason: String,
    },
}

impl HandshakeMessage {
    /// Encode to the pipe-delimited wire form (modern prefix only).
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Hello {
                version,
                peer_id,
                code_hash,
                nonce,
            } => format!(
                "FALCON_HELLO|{version}|{peer_id}|{code_hash}|{}",
                hex::encode(nonce)
            ),
            Self::Challenge {
                version,
                peer_id,
                client_nonce,
                server_nonce,
            } => format!(
                "FALCON_CHALLENGE|{version}|{peer_id}|{}|{}",
                hex::encode(client_nonce),
                hex::encode(server_nonce)
            ),
            Self::Auth { peer_id, digest } => {
                format!("FALCON_AUTH|{peer_id}|{}", hex::encode(digest))
            }
            Self::Welcome { version, peer_id } => format!("FALCON_WELCOME|{version}|{peer_id}"),
            Self::Reject { reason } => format!("FALCON_REJECT|{reason}"),
        }
    }

    /// Parse a wire message, accepting both modern and legacy prefixes.
    ///
    /// # Errors
    ///
    /// [`TransportError::HandshakeProtocol`] for anything malformed.
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let body = raw
            .strip_prefix("FALCON_")
            .or_else(|| raw.strip_prefix("SENTINEL_"))
            .ok_or_else(|| proto_err("unknown message prefix"))?;

        let parts: Vec<&str> = body.split('|').collect();
        match parts.first().copied() {
            Some("HELLO") => {
                if parts.len() < 5 {
                    return Err(proto_err("HELLO: missing fields"));
                }
                Ok(Self::Hello {
                    version: parse_version(parts[1])?,
                    peer_id: parts[2].to_string(),
                    code_hash: parts[3].to_string(),
                    nonce: parse_nonce(parts[4])?,
                })
            }
            Some("CHALLENGE") => {
                if parts.len() < 5 {
                    return Err(proto_err("CHALLENGE: missing fields"));
                }
                Ok(Self::Challenge {
                    version: parse_version(parts[1])?,
                    peer_id: parts[2].to_string(),
                    client_nonce: parse_nonce(parts[3])?,
                    server_nonce: parse_nonce(parts[4])?,
                })
            }
            Some("AUTH") => {
                if parts.len() < 3 {
                    return Err(proto_err("AUTH: missing fields"));
                }
                let bytes =
                    hex::decode(parts[2]).map_err(|_| proto_err("AUTH: bad digest encoding"))?;
                let digest: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| proto_err("AUTH: bad digest length"))?;
                Ok(Self::Auth {
                    peer_id: parts[1].to_string(),
                    digest,
                })
            }
            Some("WELCOME") => {
                if parts.len() < 3 {
                    return Err(proto_err("WELCOME: missing fields"));
                }
                Ok(Self::Welcome {
                    version: parse_version(parts[1])?,
                    peer_id: parts[2].to_string(),
                })
            }
            Some("REJECT") => Ok(Self::Reject {
                reason: parts.get(1).unwrap_or(&"").to_string(),
            }),
            _ => Err(proto_err("unknown message tag")),
        }
    }
}

fn proto_err(detail: &str) -> TransportError {
    TransportError::HandshakeProtocol(detail.to_string())
}

fn parse_version(s: &str) -> Result<u32, TransportError> {
    s.parse().map_err(|_| proto_err("bad version"))
}

fn parse_nonce(s: &str) -> Result<[u8; HANDSHAKE_NONCE_SIZE], TransportError> {
    let bytes = hex::decode(s).map_err(|_| proto_err("bad nonce encoding"))?;
    bytes.try_into().map_err(|_| proto_err("bad nonce length"))
}

async fn send_msg<S>(stream: &mut S, msg: &HandshakeMessage) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    write_frame(stream, msg.encode().as_bytes()).await
}

async fn recv_msg<S>(stream: &mut S) -> Result<HandshakeMessage, TransportError>
where
    S: AsyncRead + Unpin,
{
    let frame = timeout(HANDSHAKE_TIMEOUT, read_frame(stream, HANDSHAKE_MAX_FRAME))
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;
    let text = std::str::from_utf8(&frame).map_err(|_| proto_err("non-UTF8 message"))?;
    HandshakeMessage::parse(text)
}

/// Run the client side of the handshake.
///
/// Returns the authenticated server peer identifier.
///
/// # Errors
///
/// Timeout, rejection, protocol violations or I/O failures; the caller
/// must close the stream on any error.
pub async fn client_handshake<S>(
    stream: &mut S,
    auth: &dyn HandshakeAuth,
) -> Result<String, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let local_id = auth.local_peer_id();
    let client_nonce = random::handshake_nonce();

    send_msg(
        stream,
        &HandshakeMessage::Hello {
            version: PROTOCOL_VERSION,
            peer_id: local_id.clone(),
            code_hash: auth.session_code_hash(),
            nonce: client_nonce,
        },
    )
    .await?;

    match recv_msg(stream).await? {
        HandshakeMessage::Challenge {
            peer_id: server_id,
            client_nonce: echoed,
            server_nonce,
            ..
        } => {
            if server_id == local_id {
                return Err(proto_err("loopback peer"));
            }
            if !ct_eq(&echoed, &client_nonce) {
                return Err(proto_err("challenge echoed wrong nonce"));
            }
            let digest = auth
                .auth_digest(&client_nonce, &server_nonce, &local_id, &server_id)
                .ok_or_else(|| proto_err("challenged without session keys"))?;

            send_msg(
                stream,
                &HandshakeMessage::Auth {
                    peer_id: local_id.clone(),
                    digest,
                },
            )
            .await?;

            match recv_msg(stream).await? {
                HandshakeMessage::Welcome { peer_id, .. } => {
                    if peer_id != server_id {
                        return Err(proto_err("welcome from different peer"));
                    }
                    auth.on_peer_authenticated(&server_id);
                    Ok(server_id)
                }
                HandshakeMessage::Reject { reason } => {
                    Err(TransportError::HandshakeRejected(reason))
                }
                _ => Err(proto_err("expected WELCOME")),
            }
        }
        // Open-network server: no code configured on the remote side.
        HandshakeMessage::Welcome { peer_id, .. } => {
            if peer_id == local_id {
                return Err(proto_err("loopback peer"));
            }
            auth.on_peer_authenticated(&peer_id);
            Ok(peer_id)
        }
        HandshakeMessage::Reject { reason } => Err(TransportError::HandshakeRejected(reason)),
        _ => Err(proto_err("expected CHALLENGE or WELCOME")),
    }
}

/// Run the server side of the handshake.
///
/// Returns the authenticated client peer identifier.
///
/// # Errors
///
/// Timeout, session-code mismatch (after sending REJECT), digest failure
/// or I/O failures; the caller must close the stream on any error.
pub async fn server_handshake<S>(
    stream: &mut S,
    auth: &dyn HandshakeAuth,
) -> Result<String, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let local_id = auth.local_peer_id();
    let local_hash = auth.session_code_hash();

    let (client_id, client_hash, client_nonce) = match recv_msg(stream).await? {
        HandshakeMessage::Hello {
            peer_id,
            code_hash,
            nonce,
            ..
        } => (peer_id, code_hash, nonce),
        _ => return Err(proto_err("expected HELLO")),
    };

    if client_id == local_id {
        let _ = send_msg(
            stream,
            &HandshakeMessage::Reject {
                reason: "loopback peer".into(),
            },
        )
        .await;
        return Err(proto_err("loopback peer"));
    }

    // No local code: open network, accept anyone with a bare WELCOME.
    if local_hash.is_empty() {
        send_msg(
            stream,
            &HandshakeMessage::Welcome {
                version: PROTOCOL_VERSION,
                peer_id: local_id,
            },
        )
        .await?;
        auth.on_peer_authenticated(&client_id);
        return Ok(client_id);
    }

    if !ct_eq(local_hash.as_bytes(), client_hash.as_bytes()) {
        let _ = send_msg(
            stream,
            &HandshakeMessage::Reject {
                reason: "invalid session code".into(),
            },
        )
        .await;
        return Err(TransportError::HandshakeRejected(
            "session code mismatch".into(),
        ));
    }

    let server_nonce = random::handshake_nonce();
    send_msg(
        stream,
        &HandshakeMessage::Challenge {
            version: PROTOCOL_VERSION,
            peer_id: local_id.clone(),
            client_nonce,
            server_nonce,
        },
    )
    .await?;

    let digest = match recv_msg(stream).await? {
        HandshakeMessage::Auth { peer_id, digest } if peer_id == client_id => digest,
        HandshakeMessage::Auth { .. } => return Err(proto_err("AUTH from different peer")),
        _ => return Err(proto_err("expected AUTH")),
    };

    let expected = auth
        .auth_digest(&client_nonce, &server_nonce, &client_id, &local_id)
        .ok_or_else(|| proto_err("session keys unavailable"))?;

    if !ct_eq(&digest, &expected) {
        let _ = send_msg(
            stream,
            &HandshakeMessage::Reject {
                reason: "authentication failed".into(),
            },
        )
        .await;
        return Err(TransportError::HandshakeRejected(
            "client digest mismatch".into(),
        ));
    }

    send_msg(
        stream,
        &HandshakeMessage::Welcome {
            version: PROTOCOL_VERSION,
            peer_id: local_id,
        },
    )
    .await?;

    auth.on_peer_authenticated(&client_id);
    Ok(client_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_crypto::cipher::hmac_sha256;
    use std::sync::Mutex;

    struct TestAuth {
        id: String,
        code_hash: String,
        mac_key: Option<Vec<u8>>,
        authenticated: Mutex<Vec<String>>,
    }

    impl TestAuth {
        fn new(id: &str, code: Option<&str>) -> Self {
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

    impl HandshakeAuth for TestAuth {
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

    async fn run_both(
        client: &TestAuth,
        server: &TestAuth,
    ) -> (Result<String, TransportError>, Result<String, TransportError>) {
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::join!(client_handshake(&mut a, client), server_handshake(&mut b, server))
    }

    #[tokio::test]
    async fn test_successful_handshake() {
        let client = TestAuth::new("peer-client", Some("abcdef"));
        let server = TestAuth::new("peer-server", Some("abcdef"));

        let (c, s) = run_both(&client, &server).await;
        assert_eq!(c.unwrap(), "peer-server");
        assert_eq!(s.unwrap(), "peer-client");
        assert_eq!(*client.authenticated.lock().unwrap(), vec!["peer-server"]);
        assert_eq!(*server.authenticated.lock().unwrap(), vec!["peer-client"]);
    }

    #[tokio::test]
    async fn test_session_code_mismatch_rejected() {
        let client = TestAuth::new("peer-client", Some("abcdef"));
        let server = TestAuth::new("peer-server", Some("zzzzzz"));

        let (c, s) = run_both(&client, &server).await;
        assert!(matches!(c, Err(TransportError::HandshakeRejected(_))));
        assert!(matches!(s, Err(TransportError::HandshakeRejected(_))));
        assert!(server.authenticated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_server_accepts_anyone() {
        let client = TestAuth::new("peer-client", Some("abcdef"));
        let server = TestAuth::new("peer-server", None);

        let (c, s) = run_both(&client, &server).await;
        assert_eq!(c.unwrap(), "peer-server");
        assert_eq!(s.unwrap(), "peer-client");
    }

    #[tokio::test]
    async fn test_loopback_peer_rejected() {
        let client = TestAuth::new("peer-same", Some("abcdef"));
        let server = TestAuth::new("peer-same", Some("abcdef"));

        let (c, s) = run_both(&client, &server).await;
        assert!(c.is_err());
        assert!(s.is_err());
    }

    #[tokio::test]
    async fn test_wrong_mac_key_rejected() {
        // Same code hash, different MAC keys: the digest check must fail.
        let mut client = TestAuth::new("peer-client", Some("abcdef"));
        client.mac_key = Some(b"different key".to_vec());
        let server = TestAuth::new("peer-server", Some("abcdef"));

        let (c, s) = run_both(&client, &server).await;
        assert!(matches!(c, Err(TransportError::HandshakeRejected(_))));
        assert!(matches!(s, Err(TransportError::HandshakeRejected(_))));
    }

    #[test]
    fn test_message_encode_parse_roundtrip() {
        let messages = [
            HandshakeMessage::Hello {
                version: 1,
                peer_id: "p1".into(),
                code_hash: "ab12".into(),
                nonce: [7u8; HANDSHAKE_NONCE_SIZE],
            },
            HandshakeMessage::Challenge {
                version: 1,
                peer_id: "p2".into(),
                client_nonce: [1u8; HANDSHAKE_NONCE_SIZE],
                server_nonce: [2u8; HANDSHAKE_NONCE_SIZE],
            },
            HandshakeMessage::Auth {
                peer_id: "p1".into(),
                digest: [9u8; 32],
            },
            HandshakeMessage::Welcome {
                version: 1,
                peer_id: "p2".into(),
            },
            HandshakeMessage::Reject {
                reason: "invalid session code".into(),
            },
        ];
        for msg in messages {
            let parsed = HandshakeMessage::parse(&msg.encode()).unwrap();
            assert_eq!(parsed, msg);
        }
    }

    #[test]
    fn test_legacy_prefix_accepted() {
        let nonce_hex = hex::encode([3u8; HANDSHAKE_NONCE_SIZE]);
        let raw = format!("SENTINEL_HELLO|1|peer-old|deadbeef|{nonce_hex}");
        match HandshakeMessage::parse(&raw).unwrap() {
            HandshakeMessage::Hello { peer_id, .. } => assert_eq!(peer_id, "peer-old"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_messages_rejected() {
        for raw in [
            "GARBAGE|1|x",
            "FALCON_HELLO|1|p",
            "FALCON_HELLO|x|p|h|00",
            "FALCON_AUTH|p|nothex",
            "FALCON_AUTH|p|abcd",
            "FALCON_CHALLENGE|1|p|00|zz",
        ] {
            assert!(HandshakeMessage::parse(raw).is_err(), "accepted: {raw}");
        }
    }

    #[test]
    fn test_reject_reason_preserved() {
        match HandshakeMessage::parse("FALCON_REJECT|invalid session code").unwrap() {
            HandshakeMessage::Reject { reason } => assert_eq!(reason, "invalid session code"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }
}
