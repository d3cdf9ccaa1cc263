//! Relay Message Protocol codec.
//!
//! Every relay message is `type(1B) ‖ length(4B BE) ‖ payload` with a
//! 10 MiB payload ceiling. Peer identifiers inside `DATA` payloads are
//! length-prefixed with a single byte, capping them at 255 bytes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Relay payload ceiling: 10 MiB.
pub const RELAY_MAX_MESSAGE: usize = 10 * 1024 * 1024;

/// Peer identifier length ceiling on the relay wire.
pub const RELAY_MAX_PEER_ID: usize = 255;

/// Relay message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayMessageType {
    /// Client registration: `peer_id|session_code_hash`
    Register = 0x01,
    /// Registration acknowledgement
    RegisterAck = 0x02,
    /// Peer list request (empty payload) / response (text records)
    PeerList = 0x03,
    /// Connect request: payload is the target peer identifier
    Connect = 0x04,
    /// Connect acknowledgement: payload is the counterpart identifier
    ConnectAck = 0x05,
    /// Forwarded data: `peer_len(1B) ‖ peer ‖ bytes`
    Data = 0x06,
    /// Liveness probe, echoed by the server
    Heartbeat = 0x07,
    /// Peer went away
    Disconnect = 0x08,
    /// Error report, payload is a human-readable reason
    Error = 0xFF,
}

impl RelayMessageType {
    /// Decode a wire type byte.
    #[must_use]
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Register),
            0x02 => Some(Self::RegisterAck),
            0x03 => Some(Self::PeerList),
            0x04 => Some(Self::Connect),
            0x05 => Some(Self::ConnectAck),
            0x06 => Some(Self::Data),
            0x07 => Some(Self::Heartbeat),
            0x08 => Some(Self::Disconnect),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Encode one relay message.
#[must_use]
pub fn encode_message(kind: RelayMessageType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(kind as u8);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Write one relay message to a stream.
pub async fn write_message<W>(
    writer: &mut W,
    kind: RelayMessageType,
    payload: &[u8],
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > RELAY_MAX_MESSAGE {
        return Err(TransportError::Oversize(payload.len()));
    }
    writer.write_all(&encode_message(kind, payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one relay message from a stream.
///
/// Unknown type bytes surface as a protocol error; oversize lengths close
/// the connection.
pub async fn read_message<R>(reader: &mut R) -> Result<(RelayMessageType, Vec<u8>), TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;

    let kind = RelayMessageType::from_wire(header[0]).ok_or_else(|| {
        TransportError::HandshakeProtocol(format!("unknown relay type 0x{:02X}", header[0]))
    })?;
    let len = u32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
    if len > RELAY_MAX_MESSAGE {
        return Err(TransportError::Oversize(len));
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok((kind, payload))
}

/// Build a `DATA` payload addressed to `peer`.
pub fn encode_data_payload(peer: &str, bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
    if peer.len() > RELAY_MAX_PEER_ID {
        return Err(TransportError::PeerIdTooLong(peer.len()));
    }
    let mut out = Vec::with_capacity(1 + peer.len() + bytes.len());
    out.push(peer.len() as u8);
    out.extend_from_slice(peer.as_bytes());
    out.extend_from_slice(bytes);
    Ok(out)
}

/// Split a `DATA` payload into (peer, bytes).
#[must_use]
pub fn parse_data_payload(payload: &[u8]) -> Option<(String, Vec<u8>)> {
    let peer_len = *payload.first()? as usize;
    if payload.len() < 1 + peer_len {
        return None;
    }
    let peer = String::from_utf8(payload[1..1 + peer_len].to_vec()).ok()?;
    Some((peer, payload[1 + peer_len..].to_vec()))
}

/// A peer as advertised by the relay server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPeerInfo {
    /// Peer identifier
    pub peer_id: String,
    /// Public address as seen by the relay
    pub address: String,
    /// Public port as seen by the relay
    pub port: u16,
    /// NAT type hint reported during registration
    pub nat_type: String,
}

/// Encode a peer list response: one `peer|ip|port|nat` record per line.
#[must_use]
pub fn encode_peer_list(peers: &[RelayPeerInfo]) -> Vec<u8> {
    let mut out = String::new();
    for peer in peers {
        out.push_str(&format!(
            "{}|{}|{}|{}\n",
            peer.peer_id, peer.address, peer.port, peer.nat_type
        ));
    }
    out.into_bytes()
}

/// Parse a peer list response, skipping malformed lines.
#[must_use]
pub fn parse_peer_list(payload: &[u8]) -> Vec<RelayPeerInfo> {
    let Ok(text) = std::str::from_utf8(payload) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split('|');
            let peer_id = parts.next()?.to_string();
            let address = parts.next()?.to_string();
            let port = parts.next()?.parse().ok()?;
            let nat_type = parts.next().unwrap_or("unknown").to_string();
            if peer_id.is_empty() {
                return None;
            }
            Some(RelayPeerInfo {
                peer_id,
                address,
                port,
                nat_type,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_type_roundtrip() {
        for kind in [
            RelayMessageType::Register,
            RelayMessageType::RegisterAck,
            RelayMessageType::PeerList,
            RelayMessageType::Connect,
            RelayMessageType::ConnectAck,
            RelayMessageType::Data,
            RelayMessageType::Heartbeat,
            RelayMessageType::Disconnect,
            RelayMessageType::Error,
        ] {
            assert_eq!(RelayMessageType::from_wire(kind as u8), Some(kind));
        }
        assert_eq!(RelayMessageType::from_wire(0x42), None);
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let mut buf = Vec::new();
        write_message(&mut buf, RelayMessageType::Data, b"payload")
            .await
            .unwrap();

        let mut cursor = Cursor::new(buf);
        let (kind, payload) = read_message(&mut cursor).await.unwrap();
        assert_eq!(kind, RelayMessageType::Data);
        assert_eq!(payload, b"payload");
    }

    #[tokio::test]
    async fn test_empty_payload_message() {
        let mut buf = Vec::new();
        write_message(&mut buf, RelayMessageType::Heartbeat, b"")
            .await
            .unwrap();
        let mut cursor = Cursor::new(buf);
        let (kind, payload) = read_message(&mut cursor).await.unwrap();
        assert_eq!(kind, RelayMessageType::Heartbeat);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_oversize_rejected() {
        let mut header = vec![RelayMessageType::Data as u8];
        header.extend_from_slice(&((RELAY_MAX_MESSAGE + 1) as u32).to_be_bytes());
        let mut cursor = Cursor::new(header);
        assert!(matches!(
            read_message(&mut cursor).await,
            Err(TransportError::Oversize(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let mut buf = vec![0x55u8];
        buf.extend_from_slice(&0u32.to_be_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(read_message(&mut cursor).await.is_err());
    }

    #[test]
    fn test_data_payload_roundtrip() {
        let payload = encode_data_payload("peer-target", b"bytes here").unwrap();
        let (peer, bytes) = parse_data_payload(&payload).unwrap();
        assert_eq!(peer, "peer-target");
        assert_eq!(bytes, b"bytes here");
    }

    #[test]
    fn test_data_payload_peer_id_limit() {
        let long_id = "x".repeat(RELAY_MAX_PEER_ID + 1);
        assert!(matches!(
            encode_data_payload(&long_id, b""),
            Err(TransportError::PeerIdTooLong(_))
        ));
        let max_id = "x".repeat(RELAY_MAX_PEER_ID);
        assert!(encode_data_payload(&max_id, b"").is_ok());
    }

    #[test]
    fn test_data_payload_truncated() {
        assert!(parse_data_payload(&[]).is_none());
        assert!(parse_data_payload(&[10, b'a', b'b']).is_none());
    }

    #[test]
    fn test_peer_list_roundtrip() {
        let peers = vec![
            RelayPeerInfo {
                peer_id: "peer-a".into(),
                address: "10.0.0.1".into(),
                port: 9470,
                nat_type: "full-cone".into(),
            },
            RelayPeerInfo {
                peer_id: "peer-b".into(),
                address: "10.0.0.2".into(),
                port: 9471,
                nat_type: "symmetric".into(),
            },
        ];
        let encoded = encode_peer_list(&peers);
        assert_eq!(parse_peer_list(&encoded), peers);
    }

    #[test]
    fn test_peer_list_skips_malformed_lines() {
        let raw = b"peer-a|10.0.0.1|9470|open\ngarbage-line\npeer-b|10.0.0.2|notaport|x\n";
        let parsed = parse_peer_list(raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].peer_id, "peer-a");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn prop_data_payload_roundtrip(
                peer in "[a-z0-9-]{1,64}",
                bytes in proptest::collection::vec(any::<u8>(), 0..256),
            ) {
                let payload = encode_data_payload(&peer, &bytes).unwrap();
                let (p, b) = parse_data_payload(&payload).unwrap();
                prop_assert_eq!(p, peer);
                prop_assert_eq!(b, bytes);
            }
        }
    }
}
