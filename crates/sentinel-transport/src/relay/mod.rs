//! Relay carrier: rendezvous forwarding for peers with no direct path.
//!
//! Peers connect out to a relay server and tunnel all traffic through it
//! using the Relay Message Protocol: `type(1B) ‖ length(4B BE) ‖ payload`.
//! The server groups clients by session-code hash and forwards `DATA`
//! messages between them; it never sees plaintext application payloads
//! when envelope encryption is on.
//!
//! - [`protocol`]: wire codec and message types
//! - [`server`]: the rendezvous server
//! - [`transport`]: the client-side [`crate::PeerTransport`] implementation

pub mod protocol;
pub mod server;
pub mod transport;

pub use protocol::{RelayMessageType, RelayPeerInfo};
pub use server::{RelayServer, RelayServerConfig};
pub use transport::{RelayTransport, RelayTransportConfig};
