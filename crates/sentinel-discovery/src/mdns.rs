//! mDNS discovery extension point.
//!
//! Zero-configuration discovery under the service name
//! `_sentinelfs._tcp`. Platform resolvers (Avahi, Bonjour) are not linked
//! in this build, so registration reports unavailability; the UDP
//! broadcast mechanism remains the default on LANs.

use crate::DiscoveryError;

/// mDNS service name advertised once an implementation lands.
pub const MDNS_SERVICE_NAME: &str = "_sentinelfs._tcp";

/// Stub mDNS announcer/browser.
#[derive(Debug, Default)]
pub struct MdnsDiscovery {
    active: bool,
}

impl MdnsDiscovery {
    /// Create a stopped instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this build carries a real mDNS backend.
    #[must_use]
    pub fn is_available() -> bool {
        false
    }

    /// Register the local peer under [`MDNS_SERVICE_NAME`].
    ///
    /// # Errors
    ///
    /// Always returns [`DiscoveryError::Unsupported`] in this build.
    pub fn start(&mut self, _peer_id: &str, _tcp_port: u16) -> Result<(), DiscoveryError> {
        Err(DiscoveryError::Unsupported("mdns backend not linked"))
    }

    /// Deregister and stop browsing.
    pub fn stop(&mut self) {
        self.active = false;
    }
}
