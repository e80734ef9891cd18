//! Peer records — the one mutable data structure every plane reads or writes.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::SystemTime;

/// The sentinel a peer sends to report itself offline.
pub const OFFLINE_SENTINEL: &str = "0.0.0.0:0";

/// Cached state for one overlay peer, keyed by its base64 public key.
///
/// Each field has a single authoritative writer: `lan_endpoint` and `alias`
/// come from the HTTP API, `nat_endpoint` and `last_handshake` from the
/// WireGuard poller, `overlay_ip` from the KV store (admin allocation) with
/// the poller confirming it from the kernel's allowed-ips.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub public_key: String,
    pub overlay_ip: Option<Ipv4Addr>,
    /// Self-reported underlay endpoint, `None` while the peer is offline.
    pub lan_endpoint: Option<SocketAddr>,
    /// Underlay endpoint the kernel observed on the last handshake.
    pub nat_endpoint: Option<SocketAddr>,
    pub last_handshake: Option<SystemTime>,
    pub updated_at: SystemTime,
    pub alias: Option<String>,
    /// Set on mutation, cleared after a successful KV write-back.
    pub(crate) dirty: bool,
    /// Bumped by the cache on every write; the syncer uses it to detect
    /// mutations that landed after its snapshot.
    pub(crate) version: u64,
}

impl PeerInfo {
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            overlay_ip: None,
            lan_endpoint: None,
            nat_endpoint: None,
            last_handshake: None,
            updated_at: SystemTime::now(),
            alias: None,
            dirty: false,
            version: 0,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Parse an HTTP-reported LAN endpoint. The empty string and the
/// `0.0.0.0:0` sentinel both mean "offline" and map to `None`; anything
/// else must be a syntactically valid `IP:port`.
pub fn parse_lan_endpoint(raw: &str) -> Result<Option<SocketAddr>, std::net::AddrParseError> {
    if raw.is_empty() || raw == OFFLINE_SENTINEL {
        return Ok(None);
    }
    raw.parse().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_peer_is_clean_and_empty() {
        let peer = PeerInfo::new("AAAA");
        assert!(!peer.is_dirty());
        assert!(peer.overlay_ip.is_none());
        assert!(peer.lan_endpoint.is_none());
        assert!(peer.nat_endpoint.is_none());
        assert!(peer.last_handshake.is_none());
    }

    #[test]
    fn sentinel_means_offline() {
        assert_eq!(parse_lan_endpoint("0.0.0.0:0").unwrap(), None);
        assert_eq!(parse_lan_endpoint("").unwrap(), None);
    }

    #[test]
    fn real_endpoint_parses() {
        let ep = parse_lan_endpoint("192.168.1.7:51820").unwrap().unwrap();
        assert_eq!(ep.port(), 51820);
    }

    #[test]
    fn malformed_endpoint_is_an_error() {
        assert!(parse_lan_endpoint("not-an-endpoint").is_err());
        assert!(parse_lan_endpoint("192.168.1.7").is_err());
    }
}
