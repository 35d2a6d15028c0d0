//! PeerInfo - a validated (node_id, address, udp_port, tcp_port) tuple.
//!
//! Treated as a value type: cheap to copy/clone, stored as owned copies in
//! every container that references it (routing table, data store, peer
//! manager reverse map, in-flight finders) rather than shared behind a
//! pointer. Equality and hashing are over `(address, node_id, udp_port)`
//! only; `tcp_port` is metadata that can change without affecting identity.

use std::net::Ipv4Addr;

use super::node_id::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum PeerInfoError {
    #[error("invalid node_id: expected {expected} bytes, got {actual}")]
    InvalidNodeIdLength { expected: usize, actual: usize },
    #[error("invalid udp port: {0}")]
    InvalidUdpPort(u16),
    #[error("invalid tcp port: {0}")]
    InvalidTcpPort(u16),
    #[error("invalid or non-public IPv4 address: {0}")]
    InvalidAddress(Ipv4Addr),
}

#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    address: Ipv4Addr,
    node_id: Option<NodeId>,
    udp_port: Option<u16>,
    tcp_port: Option<u16>,
    protocol_version: u8,
}

const PORT_RANGE: std::ops::RangeInclusive<u16> = 1024..=65535;

impl PeerInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: Option<NodeId>,
        address: Ipv4Addr,
        udp_port: Option<u16>,
        tcp_port: Option<u16>,
    ) -> Result<Self, PeerInfoError> {
        Self::with_options(node_id, address, udp_port, tcp_port, false)
    }

    pub fn with_options(
        node_id: Option<NodeId>,
        address: Ipv4Addr,
        udp_port: Option<u16>,
        tcp_port: Option<u16>,
        allow_localhost: bool,
    ) -> Result<Self, PeerInfoError> {
        if let Some(port) = udp_port {
            if !PORT_RANGE.contains(&port) {
                return Err(PeerInfoError::InvalidUdpPort(port));
            }
        }
        if let Some(port) = tcp_port {
            if !PORT_RANGE.contains(&port) {
                return Err(PeerInfoError::InvalidTcpPort(port));
            }
        }
        if !is_valid_public_ipv4(&address, allow_localhost) {
            return Err(PeerInfoError::InvalidAddress(address));
        }
        Ok(Self {
            address,
            node_id,
            udp_port,
            tcp_port,
            protocol_version: super::constants::PROTOCOL_VERSION,
        })
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn udp_port(&self) -> Option<u16> {
        self.udp_port
    }

    pub fn tcp_port(&self) -> Option<u16> {
        self.tcp_port
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn with_tcp_port(mut self, tcp_port: u16) -> Self {
        self.tcp_port = Some(tcp_port);
        self
    }

    /// `(address, udp_port)` endpoint, when the peer is UDP-reachable.
    pub fn udp_endpoint(&self) -> Option<std::net::SocketAddrV4> {
        self.udp_port.map(|port| std::net::SocketAddrV4::new(self.address, port))
    }

    /// Legacy-network compatibility: a blob peer discovered only by its TCP
    /// address carries no UDP port. When `enabled`, and one isn't already
    /// known, guess it from the TCP port so the peer can still be probed.
    /// No-op outside the documented legacy window.
    pub fn with_legacy_udp_guess(self, enabled: bool) -> Self {
        if !enabled || self.udp_port.is_some() {
            return self;
        }
        match self.tcp_port.and_then(guess_udp_port) {
            Some(guessed) => Self { udp_port: Some(guessed), ..self },
            None => self,
        }
    }

    /// Identity used for equality/hashing/bucket membership: the triple, not tcp_port.
    fn identity_key(&self) -> (Ipv4Addr, Option<NodeId>, Option<u16>) {
        (self.address, self.node_id, self.udp_port)
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.identity_key() == other.identity_key()
    }
}

impl Eq for PeerInfo {}

impl std::hash::Hash for PeerInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity_key().hash(state);
    }
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id = self
            .node_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "????????".to_string());
        write!(
            f,
            "PeerInfo({}@{}:{:?}-{:?})",
            id, self.address, self.udp_port, self.tcp_port
        )
    }
}

/// Legacy heuristic (§9 Open Question): some older clients reused their UDP
/// port as `udp_port = tcp_port - 3333 + 4444` when `3333 < tcp_port < 3400`.
/// Best-effort only; parameterized via [`PeerInfo::with_legacy_udp_guess`]
/// rather than applied unconditionally.
fn guess_udp_port(tcp_port: u16) -> Option<u16> {
    if tcp_port > 3333 && tcp_port < 3400 {
        Some(tcp_port - 3333 + 4444)
    } else {
        None
    }
}

/// Reject RFC1918, loopback, multicast, link-local, and other reserved
/// ranges; `allow_localhost` opts a test into loopback/private addresses.
pub fn is_valid_public_ipv4(address: &Ipv4Addr, allow_localhost: bool) -> bool {
    if allow_localhost {
        return !address.is_unspecified() && !address.is_broadcast();
    }
    !(address.is_private()
        || address.is_loopback()
        || address.is_link_local()
        || address.is_multicast()
        || address.is_broadcast()
        || address.is_unspecified()
        || address.is_documentation())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn public_addr() -> Ipv4Addr {
        Ipv4Addr::new(8, 8, 8, 8)
    }

    #[test]
    fn rejects_rfc1918_addresses() {
        assert!(!is_valid_public_ipv4(&Ipv4Addr::new(10, 0, 0, 1), false));
        assert!(!is_valid_public_ipv4(&Ipv4Addr::new(192, 168, 1, 1), false));
        assert!(!is_valid_public_ipv4(&Ipv4Addr::new(172, 16, 0, 1), false));
    }

    #[test]
    fn rejects_loopback_and_link_local() {
        assert!(!is_valid_public_ipv4(&Ipv4Addr::new(127, 0, 0, 1), false));
        assert!(!is_valid_public_ipv4(&Ipv4Addr::new(169, 254, 1, 1), false));
    }

    #[test]
    fn accepts_public_address() {
        assert!(is_valid_public_ipv4(&public_addr(), false));
    }

    #[test]
    fn allow_localhost_flag_permits_loopback() {
        assert!(is_valid_public_ipv4(&Ipv4Addr::new(127, 0, 0, 1), true));
        assert!(is_valid_public_ipv4(&Ipv4Addr::new(10, 0, 0, 1), true));
    }

    #[test]
    fn construction_validates_node_id_length_via_nodeid_type() {
        // NodeId::from_slice already enforces the 48-byte invariant; PeerInfo
        // only ever holds a already-validated NodeId.
        assert!(NodeId::from_slice(&[0u8; 47]).is_none());
    }

    #[test]
    fn construction_rejects_out_of_range_ports() {
        let err = PeerInfo::with_options(None, public_addr(), Some(80), None, false).unwrap_err();
        assert!(matches!(err, PeerInfoError::InvalidUdpPort(80)));
    }

    #[test]
    fn construction_rejects_private_address_without_allow_localhost() {
        let err =
            PeerInfo::new(None, Ipv4Addr::new(10, 0, 0, 1), Some(4444), None).unwrap_err();
        assert!(matches!(err, PeerInfoError::InvalidAddress(_)));
    }

    #[test]
    fn equality_ignores_tcp_port() {
        let node_id = NodeId::hash_string("peer");
        let a = PeerInfo::new(Some(node_id), public_addr(), Some(4444), Some(3333)).unwrap();
        let b = PeerInfo::new(Some(node_id), public_addr(), Some(4444), Some(9999)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn inequality_on_node_id_or_endpoint() {
        let a = PeerInfo::new(Some(NodeId::hash_string("a")), public_addr(), Some(4444), None)
            .unwrap();
        let b = PeerInfo::new(Some(NodeId::hash_string("b")), public_addr(), Some(4444), None)
            .unwrap();
        assert_ne!(a, b);
    }
}
