//! Test fixtures for creating common DHT test objects
//!
//! Provides builder patterns and factory functions for creating test data,
//! mirroring the shape of the production types in [`crate::dht`].

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::dht::clock::{SharedClock, VirtualClock};
use crate::dht::node_id::NodeId;
use crate::dht::peer_info::PeerInfo;

/// Builder for creating test node ids from small integers, so test output
/// stays readable (`test_node_id(1)` rather than a random 48-byte blob).
pub fn test_node_id(seed: u64) -> NodeId {
    NodeId::hash_string(&format!("test-node-{seed}"))
}

/// Builder for creating test peers on loopback addresses with distinct ports.
pub struct TestPeerBuilder {
    node_id: Option<NodeId>,
    octet: u8,
    udp_port: u16,
    tcp_port: Option<u16>,
}

impl TestPeerBuilder {
    pub fn new(seed: u64) -> Self {
        Self {
            node_id: Some(test_node_id(seed)),
            octet: (seed % 250 + 1) as u8,
            udp_port: 40000 + (seed % 20000) as u16,
            tcp_port: None,
        }
    }

    pub fn without_node_id(mut self) -> Self {
        self.node_id = None;
        self
    }

    pub fn with_udp_port(mut self, port: u16) -> Self {
        self.udp_port = port;
        self
    }

    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = Some(port);
        self
    }

    pub fn build(self) -> PeerInfo {
        PeerInfo::with_options(
            self.node_id,
            Ipv4Addr::new(127, 0, 0, self.octet),
            Some(self.udp_port),
            self.tcp_port,
            true,
        )
        .expect("test peer fixture must construct a valid PeerInfo")
    }
}

/// Quick fixture for a peer keyed only by a small integer seed.
pub fn test_peer(seed: u64) -> PeerInfo {
    TestPeerBuilder::new(seed).build()
}

/// A peer with a known TCP port, as `announce_blob`/`store` handshakes need.
pub fn test_peer_with_tcp(seed: u64, tcp_port: u16) -> PeerInfo {
    TestPeerBuilder::new(seed).with_tcp_port(tcp_port).build()
}

/// A bootstrap-style seed: an address with no node_id yet.
pub fn test_seed_peer(seed: u64) -> PeerInfo {
    TestPeerBuilder::new(seed).without_node_id().build()
}

/// A fresh virtual clock, shared the way every DHT component expects.
pub fn test_clock() -> (SharedClock, VirtualClock) {
    let clock = VirtualClock::new();
    let shared: SharedClock = Arc::new(clock.clone());
    (shared, clock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_is_valid_and_distinct() {
        let a = test_peer(1);
        let b = test_peer(2);
        assert_ne!(a, b);
        assert!(a.node_id().is_some());
    }

    #[test]
    fn seed_peer_has_no_node_id() {
        let p = test_seed_peer(1);
        assert!(p.node_id().is_none());
    }

    #[test]
    fn test_clock_starts_at_zero_offset_and_advances() {
        let (shared, virt) = test_clock();
        let t0 = shared.now();
        virt.advance(std::time::Duration::from_secs(5));
        assert!(shared.now() > t0);
    }
}
