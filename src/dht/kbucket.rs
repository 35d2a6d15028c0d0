//! A single k-bucket: a bounded, range-scoped set of peers.
//!
//! `RoutingTable` owns an ordered sequence of these; `KBucket` itself knows
//! nothing about its neighbors or the overall range partition.

use std::time::Instant;

use super::clock::SharedClock;
use super::constants::K;
use super::node_id::{Distance, NodeId};
use super::peer_info::PeerInfo;

pub enum AddOutcome {
    /// Peer was new or already present; it now sits at the tail.
    Added,
    /// Bucket already has K peers and none matched; caller decides whether
    /// to split or queue a replacement probe.
    Full,
}

pub struct KBucket {
    pub range_min: Distance,
    pub range_max: Distance,
    peers: Vec<PeerInfo>,
    last_accessed: Instant,
    clock: SharedClock,
}

impl KBucket {
    pub fn new(range_min: Distance, range_max: Distance, clock: SharedClock) -> Self {
        let last_accessed = clock.now();
        Self { range_min, range_max, peers: Vec::new(), last_accessed, clock }
    }

    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= K
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    pub fn touch(&mut self) {
        self.last_accessed = self.clock.now();
    }

    /// Does `key`'s distance to the bucket owner fall in `[range_min, range_max)`?
    pub fn key_in_range(&self, distance: &Distance) -> bool {
        *distance >= self.range_min && *distance < self.range_max
    }

    /// Insert or touch `peer`. Matching is by full triple equality *or* by
    /// node_id alone, so a peer that changed endpoint still gets recognized
    /// as the same contact and moved, not duplicated.
    pub fn add_peer(&mut self, peer: PeerInfo) -> AddOutcome {
        self.touch();
        if let Some(pos) = self
            .peers
            .iter()
            .position(|p| *p == peer || (p.node_id().is_some() && p.node_id() == peer.node_id()))
        {
            self.peers.remove(pos);
            self.peers.push(peer);
            return AddOutcome::Added;
        }
        if self.peers.len() < K {
            self.peers.push(peer);
            return AddOutcome::Added;
        }
        AddOutcome::Full
    }

    pub fn remove_peer(&mut self, peer: &PeerInfo) -> bool {
        if let Some(pos) = self.peers.iter().position(|p| p == peer) {
            self.peers.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.peers.iter().any(|p| p.node_id().as_ref() == Some(node_id))
    }

    pub fn get_peers(&self, count: usize, exclude: &[NodeId]) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .filter(|p| p.node_id().map(|id| !exclude.contains(&id)).unwrap_or(true))
            .take(count)
            .copied()
            .collect()
    }

    /// Peers not currently classified Good, candidates for a PingQueue sweep.
    pub fn get_bad_or_unknown_peers(&self, mut is_good: impl FnMut(&PeerInfo) -> Option<bool>) -> Vec<PeerInfo> {
        self.peers.iter().filter(|p| is_good(p) != Some(true)).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::clock::monotonic;
    use std::net::Ipv4Addr;

    fn full_range() -> (Distance, Distance) {
        let zero = NodeId::from_bytes([0u8; 48]);
        let max = NodeId::from_bytes([0xFF; 48]);
        (zero.distance(&NodeId::from_bytes([0u8; 48])), zero.distance(&max))
    }

    fn peer(last: u8) -> PeerInfo {
        PeerInfo::new(Some(NodeId::hash_string(&format!("p{last}"))), Ipv4Addr::new(8, 8, 8, last), Some(4444), None).unwrap()
    }

    #[test]
    fn add_peer_until_full() {
        let (lo, hi) = full_range();
        let mut bucket = KBucket::new(lo, hi, monotonic());
        for i in 0..K as u8 {
            assert!(matches!(bucket.add_peer(peer(i)), AddOutcome::Added));
        }
        assert!(bucket.is_full());
        assert!(matches!(bucket.add_peer(peer(200)), AddOutcome::Full));
    }

    #[test]
    fn re_adding_existing_peer_moves_to_tail_without_growing() {
        let (lo, hi) = full_range();
        let mut bucket = KBucket::new(lo, hi, monotonic());
        bucket.add_peer(peer(1));
        bucket.add_peer(peer(2));
        bucket.add_peer(peer(1));
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.peers()[1], peer(1));
    }

    #[test]
    fn remove_peer_shrinks_bucket() {
        let (lo, hi) = full_range();
        let mut bucket = KBucket::new(lo, hi, monotonic());
        bucket.add_peer(peer(1));
        assert!(bucket.remove_peer(&peer(1)));
        assert!(bucket.is_empty());
        assert!(!bucket.remove_peer(&peer(1)));
    }

    #[test]
    fn get_peers_respects_exclude_and_count() {
        let (lo, hi) = full_range();
        let mut bucket = KBucket::new(lo, hi, monotonic());
        bucket.add_peer(peer(1));
        bucket.add_peer(peer(2));
        let excluded = peer(1).node_id().unwrap();
        let result = bucket.get_peers(5, &[excluded]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0], peer(2));
    }
}
