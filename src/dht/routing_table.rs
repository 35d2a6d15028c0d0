//! Binary trie of k-buckets covering the full 384-bit key space.
//!
//! Buckets are stored as a flat, range-ordered `Vec<KBucket>` rather than an
//! actual tree; `kbucket_index` is a linear scan over the (small, usually
//! <400-entry) bucket list. This mirrors the upstream implementation, which
//! favors a simple contiguous-range list over a pointer-based trie.

use std::time::Instant;

use super::clock::SharedClock;
use super::constants::{K, REFRESH_INTERVAL, SPLIT_BUCKETS_UNDER_INDEX};
use super::kbucket::{AddOutcome, KBucket};
use super::node_id::{Distance, NodeId};
use super::peer_info::PeerInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddPeerOutcome {
    Added,
    /// The owning bucket is full and the split policy declined to split;
    /// the caller should probe the bucket's stalest peer instead of
    /// dropping `candidate` outright.
    Full { bucket_index: usize },
}

pub struct RoutingTable {
    parent_node_id: NodeId,
    buckets: Vec<KBucket>,
    clock: SharedClock,
}

impl RoutingTable {
    pub fn new(parent_node_id: NodeId, clock: SharedClock) -> Self {
        let bucket = KBucket::new(Distance::zero(), Distance::max_value(), clock.clone());
        Self { parent_node_id, buckets: vec![bucket], clock }
    }

    pub fn parent_node_id(&self) -> NodeId {
        self.parent_node_id
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn buckets_with_contacts(&self) -> usize {
        self.buckets.iter().filter(|b| !b.is_empty()).count()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kbucket_index(&self, key: &NodeId) -> usize {
        let distance = self.parent_node_id.distance(key);
        self.buckets
            .iter()
            .position(|b| b.key_in_range(&distance))
            .expect("bucket ranges must partition the full key space")
    }

    pub fn contact_in_routing_table(&self, node_id: &NodeId) -> bool {
        let idx = self.kbucket_index(node_id);
        self.buckets[idx].contains(node_id)
    }

    pub fn touch_kbucket(&mut self, key: &NodeId) {
        let idx = self.kbucket_index(key);
        self.touch_kbucket_by_index(idx);
    }

    pub fn touch_kbucket_by_index(&mut self, index: usize) {
        self.buckets[index].touch();
    }

    pub fn remove_peer(&mut self, peer: &PeerInfo) -> bool {
        let Some(node_id) = peer.node_id() else { return false };
        let idx = self.kbucket_index(&node_id);
        self.buckets[idx].remove_peer(peer)
    }

    /// Insert `peer`, splitting its bucket if the split policy allows it.
    pub fn add_peer(&mut self, peer: PeerInfo) -> AddPeerOutcome {
        let Some(node_id) = peer.node_id() else {
            return AddPeerOutcome::Full { bucket_index: 0 };
        };
        let idx = self.kbucket_index(&node_id);
        match self.buckets[idx].add_peer(peer) {
            AddOutcome::Added => AddPeerOutcome::Added,
            AddOutcome::Full => {
                if self.should_split(idx, &node_id) {
                    self.split_bucket(idx);
                    self.add_peer(peer)
                } else {
                    AddPeerOutcome::Full { bucket_index: idx }
                }
            }
        }
    }

    fn k_closest_known_to_parent(&self) -> Vec<PeerInfo> {
        let mut all: Vec<PeerInfo> = self.buckets.iter().flat_map(|b| b.peers().iter().copied()).collect();
        all.sort_by_key(|p| {
            p.node_id()
                .map(|id| self.parent_node_id.distance(&id))
                .unwrap_or_else(Distance::max_value)
        });
        all
    }

    fn should_split(&self, index: usize, candidate: &NodeId) -> bool {
        if index < SPLIT_BUCKETS_UNDER_INDEX {
            return true;
        }
        let closest = self.k_closest_known_to_parent();
        if closest.len() < K {
            return true;
        }
        let Some(kth) = closest[K - 1].node_id() else { return true };
        self.parent_node_id.distance(candidate) < self.parent_node_id.distance(&kth)
    }

    /// `mid = hi - (hi - lo) / 2`; the old bucket keeps `[lo, mid)`, a fresh
    /// bucket at `index + 1` takes `[mid, hi)`.
    fn split_bucket(&mut self, index: usize) {
        let lo = self.buckets[index].range_min;
        let hi = self.buckets[index].range_max;
        let mid = midpoint(lo, hi);

        let mut lower = KBucket::new(lo, mid, self.clock.clone());
        let mut upper = KBucket::new(mid, hi, self.clock.clone());
        for peer in self.buckets[index].peers().to_vec() {
            let distance = self.parent_node_id.distance(&peer.node_id().expect("bucketed peer has a node_id"));
            if upper.key_in_range(&distance) {
                upper.add_peer(peer);
            } else {
                lower.add_peer(peer);
            }
        }
        self.buckets[index] = lower;
        self.buckets.insert(index + 1, upper);
    }

    /// Merge empty buckets into their neighbors until the list is stable.
    pub fn join_buckets(&mut self) {
        loop {
            if self.buckets.len() <= 1 {
                return;
            }
            let Some(idx) = self.buckets.iter().position(KBucket::is_empty) else { return };
            let has_left = idx > 0;
            let has_right = idx + 1 < self.buckets.len();
            match (has_left, has_right) {
                (true, true) => {
                    let lo = self.buckets[idx - 1].range_min;
                    let hi = self.buckets[idx + 1].range_max;
                    let mid = midpoint(lo, hi);
                    self.buckets[idx - 1].range_max = mid;
                    self.buckets[idx + 1].range_min = mid;
                    self.buckets.remove(idx);
                }
                (true, false) => {
                    let hi = self.buckets[idx].range_max;
                    self.buckets[idx - 1].range_max = hi;
                    self.buckets.remove(idx);
                }
                (false, true) => {
                    let lo = self.buckets[idx].range_min;
                    self.buckets[idx + 1].range_min = lo;
                    self.buckets.remove(idx);
                }
                (false, false) => return,
            }
        }
    }

    /// Peers closest to `key`, excluding the parent and (if given) the
    /// sender, capped at `min(count, K)`.
    pub fn find_close_peers(&self, key: &NodeId, count: usize, sender: Option<NodeId>) -> Vec<PeerInfo> {
        let mut candidates: Vec<PeerInfo> = self
            .buckets
            .iter()
            .flat_map(|b| b.peers().iter().copied())
            .filter(|p| p.node_id() != Some(self.parent_node_id) && p.node_id() != sender)
            .collect();
        candidates.sort_by_key(|p| key.distance(&p.node_id().unwrap_or(*key)));
        candidates.truncate(count.min(K));
        candidates
    }

    fn midpoint_distance(&self, index: usize) -> Distance {
        midpoint(self.buckets[index].range_min, self.buckets[index].range_max)
    }

    pub fn midpoint_id(&self, index: usize) -> NodeId {
        self.midpoint_distance(index).to_id_from(&self.parent_node_id)
    }

    /// Synthetic ids at the midpoint of every bucket whose `last_accessed`
    /// predates `REFRESH_INTERVAL`, or every bucket at all if `force`.
    pub fn get_refresh_list(&self, start_index: usize, force: bool) -> Vec<NodeId> {
        let now = self.clock.now();
        (start_index..self.buckets.len())
            .filter(|&i| force || now.saturating_duration_since(self.buckets[i].last_accessed()) >= REFRESH_INTERVAL)
            .map(|i| self.midpoint_id(i))
            .collect()
    }

    pub fn all_peers(&self) -> Vec<PeerInfo> {
        self.buckets.iter().flat_map(|b| b.peers().iter().copied()).collect()
    }

    pub fn stalest_peer(&self, bucket_index: usize) -> Option<PeerInfo> {
        self.buckets[bucket_index].peers().first().copied()
    }

    pub fn bucket_last_accessed(&self, index: usize) -> Instant {
        self.buckets[index].last_accessed()
    }
}

fn midpoint(lo: Distance, hi: Distance) -> Distance {
    hi.saturating_sub(hi.saturating_sub(lo).halve())
}
