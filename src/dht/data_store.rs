//! Announce table: blob hash -> the set of peers that announced they hold
//! it, each with the instant of their most recent announce.
//!
//! Expiration is lazy: entries are filtered out on read and swept out on
//! `remove_expired_peers`, which callers are expected to run periodically
//! (mirroring the refresh-loop cadence) rather than on every access.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::clock::SharedClock;
use super::constants::DATA_EXPIRATION;
use super::node_id::NodeId;
use super::peer_info::PeerInfo;
use super::peer_manager::PeerManager;

pub struct DataStore {
    clock: SharedClock,
    peer_manager: Arc<Mutex<PeerManager>>,
    entries: HashMap<NodeId, Vec<(PeerInfo, Instant)>>,
}

impl DataStore {
    pub fn new(clock: SharedClock, peer_manager: Arc<Mutex<PeerManager>>) -> Self {
        Self {
            clock,
            peer_manager,
            entries: HashMap::new(),
        }
    }

    pub fn has_peers_for_blob(&self, key: &NodeId) -> bool {
        self.entries.contains_key(key)
    }

    /// Record or refresh `peer` announcing `key`. A repeat announce from
    /// the same peer just bumps its timestamp rather than duplicating it.
    pub fn add_peer_to_blob(&mut self, key: NodeId, peer: PeerInfo) {
        let now = self.clock.now();
        let slot = self.entries.entry(key).or_default();
        if let Some(existing) = slot.iter_mut().find(|(p, _)| *p == peer) {
            existing.1 = now;
        } else {
            slot.push((peer, now));
        }
    }

    fn filter_expired_peers<'a>(&'a self, key: &NodeId) -> impl Iterator<Item = PeerInfo> + 'a {
        let now = self.clock.now();
        self.entries
            .get(key)
            .into_iter()
            .flatten()
            .filter(move |(_, ts)| now.saturating_duration_since(*ts) < DATA_EXPIRATION)
            .map(|(peer, _)| *peer)
    }

    /// Peers for `key` that are both unexpired and not known-Bad.
    pub fn get_peers_for_blob(&self, key: &NodeId) -> Vec<PeerInfo> {
        let mut peer_manager = self.peer_manager.lock().expect("peer manager mutex poisoned");
        self.filter_expired_peers(key)
            .filter(|peer| {
                let endpoint = peer.udp_endpoint();
                match endpoint {
                    Some(endpoint) => peer_manager.peer_is_good(peer.node_id(), endpoint) != Some(false),
                    None => true,
                }
            })
            .collect()
    }

    /// Drop entries past `DATA_EXPIRATION`, or whose peer has gone Bad.
    pub fn remove_expired_peers(&mut self) {
        let now = self.clock.now();
        let mut peer_manager = self.peer_manager.lock().expect("peer manager mutex poisoned");
        self.entries.retain(|_, peers| {
            peers.retain(|(peer, ts)| {
                let expired = now.saturating_duration_since(*ts) >= DATA_EXPIRATION;
                let bad = peer
                    .udp_endpoint()
                    .map(|endpoint| peer_manager.peer_is_good(peer.node_id(), endpoint) == Some(false))
                    .unwrap_or(false);
                !(expired || bad)
            });
            !peers.is_empty()
        });
    }

    /// Distinct peers storing anything at all, across every key.
    pub fn get_storing_contacts(&self) -> Vec<PeerInfo> {
        let mut seen = std::collections::HashSet::new();
        let mut peers = Vec::new();
        for entries in self.entries.values() {
            for (peer, _) in entries {
                if seen.insert(*peer) {
                    peers.push(*peer);
                }
            }
        }
        peers
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::clock::VirtualClock;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn store() -> (DataStore, VirtualClock) {
        let clock = VirtualClock::new();
        let shared: SharedClock = Arc::new(clock.clone());
        let peer_manager = Arc::new(Mutex::new(PeerManager::new(shared.clone())));
        (DataStore::new(shared, peer_manager), clock)
    }

    fn peer(last_octet: u8) -> PeerInfo {
        PeerInfo::new(
            Some(NodeId::hash_string(&format!("peer-{last_octet}"))),
            Ipv4Addr::new(8, 8, 8, last_octet),
            Some(4444),
            None,
        )
        .unwrap()
    }

    #[test]
    fn add_and_get_peers_for_blob() {
        let (mut store, _clock) = store();
        let key = NodeId::hash_string("blob");
        store.add_peer_to_blob(key, peer(1));
        store.add_peer_to_blob(key, peer(2));
        assert_eq!(store.get_peers_for_blob(&key).len(), 2);
        assert!(store.has_peers_for_blob(&key));
    }

    #[test]
    fn repeat_announce_does_not_duplicate() {
        let (mut store, _clock) = store();
        let key = NodeId::hash_string("blob");
        store.add_peer_to_blob(key, peer(1));
        store.add_peer_to_blob(key, peer(1));
        assert_eq!(store.get_peers_for_blob(&key).len(), 1);
    }

    #[test]
    fn expired_entries_are_filtered_on_read() {
        let (mut store, clock) = store();
        let key = NodeId::hash_string("blob");
        store.add_peer_to_blob(key, peer(1));
        clock.advance(DATA_EXPIRATION + Duration::from_secs(1));
        assert!(store.get_peers_for_blob(&key).is_empty());
    }

    #[test]
    fn remove_expired_peers_sweeps_empty_keys() {
        let (mut store, clock) = store();
        let key = NodeId::hash_string("blob");
        store.add_peer_to_blob(key, peer(1));
        clock.advance(DATA_EXPIRATION + Duration::from_secs(1));
        store.remove_expired_peers();
        assert!(!store.has_peers_for_blob(&key));
        assert!(store.is_empty());
    }

    #[test]
    fn get_storing_contacts_deduplicates_across_keys() {
        let (mut store, _clock) = store();
        let key_a = NodeId::hash_string("blob-a");
        let key_b = NodeId::hash_string("blob-b");
        store.add_peer_to_blob(key_a, peer(1));
        store.add_peer_to_blob(key_b, peer(1));
        store.add_peer_to_blob(key_b, peer(2));
        assert_eq!(store.get_storing_contacts().len(), 2);
    }
}
