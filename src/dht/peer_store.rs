//! Peer seed persistence: the one piece of external storage the DHT core
//! consumes directly, kept deliberately narrow so the real SQL-backed
//! implementation lives entirely outside this crate (see spec §6.2).

use std::sync::Mutex;

use async_trait::async_trait;

use super::peer_info::PeerInfo;

#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn save_peers(&self, peers: Vec<PeerInfo>);
    async fn get_persisted_peers(&self) -> Vec<PeerInfo>;
}

/// Keeps the last-saved peer list in a `Mutex<Vec<PeerInfo>>`. Not durable
/// across process restarts; exists so `Node` always has a `PeerStore` to
/// call even when the embedder supplies none, and so tests can assert on
/// what would have been persisted.
#[derive(Debug, Default)]
pub struct InMemoryPeerStore {
    peers: Mutex<Vec<PeerInfo>>,
}

impl InMemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerStore for InMemoryPeerStore {
    async fn save_peers(&self, peers: Vec<PeerInfo>) {
        *self.peers.lock().expect("peer store mutex poisoned") = peers;
    }

    async fn get_persisted_peers(&self) -> Vec<PeerInfo> {
        self.peers.lock().expect("peer store mutex poisoned").clone()
    }
}
