//! Iterative lookup: the Kademlia round-based probing loop shared by node
//! discovery and value retrieval, run as a background task that feeds the
//! caller batches of newly-useful peers over a channel.
//!
//! `IterativeNodeFinder` and `IterativeValueFinder` are the two public
//! shapes (§4.5.1/§4.5.2); both are driven by the same round-scheduling
//! rule, duplicated here rather than abstracted, since the two finders
//! integrate responses and decide termination in genuinely different ways.

use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use super::codec::{decode_peer_tcp, decode_peer_udp};
use super::constants::{ALPHA, K};
use super::data_store::DataStore;
use super::node_id::{Distance, NodeId};
use super::peer_info::PeerInfo;
use super::peer_manager::PeerManager;
use super::rpc::RpcEndpoint;

const BATCH_CHANNEL_DEPTH: usize = 32;

#[derive(Clone, Copy)]
struct ShortlistEntry {
    peer: PeerInfo,
    distance: Distance,
}

/// The shared "which peer next" rule for both finder flavors (§4.5, Round).
struct Shortlist {
    key: NodeId,
    max_results: usize,
    entries: Vec<ShortlistEntry>,
    contacted: HashSet<PeerInfo>,
    running: usize,
}

impl Shortlist {
    fn new(key: NodeId, max_results: usize, initial: Vec<PeerInfo>) -> Self {
        let mut s = Self {
            key,
            max_results: max_results.max(K),
            entries: Vec::new(),
            contacted: HashSet::new(),
            running: 0,
        };
        s.merge(initial);
        s
    }

    /// Insert newly-seen peers, keep sorted by ascending distance to `key`,
    /// dedup by identity, and cap to the effective shortlist size.
    fn merge(&mut self, peers: Vec<PeerInfo>) {
        for peer in peers {
            if self.entries.iter().any(|e| e.peer == peer) {
                continue;
            }
            let distance = match peer.node_id() {
                Some(id) => id.distance(&self.key),
                // Bootstrap seeds with no node_id yet: sort them last so
                // known candidates are always preferred, but still probe
                // them (a seed is never "contacted" until it replies).
                None => Distance::max_value(),
            };
            self.entries.push(ShortlistEntry { peer, distance });
        }
        self.entries.sort_by_key(|e| e.distance);
        self.entries.truncate(self.max_results);
    }

    fn remove(&mut self, peer: &PeerInfo) {
        self.entries.retain(|e| e.peer != *peer);
    }

    /// Pick the next batch of peers to probe this round, per §4.5's Round
    /// rule. Marks each picked peer contacted and bumps `running` so a
    /// concurrent call to `next_round` (there shouldn't be one; the driver
    /// is single-threaded) sees a consistent budget.
    fn next_round(&mut self, own_node_id: NodeId, own_endpoint: Option<SocketAddrV4>) -> Vec<PeerInfo> {
        let mut picked = Vec::new();
        let mut index = 0usize;
        while index < self.entries.len() {
            let peer = self.entries[index].peer;
            index += 1;
            if self.contacted.contains(&peer) {
                continue;
            }
            if peer.node_id() == Some(own_node_id) {
                continue;
            }
            if let (Some(mine), Some(theirs)) = (own_endpoint, peer.udp_endpoint()) {
                if mine == theirs {
                    continue;
                }
            }
            if self.running >= ALPHA {
                break;
            }
            if index - 1 > K + self.running {
                break;
            }
            self.contacted.insert(peer);
            self.running += 1;
            picked.push(peer);
        }
        picked
    }

    fn probe_done(&mut self) {
        self.running = self.running.saturating_sub(1);
    }

    fn exhausted(&self) -> bool {
        self.running == 0
    }
}

/// Consumer-facing contract: both finders are async iterators of batches.
#[async_trait]
pub trait IterativeFinder: Send {
    /// Returns the next non-empty batch of newly-useful peers, or `None`
    /// once the search is exhausted or has been closed.
    async fn next_batch(&mut self) -> Option<Vec<PeerInfo>>;

    /// Cancel all in-flight probes and release the background task.
    async fn close(self);
}

// ---------------------------------------------------------------------
// Node finder (§4.5.1)
// ---------------------------------------------------------------------

pub struct IterativeNodeFinder {
    receiver: mpsc::Receiver<Vec<PeerInfo>>,
    driver: tokio::task::JoinHandle<()>,
}

impl IterativeNodeFinder {
    pub fn start(
        rpc: Arc<RpcEndpoint>,
        peer_manager: Arc<StdMutex<PeerManager>>,
        own_node_id: NodeId,
        own_endpoint: Option<SocketAddrV4>,
        key: NodeId,
        max_results: usize,
        initial_shortlist: Vec<PeerInfo>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(BATCH_CHANNEL_DEPTH);
        let driver = tokio::spawn(run_node_finder(
            rpc,
            peer_manager,
            own_node_id,
            own_endpoint,
            key,
            max_results,
            initial_shortlist,
            tx,
        ));
        Self { receiver: rx, driver }
    }
}

#[async_trait]
impl IterativeFinder for IterativeNodeFinder {
    async fn next_batch(&mut self) -> Option<Vec<PeerInfo>> {
        self.receiver.recv().await
    }

    async fn close(self) {
        self.driver.abort();
        let _ = self.driver.await;
    }
}

enum NodeProbeOutcome {
    Success(Vec<PeerInfo>),
    Failure,
}

async fn run_node_finder(
    rpc: Arc<RpcEndpoint>,
    peer_manager: Arc<StdMutex<PeerManager>>,
    own_node_id: NodeId,
    own_endpoint: Option<SocketAddrV4>,
    key: NodeId,
    max_results: usize,
    initial_shortlist: Vec<PeerInfo>,
    sender: mpsc::Sender<Vec<PeerInfo>>,
) {
    let mut shortlist = Shortlist::new(key, max_results, initial_shortlist);
    let mut active: Vec<PeerInfo> = Vec::new();
    let mut tasks: JoinSet<(PeerInfo, NodeProbeOutcome)> = JoinSet::new();

    loop {
        for peer in shortlist.next_round(own_node_id, own_endpoint) {
            let rpc = rpc.clone();
            tasks.spawn(async move {
                let outcome = match peer.udp_endpoint() {
                    Some(endpoint) => match rpc.find_node(endpoint, key).await {
                        Ok(peers) => NodeProbeOutcome::Success(peers),
                        Err(e) => {
                            trace!(target: "dht::finder", peer = %peer_debug(&peer), error = %e, "findNode probe failed");
                            NodeProbeOutcome::Failure
                        }
                    },
                    None => NodeProbeOutcome::Failure,
                };
                (peer, outcome)
            });
        }

        if tasks.is_empty() {
            if shortlist.exhausted() {
                break;
            }
            continue;
        }

        let Some(joined) = tasks.join_next().await else { break };
        let (peer, outcome) = match joined {
            Ok(v) => v,
            Err(_) => continue,
        };
        shortlist.probe_done();

        let mut found_target = false;
        match outcome {
            NodeProbeOutcome::Success(peers) => {
                if peers.iter().any(|p| p.node_id() == Some(key)) {
                    found_target = true;
                }
                active.push(peer);
                shortlist.merge(peers);
            }
            NodeProbeOutcome::Failure => {
                shortlist.remove(&peer);
            }
        }

        if found_target {
            let good = good_peers(&peer_manager, &active);
            let _ = sender.send(good).await;
            break;
        }
    }

    let good = good_peers(&peer_manager, &active);
    if !good.is_empty() {
        let _ = sender.send(good).await;
    }
}

/// Only peers currently classified Good are yielded to the consumer (§4.5.1).
fn good_peers(peer_manager: &Arc<StdMutex<PeerManager>>, peers: &[PeerInfo]) -> Vec<PeerInfo> {
    let mut manager = peer_manager.lock().expect("peer manager mutex poisoned");
    peers
        .iter()
        .copied()
        .filter(|p| match p.udp_endpoint() {
            Some(endpoint) => manager.peer_is_good(p.node_id(), endpoint) == Some(true),
            None => false,
        })
        .collect()
}

fn peer_debug(peer: &PeerInfo) -> String {
    format!("{}:{:?}", peer.address(), peer.udp_port())
}

// ---------------------------------------------------------------------
// Value finder (§4.5.2)
// ---------------------------------------------------------------------

/// Result of draining an `IterativeValueFinder` to exhaustion: every
/// distinct peer discovered to be storing the key, plus whether the local
/// `DataStore` itself already held any (surfaced separately since those
/// don't need a network round trip to trust).
#[derive(Debug, Default, Clone)]
pub struct ValueLookupResult {
    pub local_hits: Vec<PeerInfo>,
    pub remote_hits: Vec<PeerInfo>,
}

pub struct IterativeValueFinder {
    receiver: mpsc::Receiver<Vec<PeerInfo>>,
    driver: tokio::task::JoinHandle<()>,
    initial_result: Option<Vec<PeerInfo>>,
}

impl IterativeValueFinder {
    pub async fn start(
        rpc: Arc<RpcEndpoint>,
        peer_manager: Arc<StdMutex<PeerManager>>,
        data_store: Arc<tokio::sync::Mutex<DataStore>>,
        own_node_id: NodeId,
        own_endpoint: Option<SocketAddrV4>,
        key: NodeId,
        max_results: usize,
        initial_shortlist: Vec<PeerInfo>,
        allow_localhost: bool,
    ) -> Self {
        let initial_result = {
            let store = data_store.lock().await;
            store.get_peers_for_blob(&key)
        };

        let (tx, rx) = mpsc::channel(BATCH_CHANNEL_DEPTH);
        let driver = tokio::spawn(run_value_finder(
            rpc,
            peer_manager,
            own_node_id,
            own_endpoint,
            key,
            max_results,
            initial_shortlist,
            allow_localhost,
            tx,
        ));
        Self {
            receiver: rx,
            driver,
            initial_result: if initial_result.is_empty() { None } else { Some(initial_result) },
        }
    }

    /// Drain until exhaustion, aggregating every batch (local hits plus
    /// every remote batch) into a single [`ValueLookupResult`].
    pub async fn collect(mut self) -> ValueLookupResult {
        let local_hits = self.initial_result.take().unwrap_or_default();
        let mut remote_hits = Vec::new();
        while let Some(batch) = self.next_batch().await {
            remote_hits.extend(batch);
        }
        ValueLookupResult { local_hits, remote_hits }
    }
}

#[async_trait]
impl IterativeFinder for IterativeValueFinder {
    async fn next_batch(&mut self) -> Option<Vec<PeerInfo>> {
        if let Some(initial) = self.initial_result.take() {
            if !initial.is_empty() {
                return Some(initial);
            }
        }
        self.receiver.recv().await
    }

    async fn close(self) {
        self.driver.abort();
        let _ = self.driver.await;
    }
}

enum ValueProbeOutcome {
    Success {
        contacts: Vec<PeerInfo>,
        blob_peers: Option<Vec<PeerInfo>>,
        repage: bool,
    },
    Failure,
}

#[allow(clippy::too_many_arguments)]
async fn run_value_finder(
    rpc: Arc<RpcEndpoint>,
    peer_manager: Arc<StdMutex<PeerManager>>,
    own_node_id: NodeId,
    own_endpoint: Option<SocketAddrV4>,
    key: NodeId,
    max_results: usize,
    initial_shortlist: Vec<PeerInfo>,
    allow_localhost: bool,
    sender: mpsc::Sender<Vec<PeerInfo>>,
) {
    let mut shortlist = Shortlist::new(key, max_results, initial_shortlist);
    let mut peer_pages: std::collections::HashMap<PeerInfo, u32> = std::collections::HashMap::new();
    let mut discovered_peers: std::collections::HashMap<PeerInfo, HashSet<[u8; 6]>> = std::collections::HashMap::new();
    let mut blob_peers: HashSet<PeerInfo> = HashSet::new();
    let mut tasks: JoinSet<(PeerInfo, ValueProbeOutcome)> = JoinSet::new();

    loop {
        for peer in shortlist.next_round(own_node_id, own_endpoint) {
            let rpc = rpc.clone();
            let peer_manager = peer_manager.clone();
            let page = *peer_pages.get(&peer).unwrap_or(&0);
            tasks.spawn(async move {
                let Some(endpoint) = peer.udp_endpoint() else {
                    return (peer, ValueProbeOutcome::Failure);
                };
                match rpc.find_value(endpoint, key, page).await {
                    Ok(result) => {
                        let contacts: Vec<PeerInfo> = result
                            .contacts
                            .iter()
                            .filter_map(|bytes| match decode_peer_udp(bytes, allow_localhost) {
                                Ok(p) => Some(p),
                                Err(e) => {
                                    warn!(target: "dht::finder", error = %e, "malformed findValue contact");
                                    peer_manager.lock().expect("peer manager mutex poisoned").report_failure(endpoint);
                                    None
                                }
                            })
                            .collect();

                        let blob_peers = result.blob_peers.as_deref().map(|raw| {
                            raw.iter()
                                .filter_map(|bytes| match decode_peer_tcp(bytes, allow_localhost) {
                                    Ok(p) => Some(p),
                                    Err(e) => {
                                        warn!(target: "dht::finder", error = %e, "malformed findValue blob peer");
                                        peer_manager.lock().expect("peer manager mutex poisoned").report_failure(endpoint);
                                        None
                                    }
                                })
                                .collect::<Vec<_>>()
                        });

                        let page_full = blob_peers.as_ref().map(|p| p.len() >= K).unwrap_or(false);
                        let more_pages = (page as i64) < result.pages.max(0);
                        let repage = page_full && more_pages;

                        (peer, ValueProbeOutcome::Success { contacts, blob_peers, repage })
                    }
                    Err(e) => {
                        trace!(target: "dht::finder", peer = %peer_debug(&peer), error = %e, "findValue probe failed");
                        (peer, ValueProbeOutcome::Failure)
                    }
                }
            });
        }

        if tasks.is_empty() {
            if shortlist.exhausted() {
                break;
            }
            continue;
        }

        let Some(joined) = tasks.join_next().await else { break };
        let (peer, outcome) = match joined {
            Ok(v) => v,
            Err(_) => continue,
        };
        shortlist.probe_done();

        match outcome {
            ValueProbeOutcome::Success { contacts, blob_peers: page_blob_peers, repage } => {
                shortlist.merge(contacts);

                if let Some(peers) = page_blob_peers {
                    let seen = discovered_peers.entry(peer).or_default();
                    let mut fresh = Vec::new();
                    for p in peers {
                        let fingerprint = peer_fingerprint(&p);
                        if !seen.insert(fingerprint) {
                            debug!(target: "dht::finder", peer = %peer_debug(&p), "duplicate blob peer in page");
                            continue;
                        }
                        if blob_peers.insert(p) {
                            fresh.push(p);
                        }
                    }
                    if !fresh.is_empty() {
                        let _ = sender.send(fresh).await;
                    }
                }

                if repage {
                    let next_page = peer_pages.entry(peer).or_insert(0);
                    *next_page += 1;
                    shortlist.contacted.remove(&peer);
                }
            }
            ValueProbeOutcome::Failure => {
                shortlist.remove(&peer);
            }
        }
    }
}

fn peer_fingerprint(peer: &PeerInfo) -> [u8; 6] {
    let mut buf = [0u8; 6];
    buf[0..4].copy_from_slice(&peer.address().octets());
    let port = peer.tcp_port().or(peer.udp_port()).unwrap_or(0);
    buf[4..6].copy_from_slice(&port.to_be_bytes());
    buf
}
