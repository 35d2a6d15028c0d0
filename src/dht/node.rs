//! The `Node`: composition root that wires `RoutingTable`, `DataStore`,
//! `PeerManager`, `RpcEndpoint` and `PingQueue` into a running DHT
//! participant, and drives join/refresh/announce per §4.8.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::config::DhtConfig;

use super::clock::SharedClock;
use super::codec::StoreArgs;
use super::constants::K;
use super::data_store::DataStore;
use super::error::{DhtError, DhtResult};
use super::finder::{IterativeFinder, IterativeNodeFinder, IterativeValueFinder};
use super::node_id::NodeId;
use super::peer_info::PeerInfo;
use super::peer_manager::PeerManager;
use super::peer_store::PeerStore;
use super::ping_queue::PingQueue;
use super::routing_table::RoutingTable;
use super::rpc::RpcEndpoint;

/// How often the low-priority ping queue is pumped. Not a wire constant;
/// just a cadence for draining `PingQueue`'s internal timer queue.
const PING_QUEUE_TICK: Duration = Duration::from_secs(30);
/// Cadence of the join-loop's "are we still joined?" check (§4.8's
/// `join_network` polls every second in spirit; we follow it exactly).
const JOIN_LOOP_TICK: Duration = Duration::from_secs(1);
/// How long to wait after a DNS resolution failure before retrying
/// bootstrap host lookups (§6.3).
const BOOTSTRAP_DNS_RETRY: Duration = Duration::from_secs(30);

/// The outcome of announcing a blob: which peers, by node_id, confirmed
/// they now hold it.
#[derive(Debug, Clone, Default)]
pub struct AnnounceOutcome {
    pub confirmed: Vec<NodeId>,
    pub attempted: usize,
}

struct AnnouncedBlob {
    storers: Vec<PeerInfo>,
}

/// A running DHT node. Cheap to clone: internally `Arc`-backed, and every
/// clone shares the same background tasks and shuts them down together.
#[derive(Clone)]
pub struct NodeHandle(Arc<Node>);

pub struct Node {
    own_node_id: NodeId,
    clock: SharedClock,
    config: DhtConfig,
    rpc: Arc<RpcEndpoint>,
    routing_table: Arc<AsyncMutex<RoutingTable>>,
    peer_manager: Arc<StdMutex<PeerManager>>,
    data_store: Arc<AsyncMutex<DataStore>>,
    ping_queue: Arc<PingQueue>,
    peer_store: Arc<dyn PeerStore>,
    joined: watch::Sender<bool>,
    announced: StdMutex<std::collections::HashMap<NodeId, AnnouncedBlob>>,
    shutdown: broadcast::Sender<()>,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Node {
    /// Bind, join the network, and start every background task (RPC
    /// endpoint, ping queue, join loop, refresh loop). Returns immediately
    /// once bound; joining the network happens in the background exactly
    /// as §4.8 describes (the join loop keeps retrying until the routing
    /// table holds at least one peer, then keeps watching for it to empty
    /// out again).
    pub async fn join(
        own_node_id: NodeId,
        clock: SharedClock,
        config: DhtConfig,
        peer_store: Arc<dyn PeerStore>,
    ) -> DhtResult<NodeHandle> {
        let routing_table = Arc::new(AsyncMutex::new(RoutingTable::new(own_node_id, clock.clone())));
        let peer_manager = Arc::new(StdMutex::new(PeerManager::with_cache_size(clock.clone(), config.peer_cache_size)));
        let data_store = Arc::new(AsyncMutex::new(DataStore::new(clock.clone(), peer_manager.clone())));

        let rpc = RpcEndpoint::bind(
            config.bind_address,
            own_node_id,
            clock.clone(),
            routing_table.clone(),
            data_store.clone(),
            peer_manager.clone(),
            config.allow_localhost,
        )
        .await?;

        let ping_queue = Arc::new(PingQueue::new(clock.clone(), rpc.clone(), peer_manager.clone()));
        rpc.set_ping_queue(ping_queue.clone());

        let (shutdown_tx, _) = broadcast::channel(16);
        let (joined_tx, _) = watch::channel(false);

        let node = Arc::new(Node {
            own_node_id,
            clock,
            config,
            rpc,
            routing_table,
            peer_manager,
            data_store,
            ping_queue,
            peer_store,
            joined: joined_tx,
            announced: StdMutex::new(std::collections::HashMap::new()),
            shutdown: shutdown_tx,
            tasks: StdMutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });
        let handle = NodeHandle(node);

        let rpc_task = tokio::spawn(handle.0.rpc.clone().run(handle.0.shutdown.subscribe()));
        let ping_task = tokio::spawn(handle.0.ping_queue.clone().run(PING_QUEUE_TICK, handle.0.shutdown.subscribe()));
        let join_task = tokio::spawn(run_join_loop(handle.clone(), handle.0.shutdown.subscribe()));
        let refresh_task = tokio::spawn(run_refresh_loop(handle.clone(), handle.0.shutdown.subscribe()));

        {
            let mut tasks = handle.0.tasks.lock().expect("node task list mutex poisoned");
            tasks.extend([rpc_task, ping_task, join_task, refresh_task]);
        }

        let bound_addr = handle.0.rpc.local_addr().map_err(|e| DhtError::Transport(e.to_string()))?;
        info!(target: "dht::node", node_id = %hex::encode(own_node_id.as_bytes()), addr = %bound_addr, "node joining");

        Ok(handle)
    }
}

impl NodeHandle {
    pub fn node_id(&self) -> NodeId {
        self.0.own_node_id
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.0.rpc.local_addr()
    }

    /// True once the routing table has held at least one peer since the
    /// last time it was observed empty.
    pub fn is_joined(&self) -> bool {
        *self.0.joined.borrow()
    }

    /// `peer_search(key, count=K, max_results=K*2)` (§4.8): drain an
    /// `IterativeNodeFinder` seeded from the routing table, sort the union
    /// of every yielded batch by distance to `key`, return the closest
    /// `count`.
    pub async fn peer_search(&self, key: NodeId, count: usize, max_results: usize) -> Vec<PeerInfo> {
        let shortlist = {
            let table = self.0.routing_table.lock().await;
            table.find_close_peers(&key, K.max(count), None)
        };
        self.peer_search_from(key, count, max_results, shortlist).await
    }

    async fn peer_search_from(&self, key: NodeId, count: usize, max_results: usize, shortlist: Vec<PeerInfo>) -> Vec<PeerInfo> {
        let own_endpoint = self.own_udp_endpoint();
        let mut finder = IterativeNodeFinder::start(
            self.0.rpc.clone(),
            self.0.peer_manager.clone(),
            self.0.own_node_id,
            own_endpoint,
            key,
            max_results,
            shortlist,
        );

        let mut found = Vec::new();
        while let Some(batch) = finder.next_batch().await {
            found.extend(batch);
        }
        finder.close().await;

        found.sort_by_key(|p| key.distance(&p.node_id().unwrap_or(key)));
        found.dedup_by_key(|p| p.node_id());
        found.truncate(count);
        found
    }

    fn own_udp_endpoint(&self) -> Option<SocketAddrV4> {
        let ip = self.0.config.external_ip?;
        let SocketAddr::V4(bound) = self.0.rpc.local_addr().ok()? else { return None };
        Some(SocketAddrV4::new(ip, bound.port()))
    }

    /// Look up peers storing `key` over the network, starting from
    /// whatever the local `DataStore` already has.
    pub async fn find_peers_for_blob(&self, key: NodeId) -> Vec<PeerInfo> {
        let shortlist = {
            let table = self.0.routing_table.lock().await;
            table.find_close_peers(&key, K, None)
        };
        let finder = IterativeValueFinder::start(
            self.0.rpc.clone(),
            self.0.peer_manager.clone(),
            self.0.data_store.clone(),
            self.0.own_node_id,
            self.own_udp_endpoint(),
            key,
            K * 2,
            shortlist,
            self.0.config.allow_localhost,
        )
        .await;
        let result = finder.collect().await;
        let mut peers = result.local_hits;
        peers.extend(result.remote_hits);
        peers.dedup_by_key(|p| p.node_id());
        peers
    }

    /// `announce_blob(blob_hash)` (§4.8): locate the closest peers, then
    /// for each run the `findValue`-for-token, `store`-with-token
    /// handshake. Aggregates which peers confirmed storage.
    pub async fn announce_blob(&self, blob_hash: NodeId) -> AnnounceOutcome {
        let Some(tcp_port) = self.0.config.tcp_port else {
            warn!(target: "dht::node", "announce_blob called with no tcp_port configured");
            return AnnounceOutcome::default();
        };

        let peers = self.peer_search(blob_hash, K, K * 2).await;
        let attempted = peers.len();

        let confirmations = futures::future::join_all(peers.iter().copied().map(|peer| {
            let rpc = self.0.rpc.clone();
            let own_node_id = self.0.own_node_id;
            async move { store_to_peer(&rpc, peer, blob_hash, own_node_id, tcp_port).await }
        }))
        .await;

        let mut confirmed = Vec::new();
        let mut storers = Vec::new();
        for (peer, ok) in peers.into_iter().zip(confirmations) {
            if ok {
                if let Some(id) = peer.node_id() {
                    confirmed.push(id);
                }
                storers.push(peer);
            }
        }

        if !storers.is_empty() {
            let mut announced = self.0.announced.lock().expect("announced blobs mutex poisoned");
            announced.entry(blob_hash).or_insert_with(|| AnnouncedBlob { storers: Vec::new() }).storers = storers;
        }

        metrics::counter!("dht.requests.total").increment(attempted as u64);
        metrics::counter!("dht.requests.success").increment(confirmed.len() as u64);

        AnnounceOutcome { confirmed, attempted }
    }

    /// Cancel every background task and release the bound socket. Safe to
    /// call more than once.
    pub async fn stop(&self) {
        if self.0.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "dht::node", "stopping");
        let _ = self.0.shutdown.send(());
        let tasks = {
            let mut tasks = self.0.tasks.lock().expect("node task list mutex poisoned");
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn store_to_peer(rpc: &RpcEndpoint, peer: PeerInfo, blob_hash: NodeId, own_node_id: NodeId, tcp_port: u16) -> bool {
    let Some(endpoint) = peer.udp_endpoint() else { return false };
    let token = match rpc.find_value(endpoint, blob_hash, 0).await {
        Ok(result) => result.token,
        Err(e) => {
            debug!(target: "dht::node", peer = %peer, error = %e, "findValue-for-token failed during announce");
            return false;
        }
    };
    let args = StoreArgs {
        blob_hash,
        token,
        tcp_port,
        original_publisher_id: own_node_id,
        age: 0,
        peer_port: endpoint.port(),
    };
    match rpc.store(endpoint, args).await {
        Ok(()) => true,
        Err(e) => {
            debug!(target: "dht::node", peer = %peer, error = %e, "store failed during announce");
            false
        }
    }
}

/// §4.8 Join: keep checking whether the routing table holds a peer. When
/// it doesn't, reseed from the persisted peer store or bootstrap hosts
/// and run a self-lookup to populate the table.
async fn run_join_loop(node: NodeHandle, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(JOIN_LOOP_TICK);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.recv() => {
                debug!(target: "dht::node", "join loop shutting down");
                return;
            }
        }

        let has_peers = {
            let table = node.0.routing_table.lock().await;
            !table.is_empty()
        };

        if has_peers {
            if !node.is_joined() {
                let _ = node.0.joined.send(true);
                info!(target: "dht::node", "joined dht");
            }
            continue;
        }

        if node.is_joined() {
            let _ = node.0.joined.send(false);
        }

        let mut seeds = node.0.peer_store.get_persisted_peers().await;
        if seeds.is_empty() {
            match resolve_bootstrap_peers(&node.0.config).await {
                Ok(resolved) => seeds = resolved,
                Err(_) => {
                    warn!(target: "dht::node", "bootstrap DNS resolution failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(BOOTSTRAP_DNS_RETRY) => {}
                        _ = shutdown.recv() => return,
                    }
                    continue;
                }
            }
        }

        if seeds.is_empty() {
            continue;
        }

        {
            let mut peer_manager = node.0.peer_manager.lock().expect("peer manager mutex poisoned");
            peer_manager.reset();
        }
        node.0.ping_queue.enqueue_maybe_ping(seeds.clone(), Duration::ZERO).await;
        let _ = node.peer_search_from(node.node_id(), 32, K * 2, seeds).await;
    }
}

async fn resolve_bootstrap_peers(config: &DhtConfig) -> DhtResult<Vec<PeerInfo>> {
    let mut resolved = Vec::new();
    for (host, port) in &config.bootstrap_peers {
        let lookup = tokio::net::lookup_host((host.as_str(), *port))
            .await
            .map_err(|e| DhtError::Transport(format!("resolving {host}: {e}")))?;
        for addr in lookup {
            if let SocketAddr::V4(v4) = addr {
                let ip: Ipv4Addr = *v4.ip();
                if let Ok(peer) = PeerInfo::with_options(None, ip, Some(*port), None, config.allow_localhost) {
                    resolved.push(peer);
                }
                break;
            }
        }
    }
    Ok(resolved)
}

/// §4.8 Refresh loop: run once immediately, then every `refresh_interval`.
async fn run_refresh_loop(node: NodeHandle, mut shutdown: broadcast::Receiver<()>) {
    run_refresh_pass(&node).await;
    let mut interval = tokio::time::interval(node.0.config.refresh_interval);
    interval.tick().await; // consume the immediate first tick; we already ran the pass above
    loop {
        tokio::select! {
            _ = interval.tick() => run_refresh_pass(&node).await,
            _ = shutdown.recv() => {
                debug!(target: "dht::node", "refresh loop shutting down");
                return;
            }
        }
    }
}

async fn run_refresh_pass(node: &NodeHandle) {
    node.0.data_store.lock().await.remove_expired_peers();

    let mut candidates: Vec<PeerInfo> = {
        let table = node.0.routing_table.lock().await;
        table.all_peers()
    };
    candidates.extend(node.0.data_store.lock().await.get_storing_contacts());
    {
        let announced = node.0.announced.lock().expect("announced blobs mutex poisoned");
        for blob in announced.values() {
            candidates.extend(blob.storers.iter().copied());
        }
    }

    let stale_buckets = {
        let table = node.0.routing_table.lock().await;
        table.get_refresh_list(0, false)
    };
    for midpoint in stale_buckets {
        let discovered = node.peer_search(midpoint, K, K * 2).await;
        candidates.extend(discovered);
        let mut table = node.0.routing_table.lock().await;
        let idx = table.kbucket_index(&midpoint);
        table.touch_kbucket_by_index(idx);
    }

    let mut seen = HashSet::new();
    candidates.retain(|p| seen.insert(p.udp_endpoint()));

    let to_ping: Vec<PeerInfo> = {
        let mut peer_manager = node.0.peer_manager.lock().expect("peer manager mutex poisoned");
        candidates
            .iter()
            .copied()
            .filter(|p| match p.udp_endpoint() {
                Some(endpoint) => peer_manager.peer_is_good(p.node_id(), endpoint) != Some(true),
                None => false,
            })
            .collect()
    };
    if !to_ping.is_empty() {
        node.0.ping_queue.enqueue_maybe_ping(to_ping, Duration::ZERO).await;
    }

    let peers = {
        let table = node.0.routing_table.lock().await;
        table.all_peers()
    };
    let active = {
        let mut peer_manager = node.0.peer_manager.lock().expect("peer manager mutex poisoned");
        peers
            .iter()
            .filter(|p| match p.udp_endpoint() {
                Some(endpoint) => peer_manager.peer_is_good(p.node_id(), endpoint) == Some(true),
                None => false,
            })
            .count()
    };
    node.0.peer_store.save_peers(peers.clone()).await;
    metrics::gauge!("dht.peers.total").set(peers.len() as f64);
    metrics::gauge!("dht.peers.active").set(active as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::clock::monotonic;
    use crate::dht::peer_store::InMemoryPeerStore;

    fn test_config(port: u16) -> DhtConfig {
        DhtConfig {
            bind_address: format!("127.0.0.1:{port}").parse().unwrap(),
            external_ip: Some(Ipv4Addr::new(127, 0, 0, 1)),
            tcp_port: Some(port + 1),
            bootstrap_peers: Vec::new(),
            rpc_timeout: Duration::from_millis(200),
            refresh_interval: Duration::from_secs(3600),
            republish_interval: Duration::from_secs(3600),
            peer_cache_size: 1024,
            allow_localhost: true,
            legacy_udp_port_guess: false,
        }
    }

    #[tokio::test]
    async fn join_binds_and_starts_unjoined() {
        let node = Node::join(NodeId::hash_string("n1"), monotonic(), test_config(0), Arc::new(InMemoryPeerStore::new()))
            .await
            .unwrap();
        assert!(!node.is_joined());
        assert!(node.local_addr().is_ok());
        node.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let node = Node::join(NodeId::hash_string("n2"), monotonic(), test_config(0), Arc::new(InMemoryPeerStore::new()))
            .await
            .unwrap();
        node.stop().await;
        node.stop().await;
    }

    #[tokio::test]
    async fn two_nodes_bootstrap_and_discover_each_other() {
        let store_a = Arc::new(InMemoryPeerStore::new());
        let store_b = Arc::new(InMemoryPeerStore::new());

        let node_a = Node::join(NodeId::hash_string("alice"), monotonic(), test_config(0), store_a).await.unwrap();
        let addr_a = match node_a.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            _ => panic!("expected ipv4"),
        };

        let mut config_b = test_config(0);
        config_b.bootstrap_peers = vec![("127.0.0.1".to_string(), addr_a.port())];
        let node_b = Node::join(NodeId::hash_string("bob"), monotonic(), config_b, store_b).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(node_b.is_joined() || node_a.is_joined());

        node_a.stop().await;
        node_b.stop().await;
    }
}
