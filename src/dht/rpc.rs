//! Request/response correlation over a single UDP socket: the component
//! that turns the bencode envelope into awaitable calls, services inbound
//! requests from `RoutingTable`/`DataStore`, and issues/validates the
//! rotating `store` tokens.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::RngCore;
use serde_bencode::value::Value;
use sha2::{Digest, Sha384};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};
use tracing::{debug, trace, warn};

use super::clock::SharedClock;
use super::codec::{
    decode_find_value_result, decode_message, decode_peer_udp, encode_error, encode_request, encode_response,
    find_node_result, find_value_result, generate_rpc_id, ping_result, store_ok_result, FindValueResult, Message,
    Method, RpcId, StoreArgs,
};
use super::constants::{K, MSG_SIZE_LIMIT, PROTOCOL_VERSION, RPC_TIMEOUT, TOKEN_SECRET_REFRESH_INTERVAL};
use super::data_store::DataStore;
use super::error::{DhtError, DhtResult};
use super::node_id::NodeId;
use super::peer_info::{is_valid_public_ipv4, PeerInfo};
use super::peer_manager::PeerManager;
use super::ping_queue::{PingQueue, Pinger};
use super::routing_table::RoutingTable;

fn random_secret() -> Vec<u8> {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes.to_vec()
}

fn derive_token(secret: &[u8], ip: Ipv4Addr) -> Vec<u8> {
    let mut hasher = Sha384::new();
    hasher.update(secret);
    hasher.update(ip.octets());
    hasher.finalize()[..20].to_vec()
}

/// Stateless token issuance: a token is a keyed hash of the requester's IP
/// under a secret that rotates every `TOKEN_SECRET_REFRESH_INTERVAL`. Two
/// generations stay valid so a token handed out just before a rotation
/// still verifies in the `store` that follows it.
struct TokenSecrets {
    clock: SharedClock,
    current: (Vec<u8>, Instant),
    previous: Option<(Vec<u8>, Instant)>,
}

impl TokenSecrets {
    fn new(clock: SharedClock) -> Self {
        let now = clock.now();
        Self { current: (random_secret(), now), previous: None, clock }
    }

    fn rotate_if_stale(&mut self) {
        let now = self.clock.now();
        if now.saturating_duration_since(self.current.1) >= TOKEN_SECRET_REFRESH_INTERVAL {
            let stale = std::mem::replace(&mut self.current, (random_secret(), now));
            self.previous = Some(stale);
        }
    }

    fn issue(&mut self, ip: Ipv4Addr) -> Vec<u8> {
        self.rotate_if_stale();
        derive_token(&self.current.0, ip)
    }

    fn validate(&mut self, ip: Ipv4Addr, token: &[u8]) -> bool {
        self.rotate_if_stale();
        derive_token(&self.current.0, ip) == token
            || self.previous.as_ref().is_some_and(|(secret, _)| derive_token(secret, ip) == token)
    }
}

type PendingResponse = oneshot::Sender<Result<Value, DhtError>>;

pub struct RpcEndpoint {
    socket: UdpSocket,
    clock: SharedClock,
    own_node_id: NodeId,
    protocol_version: u8,
    allow_localhost: bool,
    outstanding: AsyncMutex<HashMap<RpcId, PendingResponse>>,
    token_secrets: StdMutex<TokenSecrets>,
    routing_table: Arc<AsyncMutex<RoutingTable>>,
    data_store: Arc<AsyncMutex<DataStore>>,
    peer_manager: Arc<StdMutex<PeerManager>>,
    ping_queue: std::sync::OnceLock<Arc<PingQueue>>,
}

impl RpcEndpoint {
    pub async fn bind(
        bind_address: SocketAddr,
        own_node_id: NodeId,
        clock: SharedClock,
        routing_table: Arc<AsyncMutex<RoutingTable>>,
        data_store: Arc<AsyncMutex<DataStore>>,
        peer_manager: Arc<StdMutex<PeerManager>>,
        allow_localhost: bool,
    ) -> DhtResult<Arc<Self>> {
        let socket = UdpSocket::bind(bind_address).await.map_err(|e| DhtError::Transport(e.to_string()))?;
        Ok(Arc::new(Self {
            socket,
            token_secrets: StdMutex::new(TokenSecrets::new(clock.clone())),
            clock,
            own_node_id,
            protocol_version: PROTOCOL_VERSION,
            allow_localhost,
            outstanding: AsyncMutex::new(HashMap::new()),
            routing_table,
            data_store,
            peer_manager,
            ping_queue: std::sync::OnceLock::new(),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wired up after construction to break the `RpcEndpoint <-> PingQueue`
    /// cycle (the queue needs a `Pinger`, which this endpoint implements).
    pub fn set_ping_queue(&self, queue: Arc<PingQueue>) {
        let _ = self.ping_queue.set(queue);
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, from)) => {
                            let datagram = buf[..n].to_vec();
                            let this = self.clone();
                            tokio::spawn(async move { this.handle_datagram(&datagram, from).await; });
                        }
                        Err(e) => warn!(target: "dht::rpc", error = %e, "recv_from failed"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!(target: "dht::rpc", "shutting down");
                    return;
                }
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let SocketAddr::V4(from_v4) = from else {
            trace!(target: "dht::rpc", "dropping datagram from non-IPv4 peer");
            return;
        };
        match decode_message(data) {
            Ok(Message::Request(request)) => self.handle_request(from_v4, request).await,
            Ok(Message::Response { request_id, result }) => self.complete(request_id, Ok(result)).await,
            Ok(Message::Error { request_id, class, message }) => {
                self.complete(request_id, Err(DhtError::RemoteError { class, message })).await
            }
            Err(e) => trace!(target: "dht::rpc", error = %e, from = %from_v4, "undecodable datagram"),
        }
    }

    async fn complete(&self, request_id: RpcId, result: Result<Value, DhtError>) {
        if let Some(sender) = self.outstanding.lock().await.remove(&request_id) {
            let _ = sender.send(result);
        }
    }

    async fn handle_request(&self, from: SocketAddrV4, request: super::codec::Request) {
        if !is_valid_public_ipv4(from.ip(), self.allow_localhost) {
            trace!(target: "dht::rpc", %from, "dropping request from non-public address");
            return;
        }
        self.peer_manager.lock().expect("peer manager mutex poisoned").report_last_requested(from);

        let result = match &request.method {
            Method::Ping => Ok(ping_result()),
            Method::FindNode(key) => {
                let peers = {
                    let table = self.routing_table.lock().await;
                    table.find_close_peers(key, K, request.sender_node_id)
                };
                Ok(find_node_result(&peers))
            }
            Method::FindValue(key, page) => Ok(self.build_find_value_result(key, *page, from).await),
            Method::Store(args) => self.handle_store(args, from, request.sender_node_id).await.map(|_| store_ok_result()),
        };

        match result {
            Ok(value) => self.send_response(request.request_id, from, value).await,
            Err(e) => self.send_error(request.request_id, from, &e).await,
        }

        self.admit_or_queue_sender(from, request.sender_node_id).await;
    }

    async fn build_find_value_result(&self, key: &NodeId, page: u32, from: SocketAddrV4) -> Value {
        let token = self.token_secrets.lock().expect("token secret mutex poisoned").issue(*from.ip());
        let contacts = {
            let table = self.routing_table.lock().await;
            table.find_close_peers(key, K, None)
        };
        let store = self.data_store.lock().await;
        if store.has_peers_for_blob(key) {
            let all = store.get_peers_for_blob(key);
            let pages = super::codec::page_count(all.len(), K);
            let start = page as usize * K;
            let blob_peers = if start < all.len() {
                Some(all.iter().skip(start).take(K).copied().collect::<Vec<_>>())
            } else {
                None
            };
            find_value_result(key, &contacts, &token, pages, blob_peers.as_deref(), self.protocol_version)
        } else {
            find_value_result(key, &contacts, &token, 1, None, self.protocol_version)
        }
    }

    async fn handle_store(&self, args: &StoreArgs, from: SocketAddrV4, sender_node_id: Option<NodeId>) -> DhtResult<()> {
        let valid = self.token_secrets.lock().expect("token secret mutex poisoned").validate(*from.ip(), &args.token);
        if !valid {
            return Err(DhtError::Validation("invalid or expired store token".to_string()));
        }
        let storer_id = sender_node_id.unwrap_or(args.original_publisher_id);
        let peer = PeerInfo::with_options(Some(storer_id), *from.ip(), Some(from.port()), Some(args.tcp_port), self.allow_localhost)
            .map_err(|e| DhtError::Validation(e.to_string()))?;
        self.data_store.lock().await.add_peer_to_blob(args.blob_hash, peer);
        Ok(())
    }

    /// Good senders go straight into the routing table; everyone else is
    /// queued for a PingQueue probe before we'd trust them with a slot.
    async fn admit_or_queue_sender(&self, from: SocketAddrV4, sender_node_id: Option<NodeId>) {
        let Some(sender_id) = sender_node_id else { return };
        let reputation = {
            let mut pm = self.peer_manager.lock().expect("peer manager mutex poisoned");
            pm.update_contact_triple(sender_id, from);
            pm.peer_is_good(Some(sender_id), from)
        };
        let Ok(peer) = PeerInfo::with_options(Some(sender_id), *from.ip(), Some(from.port()), None, self.allow_localhost) else {
            return;
        };
        if reputation == Some(true) {
            self.routing_table.lock().await.add_peer(peer);
        } else if let Some(queue) = self.ping_queue.get() {
            queue.enqueue_maybe_ping(vec![peer], Duration::ZERO).await;
        }
    }

    async fn send_response(&self, request_id: RpcId, to: SocketAddrV4, result: Value) {
        match encode_response(request_id, result) {
            Ok(bytes) => self.send_datagram(&bytes, to).await,
            Err(e) => warn!(target: "dht::rpc", error = %e, "failed to encode response"),
        }
    }

    async fn send_error(&self, request_id: RpcId, to: SocketAddrV4, error: &DhtError) {
        let (class, message) = match error {
            DhtError::Validation(msg) => ("ValueError".to_string(), msg.clone()),
            other => ("InternalError".to_string(), other.to_string()),
        };
        match encode_error(request_id, &class, &message) {
            Ok(bytes) => self.send_datagram(&bytes, to).await,
            Err(e) => warn!(target: "dht::rpc", error = %e, "failed to encode error response"),
        }
    }

    async fn send_datagram(&self, bytes: &[u8], to: SocketAddrV4) {
        if bytes.len() > MSG_SIZE_LIMIT {
            warn!(target: "dht::rpc", size = bytes.len(), "outbound datagram exceeds MSG_SIZE_LIMIT");
        }
        if let Err(e) = self.socket.send_to(bytes, SocketAddr::V4(to)).await {
            warn!(target: "dht::rpc", error = %e, %to, "send_to failed");
        }
    }

    async fn call(&self, endpoint: SocketAddrV4, method: Method) -> DhtResult<Value> {
        let request_id = generate_rpc_id();
        let (tx, rx) = oneshot::channel();
        self.outstanding.lock().await.insert(request_id, tx);

        let request = super::codec::Request {
            request_id,
            method,
            protocol_version: self.protocol_version,
            sender_node_id: Some(self.own_node_id),
        };
        let bytes = match encode_request(&request) {
            Ok(b) => b,
            Err(e) => {
                self.outstanding.lock().await.remove(&request_id);
                return Err(DhtError::Codec(e.to_string()));
            }
        };
        if bytes.len() > MSG_SIZE_LIMIT {
            self.outstanding.lock().await.remove(&request_id);
            return Err(DhtError::Codec("request exceeds MSG_SIZE_LIMIT".to_string()));
        }
        if let Err(e) = self.socket.send_to(&bytes, SocketAddr::V4(endpoint)).await {
            self.outstanding.lock().await.remove(&request_id);
            return Err(DhtError::Transport(e.to_string()));
        }
        self.peer_manager.lock().expect("peer manager mutex poisoned").report_last_sent(endpoint);

        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(Ok(value))) => {
                self.peer_manager.lock().expect("peer manager mutex poisoned").report_last_replied(endpoint);
                Ok(value)
            }
            Ok(Ok(Err(remote_err))) => {
                self.peer_manager.lock().expect("peer manager mutex poisoned").report_failure(endpoint);
                Err(remote_err)
            }
            Ok(Err(_closed)) => {
                self.peer_manager.lock().expect("peer manager mutex poisoned").report_failure(endpoint);
                Err(DhtError::Transport("response channel dropped".to_string()))
            }
            Err(_elapsed) => {
                self.outstanding.lock().await.remove(&request_id);
                self.peer_manager.lock().expect("peer manager mutex poisoned").report_failure(endpoint);
                Err(DhtError::Timeout(SocketAddr::V4(endpoint)))
            }
        }
    }

    pub async fn ping_endpoint(&self, endpoint: SocketAddrV4) -> DhtResult<()> {
        match self.call(endpoint, Method::Ping).await? {
            Value::Bytes(b) if b == b"pong" => Ok(()),
            _ => Err(DhtError::Validation("unexpected ping response".to_string())),
        }
    }

    pub async fn find_node(&self, endpoint: SocketAddrV4, key: NodeId) -> DhtResult<Vec<PeerInfo>> {
        let result = self.call(endpoint, Method::FindNode(key)).await?;
        let Value::List(list) = result else {
            return Err(DhtError::Validation("findNode response is not a list".to_string()));
        };
        let mut peers = Vec::with_capacity(list.len());
        for item in list {
            let Value::Bytes(bytes) = item else { continue };
            match decode_peer_udp(&bytes, self.allow_localhost) {
                Ok(peer) => peers.push(peer),
                Err(_) => self.peer_manager.lock().expect("peer manager mutex poisoned").report_failure(endpoint),
            }
        }
        Ok(peers)
    }

    pub async fn find_value(&self, endpoint: SocketAddrV4, key: NodeId, page: u32) -> DhtResult<FindValueResult> {
        let result = self.call(endpoint, Method::FindValue(key, page)).await?;
        decode_find_value_result(&key, &result, self.allow_localhost).map_err(|e| DhtError::Codec(e.to_string()))
    }

    pub async fn store(&self, endpoint: SocketAddrV4, args: StoreArgs) -> DhtResult<()> {
        match self.call(endpoint, Method::Store(args)).await? {
            Value::Bytes(b) if b == b"OK" => Ok(()),
            _ => Err(DhtError::Validation("store was not acknowledged".to_string())),
        }
    }

    pub fn issue_token(&self, ip: Ipv4Addr) -> Vec<u8> {
        self.token_secrets.lock().expect("token secret mutex poisoned").issue(ip)
    }

    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }
}

#[async_trait]
impl Pinger for RpcEndpoint {
    async fn ping(&self, peer: PeerInfo) -> bool {
        match peer.udp_endpoint() {
            Some(endpoint) => self.ping_endpoint(endpoint).await.is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::clock::monotonic;
    use std::net::Ipv4Addr;

    async fn endpoint(node_id: NodeId) -> Arc<RpcEndpoint> {
        let clock = monotonic();
        let routing_table = Arc::new(AsyncMutex::new(RoutingTable::new(node_id, clock.clone())));
        let peer_manager = Arc::new(StdMutex::new(PeerManager::new(clock.clone())));
        let data_store = Arc::new(AsyncMutex::new(DataStore::new(clock.clone(), peer_manager.clone())));
        RpcEndpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            node_id,
            clock,
            routing_table,
            data_store,
            peer_manager,
            true,
        )
        .await
        .unwrap()
    }

    fn spawn_recv_loop(endpoint: &Arc<RpcEndpoint>) -> broadcast::Sender<()> {
        let (tx, rx) = broadcast::channel(1);
        tokio::spawn(endpoint.clone().run(rx));
        tx
    }

    fn socket_addr_v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(v4) => v4,
            _ => panic!("expected ipv4"),
        }
    }

    #[tokio::test]
    async fn ping_round_trips_between_two_endpoints() {
        let a = endpoint(NodeId::hash_string("a")).await;
        let b = endpoint(NodeId::hash_string("b")).await;
        let _a_guard = spawn_recv_loop(&a);
        let _b_guard = spawn_recv_loop(&b);

        let b_addr = socket_addr_v4(b.local_addr().unwrap());
        a.ping_endpoint(b_addr).await.unwrap();
    }

    #[tokio::test]
    async fn find_node_returns_peers_known_to_responder() {
        let a = endpoint(NodeId::hash_string("a")).await;
        let b = endpoint(NodeId::hash_string("b")).await;
        let _a_guard = spawn_recv_loop(&a);
        let _b_guard = spawn_recv_loop(&b);

        let seeded = PeerInfo::with_options(
            Some(NodeId::hash_string("seeded")),
            Ipv4Addr::new(127, 0, 0, 1),
            Some(9999),
            None,
            true,
        )
        .unwrap();
        b.routing_table.lock().await.add_peer(seeded);

        let b_addr = socket_addr_v4(b.local_addr().unwrap());
        let found = a.find_node(b_addr, NodeId::hash_string("target")).await.unwrap();
        assert!(found.iter().any(|p| *p == seeded));
    }

    #[tokio::test]
    async fn store_without_token_is_rejected() {
        let a = endpoint(NodeId::hash_string("a")).await;
        let b = endpoint(NodeId::hash_string("b")).await;
        let _a_guard = spawn_recv_loop(&a);
        let _b_guard = spawn_recv_loop(&b);

        let b_addr = socket_addr_v4(b.local_addr().unwrap());
        let args = StoreArgs {
            blob_hash: NodeId::hash_string("blob"),
            token: b"bogus".to_vec(),
            tcp_port: 3333,
            original_publisher_id: NodeId::hash_string("a"),
            age: 0,
            peer_port: 3333,
        };
        let result = a.store(b_addr, args).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn store_with_valid_token_is_accepted_and_findable() {
        let a = endpoint(NodeId::hash_string("a")).await;
        let b = endpoint(NodeId::hash_string("b")).await;
        let _a_guard = spawn_recv_loop(&a);
        let _b_guard = spawn_recv_loop(&b);

        let b_addr = socket_addr_v4(b.local_addr().unwrap());
        let a_addr = socket_addr_v4(a.local_addr().unwrap());
        let blob_hash = NodeId::hash_string("blob");

        let fv = a.find_value(b_addr, blob_hash, 0).await.unwrap();
        let args = StoreArgs {
            blob_hash,
            token: fv.token,
            tcp_port: 4444,
            original_publisher_id: NodeId::hash_string("a"),
            age: 0,
            peer_port: 4444,
        };
        a.store(b_addr, args).await.unwrap();

        let fv2 = a.find_value(b_addr, blob_hash, 0).await.unwrap();
        assert!(fv2.blob_peers.is_some());
        let _ = a_addr;
    }
}
