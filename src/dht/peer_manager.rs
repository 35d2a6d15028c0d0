//! Peer reputation tracking: RPC failure/success history, node_id<->endpoint
//! bijection enforcement, and announce-token issuance.
//!
//! Every timestamped fact lives in a bounded LRU so a node that floods us
//! with distinct endpoints can't grow these maps without bound; eviction
//! just means we forget the oldest peer and re-derive its reputation from
//! scratch next time it replies.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use hashlink::LruCache;

use super::clock::SharedClock;
use super::constants::{CHECK_REFRESH_INTERVAL, PEER_CACHE_SIZE, RPC_ATTEMPTS_PRUNING_WINDOW, TOKEN_SECRET_REFRESH_INTERVAL};
use super::node_id::NodeId;

/// Tri-state peer reputation. `None` ("unknown") means insufficient history
/// to judge either way, and is distinct from a hard `Bad`.
pub type Reputation = Option<bool>;

pub struct PeerManager {
    clock: SharedClock,
    cache_size: usize,
    // (previous_failure, most_recent_failure)
    rpc_failures: LruCache<SocketAddrV4, (Option<Instant>, Instant)>,
    last_replied: LruCache<SocketAddrV4, Instant>,
    last_sent: LruCache<SocketAddrV4, Instant>,
    last_requested: LruCache<SocketAddrV4, Instant>,
    node_id_mapping: LruCache<SocketAddrV4, NodeId>,
    node_id_reverse_mapping: LruCache<NodeId, SocketAddrV4>,
    node_tokens: LruCache<SocketAddrV4, (String, Instant)>,
}

impl PeerManager {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_cache_size(clock, PEER_CACHE_SIZE)
    }

    pub fn with_cache_size(clock: SharedClock, cache_size: usize) -> Self {
        Self {
            clock,
            cache_size,
            rpc_failures: LruCache::new(cache_size),
            last_replied: LruCache::new(cache_size),
            last_sent: LruCache::new(cache_size),
            last_requested: LruCache::new(cache_size),
            node_id_mapping: LruCache::new(cache_size),
            node_id_reverse_mapping: LruCache::new(cache_size),
            node_tokens: LruCache::new(cache_size),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::with_cache_size(self.clock.clone(), self.cache_size);
    }

    pub fn report_failure(&mut self, endpoint: SocketAddrV4) {
        let now = self.clock.now();
        let previous = self
            .rpc_failures
            .remove(&endpoint)
            .map(|(_, most_recent)| most_recent);
        self.rpc_failures.insert(endpoint, (previous, now));
    }

    pub fn report_last_sent(&mut self, endpoint: SocketAddrV4) {
        self.last_sent.insert(endpoint, self.clock.now());
    }

    pub fn report_last_replied(&mut self, endpoint: SocketAddrV4) {
        self.last_replied.insert(endpoint, self.clock.now());
    }

    pub fn report_last_requested(&mut self, endpoint: SocketAddrV4) {
        self.last_requested.insert(endpoint, self.clock.now());
    }

    /// Enforce the node_id<->endpoint bijection: evict whichever stale
    /// mapping would otherwise contradict the new one, then insert both
    /// directions fresh.
    pub fn update_contact_triple(&mut self, node_id: NodeId, endpoint: SocketAddrV4) {
        if let Some(existing_id) = self.node_id_mapping.get(&endpoint).copied() {
            if existing_id != node_id {
                self.node_id_reverse_mapping.remove(&existing_id);
            }
        }
        if let Some(existing_endpoint) = self.node_id_reverse_mapping.get(&node_id).copied() {
            if existing_endpoint != endpoint {
                self.node_id_mapping.remove(&existing_endpoint);
            }
        }
        self.node_id_mapping.insert(endpoint, node_id);
        self.node_id_reverse_mapping.insert(node_id, endpoint);
    }

    pub fn get_node_id_for_endpoint(&mut self, endpoint: &SocketAddrV4) -> Option<NodeId> {
        self.node_id_mapping.get(endpoint).copied()
    }

    pub fn get_endpoint_for_node_id(&mut self, node_id: &NodeId) -> Option<SocketAddrV4> {
        self.node_id_reverse_mapping.get(node_id).copied()
    }

    /// Announce token for `endpoint`, refreshing it if the cached one is
    /// older than `TOKEN_SECRET_REFRESH_INTERVAL`.
    pub fn get_node_token(&mut self, endpoint: SocketAddrV4, mint: impl FnOnce() -> String) -> String {
        let now = self.clock.now();
        if let Some((token, issued)) = self.node_tokens.get(&endpoint) {
            if now.saturating_duration_since(*issued) < TOKEN_SECRET_REFRESH_INTERVAL {
                return token.clone();
            }
        }
        let token = mint();
        self.node_tokens.insert(endpoint, (token.clone(), now));
        token
    }

    pub fn update_token(&mut self, endpoint: SocketAddrV4, token: String) {
        self.node_tokens.insert(endpoint, (token, self.clock.now()));
    }

    pub fn clear_token(&mut self, endpoint: &SocketAddrV4) {
        self.node_tokens.remove(endpoint);
    }

    /// Drop rpc_failures and tokens old enough that they no longer inform
    /// current reputation.
    pub fn prune(&mut self) {
        let now = self.clock.now();
        let stale_failures: Vec<_> = self
            .rpc_failures
            .iter()
            .filter(|(_, (_, most_recent))| {
                now.saturating_duration_since(*most_recent) > RPC_ATTEMPTS_PRUNING_WINDOW
            })
            .map(|(endpoint, _)| *endpoint)
            .collect();
        for endpoint in stale_failures {
            self.rpc_failures.remove(&endpoint);
        }

        let stale_tokens: Vec<_> = self
            .node_tokens
            .iter()
            .filter(|(_, (_, issued))| {
                now.saturating_duration_since(*issued) > TOKEN_SECRET_REFRESH_INTERVAL
            })
            .map(|(endpoint, _)| *endpoint)
            .collect();
        for endpoint in stale_tokens {
            self.node_tokens.remove(&endpoint);
        }
    }

    /// The exact decision table from the upstream implementation. The
    /// bijection-mismatch check that upstream carries commented out is
    /// intentionally not reinstated here either: a node_id whose endpoint
    /// mapping has drifted is judged purely on timing, same as upstream.
    pub fn contact_triple_is_good(&mut self, node_id: Option<NodeId>, endpoint: SocketAddrV4) -> Reputation {
        node_id?;

        let now = self.clock.now();
        let delay_cutoff = now.checked_sub(CHECK_REFRESH_INTERVAL).unwrap_or(now);

        let (previous_failure, most_recent_failure) = self
            .rpc_failures
            .get(&endpoint)
            .copied()
            .map(|(p, m)| (p, Some(m)))
            .unwrap_or((None, None));
        let last_requested = self.last_requested.get(&endpoint).copied();
        let last_replied = self.last_replied.get(&endpoint).copied();

        if let (Some(most_recent_failure), Some(last_replied)) = (most_recent_failure, last_replied) {
            if last_replied > delay_cutoff && last_replied > most_recent_failure {
                return Some(true);
            } else if last_replied > most_recent_failure {
                return None;
            }
            return Some(false);
        } else if previous_failure.is_some() && most_recent_failure.map_or(false, |f| f > delay_cutoff) {
            return Some(false);
        } else if let Some(last_replied) = last_replied {
            if last_replied > delay_cutoff {
                return Some(true);
            }
        } else if let Some(last_requested) = last_requested {
            if last_requested > delay_cutoff {
                return None;
            }
        }
        None
    }

    pub fn peer_is_good(&mut self, node_id: Option<NodeId>, endpoint: SocketAddrV4) -> Reputation {
        self.contact_triple_is_good(node_id, endpoint)
    }
}
