//! Metrics collector implementation

use super::MetricsSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector for aggregating metrics data
#[derive(Debug)]
pub struct MetricsCollector {
    dht_requests: AtomicU64,
    network_messages_sent: AtomicU64,
    network_messages_received: AtomicU64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            dht_requests: AtomicU64::new(0),
            network_messages_sent: AtomicU64::new(0),
            network_messages_received: AtomicU64::new(0),
        }
    }

    /// Increment DHT requests counter
    pub fn inc_dht_requests(&self) {
        self.dht_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment network messages sent counter
    pub fn inc_network_sent(&self) {
        self.network_messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment network messages received counter
    pub fn inc_network_received(&self) {
        self.network_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: std::time::SystemTime::now(),
            dht_requests: self.dht_requests.load(Ordering::Relaxed),
            network_messages_sent: self.network_messages_sent.load(Ordering::Relaxed),
            network_messages_received: self.network_messages_received.load(Ordering::Relaxed),
            active_peers: 0,  // populated from PeerManager by the caller
            known_peers: 0,   // populated from RoutingTable by the caller
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
