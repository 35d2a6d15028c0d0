//! Metrics collection for observability.
//!
//! Everything here records into the `metrics` crate's facade (§10.4);
//! export (a Prometheus scrape endpoint, OTLP push, etc.) is explicitly
//! out of scope and left to whatever the embedder wires on top.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

mod collector;

pub use collector::MetricsCollector;

/// Register every series this crate emits, with a human description.
/// Call once at startup, before any `record_*` call.
pub fn init_metrics() {
    describe_counter!("dht.requests.total", "Total DHT requests issued");
    describe_counter!("dht.requests.success", "Successful DHT requests");
    describe_counter!("dht.requests.failed", "Failed or timed-out DHT requests");
    describe_counter!("dht.requests.timeout", "DHT requests that timed out");
    describe_histogram!("dht.request.duration_ms", "DHT request round-trip time in milliseconds");

    describe_gauge!("dht.peers.active", "Number of peers currently classified Good");
    describe_gauge!("dht.peers.total", "Total number of known DHT peers");
    describe_gauge!("dht.bucket.entries", "Number of entries across all k-buckets");
    describe_counter!("dht.bucket.splits", "Number of k-bucket split operations");
    describe_counter!("dht.peers.marked_bad", "Number of peers classified Bad");

    describe_counter!("dht.announce.success", "Successful blob announcements");
    describe_counter!("dht.announce.failed", "Failed blob announcements");

    describe_counter!("network.messages.sent", "Number of network messages sent");
    describe_counter!("network.messages.received", "Number of network messages received");
    describe_histogram!("network.latency_ms", "Observed network round-trip latency in milliseconds");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

/// Record a histogram metric
pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    /// Create a new timer
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration
    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}

/// Metrics snapshot for reporting
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: std::time::SystemTime,
    pub dht_requests: u64,
    pub network_messages_sent: u64,
    pub network_messages_received: u64,
    pub active_peers: usize,
    pub known_peers: usize,
}

/// Background collection loop, ticking the in-process collector into the
/// `metrics` facade on an interval (`MetricsConfig::collection_interval`).
pub struct MetricsService {
    collector: Arc<RwLock<MetricsCollector>>,
    collection_interval: Duration,
}

impl MetricsService {
    /// Create a new metrics service
    pub fn new(collection_interval: Duration) -> Self {
        Self {
            collector: Arc::new(RwLock::new(MetricsCollector::new())),
            collection_interval,
        }
    }

    pub fn collector(&self) -> Arc<RwLock<MetricsCollector>> {
        Arc::clone(&self.collector)
    }

    /// Start the metrics collection service: periodically publish the
    /// collector's running totals as gauges.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.collection_interval);

        loop {
            interval.tick().await;
            let snapshot = self.snapshot().await;
            gauge!("dht.peers.active").set(snapshot.active_peers as f64);
            gauge!("dht.peers.total").set(snapshot.known_peers as f64);
        }
    }

    /// Get current metrics snapshot
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let collector = self.collector.read().await;
        collector.snapshot()
    }
}
