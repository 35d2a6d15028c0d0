//! lumen-dht
//!
//! A Kademlia-style distributed hash table core: routing table, iterative
//! lookups, peer reputation tracking, and an announce/value datastore over
//! a bencoded UDP wire protocol. Transport, persistence, and process
//! wiring (CLI, daemonization) are left to embedders; see each module's
//! docs for the exact boundary.

pub mod config;
pub mod dht;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod shutdown;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::Config;
pub use dht::{
    AnnounceOutcome, Clock, DataStore, DhtError, DhtResult, Distance, InMemoryPeerStore,
    IterativeFinder, IterativeNodeFinder, IterativeValueFinder, MonotonicClock, Node, NodeHandle,
    NodeId, PeerInfo, PeerManager, PeerStore, Reputation, RoutingTable, RpcEndpoint, SharedClock,
    ValueLookupResult, VirtualClock,
};
pub use logging::{init_logging, LogLevel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_exports_are_reachable() {
        let _ = LogLevel::Info;
        let _ = Config::default();
    }
}
