//! Kademlia DHT core: routing table, iterative lookup, peer reputation,
//! announce store, and the UDP wire protocol that binds them together.
//!
//! [`Node`] is the composition root; most embedders only need that and
//! [`PeerStore`] (to persist routing-table peers across restarts).

pub mod clock;
pub mod codec;
pub mod constants;
pub mod data_store;
pub mod error;
pub mod finder;
pub mod kbucket;
pub mod node;
pub mod node_id;
pub mod peer_info;
pub mod peer_manager;
pub mod peer_store;
pub mod ping_queue;
pub mod routing_table;
pub mod rpc;

pub use clock::{Clock, MonotonicClock, SharedClock, VirtualClock};
pub use data_store::DataStore;
pub use error::{DhtError, DhtResult};
pub use finder::{IterativeFinder, IterativeNodeFinder, IterativeValueFinder, ValueLookupResult};
pub use node::{AnnounceOutcome, Node, NodeHandle};
pub use node_id::{Distance, NodeId};
pub use peer_info::PeerInfo;
pub use peer_manager::{PeerManager, Reputation};
pub use peer_store::{InMemoryPeerStore, PeerStore};
pub use routing_table::RoutingTable;
pub use rpc::RpcEndpoint;
