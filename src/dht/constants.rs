//! Normative protocol constants. Fixed by the wire protocol, not deployment
//! tunables — see [`crate::config::DhtConfig`] for the knobs an embedder
//! actually gets to choose.

use std::time::Duration;

/// SHA-384 output length in bytes.
pub const HASH_LENGTH: usize = 48;
pub const HASH_BITS: usize = HASH_LENGTH * 8;

/// Max peers per k-bucket, and the typical return count for lookups.
pub const K: usize = 8;
/// Max concurrent probes per iterative lookup.
pub const ALPHA: usize = 5;
/// Buckets below this index are split unconditionally on overflow.
pub const SPLIT_BUCKETS_UNDER_INDEX: usize = 1;
pub const REPLACEMENT_CACHE_SIZE: usize = 8;

pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);
pub const RPC_ATTEMPTS: usize = 5;
pub const RPC_ATTEMPTS_PRUNING_WINDOW: Duration = Duration::from_secs(600);
pub const ITERATIVE_LOOKUP_DELAY: Duration = Duration::from_millis(2500);
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
pub const REPLICATE_INTERVAL: Duration = REFRESH_INTERVAL;
pub const DATA_EXPIRATION: Duration = Duration::from_secs(86400);
pub const TOKEN_SECRET_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
pub const MAYBE_PING_DELAY: Duration = Duration::from_secs(300);
pub const CHECK_REFRESH_INTERVAL: Duration = Duration::from_secs(720);
pub const RPC_ID_LENGTH: usize = 20;
pub const PROTOCOL_VERSION: u8 = 1;
pub const MSG_SIZE_LIMIT: usize = 1400;

/// `node_id(48) || ip(4) || port(2)`, the compact triple layout used for
/// both UDP and TCP addresses.
pub const COMPACT_UDP_LEN: usize = HASH_LENGTH + 4 + 2;
pub const COMPACT_TCP_LEN: usize = COMPACT_UDP_LEN;

/// Default size of each PeerManager LRU cache.
pub const PEER_CACHE_SIZE: usize = 16_384;

/// Legacy TCP-to-UDP port guess window, see `DhtConfig::legacy_udp_port_guess`.
pub const LEGACY_PORT_GUESS_LOW: u16 = 3333;
pub const LEGACY_PORT_GUESS_HIGH: u16 = 3400;
pub const LEGACY_PORT_GUESS_BASE: u16 = 4444;
