//! Configuration for a lumen-dht node.
//!
//! Wire-protocol constants (§6.1) are fixed and live in
//! [`crate::dht::constants`]; everything an embedder actually chooses —
//! where to bind, who to bootstrap from, how long to wait for a reply —
//! lives here.

use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod error;


pub use error::ConfigError;

use crate::dht::constants::{PEER_CACHE_SIZE, REFRESH_INTERVAL, REPLICATE_INTERVAL, RPC_TIMEOUT};

/// Top-level configuration for a node process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dht: DhtConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Deployment knobs for the DHT core (§10.3). Nothing here changes wire
/// compatibility; it only changes how this node behaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Local UDP socket to bind for the RPC endpoint.
    pub bind_address: SocketAddr,

    /// The IPv4 address other nodes should use to reach us, if known in
    /// advance (behind static NAT, or a public box). When absent, the
    /// node learns nothing from inbound traffic about its own address —
    /// that discovery is explicitly out of scope (§1 Non-goals).
    pub external_ip: Option<Ipv4Addr>,

    /// TCP port advertised to peers for blob retrieval after a `store`.
    /// Absent means this node never announces blobs.
    pub tcp_port: Option<u16>,

    /// Bootstrap contact points, resolved via DNS at join time (§6.3);
    /// `(host, udp_port)` pairs rather than pre-resolved addresses so a
    /// hostname surviving an IP change still works.
    pub bootstrap_peers: Vec<(String, u16)>,

    /// Per-request RPC timeout (§6.1's RPC_TIMEOUT is the wire default;
    /// this lets an embedder widen it for a high-latency deployment).
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    /// How often the refresh loop runs (§4.8).
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// How often announced blobs are republished to newly-discovered
    /// storers (mirrors `REPLICATE_INTERVAL`).
    #[serde(with = "humantime_serde")]
    pub republish_interval: Duration,

    /// Capacity of each `PeerManager` LRU (reputation, token, bijection
    /// caches all share this bound).
    pub peer_cache_size: usize,

    /// Accept loopback/private addresses as valid peers. Only meaningful
    /// for local multi-node testing; a production deployment keeps this
    /// `false` so a misbehaving peer can't advertise an internal address.
    pub allow_localhost: bool,

    /// Decided in DESIGN.md: when a peer's `findValue` response carries a
    /// TCP port far outside the normal ephemeral range, guess that it
    /// reused its UDP port for TCP rather than discarding the contact.
    /// Off by default; some deployments want the leniency, most don't.
    pub legacy_udp_port_guess: bool,
}

/// Logging configuration, layered over [`crate::logging::LogConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

/// Metrics configuration. Prometheus/OTLP export wiring is out of scope
/// (§1 Non-goals); this only controls whether the in-process `metrics`
/// facade is initialized at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub collection_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dht: DhtConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:6881".parse().unwrap(),
            external_ip: None,
            tcp_port: None,
            bootstrap_peers: Vec::new(),
            rpc_timeout: RPC_TIMEOUT,
            refresh_interval: REFRESH_INTERVAL,
            republish_interval: REPLICATE_INTERVAL,
            peer_cache_size: PEER_CACHE_SIZE,
            allow_localhost: false,
            legacy_udp_port_guess: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collection_interval: Duration::from_secs(15),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables follow the pattern `DHT_<SECTION>_<KEY>`,
    /// e.g. `DHT_BIND_ADDRESS=0.0.0.0:6881`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(addr) = env::var("DHT_BIND_ADDRESS") {
            config.dht.bind_address = addr.parse().map_err(|e| ConfigError::InvalidValue(format!("bind_address: {e}")))?;
        }
        if let Ok(ip) = env::var("DHT_EXTERNAL_IP") {
            config.dht.external_ip = Some(ip.parse().map_err(|e| ConfigError::InvalidValue(format!("external_ip: {e}")))?);
        }
        if let Ok(port) = env::var("DHT_TCP_PORT") {
            config.dht.tcp_port = Some(port.parse().map_err(|e| ConfigError::InvalidValue(format!("tcp_port: {e}")))?);
        }
        if let Ok(peers) = env::var("DHT_BOOTSTRAP_PEERS") {
            config.dht.bootstrap_peers = parse_bootstrap_peers(&peers)?;
        }
        if let Ok(timeout) = env::var("DHT_RPC_TIMEOUT") {
            config.dht.rpc_timeout =
                humantime::parse_duration(&timeout).map_err(|e| ConfigError::InvalidValue(format!("rpc_timeout: {e}")))?;
        }
        if let Ok(interval) = env::var("DHT_REFRESH_INTERVAL") {
            config.dht.refresh_interval = humantime::parse_duration(&interval)
                .map_err(|e| ConfigError::InvalidValue(format!("refresh_interval: {e}")))?;
        }
        if let Ok(cache_size) = env::var("DHT_PEER_CACHE_SIZE") {
            config.dht.peer_cache_size =
                cache_size.parse().map_err(|e| ConfigError::InvalidValue(format!("peer_cache_size: {e}")))?;
        }
        if let Ok(allow) = env::var("DHT_ALLOW_LOCALHOST") {
            config.dht.allow_localhost = allow.parse().map_err(|e| ConfigError::InvalidValue(format!("allow_localhost: {e}")))?;
        }
        if let Ok(guess) = env::var("DHT_LEGACY_UDP_PORT_GUESS") {
            config.dht.legacy_udp_port_guess =
                guess.parse().map_err(|e| ConfigError::InvalidValue(format!("legacy_udp_port_guess: {e}")))?;
        }
        if let Ok(level) = env::var("DHT_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(json) = env::var("DHT_LOG_JSON") {
            config.logging.json_format = json.parse().map_err(|e| ConfigError::InvalidValue(format!("log json flag: {e}")))?;
        }
        if let Ok(enabled) = env::var("DHT_METRICS_ENABLED") {
            config.metrics.enabled = enabled.parse().map_err(|e| ConfigError::InvalidValue(format!("metrics enabled flag: {e}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dht.peer_cache_size == 0 {
            return Err(ConfigError::ValidationFailed("peer_cache_size must be greater than 0".to_string()));
        }
        if self.dht.rpc_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed("rpc_timeout must be greater than 0".to_string()));
        }
        if self.dht.refresh_interval.is_zero() {
            return Err(ConfigError::ValidationFailed("refresh_interval must be greater than 0".to_string()));
        }
        for (host, _) in &self.dht.bootstrap_peers {
            if host.is_empty() {
                return Err(ConfigError::ValidationFailed("bootstrap peer host must not be empty".to_string()));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!("invalid log level: {}", self.logging.level)));
        }

        Ok(())
    }
}

fn parse_bootstrap_peers(raw: &str) -> Result<Vec<(String, u16)>, ConfigError> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|entry| {
            let (host, port) = entry
                .trim()
                .rsplit_once(':')
                .ok_or_else(|| ConfigError::InvalidValue(format!("bootstrap peer missing port: {entry}")))?;
            let port: u16 = port.parse().map_err(|e| ConfigError::InvalidValue(format!("bootstrap peer port: {e}")))?;
            Ok((host.to_string(), port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_peer_cache_size() {
        let mut config = Config::default();
        config.dht.peer_cache_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_bootstrap_peers_from_env_format() {
        let parsed = parse_bootstrap_peers("router.example.com:6881, 10.0.0.1:6881").unwrap();
        assert_eq!(parsed, vec![("router.example.com".to_string(), 6881), ("10.0.0.1".to_string(), 6881)]);
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.dht.bind_address, config.dht.bind_address);
    }
}
