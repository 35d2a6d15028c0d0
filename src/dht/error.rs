//! Error kinds that escape the DHT core to a caller. Per-probe failures
//! inside an iterative finder are *not* represented here: they are folded
//! into `PeerManager` state and observed only as the absence of a yield.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request to {0} timed out")]
    Timeout(std::net::SocketAddr),

    #[error("remote error [{class}]: {message}")]
    RemoteError { class: String, message: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("bencode codec error: {0}")]
    Codec(String),

    #[error("no usable external IP address is configured")]
    NoExternalIp,

    #[error("node is not bound to a UDP socket")]
    NotBound,
}

pub type DhtResult<T> = Result<T, DhtError>;
