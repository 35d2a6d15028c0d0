//! NodeId - the 384-bit identifier of a DHT participant, and the XOR metric on it.
//!
//! Every node, peer, blob hash, and RPC request id in this crate lives in the
//! same 48-byte keyspace. `NodeId` is the type that carries that invariant;
//! `Distance` is the XOR metric used to order candidates during a lookup.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};
use std::fmt;

use super::constants::HASH_LENGTH;

/// 48-byte (384-bit) DHT identifier, drawn from a SHA-384 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; HASH_LENGTH]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        NodeId(bytes)
    }

    /// Build a NodeId from a slice, requiring it be exactly HASH_LENGTH bytes.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        if data.len() != HASH_LENGTH {
            return None;
        }
        let mut bytes = [0u8; HASH_LENGTH];
        bytes.copy_from_slice(data);
        Some(NodeId(bytes))
    }

    /// Hash arbitrary data through SHA-384.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Sha384::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut bytes = [0u8; HASH_LENGTH];
        bytes.copy_from_slice(&digest);
        NodeId(bytes)
    }

    pub fn hash_string(s: &str) -> Self {
        Self::hash(s.as_bytes())
    }

    /// Generate a fresh id from a CSPRNG, hashed through SHA-384 so the
    /// output distribution matches the bucket-splitting assumptions.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::hash(&seed)
    }

    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut result = [0u8; HASH_LENGTH];
        for i in 0..HASH_LENGTH {
            result[i] = self.0[i] ^ other.0[i];
        }
        Distance(result)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// `distance(x, key) < distance(y, key)`, i.e. is `self` closer to `key` than `other`.
    pub fn is_closer(&self, other: &NodeId, key: &NodeId) -> bool {
        self.distance(key) < other.distance(key)
    }

    #[cfg(test)]
    pub fn random() -> Self {
        Self::generate()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl From<[u8; HASH_LENGTH]> for NodeId {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        NodeId(bytes)
    }
}

impl From<NodeId> for [u8; HASH_LENGTH] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// XOR distance between two NodeIds, a 384-bit unsigned integer in big-endian form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance([u8; HASH_LENGTH]);

impl Distance {
    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Distance(bytes)
    }

    pub fn zero() -> Self {
        Distance([0u8; HASH_LENGTH])
    }

    pub fn max_value() -> Self {
        Distance([0xFFu8; HASH_LENGTH])
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    /// Big-endian unsigned subtraction, saturating at zero.
    pub fn saturating_sub(&self, other: &Distance) -> Distance {
        let mut result = [0u8; HASH_LENGTH];
        let mut borrow = 0i16;
        for i in (0..HASH_LENGTH).rev() {
            let a = self.0[i] as i16;
            let b = other.0[i] as i16 + borrow;
            if a < b {
                result[i] = (a + 256 - b) as u8;
                borrow = 1;
            } else {
                result[i] = (a - b) as u8;
                borrow = 0;
            }
        }
        if borrow != 0 {
            return Distance::zero();
        }
        Distance(result)
    }

    /// Big-endian unsigned division by two.
    pub fn halve(&self) -> Distance {
        let mut result = [0u8; HASH_LENGTH];
        let mut carry = 0u8;
        for i in 0..HASH_LENGTH {
            let cur = self.0[i];
            result[i] = (cur >> 1) | (carry << 7);
            carry = cur & 1;
        }
        Distance(result)
    }

    /// XOR `self` back against `parent`, recovering an absolute NodeId from
    /// a distance value. Self-inverse since XOR distance is its own inverse.
    pub fn to_id_from(&self, parent: &NodeId) -> NodeId {
        let mut bytes = [0u8; HASH_LENGTH];
        for i in 0..HASH_LENGTH {
            bytes[i] = self.0[i] ^ parent.0[i];
        }
        NodeId(bytes)
    }

    /// Position (0 = most significant) of the highest set bit, or HASH_LENGTH*8
    /// if the distance is zero. Used for the midpoint-split bucket math.
    pub fn leading_zeros(&self) -> u32 {
        let mut count = 0;
        for byte in &self.0 {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros();
                break;
            }
        }
        count
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
