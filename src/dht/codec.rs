//! Bencode wire framing: the four RPC methods, compact address packing, and
//! the request/response/error envelope described in the wire protocol.
//!
//! Every datagram is one bencoded value. We lean on `serde_bencode`'s
//! `Value` rather than per-message structs because the envelope's third
//! element is polymorphic (arg list for requests, arbitrary result for
//! responses, `[class, message]` for errors) and the wire dialect requires
//! dict keys sorted lexicographically, which `Value`'s own `Dict` already
//! guarantees on encode.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use rand::RngCore;
use serde_bencode::value::Value;
use thiserror::Error;

use super::constants::{COMPACT_TCP_LEN, COMPACT_UDP_LEN, RPC_ID_LENGTH};
use super::node_id::NodeId;
use super::peer_info::{PeerInfo, PeerInfoError};

pub type RpcId = [u8; RPC_ID_LENGTH];

pub fn generate_rpc_id() -> RpcId {
    let mut id = [0u8; RPC_ID_LENGTH];
    rand::rng().fill_bytes(&mut id);
    id
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bencode error: {0}")]
    Bencode(String),
    #[error("malformed message envelope: {0}")]
    InvalidShape(&'static str),
    #[error("unknown RPC method: {0}")]
    UnknownMethod(String),
    #[error("invalid compact address: {0}")]
    InvalidPeer(#[from] PeerInfoError),
    #[error("message is {0} bytes, exceeding MSG_SIZE_LIMIT")]
    TooLarge(usize),
}

const TAG_REQUEST: i64 = 0;
const TAG_RESPONSE: i64 = 1;
const TAG_ERROR: i64 = 2;

const METHOD_PING: &[u8] = b"ping";
const METHOD_STORE: &[u8] = b"store";
const METHOD_FIND_NODE: &[u8] = b"findNode";
const METHOD_FIND_VALUE: &[u8] = b"findValue";

const KEY_PROTOCOL_VERSION: &[u8] = b"protocolVersion";
const KEY_NODE_ID: &[u8] = b"nodeId";
const KEY_CONTACTS: &[u8] = b"contacts";
const KEY_TOKEN: &[u8] = b"token";
const KEY_PAGES: &[u8] = b"p";

#[derive(Debug, Clone, PartialEq)]
pub struct StoreArgs {
    pub blob_hash: NodeId,
    pub token: Vec<u8>,
    pub tcp_port: u16,
    pub original_publisher_id: NodeId,
    pub age: i64,
    pub peer_port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    Ping,
    Store(StoreArgs),
    FindNode(NodeId),
    FindValue(NodeId, u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub request_id: RpcId,
    pub method: Method,
    pub protocol_version: u8,
    /// Carried as an extension field in `sender_args` under `nodeId`, since
    /// the envelope proper has no dedicated sender-identity slot. Absent
    /// only for the very first message from a node we've never heard the
    /// id of (a bootstrap seed advertised by address alone).
    pub sender_node_id: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindValueResult {
    pub contacts: Vec<CompactUdpAddress>,
    pub token: Vec<u8>,
    pub pages: i64,
    /// Present only when the responder actually holds peers for the key.
    pub blob_peers: Option<Vec<CompactTcpAddress>>,
    pub protocol_version: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response { request_id: RpcId, result: Value },
    Error { request_id: RpcId, class: String, message: String },
}

/// `node_id(48) || ip(4) || udp_port(2, big-endian)`.
pub type CompactUdpAddress = [u8; COMPACT_UDP_LEN];
/// Same layout, carrying a tcp_port instead.
pub type CompactTcpAddress = [u8; COMPACT_TCP_LEN];

pub fn encode_compact_udp(node_id: &NodeId, ip: Ipv4Addr, port: u16) -> CompactUdpAddress {
    encode_compact(node_id, ip, port)
}

pub fn encode_compact_tcp(node_id: &NodeId, ip: Ipv4Addr, port: u16) -> CompactTcpAddress {
    encode_compact(node_id, ip, port)
}

fn encode_compact(node_id: &NodeId, ip: Ipv4Addr, port: u16) -> [u8; COMPACT_UDP_LEN] {
    let mut buf = [0u8; COMPACT_UDP_LEN];
    buf[0..48].copy_from_slice(node_id.as_bytes());
    buf[48..52].copy_from_slice(&ip.octets());
    buf[52..54].copy_from_slice(&port.to_be_bytes());
    buf
}

fn decode_compact(bytes: &[u8]) -> Result<(NodeId, Ipv4Addr, u16), CodecError> {
    if bytes.len() != COMPACT_UDP_LEN {
        return Err(CodecError::InvalidShape("compact address must be 54 bytes"));
    }
    let node_id = NodeId::from_slice(&bytes[0..48])
        .ok_or(CodecError::InvalidShape("compact address node_id"))?;
    let ip = Ipv4Addr::new(bytes[48], bytes[49], bytes[50], bytes[51]);
    let port = u16::from_be_bytes([bytes[52], bytes[53]]);
    Ok((node_id, ip, port))
}

/// Decode a compact UDP triple into a validated `PeerInfo`. Rejects
/// non-public addresses the same way direct construction does; callers
/// treat this as the "malformed peer" case from S6, reporting the sender
/// as failed rather than propagating the error.
pub fn decode_peer_udp(bytes: &[u8], allow_localhost: bool) -> Result<PeerInfo, CodecError> {
    let (node_id, ip, port) = decode_compact(bytes)?;
    PeerInfo::with_options(Some(node_id), ip, Some(port), None, allow_localhost).map_err(CodecError::from)
}

pub fn decode_peer_tcp(bytes: &[u8], allow_localhost: bool) -> Result<PeerInfo, CodecError> {
    let (node_id, ip, port) = decode_compact(bytes)?;
    PeerInfo::with_options(Some(node_id), ip, None, Some(port), allow_localhost).map_err(CodecError::from)
}

pub fn encode_peer_udp(peer: &PeerInfo) -> Option<CompactUdpAddress> {
    let node_id = peer.node_id()?;
    let port = peer.udp_port()?;
    Some(encode_compact_udp(&node_id, peer.address(), port))
}

pub fn encode_peer_tcp(peer: &PeerInfo) -> Option<CompactTcpAddress> {
    let node_id = peer.node_id()?;
    let port = peer.tcp_port()?;
    Some(encode_compact_tcp(&node_id, peer.address(), port))
}

fn to_bytes_value(bytes: &[u8]) -> Value {
    Value::Bytes(bytes.to_vec())
}

fn method_args(method: &Method) -> (&'static [u8], Value) {
    match method {
        Method::Ping => (METHOD_PING, Value::List(vec![])),
        Method::Store(args) => (
            METHOD_STORE,
            Value::List(vec![
                to_bytes_value(args.blob_hash.as_bytes()),
                to_bytes_value(&args.token),
                Value::Int(args.tcp_port as i64),
                to_bytes_value(args.original_publisher_id.as_bytes()),
                Value::Int(args.age),
                Value::Int(args.peer_port as i64),
            ]),
        ),
        Method::FindNode(key) => (METHOD_FIND_NODE, Value::List(vec![to_bytes_value(key.as_bytes())])),
        Method::FindValue(key, page) => (
            METHOD_FIND_VALUE,
            Value::List(vec![to_bytes_value(key.as_bytes()), Value::Int(*page as i64)]),
        ),
    }
}

fn sender_args(protocol_version: u8, sender_node_id: Option<NodeId>) -> Value {
    let mut dict = HashMap::new();
    dict.insert(KEY_PROTOCOL_VERSION.to_vec(), Value::Int(protocol_version as i64));
    if let Some(id) = sender_node_id {
        dict.insert(KEY_NODE_ID.to_vec(), to_bytes_value(id.as_bytes()));
    }
    Value::Dict(dict)
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>, CodecError> {
    let (method_name, args) = method_args(&request.method);
    let envelope = Value::List(vec![
        to_bytes_value(&request.request_id),
        Value::Int(TAG_REQUEST),
        to_bytes_value(method_name),
        args,
        sender_args(request.protocol_version, request.sender_node_id),
    ]);
    serde_bencode::to_bytes(&envelope).map_err(|e| CodecError::Bencode(e.to_string()))
}

pub fn encode_response(request_id: RpcId, result: Value) -> Result<Vec<u8>, CodecError> {
    let envelope = Value::List(vec![to_bytes_value(&request_id), Value::Int(TAG_RESPONSE), result]);
    serde_bencode::to_bytes(&envelope).map_err(|e| CodecError::Bencode(e.to_string()))
}

pub fn encode_error(request_id: RpcId, class: &str, message: &str) -> Result<Vec<u8>, CodecError> {
    let envelope = Value::List(vec![
        to_bytes_value(&request_id),
        Value::Int(TAG_ERROR),
        Value::List(vec![to_bytes_value(class.as_bytes()), to_bytes_value(message.as_bytes())]),
    ]);
    serde_bencode::to_bytes(&envelope).map_err(|e| CodecError::Bencode(e.to_string()))
}

/// `b"pong"`.
pub fn ping_result() -> Value {
    Value::Bytes(b"pong".to_vec())
}

pub fn store_ok_result() -> Value {
    Value::Bytes(b"OK".to_vec())
}

pub fn find_node_result(peers: &[PeerInfo]) -> Value {
    Value::List(
        peers
            .iter()
            .filter_map(encode_peer_udp)
            .map(|bytes| Value::Bytes(bytes.to_vec()))
            .collect(),
    )
}

pub fn find_value_result(
    key: &NodeId,
    contacts: &[PeerInfo],
    token: &[u8],
    pages: i64,
    blob_peers: Option<&[PeerInfo]>,
    protocol_version: u8,
) -> Value {
    let mut dict = HashMap::new();
    dict.insert(
        KEY_CONTACTS.to_vec(),
        Value::List(
            contacts
                .iter()
                .filter_map(encode_peer_udp)
                .map(|b| Value::Bytes(b.to_vec()))
                .collect(),
        ),
    );
    dict.insert(KEY_TOKEN.to_vec(), Value::Bytes(token.to_vec()));
    dict.insert(KEY_PAGES.to_vec(), Value::Int(pages));
    dict.insert(KEY_PROTOCOL_VERSION.to_vec(), Value::Int(protocol_version as i64));
    if let Some(peers) = blob_peers {
        dict.insert(
            key.as_bytes().to_vec(),
            Value::List(
                peers
                    .iter()
                    .filter_map(encode_peer_tcp)
                    .map(|b| Value::Bytes(b.to_vec()))
                    .collect(),
            ),
        );
    }
    Value::Dict(dict)
}

fn as_bytes(value: &Value) -> Result<&[u8], CodecError> {
    match value {
        Value::Bytes(b) => Ok(b),
        _ => Err(CodecError::InvalidShape("expected byte string")),
    }
}

fn as_int(value: &Value) -> Result<i64, CodecError> {
    match value {
        Value::Int(i) => Ok(*i),
        _ => Err(CodecError::InvalidShape("expected integer")),
    }
}

fn as_list(value: &Value) -> Result<&[Value], CodecError> {
    match value {
        Value::List(l) => Ok(l),
        _ => Err(CodecError::InvalidShape("expected list")),
    }
}

fn as_dict(value: &Value) -> Result<&HashMap<Vec<u8>, Value>, CodecError> {
    match value {
        Value::Dict(d) => Ok(d),
        _ => Err(CodecError::InvalidShape("expected dict")),
    }
}

fn node_id_from_value(value: &Value) -> Result<NodeId, CodecError> {
    NodeId::from_slice(as_bytes(value)?).ok_or(CodecError::InvalidShape("node id must be 48 bytes"))
}

fn rpc_id_from_value(value: &Value) -> Result<RpcId, CodecError> {
    let bytes = as_bytes(value)?;
    if bytes.len() != RPC_ID_LENGTH {
        return Err(CodecError::InvalidShape("request id must be 20 bytes"));
    }
    let mut id = [0u8; RPC_ID_LENGTH];
    id.copy_from_slice(bytes);
    Ok(id)
}

fn decode_request_args(method: &[u8], args: &[Value]) -> Result<Method, CodecError> {
    match method {
        METHOD_PING => Ok(Method::Ping),
        METHOD_STORE => {
            if args.len() != 6 {
                return Err(CodecError::InvalidShape("store takes 6 args"));
            }
            Ok(Method::Store(StoreArgs {
                blob_hash: node_id_from_value(&args[0])?,
                token: as_bytes(&args[1])?.to_vec(),
                tcp_port: as_int(&args[2])? as u16,
                original_publisher_id: node_id_from_value(&args[3])?,
                age: as_int(&args[4])?,
                peer_port: as_int(&args[5])? as u16,
            }))
        }
        METHOD_FIND_NODE => {
            if args.len() != 1 {
                return Err(CodecError::InvalidShape("findNode takes 1 arg"));
            }
            Ok(Method::FindNode(node_id_from_value(&args[0])?))
        }
        METHOD_FIND_VALUE => {
            if args.is_empty() || args.len() > 2 {
                return Err(CodecError::InvalidShape("findValue takes 1 or 2 args"));
            }
            let key = node_id_from_value(&args[0])?;
            let page = if args.len() == 2 { as_int(&args[1])? as u32 } else { 0 };
            Ok(Method::FindValue(key, page))
        }
        other => Err(CodecError::UnknownMethod(String::from_utf8_lossy(other).into_owned())),
    }
}

pub fn decode_message(bytes: &[u8]) -> Result<Message, CodecError> {
    let value: Value = serde_bencode::from_bytes(bytes).map_err(|e| CodecError::Bencode(e.to_string()))?;
    let envelope = as_list(&value)?;
    if envelope.len() < 3 {
        return Err(CodecError::InvalidShape("envelope must have at least 3 elements"));
    }
    let request_id = rpc_id_from_value(&envelope[0])?;
    let tag = as_int(&envelope[1])?;
    match tag {
        TAG_REQUEST => {
            if envelope.len() != 5 {
                return Err(CodecError::InvalidShape("request envelope must have 5 elements"));
            }
            let method_name = as_bytes(&envelope[2])?.to_vec();
            let args = as_list(&envelope[3])?;
            let method = decode_request_args(&method_name, args)?;
            let sender = as_dict(&envelope[4])?;
            let protocol_version = sender
                .get(KEY_PROTOCOL_VERSION)
                .map(as_int)
                .transpose()?
                .unwrap_or(1) as u8;
            let sender_node_id = sender.get(KEY_NODE_ID).map(node_id_from_value).transpose()?;
            Ok(Message::Request(Request { request_id, method, protocol_version, sender_node_id }))
        }
        TAG_RESPONSE => Ok(Message::Response { request_id, result: envelope[2].clone() }),
        TAG_ERROR => {
            let pair = as_list(&envelope[2])?;
            if pair.len() != 2 {
                return Err(CodecError::InvalidShape("error tuple must have 2 elements"));
            }
            let class = String::from_utf8_lossy(as_bytes(&pair[0])?).into_owned();
            let message = String::from_utf8_lossy(as_bytes(&pair[1])?).into_owned();
            Ok(Message::Error { request_id, class, message })
        }
        _ => Err(CodecError::InvalidShape("unknown envelope tag")),
    }
}

/// Parse a `findValue` response dict, keyed by the blob hash so the caller
/// must supply it to know which optional key to look for.
pub fn decode_find_value_result(key: &NodeId, result: &Value, allow_localhost: bool) -> Result<FindValueResult, CodecError> {
    let dict = as_dict(result)?;
    let contacts = dict
        .get(KEY_CONTACTS)
        .map(as_list)
        .transpose()?
        .unwrap_or(&[])
        .iter()
        .map(|v| {
            let bytes = as_bytes(v)?;
            if bytes.len() != COMPACT_UDP_LEN {
                return Err(CodecError::InvalidShape("contact must be 54 bytes"));
            }
            let mut arr = [0u8; COMPACT_UDP_LEN];
            arr.copy_from_slice(bytes);
            Ok(arr)
        })
        .collect::<Result<Vec<_>, CodecError>>()?;
    let token = dict
        .get(KEY_TOKEN)
        .map(as_bytes)
        .transpose()?
        .map(|b| b.to_vec())
        .unwrap_or_default();
    let pages = dict.get(KEY_PAGES).map(as_int).transpose()?.unwrap_or(1);
    let protocol_version = dict
        .get(KEY_PROTOCOL_VERSION)
        .map(as_int)
        .transpose()?
        .unwrap_or(1) as u8;
    let blob_peers = dict
        .get(key.as_bytes().as_slice())
        .map(as_list)
        .transpose()?
        .map(|list| {
            list.iter()
                .map(|v| {
                    let bytes = as_bytes(v)?;
                    if bytes.len() != COMPACT_TCP_LEN {
                        return Err(CodecError::InvalidShape("blob peer must be 54 bytes"));
                    }
                    let mut arr = [0u8; COMPACT_TCP_LEN];
                    arr.copy_from_slice(bytes);
                    Ok(arr)
                })
                .collect::<Result<Vec<_>, CodecError>>()
        })
        .transpose()?;
    let _ = allow_localhost;
    Ok(FindValueResult { contacts, token, pages, blob_peers, protocol_version })
}

/// `((count - 1) // (K + 1)) + 1`, preserved bit-exactly for interop.
pub fn page_count(count: usize, k: usize) -> i64 {
    if count == 0 {
        return 1;
    }
    (((count - 1) / (k + 1)) + 1) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::constants::K;
    use std::net::Ipv4Addr;

    fn peer() -> PeerInfo {
        PeerInfo::new(Some(NodeId::hash_string("peer")), Ipv4Addr::new(8, 8, 8, 8), Some(4444), Some(3333)).unwrap()
    }

    #[test]
    fn compact_udp_round_trip() {
        let p = peer();
        let encoded = encode_peer_udp(&p).unwrap();
        let decoded = decode_peer_udp(&encoded, false).unwrap();
        assert_eq!(decoded.node_id(), p.node_id());
        assert_eq!(decoded.address(), p.address());
        assert_eq!(decoded.udp_port(), p.udp_port());
    }

    #[test]
    fn decode_rejects_non_public_address() {
        let id = NodeId::hash_string("peer");
        let bytes = encode_compact_udp(&id, Ipv4Addr::new(10, 0, 0, 1), 4444);
        assert!(decode_peer_udp(&bytes, false).is_err());
    }

    #[test]
    fn ping_request_round_trips() {
        let self_id = NodeId::hash_string("self");
        let req = Request {
            request_id: generate_rpc_id(),
            method: Method::Ping,
            protocol_version: 1,
            sender_node_id: Some(self_id),
        };
        let bytes = encode_request(&req).unwrap();
        let decoded = decode_message(&bytes).unwrap();
        match decoded {
            Message::Request(r) => {
                assert_eq!(r.request_id, req.request_id);
                assert_eq!(r.method, Method::Ping);
                assert_eq!(r.protocol_version, 1);
                assert_eq!(r.sender_node_id, Some(self_id));
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn find_node_request_round_trips() {
        let key = NodeId::hash_string("target");
        let req = Request {
            request_id: generate_rpc_id(),
            method: Method::FindNode(key),
            protocol_version: 1,
            sender_node_id: None,
        };
        let bytes = encode_request(&req).unwrap();
        match decode_message(&bytes).unwrap() {
            Message::Request(r) => {
                assert_eq!(r.method, Method::FindNode(key));
                assert_eq!(r.sender_node_id, None);
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn store_request_round_trips() {
        let args = StoreArgs {
            blob_hash: NodeId::hash_string("blob"),
            token: b"tok".to_vec(),
            tcp_port: 3333,
            original_publisher_id: NodeId::hash_string("pub"),
            age: 7,
            peer_port: 3333,
        };
        let req = Request {
            request_id: generate_rpc_id(),
            method: Method::Store(args.clone()),
            protocol_version: 1,
            sender_node_id: None,
        };
        let bytes = encode_request(&req).unwrap();
        match decode_message(&bytes).unwrap() {
            Message::Request(r) => assert_eq!(r.method, Method::Store(args)),
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn response_round_trips() {
        let id = generate_rpc_id();
        let bytes = encode_response(id, ping_result()).unwrap();
        match decode_message(&bytes).unwrap() {
            Message::Response { request_id, result } => {
                assert_eq!(request_id, id);
                assert_eq!(as_bytes(&result).unwrap(), b"pong");
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn error_round_trips() {
        let id = generate_rpc_id();
        let bytes = encode_error(id, "ValueError", "bad token").unwrap();
        match decode_message(&bytes).unwrap() {
            Message::Error { request_id, class, message } => {
                assert_eq!(request_id, id);
                assert_eq!(class, "ValueError");
                assert_eq!(message, "bad token");
            }
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn find_value_result_round_trips_with_blob_peers() {
        let key = NodeId::hash_string("blob");
        let contact = peer();
        let value = find_value_result(&key, &[contact], b"tok", 1, Some(&[contact]), 1);
        let parsed = decode_find_value_result(&key, &value, false).unwrap();
        assert_eq!(parsed.contacts.len(), 1);
        assert_eq!(parsed.token, b"tok");
        assert_eq!(parsed.pages, 1);
        assert!(parsed.blob_peers.is_some());
    }

    #[test]
    fn find_value_result_omits_blob_peers_key_when_absent() {
        let key = NodeId::hash_string("blob");
        let value = find_value_result(&key, &[], b"tok", 3, None, 1);
        let parsed = decode_find_value_result(&key, &value, false).unwrap();
        assert!(parsed.blob_peers.is_none());
        assert_eq!(parsed.pages, 3);
    }

    #[test]
    fn page_count_matches_reference_formula() {
        assert_eq!(page_count(150, K), 17);
        assert_eq!(page_count(0, K), 1);
        assert_eq!(page_count(1, K), 1);
        assert_eq!(page_count(K + 1, K), 1);
        assert_eq!(page_count(K + 2, K), 2);
    }
}
