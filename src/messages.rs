//! # KRPC Wire Messages
//!
//! BEP-5 messages are bencoded dictionaries. Every message carries a
//! transaction id `t` and a type `y`:
//!
//! | `y` | Extra keys | Typed form |
//! |-----|------------|------------|
//! | `q` | `q` (method), `a` (arguments) | [`Body::Query`] |
//! | `r` | `r` (return values) | [`Body::Response`] |
//! | `e` | `e` (`[code, message]`) | [`Body::Error`] |
//!
//! Encoding goes through bendy's serde support. Decoding walks the dictionary
//! with bendy's object decoder so keys this node does not model (`v`, `ip`,
//! `nodes6`, `want`, `ro`, ...) are skipped, then [`decode`] validates the
//! collected fields into typed values. Queries that parse but carry bad
//! arguments or an unknown method are reported with their transaction id so
//! the caller can answer with a KRPC error.

use std::net::SocketAddr;

use bendy::decoding::{Decoder, Object};
use serde::Serialize;
use serde_bytes::ByteBuf;

use crate::identity::{
    InfoHash, Node, NodeId, decode_compact_nodes, decode_compact_peer, encode_compact_nodes,
    encode_compact_peer,
};

/// KRPC error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Generic,
    Server,
    Protocol,
    MethodUnknown,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            Self::Generic => 201,
            Self::Server => 202,
            Self::Protocol => 203,
            Self::MethodUnknown => 204,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            201 => Some(Self::Generic),
            202 => Some(Self::Server),
            203 => Some(Self::Protocol),
            204 => Some(Self::MethodUnknown),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: InfoHash,
    },
    AnnouncePeer {
        info_hash: InfoHash,
        port: u16,
        implied_port: bool,
        token: Vec<u8>,
    },
}

impl Query {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::FindNode { .. } => "find_node",
            Self::GetPeers { .. } => "get_peers",
            Self::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// Return values of any query; absent keys are empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    pub id: NodeId,
    pub nodes: Vec<Node>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
}

impl Response {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    Query { id: NodeId, query: Query },
    Response(Response),
    Error { code: i64, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KrpcMessage {
    pub transaction_id: Vec<u8>,
    pub body: Body,
}

impl KrpcMessage {
    pub fn query(transaction_id: Vec<u8>, id: NodeId, query: Query) -> Self {
        Self {
            transaction_id,
            body: Body::Query { id, query },
        }
    }

    pub fn response(transaction_id: Vec<u8>, response: Response) -> Self {
        Self {
            transaction_id,
            body: Body::Response(response),
        }
    }

    pub fn error(transaction_id: Vec<u8>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            body: Body::Error {
                code: code.code(),
                message: message.into(),
            },
        }
    }

}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Not a bencoded KRPC dictionary.
    Malformed(String),
    /// A required top-level key is absent.
    MissingField(&'static str),
    /// A query whose arguments are missing or invalid.
    BadArguments {
        transaction_id: Vec<u8>,
        reason: &'static str,
    },
    /// A query naming a method we do not serve.
    UnknownMethod {
        transaction_id: Vec<u8>,
        method: String,
    },
    /// Serialization failed.
    Encode(String),
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed message: {msg}"),
            Self::MissingField(key) => write!(f, "missing field `{key}`"),
            Self::BadArguments { reason, .. } => write!(f, "bad arguments: {reason}"),
            Self::UnknownMethod { method, .. } => write!(f, "unknown method: {method}"),
            Self::Encode(msg) => write!(f, "encode error: {msg}"),
        }
    }
}

impl std::error::Error for MessageError {}

// Field order matches bencode's sorted key order.
#[derive(Debug, Default, Serialize)]
struct RawMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    a: Option<RawBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    e: Option<(i64, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    q: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    r: Option<RawBody>,
    t: ByteBuf,
    y: String,
}

#[derive(Debug, Default, Serialize)]
struct RawBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    implied_port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    info_hash: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nodes: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    values: Option<Vec<ByteBuf>>,
}

fn id_field(bytes: Option<&ByteBuf>) -> Option<NodeId> {
    bytes.and_then(|b| NodeId::from_slice(b))
}

fn id_buf(id: &NodeId) -> Option<ByteBuf> {
    Some(ByteBuf::from(id.as_bytes().to_vec()))
}

pub fn encode(message: &KrpcMessage) -> Result<Vec<u8>, MessageError> {
    let mut raw = RawMessage {
        t: ByteBuf::from(message.transaction_id.clone()),
        ..RawMessage::default()
    };

    match &message.body {
        Body::Query { id, query } => {
            let mut args = RawBody {
                id: id_buf(id),
                ..RawBody::default()
            };
            match query {
                Query::Ping => {}
                Query::FindNode { target } => args.target = id_buf(target),
                Query::GetPeers { info_hash } => args.info_hash = id_buf(info_hash),
                Query::AnnouncePeer {
                    info_hash,
                    port,
                    implied_port,
                    token,
                } => {
                    args.info_hash = id_buf(info_hash);
                    args.port = Some(i64::from(*port));
                    args.implied_port = implied_port.then_some(1);
                    args.token = Some(ByteBuf::from(token.clone()));
                }
            }
            raw.y = "q".to_string();
            raw.q = Some(query.method().to_string());
            raw.a = Some(args);
        }
        Body::Response(response) => {
            let nodes = encode_compact_nodes(&response.nodes);
            let values: Vec<ByteBuf> = response
                .values
                .iter()
                .filter_map(|addr| encode_compact_peer(*addr))
                .map(|record| ByteBuf::from(record.to_vec()))
                .collect();
            raw.y = "r".to_string();
            raw.r = Some(RawBody {
                id: id_buf(&response.id),
                nodes: (!nodes.is_empty()).then(|| ByteBuf::from(nodes)),
                token: response.token.clone().map(ByteBuf::from),
                values: (!values.is_empty()).then_some(values),
                ..RawBody::default()
            });
        }
        Body::Error { code, message } => {
            raw.y = "e".to_string();
            raw.e = Some((*code, message.clone()));
        }
    }

    bendy::serde::ser::to_bytes(&raw).map_err(|e| MessageError::Encode(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<KrpcMessage, MessageError> {
    let raw = read_message(bytes)?;
    let transaction_id = raw.t.into_vec();

    let body = match raw.y.as_str() {
        "q" => {
            let method = raw.q.ok_or(MessageError::MissingField("q"))?;
            decode_query(&transaction_id, method, raw.a)?
        }
        "r" => Body::Response(decode_response(raw.r.ok_or(MessageError::MissingField("r"))?)?),
        "e" => {
            let (code, message) = raw.e.ok_or(MessageError::MissingField("e"))?;
            Body::Error { code, message }
        }
        other => return Err(MessageError::Malformed(format!("unknown type {other:?}"))),
    };

    Ok(KrpcMessage {
        transaction_id,
        body,
    })
}

fn malformed(e: bendy::decoding::Error) -> MessageError {
    MessageError::Malformed(e.to_string())
}

fn read_message(bytes: &[u8]) -> Result<RawMessage, MessageError> {
    let mut decoder = Decoder::new(bytes);
    let mut dict = match decoder.next_object().map_err(malformed)? {
        Some(Object::Dict(dict)) => dict,
        _ => return Err(MessageError::Malformed("expected a dictionary".to_string())),
    };

    let mut raw = RawMessage::default();
    let mut t = None;
    let mut y = None;
    while let Some((key, value)) = dict.next_pair().map_err(malformed)? {
        match key {
            b"t" => t = read_bytes(value),
            b"y" => y = read_string(value),
            b"q" => raw.q = read_string(value),
            b"a" => raw.a = read_body(value)?,
            b"r" => raw.r = read_body(value)?,
            b"e" => raw.e = read_error(value)?,
            _ => {}
        }
    }

    raw.t = t.ok_or(MessageError::MissingField("t"))?;
    raw.y = y.ok_or(MessageError::MissingField("y"))?;
    Ok(raw)
}

fn read_bytes(value: Object<'_, '_>) -> Option<ByteBuf> {
    value.try_into_bytes().ok().map(|b| ByteBuf::from(b.to_vec()))
}

fn read_string(value: Object<'_, '_>) -> Option<String> {
    value
        .try_into_bytes()
        .ok()
        .and_then(|b| std::str::from_utf8(b).ok())
        .map(str::to_string)
}

fn read_int(value: Object<'_, '_>) -> Option<i64> {
    value.try_into_integer().ok().and_then(|i| i.parse().ok())
}

/// Arguments or return values. A wrongly typed field reads as absent so the
/// query can still be answered with a protocol error.
fn read_body(value: Object<'_, '_>) -> Result<Option<RawBody>, MessageError> {
    let Object::Dict(mut dict) = value else {
        return Ok(None);
    };

    let mut body = RawBody::default();
    while let Some((key, value)) = dict.next_pair().map_err(malformed)? {
        match key {
            b"id" => body.id = read_bytes(value),
            b"implied_port" => body.implied_port = read_int(value),
            b"info_hash" => body.info_hash = read_bytes(value),
            b"nodes" => body.nodes = read_bytes(value),
            b"port" => body.port = read_int(value),
            b"target" => body.target = read_bytes(value),
            b"token" => body.token = read_bytes(value),
            b"values" => body.values = read_values(value)?,
            _ => {}
        }
    }
    Ok(Some(body))
}

fn read_values(value: Object<'_, '_>) -> Result<Option<Vec<ByteBuf>>, MessageError> {
    let Object::List(mut list) = value else {
        return Ok(None);
    };

    let mut values = Vec::new();
    while let Some(item) = list.next_object().map_err(malformed)? {
        if let Some(record) = read_bytes(item) {
            values.push(record);
        }
    }
    Ok(Some(values))
}

fn read_error(value: Object<'_, '_>) -> Result<Option<(i64, String)>, MessageError> {
    let Object::List(mut list) = value else {
        return Ok(None);
    };

    let code = list.next_object().map_err(malformed)?.and_then(read_int);
    let message = list.next_object().map_err(malformed)?.and_then(read_string);
    Ok(code.zip(message))
}

fn decode_query(
    transaction_id: &[u8],
    method: String,
    args: Option<RawBody>,
) -> Result<Body, MessageError> {
    let bad = |reason| MessageError::BadArguments {
        transaction_id: transaction_id.to_vec(),
        reason,
    };

    let args = args.ok_or_else(|| bad("missing arguments"))?;
    let id = id_field(args.id.as_ref()).ok_or_else(|| bad("invalid id"))?;

    let query = match method.as_str() {
        "ping" => Query::Ping,
        "find_node" => Query::FindNode {
            target: id_field(args.target.as_ref()).ok_or_else(|| bad("invalid target"))?,
        },
        "get_peers" => Query::GetPeers {
            info_hash: id_field(args.info_hash.as_ref()).ok_or_else(|| bad("invalid info_hash"))?,
        },
        "announce_peer" => {
            let info_hash =
                id_field(args.info_hash.as_ref()).ok_or_else(|| bad("invalid info_hash"))?;
            let implied_port = args.implied_port.is_some_and(|v| v != 0);
            let port = match args.port.map(u16::try_from) {
                Some(Ok(port)) if port != 0 => port,
                _ if implied_port => 0,
                _ => return Err(bad("invalid port")),
            };
            let token = args.token.ok_or_else(|| bad("missing token"))?.into_vec();
            Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
            }
        }
        _ => {
            return Err(MessageError::UnknownMethod {
                transaction_id: transaction_id.to_vec(),
                method,
            });
        }
    };

    Ok(Body::Query { id, query })
}

fn decode_response(values: RawBody) -> Result<Response, MessageError> {
    let id = id_field(values.id.as_ref())
        .ok_or_else(|| MessageError::Malformed("response without valid id".to_string()))?;
    Ok(Response {
        id,
        nodes: values
            .nodes
            .map(|nodes| decode_compact_nodes(&nodes))
            .unwrap_or_default(),
        values: values
            .values
            .unwrap_or_default()
            .iter()
            .filter_map(|record| decode_compact_peer(record))
            .collect(),
        token: values.token.map(ByteBuf::into_vec),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc_id() -> NodeId {
        NodeId::from_slice(b"abcdefghij0123456789").unwrap()
    }

    fn mno_id() -> NodeId {
        NodeId::from_slice(b"mnopqrstuvwxyz123456").unwrap()
    }

    #[test]
    fn decodes_ping_query() {
        let msg = decode(b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe").unwrap();
        assert_eq!(msg.transaction_id, b"aa");
        assert_eq!(
            msg.body,
            Body::Query {
                id: abc_id(),
                query: Query::Ping
            }
        );
    }

    #[test]
    fn decodes_find_node_query() {
        let msg = decode(
            b"d1:ad2:id20:abcdefghij01234567896:target20:mnopqrstuvwxyz123456e1:q9:find_node1:t2:aa1:y1:qe",
        )
        .unwrap();
        assert_eq!(
            msg.body,
            Body::Query {
                id: abc_id(),
                query: Query::FindNode { target: mno_id() }
            }
        );
    }

    #[test]
    fn decodes_announce_with_implied_port() {
        let msg = decode(
            b"d1:ad2:id20:abcdefghij012345678912:implied_porti1e9:info_hash20:mnopqrstuvwxyz1234564:porti6881e5:token8:aoeusnthe1:q13:announce_peer1:t2:aa1:y1:qe",
        )
        .unwrap();
        assert_eq!(
            msg.body,
            Body::Query {
                id: abc_id(),
                query: Query::AnnouncePeer {
                    info_hash: mno_id(),
                    port: 6881,
                    implied_port: true,
                    token: b"aoeusnth".to_vec(),
                }
            }
        );
    }

    #[test]
    fn decodes_get_peers_response_values() {
        let msg = decode(
            b"d1:rd2:id20:abcdefghij01234567895:token8:aoeusnth6:valuesl6:axje.u6:idhtnmee1:t2:aa1:y1:re",
        )
        .unwrap();
        let Body::Response(response) = msg.body else {
            panic!("expected response");
        };
        assert_eq!(response.id, abc_id());
        assert_eq!(response.token.as_deref(), Some(&b"aoeusnth"[..]));
        assert_eq!(response.values.len(), 2);
        assert_eq!(response.values[0], decode_compact_peer(b"axje.u").unwrap());
        assert!(response.nodes.is_empty());
    }

    #[test]
    fn decodes_error() {
        let msg = decode(b"d1:eli201e23:A Generic Error Ocurrede1:t2:aa1:y1:ee").unwrap();
        assert_eq!(
            msg.body,
            Body::Error {
                code: 201,
                message: "A Generic Error Ocurred".to_string()
            }
        );
        assert_eq!(ErrorCode::from_code(201), Some(ErrorCode::Generic));
    }

    #[test]
    fn unknown_method_keeps_transaction_id() {
        let err = decode(b"d1:ad2:id20:abcdefghij0123456789e1:q4:vote1:t2:xy1:y1:qe").unwrap_err();
        assert_eq!(
            err,
            MessageError::UnknownMethod {
                transaction_id: b"xy".to_vec(),
                method: "vote".to_string()
            }
        );
    }

    #[test]
    fn missing_target_is_bad_arguments() {
        let err = decode(b"d1:ad2:id20:abcdefghij0123456789e1:q9:find_node1:t2:aa1:y1:qe").unwrap_err();
        assert!(matches!(err, MessageError::BadArguments { ref transaction_id, .. } if transaction_id == b"aa"));
    }

    #[test]
    fn short_id_is_bad_arguments() {
        let err = decode(b"d1:ad2:id3:abce1:q4:ping1:t2:aa1:y1:qe").unwrap_err();
        assert!(matches!(err, MessageError::BadArguments { .. }));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(decode(b"not bencode"), Err(MessageError::Malformed(_))));
        assert!(matches!(decode(b"i42e"), Err(MessageError::Malformed(_))));
        assert_eq!(decode(b"de").unwrap_err(), MessageError::MissingField("t"));
    }

    #[test]
    fn encoded_response_decodes_back() {
        let node = Node::new(mno_id(), "10.0.0.2:6881".parse().unwrap());
        let response = Response {
            id: abc_id(),
            nodes: vec![node],
            values: vec!["10.0.0.3:51413".parse().unwrap()],
            token: Some(b"tok".to_vec()),
        };
        let msg = KrpcMessage::response(b"t1".to_vec(), response);
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn encoded_ping_matches_bep5_example() {
        let msg = KrpcMessage::query(b"aa".to_vec(), abc_id(), Query::Ping);
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode(&bytes).unwrap(), msg);
        assert!(bytes.starts_with(b"d1:ad2:id20:abcdefghij0123456789e"));
    }

    #[test]
    fn skips_client_version_key() {
        let msg = decode(b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:v4:UT011:y1:qe").unwrap();
        assert_eq!(msg.transaction_id, b"aa");
        assert_eq!(
            msg.body,
            Body::Query {
                id: abc_id(),
                query: Query::Ping
            }
        );
    }

    #[test]
    fn skips_external_ip_and_read_only_keys() {
        let mut bytes = b"d2:ip6:".to_vec();
        bytes.extend_from_slice(&[10, 0, 0, 5, 0x1a, 0xe1]);
        bytes.extend_from_slice(b"1:rd2:id20:mnopqrstuvwxyz123456e2:roi1e1:t2:bb1:v4:LT011:y1:re");
        let msg = decode(&bytes).unwrap();
        assert_eq!(msg.body, Body::Response(Response::new(mno_id())));
    }

    #[test]
    fn skips_ipv6_nodes_in_response() {
        let mut bytes = b"d1:rd2:id20:abcdefghij01234567895:nodes26:".to_vec();
        bytes.extend_from_slice(b"mnopqrstuvwxyz123456");
        bytes.extend_from_slice(&[10, 0, 0, 2, 0x1a, 0xe1]);
        bytes.extend_from_slice(b"6:nodes638:");
        bytes.extend_from_slice(&[7u8; 38]);
        bytes.extend_from_slice(b"e1:t2:aa1:y1:re");

        let Body::Response(response) = decode(&bytes).unwrap().body else {
            panic!("expected response");
        };
        assert_eq!(response.id, abc_id());
        assert_eq!(
            response.nodes,
            vec![Node::new(mno_id(), "10.0.0.2:6881".parse().unwrap())]
        );
    }

    #[test]
    fn skips_want_list_in_find_node() {
        let msg = decode(
            b"d1:ad2:id20:abcdefghij01234567896:target20:mnopqrstuvwxyz1234564:wantl2:n42:n6ee1:q9:find_node1:t2:aa1:y1:qe",
        )
        .unwrap();
        assert_eq!(
            msg.body,
            Body::Query {
                id: abc_id(),
                query: Query::FindNode { target: mno_id() }
            }
        );
    }

    #[test]
    fn wrongly_typed_id_is_bad_arguments() {
        let err = decode(b"d1:ad2:idi5ee1:q4:ping1:t2:aa1:y1:qe").unwrap_err();
        assert!(matches!(err, MessageError::BadArguments { reason: "invalid id", .. }));
    }
}
