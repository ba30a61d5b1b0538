//! # Node Identities
//!
//! Every participant in the DHT is named by a 160-bit [`NodeId`]. Info-hashes
//! live in the same space, so lookups for peers and lookups for nodes share
//! one metric: the XOR of two identifiers, read as a big-endian integer.
//!
//! ## Liveness
//!
//! A [`Node`] tracks a remote endpoint together with what we have observed
//! about it:
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Unknown` | learned second-hand (a `nodes` list), never heard from directly |
//! | `Good` | answered or queried us recently |
//! | `Questionable` | went quiet or missed a query, still routable |
//! | `Bad` | missed `max_failures` queries in a row with no recent contact |
//!
//! ## Compact Records
//!
//! Nodes travel on the wire and on disk as 26-byte records
//! (`id[20] || ipv4[4] || port[2]`), peers as 6-byte records.

use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use rand::RngCore;
use rand::rngs::OsRng;
use tokio::time::{Duration, Instant};

/// Identifier length in bytes (160 bits).
pub const ID_LEN: usize = 20;

/// Length of a compact node record.
pub const COMPACT_NODE_LEN: usize = 26;

/// Length of a compact peer record.
pub const COMPACT_PEER_LEN: usize = 6;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId([u8; ID_LEN]);

/// Info-hashes are looked up in the node id space.
pub type InfoHash = NodeId;

impl NodeId {
    /// The all-zero identifier, i.e. the XOR distance of an id to itself.
    pub const ZERO: NodeId = NodeId([0u8; ID_LEN]);

    #[inline]
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse an identifier from a byte slice, rejecting anything that is not
    /// exactly 20 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Draw a fresh identifier from the operating system CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn xor(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(out)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }
}

/// Order `a` and `b` by their XOR distance to `target`.
///
/// Distinct ids never compare equal: `x -> x ^ target` is a bijection.
#[inline]
pub fn distance_cmp(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    a.xor(target).cmp(&b.xor(target))
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<NodeId> for [u8; ID_LEN] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    Unknown,
    Good,
    Questionable,
    Bad,
}

/// A remote DHT participant.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    last_seen: Option<Instant>,
    state: NodeState,
    failed_queries: u32,
}

impl Node {
    /// A node we have only heard about; it has not contacted us yet.
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: None,
            state: NodeState::Unknown,
            failed_queries: 0,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    pub fn failed_queries(&self) -> u32 {
        self.failed_queries
    }

    pub fn is_bad(&self) -> bool {
        self.state == NodeState::Bad
    }

    /// Record direct contact: a response, or a query the node sent us.
    pub fn seen(&mut self) {
        self.last_seen = Some(Instant::now());
        self.failed_queries = 0;
        self.state = NodeState::Good;
    }

    /// Record a query that went unanswered.
    ///
    /// The node turns `Bad` once it has missed `max_failures` queries in a
    /// row and has not been heard from within `good_window`; until then it is
    /// merely `Questionable`.
    pub fn record_failure(&mut self, max_failures: u32, good_window: Duration) -> NodeState {
        self.failed_queries = self.failed_queries.saturating_add(1);
        if self.failed_queries >= max_failures && !self.seen_within(good_window) {
            self.state = NodeState::Bad;
        } else if self.state != NodeState::Bad {
            self.state = NodeState::Questionable;
        }
        self.state
    }

    /// Demote a `Good` node that has been silent longer than `good_window`.
    pub fn age(&mut self, good_window: Duration) {
        if self.state == NodeState::Good && !self.seen_within(good_window) {
            self.state = NodeState::Questionable;
        }
    }

    fn seen_within(&self, window: Duration) -> bool {
        self.last_seen.is_some_and(|t| t.elapsed() < window)
    }

    /// Compact 26-byte record, `None` for IPv6 endpoints.
    pub fn to_compact(&self) -> Option<[u8; COMPACT_NODE_LEN]> {
        let peer = encode_compact_peer(self.addr)?;
        let mut out = [0u8; COMPACT_NODE_LEN];
        out[..ID_LEN].copy_from_slice(self.id.as_bytes());
        out[ID_LEN..].copy_from_slice(&peer);
        Some(out)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.addr == other.addr
    }
}

impl Eq for Node {}

pub fn encode_compact_peer(addr: SocketAddr) -> Option<[u8; COMPACT_PEER_LEN]> {
    match addr.ip() {
        IpAddr::V4(v4) => {
            let mut out = [0u8; COMPACT_PEER_LEN];
            out[..4].copy_from_slice(&v4.octets());
            out[4..].copy_from_slice(&addr.port().to_be_bytes());
            Some(out)
        }
        IpAddr::V6(_) => None,
    }
}

pub fn decode_compact_peer(bytes: &[u8]) -> Option<SocketAddr> {
    if bytes.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Decode concatenated compact node records. A trailing partial record is
/// ignored, as are records advertising port 0.
pub fn decode_compact_nodes(bytes: &[u8]) -> Vec<Node> {
    bytes
        .chunks_exact(COMPACT_NODE_LEN)
        .filter_map(|chunk| {
            let id = NodeId::from_slice(&chunk[..ID_LEN])?;
            let addr = decode_compact_peer(&chunk[ID_LEN..])?;
            (addr.port() != 0).then(|| Node::new(id, addr))
        })
        .collect()
}

pub fn encode_compact_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Vec<u8> {
    let mut out = Vec::new();
    for node in nodes {
        if let Some(record) = node.to_compact() {
            out.extend_from_slice(&record);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u8) -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = seed.wrapping_mul(31).wrapping_add(i as u8);
        }
        NodeId::from_bytes(bytes)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn xor_is_symmetric_and_zero_on_self() {
        for (a, b) in [(id(1), id(2)), (id(7), id(200)), (NodeId::random(), NodeId::random())] {
            assert_eq!(a.xor(&b), b.xor(&a));
            assert_eq!(a.xor(&a), NodeId::ZERO);
        }
    }

    #[test]
    fn ordering_by_distance_has_no_ties() {
        let target = NodeId::random();
        let mut ids: Vec<NodeId> = (0..64).map(|_| NodeId::random()).collect();
        ids.sort_by(|a, b| distance_cmp(&target, a, b));
        ids.dedup();
        for pair in ids.windows(2) {
            assert_eq!(distance_cmp(&target, &pair[0], &pair[1]), Ordering::Less);
        }
    }

    #[test]
    fn ordering_is_numeric_big_endian() {
        let mut low = [0u8; ID_LEN];
        low[19] = 0xff;
        let mut high = [0u8; ID_LEN];
        high[0] = 0x01;
        assert!(NodeId::from_bytes(low) < NodeId::from_bytes(high));
    }

    #[test]
    fn hex_round_trip_and_length_check() {
        let a = NodeId::random();
        assert_eq!(NodeId::from_hex(&a.to_hex()).unwrap(), a);
        assert!(NodeId::from_hex("abcd").is_err());
        assert!(NodeId::from_slice(&[0u8; 19]).is_none());
    }

    #[test]
    fn compact_node_records_decode_and_skip_partial_tail() {
        let nodes = vec![Node::new(id(1), addr(6881)), Node::new(id(2), addr(6882))];
        let mut bytes = encode_compact_nodes(&nodes);
        assert_eq!(bytes.len(), 2 * COMPACT_NODE_LEN);
        bytes.extend_from_slice(&[0xaa; 7]);

        let decoded = decode_compact_nodes(&bytes);
        assert_eq!(decoded, nodes);
        assert!(decoded.iter().all(|n| n.state() == NodeState::Unknown));
    }

    #[test]
    fn ipv6_nodes_have_no_compact_form() {
        let v6: SocketAddr = "[::1]:6881".parse().unwrap();
        assert!(Node::new(id(3), v6).to_compact().is_none());
        assert!(encode_compact_peer(v6).is_none());
    }

    #[test]
    fn compact_peer_is_big_endian_port() {
        let record = encode_compact_peer(addr(0x1ae1)).unwrap();
        assert_eq!(record, [10, 0, 0, 1, 0x1a, 0xe1]);
        assert_eq!(decode_compact_peer(&record), Some(addr(0x1ae1)));
    }

    #[test]
    fn response_marks_good_and_resets_failures() {
        let mut node = Node::new(id(4), addr(1));
        node.record_failure(2, Duration::from_secs(900));
        assert_eq!(node.failed_queries(), 1);
        node.seen();
        assert_eq!(node.state(), NodeState::Good);
        assert_eq!(node.failed_queries(), 0);
        assert!(node.last_seen().is_some());
    }

    #[test]
    fn unheard_node_goes_bad_after_threshold() {
        let mut node = Node::new(id(5), addr(1));
        assert_eq!(node.record_failure(2, Duration::from_secs(900)), NodeState::Questionable);
        assert_eq!(node.record_failure(2, Duration::from_secs(900)), NodeState::Bad);
    }

    #[test]
    fn recently_seen_node_is_protected_from_bad() {
        let mut node = Node::new(id(6), addr(1));
        node.seen();
        node.record_failure(2, Duration::from_secs(900));
        assert_eq!(node.record_failure(2, Duration::from_secs(900)), NodeState::Questionable);
        assert_eq!(node.record_failure(2, Duration::ZERO), NodeState::Bad);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_good_node_ages_to_questionable() {
        let mut node = Node::new(id(7), addr(1));
        node.seen();
        node.age(Duration::from_secs(60));
        assert_eq!(node.state(), NodeState::Good);

        tokio::time::advance(Duration::from_secs(61)).await;
        node.age(Duration::from_secs(60));
        assert_eq!(node.state(), NodeState::Questionable);
    }
}
