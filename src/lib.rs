//! # Mainline DHT
//!
//! A BitTorrent Mainline DHT node: Kademlia routing over the KRPC protocol,
//! carried in bencoded UDP datagrams.
//!
//! - **Routing**: 160-bit XOR metric, K-bucket table that splits only around
//!   the local id, one replacement slot per bucket
//! - **Lookups**: iterative `find_node` / `get_peers` with K concurrent
//!   queries per round
//! - **Announce**: token-gated `announce_peer`, tokens bound to the querying
//!   endpoint and rotated every five minutes
//! - **Maintenance**: node aging, stale bucket refresh, peer expiry
//! - **Persistence**: known nodes saved and restored as compact records
//!
//! ## Architecture
//!
//! The engine follows the actor pattern:
//! - [`DhtEngine`] is a cheap, cloneable handle
//! - a private actor owns the routing table, token secrets, peer store and
//!   pending transactions, and processes commands sequentially
//! - bootstrap, lookups, announce and refresh run as separate tasks that talk
//!   to the actor through the handle
//!
//! The engine is transport-agnostic: it sends through [`DhtTransport`] and
//! receives via [`DhtEngine::handle_datagram`]. [`MainlineDht`] wires it to a
//! UDP socket.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Node ids, XOR distance, node liveness, compact encodings |
//! | `routing` | K-bucket routing table |
//! | `token` | `announce_peer` token issue and verification |
//! | `storage` | Announced peers per info-hash |
//! | `messages` | KRPC message model and bencode codec |
//! | `protocols` | Transport and node persistence traits |
//! | `rpc` | Transaction table matching responses to queries |
//! | `dht` | Engine handle, actor and configuration |
//! | `tasks` | Bootstrap, lookup, announce and refresh operations |
//! | `transport` | UDP socket transport |
//! | `node` | High-level node and node file |

mod dht;
mod identity;
mod messages;
mod node;
mod protocols;
mod routing;
mod rpc;
mod storage;
mod tasks;
mod token;
mod transport;

pub use dht::{DhtConfig, DhtEngine, DhtEvent, DhtState};
pub use identity::{
    COMPACT_NODE_LEN, COMPACT_PEER_LEN, ID_LEN, InfoHash, Node, NodeId, NodeState,
    decode_compact_nodes, decode_compact_peer, distance_cmp, encode_compact_nodes,
    encode_compact_peer,
};
pub use messages::{Body, ErrorCode, KrpcMessage, MessageError, Query, Response, decode, encode};
pub use node::{MainlineDht, NodeFile};
pub use protocols::{DhtTransport, NodeStore};
pub use routing::{Bucket, RefreshTarget, RoutingTable};
pub use rpc::{MessageLoop, PendingQuery, QueryOutcome};
pub use storage::PeerStore;
pub use tasks::{AnnounceSummary, InitialiseSummary, LookupSummary, TaskHandle, send_query};
pub use token::TokenManager;
pub use transport::{MAX_DATAGRAM_SIZE, UdpTransport};
