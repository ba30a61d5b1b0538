//! # Query Correlation
//!
//! [`MessageLoop`] is the transaction table behind every outbound query. The
//! engine actor owns it, so registration, response matching and expiry are
//! serialized with every other state change.
//!
//! ## Lifecycle of a transaction
//!
//! 1. A 2-byte transaction id is allocated, skipping ids still in flight.
//! 2. The pending entry holds a `oneshot` sender for the caller.
//! 3. Exactly one of these removes the entry and fires the sender:
//!    a response or error from the queried endpoint, the expiry timer, or
//!    engine shutdown.
//!
//! Once removed, later responses or expiries for the same id find nothing and
//! are dropped. Each insert also gets a generation number, so an expiry timer
//! left over from an earlier query never removes a later query that reused
//! its transaction id.

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::identity::NodeId;
use crate::messages::Response;

/// How a single query ended. Timeouts are an expected outcome, not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryOutcome {
    Responded(Response),
    Error { code: i64, message: String },
    TimedOut,
    /// The engine stopped before the query resolved.
    Cancelled,
}

impl QueryOutcome {
    pub fn response(self) -> Option<Response> {
        match self {
            Self::Responded(response) => Some(response),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct PendingQuery {
    to: SocketAddr,
    node: Option<NodeId>,
    method: &'static str,
    sent_at: Instant,
    generation: u64,
    reply: oneshot::Sender<QueryOutcome>,
}

impl PendingQuery {
    pub fn new(
        to: SocketAddr,
        node: Option<NodeId>,
        method: &'static str,
        reply: oneshot::Sender<QueryOutcome>,
    ) -> Self {
        Self {
            to,
            node,
            method,
            sent_at: Instant::now(),
            generation: 0,
            reply,
        }
    }

    pub fn to(&self) -> SocketAddr {
        self.to
    }

    /// The id of the queried node, when it was known before sending.
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }

    /// Deliver the outcome. The waiting side may already be gone.
    pub fn complete(self, outcome: QueryOutcome) {
        let _ = self.reply.send(outcome);
    }
}

#[derive(Debug)]
pub struct MessageLoop {
    next_tid: u16,
    next_generation: u64,
    pending: HashMap<Vec<u8>, PendingQuery>,
}

impl Default for MessageLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLoop {
    pub fn new() -> Self {
        Self {
            next_tid: rand::thread_rng().r#gen(),
            next_generation: 0,
            pending: HashMap::new(),
        }
    }

    /// Allocate a transaction id not currently in flight.
    pub fn next_transaction_id(&mut self) -> Option<Vec<u8>> {
        for _ in 0..=u16::MAX {
            let tid = self.next_tid.to_be_bytes().to_vec();
            self.next_tid = self.next_tid.wrapping_add(1);
            if !self.pending.contains_key(&tid) {
                return Some(tid);
            }
        }
        None
    }

    /// Track `query` under `transaction_id`. Returns the generation to pass
    /// to [`MessageLoop::expire`].
    pub fn insert(&mut self, transaction_id: Vec<u8>, mut query: PendingQuery) -> u64 {
        self.next_generation += 1;
        query.generation = self.next_generation;
        self.pending.insert(transaction_id, query);
        self.next_generation
    }

    /// Take the pending query matching a reply from `from`.
    ///
    /// A reply from an endpoint other than the one queried leaves the entry
    /// in place.
    pub fn resolve(&mut self, transaction_id: &[u8], from: SocketAddr) -> Option<PendingQuery> {
        match self.pending.get(transaction_id) {
            Some(query) if query.to == from => self.pending.remove(transaction_id),
            Some(query) => {
                trace!(expected = %query.to, got = %from, "reply from unexpected endpoint");
                None
            }
            None => None,
        }
    }

    /// Take the pending query if it is still the one registered as
    /// `generation`.
    pub fn expire(&mut self, transaction_id: &[u8], generation: u64) -> Option<PendingQuery> {
        match self.pending.get(transaction_id) {
            Some(query) if query.generation == generation => self.pending.remove(transaction_id),
            _ => None,
        }
    }

    /// Resolve every pending query as cancelled.
    pub fn cancel_all(&mut self) {
        for (_, query) in self.pending.drain() {
            query.complete(QueryOutcome::Cancelled);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
