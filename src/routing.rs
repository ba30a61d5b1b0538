//! # Routing Table
//!
//! The table partitions the 160-bit id space `[0, 2^160)` into contiguous,
//! sorted, non-overlapping [`Bucket`]s. It starts as one bucket spanning the
//! whole space and grows by splitting.
//!
//! ## Storage
//!
//! Nodes live in a single arena keyed by [`NodeId`]. Buckets only hold ids,
//! so eviction and replacement promotion are id swaps inside one bucket.
//!
//! ## Insertion
//!
//! | Bucket state | Outcome |
//! |--------------|---------|
//! | has room | node appended |
//! | full, holds the local id, range `>= K` wide | split at midpoint, retry |
//! | full, holds a `Bad` node | stalest `Bad` node evicted, node appended |
//! | full otherwise | node parked in the replacement slot |
//!
//! Splitting always halves the range of the bucket holding the local id, so
//! insertion terminates after at most 160 splits.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;

use primitive_types::U256;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::identity::{ID_LEN, Node, NodeId, NodeState, encode_compact_nodes};

fn id_space_end() -> U256 {
    U256::one() << (ID_LEN * 8)
}

fn id_to_u256(id: &NodeId) -> U256 {
    U256::from_big_endian(id.as_bytes())
}

fn u256_to_id(value: U256) -> NodeId {
    let mut wide = [0u8; 32];
    value.to_big_endian(&mut wide);
    let mut out = [0u8; ID_LEN];
    out.copy_from_slice(&wide[32 - ID_LEN..]);
    NodeId::from_bytes(out)
}

/// A slice `[min, max)` of the id space holding at most K node ids.
#[derive(Debug, Clone)]
pub struct Bucket {
    min: U256,
    max: U256,
    nodes: Vec<NodeId>,
    replacement: Option<NodeId>,
    last_changed: Instant,
}

impl Bucket {
    fn new(min: U256, max: U256) -> Self {
        Self {
            min,
            max,
            nodes: Vec::new(),
            replacement: None,
            last_changed: Instant::now(),
        }
    }

    /// Inclusive lower and exclusive upper bound of the bucket's range.
    pub fn range(&self) -> (U256, U256) {
        (self.min, self.max)
    }

    pub fn can_contain(&self, id: &NodeId) -> bool {
        let value = id_to_u256(id);
        self.min <= value && value < self.max
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn replacement(&self) -> Option<NodeId> {
        self.replacement
    }

    pub fn last_changed(&self) -> Instant {
        self.last_changed
    }

    fn add(&mut self, id: NodeId, k: usize) -> bool {
        if self.nodes.len() >= k {
            return false;
        }
        self.nodes.push(id);
        self.last_changed = Instant::now();
        true
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.nodes.iter().position(|n| n == id) {
            self.nodes.remove(pos);
            self.last_changed = Instant::now();
            true
        } else {
            false
        }
    }

    fn can_split(&self, k: usize) -> bool {
        self.max - self.min >= U256::from(k)
    }

    /// Order members oldest-first by last contact; never-seen nodes lead.
    fn sort_by_seen(&mut self, arena: &HashMap<NodeId, Node>) {
        self.nodes
            .sort_by_key(|id| arena.get(id).and_then(Node::last_seen));
    }

    fn random_id(&self) -> NodeId {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let span = self.max - self.min;
        u256_to_id(self.min + U256::from_big_endian(&bytes) % span)
    }
}

/// A stale bucket handed to the refresh task.
#[derive(Debug, Clone)]
pub struct RefreshTarget {
    /// Random id inside the bucket's range, used as the `find_node` target.
    pub target: NodeId,
    /// Bucket members, oldest contact first.
    pub nodes: Vec<Node>,
}

#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
    nodes: HashMap<NodeId, Node>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            k,
            buckets: vec![Bucket::new(U256::zero(), id_space_end())],
            nodes: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Number of nodes held in buckets (replacements excluded).
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is known, either as a bucket member or a replacement.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        let value = id_to_u256(id);
        self.buckets.partition_point(|b| b.max <= value)
    }

    /// Insert a node, splitting the local bucket as needed.
    ///
    /// Returns `true` when the node became a bucket member. A node that is
    /// already known, or the local id itself, is left untouched.
    pub fn add(&mut self, node: Node) -> bool {
        if node.id == self.local_id || self.nodes.contains_key(&node.id) {
            return false;
        }
        loop {
            let idx = self.bucket_index(&node.id);
            let bucket = &mut self.buckets[idx];
            if bucket.add(node.id, self.k) {
                self.nodes.insert(node.id, node);
                return true;
            }
            if bucket.can_contain(&self.local_id) && bucket.can_split(self.k) {
                self.split(idx);
                continue;
            }
            return self.offer_to_full_bucket(idx, node);
        }
    }

    fn offer_to_full_bucket(&mut self, idx: usize, node: Node) -> bool {
        let k = self.k;
        let bucket = &mut self.buckets[idx];
        bucket.sort_by_seen(&self.nodes);
        let stale = bucket
            .nodes
            .iter()
            .copied()
            .find(|id| self.nodes.get(id).is_some_and(Node::is_bad));

        if let Some(stale) = stale {
            bucket.remove(&stale);
            bucket.add(node.id, k);
            self.nodes.remove(&stale);
            trace!(evicted = %stale, added = %node.id, "displaced bad node");
            self.nodes.insert(node.id, node);
            return true;
        }

        let keep_previous = bucket.replacement.is_some_and(|prev| {
            node.state() != NodeState::Good
                && self.nodes.get(&prev).is_some_and(|n| n.state() == NodeState::Good)
        });
        if keep_previous {
            return false;
        }
        if let Some(previous) = bucket.replacement.replace(node.id) {
            self.nodes.remove(&previous);
        }
        self.nodes.insert(node.id, node);
        false
    }

    fn split(&mut self, idx: usize) {
        let old = self.buckets.remove(idx);
        let mid = old.min + (old.max - old.min) / 2;
        let mut low = Bucket::new(old.min, mid);
        let mut high = Bucket::new(mid, old.max);

        for id in old.nodes {
            if low.can_contain(&id) {
                low.nodes.push(id);
            } else {
                high.nodes.push(id);
            }
        }
        if let Some(id) = old.replacement {
            let child = if low.can_contain(&id) { &mut low } else { &mut high };
            if !child.add(id, self.k) {
                child.replacement = Some(id);
            }
        }

        trace!(
            low = low.nodes.len(),
            high = high.nodes.len(),
            buckets = self.buckets.len() + 2,
            "split bucket"
        );
        self.buckets.insert(idx, high);
        self.buckets.insert(idx, low);
    }

    /// Record direct contact from `id` at `addr`, inserting it if unknown.
    ///
    /// Returns `true` if the node was newly added to a bucket. Contact
    /// claiming a known id from a different address is ignored.
    pub fn record_seen(&mut self, id: NodeId, addr: SocketAddr) -> bool {
        if id == self.local_id {
            return false;
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.addr != addr {
                trace!(node = %id, known = %node.addr, claimed = %addr, "address mismatch");
                return false;
            }
            node.seen();
            let idx = self.bucket_index(&id);
            let bucket = &mut self.buckets[idx];
            if bucket.nodes.contains(&id) {
                bucket.last_changed = Instant::now();
            }
            return false;
        }
        let mut node = Node::new(id, addr);
        node.seen();
        self.add(node)
    }

    /// Record an unanswered query to `id`.
    ///
    /// A member that turns `Bad` is replaced by the bucket's replacement
    /// candidate when one is waiting.
    pub fn record_failure(
        &mut self,
        id: &NodeId,
        max_failures: u32,
        good_window: Duration,
    ) -> Option<NodeState> {
        let state = self
            .nodes
            .get_mut(id)?
            .record_failure(max_failures, good_window);
        if state == NodeState::Bad {
            self.evict_bad(id);
        }
        Some(state)
    }

    fn evict_bad(&mut self, id: &NodeId) {
        let idx = self.bucket_index(id);
        let bucket = &mut self.buckets[idx];
        if bucket.replacement == Some(*id) {
            bucket.replacement = None;
            self.nodes.remove(id);
            return;
        }
        let Some(promoted) = bucket.replacement.take() else {
            return;
        };
        bucket.remove(id);
        bucket.nodes.push(promoted);
        self.nodes.remove(id);
        trace!(evicted = %id, promoted = %promoted, "promoted replacement");
    }

    /// Demote silent `Good` nodes to `Questionable`.
    pub fn age_nodes(&mut self, good_window: Duration) {
        for node in self.nodes.values_mut() {
            node.age(good_window);
        }
    }

    /// The up-to-K known nodes closest to `target`, nearest first.
    ///
    /// Every bucket is scanned since buckets near the target may be sparse.
    /// `Bad` nodes are never returned.
    pub fn get_closest(&self, target: &NodeId) -> Vec<Node> {
        #[derive(PartialEq, Eq)]
        struct Candidate {
            dist: NodeId,
            id: NodeId,
        }

        impl Ord for Candidate {
            fn cmp(&self, other: &Self) -> Ordering {
                self.dist.cmp(&other.dist)
            }
        }

        impl PartialOrd for Candidate {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        if self.k == 0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(self.k + 1);
        for bucket in &self.buckets {
            for id in &bucket.nodes {
                if self.nodes.get(id).is_none_or(Node::is_bad) {
                    continue;
                }
                let dist = id.xor(target);
                if heap.len() < self.k {
                    heap.push(Candidate { dist, id: *id });
                } else if let Some(worst) = heap.peek()
                    && dist < worst.dist
                {
                    heap.pop();
                    heap.push(Candidate { dist, id: *id });
                }
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .filter_map(|c| self.nodes.get(&c.id).cloned())
            .collect()
    }

    /// Collect buckets unchanged for longer than `timeout`, resetting their
    /// `last_changed` so the next scan skips them while refresh runs.
    ///
    /// Empty buckets are reset but produce no target.
    pub fn take_stale_buckets(&mut self, timeout: Duration) -> Vec<RefreshTarget> {
        let mut targets = Vec::new();
        for bucket in &mut self.buckets {
            if bucket.last_changed.elapsed() <= timeout {
                continue;
            }
            bucket.last_changed = Instant::now();
            if bucket.nodes.is_empty() {
                continue;
            }
            bucket.sort_by_seen(&self.nodes);
            let nodes = bucket
                .nodes
                .iter()
                .filter_map(|id| self.nodes.get(id).cloned())
                .collect();
            targets.push(RefreshTarget {
                target: bucket.random_id(),
                nodes,
            });
        }
        targets
    }

    /// Compact records of every non-`Bad` member and replacement.
    pub fn compact_nodes(&self) -> Vec<u8> {
        let live = self.buckets.iter().flat_map(|bucket| {
            bucket
                .nodes
                .iter()
                .chain(bucket.replacement.iter())
                .filter_map(|id| self.nodes.get(id))
                .filter(|node| !node.is_bad())
        });
        encode_compact_nodes(live)
    }

    /// Reset to the initial single-bucket state.
    pub fn clear(&mut self) {
        self.buckets = vec![Bucket::new(U256::zero(), id_space_end())];
        self.nodes.clear();
    }
}
