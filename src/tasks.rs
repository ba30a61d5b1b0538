//! # Multi-step DHT Operations
//!
//! Each operation runs as its own tokio task and reaches engine state only
//! through the [`DhtEngine`] handle. Callers get a [`TaskHandle`] that
//! resolves exactly once with a summary.
//!
//! | Operation | Query | Stops when |
//! |-----------|-------|------------|
//! | [`initialise`] | `find_node(self)` | no unqueried candidates remain |
//! | [`get_peers`] | `get_peers(hash)` | a round finds nothing closer |
//! | [`announce`] | `get_peers(hash)`, then `announce_peer` | every token holder answered |
//! | [`refresh_bucket`] | `find_node(random id in bucket)` | one node answered |
//!
//! Lookups query up to K candidates per round concurrently and merge the
//! returned nodes into a distance-sorted shortlist of K. Rounds are capped by
//! [`DhtConfig::max_lookup_rounds`](crate::dht::DhtConfig::max_lookup_rounds).

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Result, anyhow};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::dht::{DhtEngine, DhtEvent, DhtState};
use crate::identity::{InfoHash, Node, NodeId, distance_cmp};
use crate::messages::Query;
use crate::protocols::DhtTransport;
use crate::routing::RefreshTarget;
use crate::rpc::QueryOutcome;

/// Completion handle for a spawned operation.
#[derive(Debug)]
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<R>,
}

impl<R: Send + 'static> TaskHandle<R> {
    pub(crate) fn spawn<F>(task: F) -> Self
    where
        F: Future<Output = R> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(task.await);
        });
        Self { rx }
    }

    pub(crate) fn ready(value: R) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self { rx }
    }

    /// Wait for the operation's result.
    pub async fn wait(self) -> Result<R> {
        self.rx
            .await
            .map_err(|_| anyhow!("task ended without a result"))
    }
}

#[derive(Clone, Debug, Default)]
pub struct InitialiseSummary {
    /// Bootstrap passes run, seeds and routers included.
    pub attempts: u32,
    pub used_routers: bool,
    /// Routing table size when bootstrap finished.
    pub nodes: usize,
}

#[derive(Clone, Debug, Default)]
pub struct LookupSummary {
    pub info_hash: InfoHash,
    /// Every distinct peer returned during the lookup.
    pub peers: Vec<SocketAddr>,
    /// The closest nodes seen, nearest first.
    pub closest: Vec<Node>,
    pub queried: usize,
    pub rounds: usize,
}

#[derive(Clone, Debug, Default)]
pub struct AnnounceSummary {
    pub info_hash: InfoHash,
    pub port: u16,
    pub peers: Vec<SocketAddr>,
    /// Token holders that accepted our `announce_peer`.
    pub announced_to: usize,
}

/// Send one query and wait for it to resolve.
///
/// Resolves with [`QueryOutcome::TimedOut`] after the configured query
/// timeout; a timeout against a known node counts as a failure for it.
pub async fn send_query<T: DhtTransport>(
    engine: &DhtEngine<T>,
    to: SocketAddr,
    node: Option<NodeId>,
    query: Query,
) -> QueryOutcome {
    engine.query(to, node, query).await
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Convergence {
    /// Stop after a round that brings no node closer to the target.
    NoCloser,
    /// Keep going while unqueried candidates remain.
    Exhaust,
}

#[derive(Debug, Default)]
struct Lookup {
    closest: Vec<Node>,
    /// Nodes that answered, with the token they handed out.
    responders: Vec<(Node, Option<Vec<u8>>)>,
    peers: Vec<SocketAddr>,
    queried: usize,
    rounds: usize,
}

async fn iterative_lookup<T: DhtTransport>(
    engine: &DhtEngine<T>,
    target: NodeId,
    query: Query,
    mut shortlist: Vec<Node>,
    convergence: Convergence,
) -> Lookup {
    let k = engine.config().bucket_size.max(1);
    let max_rounds = engine.config().max_lookup_rounds;
    let reports_peers = matches!(query, Query::GetPeers { .. });
    let local_id = engine.id();

    let mut lookup = Lookup::default();
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut queried: HashSet<NodeId> = HashSet::new();
    let mut seen_peers: HashSet<SocketAddr> = HashSet::new();

    shortlist.retain(|n| n.id != local_id && seen.insert(n.id));
    shortlist.sort_by(|a, b| distance_cmp(&target, &a.id, &b.id));
    shortlist.truncate(k);
    let mut best = shortlist.first().map(|n| n.id);

    loop {
        if lookup.rounds >= max_rounds {
            warn!(target = %target, rounds = lookup.rounds, "lookup exceeded max rounds");
            break;
        }
        if engine.state() == DhtState::Stopped {
            break;
        }

        let candidates: Vec<Node> = shortlist
            .iter()
            .filter(|n| !queried.contains(&n.id))
            .take(k)
            .cloned()
            .collect();
        if candidates.is_empty() {
            break;
        }
        lookup.rounds += 1;

        let mut join_set = JoinSet::new();
        for node in candidates {
            queried.insert(node.id);
            let engine = engine.clone();
            let query = query.clone();
            join_set.spawn(async move {
                let outcome = send_query(&engine, node.addr, Some(node.id), query).await;
                (node, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let Ok((node, outcome)) = joined else {
                continue;
            };
            lookup.queried += 1;
            let response = match outcome {
                QueryOutcome::Responded(response) => response,
                QueryOutcome::Error { code, message } => {
                    trace!(addr = %node.addr, code, message = %message, "lookup query rejected");
                    continue;
                }
                QueryOutcome::TimedOut | QueryOutcome::Cancelled => continue,
            };

            let fresh: Vec<SocketAddr> = response
                .values
                .iter()
                .copied()
                .filter(|peer| seen_peers.insert(*peer))
                .collect();
            if reports_peers && !fresh.is_empty() {
                debug!(info_hash = %target, from = %node.addr, peers = fresh.len(), "found peers");
                lookup.peers.extend(fresh.iter().copied());
                engine.emit(DhtEvent::PeersFound {
                    info_hash: target,
                    peers: fresh,
                });
            }

            for found in response.nodes {
                if found.id != local_id && seen.insert(found.id) {
                    shortlist.push(found);
                }
            }
            lookup
                .responders
                .push((Node::new(response.id, node.addr), response.token));
        }

        shortlist.sort_by(|a, b| distance_cmp(&target, &a.id, &b.id));
        shortlist.truncate(k);

        let closer = match (shortlist.first(), best) {
            (Some(first), Some(current)) => distance_cmp(&target, &first.id, &current).is_lt(),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if closer {
            best = shortlist.first().map(|n| n.id);
        } else if convergence == Convergence::NoCloser {
            break;
        }
    }

    debug!(
        target = %target,
        rounds = lookup.rounds,
        queried = lookup.queried,
        found = shortlist.len(),
        "lookup completed"
    );
    lookup.closest = shortlist;
    lookup
}

async fn resolve_routers(hosts: &[String]) -> Vec<SocketAddr> {
    let mut routers = Vec::new();
    for host in hosts {
        match tokio::net::lookup_host(host.as_str()).await {
            Ok(addrs) => routers.extend(addrs.filter(SocketAddr::is_ipv4)),
            Err(e) => debug!(host = %host, error = %e, "failed to resolve bootstrap router"),
        }
    }
    routers
}

/// Ask routers, whose ids we do not know, for nodes near `target`.
async fn query_routers<T: DhtTransport>(
    engine: &DhtEngine<T>,
    routers: &[SocketAddr],
    target: NodeId,
) -> Vec<Node> {
    let mut join_set = JoinSet::new();
    for &router in routers {
        let engine = engine.clone();
        join_set.spawn(async move {
            (router, send_query(&engine, router, None, Query::FindNode { target }).await)
        });
    }

    let mut nodes = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        let Ok((router, outcome)) = joined else {
            continue;
        };
        match outcome.response() {
            Some(response) => {
                trace!(router = %router, nodes = response.nodes.len(), "router answered");
                nodes.push(Node::new(response.id, router));
                nodes.extend(response.nodes);
            }
            None => debug!(router = %router, "bootstrap router did not answer"),
        }
    }
    nodes
}

/// Populate the routing table from `seeds`, falling back to the configured
/// routers when there are no seeds or they yield too few nodes.
pub async fn initialise<T: DhtTransport>(
    engine: DhtEngine<T>,
    seeds: Vec<Node>,
) -> InitialiseSummary {
    let config = engine.config().clone();
    let local_id = engine.id();
    let mut summary = InitialiseSummary::default();
    let mut use_routers = seeds.is_empty();

    if !seeds.is_empty() {
        engine.add_nodes(seeds.clone()).await;
    }

    while summary.attempts < config.max_bootstrap_attempts.max(1) {
        if engine.state() == DhtState::Stopped {
            return summary;
        }
        summary.attempts += 1;

        let shortlist = if use_routers {
            summary.used_routers = true;
            let routers = resolve_routers(&config.bootstrap_hosts).await;
            debug!(routers = routers.len(), attempt = summary.attempts, "bootstrapping from routers");
            query_routers(&engine, &routers, local_id).await
        } else {
            debug!(seeds = seeds.len(), attempt = summary.attempts, "bootstrapping from seeds");
            seeds.clone()
        };

        iterative_lookup(
            &engine,
            local_id,
            Query::FindNode { target: local_id },
            shortlist,
            Convergence::Exhaust,
        )
        .await;

        summary.nodes = engine.node_count().await;
        // Only a seeded start falls back to the routers.
        if summary.nodes >= config.min_bootstrap_nodes || summary.used_routers {
            break;
        }
        debug!(nodes = summary.nodes, "seeds yielded too few nodes");
        use_routers = true;
    }

    if summary.nodes == 0 {
        warn!(attempts = summary.attempts, "bootstrap found no nodes");
        return summary;
    }
    info!(nodes = summary.nodes, attempts = summary.attempts, "bootstrap complete");
    engine.set_state(DhtState::Ready);
    summary
}

pub async fn get_peers<T: DhtTransport>(engine: DhtEngine<T>, info_hash: InfoHash) -> LookupSummary {
    let shortlist = engine.closest(info_hash).await;
    let lookup = iterative_lookup(
        &engine,
        info_hash,
        Query::GetPeers { info_hash },
        shortlist,
        Convergence::NoCloser,
    )
    .await;

    LookupSummary {
        info_hash,
        peers: lookup.peers,
        closest: lookup.closest,
        queried: lookup.queried,
        rounds: lookup.rounds,
    }
}

/// Find the K closest token holders for `info_hash` and announce to each.
pub async fn announce<T: DhtTransport>(
    engine: DhtEngine<T>,
    info_hash: InfoHash,
    port: u16,
) -> AnnounceSummary {
    let shortlist = engine.closest(info_hash).await;
    let lookup = iterative_lookup(
        &engine,
        info_hash,
        Query::GetPeers { info_hash },
        shortlist,
        Convergence::NoCloser,
    )
    .await;

    let mut holders: Vec<(Node, Vec<u8>)> = lookup
        .responders
        .into_iter()
        .filter_map(|(node, token)| token.map(|token| (node, token)))
        .collect();
    holders.sort_by(|a, b| distance_cmp(&info_hash, &a.0.id, &b.0.id));
    holders.truncate(engine.config().bucket_size);

    let implied_port = port == 0;
    let mut join_set = JoinSet::new();
    for (node, token) in holders {
        let engine = engine.clone();
        join_set.spawn(async move {
            let query = Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
            };
            let outcome = send_query(&engine, node.addr, Some(node.id), query).await;
            (node, outcome)
        });
    }

    let mut announced_to = 0;
    while let Some(joined) = join_set.join_next().await {
        let Ok((node, outcome)) = joined else {
            continue;
        };
        match outcome {
            QueryOutcome::Responded(_) => announced_to += 1,
            QueryOutcome::Error { code, message } => {
                debug!(addr = %node.addr, code, message = %message, "announce rejected");
            }
            QueryOutcome::TimedOut | QueryOutcome::Cancelled => {}
        }
    }

    info!(info_hash = %info_hash, port, announced_to, "announce complete");
    AnnounceSummary {
        info_hash,
        port,
        peers: lookup.peers,
        announced_to,
    }
}

/// Query the bucket's nodes, oldest first, until one answers.
pub async fn refresh_bucket<T: DhtTransport>(engine: &DhtEngine<T>, refresh: RefreshTarget) -> bool {
    let target = refresh.target;
    for node in refresh.nodes {
        match send_query(engine, node.addr, Some(node.id), Query::FindNode { target }).await {
            QueryOutcome::Responded(_) => {
                trace!(target = %target, node = %node.id, "bucket refreshed");
                return true;
            }
            QueryOutcome::Cancelled => return false,
            QueryOutcome::TimedOut | QueryOutcome::Error { .. } => {}
        }
    }
    debug!(target = %target, "no node in stale bucket answered");
    false
}
