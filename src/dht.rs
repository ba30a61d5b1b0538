//! # DHT Engine
//!
//! [`DhtEngine`] is a cheap, cloneable handle. All mutable state lives in a
//! private actor task that processes one command at a time:
//!
//! | State | Owner |
//! |-------|-------|
//! | [`RoutingTable`] | actor |
//! | [`TokenManager`] | actor |
//! | [`PeerStore`] | actor |
//! | [`MessageLoop`] (pending transactions) | actor |
//! | lifecycle [`DhtState`] | `watch` channel shared by handles |
//!
//! Inbound datagrams, outbound queries, query expiry and maintenance scans
//! all reach the actor as [`Command`]s, so no routing-table mutation can race
//! another. Multi-step operations (bootstrap, lookups, announce, refresh) run
//! as separate tasks in [`crate::tasks`] and talk to the actor through the
//! handle.
//!
//! ## Lifecycle
//!
//! ```text
//! NotReady --start()--> Initialising --bootstrap done--> Ready
//!     \__________________________\_________________________\__stop()--> Stopped
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow, bail};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::identity::{ID_LEN, InfoHash, Node, NodeId, decode_compact_nodes};
use crate::messages::{Body, ErrorCode, KrpcMessage, MessageError, Query, Response, decode, encode};
use crate::protocols::DhtTransport;
use crate::routing::{RefreshTarget, RoutingTable};
use crate::rpc::{MessageLoop, PendingQuery, QueryOutcome};
use crate::storage::PeerStore;
use crate::tasks::{
    self, AnnounceSummary, InitialiseSummary, LookupSummary, TaskHandle,
};
use crate::token::TokenManager;

const COMMAND_CHANNEL_CAPACITY: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunables for a [`DhtEngine`].
#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Bucket capacity K; also the lookup width and per-round query bound.
    pub bucket_size: usize,
    /// Time a query may stay unanswered before it resolves as timed out.
    pub query_timeout: Duration,
    /// A bucket unchanged for this long is refreshed.
    pub bucket_refresh_timeout: Duration,
    /// Granularity of the maintenance tick.
    pub maintenance_interval: Duration,
    /// Consecutive timeouts before a node may turn `Bad`.
    pub max_failures: u32,
    /// Recent contact within this window keeps a node from turning `Bad`.
    pub good_window: Duration,
    /// Token secret rotation period.
    pub token_rotation: Duration,
    /// Run the bootstrap task from `start`.
    pub bootstrap: bool,
    /// Well-known routers used when no seeds are given or seeds fall short.
    pub bootstrap_hosts: Vec<String>,
    /// Seed bootstrap is retried through the routers below this table size.
    pub min_bootstrap_nodes: usize,
    pub max_bootstrap_attempts: u32,
    pub max_lookup_rounds: usize,
    pub max_peers_per_torrent: usize,
    pub max_torrents: usize,
    pub peer_ttl: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bucket_size: 8,
            query_timeout: Duration::from_secs(15),
            bucket_refresh_timeout: Duration::from_secs(15 * 60),
            maintenance_interval: Duration::from_secs(1),
            max_failures: 2,
            good_window: Duration::from_secs(15 * 60),
            token_rotation: Duration::from_secs(5 * 60),
            bootstrap: true,
            bootstrap_hosts: vec![
                "router.bittorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
                "router.utorrent.com:6881".to_string(),
            ],
            min_bootstrap_nodes: 10,
            max_bootstrap_attempts: 2,
            max_lookup_rounds: 20,
            max_peers_per_torrent: 100,
            max_torrents: 10_000,
            peer_ttl: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhtState {
    NotReady,
    Initialising,
    Ready,
    Stopped,
}

/// Notifications broadcast to [`DhtEngine::subscribe`] receivers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DhtEvent {
    /// Peers for `info_hash` not yet reported by the same lookup.
    PeersFound {
        info_hash: InfoHash,
        peers: Vec<SocketAddr>,
    },
    StateChanged(DhtState),
    /// A remote node announced itself to us with a valid token.
    PeerAnnounced {
        info_hash: InfoHash,
        peer: SocketAddr,
    },
}

pub struct DhtEngine<T: DhtTransport> {
    cmd_tx: mpsc::Sender<Command>,
    id: NodeId,
    transport: Arc<T>,
    config: Arc<DhtConfig>,
    events: broadcast::Sender<DhtEvent>,
    state: Arc<watch::Sender<DhtState>>,
    started: Arc<AtomicBool>,
}

impl<T: DhtTransport> Clone for DhtEngine<T> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            transport: self.transport.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            started: self.started.clone(),
        }
    }
}

struct DhtEngineActor<T: DhtTransport> {
    id: NodeId,
    config: Arc<DhtConfig>,
    routing: RoutingTable,
    tokens: TokenManager,
    peers: PeerStore,
    messages: MessageLoop,
    transport: Arc<T>,
    events: broadcast::Sender<DhtEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::WeakSender<Command>,
}

enum Command {
    // Network
    Datagram(Vec<u8>, SocketAddr),
    SendQuery {
        to: SocketAddr,
        node: Option<NodeId>,
        query: Query,
        reply: oneshot::Sender<QueryOutcome>,
    },
    Expire(Vec<u8>, u64),

    // Routing table
    AddNodes(Vec<Node>),
    Closest(NodeId, oneshot::Sender<Vec<Node>>),
    NodeCount(oneshot::Sender<usize>),
    SaveNodes(oneshot::Sender<Vec<u8>>),

    // Maintenance
    Maintenance(oneshot::Sender<Vec<RefreshTarget>>),

    Quit,
}

fn parse_info_hash(bytes: &[u8]) -> Result<InfoHash> {
    NodeId::from_slice(bytes)
        .ok_or_else(|| anyhow!("info_hash must be {ID_LEN} bytes, got {}", bytes.len()))
}

impl<T: DhtTransport> DhtEngine<T> {
    /// Create an engine with a fresh random id. Must be called inside a
    /// tokio runtime; the actor is spawned immediately and exits once every
    /// handle is dropped. After [`start`](DhtEngine::start) the maintenance
    /// loop holds a handle too, so a started engine runs until
    /// [`stop`](DhtEngine::stop).
    pub fn new(transport: T, config: DhtConfig) -> Self {
        Self::with_id(NodeId::random(), transport, config)
    }

    pub fn with_id(id: NodeId, transport: T, config: DhtConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(DhtState::NotReady);
        let transport = Arc::new(transport);
        let config = Arc::new(config);

        let actor = DhtEngineActor {
            id,
            routing: RoutingTable::new(id, config.bucket_size),
            tokens: TokenManager::new(config.token_rotation),
            peers: PeerStore::new(config.max_torrents, config.max_peers_per_torrent, config.peer_ttl),
            messages: MessageLoop::new(),
            transport: transport.clone(),
            events: events.clone(),
            config: config.clone(),
            cmd_rx,
            cmd_tx: cmd_tx.downgrade(),
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            id,
            transport,
            config,
            events,
            state: Arc::new(state),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> DhtState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<DhtState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DhtEvent> {
        self.events.subscribe()
    }

    /// Feed an inbound datagram to the engine.
    pub async fn handle_datagram(&self, datagram: Vec<u8>, from: SocketAddr) {
        let _ = self.cmd_tx.send(Command::Datagram(datagram, from)).await;
    }

    /// Start maintenance and, when enabled, bootstrap.
    ///
    /// `seed` holds compact node records, typically from [`save_nodes`] of a
    /// previous run. The handle resolves when bootstrap finishes.
    ///
    /// [`save_nodes`]: DhtEngine::save_nodes
    pub fn start(&self, seed: Option<&[u8]>) -> Result<TaskHandle<InitialiseSummary>> {
        self.ensure_running()?;
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("dht engine already started");
        }

        let seeds = seed.map(decode_compact_nodes).unwrap_or_default();
        self.spawn_maintenance();

        if !self.config.bootstrap {
            info!(id = %self.id, "dht started without bootstrap");
            self.set_state(DhtState::Ready);
            return Ok(TaskHandle::ready(InitialiseSummary::default()));
        }

        info!(id = %self.id, seeds = seeds.len(), "dht bootstrapping");
        self.set_state(DhtState::Initialising);
        Ok(TaskHandle::spawn(tasks::initialise(self.clone(), seeds)))
    }

    /// Stop the engine. Pending queries resolve as cancelled and later calls
    /// fail.
    pub async fn stop(&self) {
        self.set_state(DhtState::Stopped);
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    /// Look up peers for `info_hash`. New peers are also broadcast as
    /// [`DhtEvent::PeersFound`] while the lookup runs.
    pub fn get_peers(&self, info_hash: &[u8]) -> Result<TaskHandle<LookupSummary>> {
        self.ensure_running()?;
        let info_hash = parse_info_hash(info_hash)?;
        debug!(info_hash = %info_hash, "get_peers requested");
        Ok(TaskHandle::spawn(tasks::get_peers(self.clone(), info_hash)))
    }

    /// Announce that we serve `info_hash` on `port`. Port 0 asks receivers to
    /// use the source port of our datagrams instead.
    pub fn announce(&self, info_hash: &[u8], port: u16) -> Result<TaskHandle<AnnounceSummary>> {
        self.ensure_running()?;
        let info_hash = parse_info_hash(info_hash)?;
        debug!(info_hash = %info_hash, port, "announce requested");
        Ok(TaskHandle::spawn(tasks::announce(self.clone(), info_hash, port)))
    }

    /// Ping every node in `nodes` (compact records). Nodes that answer join
    /// the routing table.
    pub fn add(&self, nodes: &[u8]) -> Result<()> {
        self.ensure_running()?;
        for node in decode_compact_nodes(nodes) {
            let engine = self.clone();
            tokio::spawn(async move {
                tasks::send_query(&engine, node.addr, Some(node.id), Query::Ping).await;
            });
        }
        Ok(())
    }

    /// Compact records of every non-`Bad` node, for a later `start`.
    pub async fn save_nodes(&self) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SaveNodes(tx))
            .await
            .map_err(|_| anyhow!("dht engine is stopped"))?;
        rx.await.map_err(|_| anyhow!("dht engine is stopped"))
    }

    /// Number of nodes currently held in buckets.
    pub async fn node_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::NodeCount(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state() == DhtState::Stopped {
            bail!("dht engine is stopped");
        }
        Ok(())
    }

    pub(crate) fn set_state(&self, next: DhtState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next || *state == DhtState::Stopped {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            info!(id = %self.id, state = ?next, "dht state changed");
            let _ = self.events.send(DhtEvent::StateChanged(next));
        }
    }

    pub(crate) fn emit(&self, event: DhtEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) async fn query(
        &self,
        to: SocketAddr,
        node: Option<NodeId>,
        query: Query,
    ) -> QueryOutcome {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::SendQuery {
            to,
            node,
            query,
            reply,
        };
        if self.cmd_tx.send(cmd).await.is_err() {
            return QueryOutcome::Cancelled;
        }
        rx.await.unwrap_or(QueryOutcome::Cancelled)
    }

    pub(crate) async fn closest(&self, target: NodeId) -> Vec<Node> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Closest(target, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub(crate) async fn add_nodes(&self, nodes: Vec<Node>) {
        let _ = self.cmd_tx.send(Command::AddNodes(nodes)).await;
    }

    fn spawn_maintenance(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.maintenance_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if engine.state() == DhtState::Stopped {
                    break;
                }

                let (tx, rx) = oneshot::channel();
                if engine.cmd_tx.send(Command::Maintenance(tx)).await.is_err() {
                    break;
                }
                let stale = match rx.await {
                    Ok(stale) => stale,
                    Err(_) => break,
                };

                for target in stale {
                    debug!(target = %target.target, nodes = target.nodes.len(), "refreshing stale bucket");
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        tasks::refresh_bucket(&engine, target).await;
                    });
                }
            }
            trace!("maintenance loop exited");
        });
    }
}

impl<T: DhtTransport> DhtEngineActor<T> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Datagram(bytes, from) => {
                    self.handle_datagram(&bytes, from);
                }
                Command::SendQuery {
                    to,
                    node,
                    query,
                    reply,
                } => {
                    self.handle_send_query(to, node, query, reply);
                }
                Command::Expire(tid, generation) => {
                    self.handle_expire(&tid, generation);
                }
                Command::AddNodes(nodes) => {
                    for node in nodes {
                        self.routing.add(node);
                    }
                }
                Command::Closest(target, reply) => {
                    let _ = reply.send(self.routing.get_closest(&target));
                }
                Command::NodeCount(reply) => {
                    let _ = reply.send(self.routing.len());
                }
                Command::SaveNodes(reply) => {
                    let _ = reply.send(self.routing.compact_nodes());
                }
                Command::Maintenance(reply) => {
                    self.routing.age_nodes(self.config.good_window);
                    self.peers.sweep();
                    let stale = self
                        .routing
                        .take_stale_buckets(self.config.bucket_refresh_timeout);
                    let _ = reply.send(stale);
                }
                Command::Quit => {
                    debug!(pending = self.messages.len(), "dht actor shutting down");
                    self.messages.cancel_all();
                    break;
                }
            }
        }
    }

    fn handle_send_query(
        &mut self,
        to: SocketAddr,
        node: Option<NodeId>,
        query: Query,
        reply: oneshot::Sender<QueryOutcome>,
    ) {
        let Some(tid) = self.messages.next_transaction_id() else {
            warn!(pending = self.messages.len(), "no free transaction id");
            let _ = reply.send(QueryOutcome::Cancelled);
            return;
        };
        let method = query.method();
        let bytes = match encode(&KrpcMessage::query(tid.clone(), self.id, query)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, method, "failed to encode query");
                let _ = reply.send(QueryOutcome::Cancelled);
                return;
            }
        };

        trace!(addr = %to, method, "sending query");
        let generation = self
            .messages
            .insert(tid.clone(), PendingQuery::new(to, node, method, reply));
        self.send_datagram(bytes, to);

        let cmd_tx = self.cmd_tx.clone();
        let timeout = self.config.query_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(cmd_tx) = cmd_tx.upgrade() {
                let _ = cmd_tx.send(Command::Expire(tid, generation)).await;
            }
        });
    }

    fn handle_expire(&mut self, tid: &[u8], generation: u64) {
        let Some(pending) = self.messages.expire(tid, generation) else {
            return;
        };
        debug!(addr = %pending.to(), method = pending.method(), "query timed out");
        if let Some(id) = pending.node()
            && let Some(state) =
                self.routing
                    .record_failure(&id, self.config.max_failures, self.config.good_window)
        {
            trace!(node = %id, state = ?state, "recorded query failure");
        }
        pending.complete(QueryOutcome::TimedOut);
    }

    fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let message = match decode(bytes) {
            Ok(message) => message,
            Err(MessageError::BadArguments {
                transaction_id,
                reason,
            }) => {
                debug!(addr = %from, reason, "rejecting query with bad arguments");
                self.send_message(
                    KrpcMessage::error(transaction_id, ErrorCode::Protocol, reason),
                    from,
                );
                return;
            }
            Err(MessageError::UnknownMethod {
                transaction_id,
                method,
            }) => {
                debug!(addr = %from, method = %method, "rejecting unknown method");
                self.send_message(
                    KrpcMessage::error(transaction_id, ErrorCode::MethodUnknown, "Method Unknown"),
                    from,
                );
                return;
            }
            Err(e) => {
                trace!(addr = %from, error = %e, "dropping undecodable datagram");
                return;
            }
        };

        let tid = message.transaction_id;
        match message.body {
            Body::Query { id, query } => {
                self.routing.record_seen(id, from);
                self.handle_query(tid, query, from);
            }
            Body::Response(response) => {
                let Some(pending) = self.messages.resolve(&tid, from) else {
                    trace!(addr = %from, "dropping unsolicited response");
                    return;
                };
                trace!(
                    addr = %from,
                    method = pending.method(),
                    rtt_ms = pending.elapsed().as_millis() as u64,
                    "query answered"
                );
                self.routing.record_seen(response.id, from);
                pending.complete(QueryOutcome::Responded(response));
            }
            Body::Error { code, message } => {
                let Some(pending) = self.messages.resolve(&tid, from) else {
                    trace!(addr = %from, code, "dropping unsolicited error");
                    return;
                };
                debug!(addr = %from, code, message = %message, method = pending.method(), "query failed");
                pending.complete(QueryOutcome::Error { code, message });
            }
        }
    }

    fn handle_query(&mut self, tid: Vec<u8>, query: Query, from: SocketAddr) {
        let mut response = Response::new(self.id);
        match query {
            Query::Ping => {}
            Query::FindNode { target } => {
                response.nodes = self.routing.get_closest(&target);
            }
            Query::GetPeers { info_hash } => {
                let values = self.peers.peers(&info_hash);
                if values.is_empty() {
                    response.nodes = self.routing.get_closest(&info_hash);
                } else {
                    response.values = values;
                }
                response.token = Some(self.tokens.generate(from));
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
            } => {
                if !self.tokens.verify(from, &token) {
                    debug!(addr = %from, info_hash = %info_hash, "announce with invalid token");
                    self.send_message(
                        KrpcMessage::error(tid, ErrorCode::Protocol, "invalid token"),
                        from,
                    );
                    return;
                }
                let peer = if implied_port {
                    from
                } else {
                    SocketAddr::new(from.ip(), port)
                };
                self.peers.insert(info_hash, peer);
                debug!(info_hash = %info_hash, peer = %peer, "stored announced peer");
                let _ = self.events.send(DhtEvent::PeerAnnounced { info_hash, peer });
            }
        }
        self.send_message(KrpcMessage::response(tid, response), from);
    }

    fn send_message(&self, message: KrpcMessage, to: SocketAddr) {
        match encode(&message) {
            Ok(bytes) => self.send_datagram(bytes, to),
            Err(e) => warn!(addr = %to, error = %e, "failed to encode message"),
        }
    }

    fn send_datagram(&self, bytes: Vec<u8>, to: SocketAddr) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.send_to(bytes, to).await {
                debug!(addr = %to, error = %e, "datagram send failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::identity::encode_compact_nodes;

    /// Records outbound datagrams without delivering them.
    #[derive(Default)]
    struct CaptureTransport {
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl CaptureTransport {
        fn sent(&self) -> Vec<(KrpcMessage, SocketAddr)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(bytes, to)| (decode(bytes).unwrap(), *to))
                .collect()
        }
    }

    #[async_trait]
    impl DhtTransport for CaptureTransport {
        async fn send_to(&self, datagram: Vec<u8>, to: SocketAddr) -> Result<()> {
            self.sent.lock().unwrap().push((datagram, to));
            Ok(())
        }
    }

    fn quiet_config() -> DhtConfig {
        DhtConfig {
            bootstrap: false,
            ..DhtConfig::default()
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 9], port))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn query_from(
        engine: &DhtEngine<CaptureTransport>,
        from: SocketAddr,
        sender: NodeId,
        query: Query,
    ) -> KrpcMessage {
        let bytes = encode(&KrpcMessage::query(b"q1".to_vec(), sender, query)).unwrap();
        engine.handle_datagram(bytes, from).await;
        settle().await;
        engine
            .transport()
            .sent()
            .into_iter()
            .rev()
            .find(|(msg, to)| *to == from && msg.transaction_id == b"q1")
            .map(|(msg, _)| msg)
            .unwrap()
    }

    #[tokio::test]
    async fn ping_is_answered_and_sender_learned() {
        let engine = DhtEngine::new(CaptureTransport::default(), quiet_config());
        let sender = NodeId::random();
        let reply = query_from(&engine, addr(1), sender, Query::Ping).await;
        assert_eq!(reply.body, Body::Response(Response::new(engine.id())));
        assert_eq!(engine.node_count().await, 1);
    }

    #[tokio::test]
    async fn unknown_method_gets_204() {
        let engine = DhtEngine::new(CaptureTransport::default(), quiet_config());
        let bytes = b"d1:ad2:id20:abcdefghij0123456789e1:q4:vote1:t2:q11:y1:qe".to_vec();
        engine.handle_datagram(bytes, addr(1)).await;
        settle().await;
        let sent = engine.transport().sent();
        assert!(matches!(sent[0].0.body, Body::Error { code: 204, .. }));
    }

    #[tokio::test]
    async fn announce_requires_token_from_get_peers() {
        let engine = DhtEngine::new(CaptureTransport::default(), quiet_config());
        let mut events = engine.subscribe();
        let sender = NodeId::random();
        let info_hash = NodeId::random();

        let bad = query_from(
            &engine,
            addr(1),
            sender,
            Query::AnnouncePeer {
                info_hash,
                port: 7000,
                implied_port: false,
                token: b"forged".to_vec(),
            },
        )
        .await;
        assert!(matches!(bad.body, Body::Error { code: 203, .. }));

        let peers = query_from(&engine, addr(1), sender, Query::GetPeers { info_hash }).await;
        let Body::Response(response) = peers.body else {
            panic!("expected response");
        };
        let token = response.token.unwrap();

        let ok = query_from(
            &engine,
            addr(1),
            sender,
            Query::AnnouncePeer {
                info_hash,
                port: 7000,
                implied_port: false,
                token,
            },
        )
        .await;
        assert!(matches!(ok.body, Body::Response(_)));

        let announced = SocketAddr::new(addr(1).ip(), 7000);
        assert_eq!(
            events.recv().await.unwrap(),
            DhtEvent::PeerAnnounced {
                info_hash,
                peer: announced
            }
        );

        let served = query_from(&engine, addr(2), NodeId::random(), Query::GetPeers { info_hash }).await;
        let Body::Response(response) = served.body else {
            panic!("expected response");
        };
        assert_eq!(response.values, vec![announced]);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_query_times_out() {
        let engine = DhtEngine::new(CaptureTransport::default(), quiet_config());
        let outcome = engine.query(addr(1), None, Query::Ping).await;
        assert_eq!(outcome, QueryOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn actor_exits_when_last_handle_dropped() {
        let engine = DhtEngine::new(CaptureTransport::default(), quiet_config());
        let mut events = engine.subscribe();
        let pending = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.query(addr(1), None, Query::Ping).await })
        };
        settle().await;
        assert_eq!(engine.transport().sent().len(), 1);

        // The in-flight query still times out, then the actor sees no senders.
        drop(engine);
        assert_eq!(pending.await.unwrap(), QueryOutcome::TimedOut);
        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn response_resolves_pending_query() {
        let engine = DhtEngine::new(CaptureTransport::default(), quiet_config());
        let remote = NodeId::random();
        let pending = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.query(addr(1), Some(remote), Query::Ping).await })
        };
        settle().await;

        let (query, to) = engine.transport().sent().pop().unwrap();
        assert_eq!(to, addr(1));
        let reply = KrpcMessage::response(query.transaction_id.clone(), Response::new(remote));

        // Same transaction id from the wrong endpoint is ignored.
        engine.handle_datagram(encode(&reply).unwrap(), addr(2)).await;
        engine.handle_datagram(encode(&reply).unwrap(), addr(1)).await;

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, QueryOutcome::Responded(r) if r.id == remote));
        assert_eq!(engine.node_count().await, 1);
    }

    #[tokio::test]
    async fn invalid_arguments_fail_synchronously() {
        let engine = DhtEngine::new(CaptureTransport::default(), quiet_config());
        assert!(engine.get_peers(&[0u8; 19]).is_err());
        assert!(engine.announce(&[], 6881).is_err());
        engine.stop().await;
        assert!(engine.get_peers(&[0u8; 20]).is_err());
        assert!(engine.start(None).is_err());
    }

    #[tokio::test]
    async fn start_without_bootstrap_is_ready() {
        let engine = DhtEngine::new(CaptureTransport::default(), quiet_config());
        let mut events = engine.subscribe();
        assert_eq!(engine.state(), DhtState::NotReady);
        engine.start(None).unwrap().wait().await.unwrap();
        assert_eq!(engine.state(), DhtState::Ready);
        assert_eq!(events.recv().await.unwrap(), DhtEvent::StateChanged(DhtState::Ready));
        assert!(engine.start(None).is_err());
    }

    #[tokio::test]
    async fn add_pings_each_node() {
        let engine = DhtEngine::new(CaptureTransport::default(), quiet_config());
        let nodes = vec![
            Node::new(NodeId::random(), addr(1)),
            Node::new(NodeId::random(), addr(2)),
        ];
        engine.add(&encode_compact_nodes(&nodes)).unwrap();
        settle().await;
        let pings: Vec<SocketAddr> = engine
            .transport()
            .sent()
            .into_iter()
            .filter(|(msg, _)| matches!(msg.body, Body::Query { query: Query::Ping, .. }))
            .map(|(_, to)| to)
            .collect();
        assert_eq!(pings.len(), 2);
        assert!(pings.contains(&addr(1)) && pings.contains(&addr(2)));
    }
}
