//! # High-Level DHT Node
//!
//! [`MainlineDht`] binds a UDP socket, wires it to a [`DhtEngine`] and owns the
//! receive loop. It is what the binary uses; embedders that bring their own
//! transport use [`DhtEngine`] directly.
//!
//! ```ignore
//! let dht = MainlineDht::bind("0.0.0.0:6881".parse()?, DhtConfig::default()).await?;
//! let store = NodeFile::new("dht-nodes.dat");
//! dht.start_from(&store).await?.wait().await?;
//!
//! let lookup = dht.get_peers(&info_hash)?.wait().await?;
//! println!("found {} peers", lookup.peers.len());
//!
//! dht.save_to(&store).await?;
//! dht.shutdown().await;
//! ```

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::dht::{DhtConfig, DhtEngine, DhtEvent, DhtState};
use crate::identity::{COMPACT_NODE_LEN, NodeId};
use crate::protocols::NodeStore;
use crate::tasks::{AnnounceSummary, InitialiseSummary, LookupSummary, TaskHandle};
use crate::transport::UdpTransport;

pub struct MainlineDht {
    engine: DhtEngine<UdpTransport>,
    local_addr: SocketAddr,
    listener: JoinHandle<()>,
}

impl MainlineDht {
    pub async fn bind(addr: SocketAddr, config: DhtConfig) -> Result<Self> {
        let transport = UdpTransport::bind(addr)
            .await
            .with_context(|| format!("failed to bind udp socket on {addr}"))?;
        let local_addr = transport.local_addr();
        let engine = DhtEngine::new(transport.clone(), config);
        let listener = transport.spawn_recv_loop(engine.clone());
        info!(id = %engine.id(), addr = %local_addr, "dht node bound");
        Ok(Self {
            engine,
            local_addr,
            listener,
        })
    }

    pub fn id(&self) -> NodeId {
        self.engine.id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn engine(&self) -> &DhtEngine<UdpTransport> {
        &self.engine
    }

    pub fn state(&self) -> DhtState {
        self.engine.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DhtEvent> {
        self.engine.subscribe()
    }

    pub fn start(&self, seed: Option<&[u8]>) -> Result<TaskHandle<InitialiseSummary>> {
        self.engine.start(seed)
    }

    /// Start, seeding bootstrap with whatever `store` saved last time.
    pub async fn start_from(&self, store: &dyn NodeStore) -> Result<TaskHandle<InitialiseSummary>> {
        let saved = store.load().await?;
        debug!(nodes = saved.len() / COMPACT_NODE_LEN, "loaded saved nodes");
        let seed = (!saved.is_empty()).then_some(saved.as_slice());
        self.engine.start(seed)
    }

    pub fn get_peers(&self, info_hash: &[u8]) -> Result<TaskHandle<LookupSummary>> {
        self.engine.get_peers(info_hash)
    }

    pub fn announce(&self, info_hash: &[u8], port: u16) -> Result<TaskHandle<AnnounceSummary>> {
        self.engine.announce(info_hash, port)
    }

    pub fn add(&self, nodes: &[u8]) -> Result<()> {
        self.engine.add(nodes)
    }

    pub async fn node_count(&self) -> usize {
        self.engine.node_count().await
    }

    pub async fn save_nodes(&self) -> Result<Vec<u8>> {
        self.engine.save_nodes().await
    }

    pub async fn save_to(&self, store: &dyn NodeStore) -> Result<()> {
        let nodes = self.engine.save_nodes().await?;
        store.save(&nodes).await?;
        debug!(nodes = nodes.len() / COMPACT_NODE_LEN, "saved nodes");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.listener.abort();
        self.engine.stop().await;
    }
}

/// Saved nodes in a plain file of concatenated compact records.
#[derive(Clone, Debug)]
pub struct NodeFile {
    path: PathBuf,
}

impl NodeFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl NodeStore for NodeFile {
    async fn load(&self) -> Result<Vec<u8>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read {}", self.path.display()))
            }
        }
    }

    async fn save(&self, nodes: &[u8]) -> Result<()> {
        tokio::fs::write(&self.path, nodes)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}
