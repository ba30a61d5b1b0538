//! Collaborator traits the DHT engine is written against.
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`DhtTransport`] | Send one datagram to one endpoint |
//! | [`NodeStore`] | Load and save compact node records between runs |
//!
//! Inbound datagrams are pushed into the engine with
//! [`DhtEngine::handle_datagram`](crate::dht::DhtEngine::handle_datagram), so
//! the engine never owns a socket.

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;

/// Outbound datagram delivery.
#[async_trait]
pub trait DhtTransport: Send + Sync + 'static {
    /// Send an encoded KRPC message to `to`. Delivery is best-effort.
    async fn send_to(&self, datagram: Vec<u8>, to: SocketAddr) -> Result<()>;
}

/// Persistence of known nodes as concatenated 26-byte compact records.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Previously saved records, empty when nothing was saved yet.
    async fn load(&self) -> Result<Vec<u8>>;

    async fn save(&self, nodes: &[u8]) -> Result<()>;
}
