//! # UDP Transport
//!
//! [`UdpTransport`] wraps one tokio `UdpSocket`. Outbound datagrams go through
//! [`DhtTransport::send_to`]; inbound datagrams are read by a spawned receive
//! loop and pushed into the engine.
//!
//! Datagrams larger than [`MAX_DATAGRAM_SIZE`] are truncated by the kernel and
//! then fail to decode, which drops them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::dht::DhtEngine;
use crate::protocols::DhtTransport;

/// Receive buffer size. KRPC messages fit well within one Ethernet MTU.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

#[derive(Clone, Debug)]
pub struct UdpTransport {
    inner: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            inner: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Read datagrams until the socket fails, handing each to `engine`.
    pub fn spawn_recv_loop(&self, engine: DhtEngine<UdpTransport>) -> JoinHandle<()> {
        let socket = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        trace!(addr = %from, len, "datagram received");
                        engine.handle_datagram(buf[..len].to_vec(), from).await;
                    }
                    // ICMP port-unreachable from an earlier send shows up here on
                    // some platforms; the socket itself is still usable.
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        trace!(error = %e, "ignoring connection reset");
                    }
                    Err(e) => {
                        warn!(error = %e, "udp receive failed, stopping receive loop");
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl DhtTransport for UdpTransport {
    async fn send_to(&self, datagram: Vec<u8>, to: SocketAddr) -> Result<()> {
        let sent = self.inner.send_to(&datagram, to).await?;
        if sent != datagram.len() {
            debug!(addr = %to, sent, len = datagram.len(), "short datagram write");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::DhtConfig;
    use crate::messages::Query;
    use crate::rpc::QueryOutcome;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn bind_reports_assigned_port() {
        let transport = UdpTransport::bind(loopback()).await.unwrap();
        assert_ne!(transport.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn engines_ping_over_loopback() {
        let config = DhtConfig {
            bootstrap: false,
            ..DhtConfig::default()
        };

        let a_sock = UdpTransport::bind(loopback()).await.unwrap();
        let b_sock = UdpTransport::bind(loopback()).await.unwrap();
        let a = DhtEngine::new(a_sock.clone(), config.clone());
        let b = DhtEngine::new(b_sock.clone(), config);
        let _a_recv = a_sock.spawn_recv_loop(a.clone());
        let _b_recv = b_sock.spawn_recv_loop(b.clone());

        let outcome = a.query(b_sock.local_addr(), None, Query::Ping).await;
        match outcome {
            QueryOutcome::Responded(response) => assert_eq!(response.id, b.id()),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(a.node_count().await, 1);
        assert_eq!(b.node_count().await, 1);
    }
}
