//! # Announced Peer Storage
//!
//! Peers that announced an info-hash to us, served back as `values` in our
//! `get_peers` responses. Bounded three ways:
//!
//! - at most `max_torrents` info-hashes, least recently used evicted first
//! - at most `max_peers` peers per info-hash, oldest announcement dropped
//! - announcements older than `ttl` are ignored and swept

use std::net::SocketAddr;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::identity::InfoHash;

#[derive(Clone, Copy, Debug)]
struct StoredPeer {
    addr: SocketAddr,
    announced_at: Instant,
}

pub struct PeerStore {
    torrents: LruCache<InfoHash, Vec<StoredPeer>>,
    max_peers: usize,
    ttl: Duration,
}

impl PeerStore {
    pub fn new(max_torrents: usize, max_peers: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_torrents).unwrap_or(NonZeroUsize::MIN);
        Self {
            torrents: LruCache::new(cap),
            max_peers: max_peers.max(1),
            ttl,
        }
    }

    /// Record that `addr` serves `info_hash`, refreshing an existing entry.
    pub fn insert(&mut self, info_hash: InfoHash, addr: SocketAddr) {
        let now = Instant::now();
        let peers = self.torrents.get_or_insert_mut(info_hash, Vec::new);
        if let Some(existing) = peers.iter_mut().find(|p| p.addr == addr) {
            existing.announced_at = now;
            return;
        }
        if peers.len() >= self.max_peers {
            if let Some(oldest) = peers
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.announced_at)
                .map(|(idx, _)| idx)
            {
                peers.swap_remove(oldest);
            }
        }
        peers.push(StoredPeer {
            addr,
            announced_at: now,
        });
    }

    /// Unexpired peers for `info_hash`.
    pub fn peers(&mut self, info_hash: &InfoHash) -> Vec<SocketAddr> {
        let ttl = self.ttl;
        self.torrents
            .get(info_hash)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|p| p.announced_at.elapsed() < ttl)
                    .map(|p| p.addr)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop expired announcements and empty info-hashes.
    pub fn sweep(&mut self) -> usize {
        let ttl = self.ttl;
        let mut removed = 0;
        let mut emptied = Vec::new();
        for (info_hash, peers) in self.torrents.iter_mut() {
            let before = peers.len();
            peers.retain(|p| p.announced_at.elapsed() < ttl);
            removed += before - peers.len();
            if peers.is_empty() {
                emptied.push(*info_hash);
            }
        }
        for info_hash in emptied {
            self.torrents.pop(&info_hash);
        }
        if removed > 0 {
            debug!(removed, torrents = self.torrents.len(), "swept expired peers");
        }
        removed
    }

    /// Number of info-hashes with stored peers.
    pub fn len(&self) -> usize {
        self.torrents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.torrents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 1, 1, 1], port))
    }

    #[tokio::test(start_paused = true)]
    async fn stores_and_refreshes_peers() {
        let mut store = PeerStore::new(10, 10, Duration::from_secs(60));
        let hash = NodeId::random();
        store.insert(hash, peer(1));
        store.insert(hash, peer(2));
        store.insert(hash, peer(1));
        let mut peers = store.peers(&hash);
        peers.sort();
        assert_eq!(peers, vec![peer(1), peer(2)]);
        assert!(store.peers(&NodeId::random()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn per_hash_cap_drops_oldest() {
        let mut store = PeerStore::new(10, 2, Duration::from_secs(60));
        let hash = NodeId::random();
        store.insert(hash, peer(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        store.insert(hash, peer(2));
        tokio::time::advance(Duration::from_secs(1)).await;
        store.insert(hash, peer(3));
        let mut peers = store.peers(&hash);
        peers.sort();
        assert_eq!(peers, vec![peer(2), peer(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn torrent_count_is_lru_bounded() {
        let mut store = PeerStore::new(2, 10, Duration::from_secs(60));
        let (a, b, c) = (NodeId::random(), NodeId::random(), NodeId::random());
        store.insert(a, peer(1));
        store.insert(b, peer(1));
        store.peers(&a);
        store.insert(c, peer(1));
        assert_eq!(store.len(), 2);
        assert!(!store.peers(&a).is_empty());
        assert!(store.peers(&b).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_peers_are_hidden_then_swept() {
        let mut store = PeerStore::new(10, 10, Duration::from_secs(60));
        let hash = NodeId::random();
        store.insert(hash, peer(1));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.peers(&hash).is_empty());
        assert_eq!(store.sweep(), 1);
        assert!(store.is_empty());
    }
}
