//! # Announce Tokens
//!
//! A `get_peers` response carries a token that the requester must echo in a
//! later `announce_peer`. Tokens are a truncated BLAKE3 keyed hash of the
//! requester's endpoint under a secret that rotates every `rotation` period.
//! Both the current and the previous secret are accepted, so a token stays
//! valid for at least one full period and at most two.

use std::net::{IpAddr, SocketAddr};

use rand::RngCore;
use rand::rngs::OsRng;
use tokio::time::{Duration, Instant};
use tracing::trace;

/// Bytes of keyed hash handed out as a token.
pub const TOKEN_LEN: usize = 8;

pub struct TokenManager {
    current: [u8; 32],
    previous: [u8; 32],
    rotated_at: Instant,
    rotation: Duration,
}

impl TokenManager {
    pub fn new(rotation: Duration) -> Self {
        Self {
            current: fresh_secret(),
            previous: fresh_secret(),
            rotated_at: Instant::now(),
            rotation,
        }
    }

    /// Issue a token bound to `addr`.
    pub fn generate(&mut self, addr: SocketAddr) -> Vec<u8> {
        self.rotate_if_due();
        token_for(&self.current, addr).to_vec()
    }

    /// Check a token presented by `addr`.
    pub fn verify(&mut self, addr: SocketAddr, token: &[u8]) -> bool {
        self.rotate_if_due();
        token == token_for(&self.current, addr).as_slice()
            || token == token_for(&self.previous, addr).as_slice()
    }

    fn rotate_if_due(&mut self) {
        let elapsed = self.rotated_at.elapsed();
        if elapsed < self.rotation {
            return;
        }
        if elapsed >= self.rotation * 2 {
            self.previous = fresh_secret();
        } else {
            self.previous = self.current;
        }
        self.current = fresh_secret();
        self.rotated_at = Instant::now();
        trace!("rotated token secret");
    }
}

fn fresh_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    secret
}

fn token_for(secret: &[u8; 32], addr: SocketAddr) -> [u8; TOKEN_LEN] {
    let mut input = Vec::with_capacity(18);
    match addr.ip() {
        IpAddr::V4(v4) => input.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => input.extend_from_slice(&v6.octets()),
    }
    input.extend_from_slice(&addr.port().to_be_bytes());

    let hash = blake3::keyed_hash(secret, &input);
    let mut out = [0u8; TOKEN_LEN];
    out.copy_from_slice(&hash.as_bytes()[..TOKEN_LEN]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROTATION: Duration = Duration::from_secs(300);

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, last], port))
    }

    #[tokio::test(start_paused = true)]
    async fn token_accepted_from_issuing_endpoint() {
        let mut tokens = TokenManager::new(ROTATION);
        let token = tokens.generate(addr(1, 6881));
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(tokens.verify(addr(1, 6881), &token));
    }

    #[tokio::test(start_paused = true)]
    async fn token_rejected_from_other_endpoint() {
        let mut tokens = TokenManager::new(ROTATION);
        let token = tokens.generate(addr(1, 6881));
        assert!(!tokens.verify(addr(2, 6881), &token));
        assert!(!tokens.verify(addr(1, 6882), &token));
        assert!(!tokens.verify(addr(1, 6881), b"garbage"));
    }

    #[tokio::test(start_paused = true)]
    async fn token_survives_one_rotation() {
        let mut tokens = TokenManager::new(ROTATION);
        let token = tokens.generate(addr(1, 6881));
        tokio::time::advance(ROTATION + Duration::from_secs(1)).await;
        assert!(tokens.verify(addr(1, 6881), &token));
    }

    #[tokio::test(start_paused = true)]
    async fn token_expires_after_two_rotations() {
        let mut tokens = TokenManager::new(ROTATION);
        let token = tokens.generate(addr(1, 6881));
        tokio::time::advance(ROTATION + Duration::from_secs(1)).await;
        tokens.generate(addr(9, 1));
        tokio::time::advance(ROTATION + Duration::from_secs(1)).await;
        assert!(!tokens.verify(addr(1, 6881), &token));
    }

    #[tokio::test(start_paused = true)]
    async fn long_idle_discards_both_secrets() {
        let mut tokens = TokenManager::new(ROTATION);
        let token = tokens.generate(addr(1, 6881));
        tokio::time::advance(ROTATION * 3).await;
        assert!(!tokens.verify(addr(1, 6881), &token));
    }
}
