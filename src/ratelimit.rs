use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;

use crate::identity::NodeId;

pub const DEFAULT_MAX_DIALS_PER_SECOND: usize = 10;

/// A single node may be dialed at most this often per minute.
pub const DEFAULT_MAX_DIALS_PER_NODE_PER_MINUTE: usize = 4;

pub const MAX_TRACKED_NODES: usize = 1000;

const TRACKED_NODES_CAPACITY: NonZeroUsize = match NonZeroUsize::new(MAX_TRACKED_NODES) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: usize) -> Self {
        Self {
            tokens: capacity as f64,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, rate: f64, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_update = now;
    }

    fn try_consume(&mut self, rate: f64, capacity: f64) -> bool {
        self.refill(rate, capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Throttles outbound dials globally and per node. Owned by the server pool
/// actor, so no interior locking.
#[derive(Debug)]
pub struct DialRateLimiter {
    global: TokenBucket,
    per_node: LruCache<NodeId, TokenBucket>,
    global_per_second: usize,
    per_node_per_minute: usize,
}

impl DialRateLimiter {
    pub fn new(global_per_second: usize, per_node_per_minute: usize) -> Self {
        let global_per_second = global_per_second.max(1);
        let per_node_per_minute = per_node_per_minute.max(1);
        Self {
            global: TokenBucket::new(global_per_second),
            per_node: LruCache::new(TRACKED_NODES_CAPACITY),
            global_per_second,
            per_node_per_minute,
        }
    }

    /// Whether any dial could be admitted right now.
    pub fn has_global_budget(&mut self) -> bool {
        let rate = self.global_per_second as f64;
        self.global.refill(rate, rate);
        self.global.tokens >= 1.0
    }

    pub fn allow(&mut self, node: &NodeId) -> bool {
        let global_rate = self.global_per_second as f64;
        if !self.global.try_consume(global_rate, global_rate) {
            return false;
        }

        let capacity = self.per_node_per_minute as f64;
        let per_node_rate = capacity / 60.0;
        let per_node = self.per_node_per_minute;
        let bucket = self
            .per_node
            .get_or_insert_mut(*node, || TokenBucket::new(per_node));

        if !bucket.try_consume(per_node_rate, capacity) {
            self.global.tokens = (self.global.tokens + 1.0).min(global_rate);
            return false;
        }

        true
    }

    pub fn stats(&self) -> DialRateStats {
        DialRateStats {
            global_tokens_available: self.global.tokens,
            tracked_nodes: self.per_node.len(),
            global_rate_limit: self.global_per_second,
            per_node_rate_limit: self.per_node_per_minute,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DialRateStats {
    pub global_tokens_available: f64,
    pub tracked_nodes: usize,
    pub global_rate_limit: usize,
    pub per_node_rate_limit: usize,
}

impl Default for DialRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DIALS_PER_SECOND, DEFAULT_MAX_DIALS_PER_NODE_PER_MINUTE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 32])
    }

    #[test]
    fn per_node_limit_is_enforced() {
        let mut limiter = DialRateLimiter::new(100, 3);
        for _ in 0..3 {
            assert!(limiter.allow(&node(1)));
        }
        assert!(!limiter.allow(&node(1)));
        assert!(limiter.allow(&node(2)));
    }

    #[test]
    fn per_node_rejection_refunds_global_token() {
        let mut limiter = DialRateLimiter::new(5, 1);
        assert!(limiter.allow(&node(1)));
        let before = limiter.stats().global_tokens_available;
        assert!(!limiter.allow(&node(1)));
        let after = limiter.stats().global_tokens_available;
        assert!(after >= before - 1e-6, "global budget refunded: {before} -> {after}");
    }

    #[test]
    fn global_limit_caps_distinct_nodes() {
        let mut limiter = DialRateLimiter::new(4, 10);
        let admitted = (1..=10).filter(|i| limiter.allow(&node(*i))).count();
        assert_eq!(admitted, 4);
        assert!(!limiter.has_global_budget());
    }

    #[test]
    fn tracked_nodes_are_bounded() {
        let mut limiter = DialRateLimiter::new(10_000, 1);
        for i in 0..(MAX_TRACKED_NODES + 50) {
            let mut bytes = [0u8; 32];
            bytes[..8].copy_from_slice(&(i as u64 + 1).to_be_bytes());
            limiter.allow(&NodeId::from_bytes(bytes));
        }
        assert_eq!(limiter.stats().tracked_nodes, MAX_TRACKED_NODES);
    }
}
