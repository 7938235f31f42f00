//! # Node Identities and Records
//!
//! - [`NodeId`]: 32-byte stable identifier of a serving node
//! - [`NodeRecord`]: a node identity plus the addresses it can be dialed on
//!
//! Records arrive from discovery and are persisted by the server pool, so both
//! types are serde-serializable. Log lines use [`NodeId::short`], the first
//! eight bytes in hex.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Eight-byte hex prefix used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// All-zero ids are reserved and never accepted from discovery.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|&b| b != 0)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<NodeId> for [u8; 32] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A dialable node as reported by discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub addrs: Vec<String>,
}

impl NodeRecord {
    pub fn new(id: NodeId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }

    /// Create a record with a single address.
    pub fn single(id: NodeId, addr: impl Into<String>) -> Self {
        Self::new(id, vec![addr.into()])
    }

    /// Get the primary address (first in the list).
    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(|s| s.as_str())
    }

    /// Merge addresses learned from a newer sighting of the same node,
    /// keeping the newest addresses first.
    pub fn merge(&mut self, newer: &NodeRecord) {
        if newer.addrs.is_empty() {
            return;
        }
        let mut merged = newer.addrs.clone();
        for addr in &self.addrs {
            if !merged.contains(addr) {
                merged.push(addr.clone());
            }
        }
        merged.truncate(MAX_RECORD_ADDRS);
        self.addrs = merged;
    }
}

/// Upper bound on addresses kept per record.
pub const MAX_RECORD_ADDRS: usize = 8;
