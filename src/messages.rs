//! # Light Protocol Requests
//!
//! This module defines the request kinds that can be retrieved on demand and
//! the serializable wire shapes handed to the transport layer.
//!
//! | Request | Min version | Wire form (LPV1) | Wire form (LPV2) |
//! |---------|-------------|------------------|------------------|
//! | `BlockBody` | 1 | `GetBlockBodies` | `GetBlockBodies` |
//! | `Receipts` | 1 | `GetReceipts` | `GetReceipts` |
//! | `TrieNode` | 1 | `GetProofs` | `GetProofs` |
//! | `Code` | 1 | `GetCode` | `GetCode` |
//! | `HeaderByNumber` | 1 | `GetHeaderProofs` | `GetHelperTrieProofs(Cht)` |
//! | `BloomBits` | 2 | n/a | `GetHelperTrieProofs(BloomTrie)` |
//!
//! Messages are serialized using bincode with a size limit on decoding.
//! Responses carry an opaque payload; interpreting and verifying it is the
//! caller's job via the verify function passed to `retrieve`.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// 32-byte hash (block hash, trie root, code hash).
pub type Hash = [u8; 32];

/// First light protocol version.
pub const LPV1: u32 = 1;

/// Second light protocol version, adds helper-trie proofs.
pub const LPV2: u32 = 2;

/// Maximum size of a decoded message (header proofs and trie proofs are small;
/// bodies and receipts dominate).
pub const MAX_MESSAGE_SIZE: u64 = 4 * 1024 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RequestKind {
    BlockBody,
    Receipts,
    TrieNode,
    Code,
    HeaderByNumber,
    BloomBits,
}

impl RequestKind {
    pub const ALL: [RequestKind; 6] = [
        RequestKind::BlockBody,
        RequestKind::Receipts,
        RequestKind::TrieNode,
        RequestKind::Code,
        RequestKind::HeaderByNumber,
        RequestKind::BloomBits,
    ];

    pub const COUNT: usize = Self::ALL.len();

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Lowest protocol version able to serve this kind.
    pub fn min_version(self) -> u32 {
        match self {
            RequestKind::BloomBits => LPV2,
            _ => LPV1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::BlockBody => "block_body",
            RequestKind::Receipts => "receipts",
            RequestKind::TrieNode => "trie_node",
            RequestKind::Code => "code",
            RequestKind::HeaderByNumber => "header_by_number",
            RequestKind::BloomBits => "bloom_bits",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of request kinds a server advertises during the handshake.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const fn none() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        RequestKind::ALL
            .iter()
            .fold(Self::none(), |caps, kind| caps.with(*kind))
    }

    pub fn from_kinds(kinds: &[RequestKind]) -> Self {
        kinds.iter().fold(Self::none(), |caps, kind| caps.with(*kind))
    }

    #[must_use]
    pub fn with(self, kind: RequestKind) -> Self {
        Self(self.0 | (1 << kind.index()))
    }

    #[must_use]
    pub fn without(self, kind: RequestKind) -> Self {
        Self(self.0 & !(1 << kind.index()))
    }

    #[inline]
    pub fn contains(self, kind: RequestKind) -> bool {
        self.0 & (1 << kind.index()) != 0
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set()
            .entries(RequestKind::ALL.iter().filter(|k| self.contains(**k)))
            .finish()
    }
}

/// Identity of a logical retrieval, used for coalescing concurrent callers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey([u8; 32]);

impl RequestKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestKey({})", hex::encode(&self.0[..8]))
    }
}

/// A single piece of verifiable data to fetch from a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OdrRequest {
    BlockBody { hash: Hash, number: u64 },
    Receipts { hash: Hash, number: u64 },
    /// Account or storage proof for `key` under the state root.
    TrieNode { root: Hash, account: Hash, key: Vec<u8> },
    Code { root: Hash, code_hash: Hash },
    /// Canonical header proven against a CHT section root.
    HeaderByNumber { number: u64, cht_section: u64 },
    /// One bloom bit vector of a bloom-trie section.
    BloomBits { section: u64, bit: u16 },
}

impl OdrRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            OdrRequest::BlockBody { .. } => RequestKind::BlockBody,
            OdrRequest::Receipts { .. } => RequestKind::Receipts,
            OdrRequest::TrieNode { .. } => RequestKind::TrieNode,
            OdrRequest::Code { .. } => RequestKind::Code,
            OdrRequest::HeaderByNumber { .. } => RequestKind::HeaderByNumber,
            OdrRequest::BloomBits { .. } => RequestKind::BloomBits,
        }
    }

    /// Block number a server must have announced before it can serve this
    /// request.
    pub fn required_head(&self) -> Option<u64> {
        match self {
            OdrRequest::BlockBody { number, .. } | OdrRequest::Receipts { number, .. } => {
                Some(*number)
            }
            _ => None,
        }
    }

    /// Coalescing key. Two requests with equal fields produce the same key.
    pub fn key(&self) -> RequestKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[self.kind() as u8]);
        match self {
            OdrRequest::BlockBody { hash, number } | OdrRequest::Receipts { hash, number } => {
                hasher.update(hash);
                hasher.update(&number.to_be_bytes());
            }
            OdrRequest::TrieNode { root, account, key } => {
                hasher.update(root);
                hasher.update(account);
                hasher.update(&(key.len() as u32).to_be_bytes());
                hasher.update(key);
            }
            OdrRequest::Code { root, code_hash } => {
                hasher.update(root);
                hasher.update(code_hash);
            }
            OdrRequest::HeaderByNumber { number, cht_section } => {
                hasher.update(&number.to_be_bytes());
                hasher.update(&cht_section.to_be_bytes());
            }
            OdrRequest::BloomBits { section, bit } => {
                hasher.update(&section.to_be_bytes());
                hasher.update(&bit.to_be_bytes());
            }
        }
        RequestKey(*hasher.finalize().as_bytes())
    }

    /// Wire form for a server speaking `version`. Returns `None` when the
    /// version cannot express the request.
    pub fn encode_for(&self, version: u32) -> Option<WireRequest> {
        if version < self.kind().min_version() {
            return None;
        }
        let wire = match self {
            OdrRequest::BlockBody { hash, .. } => WireRequest::GetBlockBodies(vec![*hash]),
            OdrRequest::Receipts { hash, .. } => WireRequest::GetReceipts(vec![*hash]),
            OdrRequest::TrieNode { root, account, key } => WireRequest::GetProofs {
                root: *root,
                account: *account,
                key: key.clone(),
            },
            OdrRequest::Code { root, code_hash } => WireRequest::GetCode {
                root: *root,
                code_hash: *code_hash,
            },
            OdrRequest::HeaderByNumber { number, cht_section } if version < LPV2 => {
                WireRequest::GetHeaderProofs {
                    cht_section: *cht_section,
                    number: *number,
                }
            }
            OdrRequest::HeaderByNumber { number, cht_section } => WireRequest::GetHelperTrieProofs {
                trie: HelperTrie::Cht,
                section: *cht_section,
                key: number.to_be_bytes().to_vec(),
            },
            OdrRequest::BloomBits { section, bit } => {
                let mut key = Vec::with_capacity(10);
                key.extend_from_slice(&bit.to_be_bytes());
                key.extend_from_slice(&section.to_be_bytes());
                WireRequest::GetHelperTrieProofs {
                    trie: HelperTrie::BloomTrie,
                    section: *section,
                    key,
                }
            }
        };
        Some(wire)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelperTrie {
    Cht,
    BloomTrie,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireRequest {
    GetBlockBodies(Vec<Hash>),
    GetReceipts(Vec<Hash>),
    GetProofs { root: Hash, account: Hash, key: Vec<u8> },
    GetCode { root: Hash, code_hash: Hash },
    GetHeaderProofs { cht_section: u64, number: u64 },
    GetHelperTrieProofs { trie: HelperTrie, section: u64, key: Vec<u8> },
}

/// Outbound request as handed to a peer connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OdrMessage {
    pub req_id: u64,
    pub version: u32,
    pub request: WireRequest,
}

impl OdrMessage {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        deserialize_bounded(bytes)
    }
}

/// Server reply, matched to its request by `req_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OdrResponse {
    pub req_id: u64,
    pub payload: Vec<u8>,
}

impl OdrResponse {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        deserialize_bounded(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_track_individual_kinds() {
        let caps = Capabilities::from_kinds(&[RequestKind::Code, RequestKind::BloomBits]);
        assert!(caps.contains(RequestKind::Code));
        assert!(caps.contains(RequestKind::BloomBits));
        assert!(!caps.contains(RequestKind::Receipts));

        let caps = caps.without(RequestKind::Code);
        assert!(!caps.contains(RequestKind::Code));

        for kind in RequestKind::ALL {
            assert!(Capabilities::all().contains(kind));
            assert!(!Capabilities::none().contains(kind));
        }
    }

    #[test]
    fn equal_requests_share_a_key() {
        let a = OdrRequest::Receipts { hash: [1; 32], number: 10 };
        let b = OdrRequest::Receipts { hash: [1; 32], number: 10 };
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn kinds_with_equal_fields_do_not_collide() {
        let body = OdrRequest::BlockBody { hash: [1; 32], number: 10 };
        let receipts = OdrRequest::Receipts { hash: [1; 32], number: 10 };
        assert_ne!(body.key(), receipts.key());
    }

    #[test]
    fn bloom_bits_need_second_protocol_version() {
        let req = OdrRequest::BloomBits { section: 3, bit: 17 };
        assert!(req.encode_for(LPV1).is_none());

        match req.encode_for(LPV2) {
            Some(WireRequest::GetHelperTrieProofs { trie, section, key }) => {
                assert_eq!(trie, HelperTrie::BloomTrie);
                assert_eq!(section, 3);
                assert_eq!(key.len(), 10);
                assert_eq!(&key[..2], &17u16.to_be_bytes());
            }
            other => panic!("unexpected wire form: {other:?}"),
        }
    }

    #[test]
    fn distinct_bloom_bits_have_distinct_wire_keys() {
        let wire_key = |bit: u16| match (OdrRequest::BloomBits { section: 2, bit }).encode_for(LPV2) {
            Some(WireRequest::GetHelperTrieProofs { key, .. }) => key,
            other => panic!("unexpected wire form: {other:?}"),
        };
        assert_eq!(&wire_key(0x1234)[..2], &[0x12, 0x34]);
        assert_ne!(wire_key(1), wire_key(257));
        assert_ne!(wire_key(1), wire_key(u16::MAX));
    }

    #[test]
    fn header_proof_form_depends_on_version() {
        let req = OdrRequest::HeaderByNumber { number: 4096, cht_section: 1 };
        assert_eq!(
            req.encode_for(LPV1),
            Some(WireRequest::GetHeaderProofs { cht_section: 1, number: 4096 })
        );
        assert!(matches!(
            req.encode_for(LPV2),
            Some(WireRequest::GetHelperTrieProofs { trie: HelperTrie::Cht, .. })
        ));
    }

    #[test]
    fn only_block_scoped_requests_need_a_head() {
        assert_eq!(OdrRequest::BlockBody { hash: [0; 32], number: 9 }.required_head(), Some(9));
        assert_eq!(OdrRequest::Code { root: [0; 32], code_hash: [0; 32] }.required_head(), None);
    }

    #[test]
    fn message_decoding_rejects_truncated_input() {
        let msg = OdrMessage {
            req_id: 7,
            version: LPV2,
            request: WireRequest::GetCode { root: [2; 32], code_hash: [3; 32] },
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(OdrMessage::decode(&bytes).unwrap(), msg);
        assert!(OdrMessage::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
