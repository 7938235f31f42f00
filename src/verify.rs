//! Response verification hooks.
//!
//! The caller of a retrieval supplies a [`VerifyFn`] carrying whatever trust
//! anchor it holds (a header hash, a trie root, a code hash). A response that
//! fails verification penalises the serving peer and the retrieval moves on.

use std::sync::Arc;

use thiserror::Error;

use crate::messages::{Hash, OdrRequest};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("empty response")]
    Empty,
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("invalid proof: {0}")]
    InvalidProof(String),
}

pub type VerifyFn = Arc<dyn Fn(&OdrRequest, &[u8]) -> Result<(), VerifyError> + Send + Sync>;

/// Accept a payload only if its blake3 digest equals `expected`.
pub fn content_hash(expected: Hash) -> VerifyFn {
    Arc::new(move |_request, payload| {
        if payload.is_empty() {
            return Err(VerifyError::Empty);
        }
        let actual = blake3::hash(payload);
        if actual.as_bytes() != &expected {
            return Err(VerifyError::HashMismatch {
                expected: hex::encode(&expected[..8]),
                actual: hex::encode(&actual.as_bytes()[..8]),
            });
        }
        Ok(())
    })
}

/// Accept any non-empty payload.
pub fn non_empty() -> VerifyFn {
    Arc::new(|_request, payload| {
        if payload.is_empty() {
            Err(VerifyError::Empty)
        } else {
            Ok(())
        }
    })
}
