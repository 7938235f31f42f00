//! Persistent storage for server pool reputation.
//!
//! The pool's knowledge of the network (node records, reputation counters,
//! dial history) is written to a single bincode file so that a restart can
//! go straight back to servers that behaved well. The file is owned by the
//! pool actor; nothing else writes it.
//!
//! - Writes go to `<path>.tmp` and are renamed into place
//! - Unreadable, truncated or foreign-version files are discarded with a
//!   warning and the pool starts empty

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::identity::NodeRecord;
use crate::messages::{deserialize_bounded, serialize};

/// Format version of the persisted file.
pub const STORE_VERSION: u32 = 1;

/// Reputation counters kept for every known server.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Reputation {
    pub successes: f64,
    pub timeouts: f64,
    pub invalid_responses: f64,
    pub failures: f64,
    /// Exponentially weighted response latency, in milliseconds.
    pub latency_ms: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub record: NodeRecord,
    pub reputation: Reputation,
    pub last_seen_ms: u64,
    pub dial_failures: u32,
}

#[derive(Serialize, Deserialize)]
struct PersistedPool {
    version: u32,
    entries: Vec<PersistedEntry>,
}

#[derive(Clone, Debug)]
pub struct PoolStore {
    path: PathBuf,
}

impl PoolStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Load persisted entries. Never fails: a missing file yields an empty
    /// pool, a damaged one is logged and ignored.
    pub async fn load(&self) -> Vec<PersistedEntry> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted server pool");
                return Vec::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read server pool, starting empty");
                return Vec::new();
            }
        };

        match deserialize_bounded::<PersistedPool>(&bytes) {
            Ok(pool) if pool.version == STORE_VERSION => {
                info!(path = %self.path.display(), entries = pool.entries.len(), "loaded server pool");
                pool.entries
            }
            Ok(pool) => {
                warn!(
                    path = %self.path.display(),
                    version = pool.version,
                    expected = STORE_VERSION,
                    "discarding server pool with unknown version"
                );
                Vec::new()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding corrupt server pool");
                Vec::new()
            }
        }
    }

    pub async fn save(&self, entries: Vec<PersistedEntry>) -> Result<()> {
        let count = entries.len();
        let bytes = serialize(&PersistedPool {
            version: STORE_VERSION,
            entries,
        })
        .context("failed to encode server pool")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to move {} into place", tmp.display()))?;

        debug!(path = %self.path.display(), entries = count, bytes = bytes.len(), "server pool flushed");
        Ok(())
    }
}
