//! # Light Client Facade
//!
//! [`LightClient`] wires the peer set, server pool, request distributor and
//! retrieval manager together and exposes the hooks a transport layer calls
//! as connections come and go.
//!
//! ## Quick Start
//!
//! ```ignore
//! let client = LightClient::new(LightClientConfig::default(), dialer, Some("pool.bin".into()));
//! client.add_candidates(bootnodes).await;
//!
//! // From the transport, after a handshake:
//! client.on_peer_connect(info, connection).await?;
//! // For every inbound reply:
//! client.on_response(peer_id, response);
//!
//! let code = client
//!     .retrieve(OdrRequest::Code { root, code_hash }, content_hash(code_hash), Duration::from_secs(10))
//!     .await?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::distributor::{DistributorConfig, RequestDistributor};
use crate::identity::{NodeId, NodeRecord};
use crate::messages::{OdrRequest, OdrResponse, RequestKey};
use crate::peer::{HeadInfo, PeerConnection, PeerInfo, ServingPeer};
use crate::peerset::PeerSet;
use crate::retrieve::{RetrieveConfig, RetrieveError, RetrieveManager};
use crate::serverpool::{Dialer, ServerPool, ServerPoolConfig};
use crate::storage::PoolStore;
use crate::verify::VerifyFn;

#[derive(Clone, Debug, Default)]
pub struct LightClientConfig {
    pub distributor: DistributorConfig,
    pub pool: ServerPoolConfig,
    pub retrieve: RetrieveConfig,
}

#[derive(Clone)]
pub struct LightClient {
    peers: Arc<PeerSet>,
    pool: ServerPool,
    distributor: RequestDistributor,
    retriever: RetrieveManager,
}

impl LightClient {
    /// Build and start all components. Must be called inside a tokio runtime.
    /// Without a `store_path` the pool's reputation lives in memory only.
    pub fn new(config: LightClientConfig, dialer: Arc<dyn Dialer>, store_path: Option<PathBuf>) -> Self {
        let peers = Arc::new(PeerSet::new());
        let pool = ServerPool::spawn(config.pool, dialer, store_path.map(PoolStore::new));
        let distributor = RequestDistributor::spawn(peers.clone(), config.distributor);
        let retriever = RetrieveManager::new(
            peers.clone(),
            distributor.clone(),
            pool.clone(),
            config.retrieve,
        );
        Self {
            peers,
            pool,
            distributor,
            retriever,
        }
    }

    /// Register a freshly handshaken server.
    pub async fn on_peer_connect(
        &self,
        info: PeerInfo,
        connection: Arc<dyn PeerConnection>,
    ) -> Result<()> {
        let id = info.id;
        if !id.is_valid() {
            anyhow::bail!("refusing peer with zero id");
        }
        let peer = ServingPeer::spawn(info, connection);
        if let Err(e) = self.peers.register(peer.clone()) {
            peer.close();
            return Err(e).with_context(|| format!("failed to register peer {}", id.short()));
        }
        self.pool.connected(id).await;
        info!(
            peer = %id.short(),
            version = peer.version(),
            capabilities = ?peer.capabilities(),
            head = peer.head().number,
            "peer connected"
        );
        Ok(())
    }

    /// Drop a server. Attempts outstanding on it fail over to other peers.
    pub async fn on_peer_disconnect(&self, id: &NodeId) {
        if self.peers.unregister(id).is_some() {
            self.pool.disconnected(*id).await;
        } else {
            debug!(peer = %id.short(), "disconnect for unknown peer");
        }
    }

    pub fn on_response(&self, from: NodeId, response: OdrResponse) {
        self.retriever.on_response(from, response);
    }

    /// Record a new head announced by a connected server.
    pub fn on_announce(&self, id: &NodeId, head: HeadInfo) -> bool {
        self.peers.announce_head(id, head)
    }

    pub async fn add_candidates(&self, records: Vec<NodeRecord>) {
        self.pool.add_candidates(records).await;
    }

    pub fn spawn_discovery(&self, rx: mpsc::Receiver<NodeRecord>) -> JoinHandle<()> {
        self.pool.spawn_discovery(rx)
    }

    pub async fn retrieve(
        &self,
        request: OdrRequest,
        verify: VerifyFn,
        deadline: Duration,
    ) -> Result<Vec<u8>, RetrieveError> {
        self.retriever.retrieve(request, verify, deadline).await
    }

    pub fn cancel(&self, key: &RequestKey) -> bool {
        self.retriever.cancel(key)
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn pool(&self) -> &ServerPool {
        &self.pool
    }

    pub fn distributor(&self) -> &RequestDistributor {
        &self.distributor
    }

    pub fn retriever(&self) -> &RetrieveManager {
        &self.retriever
    }

    /// Cancel pending retrievals, drop all peers and flush the pool.
    pub async fn shutdown(&self) {
        info!(
            peers = self.peers.len(),
            pending = self.retriever.pending_count(),
            "light client shutting down"
        );
        self.retriever.cancel_all();
        self.peers.close();
        self.distributor.quit().await;
        self.pool.shutdown().await;
    }
}
