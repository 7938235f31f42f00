//! Registry of connected serving peers.
//!
//! Membership and head changes are published on a broadcast channel so the
//! request distributor can re-run selection without polling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::identity::NodeId;
use crate::peer::{HeadInfo, ServingPeer};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Joined(NodeId),
    Left(NodeId),
    /// Head or capacity changed; requests waiting on this peer may now fit.
    LoadChanged(NodeId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerSetError {
    #[error("peer {0:?} is already registered")]
    AlreadyRegistered(NodeId),
    #[error("peer set is closed")]
    Closed,
}

pub struct PeerSet {
    peers: StdRwLock<HashMap<NodeId, Arc<ServingPeer>>>,
    events: broadcast::Sender<PeerEvent>,
    closed: AtomicBool,
}

impl PeerSet {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            peers: StdRwLock::new(HashMap::new()),
            events,
            closed: AtomicBool::new(false),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, Arc<ServingPeer>>> {
        self.peers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, Arc<ServingPeer>>> {
        self.peers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, peer: Arc<ServingPeer>) -> Result<(), PeerSetError> {
        let id = peer.id();
        {
            let mut peers = self.write();
            if self.closed.load(Ordering::Acquire) {
                return Err(PeerSetError::Closed);
            }
            if peers.contains_key(&id) {
                return Err(PeerSetError::AlreadyRegistered(id));
            }
            peers.insert(id, peer);
        }
        info!(peer = %id.short(), "serving peer registered");
        let _ = self.events.send(PeerEvent::Joined(id));
        Ok(())
    }

    /// Remove a peer and close it. Attempts waiting on the peer observe the
    /// close before this returns.
    pub fn unregister(&self, id: &NodeId) -> Option<Arc<ServingPeer>> {
        let removed = self.write().remove(id);
        if let Some(peer) = &removed {
            peer.close();
            info!(peer = %id.short(), in_flight = peer.in_flight(), "serving peer unregistered");
            let _ = self.events.send(PeerEvent::Left(*id));
        }
        removed
    }

    pub fn peer(&self, id: &NodeId) -> Option<Arc<ServingPeer>> {
        self.read().get(id).cloned()
    }

    /// Snapshot of all peers ordered by id.
    pub fn all_peers(&self) -> Vec<Arc<ServingPeer>> {
        let mut peers: Vec<_> = self.read().values().cloned().collect();
        peers.sort_by_key(|p| p.id());
        peers
    }

    pub fn any(&self, pred: impl Fn(&ServingPeer) -> bool) -> bool {
        self.read().values().any(|p| pred(p))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a new head announcement.
    pub fn announce_head(&self, id: &NodeId, head: HeadInfo) -> bool {
        let Some(peer) = self.peer(id) else {
            return false;
        };
        debug!(peer = %id.short(), number = head.number, "head announced");
        peer.set_head(head);
        let _ = self.events.send(PeerEvent::LoadChanged(*id));
        true
    }

    pub(crate) fn notify_load_changed(&self, id: NodeId) {
        let _ = self.events.send(PeerEvent::LoadChanged(id));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Unregister every peer and refuse new registrations.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self.write().drain().collect();
        for (id, peer) in drained {
            peer.close();
            let _ = self.events.send(PeerEvent::Left(id));
        }
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Capabilities, OdrMessage, LPV2};
    use crate::peer::{PeerConnection, PeerInfo};

    struct NullConnection;

    #[async_trait::async_trait]
    impl PeerConnection for NullConnection {
        async fn send(&self, _message: OdrMessage) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn peer(byte: u8) -> Arc<ServingPeer> {
        let info = PeerInfo::new(
            NodeId::from_bytes([byte; 32]),
            LPV2,
            Capabilities::all(),
            HeadInfo::default(),
        );
        ServingPeer::spawn(info, Arc::new(NullConnection))
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let set = PeerSet::new();
        set.register(peer(1)).unwrap();
        assert_eq!(
            set.register(peer(1)),
            Err(PeerSetError::AlreadyRegistered(NodeId::from_bytes([1; 32])))
        );
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn unregister_closes_peer_and_emits_left() {
        let set = PeerSet::new();
        let mut events = set.subscribe();
        let p = peer(2);
        set.register(p.clone()).unwrap();
        assert_eq!(events.recv().await.unwrap(), PeerEvent::Joined(p.id()));

        let removed = set.unregister(&p.id()).expect("registered");
        assert!(removed.is_closed());
        assert_eq!(events.recv().await.unwrap(), PeerEvent::Left(p.id()));
        assert!(set.peer(&p.id()).is_none());
        assert!(set.unregister(&p.id()).is_none());
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_id() {
        let set = PeerSet::new();
        for byte in [5, 1, 3] {
            set.register(peer(byte)).unwrap();
        }
        let ids: Vec<_> = set.all_peers().iter().map(|p| p.id().as_bytes()[0]).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn announce_updates_head_and_notifies() {
        let set = PeerSet::new();
        let p = peer(4);
        set.register(p.clone()).unwrap();
        let mut events = set.subscribe();

        assert!(set.announce_head(&p.id(), HeadInfo { number: 77, ..HeadInfo::default() }));
        assert_eq!(p.head().number, 77);
        assert_eq!(events.recv().await.unwrap(), PeerEvent::LoadChanged(p.id()));
        assert!(!set.announce_head(&NodeId::from_bytes([9; 32]), HeadInfo::default()));
    }

    #[tokio::test]
    async fn closed_set_rejects_registration() {
        let set = PeerSet::new();
        let p = peer(6);
        set.register(p.clone()).unwrap();
        set.close();
        assert!(p.is_closed());
        assert!(set.is_empty());
        assert_eq!(set.register(peer(7)), Err(PeerSetError::Closed));
    }

    #[tokio::test]
    async fn concurrent_registration_admits_each_id_once() {
        let set = Arc::new(PeerSet::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let set = set.clone();
                tokio::spawn(async move { set.register(peer(1 + (i % 4) as u8)).is_ok() })
            })
            .collect();
        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(admitted, 4);
        assert_eq!(set.len(), 4);
    }
}
