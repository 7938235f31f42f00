//! # Connected Serving Peers
//!
//! A [`ServingPeer`] is the client-side view of one connected light server:
//! what it can serve, what head it announced, how many requests it is
//! currently working on, and how fast it has answered each request kind.
//!
//! All outbound traffic to a peer goes through a single writer task that
//! drains the peer's queue and calls [`PeerConnection::send`] one message at a
//! time, so messages leave in dispatch order and the connection is never
//! written concurrently.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::identity::NodeId;
use crate::messages::{Capabilities, Hash, OdrMessage, OdrRequest, RequestKind};

/// Concurrency ceiling used when the handshake does not negotiate one.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Weight of the newest sample in the per-kind RTT moving average.
const RTT_EWMA_WEIGHT: f64 = 0.2;

/// Outbound half of a peer connection, implemented by the transport layer.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    async fn send(&self, message: OdrMessage) -> Result<()>;
}

/// Chain head last announced by a server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadInfo {
    pub hash: Hash,
    pub number: u64,
    pub td: u128,
}

/// Handshake result describing a newly connected server.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: NodeId,
    pub version: u32,
    pub capabilities: Capabilities,
    pub head: HeadInfo,
    pub max_in_flight: usize,
}

impl PeerInfo {
    pub fn new(id: NodeId, version: u32, capabilities: Capabilities, head: HeadInfo) -> Self {
        Self {
            id,
            version,
            capabilities,
            head,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }
}

struct Outbound {
    message: OdrMessage,
    sent: oneshot::Sender<Result<()>>,
}

pub struct ServingPeer {
    id: NodeId,
    version: u32,
    capabilities: Capabilities,
    max_in_flight: usize,
    head: StdRwLock<HeadInfo>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    rtt_ms: StdRwLock<[Option<f64>; RequestKind::COUNT]>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: watch::Sender<bool>,
}

impl ServingPeer {
    /// Create the peer and spawn its writer task.
    pub fn spawn(info: PeerInfo, connection: Arc<dyn PeerConnection>) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed, closed_rx) = watch::channel(false);

        let peer = Arc::new(Self {
            id: info.id,
            version: info.version,
            capabilities: info.capabilities,
            max_in_flight: info.max_in_flight.max(1),
            head: StdRwLock::new(info.head),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            rtt_ms: StdRwLock::new([None; RequestKind::COUNT]),
            outbound,
            closed,
        });

        tokio::spawn(run_writer(info.id, connection, outbound_rx, closed_rx));
        peer
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[inline]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    #[inline]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn head(&self) -> HeadInfo {
        self.head.read().map(|h| h.clone()).unwrap_or_default()
    }

    pub(crate) fn set_head(&self, head: HeadInfo) {
        if let Ok(mut guard) = self.head.write() {
            *guard = head;
        }
    }

    /// Capability, version and head check for one request.
    pub fn can_serve(&self, request: &OdrRequest) -> bool {
        let kind = request.kind();
        if self.version < kind.min_version() || !self.capabilities.contains(kind) {
            return false;
        }
        match request.required_head() {
            Some(number) => self.head().number >= number,
            None => true,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest in-flight count ever observed on this peer.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight() < self.max_in_flight
    }

    /// Reserve one request slot. Fails once the ceiling is reached.
    pub(crate) fn try_acquire(&self) -> bool {
        let acquired = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_in_flight).then_some(n + 1)
            });
        match acquired {
            Ok(prev) => {
                self.peak_in_flight.fetch_max(prev + 1, Ordering::AcqRel);
                true
            }
            Err(_) => false,
        }
    }

    pub(crate) fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Smoothed round-trip estimate for a request kind, if any sample exists.
    pub fn rtt_estimate(&self, kind: RequestKind) -> Option<Duration> {
        self.rtt_ms
            .read()
            .ok()
            .and_then(|rtt| rtt[kind.index()])
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }

    pub(crate) fn record_rtt(&self, kind: RequestKind, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        if let Ok(mut rtt) = self.rtt_ms.write() {
            let slot = &mut rtt[kind.index()];
            *slot = Some(match *slot {
                Some(avg) => avg + RTT_EWMA_WEIGHT * (sample - avg),
                None => sample,
            });
        }
    }

    /// Queue a message for the writer task. The returned receiver resolves
    /// once the connection accepted or rejected it.
    pub(crate) fn enqueue(&self, message: OdrMessage) -> Result<oneshot::Receiver<Result<()>>> {
        if self.is_closed() {
            anyhow::bail!("peer {} is closed", self.id.short());
        }
        let (sent, sent_rx) = oneshot::channel();
        self.outbound
            .send(Outbound { message, sent })
            .map_err(|_| anyhow::anyhow!("peer {} writer stopped", self.id.short()))?;
        Ok(sent_rx)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Resolves once the peer has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for ServingPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServingPeer")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("capabilities", &self.capabilities)
            .field("in_flight", &self.in_flight())
            .field("max_in_flight", &self.max_in_flight)
            .finish_non_exhaustive()
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

async fn run_writer(
    id: NodeId,
    connection: Arc<dyn PeerConnection>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed_rx) => {
                debug!(peer = %id.short(), "peer closed, writer stopping");
                break;
            }
            next = outbound_rx.recv() => {
                let Some(Outbound { message, sent }) = next else {
                    break;
                };
                let req_id = message.req_id;
                let result = connection.send(message).await;
                match &result {
                    Ok(()) => trace!(peer = %id.short(), req_id, "request sent"),
                    Err(e) => warn!(peer = %id.short(), req_id, error = %e, "request send failed"),
                }
                let _ = sent.send(result);
            }
        }
    }

    // Anything still queued is failed so waiting attempts do not linger.
    outbound_rx.close();
    while let Ok(Outbound { sent, .. }) = outbound_rx.try_recv() {
        let _ = sent.send(Err(anyhow::anyhow!("peer {} closed", id.short())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{WireRequest, LPV1, LPV2};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingConnection {
        sent: Mutex<Vec<u64>>,
        fail: bool,
    }

    #[async_trait]
    impl PeerConnection for RecordingConnection {
        async fn send(&self, message: OdrMessage) -> Result<()> {
            if self.fail {
                anyhow::bail!("injected send failure");
            }
            self.sent.lock().await.push(message.req_id);
            Ok(())
        }
    }

    fn info(version: u32, head: u64) -> PeerInfo {
        PeerInfo::new(
            NodeId::from_bytes([9; 32]),
            version,
            Capabilities::all(),
            HeadInfo { number: head, ..HeadInfo::default() },
        )
    }

    fn message(req_id: u64) -> OdrMessage {
        OdrMessage {
            req_id,
            version: LPV2,
            request: WireRequest::GetCode { root: [0; 32], code_hash: [1; 32] },
        }
    }

    #[tokio::test]
    async fn acquire_respects_ceiling() {
        let peer = ServingPeer::spawn(
            info(LPV2, 0).with_max_in_flight(2),
            Arc::new(RecordingConnection::default()),
        );
        assert!(peer.try_acquire());
        assert!(peer.try_acquire());
        assert!(!peer.try_acquire());
        assert_eq!(peer.in_flight(), 2);

        peer.release();
        assert!(peer.has_capacity());
        assert!(peer.try_acquire());
        assert_eq!(peer.peak_in_flight(), 2);

        peer.release();
        peer.release();
        peer.release();
        assert_eq!(peer.in_flight(), 0, "release never underflows");
    }

    #[tokio::test]
    async fn can_serve_checks_version_capability_and_head() {
        let conn = Arc::new(RecordingConnection::default());
        let old = ServingPeer::spawn(info(LPV1, 100), conn.clone());
        let bloom = OdrRequest::BloomBits { section: 0, bit: 1 };
        assert!(!old.can_serve(&bloom));

        let new = ServingPeer::spawn(info(LPV2, 100), conn.clone());
        assert!(new.can_serve(&bloom));

        let body = OdrRequest::BlockBody { hash: [0; 32], number: 101 };
        assert!(!new.can_serve(&body));
        new.set_head(HeadInfo { number: 101, ..HeadInfo::default() });
        assert!(new.can_serve(&body));

        let mut limited = info(LPV2, 500);
        limited.capabilities = Capabilities::all().without(crate::messages::RequestKind::Receipts);
        let limited = ServingPeer::spawn(limited, conn);
        assert!(!limited.can_serve(&OdrRequest::Receipts { hash: [0; 32], number: 1 }));
    }

    #[tokio::test]
    async fn rtt_estimate_is_smoothed() {
        let peer = ServingPeer::spawn(info(LPV2, 0), Arc::new(RecordingConnection::default()));
        let kind = RequestKind::Code;
        assert!(peer.rtt_estimate(kind).is_none());

        peer.record_rtt(kind, Duration::from_millis(100));
        assert_eq!(peer.rtt_estimate(kind), Some(Duration::from_millis(100)));

        peer.record_rtt(kind, Duration::from_millis(200));
        let ms = peer.rtt_estimate(kind).unwrap().as_secs_f64() * 1000.0;
        assert!((ms - 120.0).abs() < 0.001, "ewma was {ms}");
        assert!(peer.rtt_estimate(RequestKind::Receipts).is_none());
    }

    #[tokio::test]
    async fn writer_sends_in_queue_order() {
        let conn = Arc::new(RecordingConnection::default());
        let peer = ServingPeer::spawn(info(LPV2, 0), conn.clone());

        let mut acks = Vec::new();
        for req_id in 1..=5 {
            acks.push(peer.enqueue(message(req_id)).unwrap());
        }
        for ack in acks {
            ack.await.unwrap().unwrap();
        }
        assert_eq!(*conn.sent.lock().await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn send_failure_is_reported_to_the_sender() {
        let conn = Arc::new(RecordingConnection { fail: true, ..Default::default() });
        let peer = ServingPeer::spawn(info(LPV2, 0), conn);
        let ack = peer.enqueue(message(1)).unwrap();
        assert!(ack.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn closed_peer_rejects_new_messages() {
        let peer = ServingPeer::spawn(info(LPV2, 0), Arc::new(RecordingConnection::default()));
        peer.close();
        assert!(peer.is_closed());
        assert!(peer.enqueue(message(1)).is_err());
        tokio::time::timeout(Duration::from_secs(1), peer.closed())
            .await
            .expect("closed resolves immediately");
    }
}
