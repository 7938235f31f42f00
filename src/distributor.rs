//! # Request Distribution
//!
//! The [`RequestDistributor`] decides which connected server handles each
//! request. It runs as an actor owning a FIFO queue of waiting requests and is
//! woken by three things: a new submission, a peer releasing a request slot,
//! and peer membership or head changes published by the [`PeerSet`].
//!
//! ## Selection
//!
//! For every queued request, in submission order, the candidates are the
//! connected peers that satisfy the request's eligibility predicate and still
//! have a free slot under their concurrency ceiling. The candidate with the
//! lowest [`CostPolicy`] cost wins; equal costs go to the lowest node id.
//! A request with no candidate stays queued.
//!
//! ## Slots
//!
//! Dispatch takes one slot on the chosen peer and the caller must hand it back
//! through [`RequestDistributor::release`] when the attempt ends, whatever the
//! outcome.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::messages::{OdrMessage, RequestKind};
use crate::peer::ServingPeer;
use crate::peerset::{PeerEvent, PeerSet};

/// Round-trip assumed for a peer that has not answered this kind yet.
pub const DEFAULT_RTT: Duration = Duration::from_millis(500);

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Tunable cost heuristic for choosing between eligible peers.
///
/// `cost = backlog_weight * in_flight + latency_weight * rtt_ms * (in_flight + 1)`
///
/// The second term approximates when the new request would complete if the
/// peer works through its backlog at its observed round-trip time.
#[derive(Clone, Debug)]
pub struct CostPolicy {
    pub latency_weight: f64,
    pub backlog_weight: f64,
    pub default_rtt: Duration,
}

impl Default for CostPolicy {
    fn default() -> Self {
        Self {
            latency_weight: 1.0,
            backlog_weight: 50.0,
            default_rtt: DEFAULT_RTT,
        }
    }
}

impl CostPolicy {
    pub fn cost(&self, peer: &ServingPeer, kind: RequestKind) -> f64 {
        let backlog = peer.in_flight() as f64;
        let rtt_ms = peer
            .rtt_estimate(kind)
            .unwrap_or(self.default_rtt)
            .as_secs_f64()
            * 1000.0;
        self.backlog_weight * backlog + self.latency_weight * rtt_ms * (backlog + 1.0)
    }
}

#[derive(Clone, Debug, Default)]
pub struct DistributorConfig {
    pub cost: CostPolicy,
}

pub type Eligibility = Box<dyn Fn(&ServingPeer) -> bool + Send + Sync>;

/// Builds the outbound message for the selected peer. Returning `None`
/// declines the peer and selection moves on to the next candidate.
pub type MessageBuilder = Box<dyn FnMut(&ServingPeer) -> Option<OdrMessage> + Send>;

/// One request waiting for a peer.
pub struct DistRequest {
    pub kind: RequestKind,
    pub can_serve: Eligibility,
    pub build: MessageBuilder,
}

/// Result of a successful dispatch.
pub struct Dispatched {
    pub peer: Arc<ServingPeer>,
    pub req_id: u64,
    /// Encoded size of the message handed to the peer.
    pub bytes: u64,
    /// Resolves once the peer's connection accepted or rejected the message.
    pub sent: oneshot::Receiver<Result<()>>,
}

/// Handle to a submitted request.
pub struct DistTicket {
    pub id: u64,
    pub assigned: oneshot::Receiver<Dispatched>,
}

#[derive(Debug, Clone, Default)]
pub struct DistributorStats {
    pub queued: usize,
    pub dispatched: u64,
    pub canceled: u64,
}

struct Queued {
    id: u64,
    request: DistRequest,
    reply: oneshot::Sender<Dispatched>,
}

enum Command {
    Queue(Queued),
    Cancel(u64, oneshot::Sender<bool>),
    Wake,
    GetStats(oneshot::Sender<DistributorStats>),
    Quit,
}

#[derive(Clone)]
pub struct RequestDistributor {
    cmd_tx: mpsc::Sender<Command>,
    peers: Arc<PeerSet>,
    next_id: Arc<AtomicU64>,
}

impl RequestDistributor {
    pub fn spawn(peers: Arc<PeerSet>, config: DistributorConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = DistributorActor {
            peers: peers.clone(),
            config,
            queue: VecDeque::new(),
            dispatched: 0,
            canceled: 0,
        };
        let events = peers.subscribe();
        tokio::spawn(actor.run(cmd_rx, events));

        Self {
            cmd_tx,
            peers,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Queue a request. The ticket's `assigned` receiver resolves once a peer
    /// has been chosen and the message handed to its writer.
    pub async fn distribute(&self, request: DistRequest) -> Result<DistTicket> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, assigned) = oneshot::channel();
        self.cmd_tx
            .send(Command::Queue(Queued { id, request, reply }))
            .await
            .map_err(|_| anyhow::anyhow!("distributor actor closed"))?;
        Ok(DistTicket { id, assigned })
    }

    /// Withdraw a queued request. Returns `false` if it was already
    /// dispatched (or never existed); dispatched requests are not recalled.
    pub async fn cancel(&self, id: u64) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Cancel(id, tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Return a dispatch slot and let waiting requests re-evaluate.
    pub fn release(&self, peer: &ServingPeer) {
        peer.release();
        self.peers.notify_load_changed(peer.id());
        // Released peers may already be gone from the set; wake directly too.
        let _ = self.cmd_tx.try_send(Command::Wake);
    }

    pub async fn stats(&self) -> DistributorStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetStats(tx)).await.is_err() {
            return DistributorStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

struct DistributorActor {
    peers: Arc<PeerSet>,
    config: DistributorConfig,
    queue: VecDeque<Queued>,
    dispatched: u64,
    canceled: u64,
}

impl DistributorActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut events: broadcast::Receiver<PeerEvent>,
    ) {
        let mut events_open = true;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Queue(queued)) => {
                            trace!(id = queued.id, kind = %queued.request.kind, "request queued");
                            self.queue.push_back(queued);
                        }
                        Some(Command::Cancel(id, reply)) => {
                            let _ = reply.send(self.cancel(id));
                        }
                        Some(Command::Wake) => {}
                        Some(Command::GetStats(reply)) => {
                            let _ = reply.send(DistributorStats {
                                queued: self.queue.len(),
                                dispatched: self.dispatched,
                                canceled: self.canceled,
                            });
                        }
                        Some(Command::Quit) | None => {
                            debug!(queued = self.queue.len(), "distributor actor quitting");
                            break;
                        }
                    }
                }
                event = events.recv(), if events_open => {
                    match event {
                        Ok(event) => trace!(?event, "peer event"),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "peer events lagged, re-running selection");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            events_open = false;
                        }
                    }
                }
            }
            self.dispatch_pending();
        }
    }

    fn cancel(&mut self, id: u64) -> bool {
        match self.queue.iter().position(|q| q.id == id) {
            Some(pos) => {
                self.queue.remove(pos);
                self.canceled += 1;
                trace!(id, "queued request withdrawn");
                true
            }
            None => false,
        }
    }

    /// Walk the queue in order and hand out every request that has a peer.
    fn dispatch_pending(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let peers = self.peers.all_peers();
        let mut idx = 0;
        while idx < self.queue.len() {
            if self.queue[idx].reply.is_closed() {
                // Caller gave up before a peer was found.
                self.queue.remove(idx);
                continue;
            }
            match self.try_dispatch(idx, &peers) {
                Some(dispatched) => {
                    let Some(queued) = self.queue.remove(idx) else {
                        break;
                    };
                    let peer = dispatched.peer.clone();
                    debug!(
                        id = queued.id,
                        req_id = dispatched.req_id,
                        peer = %peer.id().short(),
                        in_flight = peer.in_flight(),
                        "request dispatched"
                    );
                    self.dispatched += 1;
                    if queued.reply.send(dispatched).is_err() {
                        // Caller vanished between the check and the send.
                        peer.release();
                    }
                }
                None => idx += 1,
            }
        }
    }

    fn try_dispatch(&mut self, idx: usize, peers: &[Arc<ServingPeer>]) -> Option<Dispatched> {
        let policy = &self.config.cost;
        let queued = &mut self.queue[idx];
        let kind = queued.request.kind;

        let mut candidates: Vec<(f64, &Arc<ServingPeer>)> = peers
            .iter()
            .filter(|p| {
                let peer: &ServingPeer = p;
                !peer.is_closed() && peer.has_capacity() && (queued.request.can_serve)(peer)
            })
            .map(|p| (policy.cost(p, kind), p))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.id().cmp(&b.1.id())));

        for (cost, peer) in candidates {
            if !peer.try_acquire() {
                continue;
            }
            let target: &ServingPeer = peer;
            let Some(message) = (queued.request.build)(target) else {
                peer.release();
                continue;
            };
            let req_id = message.req_id;
            let bytes = message.encode().map_or(0, |encoded| encoded.len() as u64);
            match peer.enqueue(message) {
                Ok(sent) => {
                    trace!(peer = %peer.id().short(), cost, "peer selected");
                    return Some(Dispatched {
                        peer: peer.clone(),
                        req_id,
                        bytes,
                        sent,
                    });
                }
                Err(e) => {
                    peer.release();
                    warn!(peer = %peer.id().short(), error = %e, "failed to enqueue request");
                }
            }
        }
        None
    }
}
