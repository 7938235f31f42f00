//! # On-Demand Retrieval
//!
//! [`RetrieveManager::retrieve`] fetches one verifiable item from whichever
//! connected server can deliver it. Each logical retrieval runs in its own
//! task that loops over attempts:
//!
//! ```text
//! queue in distributor ──► dispatched to peer ──► response ──► verify ──► done
//!        ▲                        │                               │
//!        └──── timeout / disconnect / send failure ◄──────────────┘ invalid
//! ```
//!
//! Every failed attempt is reported to the [`ServerPool`] and the peer is
//! excluded from the rest of the retrieval. Attempts are strictly sequential.
//!
//! Identical requests issued concurrently share one task: later callers
//! attach to the retrieval already in flight and all of them receive the
//! same result. Dropping a caller's future detaches it; only
//! [`RetrieveManager::cancel`] tears the retrieval down.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::distributor::{DistRequest, DistTicket, Dispatched, RequestDistributor};
use crate::identity::NodeId;
use crate::messages::{OdrMessage, OdrRequest, OdrResponse, RequestKey};
use crate::peer::ServingPeer;
use crate::peerset::{PeerEvent, PeerSet};
use crate::serverpool::{Outcome, ServerPool};
use crate::verify::{VerifyError, VerifyFn};

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Stand-in deadline for durations too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Errors surfaced to retrieval callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetrieveError {
    #[error("no eligible peer available before the deadline")]
    NoPeerAvailable,
    #[error("retrieval failed after {attempts} attempts")]
    TerminalFailure { attempts: u32 },
    #[error("retrieval canceled")]
    Canceled,
}

/// Why a single attempt failed. Never leaves this module.
#[derive(Debug, Error)]
enum AttemptError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("response failed verification: {0}")]
    InvalidResponse(VerifyError),
    #[error("peer disconnected")]
    PeerDisconnected,
}

impl AttemptError {
    fn outcome(&self) -> Outcome {
        match self {
            AttemptError::Timeout(_) => Outcome::Timeout,
            AttemptError::InvalidResponse(_) => Outcome::InvalidResponse,
            AttemptError::PeerDisconnected => Outcome::Disconnected,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetrieveConfig {
    /// Time a dispatched peer has to answer before the attempt fails.
    pub attempt_timeout: Duration,
    /// Upper bound on dispatched attempts per retrieval.
    pub max_attempts: u32,
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrieveStats {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
    pub coalesced: u64,
    pub attempts: u64,
    pub timeouts: u64,
    pub invalid_responses: u64,
    pub disconnects: u64,
    /// Late, unsolicited or misrouted responses.
    pub discarded: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    coalesced: AtomicU64,
    attempts: AtomicU64,
    timeouts: AtomicU64,
    invalid_responses: AtomicU64,
    disconnects: AtomicU64,
    discarded: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

type RetrieveResult = Result<Vec<u8>, RetrieveError>;
type ResponseTx = mpsc::UnboundedSender<(NodeId, Vec<u8>)>;

struct Pending {
    /// Distinguishes a retrieval from a later one for the same key.
    id: u64,
    result: watch::Sender<Option<RetrieveResult>>,
    cancel: watch::Sender<bool>,
    attempts: Arc<AtomicU32>,
}

fn expired(attempts: u32) -> RetrieveError {
    if attempts == 0 {
        RetrieveError::NoPeerAvailable
    } else {
        RetrieveError::TerminalFailure { attempts }
    }
}

struct Inner {
    peers: Arc<PeerSet>,
    distributor: RequestDistributor,
    pool: ServerPool,
    config: RetrieveConfig,
    pending: StdMutex<HashMap<RequestKey, Pending>>,
    next_retrieval: AtomicU64,
    /// Dispatched attempts awaiting a response, by request id.
    sent: StdMutex<HashMap<u64, ResponseTx>>,
    counters: Counters,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<RequestKey, Pending>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sent(&self) -> MutexGuard<'_, HashMap<u64, ResponseTx>> {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a fresh request id for one attempt.
    fn register_attempt(&self, tx: ResponseTx) -> u64 {
        let mut sent = self.sent();
        let mut rng = rand::thread_rng();
        loop {
            let req_id: u64 = rng.gen();
            if req_id != 0 && !sent.contains_key(&req_id) {
                sent.insert(req_id, tx);
                return req_id;
            }
        }
    }

    fn finish(&self, key: RequestKey, id: u64, result: RetrieveResult) {
        let pending = {
            let mut pending = self.pending();
            let current = pending.get(&key).is_some_and(|entry| entry.id == id);
            if current {
                pending.remove(&key)
            } else {
                None
            }
        };
        // A canceled retrieval was already detached and counted.
        let Some(pending) = pending else {
            return;
        };
        let counter = match &result {
            Ok(_) => &self.counters.succeeded,
            Err(RetrieveError::Canceled) => &self.counters.canceled,
            Err(_) => &self.counters.failed,
        };
        bump(counter);
        pending.result.send_replace(Some(result));
    }

    fn cancel_entry(&self, pending: Pending) {
        bump(&self.counters.canceled);
        pending.cancel.send_replace(true);
        pending.result.send_replace(Some(Err(RetrieveError::Canceled)));
    }
}

/// Caller-facing retrieval front end. Cheap to clone.
#[derive(Clone)]
pub struct RetrieveManager {
    inner: Arc<Inner>,
}

impl RetrieveManager {
    pub fn new(
        peers: Arc<PeerSet>,
        distributor: RequestDistributor,
        pool: ServerPool,
        config: RetrieveConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                peers,
                distributor,
                pool,
                config,
                pending: StdMutex::new(HashMap::new()),
                next_retrieval: AtomicU64::new(1),
                sent: StdMutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Fetch and verify `request`, retrying on other peers as needed.
    ///
    /// `deadline` bounds the wait of every caller. A caller that attaches to
    /// a retrieval already in flight gives up at its own deadline or when the
    /// shared retrieval ends, whichever comes first.
    pub async fn retrieve(
        &self,
        request: OdrRequest,
        verify: VerifyFn,
        deadline: Duration,
    ) -> RetrieveResult {
        let key = request.key();
        let now = Instant::now();
        let until = now
            .checked_add(deadline)
            .unwrap_or_else(|| now + FAR_FUTURE);

        let (mut result_rx, attached) = {
            let mut pending = self.inner.pending();
            match pending.get(&key) {
                Some(existing) => {
                    bump(&self.inner.counters.coalesced);
                    trace!(key = ?key, "attached to retrieval in flight");
                    (existing.result.subscribe(), Some(existing.attempts.clone()))
                }
                None => {
                    let (result, result_rx) = watch::channel(None);
                    let (cancel, cancel_rx) = watch::channel(false);
                    let id = self.inner.next_retrieval.fetch_add(1, Ordering::Relaxed);
                    let attempts = Arc::new(AtomicU32::new(0));
                    pending.insert(
                        key,
                        Pending {
                            id,
                            result,
                            cancel,
                            attempts: attempts.clone(),
                        },
                    );
                    bump(&self.inner.counters.started);

                    let task = RetrievalTask {
                        inner: self.inner.clone(),
                        id,
                        key,
                        request,
                        verify,
                        deadline: until,
                        cancel_rx,
                        tried: HashSet::new(),
                        attempts: 0,
                        shared_attempts: attempts,
                    };
                    tokio::spawn(task.run());
                    (result_rx, None)
                }
            }
        };

        let Some(attempts) = attached else {
            return wait_result(&mut result_rx).await;
        };
        match timeout_at(until, wait_result(&mut result_rx)).await {
            Ok(result) => result,
            Err(_) => {
                let attempts = attempts.load(Ordering::Relaxed);
                trace!(key = ?key, attempts, "attached caller reached its deadline");
                Err(expired(attempts))
            }
        }
    }

    /// Tear down the retrieval for `key`. Every attached caller receives
    /// [`RetrieveError::Canceled`]. Returns `false` if nothing was pending.
    pub fn cancel(&self, key: &RequestKey) -> bool {
        let removed = self.inner.pending().remove(key);
        match removed {
            Some(pending) => {
                self.inner.cancel_entry(pending);
                true
            }
            None => false,
        }
    }

    /// Route a response from `from` to the attempt waiting on its request id.
    pub fn on_response(&self, from: NodeId, response: OdrResponse) {
        self.inner
            .counters
            .bytes_in
            .fetch_add(response.payload.len() as u64, Ordering::Relaxed);
        let tx = self.inner.sent().get(&response.req_id).cloned();
        let delivered = match tx {
            Some(tx) => tx.send((from, response.payload)).is_ok(),
            None => false,
        };
        if !delivered {
            bump(&self.inner.counters.discarded);
            trace!(peer = %from.short(), req_id = response.req_id, "discarding unsolicited response");
        }
    }

    pub fn is_pending(&self, key: &RequestKey) -> bool {
        self.inner.pending().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    pub fn stats(&self) -> RetrieveStats {
        let c = &self.inner.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        RetrieveStats {
            started: load(&c.started),
            succeeded: load(&c.succeeded),
            failed: load(&c.failed),
            canceled: load(&c.canceled),
            coalesced: load(&c.coalesced),
            attempts: load(&c.attempts),
            timeouts: load(&c.timeouts),
            invalid_responses: load(&c.invalid_responses),
            disconnects: load(&c.disconnects),
            discarded: load(&c.discarded),
            bytes_in: load(&c.bytes_in),
            bytes_out: load(&c.bytes_out),
        }
    }

    /// Cancel every pending retrieval.
    pub fn cancel_all(&self) {
        let drained: Vec<Pending> = self.inner.pending().drain().map(|(_, p)| p).collect();
        for pending in drained {
            self.inner.cancel_entry(pending);
        }
    }
}

async fn wait_result(rx: &mut watch::Receiver<Option<RetrieveResult>>) -> RetrieveResult {
    if let Ok(value) = rx.wait_for(Option::is_some).await {
        return value.clone().unwrap_or(Err(RetrieveError::Canceled));
    }
    // Sender gone; the last value sent is final.
    let last = rx.borrow().clone();
    last.unwrap_or(Err(RetrieveError::Canceled))
}

async fn wait_canceled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|canceled| *canceled).await.is_err() && !*rx.borrow() {
        std::future::pending::<()>().await;
    }
}

/// How waiting for a dispatch ended.
enum Assignment {
    Dispatched(Dispatched),
    Canceled,
    Expired,
    Exhausted,
}

/// How one dispatched attempt ended.
enum AttemptEnd {
    Delivered(Vec<u8>),
    Failed(AttemptError),
    Canceled,
    Expired,
}

struct RetrievalTask {
    inner: Arc<Inner>,
    id: u64,
    key: RequestKey,
    request: OdrRequest,
    verify: VerifyFn,
    deadline: Instant,
    cancel_rx: watch::Receiver<bool>,
    tried: HashSet<NodeId>,
    attempts: u32,
    /// Attempt count visible to attached callers.
    shared_attempts: Arc<AtomicU32>,
}

impl RetrievalTask {
    async fn run(mut self) {
        let result = self.drive().await;
        match &result {
            Ok(value) => debug!(
                key = ?self.key,
                kind = %self.request.kind(),
                attempts = self.attempts,
                bytes = value.len(),
                "retrieval succeeded"
            ),
            Err(e) => info!(key = ?self.key, kind = %self.request.kind(), error = %e, "retrieval failed"),
        }
        self.inner.finish(self.key, self.id, result);
    }

    fn has_untried_peer(&self) -> bool {
        self.inner
            .peers
            .any(|p| !p.is_closed() && !self.tried.contains(&p.id()) && p.can_serve(&self.request))
    }

    fn exhausted(&self) -> RetrieveError {
        expired(self.attempts)
    }

    async fn drive(&mut self) -> RetrieveResult {
        loop {
            if *self.cancel_rx.borrow() {
                return Err(RetrieveError::Canceled);
            }
            if self.attempts >= self.inner.config.max_attempts {
                return Err(RetrieveError::TerminalFailure { attempts: self.attempts });
            }

            let mut events = self.inner.peers.subscribe();
            if !self.tried.is_empty() && !self.has_untried_peer() {
                return Err(RetrieveError::TerminalFailure { attempts: self.attempts });
            }

            let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
            let req_id = self.inner.register_attempt(resp_tx);
            let assignment = self.wait_for_peer(req_id, &mut events).await;

            let dispatched = match assignment {
                Assignment::Dispatched(dispatched) => dispatched,
                other => {
                    self.inner.sent().remove(&req_id);
                    return Err(match other {
                        Assignment::Canceled => RetrieveError::Canceled,
                        Assignment::Exhausted => {
                            RetrieveError::TerminalFailure { attempts: self.attempts }
                        }
                        _ => self.exhausted(),
                    });
                }
            };

            self.attempts += 1;
            self.shared_attempts.store(self.attempts, Ordering::Relaxed);
            bump(&self.inner.counters.attempts);
            let peer = dispatched.peer.clone();
            let started = Instant::now();
            trace!(key = ?self.key, peer = %peer.id().short(), req_id, attempt = self.attempts, "attempt dispatched");

            let end = self.await_response(&peer, dispatched, &mut resp_rx).await;
            self.inner.sent().remove(&req_id);
            self.inner.distributor.release(&peer);

            let error = match end {
                AttemptEnd::Delivered(payload) => match (self.verify)(&self.request, &payload) {
                    Ok(()) => {
                        let latency = started.elapsed();
                        peer.record_rtt(self.request.kind(), latency);
                        self.inner.pool.report(peer.id(), Outcome::Success { latency }).await;
                        return Ok(payload);
                    }
                    Err(e) => AttemptError::InvalidResponse(e),
                },
                AttemptEnd::Failed(e) => e,
                AttemptEnd::Canceled => return Err(RetrieveError::Canceled),
                AttemptEnd::Expired => return Err(self.exhausted()),
            };

            let counter = match &error {
                AttemptError::Timeout(_) => &self.inner.counters.timeouts,
                AttemptError::InvalidResponse(_) => &self.inner.counters.invalid_responses,
                AttemptError::PeerDisconnected => &self.inner.counters.disconnects,
            };
            bump(counter);
            debug!(
                key = ?self.key,
                peer = %peer.id().short(),
                attempt = self.attempts,
                error = %error,
                "attempt failed, retrying"
            );
            self.inner.pool.report(peer.id(), error.outcome()).await;
            self.tried.insert(peer.id());
        }
    }

    fn dist_request(&self, req_id: u64) -> DistRequest {
        let tried = self.tried.clone();
        let eligible = self.request.clone();
        let request = self.request.clone();
        DistRequest {
            kind: self.request.kind(),
            can_serve: Box::new(move |peer: &ServingPeer| !tried.contains(&peer.id()) && peer.can_serve(&eligible)),
            build: Box::new(move |peer: &ServingPeer| {
                let wire = request.encode_for(peer.version())?;
                Some(OdrMessage {
                    req_id,
                    version: peer.version(),
                    request: wire,
                })
            }),
        }
    }

    async fn wait_for_peer(
        &mut self,
        req_id: u64,
        events: &mut broadcast::Receiver<PeerEvent>,
    ) -> Assignment {
        let ticket = match self.inner.distributor.distribute(self.dist_request(req_id)).await {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(error = %e, "distributor unavailable");
                return Assignment::Canceled;
            }
        };
        let DistTicket { id, mut assigned } = ticket;
        let deadline = sleep_until(self.deadline);
        tokio::pin!(deadline);

        let abandoned = loop {
            tokio::select! {
                biased;
                _ = wait_canceled(&mut self.cancel_rx) => break Assignment::Canceled,
                result = &mut assigned => {
                    return match result {
                        Ok(dispatched) => Assignment::Dispatched(dispatched),
                        Err(_) => Assignment::Canceled,
                    };
                }
                _ = &mut deadline => break Assignment::Expired,
                event = events.recv() => {
                    let left = matches!(
                        event,
                        Ok(PeerEvent::Left(_)) | Err(broadcast::error::RecvError::Lagged(_))
                    );
                    if left && !self.tried.is_empty() && !self.has_untried_peer() {
                        break Assignment::Exhausted;
                    }
                }
            }
        };

        if !self.inner.distributor.cancel(id).await {
            // Dispatched while we were giving up; hand the slot back.
            if let Ok(dispatched) = assigned.try_recv() {
                self.inner.distributor.release(&dispatched.peer);
            }
        }
        abandoned
    }

    async fn await_response(
        &mut self,
        peer: &ServingPeer,
        dispatched: Dispatched,
        resp_rx: &mut mpsc::UnboundedReceiver<(NodeId, Vec<u8>)>,
    ) -> AttemptEnd {
        let timeout = self.inner.config.attempt_timeout;
        let attempt_deadline =
            sleep_until(Instant::now().checked_add(timeout).unwrap_or(self.deadline));
        let outer_deadline = sleep_until(self.deadline);
        tokio::pin!(attempt_deadline);
        tokio::pin!(outer_deadline);
        let Dispatched { bytes, mut sent, .. } = dispatched;
        let mut send_pending = true;
        let inner = self.inner.clone();
        let count_out = move || {
            inner.counters.bytes_out.fetch_add(bytes, Ordering::Relaxed);
        };

        loop {
            tokio::select! {
                biased;
                _ = wait_canceled(&mut self.cancel_rx) => return AttemptEnd::Canceled,
                ack = &mut sent, if send_pending => {
                    send_pending = false;
                    match ack {
                        Ok(Ok(())) => count_out(),
                        Ok(Err(e)) => {
                            debug!(peer = %peer.id().short(), error = %e, "send failed");
                            return AttemptEnd::Failed(AttemptError::PeerDisconnected);
                        }
                        Err(_) => return AttemptEnd::Failed(AttemptError::PeerDisconnected),
                    }
                }
                response = resp_rx.recv() => {
                    match response {
                        Some((from, payload)) if from == peer.id() => {
                            if send_pending {
                                count_out();
                            }
                            return AttemptEnd::Delivered(payload);
                        }
                        Some((from, _)) => {
                            bump(&self.inner.counters.discarded);
                            warn!(
                                expected = %peer.id().short(),
                                from = %from.short(),
                                "response from wrong peer discarded"
                            );
                        }
                        None => return AttemptEnd::Failed(AttemptError::PeerDisconnected),
                    }
                }
                _ = peer.closed() => return AttemptEnd::Failed(AttemptError::PeerDisconnected),
                _ = &mut attempt_deadline => return AttemptEnd::Failed(AttemptError::Timeout(timeout)),
                _ = &mut outer_deadline => return AttemptEnd::Expired,
            }
        }
    }
}
