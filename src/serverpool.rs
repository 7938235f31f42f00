//! # Server Pool
//!
//! Keeps every light server the client has heard of, how well each one has
//! behaved, and which of them should be connected right now.
//!
//! The pool is an actor: a [`ServerPool`] handle sends commands to a single
//! task that owns all entries, the dial rate limiter and the persisted store.
//! The task wakes on commands, on the maintenance tick (dialing and the
//! disconnect policy), on the decay tick, and on the flush tick.
//!
//! ## Scoring
//!
//! ```text
//! score = success_reward  * successes
//!       - timeout_penalty * timeouts
//!       - invalid_penalty * invalid_responses
//!       - failure_penalty * failures
//!       - latency_penalty * latency_secs
//! ```
//!
//! A request lost to a mid-flight disconnect counts as a timeout. Counters
//! decay by `decay_factor` every `decay_interval`; entries are never deleted
//! for scoring reasons.
//!
//! ## Connection policy
//!
//! Each maintenance tick:
//! - connected servers scoring below `disconnect_threshold`, or with
//!   `max_invalid_responses` invalid answers, are dropped via the [`Dialer`]
//! - free slots up to `target_peers` are filled with the best scored idle
//!   candidates, a `new_dial_ratio` share going to never-tried nodes
//! - failed dials back off exponentially with jitter

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::identity::{now_ms, NodeId, NodeRecord};
use crate::ratelimit::{
    DialRateLimiter, DialRateStats, DEFAULT_MAX_DIALS_PER_NODE_PER_MINUTE, DEFAULT_MAX_DIALS_PER_SECOND,
};
use crate::storage::{PersistedEntry, PoolStore, Reputation};

pub const DEFAULT_TARGET_PEERS: usize = 8;
pub const DEFAULT_DECAY_FACTOR: f64 = 0.9;
pub const DEFAULT_DECAY_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(600);
pub const DEFAULT_NEW_DIAL_RATIO: f64 = 0.25;
pub const DEFAULT_DISCONNECT_THRESHOLD: f64 = -16.0;
pub const DEFAULT_MAX_INVALID_RESPONSES: u32 = 2;
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_KNOWN_ENTRIES: usize = 2048;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Weight of the newest sample in the latency moving average.
const LATENCY_EWMA_WEIGHT: f64 = 0.2;

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Outbound connection management, implemented by the transport layer.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connect to a server. Resolves once the connection is up or has failed.
    async fn dial(&self, record: &NodeRecord) -> Result<()>;

    async fn disconnect(&self, id: &NodeId);
}

/// Completed interaction with a server.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Outcome {
    Success { latency: Duration },
    Timeout,
    InvalidResponse,
    /// The connection dropped while a request was outstanding.
    Disconnected,
    DialFailed,
}

#[derive(Clone, Debug)]
pub struct ScoreWeights {
    pub success_reward: f64,
    pub timeout_penalty: f64,
    pub invalid_penalty: f64,
    pub failure_penalty: f64,
    /// Penalty per second of smoothed response latency.
    pub latency_penalty: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            success_reward: 1.0,
            timeout_penalty: 1.0,
            invalid_penalty: 8.0,
            failure_penalty: 0.5,
            latency_penalty: 1.0,
        }
    }
}

impl ScoreWeights {
    pub fn score(&self, rep: &Reputation) -> f64 {
        let latency_secs = rep.latency_ms.map_or(0.0, |ms| ms / 1000.0);
        self.success_reward * rep.successes
            - self.timeout_penalty * rep.timeouts
            - self.invalid_penalty * rep.invalid_responses
            - self.failure_penalty * rep.failures
            - self.latency_penalty * latency_secs
    }
}

#[derive(Clone, Debug)]
pub struct ServerPoolConfig {
    pub target_peers: usize,
    pub weights: ScoreWeights,
    pub decay_factor: f64,
    pub decay_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Share of free dial slots reserved for never-tried candidates.
    pub new_dial_ratio: f64,
    pub disconnect_threshold: f64,
    pub max_invalid_responses: u32,
    pub maintenance_interval: Duration,
    pub flush_interval: Duration,
    pub max_known_entries: usize,
    pub dial_timeout: Duration,
    pub max_dials_per_second: usize,
    pub max_dials_per_node_per_minute: usize,
}

impl Default for ServerPoolConfig {
    fn default() -> Self {
        Self {
            target_peers: DEFAULT_TARGET_PEERS,
            weights: ScoreWeights::default(),
            decay_factor: DEFAULT_DECAY_FACTOR,
            decay_interval: DEFAULT_DECAY_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            new_dial_ratio: DEFAULT_NEW_DIAL_RATIO,
            disconnect_threshold: DEFAULT_DISCONNECT_THRESHOLD,
            max_invalid_responses: DEFAULT_MAX_INVALID_RESPONSES,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_known_entries: DEFAULT_MAX_KNOWN_ENTRIES,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_dials_per_second: DEFAULT_MAX_DIALS_PER_SECOND,
            max_dials_per_node_per_minute: DEFAULT_MAX_DIALS_PER_NODE_PER_MINUTE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Known,
    Dialing,
    Connected,
    Backoff { until: Instant, failures: u32 },
}

/// Read-only view of one entry.
#[derive(Clone, Debug)]
pub struct PoolEntryInfo {
    pub record: NodeRecord,
    pub reputation: Reputation,
    pub score: f64,
    pub state: ConnectionState,
    pub last_seen_ms: u64,
}

#[derive(Clone, Debug)]
struct PoolEntry {
    record: NodeRecord,
    reputation: Reputation,
    state: ConnectionState,
    last_seen_ms: u64,
    dial_failures: u32,
    tried: bool,
}

impl PoolEntry {
    fn new(record: NodeRecord) -> Self {
        Self {
            record,
            reputation: Reputation::default(),
            state: ConnectionState::Known,
            last_seen_ms: now_ms(),
            dial_failures: 0,
            tried: false,
        }
    }

    fn restored(persisted: PersistedEntry) -> Self {
        let tried = persisted.dial_failures > 0 || persisted.reputation != Reputation::default();
        Self {
            record: persisted.record,
            reputation: persisted.reputation,
            state: ConnectionState::Known,
            last_seen_ms: persisted.last_seen_ms,
            dial_failures: persisted.dial_failures,
            tried,
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        match self.state {
            ConnectionState::Known => true,
            ConnectionState::Backoff { until, .. } => until <= now,
            ConnectionState::Dialing | ConnectionState::Connected => false,
        }
    }

    fn is_active(&self) -> bool {
        matches!(self.state, ConnectionState::Dialing | ConnectionState::Connected)
    }
}

/// Pool bookkeeping, separate from the actor so it can be driven with an
/// explicit clock.
struct PoolState {
    config: ServerPoolConfig,
    entries: HashMap<NodeId, PoolEntry>,
    limiter: DialRateLimiter,
}

impl PoolState {
    fn new(config: ServerPoolConfig) -> Self {
        let limiter = DialRateLimiter::new(
            config.max_dials_per_second,
            config.max_dials_per_node_per_minute,
        );
        Self {
            config,
            entries: HashMap::new(),
            limiter,
        }
    }

    fn score_of(&self, id: &NodeId) -> Option<f64> {
        self.entries
            .get(id)
            .map(|e| self.config.weights.score(&e.reputation))
    }

    fn restore(&mut self, persisted: Vec<PersistedEntry>) {
        for p in persisted {
            let id = p.record.id;
            if !id.is_valid() {
                continue;
            }
            self.entries.insert(id, PoolEntry::restored(p));
        }
        self.enforce_cap();
    }

    fn add_candidate(&mut self, record: NodeRecord) {
        if !record.id.is_valid() {
            trace!("ignoring candidate with zero id");
            return;
        }
        if let Some(entry) = self.entries.get_mut(&record.id) {
            entry.record.merge(&record);
            entry.last_seen_ms = now_ms();
            return;
        }
        if self.entries.len() >= self.config.max_known_entries && !self.evict_lowest() {
            debug!(node = %record.id.short(), "server pool full, dropping candidate");
            return;
        }
        trace!(node = %record.id.short(), "new candidate");
        self.entries.insert(record.id, PoolEntry::new(record));
    }

    /// Evict the worst scored entry that is not connected or dialing.
    fn evict_lowest(&mut self) -> bool {
        let weights = &self.config.weights;
        let victim = self
            .entries
            .iter()
            .filter(|(_, e)| !e.is_active())
            .map(|(id, e)| (weights.score(&e.reputation), *id))
            .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        match victim {
            Some((score, id)) => {
                self.entries.remove(&id);
                info!(node = %id.short(), score, "server pool full, evicted lowest scored entry");
                true
            }
            None => false,
        }
    }

    fn enforce_cap(&mut self) {
        while self.entries.len() > self.config.max_known_entries {
            if !self.evict_lowest() {
                break;
            }
        }
    }

    fn entry_mut(&mut self, id: NodeId) -> &mut PoolEntry {
        self.entries
            .entry(id)
            .or_insert_with(|| PoolEntry::new(NodeRecord::new(id, Vec::new())))
    }

    fn report(&mut self, id: NodeId, outcome: Outcome, now: Instant) {
        let next_failures = self.entries.get(&id).map_or(1, |e| e.dial_failures.saturating_add(1));
        let backoff = self.backoff_for(next_failures);
        let entry = self.entry_mut(id);
        entry.tried = true;
        let rep = &mut entry.reputation;
        match outcome {
            Outcome::Success { latency } => {
                rep.successes += 1.0;
                let sample = latency.as_secs_f64() * 1000.0;
                rep.latency_ms = Some(match rep.latency_ms {
                    Some(avg) => avg + LATENCY_EWMA_WEIGHT * (sample - avg),
                    None => sample,
                });
                entry.last_seen_ms = now_ms();
            }
            Outcome::Timeout | Outcome::Disconnected => rep.timeouts += 1.0,
            Outcome::InvalidResponse => rep.invalid_responses += 1.0,
            Outcome::DialFailed => {
                rep.failures += 1.0;
                entry.dial_failures = entry.dial_failures.saturating_add(1);
                if !matches!(entry.state, ConnectionState::Connected) {
                    entry.state = ConnectionState::Backoff {
                        until: now + backoff,
                        failures: entry.dial_failures,
                    };
                }
            }
        }
        trace!(node = %id.short(), ?outcome, "outcome recorded");
    }

    /// `backoff_base * 2^(failures - 1)` capped at `backoff_max`, plus up to
    /// 20% jitter.
    fn backoff_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        let base = self
            .config
            .backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.config.backoff_max);
        let jitter = rand::thread_rng().gen_range(0.0..0.2);
        (base + base.mul_f64(jitter)).min(self.config.backoff_max)
    }

    fn connected(&mut self, id: NodeId) {
        let entry = self.entry_mut(id);
        entry.state = ConnectionState::Connected;
        entry.tried = true;
        entry.dial_failures = 0;
        entry.last_seen_ms = now_ms();
    }

    fn disconnected(&mut self, id: NodeId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.is_active() {
                entry.state = ConnectionState::Known;
            }
        }
    }

    fn dial_finished(&mut self, id: NodeId, result: Result<()>, now: Instant) {
        match result {
            Ok(()) => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    if entry.state == ConnectionState::Dialing {
                        entry.state = ConnectionState::Connected;
                        entry.dial_failures = 0;
                        entry.last_seen_ms = now_ms();
                    }
                }
            }
            Err(e) => {
                debug!(node = %id.short(), error = %e, "dial failed");
                self.report(id, Outcome::DialFailed, now);
            }
        }
    }

    fn should_disconnect(&self, entry: &PoolEntry) -> bool {
        let score = self.config.weights.score(&entry.reputation);
        score < self.config.disconnect_threshold
            || entry.reputation.invalid_responses >= self.config.max_invalid_responses as f64
    }

    /// Connected servers that the policy wants gone. They move to backoff so
    /// they are not redialed straight away.
    fn take_disconnects(&mut self, now: Instant) -> Vec<NodeId> {
        let doomed: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == ConnectionState::Connected && self.should_disconnect(e))
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            let until = now + self.config.backoff_max;
            if let Some(entry) = self.entries.get_mut(id) {
                let failures = entry.dial_failures;
                entry.state = ConnectionState::Backoff { until, failures };
                info!(
                    node = %id.short(),
                    score = self.config.weights.score(&entry.reputation),
                    invalid = entry.reputation.invalid_responses,
                    "disconnecting poorly performing server"
                );
            }
        }
        doomed
    }

    /// Pick the candidates to dial now and mark them `Dialing`.
    fn select_dials(&mut self, now: Instant) -> Vec<NodeRecord> {
        let active = self.entries.values().filter(|e| e.is_active()).count();
        let slots = self.config.target_peers.saturating_sub(active);
        if slots == 0 || !self.limiter.has_global_budget() {
            return Vec::new();
        }

        let weights = &self.config.weights;
        let mut fresh: Vec<NodeId> = Vec::new();
        let mut tried: Vec<(f64, NodeId)> = Vec::new();
        for (id, entry) in &self.entries {
            if !entry.is_idle(now) || entry.record.addrs.is_empty() {
                continue;
            }
            if entry.tried {
                tried.push((weights.score(&entry.reputation), *id));
            } else {
                fresh.push(*id);
            }
        }
        fresh.shuffle(&mut rand::thread_rng());
        tried.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let reserved = ((slots as f64) * self.config.new_dial_ratio.clamp(0.0, 1.0)).ceil() as usize;
        let reserved = reserved.min(fresh.len());
        let mut order: Vec<NodeId> = fresh[..reserved].to_vec();
        order.extend(tried.iter().map(|(_, id)| *id));
        order.extend_from_slice(&fresh[reserved..]);

        let mut dials = Vec::new();
        for id in order {
            if dials.len() >= slots || !self.limiter.has_global_budget() {
                break;
            }
            if !self.limiter.allow(&id) {
                continue;
            }
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.state = ConnectionState::Dialing;
                entry.tried = true;
                dials.push(entry.record.clone());
            }
        }
        dials
    }

    fn decay(&mut self) {
        let factor = self.config.decay_factor.clamp(0.0, 1.0);
        for entry in self.entries.values_mut() {
            let rep = &mut entry.reputation;
            rep.successes *= factor;
            rep.timeouts *= factor;
            rep.invalid_responses *= factor;
            rep.failures *= factor;
        }
    }

    fn persisted(&self) -> Vec<PersistedEntry> {
        self.entries
            .values()
            .map(|e| PersistedEntry {
                record: e.record.clone(),
                reputation: e.reputation.clone(),
                last_seen_ms: e.last_seen_ms,
                dial_failures: e.dial_failures,
            })
            .collect()
    }

    fn snapshot(&self) -> Vec<PoolEntryInfo> {
        let mut out: Vec<PoolEntryInfo> = self
            .entries
            .values()
            .map(|e| PoolEntryInfo {
                record: e.record.clone(),
                reputation: e.reputation.clone(),
                score: self.config.weights.score(&e.reputation),
                state: e.state,
                last_seen_ms: e.last_seen_ms,
            })
            .collect();
        out.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.record.id.cmp(&b.record.id)));
        out
    }
}

enum Command {
    AddCandidates(Vec<NodeRecord>),
    Report(NodeId, Outcome),
    Connected(NodeId),
    Disconnected(NodeId),
    Score(NodeId, oneshot::Sender<Option<f64>>),
    Snapshot(oneshot::Sender<Vec<PoolEntryInfo>>),
    DialStats(oneshot::Sender<DialRateStats>),
    Flush(oneshot::Sender<Result<()>>),
    Quit(oneshot::Sender<()>),
}

/// Handle to the server pool actor.
#[derive(Clone)]
pub struct ServerPool {
    cmd_tx: mpsc::Sender<Command>,
}

impl ServerPool {
    /// Spawn the pool actor. With a store, persisted entries are loaded
    /// before the first command is handled.
    pub fn spawn(config: ServerPoolConfig, dialer: Arc<dyn Dialer>, store: Option<PoolStore>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let actor = ServerPoolActor {
            state: PoolState::new(config),
            dialer,
            store,
            dial_tx,
        };
        tokio::spawn(actor.run(cmd_rx, dial_rx));
        Self { cmd_tx }
    }

    pub async fn add_candidates(&self, records: Vec<NodeRecord>) {
        if records.is_empty() {
            return;
        }
        let _ = self.cmd_tx.send(Command::AddCandidates(records)).await;
    }

    /// Forward discovered records into the pool until the discovery channel
    /// closes.
    pub fn spawn_discovery(&self, mut rx: mpsc::Receiver<NodeRecord>) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if pool.cmd_tx.send(Command::AddCandidates(vec![record])).await.is_err() {
                    break;
                }
            }
            debug!("discovery feed closed");
        })
    }

    pub async fn report(&self, id: NodeId, outcome: Outcome) {
        let _ = self.cmd_tx.send(Command::Report(id, outcome)).await;
    }

    pub async fn connected(&self, id: NodeId) {
        let _ = self.cmd_tx.send(Command::Connected(id)).await;
    }

    pub async fn disconnected(&self, id: NodeId) {
        let _ = self.cmd_tx.send(Command::Disconnected(id)).await;
    }

    pub async fn score(&self, id: &NodeId) -> Option<f64> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Score(*id, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// All entries, best scored first.
    pub async fn snapshot(&self) -> Vec<PoolEntryInfo> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Snapshot(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn dial_stats(&self) -> Option<DialRateStats> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::DialStats(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush(tx))
            .await
            .map_err(|_| anyhow::anyhow!("server pool actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("server pool actor closed"))?
    }

    /// Stop the actor after a final flush.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Quit(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct ServerPoolActor {
    state: PoolState,
    dialer: Arc<dyn Dialer>,
    store: Option<PoolStore>,
    dial_tx: mpsc::UnboundedSender<(NodeId, Result<()>)>,
}

impl ServerPoolActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut dial_rx: mpsc::UnboundedReceiver<(NodeId, Result<()>)>,
    ) {
        if let Some(store) = &self.store {
            let persisted = store.load().await;
            self.state.restore(persisted);
        }

        let config = self.state.config.clone();
        let mut maintenance = tokio::time::interval(config.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut decay = interval_at(Instant::now() + config.decay_interval, config.decay_interval);
        let mut flush = interval_at(Instant::now() + config.flush_interval, config.flush_interval);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::AddCandidates(records)) => {
                            for record in records {
                                self.state.add_candidate(record);
                            }
                        }
                        Some(Command::Report(id, outcome)) => {
                            self.state.report(id, outcome, Instant::now());
                        }
                        Some(Command::Connected(id)) => {
                            debug!(node = %id.short(), "server connected");
                            self.state.connected(id);
                        }
                        Some(Command::Disconnected(id)) => {
                            debug!(node = %id.short(), "server disconnected");
                            self.state.disconnected(id);
                        }
                        Some(Command::Score(id, reply)) => {
                            let _ = reply.send(self.state.score_of(&id));
                        }
                        Some(Command::Snapshot(reply)) => {
                            let _ = reply.send(self.state.snapshot());
                        }
                        Some(Command::DialStats(reply)) => {
                            let _ = reply.send(self.state.limiter.stats());
                        }
                        Some(Command::Flush(reply)) => {
                            let _ = reply.send(self.flush().await);
                        }
                        Some(Command::Quit(reply)) => {
                            debug!("server pool actor quitting");
                            self.flush_logged().await;
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            debug!("server pool handle dropped, actor quitting");
                            self.flush_logged().await;
                            break;
                        }
                    }
                }
                Some((id, result)) = dial_rx.recv() => {
                    self.state.dial_finished(id, result, Instant::now());
                }
                _ = maintenance.tick() => {
                    self.maintain();
                }
                _ = decay.tick() => {
                    trace!("decaying server reputation");
                    self.state.decay();
                }
                _ = flush.tick() => {
                    self.flush_logged().await;
                }
            }
        }
    }

    fn maintain(&mut self) {
        let now = Instant::now();
        for id in self.state.take_disconnects(now) {
            let dialer = self.dialer.clone();
            tokio::spawn(async move { dialer.disconnect(&id).await });
        }

        let dial_timeout = self.state.config.dial_timeout;
        for record in self.state.select_dials(now) {
            debug!(node = %record.id.short(), addr = ?record.primary_addr(), "dialing server");
            let dialer = self.dialer.clone();
            let dial_tx = self.dial_tx.clone();
            tokio::spawn(async move {
                let result = match tokio::time::timeout(dial_timeout, dialer.dial(&record)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("dial timed out after {dial_timeout:?}")),
                };
                let _ = dial_tx.send((record.id, result));
            });
        }
    }

    async fn flush(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.save(self.state.persisted()).await,
            None => Ok(()),
        }
    }

    async fn flush_logged(&self) {
        if let Err(e) = self.flush().await {
            warn!(error = %e, "failed to persist server pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    fn node(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 32])
    }

    fn record(byte: u8) -> NodeRecord {
        NodeRecord::single(node(byte), format!("10.0.0.{byte}:30303"))
    }

    fn state_with(config: ServerPoolConfig) -> PoolState {
        PoolState::new(config)
    }

    #[test]
    fn invalid_responses_rank_below_timeouts() {
        let mut state = state_with(ServerPoolConfig::default());
        let now = Instant::now();
        state.report(node(1), Outcome::Timeout, now);
        state.report(node(2), Outcome::InvalidResponse, now);

        let timeout_score = state.score_of(&node(1)).unwrap();
        let invalid_score = state.score_of(&node(2)).unwrap();
        assert_eq!(timeout_score, -1.0);
        assert_eq!(invalid_score, -8.0);
        assert!(invalid_score < timeout_score);
    }

    #[test]
    fn success_rewards_and_tracks_latency() {
        let mut state = state_with(ServerPoolConfig::default());
        let now = Instant::now();
        state.report(node(1), Outcome::Success { latency: Duration::from_millis(200) }, now);
        let entry = &state.entries[&node(1)];
        assert_eq!(entry.reputation.latency_ms, Some(200.0));
        let score = state.score_of(&node(1)).unwrap();
        assert!((score - 0.8).abs() < 1e-9, "score {score}");
    }

    #[test]
    fn dial_failures_back_off_exponentially() {
        let config = ServerPoolConfig {
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(1000),
            ..ServerPoolConfig::default()
        };
        let mut state = state_with(config);
        state.add_candidate(record(1));
        let now = Instant::now();

        state.report(node(1), Outcome::DialFailed, now);
        let ConnectionState::Backoff { until: first, failures: 1 } = state.entries[&node(1)].state else {
            panic!("expected backoff");
        };
        assert!(first - now >= Duration::from_secs(10) && first - now < Duration::from_secs(12));
        assert!(!state.entries[&node(1)].is_idle(now));
        assert!(state.entries[&node(1)].is_idle(first));

        state.report(node(1), Outcome::DialFailed, now);
        let ConnectionState::Backoff { until: second, failures: 2 } = state.entries[&node(1)].state else {
            panic!("expected backoff");
        };
        assert!(second - now >= Duration::from_secs(20));
    }

    #[test]
    fn backoff_is_capped() {
        let config = ServerPoolConfig {
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(60),
            ..ServerPoolConfig::default()
        };
        let state = state_with(config);
        assert_eq!(state.backoff_for(30), Duration::from_secs(60));
    }

    #[test]
    fn backing_off_candidates_are_not_dialed() {
        let mut state = state_with(ServerPoolConfig::default());
        state.add_candidate(record(1));
        let now = Instant::now();
        state.report(node(1), Outcome::DialFailed, now);
        assert!(state.select_dials(now).is_empty());
    }

    #[test]
    fn dials_highest_scored_candidates_first() {
        let config = ServerPoolConfig {
            target_peers: 2,
            new_dial_ratio: 0.0,
            ..ServerPoolConfig::default()
        };
        let mut state = state_with(config);
        let now = Instant::now();
        for byte in 1..=4 {
            state.add_candidate(record(byte));
        }
        for _ in 0..3 {
            state.report(node(3), Outcome::Success { latency: Duration::from_millis(10) }, now);
        }
        state.report(node(1), Outcome::Success { latency: Duration::from_millis(10) }, now);
        state.report(node(2), Outcome::Timeout, now);
        state.report(node(4), Outcome::InvalidResponse, now);

        let dialed: Vec<_> = state.select_dials(now).into_iter().map(|r| r.id).collect();
        assert_eq!(dialed, vec![node(3), node(1)]);
        assert_eq!(state.entries[&node(3)].state, ConnectionState::Dialing);
        assert!(state.select_dials(now).is_empty(), "target reached");
    }

    #[test]
    fn reserved_share_explores_new_candidates() {
        let config = ServerPoolConfig {
            target_peers: 2,
            new_dial_ratio: 0.5,
            ..ServerPoolConfig::default()
        };
        let mut state = state_with(config);
        let now = Instant::now();
        for byte in 1..=3 {
            state.add_candidate(record(byte));
            state.report(node(byte), Outcome::Success { latency: Duration::from_millis(10) }, now);
        }
        state.add_candidate(record(9));

        let dialed: Vec<_> = state.select_dials(now).into_iter().map(|r| r.id).collect();
        assert_eq!(dialed.len(), 2);
        assert_eq!(dialed[0], node(9));
        assert_eq!(dialed[1], node(1));
    }

    #[test]
    fn poor_performers_are_disconnected() {
        let mut state = state_with(ServerPoolConfig::default());
        let now = Instant::now();
        state.connected(node(1));
        state.connected(node(2));
        state.connected(node(3));

        state.report(node(1), Outcome::InvalidResponse, now);
        state.report(node(1), Outcome::InvalidResponse, now);
        for _ in 0..17 {
            state.report(node(2), Outcome::Timeout, now);
        }
        state.report(node(3), Outcome::InvalidResponse, now);

        let mut doomed = state.take_disconnects(now);
        doomed.sort();
        assert_eq!(doomed, vec![node(1), node(2)]);
        assert!(matches!(state.entries[&node(1)].state, ConnectionState::Backoff { .. }));
        assert_eq!(state.entries[&node(3)].state, ConnectionState::Connected);
    }

    #[test]
    fn decay_shrinks_counters() {
        let config = ServerPoolConfig {
            decay_factor: 0.5,
            ..ServerPoolConfig::default()
        };
        let mut state = state_with(config);
        let now = Instant::now();
        state.report(node(1), Outcome::InvalidResponse, now);
        state.decay();
        assert_eq!(state.score_of(&node(1)), Some(-4.0));
    }

    #[test]
    fn cap_evicts_lowest_scored_idle_entry() {
        let config = ServerPoolConfig {
            max_known_entries: 2,
            ..ServerPoolConfig::default()
        };
        let mut state = state_with(config);
        let now = Instant::now();
        state.add_candidate(record(1));
        state.add_candidate(record(2));
        state.report(node(2), Outcome::InvalidResponse, now);
        state.add_candidate(record(3));

        assert_eq!(state.entries.len(), 2);
        assert!(!state.entries.contains_key(&node(2)));
        assert!(state.entries.contains_key(&node(3)));
    }

    #[test]
    fn rediscovery_merges_addresses() {
        let mut state = state_with(ServerPoolConfig::default());
        state.add_candidate(record(1));
        state.add_candidate(NodeRecord::single(node(1), "192.168.1.1:30303"));
        assert_eq!(
            state.entries[&node(1)].record.addrs,
            vec!["192.168.1.1:30303".to_string(), "10.0.0.1:30303".to_string()]
        );
    }

    #[test]
    fn late_dial_success_after_disconnect_is_ignored() {
        let mut state = state_with(ServerPoolConfig::default());
        let now = Instant::now();
        state.add_candidate(record(1));
        assert_eq!(state.select_dials(now).len(), 1);
        state.connected(node(1));
        state.disconnected(node(1));
        state.dial_finished(node(1), Ok(()), now);
        assert_eq!(state.entries[&node(1)].state, ConnectionState::Known);
    }

    #[derive(Default)]
    struct RecordingDialer {
        dialed: Mutex<Vec<NodeId>>,
        fail: bool,
    }

    #[async_trait]
    impl Dialer for RecordingDialer {
        async fn dial(&self, record: &NodeRecord) -> Result<()> {
            self.dialed.lock().await.push(record.id);
            if self.fail {
                anyhow::bail!("connection refused");
            }
            Ok(())
        }

        async fn disconnect(&self, _id: &NodeId) {}
    }

    fn fast_config() -> ServerPoolConfig {
        ServerPoolConfig {
            maintenance_interval: Duration::from_millis(10),
            ..ServerPoolConfig::default()
        }
    }

    #[tokio::test]
    async fn actor_dials_discovered_candidates() {
        let dialer = Arc::new(RecordingDialer::default());
        let pool = ServerPool::spawn(fast_config(), dialer.clone(), None);
        let (tx, rx) = mpsc::channel(8);
        pool.spawn_discovery(rx);
        tx.send(record(1)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let connected = pool
                    .snapshot()
                    .await
                    .iter()
                    .any(|e| e.record.id == node(1) && e.state == ConnectionState::Connected);
                if connected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("candidate connected");
        assert_eq!(*dialer.dialed.lock().await, vec![node(1)]);
        assert_eq!(pool.dial_stats().await.map(|s| s.tracked_nodes), Some(1));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn actor_backs_off_failed_dials() {
        let dialer = Arc::new(RecordingDialer { fail: true, ..Default::default() });
        let pool = ServerPool::spawn(fast_config(), dialer.clone(), None);
        pool.add_candidates(vec![record(1)]).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dialer.dialed.lock().await.len(), 1, "redial waits for backoff");
        let entry = pool.snapshot().await.remove(0);
        assert!(matches!(entry.state, ConnectionState::Backoff { failures: 1, .. }));
        assert_eq!(pool.score(&node(1)).await, Some(-0.5));
    }

    #[tokio::test]
    async fn reputation_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.bin");
        let dialer = Arc::new(RecordingDialer::default());
        let config = ServerPoolConfig {
            target_peers: 0,
            ..ServerPoolConfig::default()
        };

        let pool = ServerPool::spawn(config.clone(), dialer.clone(), Some(PoolStore::new(&path)));
        pool.add_candidates(vec![record(1)]).await;
        pool.report(node(1), Outcome::InvalidResponse).await;
        pool.shutdown().await;

        let pool = ServerPool::spawn(config, dialer, Some(PoolStore::new(&path)));
        assert_eq!(pool.score(&node(1)).await, Some(-8.0));
        let entries = pool.snapshot().await;
        assert_eq!(entries[0].record, record(1));
        assert_eq!(entries[0].state, ConnectionState::Known);
    }

    #[tokio::test]
    async fn corrupt_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.bin");
        tokio::fs::write(&path, b"garbage").await.unwrap();

        let pool = ServerPool::spawn(
            ServerPoolConfig::default(),
            Arc::new(RecordingDialer::default()),
            Some(PoolStore::new(&path)),
        );
        assert!(pool.snapshot().await.is_empty());
        pool.flush().await.unwrap();
        assert!(PoolStore::new(&path).load().await.is_empty());
    }
}
