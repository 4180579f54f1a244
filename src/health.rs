//! # Hierarchical Health Checks
//!
//! Three levels run as independent background loops:
//!
//! | Level  | Interval | Timeout | Tests | Targets |
//! |--------|----------|---------|-------|---------|
//! | fast   | 30 s     | 2 s     | ping | every routing peer |
//! | medium | 2 min    | 4 s     | ping, find_node, store/retrieve | low availability or stale full check |
//! | deep   | 10 min   | 12 s    | same as medium | suspicious or critical peers |
//!
//! Each batch runs with bounded concurrency. The first failing test
//! short-circuits the rest of the level for that peer. Outcomes update the
//! per-peer [`HealthStatus`], the routing table's health field and the peer
//! cache. A peer continuously unhealthy for longer than
//! `max_unhealthy_duration` is evicted from the routing table and its status
//! purged. Statuses of peers that left the table for any other reason are
//! dropped at the start of the next batch.
//!
//! A batch in which most checked peers fail is reported to the refresh
//! scheduler as a suspected partition.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::cache::PeerCache;
use crate::config::HealthConfig;
use crate::dht::RoutingNode;
use crate::events::{EventSink, EvictionReason, OverlayEvent};
use crate::identity::{NodeId, PeerHealth, PeerRecord};
use crate::protocols::{call_with_retry, OverlayRpc, RetryPolicy};
use crate::refresh::CriticalEvent;

/// Smallest batch whose failure ratio can suggest a partition.
const PARTITION_MIN_CHECKED: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthLevel {
    Fast,
    Medium,
    Deep,
}

impl HealthLevel {
    pub const ALL: [HealthLevel; 3] = [HealthLevel::Fast, HealthLevel::Medium, HealthLevel::Deep];

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Fast => "fast",
            HealthLevel::Medium => "medium",
            HealthLevel::Deep => "deep",
        }
    }

    pub fn tests(&self) -> &'static [HealthTest] {
        match self {
            HealthLevel::Fast => &[HealthTest::Ping],
            HealthLevel::Medium | HealthLevel::Deep => {
                &[HealthTest::Ping, HealthTest::FindNode, HealthTest::StoreRetrieve]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthTest {
    Ping,
    FindNode,
    /// Store a random payload under its hash and read it back.
    StoreRetrieve,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed(String),
    /// Not run because an earlier test failed.
    Skipped,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, TestOutcome::Passed)
    }
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub level: HealthLevel,
    pub overall_healthy: bool,
    pub test_results: BTreeMap<HealthTest, TestOutcome>,
    pub last_checked: Instant,
    /// Last medium or deep check.
    pub last_full_check: Option<Instant>,
    pub consecutive_failures: u32,
    pub unhealthy_since: Option<Instant>,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub last_response_time: Option<Duration>,
    /// Holds a critical role; always deep-checked.
    pub critical: bool,
}

impl HealthStatus {
    fn new(level: HealthLevel, now: Instant) -> Self {
        Self {
            level,
            overall_healthy: true,
            test_results: BTreeMap::new(),
            last_checked: now,
            last_full_check: None,
            consecutive_failures: 0,
            unhealthy_since: None,
            total_checks: 0,
            successful_checks: 0,
            last_success: None,
            last_failure: None,
            last_response_time: None,
            critical: false,
        }
    }

    /// `successful / total`; 1.0 before the first check.
    pub fn availability(&self) -> f64 {
        if self.total_checks == 0 {
            1.0
        } else {
            self.successful_checks as f64 / self.total_checks as f64
        }
    }

    fn apply(&mut self, result: &HealthCheckResult, critical: bool) {
        let now = Instant::now();
        self.level = result.level;
        self.test_results = result.test_results.iter().cloned().collect();
        self.last_checked = now;
        self.total_checks += 1;
        self.last_response_time = Some(result.response_time);
        self.critical = critical;
        if result.level != HealthLevel::Fast {
            self.last_full_check = Some(now);
        }

        if result.healthy {
            self.overall_healthy = true;
            self.consecutive_failures = 0;
            self.unhealthy_since = None;
            self.successful_checks += 1;
            self.last_success = Some(now);
        } else {
            self.overall_healthy = false;
            self.consecutive_failures += 1;
            self.unhealthy_since.get_or_insert(now);
            self.last_failure = Some(now);
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub peer: NodeId,
    pub level: HealthLevel,
    pub healthy: bool,
    pub test_results: Vec<(HealthTest, TestOutcome)>,
    pub response_time: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthStats {
    pub fast_checks: u64,
    pub medium_checks: u64,
    pub deep_checks: u64,
    pub successes: u64,
    pub failures: u64,
    pub removed: u64,
    total_response_time: Duration,
}

impl HealthStats {
    pub fn average_response_time(&self) -> Duration {
        let total = self.successes + self.failures;
        if total == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(self.total_response_time.as_secs_f64() / total as f64)
        }
    }

    fn record(&mut self, result: &HealthCheckResult) {
        match result.level {
            HealthLevel::Fast => self.fast_checks += 1,
            HealthLevel::Medium => self.medium_checks += 1,
            HealthLevel::Deep => self.deep_checks += 1,
        }
        if result.healthy {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_response_time = self.total_response_time.saturating_add(result.response_time);
    }
}

/// Summary of one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthBatch {
    pub level: HealthLevel,
    pub checked: usize,
    pub healthy: usize,
    pub failed: usize,
    pub evicted: usize,
    pub duration: Duration,
}

/// Run the test suite of `level` against `peer`, each call bounded by
/// `limit` and retried per `retry`. Stops at the first failure.
async fn run_suite<N: OverlayRpc>(
    network: Arc<N>,
    peer: PeerRecord,
    level: HealthLevel,
    limit: Duration,
    retry: RetryPolicy,
) -> HealthCheckResult {
    let started = Instant::now();
    let mut results = Vec::with_capacity(level.tests().len());
    let mut healthy = true;

    for &test in level.tests() {
        if !healthy {
            results.push((test, TestOutcome::Skipped));
            continue;
        }
        let net = network.as_ref();
        let outcome = match test {
            HealthTest::Ping => call_with_retry(peer.id, limit, retry, || net.ping(&peer)).await,
            HealthTest::FindNode => call_with_retry(peer.id, limit, retry, || net.find_node(&peer, NodeId::random()))
                .await
                .map(|_| ()),
            HealthTest::StoreRetrieve => store_retrieve(net, &peer, limit, retry).await,
        };
        match outcome {
            Ok(()) => results.push((test, TestOutcome::Passed)),
            Err(err) => {
                healthy = false;
                results.push((test, TestOutcome::Failed(err.to_string())));
            }
        }
    }

    HealthCheckResult {
        peer: peer.id,
        level,
        healthy,
        test_results: results,
        response_time: started.elapsed(),
    }
}

async fn store_retrieve<N: OverlayRpc>(
    network: &N,
    peer: &PeerRecord,
    limit: Duration,
    retry: RetryPolicy,
) -> crate::error::Result<()> {
    let payload: [u8; 32] = rand::random();
    let key = *blake3::hash(&payload).as_bytes();
    call_with_retry(peer.id, limit, retry, || network.store(peer, key, payload.to_vec())).await?;
    let (value, _) = call_with_retry(peer.id, limit, retry, || network.find_value(peer, key)).await?;
    if value.as_deref() == Some(&payload[..]) {
        Ok(())
    } else {
        Err(crate::error::OverlayError::rpc(peer.id, "stored value not returned"))
    }
}

pub struct HealthMonitor<N: OverlayRpc> {
    routing: RoutingNode<N>,
    cache: Option<Arc<PeerCache>>,
    config: HealthConfig,
    statuses: Arc<RwLock<HashMap<NodeId, HealthStatus>>>,
    stats: Arc<Mutex<HealthStats>>,
    slots: Arc<Semaphore>,
    events: EventSink,
    critical_tx: Option<mpsc::Sender<CriticalEvent>>,
    retry: RetryPolicy,
}

impl<N: OverlayRpc> Clone for HealthMonitor<N> {
    fn clone(&self) -> Self {
        Self {
            routing: self.routing.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
            statuses: self.statuses.clone(),
            stats: self.stats.clone(),
            slots: self.slots.clone(),
            events: self.events.clone(),
            critical_tx: self.critical_tx.clone(),
            retry: self.retry,
        }
    }
}

impl<N: OverlayRpc> HealthMonitor<N> {
    pub fn new(routing: RoutingNode<N>, config: HealthConfig, events: EventSink) -> Self {
        let slots = Arc::new(Semaphore::new(config.health_check_concurrency.max(1)));
        Self {
            routing,
            cache: None,
            config,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(Mutex::new(HealthStats::default())),
            slots,
            events,
            critical_tx: None,
            retry: RetryPolicy::NONE,
        }
    }

    /// Feed check outcomes back into the peer cache.
    pub fn with_cache(mut self, cache: Arc<PeerCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Report evictions and suspected partitions to the refresh scheduler.
    pub fn with_critical_events(mut self, tx: mpsc::Sender<CriticalEvent>) -> Self {
        self.critical_tx = Some(tx);
        self
    }

    /// Retry failed probe calls before counting a test as failed.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn raise(&self, event: CriticalEvent) {
        if let Some(tx) = &self.critical_tx
            && let Err(err) = tx.try_send(event)
        {
            debug!(error = %err, "critical event dropped");
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn timeout_for(&self, level: HealthLevel) -> Duration {
        let t = &self.config.health_check_timeouts;
        match level {
            HealthLevel::Fast => t.fast,
            HealthLevel::Medium => t.medium,
            HealthLevel::Deep => t.deep,
        }
    }

    fn interval_for(&self, level: HealthLevel) -> Duration {
        let i = &self.config.health_check_intervals;
        match level {
            HealthLevel::Fast => i.fast,
            HealthLevel::Medium => i.medium,
            HealthLevel::Deep => i.deep,
        }
    }

    fn is_critical(&self, peer: &PeerRecord) -> bool {
        self.config.critical_roles.iter().any(|r| peer.roles.contains(*r))
    }

    /// Check one peer immediately, outside the batch loops. The outcome is
    /// recorded like any batch result.
    pub async fn check_peer(&self, peer: &PeerRecord, level: HealthLevel) -> HealthCheckResult {
        let network = self.routing.network().clone();
        let result = run_suite(network, peer.clone(), level, self.timeout_for(level), self.retry).await;
        self.record(peer, &result).await;
        result
    }

    /// Peers due for a check at `level`.
    pub fn targets(&self, level: HealthLevel) -> Vec<PeerRecord> {
        let peers: Vec<PeerRecord> = self.routing.snapshot().peers().cloned().collect();
        if level == HealthLevel::Fast {
            return peers;
        }
        let Ok(statuses) = self.statuses.read() else {
            return Vec::new();
        };
        peers
            .into_iter()
            .filter(|peer| {
                let status = statuses.get(&peer.id);
                match level {
                    HealthLevel::Fast => true,
                    HealthLevel::Medium => match status {
                        None => true,
                        Some(s) => {
                            s.availability() < self.config.low_availability
                                || s.last_full_check
                                    .is_none_or(|t| t.elapsed() >= self.config.medium_recheck_after)
                        }
                    },
                    HealthLevel::Deep => {
                        self.is_critical(peer)
                            || status.is_some_and(|s| {
                                s.consecutive_failures > 0
                                    || !s.overall_healthy
                                    || s.availability() < self.config.suspicious_availability
                            })
                    }
                }
            })
            .collect()
    }

    /// Run one batch of `level` checks, then evict peers unhealthy for too
    /// long.
    pub async fn run_level(&self, level: HealthLevel) -> HealthBatch {
        let started = Instant::now();
        self.prune_departed();
        let targets = self.targets(level);
        let limit = self.timeout_for(level);
        let retry = self.retry;

        let mut join_set = JoinSet::new();
        for peer in targets {
            let slots = self.slots.clone();
            let network = self.routing.network().clone();
            join_set.spawn(async move {
                let _permit = slots.acquire_owned().await.ok()?;
                let result = run_suite(network, peer.clone(), level, limit, retry).await;
                Some((peer, result))
            });
        }

        let mut checked = 0;
        let mut healthy = 0;
        while let Some(joined) = join_set.join_next().await {
            let Ok(Some((peer, result))) = joined else {
                continue;
            };
            checked += 1;
            if result.healthy {
                healthy += 1;
            } else {
                trace!(
                    peer = %peer.id.short(),
                    level = level.as_str(),
                    results = ?result.test_results,
                    "health check failed"
                );
            }
            self.record(&peer, &result).await;
        }

        let failed = checked - healthy;
        if checked >= PARTITION_MIN_CHECKED && failed * 2 > checked {
            warn!(level = level.as_str(), checked, failed, "most peers failed health checks, partition suspected");
            self.raise(CriticalEvent::PartitionSuspected);
        }

        let evicted = self.evict_expired().await.len();
        let batch = HealthBatch {
            level,
            checked,
            healthy,
            failed,
            evicted,
            duration: started.elapsed(),
        };
        self.events.emit(OverlayEvent::HealthBatchCompleted {
            level,
            checked,
            healthy,
            failed: batch.failed,
            evicted,
            duration: batch.duration,
        });
        batch
    }

    /// Drop statuses of peers no longer in the routing table. Returns how
    /// many were dropped.
    fn prune_departed(&self) -> usize {
        let snapshot = self.routing.snapshot();
        let Ok(mut statuses) = self.statuses.write() else {
            return 0;
        };
        let before = statuses.len();
        statuses.retain(|id, _| snapshot.contains(id));
        let pruned = before - statuses.len();
        if pruned > 0 {
            trace!(pruned, "dropped statuses of departed peers");
        }
        pruned
    }

    async fn record(&self, peer: &PeerRecord, result: &HealthCheckResult) {
        let critical = self.is_critical(peer);
        if let Ok(mut statuses) = self.statuses.write() {
            statuses
                .entry(peer.id)
                .or_insert_with(|| HealthStatus::new(result.level, Instant::now()))
                .apply(result, critical);
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(result);
        }
        if let Some(cache) = &self.cache {
            cache.update_verification(&peer.id, result.healthy);
        }

        if result.healthy {
            self.routing.mark_verified(peer.id).await;
            self.routing.set_health(peer.id, PeerHealth::Healthy).await;
        } else {
            self.routing.set_health(peer.id, PeerHealth::Unhealthy).await;
        }
    }

    /// Evict peers continuously unhealthy for longer than
    /// `max_unhealthy_duration`; returns their ids.
    pub async fn evict_expired(&self) -> Vec<NodeId> {
        let limit = self.config.max_unhealthy_duration;
        let expired: Vec<NodeId> = match self.statuses.write() {
            Ok(mut statuses) => {
                let ids: Vec<NodeId> = statuses
                    .iter()
                    .filter(|(_, s)| s.unhealthy_since.is_some_and(|t| t.elapsed() > limit))
                    .map(|(id, _)| *id)
                    .collect();
                for id in &ids {
                    statuses.remove(id);
                }
                ids
            }
            Err(_) => Vec::new(),
        };

        for id in &expired {
            if let Err(err) = self.routing.evict(*id, EvictionReason::Unhealthy).await {
                warn!(peer = %id.short(), error = %err, "failed to evict unhealthy peer");
            }
            if let Some(cache) = &self.cache {
                cache.remove(id);
            }
            self.raise(CriticalEvent::PeerFailed(*id));
        }
        if !expired.is_empty() {
            if let Ok(mut stats) = self.stats.lock() {
                stats.removed += expired.len() as u64;
            }
            info!(evicted = expired.len(), "evicted persistently unhealthy peers");
        }
        expired
    }

    pub fn status(&self, id: &NodeId) -> Option<HealthStatus> {
        self.statuses.read().ok().and_then(|s| s.get(id).cloned())
    }

    pub fn statuses(&self) -> HashMap<NodeId, HealthStatus> {
        self.statuses.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn stats(&self) -> HealthStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    /// Start one loop per level. Returns no tasks when health checking is
    /// disabled.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        if !self.config.enable_health_check {
            info!("health checks disabled");
            return Vec::new();
        }
        HealthLevel::ALL
            .into_iter()
            .map(|level| {
                let monitor = self.clone();
                let mut shutdown = shutdown.clone();
                let period = self.interval_for(level);
                tokio::spawn(async move {
                    let mut ticker = interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    // The first tick completes immediately.
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                let batch = monitor.run_level(level).await;
                                debug!(level = level.as_str(), checked = batch.checked, "health batch done");
                            }
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    debug!(level = level.as_str(), "health loop stopped");
                })
            })
            .collect()
    }
}
