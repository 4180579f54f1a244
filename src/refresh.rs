//! # Adaptive Bucket Refresh
//!
//! Four strategies keep the routing table current:
//!
//! - **immediate**: driven by [`CriticalEvent`]s, refreshes only the buckets
//!   affected (a failed peer's bucket, every bucket on a suspected
//!   partition) and runs maintenance on corruption;
//! - **active**: 15 to 120 s, refreshes the buckets whose recent membership
//!   changes mark them as dynamic;
//! - **stable**: 60 to 600 s, refresh depth (selective, partial, full)
//!   picked from the stability score;
//! - **maintenance**: at least every 30 min, validates and repairs the table
//!   and refreshes every bucket.
//!
//! All of them use one primitive: look up a random id in the bucket's prefix
//! range and merge what comes back ([`RefreshScheduler::refresh_bucket`]).
//!
//! Active and stable passes validate the table first and queue a corruption
//! event when it fails. A non-immediate pass in which most lookups went
//! unanswered queues a suspected partition.
//!
//! Intervals adapt to network dynamics measured by [`DynamicsAnalyzer`]:
//!
//! ```text
//! score      = 0.4 churn + 0.3 bucket_change + 0.15 load + 0.15 latency_variance
//! stability  = 1 - score
//! active     = clamp(active_base * (1.5 - score) * (1 + 0.5 load), 15 s, 120 s)
//! stable     = clamp(stable_base * (0.5 + stability) * (1 + 0.5 load), 60 s, 600 s)
//! ```

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::RefreshConfig;
use crate::discovery::DiscoveryEngine;
use crate::error::{OverlayError, Result};
use crate::events::{EventSink, OverlayEvent};
use crate::identity::{random_id_in_bucket, NodeId, ID_BITS};
use crate::params::saturating_scale;
use crate::protocols::OverlayRpc;
use crate::routing::RoutingSnapshot;

const CHURN_WEIGHT: f64 = 0.4;
const BUCKET_CHANGE_WEIGHT: f64 = 0.3;
const LOAD_WEIGHT: f64 = 0.15;
const LATENCY_WEIGHT: f64 = 0.15;

/// Snapshots kept for churn and bucket-change rates.
const DYNAMICS_WINDOW: usize = 10;
/// Refresh lookup latencies kept for the variance signal.
const LATENCY_WINDOW: usize = 50;

/// Fewest lookups in one pass whose failure ratio can suggest a partition.
const PARTITION_MIN_LOOKUPS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshStrategy {
    Immediate,
    Active,
    Stable,
    Maintenance,
}

impl RefreshStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStrategy::Immediate => "immediate",
            RefreshStrategy::Active => "active",
            RefreshStrategy::Stable => "stable",
            RefreshStrategy::Maintenance => "maintenance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDepth {
    /// Only buckets not refreshed for `stale_bucket_after`.
    Selective,
    /// Buckets not refreshed for half of `stale_bucket_after`.
    Partial,
    /// Every bucket down to one past the deepest populated one.
    Full,
}

impl RefreshDepth {
    pub fn for_stability(stability: f64) -> Self {
        if stability >= 0.8 {
            RefreshDepth::Selective
        } else if stability >= 0.5 {
            RefreshDepth::Partial
        } else {
            RefreshDepth::Full
        }
    }
}

/// Triggers for an immediate refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticalEvent {
    PeerFailed(NodeId),
    PartitionSuspected,
    RoutingCorruption,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DynamicsSignals {
    pub churn_rate: f64,
    pub bucket_change_rate: f64,
    pub load: f64,
    pub latency_variance: f64,
    pub score: f64,
    pub stability: f64,
}

#[derive(Debug, Clone)]
struct DynamicsSample {
    churn: f64,
    bucket_deltas: HashMap<usize, u64>,
}

/// Derives churn, bucket-change, load and latency signals from successive
/// routing snapshots and refresh timings.
#[derive(Debug, Default)]
pub struct DynamicsAnalyzer {
    previous: Option<Arc<RoutingSnapshot>>,
    samples: VecDeque<DynamicsSample>,
    latencies: VecDeque<Duration>,
    load: f64,
}

impl DynamicsAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, snapshot: Arc<RoutingSnapshot>) {
        if let Some(prev) = &self.previous {
            let joins = snapshot.joins.saturating_sub(prev.joins);
            let departures = snapshot.departures.saturating_sub(prev.departures);
            let population = prev.node_count().max(snapshot.node_count()).max(1);
            let churn = ((joins + departures) as f64 / population as f64).min(1.0);

            let bucket_deltas = snapshot
                .buckets
                .iter()
                .filter_map(|b| {
                    let before = prev.bucket(b.index).map_or(0, |p| p.changes);
                    let delta = b.changes.saturating_sub(before);
                    (delta > 0).then_some((b.index, delta))
                })
                .collect();

            self.samples.push_back(DynamicsSample { churn, bucket_deltas });
            if self.samples.len() > DYNAMICS_WINDOW {
                self.samples.pop_front();
            }
        }
        self.previous = Some(snapshot);
    }

    pub fn record_latency(&mut self, latency: Duration) {
        self.latencies.push_back(latency);
        if self.latencies.len() > LATENCY_WINDOW {
            self.latencies.pop_front();
        }
    }

    /// Load in `[0, 1]`; out-of-range values are clamped.
    pub fn record_load(&mut self, load: f64) {
        self.load = if load.is_finite() { load.clamp(0.0, 1.0) } else { 1.0 };
    }

    fn latency_variation(&self) -> f64 {
        if self.latencies.len() < 2 {
            return 0.0;
        }
        let secs: Vec<f64> = self.latencies.iter().map(Duration::as_secs_f64).collect();
        let mean = secs.iter().sum::<f64>() / secs.len() as f64;
        if mean <= f64::EPSILON {
            return 0.0;
        }
        let variance = secs.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / secs.len() as f64;
        (variance.sqrt() / mean).min(1.0)
    }

    pub fn signals(&self) -> DynamicsSignals {
        let churn_rate = if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().map(|s| s.churn).sum::<f64>() / self.samples.len() as f64
        };

        let changed: HashSet<usize> = self
            .samples
            .iter()
            .flat_map(|s| s.bucket_deltas.keys().copied())
            .collect();
        let active = self
            .previous
            .as_ref()
            .map_or(0, |snap| snap.active_buckets().len())
            .max(1);
        let bucket_change_rate = (changed.len() as f64 / active as f64).min(1.0);

        let latency_variance = self.latency_variation();
        let score = (CHURN_WEIGHT * churn_rate
            + BUCKET_CHANGE_WEIGHT * bucket_change_rate
            + LOAD_WEIGHT * self.load
            + LATENCY_WEIGHT * latency_variance)
            .clamp(0.0, 1.0);

        DynamicsSignals {
            churn_rate,
            bucket_change_rate,
            load: self.load,
            latency_variance,
            score,
            stability: 1.0 - score,
        }
    }

    /// Per-bucket dynamics: membership changes over the window relative to
    /// the bucket's current size, capped at 1.
    pub fn bucket_scores(&self) -> HashMap<usize, f64> {
        let mut totals: HashMap<usize, u64> = HashMap::new();
        for sample in &self.samples {
            for (&idx, &delta) in &sample.bucket_deltas {
                *totals.entry(idx).or_default() += delta;
            }
        }
        totals
            .into_iter()
            .map(|(idx, total)| {
                let size = self
                    .previous
                    .as_ref()
                    .and_then(|s| s.bucket(idx))
                    .map_or(0, |b| b.peers.len())
                    .max(1);
                (idx, (total as f64 / size as f64).min(1.0))
            })
            .collect()
    }

    pub fn dynamic_buckets(&self, threshold: f64) -> Vec<usize> {
        let mut buckets: Vec<usize> = self
            .bucket_scores()
            .into_iter()
            .filter(|(_, score)| *score >= threshold)
            .map(|(idx, _)| idx)
            .collect();
        buckets.sort_unstable();
        buckets
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    pub strategy: RefreshStrategy,
    pub buckets: Vec<usize>,
    /// Peers that were not in the table before the pass.
    pub discovered: usize,
    pub failed_lookups: usize,
    pub duration: Duration,
}

pub struct RefreshScheduler<N: OverlayRpc> {
    engine: DiscoveryEngine<N>,
    config: RefreshConfig,
    analyzer: Arc<Mutex<DynamicsAnalyzer>>,
    events: EventSink,
    critical_tx: mpsc::Sender<CriticalEvent>,
    critical_rx: Arc<Mutex<Option<mpsc::Receiver<CriticalEvent>>>>,
}

impl<N: OverlayRpc> Clone for RefreshScheduler<N> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            config: self.config.clone(),
            analyzer: self.analyzer.clone(),
            events: self.events.clone(),
            critical_tx: self.critical_tx.clone(),
            critical_rx: self.critical_rx.clone(),
        }
    }
}

impl<N: OverlayRpc> RefreshScheduler<N> {
    pub fn new(engine: DiscoveryEngine<N>, config: RefreshConfig, events: EventSink) -> Self {
        let (critical_tx, critical_rx) = mpsc::channel(config.critical_event_capacity.max(1));
        Self {
            engine,
            config,
            analyzer: Arc::new(Mutex::new(DynamicsAnalyzer::new())),
            events,
            critical_tx,
            critical_rx: Arc::new(Mutex::new(Some(critical_rx))),
        }
    }

    /// Channel for reporting critical events from other components.
    pub fn event_sender(&self) -> mpsc::Sender<CriticalEvent> {
        self.critical_tx.clone()
    }

    pub fn signals(&self) -> DynamicsSignals {
        self.analyzer.lock().map(|a| a.signals()).unwrap_or_default()
    }

    fn observe_table(&self) {
        let snapshot = self.engine.routing().snapshot();
        if let Ok(mut analyzer) = self.analyzer.lock() {
            analyzer.observe(snapshot);
        }
    }

    pub fn active_interval(&self) -> Duration {
        let bounds = self.config.refresh_interval_bounds.active;
        if !self.config.enable_adaptive_refresh {
            return bounds.clamp(self.config.active_base_interval);
        }
        let s = self.signals();
        let factor = (1.5 - s.score) * (1.0 + 0.5 * s.load);
        bounds.clamp(saturating_scale(self.config.active_base_interval, factor, bounds.max))
    }

    pub fn stable_interval(&self) -> Duration {
        let bounds = self.config.refresh_interval_bounds.stable;
        if !self.config.enable_adaptive_refresh {
            return bounds.clamp(self.config.stable_base_interval);
        }
        let s = self.signals();
        let factor = (0.5 + s.stability) * (1.0 + 0.5 * s.load);
        bounds.clamp(saturating_scale(self.config.stable_base_interval, factor, bounds.max))
    }

    pub fn stable_depth(&self) -> RefreshDepth {
        if !self.config.enable_adaptive_refresh {
            return RefreshDepth::Full;
        }
        RefreshDepth::for_stability(self.signals().stability)
    }

    /// Look up a random id in bucket `idx`'s range and merge the answers.
    /// Returns the number of peers new to the table.
    pub async fn refresh_bucket(&self, idx: usize) -> Result<usize> {
        self.refresh_one(idx).await.map(|(discovered, _)| discovered)
    }

    /// Refresh one bucket; the flag is false when peers were queried and
    /// none answered.
    async fn refresh_one(&self, idx: usize) -> Result<(usize, bool)> {
        let routing = self.engine.routing();
        let before: HashSet<NodeId> = routing.snapshot().peers().map(|p| p.id).collect();
        let target = random_id_in_bucket(&routing.local_id(), idx.min(ID_BITS - 1));

        let started = Instant::now();
        let lookup = self.engine.iterative_find_node(target).await?;
        if let Ok(mut analyzer) = self.analyzer.lock() {
            analyzer.record_latency(started.elapsed());
        }
        routing.mark_bucket_refreshed(idx).await;

        let discovered = routing
            .snapshot()
            .peers()
            .filter(|p| !before.contains(&p.id))
            .count();
        debug!(
            bucket = idx,
            responded = lookup.responded,
            discovered,
            "bucket refreshed"
        );
        Ok((discovered, lookup.queried == 0 || lookup.responded > 0))
    }

    fn raise(&self, event: CriticalEvent) {
        if let Err(err) = self.critical_tx.try_send(event) {
            debug!(event = ?event, error = %err, "critical event dropped");
        }
    }

    /// Validate the table. Issues queue an immediate maintenance pass.
    pub async fn verify_integrity(&self) -> Result<()> {
        let issues = self
            .engine
            .routing()
            .validate()
            .await
            .map_err(|_| OverlayError::Closed("routing actor"))?;
        if issues.is_empty() {
            return Ok(());
        }
        warn!(issues = issues.len(), "routing table corruption detected");
        self.raise(CriticalEvent::RoutingCorruption);
        Err(OverlayError::RoutingCorruption { issues: issues.len() })
    }

    async fn refresh_buckets(&self, strategy: RefreshStrategy, buckets: Vec<usize>) -> RefreshReport {
        let started = Instant::now();
        let mut discovered = 0;
        let mut failed_lookups = 0;
        let mut attempted = 0;
        for &idx in &buckets {
            attempted += 1;
            match self.refresh_one(idx).await {
                Ok((n, answered)) => {
                    discovered += n;
                    if !answered {
                        failed_lookups += 1;
                    }
                }
                Err(OverlayError::Closed(what)) => {
                    debug!(component = what, "refresh stopped");
                    failed_lookups += 1;
                    break;
                }
                Err(err) => {
                    failed_lookups += 1;
                    debug!(bucket = idx, error = %err, "bucket refresh failed");
                }
            }
        }
        // An immediate pass never re-raises, so a partition cannot feed itself.
        if strategy != RefreshStrategy::Immediate
            && attempted >= PARTITION_MIN_LOOKUPS
            && failed_lookups * 2 > attempted
        {
            warn!(
                strategy = strategy.as_str(),
                attempted,
                failed_lookups,
                "most refresh lookups failed, partition suspected"
            );
            self.raise(CriticalEvent::PartitionSuspected);
        }
        let duration = started.elapsed();
        self.events.emit(OverlayEvent::RefreshCompleted {
            strategy,
            buckets: buckets.len(),
            discovered,
            duration,
        });
        RefreshReport {
            strategy,
            buckets,
            discovered,
            failed_lookups,
            duration,
        }
    }

    /// Buckets `0..=deepest+1`, the range a full refresh covers.
    fn full_range(&self) -> Vec<usize> {
        let snapshot = self.engine.routing().snapshot();
        let deepest = snapshot.active_buckets().into_iter().max().unwrap_or(0);
        (0..=(deepest + 1).min(ID_BITS - 1)).collect()
    }

    /// Refresh the buckets affected by `events`.
    pub async fn run_immediate(&self, events: &[CriticalEvent]) -> RefreshReport {
        if events.contains(&CriticalEvent::RoutingCorruption) {
            return self.run_maintenance().await;
        }
        let snapshot = self.engine.routing().snapshot();
        let local = snapshot.local_id;
        let mut buckets = BTreeSet::new();
        for event in events {
            match event {
                CriticalEvent::PeerFailed(id) => {
                    buckets.insert(local.shared_prefix_len(id).min(ID_BITS - 1));
                }
                CriticalEvent::PartitionSuspected => buckets.extend(snapshot.active_buckets()),
                CriticalEvent::RoutingCorruption => {}
            }
        }
        self.refresh_buckets(RefreshStrategy::Immediate, buckets.into_iter().collect())
            .await
    }

    /// Refresh buckets whose dynamics score reaches the configured threshold.
    pub async fn run_active(&self) -> RefreshReport {
        self.observe_table();
        if let Err(err) = self.verify_integrity().await {
            debug!(error = %err, "integrity check before active refresh");
        }
        let buckets = self
            .analyzer
            .lock()
            .map(|a| a.dynamic_buckets(self.config.dynamic_bucket_threshold))
            .unwrap_or_default();
        self.refresh_buckets(RefreshStrategy::Active, buckets).await
    }

    pub async fn run_stable(&self) -> RefreshReport {
        self.observe_table();
        if let Err(err) = self.verify_integrity().await {
            debug!(error = %err, "integrity check before stable refresh");
        }
        let depth = self.stable_depth();
        let snapshot = self.engine.routing().snapshot();
        let buckets = match depth {
            RefreshDepth::Selective => snapshot.stale_buckets(self.config.stale_bucket_after),
            RefreshDepth::Partial => snapshot.stale_buckets(self.config.stale_bucket_after / 2),
            RefreshDepth::Full => self.full_range(),
        };
        debug!(depth = ?depth, buckets = buckets.len(), "stable refresh");
        self.refresh_buckets(RefreshStrategy::Stable, buckets).await
    }

    /// Validate and repair the table, then refresh every bucket.
    pub async fn run_maintenance(&self) -> RefreshReport {
        let routing = self.engine.routing();
        match routing.validate().await {
            Ok(issues) if !issues.is_empty() => {
                warn!(issues = issues.len(), "routing table corruption detected");
                let repaired = routing.repair().await.unwrap_or(0);
                self.events.emit(OverlayEvent::RoutingCorruptionDetected {
                    issues: issues.len(),
                    repaired,
                });
            }
            Ok(_) => {}
            Err(err) => debug!(error = %err, "routing validation unavailable"),
        }
        self.refresh_buckets(RefreshStrategy::Maintenance, self.full_range())
            .await
    }

    fn record_load(&self, report: &RefreshReport, period: Duration) {
        if period.is_zero() {
            return;
        }
        if let Ok(mut analyzer) = self.analyzer.lock() {
            analyzer.record_load(report.duration.as_secs_f64() / period.as_secs_f64());
        }
    }

    /// Start the four refresh loops. The adaptive loops are no-ops when the
    /// critical-event receiver was already taken by an earlier call.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(4);

        let receiver = self.critical_rx.lock().ok().and_then(|mut rx| rx.take());
        match receiver {
            Some(mut rx) => {
                let scheduler = self.clone();
                let mut shutdown = shutdown.clone();
                tasks.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            event = rx.recv() => {
                                let Some(first) = event else { break };
                                let mut batch = vec![first];
                                while let Ok(more) = rx.try_recv() {
                                    batch.push(more);
                                }
                                let report = scheduler.run_immediate(&batch).await;
                                info!(
                                    events = batch.len(),
                                    buckets = report.buckets.len(),
                                    "immediate refresh done"
                                );
                            }
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                }));
            }
            None => {
                warn!("refresh loops already started");
                return tasks;
            }
        }

        for strategy in [RefreshStrategy::Active, RefreshStrategy::Stable] {
            let scheduler = self.clone();
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let period = match strategy {
                        RefreshStrategy::Active => scheduler.active_interval(),
                        _ => scheduler.stable_interval(),
                    };
                    tokio::select! {
                        _ = sleep(period) => {
                            let report = match strategy {
                                RefreshStrategy::Active => scheduler.run_active().await,
                                _ => scheduler.run_stable().await,
                            };
                            scheduler.record_load(&report, period);
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!(strategy = strategy.as_str(), "refresh loop stopped");
            }));
        }

        let scheduler = self.clone();
        let mut shutdown = shutdown;
        let period = self.config.maintenance_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.run_maintenance().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("maintenance loop stopped");
        }));

        tasks
    }
}
