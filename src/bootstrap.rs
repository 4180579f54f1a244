//! # Tiered Bootstrap
//!
//! Entry peers are organised in three tiers: `super` (a few well-provisioned
//! seeds), `regional` and `local`. [`BootstrapSelector`] picks entry peers
//! for a joining node:
//!
//! - the deployment scale (from the expected worker count) decides which
//!   tiers take part and how many endpoints are returned;
//! - within a tier the [`SelectionPolicy`] orders endpoints, preferring the
//!   caller's region;
//! - every attempt is reported back, so endpoint and tier health follow
//!   live feedback: `unknown -> healthy -> unhealthy (N failures) -> healthy
//!   (1 success)`.
//!
//! When the participating tiers are all unhealthy, selection falls back to
//! the next healthy tier. [`Bootstrapper::join`] drives the whole admission
//! with exponential backoff and fails with
//! [`OverlayError::BootstrapExhausted`] once the attempt budget is spent.

use std::sync::Mutex;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{BootstrapConfig, BootstrapTierConfig, DeploymentScaleThresholds};
use crate::discovery::DiscoveryEngine;
use crate::error::{OverlayError, Result};
use crate::events::{EventSink, OverlayEvent};
use crate::identity::{NodeId, PeerRecord, PeerTier};
use crate::protocols::{call_with_retry, OverlayRpc, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapTierLevel {
    Super,
    Regional,
    Local,
}

impl BootstrapTierLevel {
    pub const ALL: [BootstrapTierLevel; 3] = [
        BootstrapTierLevel::Super,
        BootstrapTierLevel::Regional,
        BootstrapTierLevel::Local,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapTierLevel::Super => "super",
            BootstrapTierLevel::Regional => "regional",
            BootstrapTierLevel::Local => "local",
        }
    }

    pub fn peer_tier(self) -> PeerTier {
        match self {
            BootstrapTierLevel::Super => PeerTier::Super,
            BootstrapTierLevel::Regional => PeerTier::Regional,
            BootstrapTierLevel::Local => PeerTier::Local,
        }
    }

    pub fn from_peer_tier(tier: PeerTier) -> Option<Self> {
        match tier {
            PeerTier::Super => Some(BootstrapTierLevel::Super),
            PeerTier::Regional => Some(BootstrapTierLevel::Regional),
            PeerTier::Local => Some(BootstrapTierLevel::Local),
            PeerTier::Worker => None,
        }
    }
}

/// How endpoints within a tier are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    RoundRobin,
    /// Lowest load score first, then fewest active connections.
    LeastLoaded,
    /// Highest configured weight first.
    Priority,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeploymentScale {
    Small,
    Medium,
    Large,
    XLarge,
}

impl DeploymentScale {
    pub fn classify(worker_count: usize, thresholds: &DeploymentScaleThresholds) -> Self {
        if worker_count <= thresholds.small {
            DeploymentScale::Small
        } else if worker_count <= thresholds.medium {
            DeploymentScale::Medium
        } else if worker_count <= thresholds.large {
            DeploymentScale::Large
        } else {
            DeploymentScale::XLarge
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentScale::Small => "small",
            DeploymentScale::Medium => "medium",
            DeploymentScale::Large => "large",
            DeploymentScale::XLarge => "xlarge",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EndpointHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct BootstrapEndpoint {
    pub record: PeerRecord,
    pub region: Option<String>,
    pub weight: u32,
    /// 0.0 (idle) to 1.0 (saturated), as last reported.
    pub load_score: f64,
    pub active_connections: usize,
    pub consecutive_failures: u32,
    pub health: EndpointHealth,
    pub last_attempt: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct BootstrapTier {
    pub level: BootstrapTierLevel,
    pub capacity_limit: usize,
    pub active_connections: usize,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub endpoints: Vec<BootstrapEndpoint>,
    cursor: usize,
}

impl BootstrapTier {
    pub fn new(level: BootstrapTierLevel, capacity_limit: usize) -> Self {
        Self {
            level,
            capacity_limit,
            active_connections: 0,
            healthy: true,
            consecutive_failures: 0,
            endpoints: Vec::new(),
            cursor: 0,
        }
    }

    fn from_config(config: &BootstrapTierConfig) -> Result<Self> {
        let mut tier = Self::new(config.level, config.capacity_limit);
        for ep in &config.endpoints {
            let id = match &ep.id {
                Some(hex) => NodeId::from_hex(hex).map_err(|e| {
                    OverlayError::invalid_config(format!("bootstrap endpoint {}:{}: {e}", ep.address, ep.port))
                })?,
                None => NodeId::derive(format!("{}:{}", ep.address, ep.port).as_bytes()),
            };
            let record = PeerRecord::new(id, ep.address.clone(), ep.port);
            tier.add_endpoint(record, ep.region.clone(), ep.weight);
        }
        Ok(tier)
    }

    pub fn add_endpoint(&mut self, record: PeerRecord, region: Option<String>, weight: u32) {
        let record = record.with_tier(self.level.peer_tier());
        self.endpoints.push(BootstrapEndpoint {
            record,
            region,
            weight,
            load_score: 0.0,
            active_connections: 0,
            consecutive_failures: 0,
            health: EndpointHealth::Unknown,
            last_attempt: None,
        });
    }

    fn has_capacity(&self) -> bool {
        self.active_connections < self.capacity_limit
    }

    /// Endpoint indices in policy order, unhealthy ones last, the caller's
    /// region first among equals.
    fn ordered(&self, policy: SelectionPolicy, region: Option<&str>) -> Vec<usize> {
        let n = self.endpoints.len();
        let mut order: Vec<usize> = (0..n).collect();
        match policy {
            SelectionPolicy::RoundRobin => {
                if n > 0 {
                    order.rotate_left(self.cursor % n);
                }
            }
            SelectionPolicy::LeastLoaded => order.sort_by(|&a, &b| {
                let ea = &self.endpoints[a];
                let eb = &self.endpoints[b];
                ea.load_score
                    .total_cmp(&eb.load_score)
                    .then(ea.active_connections.cmp(&eb.active_connections))
            }),
            SelectionPolicy::Priority => order.sort_by(|&a, &b| self.endpoints[b].weight.cmp(&self.endpoints[a].weight)),
            SelectionPolicy::Random => order.shuffle(&mut rand::thread_rng()),
        }
        // Stable sorts keep the policy order inside each group.
        if let Some(region) = region {
            order.sort_by_key(|&i| self.endpoints[i].region.as_deref() != Some(region));
        }
        order.sort_by_key(|&i| self.endpoints[i].health == EndpointHealth::Unhealthy);
        order
    }
}

/// Tier summary for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct TierInfo {
    pub level: BootstrapTierLevel,
    pub healthy: bool,
    pub endpoints: usize,
    pub healthy_endpoints: usize,
    pub active_connections: usize,
    pub capacity_limit: usize,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapInfo {
    pub policy: SelectionPolicy,
    pub tiers: Vec<TierInfo>,
}

pub struct BootstrapSelector {
    config: BootstrapConfig,
    tiers: Vec<BootstrapTier>,
    events: Option<EventSink>,
}

impl BootstrapSelector {
    pub fn from_config(config: BootstrapConfig) -> Result<Self> {
        let mut tiers = config
            .tiers
            .iter()
            .map(BootstrapTier::from_config)
            .collect::<Result<Vec<_>>>()?;
        tiers.sort_by_key(|t| t.level);
        Ok(Self {
            config,
            tiers,
            events: None,
        })
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    /// Add a tier, replacing any existing one at the same level.
    pub fn add_tier(&mut self, tier: BootstrapTier) {
        self.tiers.retain(|t| t.level != tier.level);
        self.tiers.push(tier);
        self.tiers.sort_by_key(|t| t.level);
    }

    pub fn tier(&self, level: BootstrapTierLevel) -> Option<&BootstrapTier> {
        self.tiers.iter().find(|t| t.level == level)
    }

    fn endpoint_count(&self, scale: DeploymentScale) -> usize {
        let sizes = &self.config.bootstrap_tier_sizes;
        match scale {
            DeploymentScale::Small => sizes.small,
            DeploymentScale::Medium => sizes.medium,
            DeploymentScale::Large => sizes.large,
            DeploymentScale::XLarge => sizes.xlarge,
        }
    }

    /// Indices of the tiers to draw from: the participating healthy ones,
    /// else the next healthy tiers, else everything.
    fn candidate_tiers(&self, scale: DeploymentScale) -> Vec<usize> {
        let usable = |t: &BootstrapTier| !t.endpoints.is_empty() && t.has_capacity();
        let participating = |t: &BootstrapTier| scale != DeploymentScale::Small || t.level == BootstrapTierLevel::Super;

        let primary: Vec<usize> = (0..self.tiers.len())
            .filter(|&i| {
                let t = &self.tiers[i];
                participating(t) && t.healthy && usable(t)
            })
            .collect();
        if !primary.is_empty() {
            return primary;
        }

        let fallback: Vec<usize> = (0..self.tiers.len())
            .filter(|&i| self.tiers[i].healthy && usable(&self.tiers[i]))
            .take(1)
            .collect();
        if !fallback.is_empty() {
            return fallback;
        }

        (0..self.tiers.len()).filter(|&i| usable(&self.tiers[i])).collect()
    }

    /// Entry peers for a node joining a deployment of about `worker_count`
    /// workers. Records carry their tier in [`PeerRecord::tier`].
    pub fn select_bootstrap_peers(&mut self, worker_count: usize, region: Option<&str>) -> Vec<PeerRecord> {
        let scale = DeploymentScale::classify(worker_count, &self.config.scale_thresholds);
        let count = self.endpoint_count(scale).max(1);
        let policy = self.config.bootstrap_selection_policy;
        let tiers = self.candidate_tiers(scale);

        let mut queues: Vec<(usize, Vec<usize>)> = tiers
            .iter()
            .map(|&t| (t, self.tiers[t].ordered(policy, region)))
            .collect();

        // Interleave tiers so larger deployments spread across all of them.
        let mut picked = Vec::with_capacity(count);
        let mut taken_per_tier = vec![0usize; self.tiers.len()];
        let now = Instant::now();
        while picked.len() < count && queues.iter().any(|(_, q)| !q.is_empty()) {
            for (t, queue) in queues.iter_mut() {
                if picked.len() >= count {
                    break;
                }
                if queue.is_empty() {
                    continue;
                }
                let e = queue.remove(0);
                let endpoint = &mut self.tiers[*t].endpoints[e];
                endpoint.last_attempt = Some(now);
                picked.push(endpoint.record.clone());
                taken_per_tier[*t] += 1;
            }
        }
        for (t, taken) in taken_per_tier.into_iter().enumerate() {
            self.tiers[t].cursor = self.tiers[t].cursor.wrapping_add(taken);
        }

        debug!(
            worker_count,
            scale = scale.as_str(),
            policy = ?policy,
            selected = picked.len(),
            tiers = ?tiers.iter().map(|&t| self.tiers[t].level.as_str()).collect::<Vec<_>>(),
            "selected bootstrap peers"
        );
        picked
    }

    fn locate(&mut self, id: &NodeId) -> Option<(usize, usize)> {
        self.tiers.iter().enumerate().find_map(|(t, tier)| {
            tier.endpoints
                .iter()
                .position(|e| e.record.id == *id)
                .map(|e| (t, e))
        })
    }

    pub fn report_success(&mut self, id: &NodeId) {
        let Some((t, e)) = self.locate(id) else {
            return;
        };
        let tier = &mut self.tiers[t];
        let endpoint = &mut tier.endpoints[e];
        endpoint.consecutive_failures = 0;
        endpoint.health = EndpointHealth::Healthy;
        endpoint.active_connections += 1;
        tier.active_connections += 1;
        tier.consecutive_failures = 0;
        if !tier.healthy {
            tier.healthy = true;
            info!(tier = tier.level.as_str(), "bootstrap tier recovered");
        }
    }

    pub fn report_failure(&mut self, id: &NodeId) {
        let Some((t, e)) = self.locate(id) else {
            return;
        };
        let threshold = self.config.failure_threshold;
        let tier = &mut self.tiers[t];
        let endpoint = &mut tier.endpoints[e];
        endpoint.consecutive_failures += 1;
        if endpoint.consecutive_failures >= threshold {
            endpoint.health = EndpointHealth::Unhealthy;
        }
        tier.consecutive_failures += 1;

        if tier.healthy && tier.consecutive_failures >= threshold {
            tier.healthy = false;
            let from = tier.level;
            let consecutive_failures = tier.consecutive_failures;
            let to = self
                .tiers
                .iter()
                .find(|t| t.level != from && t.healthy && !t.endpoints.is_empty())
                .map(|t| t.level);
            if let Some(events) = &self.events {
                events.emit(OverlayEvent::BootstrapFailover {
                    from,
                    to,
                    consecutive_failures,
                });
            } else {
                warn!(from = from.as_str(), to = ?to.map(|l| l.as_str()), "bootstrap tier failover");
            }
        }
    }

    /// A connection obtained through `id` was closed.
    pub fn release(&mut self, id: &NodeId) {
        if let Some((t, e)) = self.locate(id) {
            let tier = &mut self.tiers[t];
            tier.active_connections = tier.active_connections.saturating_sub(1);
            let endpoint = &mut tier.endpoints[e];
            endpoint.active_connections = endpoint.active_connections.saturating_sub(1);
        }
    }

    pub fn update_load(&mut self, id: &NodeId, load_score: f64) {
        if let Some((t, e)) = self.locate(id) {
            self.tiers[t].endpoints[e].load_score = if load_score.is_finite() {
                load_score.clamp(0.0, 1.0)
            } else {
                1.0
            };
        }
    }

    pub fn bootstrap_info(&self) -> BootstrapInfo {
        BootstrapInfo {
            policy: self.config.bootstrap_selection_policy,
            tiers: self
                .tiers
                .iter()
                .map(|t| TierInfo {
                    level: t.level,
                    healthy: t.healthy,
                    endpoints: t.endpoints.len(),
                    healthy_endpoints: t
                        .endpoints
                        .iter()
                        .filter(|e| e.health != EndpointHealth::Unhealthy)
                        .count(),
                    active_connections: t.active_connections,
                    capacity_limit: t.capacity_limit,
                    consecutive_failures: t.consecutive_failures,
                })
                .collect(),
        }
    }
}

/// Outcome of a successful join.
#[derive(Debug, Clone)]
pub struct JoinReport {
    pub entry: PeerRecord,
    pub tier: Option<BootstrapTierLevel>,
    /// Selection rounds used, starting at 1.
    pub attempts: usize,
    /// Peers known to the routing table after the self-lookup.
    pub routing_size: usize,
}

/// Load score from an endpoint's health record: half from lost
/// availability, half from response time relative to `limit`.
pub fn health_load(availability: f64, response_time: Duration, limit: Duration) -> f64 {
    let lost = 1.0 - availability.clamp(0.0, 1.0);
    let slowness = if limit.is_zero() {
        1.0
    } else {
        (response_time.as_secs_f64() / limit.as_secs_f64()).min(1.0)
    };
    0.5 * lost + 0.5 * slowness
}

/// Drives admission through the tiered entry peers.
pub struct Bootstrapper {
    selector: Mutex<BootstrapSelector>,
    max_attempts: usize,
    backoff_base: Duration,
    backoff_max: Duration,
    retry: RetryPolicy,
}

impl Bootstrapper {
    pub fn new(selector: BootstrapSelector, retry: RetryPolicy) -> Self {
        let max_attempts = selector.config.max_attempts.max(1);
        let backoff_base = selector.config.backoff_base;
        let backoff_max = selector.config.backoff_max;
        Self {
            selector: Mutex::new(selector),
            max_attempts,
            backoff_base,
            backoff_max,
            retry,
        }
    }

    fn with_selector<T>(&self, f: impl FnOnce(&mut BootstrapSelector) -> T) -> Option<T> {
        self.selector.lock().ok().map(|mut s| f(&mut s))
    }

    pub fn bootstrap_info(&self) -> Option<BootstrapInfo> {
        self.with_selector(|s| s.bootstrap_info())
    }

    pub fn update_load(&self, id: &NodeId, load_score: f64) {
        self.with_selector(|s| s.update_load(id, load_score));
    }

    pub fn release(&self, id: &NodeId) {
        self.with_selector(|s| s.release(id));
    }

    pub fn endpoint_ids(&self) -> Vec<NodeId> {
        self.with_selector(|s| {
            s.tiers
                .iter()
                .flat_map(|t| t.endpoints.iter().map(|e| e.record.id))
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn endpoint(&self, id: &NodeId) -> Option<BootstrapEndpoint> {
        self.with_selector(|s| {
            s.tiers
                .iter()
                .flat_map(|t| t.endpoints.iter())
                .find(|e| e.record.id == *id)
                .cloned()
        })
        .flatten()
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let shift = attempt.min(16) as u32;
        self.backoff_base.saturating_mul(1u32 << shift).min(self.backoff_max)
    }

    /// Ping entry peers round by round until one answers, then look up our
    /// own id through it.
    pub async fn join<N: OverlayRpc>(
        &self,
        engine: &DiscoveryEngine<N>,
        worker_count: usize,
        region: Option<&str>,
    ) -> Result<JoinReport> {
        let routing = engine.routing();
        let mut tiers_tried: Vec<BootstrapTierLevel> = Vec::new();

        for attempt in 0..self.max_attempts {
            let candidates = self
                .with_selector(|s| s.select_bootstrap_peers(worker_count, region))
                .unwrap_or_default();
            if candidates.is_empty() {
                warn!(attempt = attempt + 1, "no bootstrap endpoints available");
            }

            for entry in candidates {
                if entry.id == routing.local_id() {
                    continue;
                }
                let level = entry.tier.and_then(BootstrapTierLevel::from_peer_tier);
                if let Some(level) = level
                    && !tiers_tried.contains(&level)
                {
                    tiers_tried.push(level);
                }

                let query_timeout = engine.params().current().query_timeout;
                let network = routing.network().clone();
                let probe = entry.clone();
                let outcome = call_with_retry(entry.id, query_timeout, self.retry, || {
                    let network = network.clone();
                    let probe = probe.clone();
                    async move { network.ping(&probe).await }
                })
                .await;

                match outcome {
                    Ok(()) => {
                        self.with_selector(|s| s.report_success(&entry.id));
                        routing
                            .observe_verified(entry.clone())
                            .await
                            .map_err(|_| OverlayError::Closed("routing actor"))?;
                        let deadline = Instant::now() + engine.params().current().discovery_timeout;
                        let lookup = engine.lookup_self_via(entry.clone(), deadline).await?;
                        let routing_size = routing.snapshot().node_count();
                        info!(
                            entry = %entry.id.short(),
                            tier = ?level.map(|l| l.as_str()),
                            attempts = attempt + 1,
                            responded = lookup.responded,
                            routing_size,
                            "joined overlay"
                        );
                        return Ok(JoinReport {
                            entry,
                            tier: level,
                            attempts: attempt + 1,
                            routing_size,
                        });
                    }
                    Err(err) => {
                        debug!(
                            entry = %entry.id.short(),
                            tier = ?level.map(|l| l.as_str()),
                            error = %err,
                            "bootstrap attempt failed"
                        );
                        self.with_selector(|s| s.report_failure(&entry.id));
                    }
                }
            }

            if attempt + 1 < self.max_attempts {
                sleep(self.backoff(attempt)).await;
            }
        }

        warn!(attempts = self.max_attempts, tiers = ?tiers_tried, "bootstrap exhausted");
        Err(OverlayError::BootstrapExhausted {
            attempts: self.max_attempts,
            tiers_tried,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootstrapEndpointConfig;

    fn endpoint(port: u16, region: Option<&str>, weight: u32) -> BootstrapEndpointConfig {
        BootstrapEndpointConfig {
            id: None,
            address: "10.9.0.1".into(),
            port,
            region: region.map(str::to_string),
            weight,
        }
    }

    fn tier(level: BootstrapTierLevel, endpoints: Vec<BootstrapEndpointConfig>) -> BootstrapTierConfig {
        BootstrapTierConfig {
            level,
            capacity_limit: 1000,
            endpoints,
        }
    }

    fn selector(policy: SelectionPolicy, tiers: Vec<BootstrapTierConfig>) -> BootstrapSelector {
        BootstrapSelector::from_config(BootstrapConfig {
            bootstrap_selection_policy: policy,
            tiers,
            ..BootstrapConfig::default()
        })
        .unwrap()
    }

    fn three_tiers(policy: SelectionPolicy) -> BootstrapSelector {
        selector(
            policy,
            vec![
                tier(BootstrapTierLevel::Local, vec![endpoint(3001, None, 1), endpoint(3002, None, 1)]),
                tier(BootstrapTierLevel::Super, vec![endpoint(1001, None, 1), endpoint(1002, None, 1)]),
                tier(
                    BootstrapTierLevel::Regional,
                    vec![endpoint(2001, Some("eu"), 1), endpoint(2002, Some("us"), 1)],
                ),
            ],
        )
    }

    fn levels(peers: &[PeerRecord]) -> Vec<Option<PeerTier>> {
        peers.iter().map(|p| p.tier).collect()
    }

    #[test]
    fn scale_classification_boundaries() {
        let t = DeploymentScaleThresholds::default();
        assert_eq!(DeploymentScale::classify(15, &t), DeploymentScale::Small);
        assert_eq!(DeploymentScale::classify(16, &t), DeploymentScale::Medium);
        assert_eq!(DeploymentScale::classify(200, &t), DeploymentScale::Large);
        assert_eq!(DeploymentScale::classify(201, &t), DeploymentScale::XLarge);
    }

    #[test]
    fn small_deployments_use_only_super_tier() {
        let mut s = three_tiers(SelectionPolicy::RoundRobin);
        let picked = s.select_bootstrap_peers(10, None);
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|p| p.tier == Some(PeerTier::Super)));
    }

    #[test]
    fn larger_deployments_interleave_tiers() {
        let mut s = three_tiers(SelectionPolicy::RoundRobin);
        let picked = s.select_bootstrap_peers(40, None);
        assert_eq!(
            levels(&picked),
            vec![Some(PeerTier::Super), Some(PeerTier::Regional), Some(PeerTier::Local)]
        );

        let picked = s.select_bootstrap_peers(1000, None);
        assert_eq!(picked.len(), 6);
    }

    #[test]
    fn round_robin_rotates_within_tier() {
        let mut s = selector(
            SelectionPolicy::RoundRobin,
            vec![tier(
                BootstrapTierLevel::Super,
                vec![endpoint(1, None, 1), endpoint(2, None, 1), endpoint(3, None, 1)],
            )],
        );
        let first = s.select_bootstrap_peers(5, None);
        let second = s.select_bootstrap_peers(5, None);
        assert_eq!(first[0].port, 1);
        assert_eq!(second[0].port, 3);
    }

    #[test]
    fn least_loaded_and_priority_ordering() {
        let mut s = selector(
            SelectionPolicy::LeastLoaded,
            vec![tier(
                BootstrapTierLevel::Super,
                vec![endpoint(1, None, 1), endpoint(2, None, 5), endpoint(3, None, 2)],
            )],
        );
        let ids: Vec<NodeId> = s.tiers[0].endpoints.iter().map(|e| e.record.id).collect();
        s.update_load(&ids[0], 0.9);
        s.update_load(&ids[1], 0.5);
        s.update_load(&ids[2], 0.1);
        let picked = s.select_bootstrap_peers(5, None);
        assert_eq!(picked.iter().map(|p| p.port).collect::<Vec<_>>(), vec![3, 2]);

        s.config.bootstrap_selection_policy = SelectionPolicy::Priority;
        let picked = s.select_bootstrap_peers(5, None);
        assert_eq!(picked.iter().map(|p| p.port).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn region_is_preferred() {
        let mut s = three_tiers(SelectionPolicy::RoundRobin);
        let picked = s.select_bootstrap_peers(40, Some("us"));
        let regional = picked.iter().find(|p| p.tier == Some(PeerTier::Regional)).unwrap();
        assert_eq!(regional.port, 2002);
    }

    #[test]
    fn tier_fails_over_after_threshold_and_recovers() {
        let mut s = selector(
            SelectionPolicy::RoundRobin,
            vec![
                tier(BootstrapTierLevel::Super, vec![endpoint(1001, None, 1)]),
                tier(BootstrapTierLevel::Regional, vec![endpoint(2001, None, 1)]),
            ],
        );
        let events = EventSink::new(8);
        let mut rx = events.subscribe();
        s = s.with_events(events);

        for _ in 0..3 {
            let picked = s.select_bootstrap_peers(5, None);
            assert_eq!(levels(&picked), vec![Some(PeerTier::Super)]);
            s.report_failure(&picked[0].id);
        }
        let fourth = s.select_bootstrap_peers(5, None);
        assert_eq!(levels(&fourth), vec![Some(PeerTier::Regional)]);

        match rx.try_recv() {
            Ok(OverlayEvent::BootstrapFailover {
                from,
                to,
                consecutive_failures,
            }) => {
                assert_eq!(from, BootstrapTierLevel::Super);
                assert_eq!(to, Some(BootstrapTierLevel::Regional));
                assert_eq!(consecutive_failures, 3);
            }
            other => panic!("expected failover event, got {other:?}"),
        }

        let super_id = s.tier(BootstrapTierLevel::Super).unwrap().endpoints[0].record.id;
        s.report_success(&super_id);
        assert!(s.tier(BootstrapTierLevel::Super).unwrap().healthy);
        let info = s.bootstrap_info();
        assert_eq!(info.tiers[0].active_connections, 1);
        s.release(&super_id);
        assert_eq!(s.bootstrap_info().tiers[0].active_connections, 0);
    }

    #[test]
    fn capacity_limit_excludes_tier() {
        let mut config = tier(BootstrapTierLevel::Super, vec![endpoint(1, None, 1)]);
        config.capacity_limit = 1;
        let mut s = selector(
            SelectionPolicy::RoundRobin,
            vec![config, tier(BootstrapTierLevel::Regional, vec![endpoint(2, None, 1)])],
        );
        let id = s.tiers[0].endpoints[0].record.id;
        s.report_success(&id);
        let picked = s.select_bootstrap_peers(5, None);
        assert_eq!(levels(&picked), vec![Some(PeerTier::Regional)]);
    }

    #[test]
    fn explicit_ids_are_used() {
        let id = NodeId::random();
        let mut ep = endpoint(1, None, 1);
        ep.id = Some(id.to_hex());
        let mut s = selector(SelectionPolicy::RoundRobin, vec![tier(BootstrapTierLevel::Super, vec![ep])]);
        assert_eq!(s.select_bootstrap_peers(1, None)[0].id, id);
    }

    #[test]
    fn health_load_blends_availability_and_latency() {
        let limit = Duration::from_secs(2);
        assert_eq!(health_load(1.0, Duration::ZERO, limit), 0.0);
        assert_eq!(health_load(0.0, Duration::from_secs(5), limit), 1.0);
        assert_eq!(health_load(0.5, Duration::from_secs(1), limit), 0.5);
        assert_eq!(health_load(1.0, Duration::from_secs(1), Duration::ZERO), 0.5);
    }
}
