//! # Discovery Engine
//!
//! Two operations:
//!
//! - **Iterative lookup** ([`DiscoveryEngine::iterative_find_node`]): Kademlia
//!   `find_node` rounds of `alpha` parallel queries against the closest
//!   unqueried peers, merging every answer into the routing table, until a
//!   round brings no closer peer or the deadline passes.
//! - **Capability discovery** ([`DiscoveryEngine::discover`]): collect
//!   `required_count` peers matching a [`CapabilityFilter`] from, in order,
//!   the short-term cache, the routing table plus lookups toward random ids
//!   in successive prefix ranges, and finally parallel random walks.
//!
//! When those sources leave discovery short and the routing table holds
//! fewer than twice the required peers, one wide lookup with doubled
//! parallelism and a larger result size is tried before giving up.
//!
//! Every remote call is retried up to `max_retries` times with exponential
//! backoff. Candidates can be fast-probed before acceptance. When the overall
//! deadline passes, in-flight RPCs are abandoned and whatever was found is
//! returned. A shortfall within the configured tolerance is a partial
//! success; beyond it the call fails with
//! [`OverlayError::InsufficientNodes`] carrying the partial result.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::cache::PeerCache;
use crate::config::DiscoveryConfig;
use crate::dht::RoutingNode;
use crate::error::{OverlayError, Result};
use crate::identity::{distance_cmp, random_id_in_bucket, CapabilityFilter, NodeId, PeerRecord, ID_BITS};
use crate::params::ParameterController;
use crate::protocols::{call_with_retry, OverlayRpc, RetryPolicy};

/// Number of coarse id-space regions tracked for random-walk coverage.
const REGION_COUNT: usize = 256;

/// Lookup parallelism and result size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Width {
    alpha: usize,
    k: usize,
}

#[derive(Clone, Debug)]
pub struct LookupResult {
    pub target: NodeId,
    /// Closest responsive peers found, nearest first, at most `k`.
    pub closest: Vec<PeerRecord>,
    pub queried: usize,
    pub responded: usize,
    pub rounds: usize,
    pub deadline_hit: bool,
}

/// What to discover.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub required_count: usize,
    pub filter: CapabilityFilter,
    /// Overall budget; defaults to the current `discovery_timeout`.
    pub timeout: Option<Duration>,
    /// Fast-probe candidates; defaults to the configured setting.
    pub verify_health: Option<bool>,
    pub use_cache: bool,
    pub random_walk: bool,
}

impl DiscoveryRequest {
    pub fn new(required_count: usize, filter: CapabilityFilter) -> Self {
        Self {
            required_count,
            filter,
            timeout: None,
            verify_health: None,
            use_cache: true,
            random_walk: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn verify_health(mut self, verify: bool) -> Self {
        self.verify_health = Some(verify);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn without_random_walk(mut self) -> Self {
        self.random_walk = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialReason {
    DeadlineReached,
    /// Every source was tried before the deadline.
    SourcesExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Complete,
    Partial(PartialReason),
}

/// Where accepted peers came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceBreakdown {
    pub cache: usize,
    pub routing: usize,
    pub lookup: usize,
    pub random_walk: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Cache,
    Routing,
    Lookup,
    RandomWalk,
}

impl SourceBreakdown {
    fn bump(&mut self, source: Source) {
        match source {
            Source::Cache => self.cache += 1,
            Source::Routing => self.routing += 1,
            Source::Lookup => self.lookup += 1,
            Source::RandomWalk => self.random_walk += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub peers: Vec<PeerRecord>,
    pub required: usize,
    pub outcome: DiscoveryOutcome,
    pub sources: SourceBreakdown,
    /// Candidates dropped because the fast probe failed.
    pub rejected_unhealthy: usize,
    pub lookups: usize,
    /// A wide lookup ran after the regular sources fell short.
    pub widened: bool,
    pub elapsed: Duration,
}

impl DiscoveryResult {
    pub fn ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| p.id).collect()
    }

    pub fn found(&self) -> usize {
        self.peers.len()
    }

    pub fn is_complete(&self) -> bool {
        self.outcome == DiscoveryOutcome::Complete
    }

    pub fn is_partial(&self) -> bool {
        matches!(self.outcome, DiscoveryOutcome::Partial(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortfallVerdict {
    Complete,
    Partial,
    Insufficient,
}

/// `found >= required` is complete; a shortfall fraction
/// `(required - found) / required` up to `tolerance` is partial; anything
/// larger is insufficient.
pub fn classify_shortfall(found: usize, required: usize, tolerance: f64) -> ShortfallVerdict {
    if found >= required {
        return ShortfallVerdict::Complete;
    }
    let shortfall = (required - found) as f64 / required as f64;
    if shortfall <= tolerance {
        ShortfallVerdict::Partial
    } else {
        ShortfallVerdict::Insufficient
    }
}

struct Collector {
    local_id: NodeId,
    required: usize,
    filter: CapabilityFilter,
    verify: bool,
    seen: HashSet<NodeId>,
    accepted: Vec<PeerRecord>,
    sources: SourceBreakdown,
    rejected_unhealthy: usize,
}

impl Collector {
    fn satisfied(&self) -> bool {
        self.accepted.len() >= self.required
    }

    fn needed(&self) -> usize {
        self.required.saturating_sub(self.accepted.len())
    }
}

pub struct DiscoveryEngine<N: OverlayRpc> {
    routing: RoutingNode<N>,
    params: Arc<ParameterController>,
    cache: Arc<PeerCache>,
    config: DiscoveryConfig,
    explored_regions: Arc<Mutex<HashSet<u8>>>,
    verification_slots: Arc<Semaphore>,
}

impl<N: OverlayRpc> Clone for DiscoveryEngine<N> {
    fn clone(&self) -> Self {
        Self {
            routing: self.routing.clone(),
            params: self.params.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
            explored_regions: self.explored_regions.clone(),
            verification_slots: self.verification_slots.clone(),
        }
    }
}

impl<N: OverlayRpc> DiscoveryEngine<N> {
    pub fn new(
        routing: RoutingNode<N>,
        params: Arc<ParameterController>,
        cache: Arc<PeerCache>,
        config: DiscoveryConfig,
    ) -> Self {
        let slots = config.verification_concurrency.max(1);
        Self {
            routing,
            params,
            cache,
            config,
            explored_regions: Arc::new(Mutex::new(HashSet::new())),
            verification_slots: Arc::new(Semaphore::new(slots)),
        }
    }

    pub fn routing(&self) -> &RoutingNode<N> {
        &self.routing
    }

    pub fn params(&self) -> &Arc<ParameterController> {
        &self.params
    }

    pub fn cache(&self) -> &Arc<PeerCache> {
        &self.cache
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_retries, self.config.retry_backoff)
    }

    fn current_width(&self) -> Width {
        let params = self.params.current();
        Width {
            alpha: params.alpha,
            k: params.k,
        }
    }

    /// Doubled parallelism capped at `wide_lookup_max_alpha`, and room for
    /// `wide_lookup_k_factor` times the shortfall.
    fn wide_width(&self, needed: usize) -> Width {
        let current = self.current_width();
        Width {
            alpha: (current.alpha * 2).min(self.config.wide_lookup_max_alpha).max(current.alpha),
            k: needed
                .saturating_mul(self.config.wide_lookup_k_factor)
                .max(self.config.wide_lookup_min_k)
                .max(current.k),
        }
    }

    /// Find the peers closest to `target`, bounded by the current
    /// `discovery_timeout`.
    pub async fn iterative_find_node(&self, target: NodeId) -> Result<LookupResult> {
        let deadline = Instant::now() + self.params.current().discovery_timeout;
        self.lookup(target, Vec::new(), deadline).await
    }

    /// Look up the local id starting from `seed`, used to join through an
    /// entry peer before the routing table has contents.
    pub async fn lookup_self_via(&self, seed: PeerRecord, deadline: Instant) -> Result<LookupResult> {
        self.lookup(self.routing.local_id(), vec![seed], deadline).await
    }

    async fn lookup(&self, target: NodeId, seeds: Vec<PeerRecord>, deadline: Instant) -> Result<LookupResult> {
        self.lookup_with(target, seeds, deadline, self.current_width()).await
    }

    async fn lookup_with(
        &self,
        target: NodeId,
        seeds: Vec<PeerRecord>,
        deadline: Instant,
        width: Width,
    ) -> Result<LookupResult> {
        if !self.routing.is_running() {
            return Err(OverlayError::Closed("routing actor"));
        }
        let k = width.k.max(1);
        let alpha = width.alpha.max(1);
        let per_query = self.params.current().query_timeout;
        let retry = self.retry_policy();
        let local_id = self.routing.local_id();

        let mut shortlist = self.routing.snapshot().closest_to(&target, k);
        for seed in seeds {
            if seed.id != local_id && !shortlist.iter().any(|p| p.id == seed.id) {
                shortlist.push(seed);
            }
        }
        sort_by_distance(&mut shortlist, &target);

        let mut seen: HashSet<NodeId> = shortlist.iter().map(|p| p.id).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut failed: HashSet<NodeId> = HashSet::new();
        let mut responded = 0;
        let mut rounds = 0;
        let mut deadline_hit = false;
        let mut best = shortlist.first().map(|p| p.id.xor_distance(&target));
        // Set once a round brings nothing closer: query the rest of the k
        // closest once, then stop.
        let mut final_sweep = false;

        loop {
            if rounds >= self.config.max_lookup_rounds {
                warn!(
                    target = %target.short(),
                    rounds,
                    "iterative lookup exceeded max rounds"
                );
                break;
            }
            if Instant::now() >= deadline {
                deadline_hit = true;
                break;
            }

            let candidates: Vec<PeerRecord> = shortlist
                .iter()
                .filter(|p| !queried.contains(&p.id) && p.id != local_id)
                .take(if final_sweep { k } else { alpha })
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            rounds += 1;
            for c in &candidates {
                queried.insert(c.id);
            }

            let mut join_set = JoinSet::new();
            for peer in candidates {
                let net = self.routing.network().clone();
                join_set.spawn(async move {
                    let started = Instant::now();
                    let result = call_with_retry(peer.id, per_query, retry, || net.find_node(&peer, target)).await;
                    (peer, started.elapsed(), result)
                });
            }

            // Merge answers in arrival order; the sort below settles ties by distance.
            loop {
                let next = timeout_at(deadline, join_set.join_next()).await;
                let joined = match next {
                    Ok(Some(joined)) => joined,
                    Ok(None) => break,
                    Err(_) => {
                        join_set.abort_all();
                        deadline_hit = true;
                        break;
                    }
                };
                let Ok((peer, elapsed, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(nodes) => {
                        responded += 1;
                        self.params.record_outcome(true);
                        self.cache.update_verification(&peer.id, true);
                        if let Err(err) = self.routing.observe_verified(peer.clone()).await {
                            debug!(peer = %peer.id.short(), error = %err, "responder not recorded");
                        }
                        trace!(
                            peer = %peer.id.short(),
                            returned = nodes.len(),
                            elapsed_ms = elapsed.as_millis() as u64,
                            "find_node answered"
                        );
                        for n in nodes {
                            if n.id == local_id || failed.contains(&n.id) {
                                continue;
                            }
                            if let Err(err) = self.routing.observe_learned(n.clone()).await {
                                debug!(peer = %n.id.short(), error = %err, "learned contact not recorded");
                            }
                            if seen.insert(n.id) {
                                shortlist.push(n.learned());
                            }
                        }
                    }
                    Err(err) => {
                        self.params.record_outcome(false);
                        self.cache.mark_unavailable(&peer.id);
                        failed.insert(peer.id);
                        trace!(peer = %peer.id.short(), error = %err, "find_node failed");
                    }
                }
            }

            shortlist.retain(|p| !failed.contains(&p.id));
            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(k);

            let round_best = shortlist.first().map(|p| p.id.xor_distance(&target));
            let any_closer = match (&round_best, &best) {
                (Some(new), Some(old)) => distance_cmp(new, old) == std::cmp::Ordering::Less,
                (Some(_), None) => true,
                _ => false,
            };
            if any_closer {
                best = round_best;
            }
            if deadline_hit || final_sweep {
                break;
            }
            final_sweep = !any_closer;
        }

        if deadline_hit {
            debug!(
                target = %target.short(),
                found = shortlist.len(),
                rounds,
                "iterative lookup deadline reached, returning current results"
            );
        }

        Ok(LookupResult {
            target,
            closest: shortlist,
            queried: queried.len(),
            responded,
            rounds,
            deadline_hit,
        })
    }

    /// Collect `request.required_count` peers matching the request's filter.
    pub async fn discover(&self, request: DiscoveryRequest) -> Result<DiscoveryResult> {
        let started = Instant::now();
        let params = self.params.current();
        let deadline = started + request.timeout.unwrap_or(params.discovery_timeout);
        let local_id = self.routing.local_id();

        let mut state = Collector {
            local_id,
            required: request.required_count,
            filter: request.filter,
            verify: request.verify_health.unwrap_or(self.config.verify_health),
            seen: HashSet::from([local_id]),
            accepted: Vec::new(),
            sources: SourceBreakdown::default(),
            rejected_unhealthy: 0,
        };
        let mut lookups = 0;

        if request.use_cache && !state.satisfied() {
            let cached = self.cache.by_capabilities(
                &state.filter,
                state.needed(),
                self.config.cache_min_availability,
            );
            self.consider(&mut state, cached, Source::Cache, deadline).await;
        }

        if !state.satisfied() && Instant::now() < deadline {
            let known: Vec<PeerRecord> = self.routing.snapshot().peers().cloned().collect();
            self.consider(&mut state, known, Source::Routing, deadline).await;
        }

        let mut idle = 0;
        let mut prefix = 0usize;
        while !state.satisfied()
            && Instant::now() < deadline
            && lookups < self.config.max_targeted_lookups
            && idle < self.config.idle_lookups_before_walk.max(1)
        {
            let depth = self
                .routing
                .snapshot()
                .active_buckets()
                .into_iter()
                .max()
                .map_or(0, |deepest| (deepest + 1).min(ID_BITS - 1));
            let bucket = prefix % (depth + 1);
            prefix += 1;

            let result = self
                .lookup(random_id_in_bucket(&local_id, bucket), Vec::new(), deadline)
                .await?;
            lookups += 1;

            let mut candidates = result.closest;
            candidates.extend(self.routing.snapshot().peers().cloned());
            let new = self.consider(&mut state, candidates, Source::Lookup, deadline).await;
            idle = if new == 0 { idle + 1 } else { 0 };
            if result.deadline_hit {
                break;
            }
        }

        if request.random_walk && !state.satisfied() && Instant::now() < deadline {
            lookups += self.random_walk(&mut state, deadline).await;
        }

        let mut widened = false;
        if self.config.wide_lookup
            && !state.satisfied()
            && Instant::now() < deadline
            && self.routing.snapshot().node_count() < state.required.saturating_mul(2)
        {
            let width = self.wide_width(state.needed());
            info!(
                needed = state.needed(),
                alpha = width.alpha,
                k = width.k,
                "discovery short on a thin table, retrying with a wide lookup"
            );
            match self.lookup_with(NodeId::random(), Vec::new(), deadline, width).await {
                Ok(result) => {
                    lookups += 1;
                    widened = true;
                    let mut candidates = result.closest;
                    candidates.extend(self.routing.snapshot().peers().cloned());
                    let new = self.consider(&mut state, candidates, Source::Lookup, deadline).await;
                    debug!(new_candidates = new, found = state.accepted.len(), "wide lookup finished");
                }
                Err(err) => warn!(error = %err, "wide lookup failed"),
            }
        }

        self.finish(state, lookups, widened, started, deadline)
    }

    /// Parallel lookups toward uniformly random targets. Returns the number
    /// of walks issued.
    async fn random_walk(&self, state: &mut Collector, deadline: Instant) -> usize {
        let per_walk = self.config.random_walk_peers_per_walk.max(1);
        let walks = self
            .config
            .random_walk_min_walks
            .max(state.needed().div_ceil(per_walk))
            .max(1);

        let mut join_set = JoinSet::new();
        for _ in 0..walks {
            let target = NodeId::random();
            if let Ok(mut regions) = self.explored_regions.lock() {
                regions.insert(target.region());
            }
            let engine = self.clone();
            join_set.spawn(async move { engine.lookup(target, Vec::new(), deadline).await });
        }

        let mut candidates = Vec::new();
        loop {
            match timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok(Ok(result)))) => candidates.extend(result.closest),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
        drop(join_set);

        candidates.extend(self.routing.snapshot().peers().cloned());
        let new = self.consider(state, candidates, Source::RandomWalk, deadline).await;
        debug!(walks, new_candidates = new, coverage = self.coverage(), "random walk finished");
        walks
    }

    /// Fraction of id-space regions visited by random walks so far.
    pub fn coverage(&self) -> f64 {
        self.explored_regions
            .lock()
            .map(|r| r.len() as f64 / REGION_COUNT as f64)
            .unwrap_or(0.0)
    }

    /// Screen `candidates` and accept matching ones. Returns how many had not
    /// been seen before.
    async fn consider(
        &self,
        state: &mut Collector,
        candidates: Vec<PeerRecord>,
        source: Source,
        deadline: Instant,
    ) -> usize {
        let fresh: Vec<PeerRecord> = candidates
            .into_iter()
            .filter(|p| p.id != state.local_id && state.seen.insert(p.id))
            .collect();
        let newly_seen = fresh.len();
        let eligible: Vec<PeerRecord> = fresh.into_iter().filter(|p| state.filter.matches(p)).collect();
        if eligible.is_empty() {
            return newly_seen;
        }

        let accepted = if state.verify {
            let (healthy, rejected) = self.verify_batch(eligible, deadline).await;
            state.rejected_unhealthy += rejected;
            healthy
        } else {
            eligible
        };

        for peer in accepted {
            self.cache.add(peer.clone());
            if !state.satisfied() {
                state.accepted.push(peer);
                state.sources.bump(source);
            }
        }
        newly_seen
    }

    /// Fast-probe peers concurrently. Unanswered probes at the deadline are
    /// abandoned and count as neither healthy nor rejected.
    async fn verify_batch(&self, peers: Vec<PeerRecord>, deadline: Instant) -> (Vec<PeerRecord>, usize) {
        let limit = self.config.verification_timeout;
        let retry = self.retry_policy();
        let mut join_set = JoinSet::new();
        for peer in peers {
            let net = self.routing.network().clone();
            let slots = self.verification_slots.clone();
            join_set.spawn(async move {
                let Ok(_permit) = slots.acquire_owned().await else {
                    return (peer, false);
                };
                let ok = call_with_retry(peer.id, limit, retry, || net.ping(&peer)).await.is_ok();
                (peer, ok)
            });
        }

        let mut healthy = Vec::new();
        let mut rejected = 0;
        loop {
            match timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok((peer, true)))) => {
                    self.cache.update_verification(&peer.id, true);
                    healthy.push(peer);
                }
                Ok(Some(Ok((peer, false)))) => {
                    rejected += 1;
                    self.cache.mark_unavailable(&peer.id);
                }
                Ok(Some(Err(_))) => continue,
                Ok(None) | Err(_) => break,
            }
        }
        (healthy, rejected)
    }

    /// Re-probe cached peers whose last verification is older than the
    /// cache refresh interval. Responders are re-stamped, the rest evicted.
    /// Returns `(verified, evicted)`.
    pub async fn reverify_cache(&self) -> (usize, usize) {
        let stale = self.cache.needing_refresh();
        if stale.is_empty() {
            return (0, 0);
        }
        let deadline = Instant::now() + self.params.current().discovery_timeout;
        let checked = stale.len();
        let (healthy, _) = self.verify_batch(stale.clone(), deadline).await;
        let mut evicted = 0;
        for peer in &stale {
            if !healthy.iter().any(|h| h.id == peer.id) && self.cache.remove(&peer.id) {
                evicted += 1;
            }
        }
        debug!(checked, verified = healthy.len(), evicted, "cache re-verification");
        (healthy.len(), evicted)
    }

    fn finish(
        &self,
        state: Collector,
        lookups: usize,
        widened: bool,
        started: Instant,
        deadline: Instant,
    ) -> Result<DiscoveryResult> {
        let found = state.accepted.len();
        let required = state.required;
        let outcome = if found >= required {
            DiscoveryOutcome::Complete
        } else if Instant::now() >= deadline {
            DiscoveryOutcome::Partial(PartialReason::DeadlineReached)
        } else {
            DiscoveryOutcome::Partial(PartialReason::SourcesExhausted)
        };
        let mut peers = state.accepted;
        peers.truncate(required);

        let result = DiscoveryResult {
            peers,
            required,
            outcome,
            sources: state.sources,
            rejected_unhealthy: state.rejected_unhealthy,
            lookups,
            widened,
            elapsed: started.elapsed(),
        };

        match classify_shortfall(found, required, self.config.insufficient_tolerance) {
            ShortfallVerdict::Complete => {
                info!(
                    required,
                    found,
                    lookups,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "discovery complete"
                );
                Ok(result)
            }
            ShortfallVerdict::Partial => {
                info!(
                    required,
                    found,
                    lookups,
                    reason = ?result.outcome,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "discovery returned partial result"
                );
                Ok(result)
            }
            ShortfallVerdict::Insufficient => {
                warn!(required, found, lookups, "discovery found too few peers");
                Err(OverlayError::InsufficientNodes {
                    found,
                    required,
                    partial: Box::new(result),
                })
            }
        }
    }
}

fn sort_by_distance(peers: &mut [PeerRecord], target: &NodeId) {
    peers.sort_by(|a, b| {
        let da = a.id.xor_distance(target);
        let db = b.id.xor_distance(target);
        distance_cmp(&da, &db)
    });
}
