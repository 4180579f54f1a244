//! # Adaptive Parameters
//!
//! Derives the lookup fan-out (`alpha`), bucket capacity (`k`) and the
//! timeouts every component uses from the estimated network size.
//!
//! | Category | default size | alpha | k  | query timeout |
//! |----------|--------------|-------|----|---------------|
//! | small    | <= 15        | 3     | 20 | 5 s           |
//! | medium   | <= 50        | 4     | 25 | 7.5 s         |
//! | large    | <= 200       | 5     | 30 | 10 s          |
//! | xlarge   | > 200        | 6     | 35 | 12.5 s        |
//!
//! Each value is a base scaled by the category rank and clamped to its
//! configured maximum, so every field is non-decreasing in category order.
//! A sliding window of lookup outcomes can raise alpha further when queries
//! keep failing.
//!
//! The controller caches the last [`ParameterSet`] for a TTL and recomputes
//! early when the network size moves by more than a configured fraction.
//! It is shared behind an `Arc`; the cache lock is never held across an
//! `.await`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::{NetworkSizeThresholds, ParameterConfig};
use crate::error::OverlayError;
use crate::events::{EventSink, OverlayEvent};

/// Window size for lookup outcome statistics.
const OUTCOME_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkSizeCategory {
    Small,
    Medium,
    Large,
    XLarge,
}

impl NetworkSizeCategory {
    pub const ALL: [NetworkSizeCategory; 4] = [
        NetworkSizeCategory::Small,
        NetworkSizeCategory::Medium,
        NetworkSizeCategory::Large,
        NetworkSizeCategory::XLarge,
    ];

    /// `size <= small` is small, `<= medium` medium, `<= large` large,
    /// anything above is xlarge.
    pub fn classify(size: usize, thresholds: &NetworkSizeThresholds) -> Self {
        if size <= thresholds.small {
            NetworkSizeCategory::Small
        } else if size <= thresholds.medium {
            NetworkSizeCategory::Medium
        } else if size <= thresholds.large {
            NetworkSizeCategory::Large
        } else {
            NetworkSizeCategory::XLarge
        }
    }

    pub fn rank(self) -> u32 {
        match self {
            NetworkSizeCategory::Small => 0,
            NetworkSizeCategory::Medium => 1,
            NetworkSizeCategory::Large => 2,
            NetworkSizeCategory::XLarge => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkSizeCategory::Small => "small",
            NetworkSizeCategory::Medium => "medium",
            NetworkSizeCategory::Large => "large",
            NetworkSizeCategory::XLarge => "xlarge",
        }
    }
}

/// Immutable parameter snapshot. Replaced as a whole, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    pub alpha: usize,
    pub k: usize,
    pub query_timeout: Duration,
    pub discovery_timeout: Duration,
    pub refresh_interval: Duration,
    pub network_size_category: NetworkSizeCategory,
    /// Size estimate the set was computed for.
    pub network_size: usize,
    /// False when adaptivity is disabled and fixed values are in use.
    pub adaptive: bool,
}

struct CachedParameters {
    params: Arc<ParameterSet>,
    computed_at: Instant,
}

pub struct ParameterController {
    config: ParameterConfig,
    cached: RwLock<Option<CachedParameters>>,
    outcomes: Mutex<VecDeque<bool>>,
    events: Option<EventSink>,
}

impl ParameterController {
    pub fn new(config: ParameterConfig) -> Self {
        Self {
            config,
            cached: RwLock::new(None),
            outcomes: Mutex::new(VecDeque::with_capacity(OUTCOME_WINDOW)),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &ParameterConfig {
        &self.config
    }

    /// Category values for `category`, before performance adjustments.
    pub fn parameters_for_category(&self, category: NetworkSizeCategory) -> ParameterSet {
        let c = &self.config;
        let s = &c.scaling_factors;
        let rank = f64::from(category.rank());

        let alpha = (c.base_alpha as f64 + (s.alpha * rank).round()) as usize;
        let k = (c.base_k as f64 * (1.0 + s.k * rank)).round() as usize;
        let timeout_factor = 1.0 + s.timeout * rank;
        let refresh_factor = 1.0 + s.refresh * rank;
        let scaled = |base: Duration, factor: f64, max: Duration| bounded(saturating_scale(base, factor, max), base, max);

        ParameterSet {
            alpha: alpha.min(c.max_alpha).max(c.base_alpha.min(c.max_alpha)),
            k: k.min(c.max_k).max(c.base_k.min(c.max_k)),
            query_timeout: scaled(c.base_timeout, timeout_factor, c.max_timeout),
            discovery_timeout: scaled(c.base_discovery_timeout, timeout_factor, c.max_discovery_timeout),
            refresh_interval: scaled(c.base_refresh_interval, refresh_factor, c.max_refresh_interval),
            network_size_category: category,
            network_size: 0,
            adaptive: c.enable_adaptive_parameters,
        }
    }

    /// Pure computation for a given size, including the failure-rate boost.
    pub fn compute(&self, network_size: usize) -> ParameterSet {
        if !self.config.enable_adaptive_parameters {
            let mut fixed = self.parameters_for_category(NetworkSizeCategory::Small);
            fixed.network_size = network_size;
            return fixed;
        }

        let category = NetworkSizeCategory::classify(network_size, &self.config.network_size_thresholds);
        let mut params = self.parameters_for_category(category);
        params.network_size = network_size;

        let boost = self.failure_alpha_boost();
        if boost > 0 {
            params.alpha = (params.alpha + boost).min(self.config.max_alpha);
        }
        params
    }

    fn failure_alpha_boost(&self) -> usize {
        let Ok(outcomes) = self.outcomes.lock() else {
            return 0;
        };
        if outcomes.len() < self.config.min_outcome_samples.max(1) {
            return 0;
        }
        let failures = outcomes.iter().filter(|ok| !**ok).count();
        let failure_rate = failures as f64 / outcomes.len() as f64;
        (failure_rate * self.config.max_failure_alpha_boost as f64).round() as usize
    }

    /// Current parameters, or the smallest category's when nothing has been
    /// computed yet.
    pub fn current(&self) -> Arc<ParameterSet> {
        if let Ok(guard) = self.cached.read()
            && let Some(cached) = guard.as_ref()
        {
            return cached.params.clone();
        }
        Arc::new(self.compute(0))
    }

    /// Refresh from a network size estimate. A failed estimate falls back to
    /// the smallest category. The cached set is reused while it is younger
    /// than the TTL and the size moved by no more than the configured
    /// fraction.
    pub fn refresh(&self, estimate: Result<usize, OverlayError>) -> Arc<ParameterSet> {
        let network_size = match estimate {
            Ok(size) => size,
            Err(err) => {
                debug!(error = %err, "network size estimation failed, using smallest category");
                0
            }
        };

        if let Ok(guard) = self.cached.read()
            && let Some(cached) = guard.as_ref()
            && cached.computed_at.elapsed() < self.config.cache_ttl
            && !self.size_changed(cached.params.network_size, network_size)
        {
            trace!(network_size, "parameter cache hit");
            return cached.params.clone();
        }

        self.recompute(network_size)
    }

    /// Recompute unconditionally and replace the cached set.
    pub fn recompute(&self, network_size: usize) -> Arc<ParameterSet> {
        let params = Arc::new(self.compute(network_size));
        let before = match self.cached.write() {
            Ok(mut guard) => guard
                .replace(CachedParameters {
                    params: params.clone(),
                    computed_at: Instant::now(),
                })
                .map(|old| old.params),
            Err(_) => None,
        };

        let changed = before.as_ref().is_none_or(|b| !same_values(b, &params));
        if changed && let Some(events) = &self.events {
            events.emit(OverlayEvent::ParametersRecalculated {
                network_size,
                before: before.map(|b| (*b).clone()),
                after: (*params).clone(),
            });
        }
        params
    }

    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.cached.write() {
            *guard = None;
        }
    }

    /// Record the outcome of one remote query.
    pub fn record_outcome(&self, success: bool) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push_back(success);
            if outcomes.len() > OUTCOME_WINDOW {
                outcomes.pop_front();
            }
        }
    }

    pub fn failure_rate(&self) -> f64 {
        match self.outcomes.lock() {
            Ok(outcomes) if !outcomes.is_empty() => {
                outcomes.iter().filter(|ok| !**ok).count() as f64 / outcomes.len() as f64
            }
            _ => 0.0,
        }
    }

    fn size_changed(&self, old: usize, new: usize) -> bool {
        let base = old.max(1) as f64;
        (new as f64 - old as f64).abs() / base > self.config.size_change_threshold
    }
}

/// `base * factor`, or `ceiling` when the product is not a representable
/// duration. Non-positive and NaN factors yield zero.
pub(crate) fn saturating_scale(base: Duration, factor: f64, ceiling: Duration) -> Duration {
    if factor.is_nan() || factor <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(ceiling)
}

/// Clamp without panicking on an inverted range; the maximum wins.
fn bounded(value: Duration, min: Duration, max: Duration) -> Duration {
    value.max(min).min(max)
}

fn same_values(a: &ParameterSet, b: &ParameterSet) -> bool {
    a.alpha == b.alpha
        && a.k == b.k
        && a.query_timeout == b.query_timeout
        && a.discovery_timeout == b.discovery_timeout
        && a.refresh_interval == b.refresh_interval
        && a.network_size_category == b.network_size_category
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ParameterController {
        ParameterController::new(ParameterConfig::default())
    }

    #[test]
    fn threshold_boundaries_are_inclusive() {
        let t = NetworkSizeThresholds::default();
        assert_eq!(NetworkSizeCategory::classify(0, &t), NetworkSizeCategory::Small);
        assert_eq!(NetworkSizeCategory::classify(t.small, &t), NetworkSizeCategory::Small);
        assert_eq!(NetworkSizeCategory::classify(t.small + 1, &t), NetworkSizeCategory::Medium);
        assert_eq!(NetworkSizeCategory::classify(t.medium, &t), NetworkSizeCategory::Medium);
        assert_eq!(NetworkSizeCategory::classify(t.large, &t), NetworkSizeCategory::Large);
        assert_eq!(NetworkSizeCategory::classify(t.large + 1, &t), NetworkSizeCategory::XLarge);
        assert_eq!(NetworkSizeCategory::classify(1_000_000, &t), NetworkSizeCategory::XLarge);
    }

    #[test]
    fn category_values_are_monotone_and_bounded() {
        let c = controller();
        let cfg = ParameterConfig::default();
        let sets: Vec<_> = NetworkSizeCategory::ALL
            .iter()
            .map(|cat| c.parameters_for_category(*cat))
            .collect();
        for pair in sets.windows(2) {
            assert!(pair[0].alpha <= pair[1].alpha);
            assert!(pair[0].k <= pair[1].k);
            assert!(pair[0].query_timeout <= pair[1].query_timeout);
            assert!(pair[0].discovery_timeout <= pair[1].discovery_timeout);
            assert!(pair[0].refresh_interval <= pair[1].refresh_interval);
        }
        for set in &sets {
            assert!((cfg.base_alpha..=cfg.max_alpha).contains(&set.alpha));
            assert!((cfg.base_k..=cfg.max_k).contains(&set.k));
            assert!(set.query_timeout >= cfg.base_timeout && set.query_timeout <= cfg.max_timeout);
        }
    }

    #[test]
    fn aggressive_scaling_is_clamped_to_maxima() {
        let mut cfg = ParameterConfig::default();
        cfg.scaling_factors.alpha = 10.0;
        cfg.scaling_factors.k = 5.0;
        cfg.scaling_factors.timeout = 10.0;
        let c = ParameterController::new(cfg.clone());
        let xl = c.parameters_for_category(NetworkSizeCategory::XLarge);
        assert_eq!(xl.alpha, cfg.max_alpha);
        assert_eq!(xl.k, cfg.max_k);
        assert_eq!(xl.query_timeout, cfg.max_timeout);
    }

    #[test]
    fn unvalidated_huge_factors_saturate_at_maxima() {
        let mut cfg = ParameterConfig::default();
        cfg.scaling_factors.timeout = 1e300;
        cfg.scaling_factors.refresh = f64::MAX;
        let c = ParameterController::new(cfg.clone());
        let xl = c.parameters_for_category(NetworkSizeCategory::XLarge);
        assert_eq!(xl.query_timeout, cfg.max_timeout);
        assert_eq!(xl.discovery_timeout, cfg.max_discovery_timeout);
        assert_eq!(xl.refresh_interval, cfg.max_refresh_interval);
    }

    #[test]
    fn saturating_scale_edges() {
        let base = Duration::from_secs(10);
        let ceiling = Duration::from_secs(60);
        assert_eq!(saturating_scale(base, 1.5, ceiling), Duration::from_secs(15));
        assert_eq!(saturating_scale(base, f64::INFINITY, ceiling), ceiling);
        assert_eq!(saturating_scale(base, -2.0, ceiling), Duration::ZERO);
        assert_eq!(saturating_scale(base, f64::NAN, ceiling), Duration::ZERO);
    }

    #[test]
    fn growing_network_scales_parameters() {
        let c = controller();
        let small = c.recompute(10);
        assert_eq!(small.alpha, 3);
        assert_eq!(small.k, 20);
        assert_eq!(small.query_timeout, Duration::from_secs(5));

        let large = c.refresh(Ok(600));
        assert_eq!(large.network_size_category, NetworkSizeCategory::XLarge);
        assert!(large.alpha >= 6);
        assert!(large.k >= 30);
        assert!(large.query_timeout >= Duration::from_secs(12));
    }

    #[test]
    fn disabled_adaptivity_uses_smallest_category() {
        let cfg = ParameterConfig {
            enable_adaptive_parameters: false,
            ..ParameterConfig::default()
        };
        let c = ParameterController::new(cfg);
        let p = c.compute(5000);
        assert_eq!(p.network_size_category, NetworkSizeCategory::Small);
        assert_eq!(p.alpha, 3);
        assert_eq!(p.k, 20);
        assert!(!p.adaptive);
    }

    #[test]
    fn estimation_failure_falls_back_to_small() {
        let c = controller();
        let p = c.refresh(Err(OverlayError::ParameterEstimation("routing closed".into())));
        assert_eq!(p.network_size_category, NetworkSizeCategory::Small);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_is_reused_within_ttl_for_small_changes() {
        let c = controller();
        let first = c.refresh(Ok(100));
        let second = c.refresh(Ok(110));
        assert!(Arc::ptr_eq(&first, &second));

        let jumped = c.refresh(Ok(150));
        assert!(!Arc::ptr_eq(&first, &jumped));
        assert_eq!(jumped.network_size, 150);

        tokio::time::advance(Duration::from_secs(301)).await;
        let expired = c.refresh(Ok(150));
        assert!(!Arc::ptr_eq(&jumped, &expired));
    }

    #[test]
    fn failures_raise_alpha_within_bounds() {
        let c = controller();
        for _ in 0..20 {
            c.record_outcome(false);
        }
        let p = c.compute(10);
        assert_eq!(p.alpha, 5);
        assert!((c.failure_rate() - 1.0).abs() < f64::EPSILON);

        for _ in 0..100 {
            c.record_outcome(true);
        }
        assert_eq!(c.compute(10).alpha, 3);
    }

    #[tokio::test]
    async fn recalculation_emits_event_with_before_and_after() {
        let sink = EventSink::new(8);
        let mut rx = sink.subscribe();
        let c = ParameterController::new(ParameterConfig::default()).with_events(sink);
        c.recompute(10);
        c.recompute(600);
        let _first = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            OverlayEvent::ParametersRecalculated { before, after, network_size } => {
                assert_eq!(network_size, 600);
                assert_eq!(before.map(|b| b.k), Some(20));
                assert_eq!(after.k, 35);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
