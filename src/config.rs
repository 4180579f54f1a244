//! # Overlay Configuration
//!
//! Every tunable of the overlay lives here with its default. The tree
//! deserializes from TOML with `#[serde(default)]` on every table, so a file
//! only needs the keys it overrides:
//!
//! ```toml
//! [parameters]
//! enable_adaptive_parameters = true
//! base_alpha = 3
//!
//! [parameters.network_size_thresholds]
//! small = 15
//! medium = 50
//!
//! [health]
//! health_check_concurrency = 10
//! max_unhealthy_duration = 600.0
//!
//! [[bootstrap.tiers]]
//! level = "super"
//! endpoints = [{ address = "10.0.0.1", port = 7000 }]
//! ```
//!
//! Durations are written as (fractional) seconds.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::bootstrap::{BootstrapTierLevel, SelectionPolicy};
use crate::error::{OverlayError, Result};
use crate::identity::Role;

/// Serde adapter storing a `Duration` as floating-point seconds.
mod duration_secs {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use tokio::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(de::Error::custom(format!("invalid duration: {secs} seconds")));
        }
        Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub parameters: ParameterConfig,
    pub health: HealthConfig,
    pub refresh: RefreshConfig,
    pub bootstrap: BootstrapConfig,
    pub discovery: DiscoveryConfig,
    pub cache: CacheConfig,
    pub routing: RoutingConfig,
    pub events: EventConfig,
}

impl OverlayConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: OverlayConfig =
            toml::from_str(input).map_err(|e| OverlayError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("failed to load config file {}", path.display()))?;
        Ok(config)
    }

    /// Reject settings that would break component invariants.
    pub fn validate(&self) -> Result<()> {
        self.parameters.validate()?;
        self.health.validate()?;
        self.refresh.validate()?;
        self.bootstrap.validate()?;
        self.discovery.validate()?;
        if self.cache.max_size == 0 {
            return Err(OverlayError::invalid_config("cache.max_size must be non-zero"));
        }
        if self.routing.command_buffer == 0 {
            return Err(OverlayError::invalid_config("routing.command_buffer must be non-zero"));
        }
        if self.events.capacity == 0 {
            return Err(OverlayError::invalid_config("events.capacity must be non-zero"));
        }
        Ok(())
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// Inclusive upper bounds of each network size category. Sizes above
/// `large` are xlarge; `xlarge` bounds the range estimates are reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSizeThresholds {
    pub small: usize,
    pub medium: usize,
    pub large: usize,
    pub xlarge: usize,
}

impl Default for NetworkSizeThresholds {
    fn default() -> Self {
        Self {
            small: 15,
            medium: 50,
            large: 200,
            xlarge: 1000,
        }
    }
}

/// Largest accepted per-rank scaling factor.
pub const MAX_SCALING_FACTOR: f64 = 100.0;

/// Per-category growth applied to base values. A factor `f` multiplies the
/// base by `1 + f * rank` where rank is 0 for small through 3 for xlarge;
/// alpha grows additively by `round(f * rank)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingFactors {
    pub alpha: f64,
    pub k: f64,
    pub timeout: f64,
    pub refresh: f64,
}

impl Default for ScalingFactors {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            k: 0.25,
            timeout: 0.5,
            refresh: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterConfig {
    pub enable_adaptive_parameters: bool,
    pub network_size_thresholds: NetworkSizeThresholds,
    pub base_alpha: usize,
    pub base_k: usize,
    #[serde(with = "duration_secs")]
    pub base_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub base_discovery_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub base_refresh_interval: Duration,
    pub scaling_factors: ScalingFactors,
    pub max_alpha: usize,
    pub max_k: usize,
    #[serde(with = "duration_secs")]
    pub max_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub max_discovery_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub max_refresh_interval: Duration,
    /// How long a computed parameter set is reused.
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,
    /// Relative size change that invalidates the cache before the TTL.
    pub size_change_threshold: f64,
    /// Largest alpha increase driven by lookup failures.
    pub max_failure_alpha_boost: usize,
    /// Outcomes needed before the failure rate is trusted.
    pub min_outcome_samples: usize,
}

impl Default for ParameterConfig {
    fn default() -> Self {
        Self {
            enable_adaptive_parameters: true,
            network_size_thresholds: NetworkSizeThresholds::default(),
            base_alpha: 3,
            base_k: 20,
            base_timeout: Duration::from_secs(5),
            base_discovery_timeout: Duration::from_secs(60),
            base_refresh_interval: Duration::from_secs(300),
            scaling_factors: ScalingFactors::default(),
            max_alpha: 10,
            max_k: 50,
            max_timeout: Duration::from_secs(30),
            max_discovery_timeout: Duration::from_secs(180),
            max_refresh_interval: Duration::from_secs(900),
            cache_ttl: Duration::from_secs(300),
            size_change_threshold: 0.2,
            max_failure_alpha_boost: 2,
            min_outcome_samples: 10,
        }
    }
}

impl ParameterConfig {
    fn validate(&self) -> Result<()> {
        let t = &self.network_size_thresholds;
        if !(t.small < t.medium && t.medium < t.large && t.large < t.xlarge) {
            return Err(OverlayError::invalid_config(
                "network_size_thresholds must be strictly increasing",
            ));
        }
        if self.base_alpha == 0 || self.base_k == 0 {
            return Err(OverlayError::invalid_config("base_alpha and base_k must be non-zero"));
        }
        if self.base_alpha > self.max_alpha || self.base_k > self.max_k {
            return Err(OverlayError::invalid_config("base values exceed their maxima"));
        }
        if self.base_timeout.is_zero() || self.base_timeout > self.max_timeout {
            return Err(OverlayError::invalid_config("base_timeout must be in (0, max_timeout]"));
        }
        if self.base_discovery_timeout > self.max_discovery_timeout {
            return Err(OverlayError::invalid_config("base_discovery_timeout exceeds its maximum"));
        }
        if self.base_refresh_interval > self.max_refresh_interval {
            return Err(OverlayError::invalid_config("base_refresh_interval exceeds its maximum"));
        }
        let s = &self.scaling_factors;
        if [s.alpha, s.k, s.timeout, s.refresh]
            .iter()
            .any(|f| !f.is_finite() || !(0.0..=MAX_SCALING_FACTOR).contains(f))
        {
            return Err(OverlayError::invalid_config(format!(
                "scaling factors must be within [0, {MAX_SCALING_FACTOR}]"
            )));
        }
        if !(self.size_change_threshold > 0.0) {
            return Err(OverlayError::invalid_config("size_change_threshold must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckIntervals {
    #[serde(with = "duration_secs")]
    pub fast: Duration,
    #[serde(with = "duration_secs")]
    pub medium: Duration,
    #[serde(with = "duration_secs")]
    pub deep: Duration,
}

impl Default for HealthCheckIntervals {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(30),
            medium: Duration::from_secs(120),
            deep: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckTimeouts {
    #[serde(with = "duration_secs")]
    pub fast: Duration,
    #[serde(with = "duration_secs")]
    pub medium: Duration,
    #[serde(with = "duration_secs")]
    pub deep: Duration,
}

impl Default for HealthCheckTimeouts {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(2),
            medium: Duration::from_secs(4),
            deep: Duration::from_secs(12),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enable_health_check: bool,
    pub health_check_intervals: HealthCheckIntervals,
    pub health_check_timeouts: HealthCheckTimeouts,
    #[serde(with = "duration_secs")]
    pub max_unhealthy_duration: Duration,
    pub health_check_concurrency: usize,
    /// Medium checks revisit peers not fully checked for this long.
    #[serde(with = "duration_secs")]
    pub medium_recheck_after: Duration,
    /// Availability below which a peer gets medium checks.
    pub low_availability: f64,
    /// Availability below which a peer counts as suspicious (deep checks).
    pub suspicious_availability: f64,
    /// Peers holding any of these roles are always deep-checked.
    pub critical_roles: Vec<Role>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enable_health_check: true,
            health_check_intervals: HealthCheckIntervals::default(),
            health_check_timeouts: HealthCheckTimeouts::default(),
            max_unhealthy_duration: Duration::from_secs(600),
            health_check_concurrency: 10,
            medium_recheck_after: Duration::from_secs(600),
            low_availability: 0.7,
            suspicious_availability: 0.5,
            critical_roles: Vec::new(),
        }
    }
}

impl HealthConfig {
    fn validate(&self) -> Result<()> {
        if self.health_check_concurrency == 0 {
            return Err(OverlayError::invalid_config("health_check_concurrency must be non-zero"));
        }
        let i = &self.health_check_intervals;
        if i.fast.is_zero() || i.medium.is_zero() || i.deep.is_zero() {
            return Err(OverlayError::invalid_config("health check intervals must be non-zero"));
        }
        let t = &self.health_check_timeouts;
        if t.fast.is_zero() || t.medium.is_zero() || t.deep.is_zero() {
            return Err(OverlayError::invalid_config("health check timeouts must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.low_availability)
            || !(0.0..=1.0).contains(&self.suspicious_availability)
        {
            return Err(OverlayError::invalid_config("availability thresholds must be within [0, 1]"));
        }
        Ok(())
    }
}

// ============================================================================
// Refresh
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntervalBounds {
    #[serde(with = "duration_secs")]
    pub min: Duration,
    #[serde(with = "duration_secs")]
    pub max: Duration,
}

impl IntervalBounds {
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, value: Duration) -> Duration {
        value.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshIntervalBounds {
    pub active: IntervalBounds,
    pub stable: IntervalBounds,
}

impl Default for RefreshIntervalBounds {
    fn default() -> Self {
        Self {
            active: IntervalBounds::new(Duration::from_secs(15), Duration::from_secs(120)),
            stable: IntervalBounds::new(Duration::from_secs(60), Duration::from_secs(600)),
        }
    }
}

/// Shortest allowed maintenance interval.
pub const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub enable_adaptive_refresh: bool,
    pub refresh_interval_bounds: RefreshIntervalBounds,
    #[serde(with = "duration_secs")]
    pub active_base_interval: Duration,
    #[serde(with = "duration_secs")]
    pub stable_base_interval: Duration,
    #[serde(with = "duration_secs")]
    pub maintenance_interval: Duration,
    /// Per-bucket dynamics score at or above which a bucket is refreshed by
    /// the active strategy.
    pub dynamic_bucket_threshold: f64,
    /// Buckets untouched for this long are picked by selective refreshes.
    #[serde(with = "duration_secs")]
    pub stale_bucket_after: Duration,
    pub critical_event_capacity: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enable_adaptive_refresh: true,
            refresh_interval_bounds: RefreshIntervalBounds::default(),
            active_base_interval: Duration::from_secs(60),
            stable_base_interval: Duration::from_secs(300),
            maintenance_interval: MIN_MAINTENANCE_INTERVAL,
            dynamic_bucket_threshold: 0.3,
            stale_bucket_after: Duration::from_secs(600),
            critical_event_capacity: 64,
        }
    }
}

impl RefreshConfig {
    fn validate(&self) -> Result<()> {
        let b = &self.refresh_interval_bounds;
        if b.active.min.is_zero() || b.active.min > b.active.max {
            return Err(OverlayError::invalid_config("active refresh bounds must satisfy 0 < min <= max"));
        }
        if b.stable.min.is_zero() || b.stable.min > b.stable.max {
            return Err(OverlayError::invalid_config("stable refresh bounds must satisfy 0 < min <= max"));
        }
        if self.maintenance_interval < MIN_MAINTENANCE_INTERVAL {
            return Err(OverlayError::invalid_config("maintenance_interval must be at least 30 minutes"));
        }
        if self.critical_event_capacity == 0 {
            return Err(OverlayError::invalid_config("critical_event_capacity must be non-zero"));
        }
        Ok(())
    }
}

// ============================================================================
// Bootstrap
// ============================================================================

/// Endpoints returned per selection, by deployment scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapTierSizes {
    pub small: usize,
    pub medium: usize,
    pub large: usize,
    pub xlarge: usize,
}

impl Default for BootstrapTierSizes {
    fn default() -> Self {
        Self {
            small: 2,
            medium: 3,
            large: 4,
            xlarge: 6,
        }
    }
}

/// Worker-count bounds (inclusive) of each deployment scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentScaleThresholds {
    pub small: usize,
    pub medium: usize,
    pub large: usize,
}

impl Default for DeploymentScaleThresholds {
    fn default() -> Self {
        Self {
            small: 15,
            medium: 50,
            large: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapEndpointConfig {
    /// Hex node id; derived from `address:port` when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapTierConfig {
    pub level: BootstrapTierLevel,
    #[serde(default = "default_capacity_limit")]
    pub capacity_limit: usize,
    #[serde(default)]
    pub endpoints: Vec<BootstrapEndpointConfig>,
}

fn default_capacity_limit() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub bootstrap_selection_policy: SelectionPolicy,
    pub bootstrap_tier_sizes: BootstrapTierSizes,
    pub scale_thresholds: DeploymentScaleThresholds,
    /// Consecutive failures before an endpoint or tier is marked unhealthy.
    pub failure_threshold: u32,
    /// Selection rounds tried by a join before giving up.
    pub max_attempts: usize,
    #[serde(with = "duration_secs")]
    pub backoff_base: Duration,
    #[serde(with = "duration_secs")]
    pub backoff_max: Duration,
    pub tiers: Vec<BootstrapTierConfig>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            bootstrap_selection_policy: SelectionPolicy::RoundRobin,
            bootstrap_tier_sizes: BootstrapTierSizes::default(),
            scale_thresholds: DeploymentScaleThresholds::default(),
            failure_threshold: 3,
            max_attempts: 6,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
            tiers: Vec::new(),
        }
    }
}

impl BootstrapConfig {
    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(OverlayError::invalid_config("bootstrap failure_threshold must be non-zero"));
        }
        if self.max_attempts == 0 {
            return Err(OverlayError::invalid_config("bootstrap max_attempts must be non-zero"));
        }
        let t = &self.scale_thresholds;
        if !(t.small < t.medium && t.medium < t.large) {
            return Err(OverlayError::invalid_config("scale_thresholds must be strictly increasing"));
        }
        let mut levels: Vec<_> = self.tiers.iter().map(|t| t.level).collect();
        levels.sort();
        levels.dedup();
        if levels.len() != self.tiers.len() {
            return Err(OverlayError::invalid_config("bootstrap tier levels must be unique"));
        }
        for tier in &self.tiers {
            for endpoint in &tier.endpoints {
                if let Some(id) = &endpoint.id
                    && crate::identity::NodeId::from_hex(id).is_err()
                {
                    return Err(OverlayError::invalid_config(format!(
                        "bootstrap endpoint {}:{} has an invalid id",
                        endpoint.address, endpoint.port
                    )));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Discovery, cache, routing, events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Largest shortfall fraction still reported as a partial success.
    pub insufficient_tolerance: f64,
    /// Fast-probe candidates before accepting them.
    pub verify_health: bool,
    #[serde(with = "duration_secs")]
    pub verification_timeout: Duration,
    /// Candidates probed at once during verification.
    pub verification_concurrency: usize,
    pub max_lookup_rounds: usize,
    /// Prefix-targeted lookups issued before falling back to random walks.
    pub max_targeted_lookups: usize,
    /// Consecutive targeted lookups yielding nothing new before moving on.
    pub idle_lookups_before_walk: usize,
    pub random_walk_min_walks: usize,
    pub random_walk_peers_per_walk: usize,
    pub max_retries: usize,
    #[serde(with = "duration_secs")]
    pub retry_backoff: Duration,
    /// Minimum cache availability score for cached candidates.
    pub cache_min_availability: f64,
    /// One wider lookup when discovery falls short on a thin routing table.
    pub wide_lookup: bool,
    pub wide_lookup_max_alpha: usize,
    pub wide_lookup_min_k: usize,
    /// Result size of the wide lookup as a multiple of the shortfall.
    pub wide_lookup_k_factor: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            insufficient_tolerance: 0.5,
            verify_health: true,
            verification_timeout: Duration::from_secs(2),
            verification_concurrency: 16,
            max_lookup_rounds: 20,
            max_targeted_lookups: 16,
            idle_lookups_before_walk: 2,
            random_walk_min_walks: 5,
            random_walk_peers_per_walk: 20,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            cache_min_availability: 0.7,
            wide_lookup: true,
            wide_lookup_max_alpha: 6,
            wide_lookup_min_k: 40,
            wide_lookup_k_factor: 3,
        }
    }
}

impl DiscoveryConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.insufficient_tolerance) {
            return Err(OverlayError::invalid_config("insufficient_tolerance must be within [0, 1]"));
        }
        if self.verification_concurrency == 0 {
            return Err(OverlayError::invalid_config("verification_concurrency must be non-zero"));
        }
        if self.max_lookup_rounds == 0 {
            return Err(OverlayError::invalid_config("max_lookup_rounds must be non-zero"));
        }
        if self.random_walk_peers_per_walk == 0 {
            return Err(OverlayError::invalid_config("random_walk_peers_per_walk must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// Entries older than this are due for re-verification.
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,
    pub max_size: usize,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            refresh_interval: Duration::from_secs(300),
            max_size: 10_000,
            cleanup_interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// A contact verified within this window may displace a stale entry.
    #[serde(with = "duration_secs")]
    pub freshness_window: Duration,
    #[serde(with = "duration_secs")]
    pub challenge_timeout: Duration,
    pub command_buffer: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(60),
            challenge_timeout: Duration::from_secs(2),
            command_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        OverlayConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_overrides_only_given_keys() {
        let config = OverlayConfig::from_toml_str(
            r#"
            [parameters]
            base_alpha = 4

            [parameters.network_size_thresholds]
            small = 10

            [health]
            max_unhealthy_duration = 120.5
            critical_roles = ["collider"]

            [bootstrap]
            bootstrap_selection_policy = "least_loaded"

            [[bootstrap.tiers]]
            level = "super"
            endpoints = [{ address = "10.0.0.1", port = 7000, region = "eu" }]
            "#,
        )
        .unwrap();

        assert_eq!(config.parameters.base_alpha, 4);
        assert_eq!(config.parameters.base_k, 20);
        assert_eq!(config.parameters.network_size_thresholds.small, 10);
        assert_eq!(config.parameters.network_size_thresholds.medium, 50);
        assert_eq!(config.health.max_unhealthy_duration, Duration::from_secs_f64(120.5));
        assert_eq!(config.health.critical_roles, vec![Role::Collider]);
        assert_eq!(config.bootstrap.bootstrap_selection_policy, SelectionPolicy::LeastLoaded);
        assert_eq!(config.bootstrap.tiers.len(), 1);
        assert_eq!(config.bootstrap.tiers[0].endpoints[0].weight, 1);
        assert_eq!(config.bootstrap.tiers[0].capacity_limit, 1000);
    }

    #[test]
    fn rejects_non_increasing_thresholds() {
        let err = OverlayConfig::from_toml_str(
            r#"
            [parameters.network_size_thresholds]
            small = 60
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, OverlayError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_short_maintenance_interval_and_zero_concurrency() {
        let mut config = OverlayConfig::default();
        config.refresh.maintenance_interval = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = OverlayConfig::default();
        config.health.health_check_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_negative_durations() {
        assert!(OverlayConfig::from_toml_str("[routing]\nfreshness_window = -1.0\n").is_err());
    }

    #[test]
    fn rejects_unrepresentable_durations() {
        let err = OverlayConfig::from_toml_str("[health]\nmax_unhealthy_duration = 1e30\n").unwrap_err();
        assert!(matches!(err, OverlayError::InvalidConfig(_)));
    }

    #[test]
    fn integer_seconds_are_accepted() {
        let config = OverlayConfig::from_toml_str("[health]\nmax_unhealthy_duration = 900\n").unwrap();
        assert_eq!(config.health.max_unhealthy_duration, Duration::from_secs(900));
    }

    #[test]
    fn rejects_oversized_scaling_factors() {
        let err = OverlayConfig::from_toml_str("[parameters.scaling_factors]\ntimeout = 1e300\n").unwrap_err();
        assert!(matches!(err, OverlayError::InvalidConfig(_)));
    }
}
