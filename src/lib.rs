//! # Kadence - Self-Tuning Kademlia Overlay
//!
//! Kadence keeps a Kademlia routing overlay healthy without hand tuning:
//!
//! - **Adaptive parameters**: lookup parallelism (alpha), bucket size (k),
//!   timeouts and refresh intervals follow the estimated network size
//! - **Tiered bootstrap**: super, regional and local entry peers with
//!   selection policies and automatic failover
//! - **Discovery**: cache, routing table, targeted lookups and random walks
//!   until a capability-filtered peer count is met or the deadline expires
//! - **Health monitoring**: fast/medium/deep probe levels with eviction of
//!   peers that stay unhealthy past a grace period
//! - **Adaptive refresh**: bucket refresh driven by routing dynamics, plus
//!   immediate refresh on critical events and periodic table maintenance
//!
//! ## Architecture
//!
//! The routing table is owned by a single actor:
//! - [`RoutingNode`] is the cheap-to-clone handle; commands go over an mpsc
//!   channel and replies come back on oneshots
//! - Readers take immutable snapshots published on a watch channel
//! - Every other component holds a handle and never touches the table
//!
//! Remote calls go through the [`OverlayRpc`] trait. [`sim`] provides an
//! in-process implementation used by the tests and the demo binary.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | [`Overlay`]: wires every component and owns the background loops |
//! | `identity` | Node ids, XOR distance, peer records, roles |
//! | `routing` | Bucketed routing table and snapshots |
//! | `dht` | Routing actor and its handle |
//! | `params` | Network-size driven parameter controller |
//! | `bootstrap` | Tiered entry peer selection and join |
//! | `discovery` | Iterative lookups and capability-based discovery |
//! | `cache` | TTL/LRU cache of discovered peers |
//! | `health` | Multi-level peer health checks |
//! | `refresh` | Dynamics analysis and refresh scheduling |
//! | `protocols` | Remote call trait, timeouts and retries |
//! | `events` | Structured overlay events |
//! | `config` | TOML configuration |
//! | `sim` | In-process network for tests and simulations |

mod bootstrap;
mod cache;
mod config;
mod dht;
mod discovery;
mod error;
mod events;
mod health;
mod identity;
mod node;
mod params;
mod protocols;
mod refresh;
mod routing;
pub mod sim;

pub use bootstrap::{
    BootstrapEndpoint, BootstrapInfo, BootstrapSelector, BootstrapTier, BootstrapTierLevel, Bootstrapper,
    DeploymentScale, EndpointHealth, JoinReport, SelectionPolicy, TierInfo, health_load,
};
pub use cache::{CacheStats, PeerCache};
pub use config::{
    BootstrapConfig, BootstrapEndpointConfig, BootstrapTierConfig, BootstrapTierSizes, CacheConfig,
    DeploymentScaleThresholds, DiscoveryConfig, EventConfig, HealthCheckIntervals, HealthCheckTimeouts,
    HealthConfig, IntervalBounds, NetworkSizeThresholds, OverlayConfig, ParameterConfig, RefreshConfig,
    RefreshIntervalBounds, RoutingConfig, ScalingFactors, MAX_SCALING_FACTOR, MIN_MAINTENANCE_INTERVAL,
};
pub use dht::RoutingNode;
pub use discovery::{
    classify_shortfall, DiscoveryEngine, DiscoveryOutcome, DiscoveryRequest, DiscoveryResult, LookupResult,
    PartialReason, ShortfallVerdict, SourceBreakdown,
};
pub use error::{OverlayError, Result};
pub use events::{EventSink, EvictionReason, OverlayEvent};
pub use health::{
    HealthBatch, HealthCheckResult, HealthLevel, HealthMonitor, HealthStats, HealthStatus, HealthTest, TestOutcome,
};
pub use identity::{
    distance_cmp, random_id_in_bucket, CapabilityFilter, Distance, NodeId, PeerHealth, PeerRecord, PeerTier, Role,
    RoleSet, ID_BITS, ID_LEN,
};
pub use node::{Overlay, Telemetry};
pub use params::{NetworkSizeCategory, ParameterController, ParameterSet};
pub use protocols::{call_with_retry, timed, Key, OverlayRpc, RetryPolicy};
pub use refresh::{
    CriticalEvent, DynamicsAnalyzer, DynamicsSignals, RefreshDepth, RefreshReport, RefreshScheduler, RefreshStrategy,
};
pub use routing::{BucketFull, BucketView, CorruptionIssue, InsertOutcome, RoutingSnapshot, RoutingTable, BUCKET_COUNT};
