//! # Overlay Node
//!
//! [`Overlay`] owns every component and their background tasks:
//!
//! ```ignore
//! let overlay = Overlay::new(local, Arc::new(network), OverlayConfig::default())?;
//! overlay.join(40, Some("eu")).await?;
//! overlay.start();
//!
//! let found = overlay
//!     .discover(DiscoveryRequest::new(10, CapabilityFilter::with_roles(roles)))
//!     .await?;
//!
//! overlay.shutdown().await;
//! ```
//!
//! ## Component wiring
//!
//! - **RoutingNode**: single owner of the routing table (actor)
//! - **ParameterController**: one instance injected into discovery and the
//!   parameter loop
//! - **PeerCache**: shared by discovery and health checks; stale entries
//!   are re-probed on the cache loop
//! - **HealthMonitor**: fast/medium/deep loops; evictions and suspected
//!   partitions are reported to the refresh scheduler as critical events
//! - **RefreshScheduler**: immediate/active/stable/maintenance loops
//! - **Bootstrapper**: tiered admission; a bookkeeping loop releases
//!   evicted entry peers and folds their health into load scores
//!
//! Background loops observe one shutdown signal.

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bootstrap::{health_load, BootstrapInfo, BootstrapSelector, Bootstrapper, JoinReport};
use crate::cache::{CacheStats, PeerCache};
use crate::config::OverlayConfig;
use crate::dht::RoutingNode;
use crate::discovery::{DiscoveryEngine, DiscoveryRequest, DiscoveryResult, LookupResult};
use crate::error::{OverlayError, Result};
use crate::events::{EventSink, OverlayEvent};
use crate::health::{HealthMonitor, HealthStats};
use crate::identity::{NodeId, PeerRecord};
use crate::params::{ParameterController, ParameterSet};
use crate::protocols::{OverlayRpc, RetryPolicy};
use crate::refresh::{CriticalEvent, DynamicsSignals, RefreshScheduler};

/// Grace period for background tasks to observe shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Point-in-time view of the overlay for status reporting.
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub local_id: NodeId,
    pub routing_size: usize,
    pub estimated_network_size: usize,
    pub active_buckets: usize,
    pub bucket_coverage: f64,
    pub parameters: Arc<ParameterSet>,
    pub failure_rate: f64,
    pub cache: CacheStats,
    pub health: HealthStats,
    pub dynamics: DynamicsSignals,
    pub random_walk_coverage: f64,
    pub bootstrap: Option<BootstrapInfo>,
}

/// A local overlay participant and its maintenance loops.
pub struct Overlay<N: OverlayRpc> {
    config: OverlayConfig,
    routing: RoutingNode<N>,
    params: Arc<ParameterController>,
    cache: Arc<PeerCache>,
    discovery: DiscoveryEngine<N>,
    health: HealthMonitor<N>,
    refresh: RefreshScheduler<N>,
    bootstrapper: Arc<Bootstrapper>,
    events: EventSink,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<N: OverlayRpc> Overlay<N> {
    /// Build every component. Must be called inside a tokio runtime; the
    /// routing actor starts immediately, background loops on [`start`].
    ///
    /// [`start`]: Overlay::start
    pub fn new(local: PeerRecord, network: Arc<N>, config: OverlayConfig) -> Result<Self> {
        config.validate()?;

        let events = EventSink::new(config.events.capacity);
        let params = Arc::new(ParameterController::new(config.parameters.clone()).with_events(events.clone()));
        let initial_k = params.current().k;
        let routing = RoutingNode::new(local, network, initial_k, &config.routing, events.clone());
        let cache = Arc::new(PeerCache::new(config.cache.clone()));
        let discovery = DiscoveryEngine::new(routing.clone(), params.clone(), cache.clone(), config.discovery.clone());
        let refresh = RefreshScheduler::new(discovery.clone(), config.refresh.clone(), events.clone());
        let retry = RetryPolicy::new(config.discovery.max_retries, config.discovery.retry_backoff);
        let health = HealthMonitor::new(routing.clone(), config.health.clone(), events.clone())
            .with_cache(cache.clone())
            .with_critical_events(refresh.event_sender())
            .with_retry(retry);
        let selector = BootstrapSelector::from_config(config.bootstrap.clone())?.with_events(events.clone());
        let bootstrapper = Arc::new(Bootstrapper::new(selector, retry));
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            local = %routing.local_id().short(),
            k = initial_k,
            adaptive = config.parameters.enable_adaptive_parameters,
            health_checks = config.health.enable_health_check,
            "overlay created"
        );

        Ok(Self {
            config,
            routing,
            params,
            cache,
            discovery,
            health,
            refresh,
            bootstrapper,
            events,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.routing.local_id()
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn routing(&self) -> &RoutingNode<N> {
        &self.routing
    }

    pub fn parameters(&self) -> &Arc<ParameterController> {
        &self.params
    }

    pub fn cache(&self) -> &Arc<PeerCache> {
        &self.cache
    }

    pub fn discovery(&self) -> &DiscoveryEngine<N> {
        &self.discovery
    }

    pub fn health(&self) -> &HealthMonitor<N> {
        &self.health
    }

    pub fn refresh(&self) -> &RefreshScheduler<N> {
        &self.refresh
    }

    pub fn bootstrapper(&self) -> &Bootstrapper {
        &self.bootstrapper
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }

    /// Join through the tiered entry peers, then size the parameters to the
    /// table we ended up with.
    pub async fn join(&self, worker_count: usize, region: Option<&str>) -> Result<JoinReport> {
        let report = self.bootstrapper.join(&self.discovery, worker_count, region).await?;
        self.refresh_parameters().await;
        Ok(report)
    }

    /// Add a known peer directly, bypassing bootstrap.
    pub async fn add_peer(&self, peer: PeerRecord) -> Result<()> {
        self.routing
            .observe_verified(peer)
            .await
            .map(|_| ())
            .map_err(|_| OverlayError::Closed("routing actor"))
    }

    pub async fn find_node(&self, target: NodeId) -> Result<LookupResult> {
        self.discovery.iterative_find_node(target).await
    }

    pub async fn discover(&self, request: DiscoveryRequest) -> Result<DiscoveryResult> {
        self.discovery.discover(request).await
    }

    /// Report a critical event to the refresh scheduler.
    pub fn report(&self, event: CriticalEvent) {
        if self.refresh.event_sender().try_send(event).is_err() {
            debug!(event = ?event, "critical event dropped");
        }
    }

    /// Fold the latest health status of each bootstrap endpoint into its
    /// load score.
    pub fn sync_bootstrap_load(&self) {
        sync_bootstrap_load(&self.health, &self.bootstrapper);
    }

    /// Re-estimate the network size and refresh the parameter set, resizing
    /// routing buckets when `k` changed.
    pub async fn refresh_parameters(&self) -> Arc<ParameterSet> {
        refresh_parameters(&self.routing, &self.params).await
    }

    /// Start the background loops. Calling it again has no effect.
    pub fn start(&self) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        if !tasks.is_empty() {
            return;
        }
        let shutdown = self.shutdown_tx.subscribe();

        tasks.extend(self.health.spawn(shutdown.clone()));
        tasks.extend(self.refresh.spawn(shutdown.clone()));

        let routing = self.routing.clone();
        let params = self.params.clone();
        let period = self.config.parameters.cache_ttl;
        let mut param_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        refresh_parameters(&routing, &params).await;
                    }
                    changed = param_shutdown.changed() => {
                        if changed.is_err() || *param_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("parameter loop stopped");
        }));

        let discovery = self.discovery.clone();
        let period = self.config.cache.cleanup_interval.min(self.config.cache.refresh_interval);
        let mut cache_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        discovery.cache().cleanup_expired();
                        discovery.reverify_cache().await;
                    }
                    changed = cache_shutdown.changed() => {
                        if changed.is_err() || *cache_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("cache cleanup loop stopped");
        }));

        let health = self.health.clone();
        let bootstrapper = self.bootstrapper.clone();
        let mut events = self.events.subscribe();
        let mut bookkeeping_shutdown = shutdown;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(OverlayEvent::BucketEviction { peer, .. }) => bootstrapper.release(&peer),
                        Ok(OverlayEvent::HealthBatchCompleted { .. }) => sync_bootstrap_load(&health, &bootstrapper),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "bootstrap bookkeeping lagged behind events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = bookkeeping_shutdown.changed() => {
                        if changed.is_err() || *bookkeeping_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("bootstrap bookkeeping loop stopped");
        }));

        info!(tasks = tasks.len(), "overlay background loops started");
    }

    pub fn is_started(&self) -> bool {
        self.tasks.lock().map(|t| !t.is_empty()).unwrap_or(false)
    }

    pub fn telemetry(&self) -> Telemetry {
        let snapshot = self.routing.snapshot();
        Telemetry {
            local_id: snapshot.local_id,
            routing_size: snapshot.node_count(),
            estimated_network_size: snapshot.estimated_network_size(),
            active_buckets: snapshot.active_buckets().len(),
            bucket_coverage: snapshot.bucket_coverage_ratio(),
            parameters: self.params.current(),
            failure_rate: self.params.failure_rate(),
            cache: self.cache.stats(),
            health: self.health.stats(),
            dynamics: self.refresh.signals(),
            random_walk_coverage: self.discovery.coverage(),
            bootstrap: self.bootstrapper.bootstrap_info(),
        }
    }

    /// Stop every background loop and the routing actor.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for mut task in tasks {
            if timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("background task did not stop in time, aborting");
                task.abort();
            }
        }
        self.routing.quit().await;
        info!(local = %self.local_id().short(), "overlay shut down");
    }
}

fn sync_bootstrap_load<N: OverlayRpc>(health: &HealthMonitor<N>, bootstrapper: &Bootstrapper) {
    let limit = health.config().health_check_timeouts.fast;
    for id in bootstrapper.endpoint_ids() {
        if let Some(status) = health.status(&id) {
            let response_time = status.last_response_time.unwrap_or_default();
            bootstrapper.update_load(&id, health_load(status.availability(), response_time, limit));
        }
    }
}

async fn refresh_parameters<N: OverlayRpc>(routing: &RoutingNode<N>, params: &ParameterController) -> Arc<ParameterSet> {
    let snapshot = routing.snapshot();
    let estimate = if snapshot.node_count() == 0 {
        Err(OverlayError::ParameterEstimation("routing table is empty".into()))
    } else {
        Ok(snapshot.estimated_network_size())
    };
    let current = params.refresh(estimate);
    if current.k != snapshot.k {
        match routing.set_k(current.k).await {
            Ok(trimmed) if !trimmed.is_empty() => {
                debug!(k = current.k, trimmed = trimmed.len(), "bucket capacity reduced");
            }
            Ok(_) => {}
            Err(err) => debug!(error = %err, "could not resize buckets"),
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::BootstrapTierLevel;
    use crate::config::{BootstrapEndpointConfig, BootstrapTierConfig, HealthConfig};
    use crate::events::EvictionReason;
    use crate::health::HealthLevel;
    use crate::identity::random_id_in_bucket;
    use crate::sim::{SimNetwork, SimRegistry};

    fn overlay(registry: &Arc<SimRegistry>, config: OverlayConfig) -> Overlay<SimNetwork> {
        let local = PeerRecord::new(NodeId::random(), "127.0.0.1", 7100);
        registry.add_peer(local.clone());
        let network = Arc::new(registry.network_for(local.id));
        Overlay::new(local, network, config).unwrap()
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let registry = SimRegistry::new();
        let mut config = OverlayConfig::default();
        config.health.health_check_concurrency = 0;
        let local = PeerRecord::new(NodeId::random(), "127.0.0.1", 7100);
        let network = Arc::new(registry.network_for(local.id));
        assert!(matches!(
            Overlay::new(local, network, config),
            Err(OverlayError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn parameters_follow_table_size() {
        let registry = SimRegistry::new();
        let o = overlay(&registry, OverlayConfig::default());
        let empty = o.refresh_parameters().await;
        assert_eq!(empty.alpha, 3);
        assert_eq!(empty.k, 20);

        let local = o.local_id();
        for bucket in 0..7 {
            for _ in 0..10 {
                let id = random_id_in_bucket(&local, bucket);
                o.add_peer(PeerRecord::new(id, "10.7.0.1", 1)).await.unwrap();
            }
        }
        o.parameters().invalidate();
        let grown = o.refresh_parameters().await;
        assert!(grown.network_size >= 50);
        assert!(grown.k > 20);
        tokio::task::yield_now().await;
        assert_eq!(o.routing().snapshot().k, grown.k);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_shutdown_stops_everything() {
        let registry = SimRegistry::new();
        let o = overlay(&registry, OverlayConfig::default());
        o.start();
        assert!(o.is_started());
        let count = o.tasks.lock().unwrap().len();
        assert_eq!(count, 3 + 4 + 3);
        o.start();
        assert_eq!(o.tasks.lock().unwrap().len(), count);

        o.shutdown().await;
        assert!(!o.is_started());
        for _ in 0..10 {
            if !o.routing().is_running() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!o.routing().is_running());
    }

    #[tokio::test]
    async fn disabled_health_checks_start_no_health_loops() {
        let registry = SimRegistry::new();
        let config = OverlayConfig {
            health: HealthConfig {
                enable_health_check: false,
                ..HealthConfig::default()
            },
            ..OverlayConfig::default()
        };
        let o = overlay(&registry, config);
        o.start();
        assert_eq!(o.tasks.lock().unwrap().len(), 4 + 3);
        o.shutdown().await;
    }

    #[tokio::test]
    async fn telemetry_reports_components() {
        let registry = SimRegistry::new();
        let o = overlay(&registry, OverlayConfig::default());
        let peer = PeerRecord::new(NodeId::random(), "10.7.0.2", 2);
        o.add_peer(peer).await.unwrap();
        let t = o.telemetry();
        assert_eq!(t.local_id, o.local_id());
        assert_eq!(t.routing_size, 1);
        assert_eq!(t.active_buckets, 1);
        assert!(t.bootstrap.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_endpoints_follow_health_and_eviction() {
        let registry = SimRegistry::new();
        let peers: Vec<PeerRecord> = (0..4)
            .map(|i| PeerRecord::new(NodeId::random(), "10.7.1.1", 7200 + i))
            .collect();
        for p in &peers {
            registry.add_peer(p.clone());
        }
        registry.connect_all();
        let entry = peers[0].clone();

        let mut config = OverlayConfig::default();
        config.bootstrap.tiers = vec![BootstrapTierConfig {
            level: BootstrapTierLevel::Super,
            capacity_limit: 100,
            endpoints: vec![BootstrapEndpointConfig {
                id: Some(entry.id.to_hex()),
                address: entry.address.clone(),
                port: entry.port,
                region: None,
                weight: 1,
            }],
        }];
        let o = overlay(&registry, config);
        o.join(4, None).await.unwrap();
        assert_eq!(o.bootstrapper().endpoint(&entry.id).unwrap().active_connections, 1);

        registry.set_offline(&entry.id, true);
        o.health().check_peer(&entry, HealthLevel::Fast).await;
        o.sync_bootstrap_load();
        let load = o.bootstrapper().endpoint(&entry.id).unwrap().load_score;
        assert!(load >= 0.5, "load {load}");

        o.start();
        o.routing().evict(entry.id, EvictionReason::Manual).await.unwrap();
        for _ in 0..10 {
            if o.bootstrapper().endpoint(&entry.id).unwrap().active_connections == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(o.bootstrapper().endpoint(&entry.id).unwrap().active_connections, 0);
        o.shutdown().await;
    }
}
