//! End-to-end tests driving [`Overlay`] against the in-process network.
//!
//! Every test runs with paused time so deadlines, backoffs and probe
//! timeouts advance deterministically.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;

use kadence::sim::{SimNetwork, SimRegistry};
use kadence::{
    random_id_in_bucket, BootstrapEndpointConfig, BootstrapTierConfig, BootstrapTierLevel, CapabilityFilter,
    DiscoveryOutcome, DiscoveryRequest, EvictionReason, NodeId, Overlay, OverlayConfig, OverlayError,
    OverlayEvent, PartialReason, PeerRecord, PeerTier, Role, RoleSet,
};

fn meters() -> RoleSet {
    RoleSet::empty().with(Role::Meter)
}

fn sim_peer(id: NodeId, idx: usize, roles: RoleSet) -> PeerRecord {
    PeerRecord::new(id, format!("10.1.{}.{}", idx / 200, idx % 200 + 1), 7000).with_roles(roles)
}

fn endpoint(record: &PeerRecord) -> BootstrapEndpointConfig {
    BootstrapEndpointConfig {
        id: Some(record.id.to_hex()),
        address: record.address.clone(),
        port: record.port,
        region: None,
        weight: 1,
    }
}

fn tier(level: BootstrapTierLevel, records: &[&PeerRecord]) -> BootstrapTierConfig {
    BootstrapTierConfig {
        level,
        capacity_limit: 1000,
        endpoints: records.iter().map(|r| endpoint(r)).collect(),
    }
}

fn local_overlay(registry: &Arc<SimRegistry>, local_id: NodeId, config: OverlayConfig) -> Overlay<SimNetwork> {
    let local = PeerRecord::new(local_id, "127.0.0.1", 7000)
        .with_tier(PeerTier::Worker)
        .with_roles(RoleSet::all());
    registry.add_peer(local.clone());
    let network = Arc::new(registry.network_for(local.id));
    Overlay::new(local, network, config).expect("overlay")
}

/// Fully connected mesh of `count` peers tagged with `roles`.
fn mesh(registry: &Arc<SimRegistry>, count: usize, roles: RoleSet) -> Vec<PeerRecord> {
    let records: Vec<PeerRecord> = (0..count).map(|i| sim_peer(NodeId::random(), i, roles)).collect();
    for record in &records {
        registry.add_peer(record.clone());
    }
    registry.connect_all();
    records
}

#[tokio::test(start_paused = true)]
async fn discovery_reports_partial_when_network_is_too_small() {
    let registry = SimRegistry::new();
    let local_id = NodeId::random();
    let overlay = local_overlay(&registry, local_id, OverlayConfig::default());

    // Five peers per bucket keeps every bucket below capacity: 30 reachable
    // meters, 10 reachable peers without the role, 10 offline meters.
    let mut idx = 0;
    let mut offline = Vec::new();
    for bucket in 0..10 {
        for _ in 0..5 {
            let (roles, down) = match idx {
                0..30 => (meters(), false),
                30..40 => (RoleSet::empty(), false),
                _ => (meters(), true),
            };
            let record = sim_peer(random_id_in_bucket(&local_id, bucket), idx, roles);
            registry.add_peer(record.clone());
            if down {
                offline.push(record.id);
            }
            overlay.add_peer(record).await.unwrap();
            idx += 1;
        }
    }
    registry.connect_all();
    for id in &offline {
        registry.set_offline(id, true);
    }

    let request =
        DiscoveryRequest::new(50, CapabilityFilter::with_roles(meters())).with_timeout(Duration::from_secs(10));
    let result = overlay.discover(request).await.expect("partial result, not an error");

    assert_eq!(result.found(), 30);
    assert!(result.is_partial());
    assert!(!result.is_complete());
    assert_eq!(result.required, 50);
    assert_eq!(result.rejected_unhealthy, 10);
    assert!(result.peers.iter().all(|p| p.roles.contains(Role::Meter)));
    assert!(result.peers.iter().all(|p| !offline.contains(&p.id)));
    assert!(matches!(
        result.outcome,
        DiscoveryOutcome::Partial(PartialReason::SourcesExhausted | PartialReason::DeadlineReached)
    ));
    assert!(result.elapsed <= Duration::from_secs(10));

    overlay.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn discovery_beyond_tolerance_carries_partial_result() {
    let registry = SimRegistry::new();
    let local_id = NodeId::random();
    let overlay = local_overlay(&registry, local_id, OverlayConfig::default());
    for i in 0..5 {
        let record = sim_peer(random_id_in_bucket(&local_id, i), i, meters());
        registry.add_peer(record.clone());
        overlay.add_peer(record).await.unwrap();
    }
    registry.connect_all();

    let request =
        DiscoveryRequest::new(40, CapabilityFilter::with_roles(meters())).with_timeout(Duration::from_secs(5));
    match overlay.discover(request).await {
        Err(OverlayError::InsufficientNodes { found, required, partial }) => {
            assert_eq!(found, 5);
            assert_eq!(required, 40);
            assert_eq!(partial.found(), 5);
        }
        other => panic!("expected insufficient nodes, got {other:?}"),
    }

    overlay.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn join_fails_over_to_regional_tier() {
    let registry = SimRegistry::new();
    let peers = mesh(&registry, 12, meters());
    let dead_super = sim_peer(NodeId::random(), 99, meters());
    registry.add_peer(dead_super.clone());
    registry.set_offline(&dead_super.id, true);

    let mut config = OverlayConfig::default();
    config.bootstrap.failure_threshold = 3;
    config.bootstrap.max_attempts = 6;
    config.discovery.max_retries = 0;
    config.bootstrap.tiers = vec![
        tier(BootstrapTierLevel::Super, &[&dead_super]),
        tier(BootstrapTierLevel::Regional, &[&peers[0], &peers[1]]),
    ];
    let overlay = local_overlay(&registry, NodeId::random(), config);
    let mut events = overlay.subscribe();

    let report = overlay.join(5, None).await.expect("join through regional tier");
    assert_eq!(report.tier, Some(BootstrapTierLevel::Regional));
    assert_eq!(report.attempts, 4);
    assert!(report.routing_size >= 2);

    let mut saw_failover = false;
    while let Ok(event) = events.try_recv() {
        if let OverlayEvent::BootstrapFailover { from, to, .. } = event {
            assert_eq!(from, BootstrapTierLevel::Super);
            assert_eq!(to, Some(BootstrapTierLevel::Regional));
            saw_failover = true;
        }
    }
    assert!(saw_failover);

    let info = overlay.telemetry().bootstrap.expect("bootstrap info");
    let super_tier = info.tiers.iter().find(|t| t.level == BootstrapTierLevel::Super).unwrap();
    assert!(!super_tier.healthy);

    overlay.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn join_exhausts_when_no_entry_answers() {
    let registry = SimRegistry::new();
    let dead = sim_peer(NodeId::random(), 1, meters());
    registry.add_peer(dead.clone());
    registry.set_offline(&dead.id, true);

    let mut config = OverlayConfig::default();
    config.bootstrap.max_attempts = 3;
    config.discovery.max_retries = 0;
    config.bootstrap.tiers = vec![tier(BootstrapTierLevel::Super, &[&dead])];
    let overlay = local_overlay(&registry, NodeId::random(), config);

    match overlay.join(5, None).await {
        Err(OverlayError::BootstrapExhausted { attempts, tiers_tried }) => {
            assert_eq!(attempts, 3);
            assert_eq!(tiers_tried, vec![BootstrapTierLevel::Super]);
        }
        other => panic!("expected bootstrap exhaustion, got {other:?}"),
    }

    overlay.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn joined_node_discovers_and_reports_telemetry() {
    let registry = SimRegistry::new();
    let peers = mesh(&registry, 40, meters());

    let mut config = OverlayConfig::default();
    config.bootstrap.tiers = vec![tier(BootstrapTierLevel::Super, &[&peers[0], &peers[1], &peers[2]])];
    let overlay = local_overlay(&registry, NodeId::random(), config);

    let report = overlay.join(10, None).await.expect("join");
    assert_eq!(report.tier, Some(BootstrapTierLevel::Super));
    assert_eq!(report.attempts, 1);
    assert!(report.routing_size >= 10);

    overlay.start();

    let lookup = overlay.find_node(peers[7].id).await.expect("lookup");
    assert_eq!(lookup.closest.first().map(|p| p.id), Some(peers[7].id));

    let result = overlay
        .discover(DiscoveryRequest::new(10, CapabilityFilter::with_roles(meters())))
        .await
        .expect("discovery");
    assert!(result.is_complete());
    assert_eq!(result.found(), 10);

    let t = overlay.telemetry();
    assert_eq!(t.local_id, overlay.local_id());
    assert!(t.routing_size >= 10);
    assert!(t.estimated_network_size >= t.routing_size);
    assert!(t.active_buckets >= 1);
    assert!(t.cache.size >= 10);
    assert!(t.parameters.k >= 20);

    overlay.shutdown().await;
    assert!(!overlay.is_started());
}

#[tokio::test(start_paused = true)]
async fn health_loop_evicts_departed_peer() {
    let registry = SimRegistry::new();
    let peers = mesh(&registry, 10, meters());

    let mut config = OverlayConfig::default();
    config.bootstrap.tiers = vec![tier(BootstrapTierLevel::Super, &[&peers[0]])];
    let overlay = local_overlay(&registry, NodeId::random(), config);
    overlay.join(5, None).await.expect("join");

    let departed = overlay
        .routing()
        .snapshot()
        .peers()
        .map(|p| p.id)
        .find(|id| *id != peers[0].id)
        .expect("a peer besides the entry");
    registry.set_offline(&departed, true);

    let mut events = overlay.subscribe();
    overlay.start();

    let health = &overlay.config().health;
    let patience = health.max_unhealthy_duration + health.health_check_intervals.fast * 6;
    let evicted = timeout(patience, async {
        loop {
            match events.recv().await {
                Ok(OverlayEvent::BucketEviction { peer, reason, .. })
                    if peer == departed && reason == EvictionReason::Unhealthy =>
                {
                    break true;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break false,
            }
        }
    })
    .await
    .unwrap_or(false);

    assert!(evicted);
    assert!(overlay.routing().snapshot().contains(&peers[0].id));

    overlay.shutdown().await;
}
