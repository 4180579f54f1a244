use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadence::sim::SimRegistry;
use kadence::{
    BootstrapEndpointConfig, BootstrapTierConfig, BootstrapTierLevel, CapabilityFilter, DiscoveryRequest, NodeId,
    Overlay, OverlayConfig, OverlayError, PeerRecord, PeerTier, Role, RoleSet,
};

/// Runs one overlay node against an in-process simulated mesh.
#[derive(Parser, Debug)]
#[command(name = "kadence")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file. Defaults apply when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulated peers in the mesh.
    #[arg(short, long, default_value = "200")]
    peers: usize,

    /// Peers each simulated peer initially knows.
    #[arg(long, default_value = "8")]
    degree: usize,

    /// Peers to discover after joining.
    #[arg(short, long, default_value = "25")]
    discover: usize,

    /// Region to prefer when selecting bootstrap peers.
    #[arg(short, long)]
    region: Option<String>,

    /// Seconds between telemetry snapshots.
    #[arg(short, long, default_value = "30")]
    telemetry_interval: u64,
}

const REGIONS: [&str; 3] = ["eu", "us", "ap"];

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => OverlayConfig::load(path)?,
        None => OverlayConfig::default(),
    };

    let registry = SimRegistry::new();
    let mut ids = Vec::with_capacity(args.peers);
    let mut rng = rand::thread_rng();
    for i in 0..args.peers {
        let roles: RoleSet = Role::ALL
            .iter()
            .copied()
            .filter(|_| rng.gen_bool(0.5))
            .collect();
        let tier = match i {
            0..=2 => PeerTier::Super,
            3..=8 => PeerTier::Regional,
            9..=20 => PeerTier::Local,
            _ => PeerTier::Worker,
        };
        let record = PeerRecord::new(NodeId::random(), format!("10.0.{}.{}", i / 250, i % 250 + 1), 7000)
            .with_tier(tier)
            .with_roles(roles);
        ids.push(record.id);
        registry.add_peer(record);
    }
    registry.connect_random(args.degree);
    info!(peers = registry.len(), degree = args.degree, "simulated mesh ready");

    if config.bootstrap.tiers.is_empty() {
        config.bootstrap.tiers = bootstrap_tiers(&registry, &ids);
    }

    let local = PeerRecord::new(NodeId::random(), "127.0.0.1", 7000)
        .with_tier(PeerTier::Worker)
        .with_roles(RoleSet::all());
    registry.add_peer(local.clone());
    let network = Arc::new(registry.network_for(local.id));
    let overlay = Overlay::new(local, network, config).context("failed to build overlay")?;

    let report = overlay
        .join(args.peers, args.region.as_deref())
        .await
        .context("failed to join overlay")?;
    info!(
        entry = %report.entry.id.short(),
        tier = ?report.tier,
        attempts = report.attempts,
        routing_size = report.routing_size,
        "joined overlay"
    );

    overlay.start();

    let mut roles = RoleSet::empty();
    if let Some(role) = Role::ALL.choose(&mut rng) {
        roles.insert(*role);
    }
    match overlay
        .discover(DiscoveryRequest::new(args.discover, CapabilityFilter::with_roles(roles)))
        .await
    {
        Ok(result) => info!(
            found = result.found(),
            required = result.required,
            partial = result.is_partial(),
            cache = result.sources.cache,
            routing = result.sources.routing,
            lookup = result.sources.lookup,
            random_walk = result.sources.random_walk,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "discovery finished"
        ),
        Err(OverlayError::InsufficientNodes { found, required, .. }) => {
            warn!(found, required, "discovery fell short")
        }
        Err(err) => warn!(error = %err, "discovery failed"),
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let t = overlay.telemetry();
                info!(
                    routing_size = t.routing_size,
                    estimated_size = t.estimated_network_size,
                    active_buckets = t.active_buckets,
                    coverage = format!("{:.2}", t.bucket_coverage),
                    k = t.parameters.k,
                    alpha = t.parameters.alpha,
                    category = t.parameters.network_size_category.as_str(),
                    failure_rate = format!("{:.2}", t.failure_rate),
                    cache_entries = t.cache.size,
                    churn = format!("{:.2}", t.dynamics.churn_rate),
                    "telemetry snapshot"
                );
            }
        }
    }

    overlay.shutdown().await;
    Ok(())
}

/// Spread the first simulated peers over the three bootstrap tiers.
fn bootstrap_tiers(registry: &SimRegistry, ids: &[NodeId]) -> Vec<BootstrapTierConfig> {
    let endpoint = |idx: usize| {
        registry.record(&ids[idx]).map(|record| BootstrapEndpointConfig {
            id: Some(record.id.to_hex()),
            address: record.address.clone(),
            port: record.port,
            region: Some(REGIONS[idx % REGIONS.len()].to_string()),
            weight: 1,
        })
    };
    let tier = |level, range: std::ops::Range<usize>| BootstrapTierConfig {
        level,
        capacity_limit: 1000,
        endpoints: range.filter(|i| *i < ids.len()).filter_map(&endpoint).collect(),
    };
    vec![
        tier(BootstrapTierLevel::Super, 0..3),
        tier(BootstrapTierLevel::Regional, 3..9),
        tier(BootstrapTierLevel::Local, 9..21),
    ]
}
