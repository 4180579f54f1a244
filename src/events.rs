//! Structured Events
//!
//! Every observable decision the overlay makes is published as an
//! [`OverlayEvent`] on a broadcast channel and logged with consistent
//! field names at the same time.
//!
//! Event types:
//! - `parameters_recalculated` - ParameterSet replaced (before/after values)
//! - `health_batch_completed` - one health level finished a batch
//! - `bootstrap_failover` - a bootstrap tier went unhealthy
//! - `bucket_eviction` - a peer left the routing table
//! - `refresh_completed` - a refresh strategy finished a pass
//! - `routing_corruption_detected` - validation found structural issues

use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::bootstrap::BootstrapTierLevel;
use crate::health::HealthLevel;
use crate::identity::NodeId;
use crate::params::ParameterSet;
use crate::refresh::RefreshStrategy;

/// Why a peer was removed from the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Unhealthy for longer than the configured maximum.
    Unhealthy,
    /// Did not answer a bucket challenge.
    ChallengeFailed,
    /// Displaced by a freshly verified contact.
    Replaced,
    /// Dropped while shrinking bucket capacity or repairing the table.
    Trimmed,
    /// Removed on request.
    Manual,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Unhealthy => "unhealthy",
            EvictionReason::ChallengeFailed => "challenge_failed",
            EvictionReason::Replaced => "replaced",
            EvictionReason::Trimmed => "trimmed",
            EvictionReason::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone)]
pub enum OverlayEvent {
    ParametersRecalculated {
        network_size: usize,
        before: Option<ParameterSet>,
        after: ParameterSet,
    },
    HealthBatchCompleted {
        level: HealthLevel,
        checked: usize,
        healthy: usize,
        failed: usize,
        evicted: usize,
        duration: Duration,
    },
    BootstrapFailover {
        from: BootstrapTierLevel,
        to: Option<BootstrapTierLevel>,
        consecutive_failures: u32,
    },
    BucketEviction {
        peer: NodeId,
        bucket_index: usize,
        reason: EvictionReason,
    },
    RefreshCompleted {
        strategy: RefreshStrategy,
        buckets: usize,
        discovered: usize,
        duration: Duration,
    },
    RoutingCorruptionDetected {
        issues: usize,
        repaired: usize,
    },
}

/// Cloneable publisher for [`OverlayEvent`]s.
///
/// Emitting never blocks and never fails: with no subscribers the event is
/// only logged.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: broadcast::Sender<OverlayEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: OverlayEvent) {
        log_event(&event);
        let _ = self.tx.send(event);
    }
}

fn log_event(event: &OverlayEvent) {
    match event {
        OverlayEvent::ParametersRecalculated {
            network_size,
            before,
            after,
        } => {
            info!(
                event_type = "parameters_recalculated",
                network_size = *network_size,
                category = after.network_size_category.as_str(),
                old_alpha = before.as_ref().map(|p| p.alpha),
                new_alpha = after.alpha,
                old_k = before.as_ref().map(|p| p.k),
                new_k = after.k,
                old_timeout_ms = before.as_ref().map(|p| p.query_timeout.as_millis() as u64),
                new_timeout_ms = after.query_timeout.as_millis() as u64,
                "Parameters recalculated"
            );
        }
        OverlayEvent::HealthBatchCompleted {
            level,
            checked,
            healthy,
            failed,
            evicted,
            duration,
        } => {
            info!(
                event_type = "health_batch_completed",
                level = level.as_str(),
                checked = *checked,
                healthy = *healthy,
                failed = *failed,
                evicted = *evicted,
                duration_ms = duration.as_millis() as u64,
                "Health batch completed"
            );
        }
        OverlayEvent::BootstrapFailover {
            from,
            to,
            consecutive_failures,
        } => {
            warn!(
                event_type = "bootstrap_failover",
                from = from.as_str(),
                to = to.map(|t| t.as_str()).unwrap_or("none"),
                consecutive_failures = *consecutive_failures,
                "Bootstrap tier failover"
            );
        }
        OverlayEvent::BucketEviction {
            peer,
            bucket_index,
            reason,
        } => {
            debug!(
                event_type = "bucket_eviction",
                peer = %peer.short(),
                bucket = *bucket_index,
                reason = reason.as_str(),
                "Peer evicted from routing table"
            );
        }
        OverlayEvent::RefreshCompleted {
            strategy,
            buckets,
            discovered,
            duration,
        } => {
            debug!(
                event_type = "refresh_completed",
                strategy = strategy.as_str(),
                buckets = *buckets,
                discovered = *discovered,
                duration_ms = duration.as_millis() as u64,
                "Refresh pass completed"
            );
        }
        OverlayEvent::RoutingCorruptionDetected { issues, repaired } => {
            warn!(
                event_type = "routing_corruption_detected",
                issues = *issues,
                repaired = *repaired,
                "Routing table corruption detected"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let sink = EventSink::new(8);
        let mut rx = sink.subscribe();
        let peer = NodeId::random();
        sink.emit(OverlayEvent::BucketEviction {
            peer,
            bucket_index: 3,
            reason: EvictionReason::Unhealthy,
        });
        match rx.recv().await.unwrap() {
            OverlayEvent::BucketEviction { peer: p, bucket_index, reason } => {
                assert_eq!(p, peer);
                assert_eq!(bucket_index, 3);
                assert_eq!(reason, EvictionReason::Unhealthy);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_harmless() {
        let sink = EventSink::new(1);
        sink.emit(OverlayEvent::RoutingCorruptionDetected { issues: 1, repaired: 1 });
    }
}
