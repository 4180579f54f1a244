//! The request/response primitive the overlay runs on.
//!
//! The overlay never opens sockets itself. A transport implements
//! [`OverlayRpc`] and every component reaches remote peers through it,
//! always under an explicit timeout (see [`timed`] and [`call_with_retry`]).
//! [`crate::sim::SimNetwork`] is the in-process implementation used by
//! tests and the simulation binary.

use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::{sleep, timeout, Duration};
use tracing::trace;

use crate::error::OverlayError;
use crate::identity::{NodeId, PeerRecord};

/// Storage key (32-byte BLAKE3 hash of the value).
pub type Key = [u8; 32];

/// Remote operations on a peer.
#[async_trait]
pub trait OverlayRpc: Send + Sync + 'static {
    /// Liveness probe.
    async fn ping(&self, to: &PeerRecord) -> Result<()>;

    /// The peers `to` knows closest to `target`.
    async fn find_node(&self, to: &PeerRecord, target: NodeId) -> Result<Vec<PeerRecord>>;

    /// A stored value, or closer peers when `to` does not hold it.
    async fn find_value(&self, to: &PeerRecord, key: Key) -> Result<(Option<Vec<u8>>, Vec<PeerRecord>)>;

    async fn store(&self, to: &PeerRecord, key: Key, value: Vec<u8>) -> Result<()>;
}

/// Local retry budget for transient RPC failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    /// Delay before the first retry; doubles on each further retry.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        max_retries: 0,
        backoff: Duration::ZERO,
    };

    pub fn new(max_retries: usize, backoff: Duration) -> Self {
        Self { max_retries, backoff }
    }

    fn delay(&self, attempt: usize) -> Duration {
        let shift = attempt.min(16) as u32;
        self.backoff.saturating_mul(1u32 << shift)
    }
}

/// One attempt bounded by `limit`.
pub async fn timed<T, Fut>(peer: NodeId, limit: Duration, call: Fut) -> Result<T, OverlayError>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(OverlayError::rpc(peer, err.to_string())),
        Err(_) => Err(OverlayError::NetworkTimeout { peer, attempts: 1 }),
    }
}

/// Run `call` under `limit`, retrying transient failures with exponential
/// backoff up to `policy.max_retries` times.
pub async fn call_with_retry<T, F, Fut>(
    peer: NodeId,
    limit: Duration,
    policy: RetryPolicy,
    mut call: F,
) -> Result<T, OverlayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_retries + 1;
    let mut timeouts = 0;
    let mut last_error = None;

    for attempt in 0..attempts {
        match timed(peer, limit, call()).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if matches!(err, OverlayError::NetworkTimeout { .. }) {
                    timeouts += 1;
                }
                trace!(
                    peer = %peer.short(),
                    attempt = attempt + 1,
                    error = %err,
                    "rpc attempt failed"
                );
                last_error = Some(err);
            }
        }
        if attempt + 1 < attempts {
            sleep(policy.delay(attempt)).await;
        }
    }

    Err(match last_error {
        Some(OverlayError::NetworkTimeout { .. }) | None => OverlayError::NetworkTimeout {
            peer,
            attempts: timeouts.max(1),
        },
        Some(other) => other,
    })
}
