//! # Routing Coordinator
//!
//! The [`RoutingTable`] has exactly one owner: an actor task that applies
//! mutations in the order they arrive. Components hold a cheap
//! [`RoutingNode`] handle and
//!
//! - send mutations as commands (observe, evict, set health, set k, ...),
//! - read the latest immutable [`RoutingSnapshot`] published through a
//!   `watch` channel after every mutation.
//!
//! When a full bucket rejects a contact, the actor pings the exposed
//! eviction candidate in a detached task and feeds the result back as a
//! command, so no RPC ever runs while the table is being mutated.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Duration};
use tracing::{debug, trace};

use crate::config::RoutingConfig;
use crate::events::{EventSink, EvictionReason, OverlayEvent};
use crate::identity::{NodeId, PeerHealth, PeerRecord};
use crate::protocols::OverlayRpc;
use crate::routing::{BucketFull, CorruptionIssue, InsertOutcome, RoutingSnapshot, RoutingTable};

pub struct RoutingNode<N: OverlayRpc> {
    cmd_tx: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<Arc<RoutingSnapshot>>,
    local: PeerRecord,
    network: Arc<N>,
    events: EventSink,
}

impl<N: OverlayRpc> Clone for RoutingNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            snapshot_rx: self.snapshot_rx.clone(),
            local: self.local.clone(),
            network: self.network.clone(),
            events: self.events.clone(),
        }
    }
}

enum Command {
    Observe(PeerRecord, bool, oneshot::Sender<InsertOutcome>),
    MarkVerified(NodeId),
    Evict(NodeId, EvictionReason, oneshot::Sender<Option<PeerRecord>>),
    SetHealth(NodeId, PeerHealth),
    SetK(usize, oneshot::Sender<Vec<PeerRecord>>),
    MarkBucketRefreshed(usize),
    ApplyChallenge(BucketFull, bool),
    Validate(oneshot::Sender<Vec<CorruptionIssue>>),
    Repair(oneshot::Sender<usize>),
    #[cfg(test)]
    ForceIntoBucket(usize, PeerRecord),
    Quit,
}

struct RoutingActor<N: OverlayRpc> {
    table: RoutingTable,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    snapshot_tx: watch::Sender<Arc<RoutingSnapshot>>,
    network: Arc<N>,
    events: EventSink,
    challenge_timeout: Duration,
    /// Buckets with a ping challenge in flight.
    challenging: HashSet<usize>,
}

impl<N: OverlayRpc> RoutingNode<N> {
    /// Spawn the routing actor. Must be called inside a tokio runtime.
    pub fn new(local: PeerRecord, network: Arc<N>, k: usize, config: &RoutingConfig, events: EventSink) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer.max(1));
        let table = RoutingTable::new(local.id, k, config.freshness_window);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(table.snapshot()));

        let actor = RoutingActor {
            table,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            snapshot_tx,
            network: network.clone(),
            events: events.clone(),
            challenge_timeout: config.challenge_timeout,
            challenging: HashSet::new(),
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            snapshot_rx,
            local,
            network,
            events,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    pub fn local_record(&self) -> &PeerRecord {
        &self.local
    }

    /// The transport used to reach remote peers.
    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Latest published view of the table.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RoutingSnapshot>> {
        self.snapshot_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Offer a peer we just exchanged messages with directly.
    pub async fn observe_verified(&self, peer: PeerRecord) -> Result<InsertOutcome> {
        self.observe(peer.verified(), true).await
    }

    /// Offer a peer learned second-hand (e.g. from a `find_node` answer).
    pub async fn observe_learned(&self, peer: PeerRecord) -> Result<InsertOutcome> {
        self.observe(peer.learned(), false).await
    }

    async fn observe(&self, peer: PeerRecord, verified: bool) -> Result<InsertOutcome> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Observe(peer, verified, tx))
            .await
            .map_err(|_| anyhow!("routing actor closed"))?;
        rx.await.map_err(|_| anyhow!("routing actor closed"))
    }

    /// Refresh `last_seen`/`last_verified` of a known peer.
    pub async fn mark_verified(&self, id: NodeId) {
        let _ = self.cmd_tx.send(Command::MarkVerified(id)).await;
    }

    pub async fn evict(&self, id: NodeId, reason: EvictionReason) -> Result<Option<PeerRecord>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Evict(id, reason, tx))
            .await
            .map_err(|_| anyhow!("routing actor closed"))?;
        rx.await.map_err(|_| anyhow!("routing actor closed"))
    }

    pub async fn set_health(&self, id: NodeId, health: PeerHealth) {
        let _ = self.cmd_tx.send(Command::SetHealth(id, health)).await;
    }

    /// Resize every bucket; returns the peers trimmed by a shrink.
    pub async fn set_k(&self, k: usize) -> Result<Vec<PeerRecord>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SetK(k, tx))
            .await
            .map_err(|_| anyhow!("routing actor closed"))?;
        rx.await.map_err(|_| anyhow!("routing actor closed"))
    }

    pub async fn mark_bucket_refreshed(&self, bucket_idx: usize) {
        let _ = self.cmd_tx.send(Command::MarkBucketRefreshed(bucket_idx)).await;
    }

    pub async fn validate(&self) -> Result<Vec<CorruptionIssue>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Validate(tx))
            .await
            .map_err(|_| anyhow!("routing actor closed"))?;
        rx.await.map_err(|_| anyhow!("routing actor closed"))
    }

    /// Rebuild bucket placement; returns how many records moved or dropped.
    pub async fn repair(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Repair(tx))
            .await
            .map_err(|_| anyhow!("routing actor closed"))?;
        rx.await.map_err(|_| anyhow!("routing actor closed"))
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    #[cfg(test)]
    pub(crate) async fn force_into_bucket(&self, bucket_idx: usize, peer: PeerRecord) {
        let _ = self.cmd_tx.send(Command::ForceIntoBucket(bucket_idx, peer)).await;
    }
}

impl<N: OverlayRpc> RoutingActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            let mutated = match cmd {
                Command::Observe(peer, verified, reply) => {
                    let outcome = self.handle_observe(peer, verified);
                    let _ = reply.send(outcome);
                    true
                }
                Command::MarkVerified(id) => self.table.mark_verified(&id),
                Command::Evict(id, reason, reply) => {
                    let removed = self.table.evict(&id);
                    if let Some(record) = &removed {
                        self.emit_eviction(record, reason);
                    }
                    let mutated = removed.is_some();
                    let _ = reply.send(removed);
                    mutated
                }
                Command::SetHealth(id, health) => self.table.set_health(&id, health),
                Command::SetK(k, reply) => {
                    let changed = k != self.table.k();
                    let trimmed = self.table.set_k(k);
                    for record in &trimmed {
                        self.emit_eviction(record, EvictionReason::Trimmed);
                    }
                    let _ = reply.send(trimmed);
                    changed
                }
                Command::MarkBucketRefreshed(idx) => {
                    self.table.mark_bucket_refreshed(idx);
                    true
                }
                Command::ApplyChallenge(challenge, alive) => {
                    self.challenging.remove(&challenge.bucket_index);
                    if let Some(evicted) = self.table.apply_challenge(challenge, alive) {
                        self.emit_eviction(&evicted, EvictionReason::ChallengeFailed);
                    }
                    true
                }
                Command::Validate(reply) => {
                    let _ = reply.send(self.table.validate());
                    false
                }
                Command::Repair(reply) => {
                    let touched = self.table.repair();
                    let _ = reply.send(touched);
                    touched > 0
                }
                #[cfg(test)]
                Command::ForceIntoBucket(idx, peer) => {
                    self.table.force_into_bucket(idx, peer);
                    true
                }
                Command::Quit => break,
            };
            if mutated {
                self.publish();
            }
        }
        debug!(local = %self.table.local_id().short(), "routing actor stopped");
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(Arc::new(self.table.snapshot()));
    }

    fn handle_observe(&mut self, peer: PeerRecord, verified: bool) -> InsertOutcome {
        let outcome = self.table.insert(peer);
        match &outcome {
            InsertOutcome::Replaced { evicted } => {
                self.emit_eviction(evicted, EvictionReason::Replaced);
            }
            InsertOutcome::Rejected(full) => {
                trace!(
                    bucket = full.bucket_index,
                    incoming = %full.incoming.id.short(),
                    candidate = %full.eviction_candidate.id.short(),
                    verified,
                    "bucket full, challenging eviction candidate"
                );
                self.spawn_challenge(full.clone());
            }
            _ => {}
        }
        outcome
    }

    fn spawn_challenge(&mut self, challenge: BucketFull) {
        if !self.challenging.insert(challenge.bucket_index) {
            return;
        }
        let network = self.network.clone();
        let tx = self.cmd_tx.clone();
        let limit = self.challenge_timeout;
        tokio::spawn(async move {
            let alive = matches!(
                timeout(limit, network.ping(&challenge.eviction_candidate)).await,
                Ok(Ok(()))
            );
            let _ = tx.send(Command::ApplyChallenge(challenge, alive)).await;
        });
    }

    fn emit_eviction(&self, record: &PeerRecord, reason: EvictionReason) {
        self.events.emit(OverlayEvent::BucketEviction {
            peer: record.id,
            bucket_index: record.bucket_index,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::random_id_in_bucket;
    use crate::sim::SimRegistry;

    fn local() -> PeerRecord {
        PeerRecord::new(NodeId::random(), "127.0.0.1", 7000)
    }

    fn node_with_k(registry: &Arc<SimRegistry>, k: usize) -> RoutingNode<crate::sim::SimNetwork> {
        let me = local();
        let network = Arc::new(registry.network_for(me.id));
        RoutingNode::new(me, network, k, &RoutingConfig::default(), EventSink::new(64))
    }

    #[tokio::test]
    async fn observed_peers_appear_in_snapshot() {
        let registry = SimRegistry::new();
        let node = node_with_k(&registry, 20);
        let peer = PeerRecord::new(NodeId::random(), "10.0.0.2", 7000);
        let outcome = node.observe_verified(peer.clone()).await.unwrap();
        assert!(matches!(outcome, InsertOutcome::Inserted));

        let snapshot = node.snapshot();
        let stored = snapshot.get(&peer.id).expect("peer stored");
        assert_eq!(stored.bucket_index, node.local_id().shared_prefix_len(&peer.id));
        assert!(stored.last_verified.is_some());
    }

    #[tokio::test]
    async fn dead_candidate_is_replaced_after_challenge() {
        let registry = SimRegistry::new();
        let node = node_with_k(&registry, 1);
        let local_id = node.local_id();

        let old = PeerRecord::new(random_id_in_bucket(&local_id, 0), "10.0.0.3", 7000);
        node.observe_learned(old.clone()).await.unwrap();

        let newcomer = PeerRecord::new(random_id_in_bucket(&local_id, 0), "10.0.0.4", 7000);
        let outcome = node.observe_learned(newcomer.clone()).await.unwrap();
        assert!(matches!(outcome, InsertOutcome::Rejected(_)));

        // `old` is not registered with the simulated network, so the ping fails.
        let mut rx = node.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow_and_update().contains(&newcomer.id) {
                    break;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("challenge resolved");

        let snapshot = node.snapshot();
        assert!(!snapshot.contains(&old.id));
        assert_eq!(snapshot.bucket(0).map(|b| b.peers.len()), Some(1));
    }

    #[tokio::test]
    async fn evict_emits_event_and_removes_peer() {
        let registry = SimRegistry::new();
        let node = node_with_k(&registry, 20);
        let mut events = node.events().subscribe();
        let peer = PeerRecord::new(NodeId::random(), "10.0.0.5", 7000);
        node.observe_verified(peer.clone()).await.unwrap();

        let removed = node.evict(peer.id, EvictionReason::Manual).await.unwrap();
        assert_eq!(removed.map(|p| p.id), Some(peer.id));
        assert!(!node.snapshot().contains(&peer.id));
        match events.recv().await.unwrap() {
            OverlayEvent::BucketEviction { peer: id, reason, .. } => {
                assert_eq!(id, peer.id);
                assert_eq!(reason, EvictionReason::Manual);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_inserts_never_overfill_buckets() {
        let registry = SimRegistry::new();
        let node = node_with_k(&registry, 5);
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let node = node.clone();
            tasks.spawn(async move {
                for _ in 0..40 {
                    let peer = PeerRecord::new(NodeId::random(), "10.0.0.9", 7000);
                    let id = peer.id;
                    node.observe_verified(peer).await.unwrap();
                    if rand::random::<bool>() {
                        node.evict(id, EvictionReason::Manual).await.unwrap();
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        let snapshot = node.snapshot();
        for bucket in &snapshot.buckets {
            assert!(bucket.peers.len() <= 5);
        }
        assert!(node.validate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shrinking_k_trims_and_reports() {
        let registry = SimRegistry::new();
        let node = node_with_k(&registry, 4);
        let local_id = node.local_id();
        for _ in 0..4 {
            node.observe_learned(PeerRecord::new(random_id_in_bucket(&local_id, 2), "10.0.0.6", 7000))
                .await
                .unwrap();
        }
        let trimmed = node.set_k(2).await.unwrap();
        assert_eq!(trimmed.len(), 2);
        assert_eq!(node.snapshot().k, 2);
        assert_eq!(node.snapshot().bucket(2).map(|b| b.peers.len()), Some(2));
    }
}
