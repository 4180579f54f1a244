//! In-process transport for simulations and tests.
//!
//! A [`SimRegistry`] holds lightweight simulated peers, each with its own
//! routing table and key/value store. [`SimNetwork`] implements
//! [`OverlayRpc`] by dispatching calls straight into the registry, with
//! per-peer fault injection:
//!
//! | Fault | Effect |
//! |-------|--------|
//! | offline | every call fails immediately |
//! | unresponsive | every call hangs until the caller's timeout |
//! | latency | every call sleeps first |
//! | store failure | `store` fails, other calls succeed |

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::time::{sleep, Duration};

use crate::identity::{NodeId, PeerRecord};
use crate::protocols::{Key, OverlayRpc};
use crate::routing::RoutingTable;

/// Bucket size of simulated peers' routing tables.
const SIM_K: usize = 20;

struct SimPeer {
    record: PeerRecord,
    table: Mutex<RoutingTable>,
    store: Mutex<HashMap<Key, Vec<u8>>>,
    offline: AtomicBool,
    unresponsive: AtomicBool,
    fail_store: AtomicBool,
    latency: Mutex<Duration>,
    calls: AtomicUsize,
}

impl SimPeer {
    fn new(record: PeerRecord) -> Self {
        let table = RoutingTable::new(record.id, SIM_K, Duration::from_secs(60));
        Self {
            record,
            table: Mutex::new(table),
            store: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            unresponsive: AtomicBool::new(false),
            fail_store: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        }
    }

    fn learn(&self, record: PeerRecord) {
        if let Ok(mut table) = self.table.lock() {
            table.insert(record.verified());
        }
    }
}

#[derive(Default)]
pub struct SimRegistry {
    peers: RwLock<HashMap<NodeId, Arc<SimPeer>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SimRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_peer(&self, record: PeerRecord) {
        if let Ok(mut peers) = self.peers.write() {
            peers.insert(record.id, Arc::new(SimPeer::new(record)));
        }
    }

    pub fn remove_peer(&self, id: &NodeId) {
        if let Ok(mut peers) = self.peers.write() {
            peers.remove(id);
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers
            .read()
            .map(|p| p.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn record(&self, id: &NodeId) -> Option<PeerRecord> {
        self.get(id).map(|p| p.record.clone())
    }

    fn get(&self, id: &NodeId) -> Option<Arc<SimPeer>> {
        self.peers.read().ok().and_then(|p| p.get(id).cloned())
    }

    fn all(&self) -> Vec<Arc<SimPeer>> {
        self.peers
            .read()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make `a` and `b` know each other.
    pub fn connect(&self, a: &NodeId, b: &NodeId) {
        if let (Some(pa), Some(pb)) = (self.get(a), self.get(b)) {
            pa.learn(pb.record.clone());
            pb.learn(pa.record.clone());
        }
    }

    /// Every peer learns every other peer (subject to bucket capacity).
    pub fn connect_all(&self) {
        let peers = self.all();
        for a in &peers {
            for b in &peers {
                if a.record.id != b.record.id {
                    a.learn(b.record.clone());
                }
            }
        }
    }

    /// Every peer learns `degree` random others.
    pub fn connect_random(&self, degree: usize) {
        let peers = self.all();
        let mut rng = rand::thread_rng();
        for a in &peers {
            for b in peers.choose_multiple(&mut rng, degree.min(peers.len())) {
                if a.record.id != b.record.id {
                    a.learn(b.record.clone());
                    b.learn(a.record.clone());
                }
            }
        }
    }

    pub fn set_offline(&self, id: &NodeId, offline: bool) {
        if let Some(peer) = self.get(id) {
            peer.offline.store(offline, Ordering::SeqCst);
        }
    }

    pub fn set_unresponsive(&self, id: &NodeId, unresponsive: bool) {
        if let Some(peer) = self.get(id) {
            peer.unresponsive.store(unresponsive, Ordering::SeqCst);
        }
    }

    pub fn set_store_failure(&self, id: &NodeId, fail: bool) {
        if let Some(peer) = self.get(id) {
            peer.fail_store.store(fail, Ordering::SeqCst);
        }
    }

    pub fn set_latency(&self, id: &NodeId, latency: Duration) {
        if let Some(peer) = self.get(id)
            && let Ok(mut guard) = peer.latency.lock()
        {
            *guard = latency;
        }
    }

    /// Calls received by `id` so far.
    pub fn call_count(&self, id: &NodeId) -> usize {
        self.get(id).map_or(0, |p| p.calls.load(Ordering::SeqCst))
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// A transport that issues calls on behalf of `local`.
    pub fn network_for(self: &Arc<Self>, local: NodeId) -> SimNetwork {
        SimNetwork {
            registry: self.clone(),
            local,
        }
    }
}

struct InFlight<'a>(&'a SimRegistry);

impl<'a> InFlight<'a> {
    fn enter(registry: &'a SimRegistry) -> Self {
        let now = registry.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        registry.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(registry)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct SimNetwork {
    registry: Arc<SimRegistry>,
    local: NodeId,
}

impl SimNetwork {
    pub fn registry(&self) -> &Arc<SimRegistry> {
        &self.registry
    }

    async fn reach(&self, to: &PeerRecord) -> Result<Arc<SimPeer>> {
        let peer = self
            .registry
            .get(&to.id)
            .ok_or_else(|| anyhow!("peer {} unreachable", to.id.short()))?;
        peer.calls.fetch_add(1, Ordering::SeqCst);
        if peer.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("connection to {} refused", to.endpoint()));
        }
        let latency = peer.latency.lock().map(|l| *l).unwrap_or_default();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        if peer.unresponsive.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        // The callee learns about the caller, as a real peer would.
        if let Some(caller) = self.registry.get(&self.local) {
            peer.learn(caller.record.clone());
        }
        Ok(peer)
    }
}

#[async_trait]
impl OverlayRpc for SimNetwork {
    async fn ping(&self, to: &PeerRecord) -> Result<()> {
        let _guard = InFlight::enter(&self.registry);
        self.reach(to).await?;
        Ok(())
    }

    async fn find_node(&self, to: &PeerRecord, target: NodeId) -> Result<Vec<PeerRecord>> {
        let _guard = InFlight::enter(&self.registry);
        let peer = self.reach(to).await?;
        let closest = peer
            .table
            .lock()
            .map(|t| t.closest_to(&target, SIM_K))
            .map_err(|_| anyhow!("peer table poisoned"))?;
        Ok(closest)
    }

    async fn find_value(&self, to: &PeerRecord, key: Key) -> Result<(Option<Vec<u8>>, Vec<PeerRecord>)> {
        let _guard = InFlight::enter(&self.registry);
        let peer = self.reach(to).await?;
        let value = peer.store.lock().ok().and_then(|s| s.get(&key).cloned());
        if value.is_some() {
            return Ok((value, Vec::new()));
        }
        let mut target = [0u8; crate::identity::ID_LEN];
        target.copy_from_slice(&key[..crate::identity::ID_LEN]);
        let closest = peer
            .table
            .lock()
            .map(|t| t.closest_to(&NodeId::from_bytes(target), SIM_K))
            .unwrap_or_default();
        Ok((None, closest))
    }

    async fn store(&self, to: &PeerRecord, key: Key, value: Vec<u8>) -> Result<()> {
        let _guard = InFlight::enter(&self.registry);
        let peer = self.reach(to).await?;
        if peer.fail_store.load(Ordering::SeqCst) {
            return Err(anyhow!("store rejected by {}", to.endpoint()));
        }
        peer.store
            .lock()
            .map_err(|_| anyhow!("peer store poisoned"))?
            .insert(key, value);
        Ok(())
    }
}
