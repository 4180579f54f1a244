//! # Routing Table
//!
//! Fixed array of `ID_BITS` k-buckets indexed by the shared-prefix length
//! between the local id and a peer's id. Pure data structure: no I/O and no
//! clock other than timestamps carried on records. Mutation happens only
//! inside the routing actor (see [`crate::dht`]); everyone else reads an
//! immutable [`RoutingSnapshot`].
//!
//! ## Bucket policy
//!
//! Within a bucket records are ordered least-recently-seen first. When a
//! bucket is full, an incoming contact that was verified within the
//! freshness window may displace the least-recently-verified entry, but
//! only if that entry is itself stale. Otherwise the insert is rejected and
//! the entry that would have been displaced is exposed so the caller can
//! challenge it with a ping.

use std::collections::HashSet;

use tokio::time::{Duration, Instant};

use crate::identity::{distance_cmp, Distance, NodeId, PeerHealth, PeerRecord, ID_BITS};

/// Number of buckets in a routing table.
pub const BUCKET_COUNT: usize = ID_BITS;

#[derive(Debug, Clone)]
struct RoutingBucket {
    peers: Vec<PeerRecord>,
    last_refreshed: Instant,
    changes: u64,
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            peers: Vec::new(),
            last_refreshed: Instant::now(),
            changes: 0,
        }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.peers.iter().position(|p| &p.id == id)
    }

    /// Index of the entry verified longest ago; unverified entries sort first,
    /// ties broken by `last_seen`.
    fn least_recently_verified(&self) -> Option<usize> {
        self.peers
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| (p.last_verified, p.last_seen))
            .map(|(idx, _)| idx)
    }

    fn least_recently_verified_stale(&self, freshness: Duration) -> Option<usize> {
        self.peers
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_fresh(freshness))
            .min_by_key(|(_, p)| (p.last_verified, p.last_seen))
            .map(|(idx, _)| idx)
    }

    fn remove(&mut self, id: &NodeId) -> Option<PeerRecord> {
        let pos = self.position(id)?;
        self.changes += 1;
        Some(self.peers.remove(pos))
    }
}

/// Result of offering a record to the table.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted,
    /// Already present; moved to the tail with merged metadata.
    Updated,
    /// A stale entry made room for a freshly verified newcomer.
    Replaced { evicted: PeerRecord },
    Rejected(BucketFull),
    /// The local id is never stored.
    Ignored,
}

impl InsertOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(
            self,
            InsertOutcome::Inserted | InsertOutcome::Updated | InsertOutcome::Replaced { .. }
        )
    }
}

/// A full bucket refused `incoming`; `eviction_candidate` is the entry the
/// caller should ping before deciding.
#[derive(Debug, Clone)]
pub struct BucketFull {
    pub bucket_index: usize,
    pub eviction_candidate: PeerRecord,
    pub incoming: PeerRecord,
}

/// Structural problem found by [`RoutingTable::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptionIssue {
    /// Record stored in a bucket that does not match its shared prefix.
    MisplacedRecord { id: NodeId, stored_in: usize, expected: usize },
    /// `bucket_index` field disagrees with the bucket holding the record.
    StaleBucketIndex { id: NodeId, recorded: usize, actual: usize },
    DuplicateRecord { id: NodeId },
    Overfull { bucket_index: usize, len: usize, k: usize },
    SelfEntry,
}

impl CorruptionIssue {
    /// Bucket the issue was found in.
    pub fn bucket(&self, local: &NodeId) -> usize {
        match self {
            CorruptionIssue::MisplacedRecord { stored_in, .. } => *stored_in,
            CorruptionIssue::StaleBucketIndex { actual, .. } => *actual,
            CorruptionIssue::DuplicateRecord { id } => local.shared_prefix_len(id).min(BUCKET_COUNT - 1),
            CorruptionIssue::Overfull { bucket_index, .. } => *bucket_index,
            CorruptionIssue::SelfEntry => BUCKET_COUNT - 1,
        }
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    freshness: Duration,
    buckets: Vec<RoutingBucket>,
    joins: u64,
    departures: u64,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize, freshness: Duration) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        for _ in 0..BUCKET_COUNT {
            buckets.push(RoutingBucket::new());
        }
        Self {
            local_id,
            k: k.max(1),
            freshness,
            buckets,
            joins: 0,
            departures: 0,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn bucket_index(&self, id: &NodeId) -> usize {
        self.local_id.shared_prefix_len(id).min(BUCKET_COUNT - 1)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_len(&self, idx: usize) -> usize {
        self.buckets.get(idx).map_or(0, |b| b.peers.len())
    }

    pub fn bucket_peers(&self, idx: usize) -> &[PeerRecord] {
        self.buckets.get(idx).map_or(&[], |b| b.peers.as_slice())
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerRecord> {
        if *id == self.local_id {
            return None;
        }
        let bucket = &self.buckets[self.bucket_index(id)];
        bucket.peers.iter().find(|p| &p.id == id)
    }

    pub fn insert(&mut self, mut peer: PeerRecord) -> InsertOutcome {
        if peer.id == self.local_id {
            return InsertOutcome::Ignored;
        }
        let idx = self.bucket_index(&peer.id);
        peer.bucket_index = idx;
        let k = self.k;
        let freshness = self.freshness;
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.position(&peer.id) {
            let mut existing = bucket.peers.remove(pos);
            existing.address = peer.address;
            existing.port = peer.port;
            existing.last_seen = existing.last_seen.max(peer.last_seen);
            existing.last_verified = existing.last_verified.max(peer.last_verified);
            if peer.tier.is_some() {
                existing.tier = peer.tier;
            }
            if !peer.roles.is_empty() {
                existing.roles = peer.roles;
            }
            bucket.peers.push(existing);
            return InsertOutcome::Updated;
        }

        if bucket.peers.len() < k {
            bucket.peers.push(peer);
            bucket.changes += 1;
            self.joins += 1;
            return InsertOutcome::Inserted;
        }

        if peer.is_fresh(freshness)
            && let Some(pos) = bucket.least_recently_verified_stale(freshness)
        {
            let evicted = bucket.peers.remove(pos);
            bucket.peers.push(peer);
            bucket.changes += 2;
            self.joins += 1;
            self.departures += 1;
            return InsertOutcome::Replaced { evicted };
        }

        let candidate = bucket
            .least_recently_verified()
            .map(|pos| bucket.peers[pos].clone())
            .unwrap_or_else(|| peer.clone());
        InsertOutcome::Rejected(BucketFull {
            bucket_index: idx,
            eviction_candidate: candidate,
            incoming: peer,
        })
    }

    /// Up to `count` records ordered by XOR distance to `target`.
    pub fn closest_to(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        closest_among(self.buckets.iter().flat_map(|b| b.peers.iter()), target, count)
    }

    pub fn evict(&mut self, id: &NodeId) -> Option<PeerRecord> {
        if *id == self.local_id {
            return None;
        }
        let idx = self.bucket_index(id);
        let removed = self.buckets[idx].remove(id);
        if removed.is_some() {
            self.departures += 1;
        }
        removed
    }

    /// Record a successful direct exchange with `id`.
    pub fn mark_verified(&mut self, id: &NodeId) -> bool {
        if *id == self.local_id {
            return false;
        }
        let idx = self.bucket_index(id);
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.position(id) {
            let mut record = bucket.peers.remove(pos);
            let now = Instant::now();
            record.last_seen = now;
            record.last_verified = Some(now);
            bucket.peers.push(record);
            true
        } else {
            false
        }
    }

    pub fn set_health(&mut self, id: &NodeId, health: PeerHealth) -> bool {
        if *id == self.local_id {
            return false;
        }
        let idx = self.bucket_index(id);
        match self.buckets[idx].peers.iter_mut().find(|p| &p.id == id) {
            Some(record) => {
                record.health = health;
                true
            }
            None => false,
        }
    }

    /// Change bucket capacity. Shrinking drops least-recently-verified
    /// entries first; the dropped records are returned.
    pub fn set_k(&mut self, k: usize) -> Vec<PeerRecord> {
        self.k = k.max(1);
        let mut trimmed = Vec::new();
        for bucket in &mut self.buckets {
            while bucket.peers.len() > self.k {
                let Some(pos) = bucket.least_recently_verified() else {
                    break;
                };
                trimmed.push(bucket.peers.remove(pos));
                bucket.changes += 1;
            }
        }
        self.departures += trimmed.len() as u64;
        trimmed
    }

    /// Resolve a ping challenge raised by [`InsertOutcome::Rejected`].
    ///
    /// A live candidate is refreshed and the newcomer dropped. A dead one is
    /// removed and the newcomer takes its place if there is room.
    pub fn apply_challenge(&mut self, challenge: BucketFull, candidate_alive: bool) -> Option<PeerRecord> {
        let bucket = &mut self.buckets[challenge.bucket_index];
        let candidate_id = challenge.eviction_candidate.id;
        if candidate_alive {
            if let Some(pos) = bucket.position(&candidate_id) {
                let mut record = bucket.peers.remove(pos);
                let now = Instant::now();
                record.last_seen = now;
                record.last_verified = Some(now);
                bucket.peers.push(record);
            }
            return None;
        }

        let evicted = bucket.remove(&candidate_id);
        if evicted.is_some() {
            self.departures += 1;
        }
        let already_present = bucket.position(&challenge.incoming.id).is_some();
        if !already_present && bucket.peers.len() < self.k {
            let mut incoming = challenge.incoming;
            incoming.bucket_index = challenge.bucket_index;
            bucket.peers.push(incoming);
            bucket.changes += 1;
            self.joins += 1;
        }
        evicted
    }

    pub fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.peers.is_empty() && bucket.last_refreshed.elapsed() > threshold)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.last_refreshed = Instant::now();
        }
    }

    /// Check every structural invariant of the table.
    pub fn validate(&self) -> Vec<CorruptionIssue> {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();
        for (idx, bucket) in self.buckets.iter().enumerate() {
            if bucket.peers.len() > self.k {
                issues.push(CorruptionIssue::Overfull {
                    bucket_index: idx,
                    len: bucket.peers.len(),
                    k: self.k,
                });
            }
            for peer in &bucket.peers {
                if peer.id == self.local_id {
                    issues.push(CorruptionIssue::SelfEntry);
                    continue;
                }
                if !seen.insert(peer.id) {
                    issues.push(CorruptionIssue::DuplicateRecord { id: peer.id });
                }
                let expected = self.bucket_index(&peer.id);
                if expected != idx {
                    issues.push(CorruptionIssue::MisplacedRecord {
                        id: peer.id,
                        stored_in: idx,
                        expected,
                    });
                } else if peer.bucket_index != idx {
                    issues.push(CorruptionIssue::StaleBucketIndex {
                        id: peer.id,
                        recorded: peer.bucket_index,
                        actual: idx,
                    });
                }
            }
        }
        issues
    }

    /// Rebuild the bucket array from the current records, dropping
    /// duplicates, self entries and overflow. Returns the number of records
    /// that were moved or dropped.
    pub fn repair(&mut self) -> usize {
        let mut records: Vec<PeerRecord> = Vec::with_capacity(self.len());
        let mut stamps = Vec::with_capacity(BUCKET_COUNT);
        for bucket in &mut self.buckets {
            stamps.push(bucket.last_refreshed);
            records.append(&mut bucket.peers);
        }

        let mut touched = 0;
        let mut seen = HashSet::new();
        for mut record in records {
            if record.id == self.local_id || !seen.insert(record.id) {
                touched += 1;
                continue;
            }
            let idx = self.bucket_index(&record.id);
            if record.bucket_index != idx {
                record.bucket_index = idx;
                touched += 1;
            }
            let bucket = &mut self.buckets[idx];
            if bucket.peers.len() < self.k {
                bucket.peers.push(record);
            } else {
                touched += 1;
                self.departures += 1;
            }
        }
        for (bucket, stamp) in self.buckets.iter_mut().zip(stamps) {
            bucket.last_refreshed = stamp;
            bucket.changes += 1;
        }
        touched
    }

    pub fn snapshot(&self) -> RoutingSnapshot {
        RoutingSnapshot {
            local_id: self.local_id,
            k: self.k,
            buckets: self
                .buckets
                .iter()
                .enumerate()
                .filter(|(_, b)| !b.peers.is_empty() || b.changes > 0)
                .map(|(index, b)| BucketView {
                    index,
                    peers: b.peers.clone(),
                    last_refreshed: b.last_refreshed,
                    changes: b.changes,
                })
                .collect(),
            joins: self.joins,
            departures: self.departures,
            taken_at: Instant::now(),
        }
    }

    #[cfg(test)]
    pub(crate) fn force_into_bucket(&mut self, bucket_idx: usize, peer: PeerRecord) {
        self.buckets[bucket_idx].peers.push(peer);
    }
}

/// The `count` peers nearest `target`, nearest first.
fn closest_among<'a>(
    peers: impl Iterator<Item = &'a PeerRecord>,
    target: &NodeId,
    count: usize,
) -> Vec<PeerRecord> {
    fn by_distance(a: &(Distance, &PeerRecord), b: &(Distance, &PeerRecord)) -> std::cmp::Ordering {
        distance_cmp(&a.0, &b.0)
    }

    let mut ranked: Vec<(Distance, &PeerRecord)> = peers.map(|p| (p.id.xor_distance(target), p)).collect();
    if count < ranked.len() {
        ranked.select_nth_unstable_by(count, by_distance);
        ranked.truncate(count);
    }
    ranked.sort_unstable_by(by_distance);
    ranked.into_iter().map(|(_, p)| p.clone()).collect()
}

/// Read-only copy of one bucket.
#[derive(Debug, Clone)]
pub struct BucketView {
    pub index: usize,
    pub peers: Vec<PeerRecord>,
    pub last_refreshed: Instant,
    /// Cumulative membership changes since the table was created.
    pub changes: u64,
}

/// Immutable view of the routing table published after every mutation.
///
/// Only buckets that hold peers or have ever changed are included.
#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    pub local_id: NodeId,
    pub k: usize,
    pub buckets: Vec<BucketView>,
    /// Cumulative inserts.
    pub joins: u64,
    /// Cumulative removals.
    pub departures: u64,
    pub taken_at: Instant,
}

impl RoutingSnapshot {
    pub fn empty(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            k,
            buckets: Vec::new(),
            joins: 0,
            departures: 0,
            taken_at: Instant::now(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.buckets.iter().flat_map(|b| b.peers.iter())
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerRecord> {
        let idx = self.local_id.shared_prefix_len(id);
        self.buckets
            .iter()
            .find(|b| b.index == idx)
            .and_then(|b| b.peers.iter().find(|p| &p.id == id))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn bucket(&self, idx: usize) -> Option<&BucketView> {
        self.buckets.iter().find(|b| b.index == idx)
    }

    pub fn closest_to(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        closest_among(self.peers(), target, count)
    }

    /// Indices of buckets currently holding at least one peer.
    pub fn active_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .filter(|b| !b.peers.is_empty())
            .map(|b| b.index)
            .collect()
    }

    /// Fraction of buckets up to the deepest populated one that hold peers.
    /// Zero for an empty table.
    pub fn bucket_coverage_ratio(&self) -> f64 {
        let active = self.active_buckets();
        match active.iter().max() {
            Some(deepest) => active.len() as f64 / (*deepest + 1) as f64,
            None => 0.0,
        }
    }

    /// Network size estimate: known peers scaled up by the share of the
    /// expected bucket range we have not populated. Falls back to the raw
    /// count when coverage is zero.
    pub fn estimated_network_size(&self) -> usize {
        let count = self.node_count();
        let coverage = self.bucket_coverage_ratio();
        if coverage <= f64::EPSILON {
            return count;
        }
        (count as f64 / coverage).round() as usize
    }

    pub fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .filter(|b| !b.peers.is_empty() && b.last_refreshed.elapsed() > threshold)
            .map(|b| b.index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{random_id_in_bucket, ID_LEN};

    fn peer(id: NodeId) -> PeerRecord {
        PeerRecord::new(id, "127.0.0.1", 7000)
    }

    fn table(k: usize) -> RoutingTable {
        RoutingTable::new(NodeId::random(), k, Duration::from_secs(60))
    }

    #[test]
    fn bucket_index_matches_shared_prefix() {
        let mut rt = table(20);
        let local = rt.local_id();
        for _ in 0..200 {
            rt.insert(peer(NodeId::random()));
        }
        for bucket in 0..BUCKET_COUNT {
            for record in rt.bucket_peers(bucket) {
                assert_eq!(record.bucket_index, local.shared_prefix_len(&record.id));
                assert_eq!(record.bucket_index, bucket);
            }
        }
        assert!(rt.validate().is_empty());
    }

    #[test]
    fn insert_then_closest_returns_the_record() {
        let mut rt = table(100);
        for _ in 0..50 {
            rt.insert(peer(NodeId::random()));
        }
        let id = NodeId::random();
        assert!(matches!(rt.insert(peer(id)), InsertOutcome::Inserted));
        let closest = rt.closest_to(&id, 1);
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].id, id);
    }

    #[test]
    fn self_is_never_stored() {
        let mut rt = table(20);
        let local = rt.local_id();
        assert!(matches!(rt.insert(peer(local)), InsertOutcome::Ignored));
        assert!(rt.is_empty());
    }

    #[test]
    fn reinsert_updates_and_moves_to_tail() {
        let mut rt = table(20);
        let local = rt.local_id();
        let a = random_id_in_bucket(&local, 3);
        let b = random_id_in_bucket(&local, 3);
        rt.insert(peer(a));
        rt.insert(peer(b));
        assert!(matches!(rt.insert(peer(a).verified()), InsertOutcome::Updated));
        let bucket = rt.bucket_peers(3);
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket[1].id, a);
        assert!(bucket[1].last_verified.is_some());
    }

    #[test]
    fn full_bucket_evicts_stale_unverified_for_fresh_peer() {
        let mut rt = table(20);
        let local = rt.local_id();
        for _ in 0..20 {
            let out = rt.insert(peer(random_id_in_bucket(&local, 5)));
            assert!(matches!(out, InsertOutcome::Inserted));
        }
        assert_eq!(rt.bucket_len(5), 20);

        let newcomer = peer(random_id_in_bucket(&local, 5)).verified();
        let newcomer_id = newcomer.id;
        match rt.insert(newcomer) {
            InsertOutcome::Replaced { evicted } => assert!(evicted.last_verified.is_none()),
            other => panic!("expected replacement, got {other:?}"),
        }
        assert_eq!(rt.bucket_len(5), 20);
        assert!(rt.get(&newcomer_id).is_some());
    }

    #[test]
    fn full_bucket_rejects_unverified_peer() {
        let mut rt = table(4);
        let local = rt.local_id();
        for _ in 0..4 {
            rt.insert(peer(random_id_in_bucket(&local, 2)));
        }
        let outcome = rt.insert(peer(random_id_in_bucket(&local, 2)));
        match outcome {
            InsertOutcome::Rejected(full) => {
                assert_eq!(full.bucket_index, 2);
                assert!(rt.get(&full.eviction_candidate.id).is_some());
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(rt.bucket_len(2), 4);
    }

    #[test]
    fn verified_entries_are_never_displaced() {
        let mut rt = table(3);
        let local = rt.local_id();
        for _ in 0..3 {
            rt.insert(peer(random_id_in_bucket(&local, 9)).verified());
        }
        let outcome = rt.insert(peer(random_id_in_bucket(&local, 9)).verified());
        assert!(matches!(outcome, InsertOutcome::Rejected(_)));
        assert_eq!(rt.bucket_len(9), 3);
    }

    #[test]
    fn challenge_with_dead_candidate_admits_newcomer() {
        let mut rt = table(2);
        let local = rt.local_id();
        rt.insert(peer(random_id_in_bucket(&local, 1)));
        rt.insert(peer(random_id_in_bucket(&local, 1)));
        let InsertOutcome::Rejected(full) = rt.insert(peer(random_id_in_bucket(&local, 1))) else {
            panic!("bucket should be full");
        };
        let candidate = full.eviction_candidate.id;
        let incoming = full.incoming.id;

        let evicted = rt.apply_challenge(full, false);
        assert_eq!(evicted.map(|p| p.id), Some(candidate));
        assert!(rt.get(&incoming).is_some());
        assert!(rt.get(&candidate).is_none());
        assert_eq!(rt.bucket_len(1), 2);
    }

    #[test]
    fn challenge_with_live_candidate_keeps_bucket() {
        let mut rt = table(1);
        let local = rt.local_id();
        rt.insert(peer(random_id_in_bucket(&local, 0)));
        let InsertOutcome::Rejected(full) = rt.insert(peer(random_id_in_bucket(&local, 0))) else {
            panic!("bucket should be full");
        };
        let candidate = full.eviction_candidate.id;
        assert!(rt.apply_challenge(full, true).is_none());
        assert!(rt.get(&candidate).unwrap().last_verified.is_some());
        assert_eq!(rt.bucket_len(0), 1);
    }

    #[test]
    fn shrinking_k_trims_every_bucket() {
        let mut rt = table(10);
        let local = rt.local_id();
        for _ in 0..10 {
            rt.insert(peer(random_id_in_bucket(&local, 0)));
        }
        let trimmed = rt.set_k(4);
        assert_eq!(trimmed.len(), 6);
        assert_eq!(rt.bucket_len(0), 4);
    }

    #[test]
    fn closest_is_sorted_by_distance() {
        let mut rt = table(20);
        for _ in 0..100 {
            rt.insert(peer(NodeId::random()));
        }
        let target = NodeId::random();
        let closest = rt.closest_to(&target, 10);
        assert_eq!(closest.len(), 10);
        for pair in closest.windows(2) {
            let a = pair[0].id.xor_distance(&target);
            let b = pair[1].id.xor_distance(&target);
            assert_ne!(distance_cmp(&a, &b), std::cmp::Ordering::Greater);
        }
    }

    #[test]
    fn closest_matches_full_sort() {
        let mut rt = table(20);
        for _ in 0..80 {
            rt.insert(peer(NodeId::random()));
        }
        let target = NodeId::random();
        let mut all: Vec<PeerRecord> = rt.closest_to(&target, usize::MAX);
        assert_eq!(all.len(), rt.len());
        all.sort_by(|a, b| distance_cmp(&a.id.xor_distance(&target), &b.id.xor_distance(&target)));
        let top: Vec<NodeId> = rt.closest_to(&target, 7).iter().map(|p| p.id).collect();
        let expected: Vec<NodeId> = all.iter().take(7).map(|p| p.id).collect();
        assert_eq!(top, expected);
        assert!(rt.closest_to(&target, 0).is_empty());
    }

    #[test]
    fn validate_detects_and_repair_fixes_misplaced_records() {
        let mut rt = table(20);
        let local = rt.local_id();
        let mut misplaced = peer(random_id_in_bucket(&local, 4));
        misplaced.bucket_index = 11;
        rt.force_into_bucket(11, misplaced.clone());

        let issues = rt.validate();
        assert_eq!(issues.len(), 1);
        assert!(matches!(issues[0], CorruptionIssue::MisplacedRecord { expected: 4, stored_in: 11, .. }));

        assert_eq!(rt.repair(), 1);
        assert!(rt.validate().is_empty());
        assert_eq!(rt.get(&misplaced.id).map(|p| p.bucket_index), Some(4));
    }

    #[test]
    fn snapshot_estimates_size_from_coverage() {
        let mut bytes = [0u8; ID_LEN];
        bytes[ID_LEN - 1] = 1;
        let local = NodeId::from_bytes(bytes);
        let mut rt = RoutingTable::new(local, 20, Duration::from_secs(60));
        // Buckets 0 and 3 populated: coverage 2 / 4.
        for _ in 0..6 {
            rt.insert(peer(random_id_in_bucket(&local, 0)));
        }
        for _ in 0..2 {
            rt.insert(peer(random_id_in_bucket(&local, 3)));
        }
        let snapshot = rt.snapshot();
        assert_eq!(snapshot.node_count(), 8);
        assert!((snapshot.bucket_coverage_ratio() - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.estimated_network_size(), 16);

        let empty = RoutingTable::new(local, 20, Duration::from_secs(60)).snapshot();
        assert_eq!(empty.estimated_network_size(), 0);
    }
}
