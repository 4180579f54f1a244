//! Short-term cache of peers found by discovery.
//!
//! Entries expire after a TTL, become due for re-verification after a
//! shorter interval, and carry an availability score computed from hits
//! (successful verifications) and misses (failed ones). Capacity is bounded
//! by an LRU; the least recently used entry makes room for new ones.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::identity::{CapabilityFilter, NodeId, PeerHealth, PeerRecord};

#[derive(Debug, Clone)]
struct CachedPeer {
    record: PeerRecord,
    cached_at: Instant,
    last_verified: Instant,
    hits: u64,
    misses: u64,
    available: bool,
}

impl CachedPeer {
    fn availability(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            1.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub refreshes: u64,
    pub expired: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner {
    entries: LruCache<NodeId, CachedPeer>,
    stats: CacheStats,
}

pub struct PeerCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl PeerCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Insert or refresh a peer. Returns false if an existing entry was
    /// updated rather than a new one added.
    pub fn add(&self, record: PeerRecord) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let now = Instant::now();
        if let Some(existing) = inner.entries.get_mut(&record.id) {
            existing.record = record;
            existing.last_verified = now;
            existing.available = true;
            return false;
        }
        let id = record.id;
        let evicted = inner.entries.push(
            id,
            CachedPeer {
                record,
                cached_at: now,
                last_verified: now,
                hits: 0,
                misses: 0,
                available: true,
            },
        );
        if let Some((evicted_id, _)) = evicted
            && evicted_id != id
        {
            inner.stats.evictions += 1;
        }
        true
    }

    /// Live, unexpired entry for `id`. Counts as a hit or a miss.
    pub fn get(&self, id: &NodeId) -> Option<PeerRecord> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        let ttl = self.config.ttl;
        let state = inner
            .entries
            .get(id)
            .map(|entry| (entry.cached_at.elapsed() <= ttl, entry.record.clone()));
        let found = match state {
            Some((true, record)) => Some(record),
            Some((false, _)) => {
                inner.entries.pop(id);
                inner.stats.expired += 1;
                None
            }
            None => None,
        };
        if found.is_some() {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        found
    }

    /// Up to `count` available, unexpired peers matching `filter` whose
    /// availability is at least `min_availability`, best first.
    pub fn by_capabilities(&self, filter: &CapabilityFilter, count: usize, min_availability: f64) -> Vec<PeerRecord> {
        let Ok(mut inner) = self.inner.lock() else {
            return Vec::new();
        };
        let ttl = self.config.ttl;
        let mut matches: Vec<(f64, PeerRecord)> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.available && e.cached_at.elapsed() <= ttl)
            .filter(|(_, e)| e.availability() >= min_availability)
            .filter(|(_, e)| filter.matches(&e.record))
            .map(|(_, e)| (e.availability(), e.record.clone()))
            .collect();
        matches.sort_by(|a, b| b.0.total_cmp(&a.0));
        matches.truncate(count);
        if matches.is_empty() {
            inner.stats.misses += 1;
        } else {
            inner.stats.hits += matches.len() as u64;
        }
        matches.into_iter().map(|(_, r)| r).collect()
    }

    /// Feedback from a health probe or lookup.
    pub fn update_verification(&self, id: &NodeId, available: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            let updated = match inner.entries.peek_mut(id) {
                Some(entry) => {
                    entry.last_verified = Instant::now();
                    entry.available = available;
                    if available {
                        entry.hits += 1;
                        entry.record.health = PeerHealth::Healthy;
                    } else {
                        entry.misses += 1;
                        entry.record.health = PeerHealth::Unhealthy;
                    }
                    true
                }
                None => false,
            };
            if updated {
                inner.stats.refreshes += 1;
            }
        }
    }

    pub fn mark_unavailable(&self, id: &NodeId) {
        self.update_verification(id, false);
    }

    pub fn remove(&self, id: &NodeId) -> bool {
        self.inner
            .lock()
            .map(|mut inner| inner.entries.pop(id).is_some())
            .unwrap_or(false)
    }

    pub fn availability(&self, id: &NodeId) -> Option<f64> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.entries.peek(id).map(|e| e.availability()))
    }

    /// Entries whose last verification is older than the refresh interval.
    pub fn needing_refresh(&self) -> Vec<PeerRecord> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let interval = self.config.refresh_interval;
        inner
            .entries
            .iter()
            .filter(|(_, e)| e.last_verified.elapsed() > interval)
            .map(|(_, e)| e.record.clone())
            .collect()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let ttl = self.config.ttl;
        let expired: Vec<NodeId> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.cached_at.elapsed() > ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            inner.entries.pop(id);
        }
        inner.stats.expired += expired.len() as u64;
        if !expired.is_empty() {
            debug!(removed = expired.len(), remaining = inner.entries.len(), "peer cache cleanup");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner
            .lock()
            .map(|inner| CacheStats {
                size: inner.entries.len(),
                ..inner.stats
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Role, RoleSet};
    use tokio::time::Duration;

    fn cache(max_size: usize) -> PeerCache {
        PeerCache::new(CacheConfig {
            max_size,
            ..CacheConfig::default()
        })
    }

    fn peer_with(role: Role) -> PeerRecord {
        PeerRecord::new(NodeId::random(), "10.2.0.1", 7000).with_roles(RoleSet::empty().with(role))
    }

    #[test]
    fn capacity_is_bounded_with_lru_eviction() {
        let c = cache(3);
        let first = peer_with(Role::Meter);
        c.add(first.clone());
        for _ in 0..3 {
            c.add(peer_with(Role::Meter));
        }
        assert_eq!(c.len(), 3);
        assert_eq!(c.stats().evictions, 1);
        assert!(c.get(&first.id).is_none());
    }

    #[test]
    fn capability_query_filters_roles_and_availability() {
        let c = cache(100);
        let meter = peer_with(Role::Meter);
        let flaky = peer_with(Role::Meter);
        let collider = peer_with(Role::Collider);
        for p in [&meter, &flaky, &collider] {
            c.add(p.clone());
        }
        c.update_verification(&flaky.id, true);
        c.update_verification(&flaky.id, false);
        c.update_verification(&flaky.id, true);
        c.update_verification(&flaky.id, false);

        let filter = CapabilityFilter::with_roles(RoleSet::empty().with(Role::Meter));
        let found = c.by_capabilities(&filter, 10, 0.7);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, meter.id);
    }

    #[test]
    fn unavailable_peers_are_skipped() {
        let c = cache(10);
        let p = peer_with(Role::Polarizer);
        c.add(p.clone());
        c.mark_unavailable(&p.id);
        assert!(c.by_capabilities(&CapabilityFilter::any(), 10, 0.0).is_empty());
        assert_eq!(c.availability(&p.id), Some(0.0));

        c.add(p.clone());
        assert_eq!(c.by_capabilities(&CapabilityFilter::any(), 10, 0.0).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_cleaned_up() {
        let c = PeerCache::new(CacheConfig {
            ttl: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(5),
            ..CacheConfig::default()
        });
        let p = peer_with(Role::Meter);
        c.add(p.clone());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(c.needing_refresh().len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(c.get(&p.id).is_none());
        c.add(p);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(c.cleanup_expired(), 1);
        assert!(c.is_empty());
        assert!(c.stats().expired >= 2);
    }
}
