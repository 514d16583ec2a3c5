//! First-wins duplicate suppression over `(origin, seqno)`.
//!
//! Every frame identity passes through here exactly once before forwarding,
//! local delivery or storage. The cache is bounded two ways: entries expire
//! after a TTL comfortably longer than mesh propagation, and when capacity
//! is reached the oldest insertion is evicted so a seqno flood cannot grow
//! memory without limit.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use qmesh_codec::NodeId;

/// Identity of a frame: origin plus per-origin seqno.
pub type FrameKey = (NodeId, u32);

/// Bounded, expiring membership set.
#[derive(Debug)]
pub struct DedupCache {
    seen: HashMap<FrameKey, Instant>,
    order: VecDeque<FrameKey>,
    capacity: usize,
    ttl: Duration,
}

impl DedupCache {
    /// Build a cache holding at most `capacity` keys for at most `ttl`.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        DedupCache {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Atomically test and record a key. Returns true when the key was
    /// already present; false means this call inserted it.
    pub fn seen_or_insert(&mut self, key: FrameKey) -> bool {
        self.seen_or_insert_at(key, Instant::now())
    }

    /// Test-and-record with an explicit clock.
    pub fn seen_or_insert_at(&mut self, key: FrameKey, now: Instant) -> bool {
        self.expire_front(now);
        if self.seen.contains_key(&key) {
            // First wins; the original insertion timestamp stands.
            return true;
        }
        if self.seen.len() >= self.capacity {
            self.evict_oldest();
        }
        self.seen.insert(key, now);
        self.order.push_back(key);
        false
    }

    /// Drop every expired entry.
    pub fn sweep(&mut self, now: Instant) {
        self.expire_front(now);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn expire_front(&mut self, now: Instant) {
        while let Some(oldest) = self.order.front() {
            match self.seen.get(oldest) {
                Some(inserted) if now.duration_since(*inserted) >= self.ttl => {
                    let key = *oldest;
                    self.order.pop_front();
                    self.seen.remove(&key);
                }
                Some(_) => break,
                // Key already evicted; discard the stale order entry.
                None => {
                    self.order.pop_front();
                }
            }
        }
    }

    fn evict_oldest(&mut self) {
        while let Some(key) = self.order.pop_front() {
            if self.seen.remove(&key).is_some() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(origin: &str, seqno: u32) -> FrameKey {
        (NodeId::from_callsign(origin).unwrap(), seqno)
    }

    #[test]
    fn test_first_wins() {
        let mut cache = DedupCache::new(16, Duration::from_secs(30));
        assert!(!cache.seen_or_insert(key("NOCALL-1", 1)));
        assert!(cache.seen_or_insert(key("NOCALL-1", 1)));
        assert!(!cache.seen_or_insert(key("NOCALL-1", 2)));
        assert!(!cache.seen_or_insert(key("KD9YQK-1", 1)));
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let mut cache = DedupCache::new(3, Duration::from_secs(3600));
        for seqno in 1..=3 {
            cache.seen_or_insert(key("NOCALL-1", seqno));
        }
        cache.seen_or_insert(key("NOCALL-1", 4));

        assert_eq!(cache.len(), 3);
        // Seqno 1 was oldest and must be gone; a re-offer inserts fresh.
        assert!(!cache.seen_or_insert(key("NOCALL-1", 1)));
        // 3 and 4 survived the eviction round.
        assert!(cache.seen_or_insert(key("NOCALL-1", 3)));
        assert!(cache.seen_or_insert(key("NOCALL-1", 4)));
    }

    #[test]
    fn test_ttl_expiry_on_insert() {
        let mut cache = DedupCache::new(16, Duration::from_secs(30));
        let t0 = Instant::now();
        cache.seen_or_insert_at(key("NOCALL-1", 1), t0);

        let later = t0 + Duration::from_secs(31);
        // Expired entries vanish lazily, so the old key reads as unseen.
        assert!(!cache.seen_or_insert_at(key("NOCALL-1", 1), later));
    }

    #[test]
    fn test_sweep_removes_expired_only() {
        let mut cache = DedupCache::new(16, Duration::from_secs(30));
        let t0 = Instant::now();
        cache.seen_or_insert_at(key("NOCALL-1", 1), t0);
        cache.seen_or_insert_at(key("NOCALL-1", 2), t0 + Duration::from_secs(20));

        cache.sweep(t0 + Duration::from_secs(35));
        assert_eq!(cache.len(), 1);
        assert!(cache.seen_or_insert_at(key("NOCALL-1", 2), t0 + Duration::from_secs(36)));
    }

    #[test]
    fn test_flood_stays_bounded() {
        let mut cache = DedupCache::new(100, Duration::from_secs(3600));
        for seqno in 0..10_000 {
            cache.seen_or_insert(key("FLOOD-1", seqno));
        }
        assert_eq!(cache.len(), 100);
    }
}
