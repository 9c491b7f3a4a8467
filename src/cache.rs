//! Certificate cache with TTL expiry and LRU eviction
//!
//! Records are keyed by control number. An entry older than the configured
//! TTL is never returned; it is evicted lazily on read, or when a write
//! finds the cache full. When the cache is full of live entries the
//! least-recently-used one makes room for the new record.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::config::CacheConfig;

/// Thread-safe certificate cache
pub struct CertificateCache {
    /// Entries in recency order
    entries: Mutex<Entries>,
    /// Time-to-live applied to every entry
    ttl: Duration,
    /// Cache statistics
    stats: CacheStats,
}

/// LRU map plus a lower bound on the oldest insertion time
struct Entries {
    lru: LruCache<String, CacheEntry>,
    /// No entry is older than this. Exact after a sweep, possibly stale
    /// (too old) once the entry it came from is evicted.
    oldest: Option<Instant>,
}

impl Entries {
    /// Whether a sweep could find anything to drop
    fn may_have_expired(&self, ttl: Duration) -> bool {
        self.oldest.is_some_and(|oldest| oldest.elapsed() > ttl)
    }

    /// Drop expired entries and recompute `oldest` from the survivors
    fn purge_expired(&mut self, ttl: Duration) -> usize {
        let mut expired = Vec::new();
        let mut oldest: Option<Instant> = None;
        for (key, entry) in &self.lru {
            if entry.is_expired(ttl) {
                expired.push(key.clone());
            } else {
                oldest = Some(oldest.map_or(entry.inserted_at, |o| o.min(entry.inserted_at)));
            }
        }

        for key in &expired {
            self.lru.pop(key);
        }
        self.oldest = oldest;
        expired.len()
    }
}

/// A cached certificate record
struct CacheEntry {
    /// The upstream record
    value: Value,
    /// When this entry was stored
    inserted_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() > ttl
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    /// Live entries dropped to admit new ones
    evictions: AtomicU64,
    /// Entries dropped because their TTL elapsed
    expirations: AtomicU64,
}

impl CertificateCache {
    /// Create a cache from configuration
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_limits(config.max_entries, config.ttl)
    }

    /// Create a cache holding at most `max_entries` records for `ttl` each.
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn with_limits(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(Entries {
                lru: LruCache::new(capacity),
                oldest: None,
            }),
            ttl,
            stats: CacheStats::default(),
        }
    }

    /// Get a cached record if it exists and hasn't expired
    ///
    /// A hit marks the entry most-recently-used. Expired entries are evicted
    /// and reported as absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock();

        let expired = match entries.lru.get(key) {
            Some(entry) if !entry.is_expired(self.ttl) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.lru.pop(key);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            trace!(control_number = %key, "Cache entry expired");
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Read a live entry without touching recency or statistics
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .lru
            .peek(key)
            .filter(|entry| !entry.is_expired(self.ttl))
            .map(|entry| entry.value.clone())
    }

    /// Whether a live entry exists, without touching recency or statistics
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .lru
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(self.ttl))
    }

    /// Store a record, replacing any previous entry for `key`
    ///
    /// When the cache is full, expired entries are dropped first; if none
    /// were expired the least-recently-used entry is evicted. The sweep only
    /// runs once the oldest known insertion is past the TTL.
    pub fn set(&self, key: &str, value: Value) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
        };

        let mut entries = self.entries.lock();

        if !entries.lru.contains(key)
            && entries.lru.len() >= entries.lru.cap().get()
            && entries.may_have_expired(self.ttl)
        {
            let purged = entries.purge_expired(self.ttl);
            if purged > 0 {
                self.stats
                    .expirations
                    .fetch_add(purged as u64, Ordering::Relaxed);
            }
        }

        entries.oldest.get_or_insert(entry.inserted_at);
        if let Some((evicted, _)) = entries.lru.push(key.to_string(), entry) {
            // `push` also hands back the old value when replacing the same key
            if evicted != key {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(control_number = %evicted, "Evicted least-recently-used entry");
            }
        }
    }

    /// Evict expired entries (opportunistic maintenance)
    pub fn evict_expired(&self) {
        let purged = self.entries.lock().purge_expired(self.ttl);
        if purged > 0 {
            self.stats
                .expirations
                .fetch_add(purged as u64, Ordering::Relaxed);
        }
    }

    /// Number of stored entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.lock().lru.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.lock().lru.is_empty()
    }

    /// Clear all cached entries
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.lru.clear();
        entries.oldest = None;
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let entries = self.entries.lock();

        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        CacheStatsSnapshot {
            hits,
            misses,
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            size: entries.lru.len(),
            capacity: entries.lru.cap().get(),
            hit_rate,
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses (absent or expired)
    pub misses: u64,
    /// Live entries evicted to make room
    pub evictions: u64,
    /// Entries removed after their TTL elapsed
    pub expirations: u64,
    /// Current number of entries
    pub size: usize,
    /// Maximum number of entries
    pub capacity: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(max_entries: usize) -> CertificateCache {
        CertificateCache::with_limits(max_entries, Duration::from_secs(60))
    }

    #[test]
    fn test_cache_hit() {
        let cache = cache(10);
        let value = json!({"name": "Jane Doe", "id": "ABC123"});

        cache.set("ABC123", value.clone());

        assert_eq!(cache.get("ABC123"), Some(value));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn test_cache_miss() {
        let cache = cache(10);
        assert_eq!(cache.get("nonexistent"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_ttl_boundary() {
        let cache = CertificateCache::with_limits(10, Duration::from_millis(20));
        cache.set("key", json!({"v": 1}));

        assert_eq!(cache.get("key"), Some(json!({"v": 1})));

        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.get("key"), None);
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn test_overwrite_restamps_entry() {
        let cache = CertificateCache::with_limits(10, Duration::from_millis(60));
        cache.set("key", json!({"v": 1}));
        std::thread::sleep(Duration::from_millis(40));
        cache.set("key", json!({"v": 2}));
        std::thread::sleep(Duration::from_millis(40));

        // 80ms after the first write, 40ms after the second
        assert_eq!(cache.get("key"), Some(json!({"v": 2})));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let cache = cache(3);
        cache.set("a", json!({"v": "a"}));
        cache.set("b", json!({"v": "b"}));
        cache.set("c", json!({"v": "c"}));

        // Touch "a" so "b" becomes the least recently used
        assert!(cache.get("a").is_some());

        cache.set("d", json!({"v": "d"}));

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(json!({"v": "a"})));
        assert_eq!(cache.get("c"), Some(json!({"v": "c"})));
        assert_eq!(cache.get("d"), Some(json!({"v": "d"})));
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_capacity_plus_one_keeps_all_but_oldest() {
        let cache = cache(100);
        for i in 0..=100 {
            cache.set(&format!("key-{i}"), json!({ "i": i }));
        }

        assert_eq!(cache.len(), 100);
        assert_eq!(cache.get("key-0"), None);
        for i in 1..=100 {
            assert_eq!(cache.get(&format!("key-{i}")), Some(json!({ "i": i })));
        }
    }

    #[test]
    fn test_full_cache_drops_expired_before_live_entries() {
        let cache = CertificateCache::with_limits(2, Duration::from_millis(30));
        cache.set("old", json!(1));
        std::thread::sleep(Duration::from_millis(50));
        cache.set("fresh", json!(2));

        cache.set("new", json!(3));

        assert!(cache.contains("fresh"));
        assert!(cache.contains("new"));
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn test_full_cache_sweeps_only_once_oldest_entry_expires() {
        let cache = CertificateCache::with_limits(2, Duration::from_millis(30));
        cache.set("a", json!(1));
        cache.set("b", json!(2));
        assert!(!cache.entries.lock().may_have_expired(cache.ttl));

        // Full of live entries: plain LRU eviction, no sweep
        cache.set("c", json!(3));
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().expirations, 0);

        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.entries.lock().may_have_expired(cache.ttl));

        cache.set("d", json!(4));
        let stats = cache.stats();
        assert_eq!(stats.expirations, 2);
        assert_eq!(stats.size, 1);

        // The sweep left only "d", so the bound is exact again
        assert!(!cache.entries.lock().may_have_expired(cache.ttl));
    }

    #[test]
    fn test_contains_does_not_count() {
        let cache = cache(2);
        cache.set("a", json!(1));
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 0);
    }

    #[test]
    fn test_evict_expired() {
        let cache = CertificateCache::with_limits(10, Duration::from_millis(10));
        cache.set("short", json!(1));
        std::thread::sleep(Duration::from_millis(25));

        cache.evict_expired();

        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_hit_rate_and_clear() {
        let cache = cache(10);
        cache.set("key1", json!(1));
        cache.set("key2", json!(2));

        cache.get("key1");
        cache.get("key2");
        cache.get("key3");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.666).abs() < 0.01);

        cache.clear();
        assert_eq!(cache.stats().size, 0);
        assert_eq!(cache.get("key1"), None);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = cache(0);
        cache.set("a", json!(1));
        assert_eq!(cache.stats().capacity, 1);
        assert_eq!(cache.get("a"), Some(json!(1)));
    }
}
