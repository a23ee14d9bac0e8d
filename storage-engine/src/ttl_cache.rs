use crate::compression::{compress, decompress};
use async_trait::async_trait;
use bulwark::domain::response::{DeleteResponse, PutResponse};
use bulwark::domain::{CacheStats, Lookup};
use bulwark::ports::CacheStore;
use bytes::Bytes;
use parking_lot::Mutex;
use shared::Result;
use shared::config::CacheConfig;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Longest lifetime an entry can get; larger TTLs (up to `Duration::MAX`)
/// mean "keep until evicted" and are capped here.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// One stored value plus its lifetime bookkeeping.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: String,
    /// Stored form; compressed when `compressed` is set.
    pub value: Bytes,
    pub compressed: bool,
    pub size_bytes: usize,
    pub created_at: Instant,
    pub refresh_after: Instant,
    pub expires_at: Instant,
}

struct Slot {
    entry: CacheEntry,
    last_access: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, Slot>,
    // Access log, oldest first. Pairs whose tick no longer matches the slot
    // are skipped on eviction and dropped on compaction.
    recency: VecDeque<(u64, String)>,
    tick: u64,
    refreshing: HashSet<String>,
    stored_bytes: usize,
    compressed_entries: usize,
    hits: u64,
    stale_hits: u64,
    misses: u64,
    expirations: u64,
    evictions: u64,
}

impl CacheInner {
    fn touch(&mut self, key: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(slot) = self.entries.get_mut(key) {
            slot.last_access = tick;
            self.recency.push_back((tick, key.to_string()));
        }
        if self.recency.len() > 2 * self.entries.len() + 32 {
            let entries = &self.entries;
            self.recency
                .retain(|(tick, key)| entries.get(key).is_some_and(|slot| slot.last_access == *tick));
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.refreshing.remove(key);
        self.stored_bytes -= slot.entry.size_bytes;
        if slot.entry.compressed {
            self.compressed_entries -= 1;
        }
        Some(slot.entry)
    }

    /// Drop the least recently accessed entry.
    fn evict_lru(&mut self) -> Option<String> {
        while let Some((tick, key)) = self.recency.pop_front() {
            let current = self
                .entries
                .get(&key)
                .is_some_and(|slot| slot.last_access == tick);
            if current {
                self.remove(&key);
                self.evictions += 1;
                return Some(key);
            }
        }
        None
    }
}

/// In-memory cache with per-entry TTL, least-recently-accessed eviction,
/// refresh claims and optional gzip compression of large values.
///
/// Expired entries are purged lazily when read; there is no sweeper task.
pub struct TtlCache {
    name: String,
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl TtlCache {
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            inner: Mutex::new(CacheInner::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored entry metadata without touching recency or statistics.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|slot| slot.entry.clone())
    }

    pub fn lookup(&self, key: &str) -> Result<Lookup> {
        let now = Instant::now();
        let (stored, compressed, stale, refresh) = {
            let mut inner = self.inner.lock();
            let Some(slot) = inner.entries.get(key) else {
                inner.misses += 1;
                return Ok(Lookup::Miss);
            };

            if now >= slot.entry.expires_at {
                inner.remove(key);
                inner.expirations += 1;
                inner.misses += 1;
                debug!(cache = %self.name, key, "Entry expired");
                return Ok(Lookup::Miss);
            }

            let stale = now >= slot.entry.refresh_after;
            let stored = slot.entry.value.clone();
            let compressed = slot.entry.compressed;
            inner.touch(key);

            let refresh = if stale {
                inner.stale_hits += 1;
                inner.refreshing.insert(key.to_string())
            } else {
                inner.hits += 1;
                false
            };
            (stored, compressed, stale, refresh)
        };

        let value = if compressed {
            match decompress(&stored) {
                Ok(value) => value,
                Err(err) => {
                    self.purge_corrupt(key, &stored);
                    return Err(err);
                }
            }
        } else {
            stored
        };
        if stale {
            Ok(Lookup::Stale { value, refresh })
        } else {
            Ok(Lookup::Hit(value))
        }
    }

    pub fn insert(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<PutResponse> {
        let ttl = ttl.unwrap_or(self.config.default_ttl).min(MAX_TTL);
        let compress_value =
            self.config.compression_enabled && value.len() >= self.config.compression_threshold_bytes;
        let (stored, compressed) = if compress_value {
            (compress(&value)?, true)
        } else {
            (value, false)
        };

        let created_at = Instant::now();
        let entry = CacheEntry {
            key: key.to_string(),
            size_bytes: stored.len(),
            value: stored,
            compressed,
            created_at,
            refresh_after: deadline(
                created_at,
                ttl.mul_f64(1.0 - self.config.background_refresh_threshold),
            ),
            expires_at: deadline(created_at, ttl),
        };

        let mut inner = self.inner.lock();
        let created = inner.remove(key).is_none();
        let mut evicted = 0;
        while inner.entries.len() >= self.config.max_size {
            match inner.evict_lru() {
                Some(victim) => {
                    debug!(cache = %self.name, key = %victim, "Evicted least recently used entry");
                    evicted += 1;
                }
                None => break,
            }
        }

        inner.stored_bytes += entry.size_bytes;
        if compressed {
            inner.compressed_entries += 1;
        }
        inner.entries.insert(
            key.to_string(),
            Slot {
                entry,
                last_access: 0,
            },
        );
        inner.touch(key);

        Ok(PutResponse::new(created, evicted, compressed))
    }

    /// Drop an entry whose stored bytes no longer decompress, unless it was
    /// overwritten meanwhile. Removal also releases its refresh claim.
    fn purge_corrupt(&self, key: &str, stored: &Bytes) {
        let mut inner = self.inner.lock();
        let same_entry = inner
            .entries
            .get(key)
            .is_some_and(|slot| slot.entry.value.as_ptr() == stored.as_ptr());
        if same_entry {
            inner.remove(key);
            warn!(cache = %self.name, key, "Purged entry that failed to decompress");
        }
    }

    pub fn remove(&self, key: &str) -> DeleteResponse {
        DeleteResponse::new(self.inner.lock().remove(key).is_some())
    }

    pub fn release_refresh_claim(&self, key: &str) {
        self.inner.lock().refreshing.remove(key);
    }

    pub fn snapshot_stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            stale_hits: inner.stale_hits,
            misses: inner.misses,
            expirations: inner.expirations,
            evictions: inner.evictions,
            entries: inner.entries.len(),
            compressed_entries: inner.compressed_entries,
            stored_bytes: inner.stored_bytes,
        }
    }
}

fn deadline(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .or_else(|| from.checked_add(MAX_TTL))
        .unwrap_or(from)
}

#[async_trait]
impl CacheStore for TtlCache {
    async fn get(&self, key: &str) -> Result<Lookup> {
        self.lookup(key)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<PutResponse> {
        self.insert(key, value, ttl)
    }

    async fn delete(&self, key: &str) -> Result<DeleteResponse> {
        Ok(self.remove(key))
    }

    async fn release_refresh(&self, key: &str) {
        self.release_refresh_claim(key);
    }

    fn stats(&self) -> CacheStats {
        self.snapshot_stats()
    }
}

impl Debug for TtlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TtlCache")
            .field("name", &self.name)
            .field("entries", &inner.entries.len())
            .field("stored_bytes", &inner.stored_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn config(max_size: usize) -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_millis(1000),
            max_size,
            background_refresh_threshold: 0.2,
            compression_enabled: true,
            compression_threshold_bytes: 1024,
        }
    }

    fn cache(max_size: usize) -> TtlCache {
        TtlCache::new("test", config(max_size)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_hit_then_miss() {
        let cache = cache(10);
        cache
            .insert("k", Bytes::from_static(b"v"), Some(Duration::from_millis(100)))
            .unwrap();

        advance(Duration::from_millis(50)).await;
        assert!(matches!(cache.lookup("k").unwrap(), Lookup::Hit(ref v) if v == "v"));

        advance(Duration::from_millis(100)).await;
        assert_eq!(cache.lookup("k").unwrap(), Lookup::Miss);

        // Purged on that access
        assert!(cache.is_empty());
        let stats = cache.snapshot_stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_window_hands_out_one_claim() {
        let cache = cache(10);
        cache.insert("k", Bytes::from_static(b"v"), None).unwrap();

        advance(Duration::from_millis(500)).await;
        assert!(matches!(cache.lookup("k").unwrap(), Lookup::Hit(_)));

        advance(Duration::from_millis(350)).await;
        assert_eq!(
            cache.lookup("k").unwrap(),
            Lookup::Stale {
                value: Bytes::from_static(b"v"),
                refresh: true
            }
        );

        advance(Duration::from_millis(10)).await;
        assert_eq!(
            cache.lookup("k").unwrap(),
            Lookup::Stale {
                value: Bytes::from_static(b"v"),
                refresh: false
            }
        );
        assert_eq!(cache.snapshot_stats().stale_hits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_claim_can_be_taken_again() {
        let cache = cache(10);
        cache.insert("k", Bytes::from_static(b"v"), None).unwrap();
        advance(Duration::from_millis(900)).await;

        assert!(matches!(cache.lookup("k").unwrap(), Lookup::Stale { refresh: true, .. }));
        cache.release_refresh_claim("k");
        assert!(matches!(cache.lookup("k").unwrap(), Lookup::Stale { refresh: true, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_resets_freshness_and_claim() {
        let cache = cache(10);
        cache.insert("k", Bytes::from_static(b"old"), None).unwrap();
        advance(Duration::from_millis(900)).await;
        assert!(matches!(cache.lookup("k").unwrap(), Lookup::Stale { refresh: true, .. }));

        let put = cache.insert("k", Bytes::from_static(b"new"), None).unwrap();
        assert!(!put.created);
        assert!(matches!(cache.lookup("k").unwrap(), Lookup::Hit(ref v) if v == "new"));

        advance(Duration::from_millis(850)).await;
        assert!(matches!(cache.lookup("k").unwrap(), Lookup::Stale { refresh: true, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_timeline_ordering() {
        let cache = cache(10);
        cache.insert("k", Bytes::from_static(b"v"), None).unwrap();

        let entry = cache.entry("k").unwrap();
        assert!(entry.created_at < entry.refresh_after);
        assert!(entry.refresh_after <= entry.expires_at);
        assert_eq!(entry.refresh_after - entry.created_at, Duration::from_millis(800));
        assert_eq!(entry.expires_at - entry.created_at, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_expires_immediately() {
        let cache = cache(10);
        cache
            .insert("k", Bytes::from_static(b"v"), Some(Duration::ZERO))
            .unwrap();
        assert_eq!(cache.lookup("k").unwrap(), Lookup::Miss);
    }

    #[test]
    fn test_evicts_least_recently_accessed() {
        let cache = cache(3);
        for key in ["a", "b", "c"] {
            let put = cache.insert(key, Bytes::from(key), None).unwrap();
            assert_eq!(put.evicted, 0);
        }

        // "a" becomes the most recently used, leaving "b" as the oldest
        assert!(matches!(cache.lookup("a").unwrap(), Lookup::Hit(_)));

        let put = cache.insert("d", Bytes::from_static(b"d"), None).unwrap();
        assert_eq!(put.evicted, 1);
        assert_eq!(cache.len(), 3);
        assert!(cache.entry("b").is_none());
        for key in ["a", "c", "d"] {
            assert!(cache.entry(key).is_some(), "{key} should survive");
        }
        assert_eq!(cache.snapshot_stats().evictions, 1);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = cache(2);
        cache.insert("a", Bytes::from_static(b"1"), None).unwrap();
        cache.insert("b", Bytes::from_static(b"2"), None).unwrap();

        let put = cache.insert("a", Bytes::from_static(b"3"), None).unwrap();
        assert_eq!(put.evicted, 0);
        assert_eq!(cache.len(), 2);

        // "b" is now the oldest
        cache.insert("c", Bytes::from_static(b"4"), None).unwrap();
        assert!(cache.entry("b").is_none());
        assert!(cache.entry("a").is_some());
    }

    #[test]
    fn test_recency_log_stays_bounded() {
        let cache = cache(4);
        cache.insert("hot", Bytes::from_static(b"v"), None).unwrap();
        for _ in 0..10_000 {
            cache.lookup("hot").unwrap();
        }
        assert!(cache.inner.lock().recency.len() <= 35);
    }

    #[test]
    fn test_large_values_are_compressed_and_roundtrip() {
        let cache = cache(4);
        let payload = Bytes::from("risk-data ".repeat(500));

        let put = cache.insert("big", payload.clone(), None).unwrap();
        assert!(put.compressed);

        let entry = cache.entry("big").unwrap();
        assert!(entry.compressed);
        assert!(entry.size_bytes < payload.len());

        match cache.lookup("big").unwrap() {
            Lookup::Hit(value) => assert_eq!(value, payload),
            other => panic!("expected hit, got {other:?}"),
        }
        let stats = cache.snapshot_stats();
        assert_eq!(stats.compressed_entries, 1);
        assert_eq!(stats.stored_bytes, entry.size_bytes);
    }

    #[test]
    fn test_small_or_disabled_values_are_stored_raw() {
        let cache = cache(4);
        assert!(!cache.insert("small", Bytes::from_static(b"tiny"), None).unwrap().compressed);

        let disabled = TtlCache::new(
            "plain",
            CacheConfig {
                compression_enabled: false,
                ..config(4)
            },
        )
        .unwrap();
        let put = disabled
            .insert("big", Bytes::from(vec![7u8; 4096]), None)
            .unwrap();
        assert!(!put.compressed);
        assert_eq!(disabled.entry("big").unwrap().size_bytes, 4096);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let cache = cache(4);
        cache.insert("k", Bytes::from_static(b"v"), None).unwrap();

        assert!(cache.remove("k").deleted);
        assert!(!cache.remove("k").deleted);
        assert_eq!(cache.lookup("k").unwrap(), Lookup::Miss);
        assert_eq!(cache.snapshot_stats().stored_bytes, 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = TtlCache::new(
            "bad",
            CacheConfig {
                background_refresh_threshold: 1.0,
                ..config(4)
            },
        );
        assert!(matches!(result, Err(shared::Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_never_expires() {
        let cache = cache(4);
        let put = cache
            .insert("k", Bytes::from_static(b"v"), Some(Duration::MAX))
            .unwrap();
        assert!(put.created);

        let entry = cache.entry("k").unwrap();
        assert!(entry.created_at < entry.refresh_after);
        assert!(entry.refresh_after <= entry.expires_at);

        advance(Duration::from_secs(365 * 24 * 60 * 60)).await;
        assert!(matches!(cache.lookup("k").unwrap(), Lookup::Hit(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_compressed_entry_is_purged_with_its_claim() {
        let cache = cache(4);
        cache.insert("k", Bytes::from(vec![b'x'; 4096]), None).unwrap();
        assert!(cache.entry("k").unwrap().compressed);
        cache.inner.lock().entries.get_mut("k").unwrap().entry.value =
            Bytes::from_static(b"not gzip");

        advance(Duration::from_millis(900)).await;
        let err = cache.lookup("k").unwrap_err();
        assert!(matches!(err, shared::Error::Codec(_)));

        assert!(cache.entry("k").is_none());
        assert!(cache.inner.lock().refreshing.is_empty());
        assert_eq!(cache.snapshot_stats().compressed_entries, 0);
        assert_eq!(cache.lookup("k").unwrap(), Lookup::Miss);
    }

    #[tokio::test]
    async fn test_cache_store_port() {
        let store: std::sync::Arc<dyn CacheStore> = std::sync::Arc::new(cache(4));

        let put = store.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        assert!(put.created);
        assert_eq!(store.get("k").await.unwrap(), Lookup::Hit(Bytes::from_static(b"v")));
        assert!(store.delete("k").await.unwrap().deleted);
        assert!(store.get("k").await.unwrap().is_miss());
        assert_eq!(store.stats().entries, 0);
    }
}
