//! Bounded TTL cache with LRU eviction and dependency invalidation.
//!
//! Entries expire on a per-entry TTL and are swept lazily on access plus
//! periodically via a min-heap ordered by expiry, so a sweep never scans the
//! whole store. Capacity pressure (entry count or estimated bytes) evicts
//! the least-recently-accessed entry first. A reverse index from dependency
//! key to cache keys enables bulk invalidation. All reads and writes for the
//! store go through a single lock, keeping per-key access linearizable.

use crate::errors::PipelineError;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Configuration for the TTL cache.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction.
    pub max_entries: usize,
    /// Maximum estimated total bytes before LRU eviction.
    pub max_bytes: usize,
    /// Interval between background expiry sweeps, in ms.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_bytes: 8 * 1024 * 1024,
            sweep_interval_ms: 30_000,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: serde_json::Value,
    created_at: Instant,
    last_accessed_at: Instant,
    access_count: u64,
    expires_at: Instant,
    size_bytes: usize,
    dependencies: HashSet<String>,
    lru_tick: u64,
    generation: u64,
}

/// A snapshot of one cache entry for introspection.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheEntryStats {
    /// The cache key.
    pub key: String,
    /// Estimated serialized size.
    pub size_bytes: usize,
    /// Reads served since insertion.
    pub access_count: u64,
    /// Time since insertion.
    pub age: Duration,
    /// Time since the last read.
    pub idle: Duration,
    /// Remaining TTL, zero if already expired.
    pub expires_in: Duration,
    /// Dependency keys the entry is registered under.
    pub dependencies: usize,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ExpiryItem {
    expires_at: Instant,
    generation: u64,
    key: String,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// LRU index: access tick -> key. Ticks are unique and monotonic.
    lru_index: BTreeMap<u64, String>,
    /// Min-heap on expiry; stale items are skipped by generation check.
    expiry_heap: BinaryHeap<Reverse<ExpiryItem>>,
    /// Dependency key -> cache keys registered under it.
    reverse_deps: HashMap<String, HashSet<String>>,
    total_bytes: usize,
    tick: u64,
    generation: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.lru_index.remove(&entry.lru_tick);
            entry.lru_tick = tick;
            entry.last_accessed_at = Instant::now();
            entry.access_count += 1;
            self.lru_index.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.lru_index.remove(&entry.lru_tick);
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        for dep in &entry.dependencies {
            if let Some(keys) = self.reverse_deps.get_mut(dep) {
                keys.remove(key);
                if keys.is_empty() {
                    self.reverse_deps.remove(dep);
                }
            }
        }
        true
    }

    fn evict_lru(&mut self) -> Option<String> {
        let key = self.lru_index.iter().next().map(|(_, key)| key.clone())?;
        self.remove(&key);
        Some(key)
    }
}

/// A bounded, TTL-expiring, dependency-invalidated cache.
pub struct TtlCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    /// Per-key in-flight loader locks for `get_or_load` coalescing.
    inflight: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TtlCache {
    /// Creates a cache with the given configuration.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Looks up a value, returning a miss for absent or expired keys.
    ///
    /// Expired entries found here are removed immediately (lazy sweep).
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            None => return None,
            Some(entry) => entry.expires_at <= Instant::now(),
        };
        if expired {
            inner.remove(key);
            return None;
        }
        inner.touch(key);
        let entry = inner.entries.get(key)?;
        serde_json::from_value(entry.value.clone()).ok()
    }

    /// Stores a value under a TTL, registered against dependency keys.
    ///
    /// Overwrites any existing entry for the key. May trigger LRU eviction
    /// if the store exceeds its entry or byte budget.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration, dependencies: &[String]) {
        let Ok(value) = serde_json::to_value(value) else {
            return;
        };
        let size_bytes = value.to_string().len();
        let now = Instant::now();

        let mut inner = self.inner.lock();
        inner.remove(key);

        inner.generation += 1;
        let generation = inner.generation;
        let tick = inner.next_tick();

        let entry = CacheEntry {
            value,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            expires_at: now + ttl,
            size_bytes,
            dependencies: dependencies.iter().cloned().collect(),
            lru_tick: tick,
            generation,
        };

        inner.total_bytes += entry.size_bytes;
        inner.lru_index.insert(tick, key.to_string());
        inner.expiry_heap.push(Reverse(ExpiryItem {
            expires_at: entry.expires_at,
            generation,
            key: key.to_string(),
        }));
        for dep in dependencies {
            inner
                .reverse_deps
                .entry(dep.clone())
                .or_default()
                .insert(key.to_string());
        }
        inner.entries.insert(key.to_string(), entry);

        while inner.entries.len() > self.config.max_entries
            || inner.total_bytes > self.config.max_bytes
        {
            match inner.evict_lru() {
                Some(evicted) => debug!(key = %evicted, "Evicted cache entry under pressure"),
                None => break,
            }
        }
    }

    /// Removes a single entry. Returns true if it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove(key)
    }

    /// Removes every entry registered under a dependency key.
    ///
    /// Returns the number of entries removed and prunes the reverse index.
    pub fn invalidate_by_dependency(&self, dependency: &str) -> usize {
        let mut inner = self.inner.lock();
        let Some(keys) = inner.reverse_deps.remove(dependency) else {
            return 0;
        };
        let mut removed = 0;
        for key in keys {
            if inner.remove(&key) {
                removed += 1;
            }
        }
        debug!(dependency = %dependency, removed, "Invalidated cache entries by dependency");
        removed
    }

    /// Removes all entries whose TTL has elapsed. Returns the count removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut removed = 0;

        while let Some(Reverse(item)) = inner.expiry_heap.peek() {
            if item.expires_at > now {
                break;
            }
            let Some(Reverse(item)) = inner.expiry_heap.pop() else {
                break;
            };
            // Skip stale heap items left behind by overwrites or removals.
            let live = inner
                .entries
                .get(&item.key)
                .map_or(false, |entry| entry.generation == item.generation);
            if live && inner.remove(&item.key) {
                removed += 1;
            }
        }
        removed
    }

    /// Returns the cached value or runs the loader and caches its result.
    ///
    /// Concurrent loads for the same key are coalesced: one caller runs the
    /// loader while the rest wait and read the cached result.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        dependencies: &[String],
        loader: F,
    ) -> Result<T, PipelineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        if let Some(value) = self.get::<T>(key) {
            return Ok(value);
        }

        let key_lock = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = key_lock.lock().await;

        // A concurrent loader may have populated the key while we waited.
        if let Some(value) = self.get::<T>(key) {
            return Ok(value);
        }

        let loaded = loader().await;
        if let Ok(ref value) = loaded {
            self.set(key, value, ttl, dependencies);
        }

        let mut inflight = self.inflight.lock().await;
        if inflight
            .get(key)
            .map_or(false, |lock| Arc::strong_count(lock) <= 2)
        {
            inflight.remove(key);
        }

        loaded
    }

    /// Spawns a background task sweeping expired entries on an interval.
    #[must_use]
    pub fn spawn_sweeper(cache: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(cache.config.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!(removed, "Background cache sweep");
                }
            }
        })
    }

    /// Snapshots of all live entries, for dashboards and debugging.
    #[must_use]
    pub fn entry_stats(&self) -> Vec<CacheEntryStats> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|(key, entry)| CacheEntryStats {
                key: key.clone(),
                size_bytes: entry.size_bytes,
                access_count: entry.access_count,
                age: now.saturating_duration_since(entry.created_at),
                idle: now.saturating_duration_since(entry.last_accessed_at),
                expires_in: entry.expires_at.saturating_duration_since(now),
                dependencies: entry.dependencies.len(),
            })
            .collect()
    }

    /// Number of live entries (including not-yet-swept expired ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Estimated total bytes of all live entries.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }
}

impl std::fmt::Debug for TtlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("len", &self.len())
            .field("total_bytes", &self.total_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_cache(max_entries: usize) -> TtlCache {
        TtlCache::new(CacheConfig {
            max_entries,
            max_bytes: 1024 * 1024,
            sweep_interval_ms: 10,
        })
    }

    #[test]
    fn test_set_get_round_trip() {
        let cache = small_cache(16);
        cache.set("k1", &42_i64, Duration::from_secs(60), &[]);

        assert_eq!(cache.get::<i64>("k1"), Some(42));
        assert_eq!(cache.get::<i64>("missing"), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry_on_get() {
        let cache = small_cache(16);
        cache.set("k1", &"v".to_string(), Duration::from_millis(50), &[]);

        assert!(cache.get::<String>("k1").is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get::<String>("k1"), None);
        // Lazy sweep removed the entry.
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_expired_uses_heap() {
        let cache = small_cache(16);
        cache.set("short", &1_i64, Duration::from_millis(20), &[]);
        cache.set("long", &2_i64, Duration::from_secs(60), &[]);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let removed = cache.sweep_expired();

        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get::<i64>("long"), Some(2));
    }

    #[test]
    fn test_dependency_invalidation() {
        let cache = small_cache(16);
        cache.set(
            "k1",
            &"v1".to_string(),
            Duration::from_secs(1),
            &["d1".to_string()],
        );
        cache.set(
            "k2",
            &"v2".to_string(),
            Duration::from_secs(1),
            &["d1".to_string(), "d2".to_string()],
        );
        cache.set(
            "k3",
            &"v3".to_string(),
            Duration::from_secs(1),
            &["d2".to_string()],
        );

        assert_eq!(cache.invalidate_by_dependency("d1"), 2);
        assert_eq!(cache.get::<String>("k1"), None);
        assert_eq!(cache.get::<String>("k2"), None);
        assert_eq!(cache.get::<String>("k3"), Some("v3".to_string()));

        // Reverse index pruned: invalidating again removes nothing new.
        assert_eq!(cache.invalidate_by_dependency("d1"), 0);
        assert_eq!(cache.invalidate_by_dependency("d2"), 1);
    }

    #[test]
    fn test_single_dependency_invalidation_count() {
        let cache = small_cache(16);
        cache.set(
            "key",
            &"v".to_string(),
            Duration::from_millis(1000),
            &["d1".to_string()],
        );
        assert_eq!(cache.invalidate_by_dependency("d1"), 1);
    }

    #[test]
    fn test_lru_eviction_by_count() {
        let cache = small_cache(2);
        cache.set("a", &1_i64, Duration::from_secs(60), &[]);
        cache.set("b", &2_i64, Duration::from_secs(60), &[]);

        // Touch "a" so "b" becomes least recently accessed.
        assert_eq!(cache.get::<i64>("a"), Some(1));

        cache.set("c", &3_i64, Duration::from_secs(60), &[]);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get::<i64>("b"), None);
        assert_eq!(cache.get::<i64>("a"), Some(1));
        assert_eq!(cache.get::<i64>("c"), Some(3));
    }

    #[test]
    fn test_byte_pressure_eviction() {
        let cache = TtlCache::new(CacheConfig {
            max_entries: 100,
            max_bytes: 64,
            sweep_interval_ms: 1000,
        });

        let big = "x".repeat(40);
        cache.set("a", &big, Duration::from_secs(60), &[]);
        cache.set("b", &big, Duration::from_secs(60), &[]);

        // Both entries cannot fit under 64 bytes.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_overwrite_replaces_bytes() {
        let cache = small_cache(16);
        cache.set("k", &"aaaa".to_string(), Duration::from_secs(60), &[]);
        let bytes_first = cache.total_bytes();
        cache.set("k", &"bb".to_string(), Duration::from_secs(60), &[]);

        assert_eq!(cache.len(), 1);
        assert!(cache.total_bytes() < bytes_first);
    }

    #[tokio::test]
    async fn test_get_or_load_populates_on_miss() {
        let cache = small_cache(16);
        let loads = AtomicUsize::new(0);

        let value = cache
            .get_or_load("k", Duration::from_secs(60), &[], || {
                loads.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, PipelineError>(99_i64) }
            })
            .await
            .unwrap();
        assert_eq!(value, 99);
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        // Second call hits the cache.
        let value = cache
            .get_or_load("k", Duration::from_secs(60), &[], || {
                loads.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, PipelineError>(0_i64) }
            })
            .await
            .unwrap();
        assert_eq!(value, 99);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_load_coalesces_concurrent_loads() {
        let cache = Arc::new(small_cache(16));
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let loads = loads.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("k", Duration::from_secs(60), &[], || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, PipelineError>(7_i64)
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_load_error_not_cached() {
        let cache = small_cache(16);

        let result: Result<i64, _> = cache
            .get_or_load("k", Duration::from_secs(60), &[], || async {
                Err(PipelineError::transient("load", "boom"))
            })
            .await;
        assert!(result.is_err());

        let value = cache
            .get_or_load("k", Duration::from_secs(60), &[], || async {
                Ok::<_, PipelineError>(5_i64)
            })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[test]
    fn test_entry_stats_track_accesses() {
        let cache = small_cache(16);
        cache.set(
            "k",
            &"v".to_string(),
            Duration::from_secs(60),
            &["d1".to_string()],
        );

        assert_eq!(cache.get::<String>("k"), Some("v".to_string()));
        assert_eq!(cache.get::<String>("k"), Some("v".to_string()));

        let stats = cache.entry_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].key, "k");
        assert_eq!(stats[0].access_count, 2);
        assert_eq!(stats[0].dependencies, 1);
        assert!(stats[0].expires_in > Duration::from_secs(50));
        assert!(stats[0].idle <= stats[0].age);
    }

    #[tokio::test]
    async fn test_background_sweeper() {
        let cache = Arc::new(small_cache(16));
        cache.set("k", &1_i64, Duration::from_millis(20), &[]);

        let handle = TtlCache::spawn_sweeper(cache.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(cache.is_empty());
        handle.abort();
    }
}
