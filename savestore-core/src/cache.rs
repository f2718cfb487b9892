/*!
TTL read cache with tag and dependency invalidation.

Entries carry a priority class, a set of tags and a set of dependencies. A
write that affects many reads invalidates them in one call by tag or by
dependency. The map is guarded by a synchronous mutex that is never held
across an await point, so a cache miss runs its producer unlocked.
*/

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::observability::{self, MetricEvent};
use crate::queue::Priority;
use crate::{DataError, Result};

/// Options attached to a cached value
#[derive(Debug, Clone, Default)]
pub struct CacheSetOptions {
    /// Overrides the configured default TTL
    pub ttl: Option<Duration>,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub dependencies: Vec<String>,
}

impl CacheSetOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_dependency<S: Into<String>>(mut self, dependency: S) -> Self {
        self.dependencies.push(dependency.into());
        self
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub hit_ratio: f64,
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    tags: HashSet<String>,
    dependencies: HashSet<String>,
    priority: Priority,
    last_access: u64,
}

/// A producer call in progress. Invalidations that would have removed the
/// entry mark the fill stale, and a stale fill is not stored.
struct PendingFill {
    key: String,
    tags: HashSet<String>,
    dependencies: HashSet<String>,
    stale: bool,
}

/// Drops the pending record of a fill whose caller stopped waiting
struct FillGuard<'a, V: Clone> {
    cache: &'a Cache<V>,
    fill_id: u64,
}

impl<V: Clone> Drop for FillGuard<'_, V> {
    fn drop(&mut self) {
        self.cache.lock().pending.remove(&self.fill_id);
    }
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    pending: HashMap<u64, PendingFill>,
    next_fill: u64,
    clock: u64,
}

impl<V> CacheState<V> {
    /// Remove entries and mark pending fills matching `predicate`
    fn invalidate_where<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&str, &HashSet<String>, &HashSet<String>) -> bool,
    {
        let before = self.entries.len();
        self.entries
            .retain(|key, entry| !predicate(key, &entry.tags, &entry.dependencies));
        for fill in self.pending.values_mut() {
            if predicate(&fill.key, &fill.tags, &fill.dependencies) {
                fill.stale = true;
            }
        }
        before - self.entries.len()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Read cache keyed by string
pub struct Cache<V = Value> {
    state: Mutex<CacheState<V>>,
    default_ttl: Duration,
    max_entries: usize,
    cleanup_on_access: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone> Cache<V> {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                pending: HashMap::new(),
                next_fill: 0,
                clock: 0,
            }),
            default_ttl: config.default_ttl(),
            max_entries: config.max_entries.max(1),
            cleanup_on_access: config.cleanup_on_access,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Return the cached value for `key`, or run `producer` and cache its
    /// output
    ///
    /// A producer error is returned to the caller and nothing is cached, so
    /// the next call runs the producer again.
    pub async fn get_or_set<F, Fut>(&self, key: &str, producer: F, options: CacheSetOptions) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let fill_id = {
            let mut state = self.lock();
            let id = state.next_fill;
            state.next_fill += 1;
            state.pending.insert(
                id,
                PendingFill {
                    key: key.to_string(),
                    tags: options.tags.iter().cloned().collect(),
                    dependencies: options.dependencies.iter().cloned().collect(),
                    stale: false,
                },
            );
            id
        };

        let guard = FillGuard { cache: self, fill_id };
        let produced = producer().await;

        let mut state = self.lock();
        let stale = state.pending.remove(&fill_id).map(|fill| fill.stale).unwrap_or(true);
        std::mem::forget(guard);
        let value = produced?;
        if stale {
            debug!(key, "discarding cache fill invalidated while loading");
        } else {
            self.insert_locked(&mut state, key, value.clone(), options);
        }
        Ok(value)
    }

    /// Look up an unexpired entry. Expired entries are dropped on access
    /// when `cleanup_on_access` is set.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut state = self.lock();
        let now = Instant::now();
        let tick = state.tick();

        let hit = match state.entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = tick;
                Some(entry.value.clone())
            }
            Some(_) => {
                if self.cleanup_on_access {
                    state.entries.remove(key);
                }
                trace!(key, "cache entry expired");
                None
            }
            None => None,
        };

        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            observability::record(MetricEvent::CacheHit);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            observability::record(MetricEvent::CacheMiss);
        }
        hit
    }

    /// Store a value directly
    pub fn set(&self, key: &str, value: V, options: CacheSetOptions) {
        let mut state = self.lock();
        self.insert_locked(&mut state, key, value, options);
    }

    pub fn contains(&self, key: &str) -> bool {
        let state = self.lock();
        state
            .entries
            .get(key)
            .map(|entry| entry.expires_at > Instant::now())
            .unwrap_or(false)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.lock().invalidate_where(|k, _, _| k == key) > 0
    }

    pub fn delete_many<S: AsRef<str>>(&self, keys: &[S]) -> usize {
        let keys: HashSet<&str> = keys.iter().map(|k| k.as_ref()).collect();
        self.lock().invalidate_where(|k, _, _| keys.contains(k))
    }

    /// Remove every entry carrying `tag`
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let removed = self.lock().invalidate_where(|_, tags, _| tags.contains(tag));
        debug!(tag, removed, "invalidated cache by tag");
        removed
    }

    /// Remove every entry that declared `dependency`
    pub fn invalidate_by_dependency(&self, dependency: &str) -> usize {
        let removed = self
            .lock()
            .invalidate_where(|_, _, deps| deps.contains(dependency));
        debug!(dependency, removed, "invalidated cache by dependency");
        removed
    }

    /// Remove every entry whose key matches a `*` glob
    pub fn invalidate_matching(&self, pattern: &str) -> Result<usize> {
        let regex = glob_to_regex(pattern)?;
        Ok(self.lock().invalidate_where(|k, _, _| regex.is_match(k)))
    }

    /// Keys of unexpired entries, sorted
    pub fn keys(&self) -> Vec<String> {
        let state = self.lock();
        let now = Instant::now();
        let mut keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn clear(&self) {
        self.lock().invalidate_where(|_, _, _| true);
    }

    /// Purge expired entries, returning how many were removed
    pub fn cleanup(&self) -> usize {
        let mut state = self.lock();
        let now = Instant::now();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.expires_at > now);
        before - state.entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.len(),
            hit_ratio: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }

    fn insert_locked(&self, state: &mut CacheState<V>, key: &str, value: V, options: CacheSetOptions) {
        let now = Instant::now();
        if !state.entries.contains_key(key) && state.entries.len() >= self.max_entries {
            state.entries.retain(|_, entry| entry.expires_at > now);
            while state.entries.len() >= self.max_entries {
                // Lowest priority first, then least recently accessed
                let victim = state
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| (entry.priority, entry.last_access))
                    .map(|(key, _)| key.clone());
                let Some(victim) = victim else { break };
                state.entries.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(key = %victim, "evicted cache entry");
            }
        }

        let tick = state.tick();
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + options.ttl.unwrap_or(self.default_ttl),
                tags: options.tags.into_iter().collect(),
                dependencies: options.dependencies.into_iter().collect(),
                priority: options.priority,
                last_access: tick,
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<V: Clone> Default for Cache<V> {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

/// Translate a `*` glob into an anchored regex; every other character
/// matches literally
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$"))
        .map_err(|e| DataError::validation(format!("invalid cache pattern '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn cache(max_entries: usize) -> Cache<i64> {
        Cache::new(&CacheConfig {
            default_ttl_ms: 60_000,
            max_entries,
            cleanup_on_access: true,
        })
    }

    async fn fill(cache: &Cache<i64>, key: &str, value: i64, calls: &AtomicUsize, options: CacheSetOptions) -> i64 {
        cache
            .get_or_set(
                key,
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(value)
                },
                options,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_or_set_runs_producer_once() {
        let cache = cache(10);
        let calls = AtomicUsize::new(0);

        assert_eq!(fill(&cache, "a", 1, &calls, CacheSetOptions::default()).await, 1);
        assert_eq!(fill(&cache, "a", 2, &calls, CacheSetOptions::default()).await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_producer_error_is_not_cached() {
        let cache = cache(10);
        let result = cache
            .get_or_set("a", || async { Err(DataError::storage("load", "a", "offline")) }, CacheSetOptions::default())
            .await;
        assert!(result.is_err());
        assert!(!cache.contains("a"));

        let calls = AtomicUsize::new(0);
        assert_eq!(fill(&cache, "a", 7, &calls, CacheSetOptions::default()).await, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_fill_leaves_no_pending_record() {
        let cache = cache(10);
        for _ in 0..20 {
            let slow = cache.get_or_set(
                "cache_stageLog_0",
                || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(1)
                },
                CacheSetOptions::default(),
            );
            assert!(tokio::time::timeout(Duration::from_millis(1), slow).await.is_err());
        }
        assert!(cache.lock().pending.is_empty());

        let value = cache
            .get_or_set("cache_stageLog_0", || async { Ok(2) }, CacheSetOptions::default())
            .await
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(cache.get("cache_stageLog_0"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = cache(10);
        let calls = AtomicUsize::new(0);
        let options = CacheSetOptions::default().with_ttl(Duration::from_secs(5));

        fill(&cache, "a", 1, &calls, options.clone()).await;
        tokio::time::advance(Duration::from_secs(4)).await;
        fill(&cache, "a", 1, &calls, options.clone()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        fill(&cache, "a", 1, &calls, options).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_kept_until_cleanup_when_access_cleanup_is_off() {
        let lazy: Cache<i64> = Cache::new(&CacheConfig {
            default_ttl_ms: 1_000,
            max_entries: 10,
            cleanup_on_access: false,
        });
        let eager = cache(10);
        let short = CacheSetOptions::default().with_ttl(Duration::from_secs(1));
        lazy.set("a", 1, short.clone());
        eager.set("a", 1, short);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(lazy.get("a"), None);
        assert_eq!(eager.get("a"), None);
        assert_eq!(lazy.len(), 1);
        assert_eq!(eager.len(), 0);

        assert_eq!(lazy.cleanup(), 1);
        assert!(lazy.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_by_dependency_and_tag() {
        let cache = cache(10);
        let calls = AtomicUsize::new(0);

        fill(&cache, "a", 1, &calls, CacheSetOptions::default().with_dependency("playerData")).await;
        fill(&cache, "b", 2, &calls, CacheSetOptions::default().with_tag("dataType:settings")).await;
        fill(&cache, "c", 3, &calls, CacheSetOptions::default()).await;

        assert_eq!(cache.invalidate_by_dependency("playerData"), 1);
        assert_eq!(cache.invalidate_by_tag("dataType:settings"), 1);
        assert_eq!(cache.keys(), vec!["c"]);

        fill(&cache, "a", 1, &calls, CacheSetOptions::default()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_invalidate_matching_glob() {
        let cache = cache(10);
        for key in ["cache_playerData_1", "cache_playerData_2", "cache_settings_1", "cache_player.Data"] {
            cache.set(key, 0, CacheSetOptions::default());
        }

        assert_eq!(cache.invalidate_matching("cache_playerData_*").unwrap(), 2);
        // '.' is literal, not a wildcard
        assert_eq!(cache.invalidate_matching("cache_playerXData").unwrap(), 0);
        assert_eq!(cache.keys(), vec!["cache_player.Data", "cache_settings_1"]);
    }

    #[test]
    fn test_glob_is_anchored() {
        let regex = glob_to_regex("cache_*_1").unwrap();
        assert!(regex.is_match("cache_settings_1"));
        assert!(!regex.is_match("xcache_settings_1"));
        assert!(!regex.is_match("cache_settings_10"));
    }

    #[tokio::test]
    async fn test_evicts_lowest_priority_then_oldest() {
        let cache = cache(3);
        cache.set("high", 1, CacheSetOptions::default().with_priority(Priority::High));
        cache.set("low_old", 2, CacheSetOptions::default().with_priority(Priority::Low));
        cache.set("low_new", 3, CacheSetOptions::default().with_priority(Priority::Low));

        cache.set("normal", 4, CacheSetOptions::default());
        assert_eq!(cache.keys(), vec!["high", "low_new", "normal"]);

        // Touching low_new makes it more recent, but it is still lowest priority
        cache.get("low_new");
        cache.set("another", 5, CacheSetOptions::default());
        assert_eq!(cache.keys(), vec!["another", "high", "normal"]);
        assert_eq!(cache.stats().evictions, 2);
    }

    #[tokio::test]
    async fn test_fill_racing_invalidation_is_discarded() {
        let cache = Arc::new(cache(10));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();

        let loader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_set(
                        "cache_playerData",
                        || async move {
                            started_tx.send(()).unwrap();
                            finish_rx.await.unwrap();
                            Ok(100)
                        },
                        CacheSetOptions::default().with_tag("dataType:playerData"),
                    )
                    .await
            })
        };

        started_rx.await.unwrap();
        cache.invalidate_by_tag("dataType:playerData");
        finish_tx.send(()).unwrap();

        assert_eq!(loader.await.unwrap().unwrap(), 100);
        assert!(!cache.contains("cache_playerData"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_purges_expired() {
        let cache = cache(10);
        cache.set("short", 1, CacheSetOptions::default().with_ttl(Duration::from_millis(10)));
        cache.set("long", 2, CacheSetOptions::default());

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.keys(), vec!["long"]);

        cache.clear();
        assert!(cache.is_empty());
    }
}
