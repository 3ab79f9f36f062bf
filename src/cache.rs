//! Decision Cache
//!
//! Memoizes authorization outcomes keyed by request fingerprint.
//!
//! Each entry has two validity windows:
//! - `ttl`: normal lifetime; `get` only returns entries inside it
//! - `stale_ttl`: extended lifetime; `get_stale` returns entries inside it
//!   and is only used as a fallback when the portal cannot be reached
//!
//! Entries past `ttl` but inside `stale_ttl` are deliberately kept by the
//! cleanup sweep. The table is bounded by `max_size`; when full, the entry
//! with the oldest creation time is evicted before a new key is inserted.
//!
//! This is a hot path component - runs on every connect request.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::fingerprint::{CacheKey, Fingerprint};
use crate::{AgentError, Result};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Normal entry lifetime
    pub ttl: Duration,
    /// Extended lifetime for fail-stale fallback
    pub stale_ttl: Duration,
    /// Maximum resident entries
    pub max_size: usize,
    /// How often the background sweep runs
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            stale_ttl: Duration::from_secs(30 * 60),
            max_size: 10_000,
            cleanup_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(AgentError::Config("cache ttl must be non-zero".into()));
        }
        if self.stale_ttl <= self.ttl {
            return Err(AgentError::Config(format!(
                "cache stale_ttl ({:?}) must be greater than ttl ({:?})",
                self.stale_ttl, self.ttl
            )));
        }
        if self.max_size == 0 {
            return Err(AgentError::Config("cache max_size must be non-zero".into()));
        }
        if self.cleanup_interval.is_zero() {
            return Err(AgentError::Config("cache cleanup_interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Resident entry. Replaced wholesale on `set`, never patched in place.
#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    username: String,
    created_at: Instant,
    expires_at: Instant,
    stale_until: Instant,
    access_count: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn touch(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// TTL + stale-window decision cache
pub struct DecisionCache<V> {
    entries: RwLock<HashMap<Fingerprint, CacheEntry<V>>>,
    config: CacheConfig,

    /// Statistics
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone> DecisionCache<V> {
    /// Create a new decision cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(config.max_size.min(1024))),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get a fresh cached value. Entries at or past their TTL are misses, as
    /// are entries whose stored username differs from the key's.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        let entries = self.entries.read();

        match entries.get(&key.fingerprint).filter(|entry| entry.username == key.username) {
            Some(entry) if now < entry.expires_at => {
                entry.touch();
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    username = %key.username,
                    fingerprint = %key.fingerprint,
                    age_ms = now.duration_since(entry.created_at).as_millis() as u64,
                    "cache hit"
                );
                Some(entry.value.clone())
            }
            Some(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(username = %key.username, "cache entry expired");
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(username = %key.username, "cache miss");
                None
            }
        }
    }

    /// Get a value regardless of TTL, as long as it is inside the stale window.
    ///
    /// Only the fail-stale fallback should call this.
    pub fn get_stale(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        let entries = self.entries.read();

        let entry = entries
            .get(&key.fingerprint)
            .filter(|entry| entry.username == key.username)?;
        if now > entry.stale_until {
            tracing::debug!(
                username = %key.username,
                age_ms = now.duration_since(entry.created_at).as_millis() as u64,
                "stale cache entry expired"
            );
            return None;
        }

        entry.touch();
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            username = %key.username,
            age_ms = now.duration_since(entry.created_at).as_millis() as u64,
            expired = now >= entry.expires_at,
            "using stale cache entry"
        );
        Some(entry.value.clone())
    }

    /// Insert or replace a value, resetting its TTL window
    pub fn set(&self, key: &CacheKey, value: V) {
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            username: key.username.clone(),
            created_at: now,
            expires_at: now + self.config.ttl,
            stale_until: now + self.config.stale_ttl,
            access_count: AtomicU64::new(0),
        };

        let mut entries = self.entries.write();
        if !entries.contains_key(&key.fingerprint) && entries.len() >= self.config.max_size {
            self.evict_oldest(&mut entries);
        }
        entries.insert(key.fingerprint, entry);
        drop(entries);

        tracing::debug!(
            username = %key.username,
            ttl_ms = self.config.ttl.as_millis() as u64,
            "cache set"
        );
    }

    /// Remove a single entry
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.write().remove(&key.fingerprint).is_some()
    }

    /// Remove every entry built from `username`. Returns the removed count.
    pub fn invalidate_user(&self, username: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.username != username);
        let removed = before - entries.len();
        drop(entries);

        tracing::info!(username, entries_removed = removed, "cache invalidated for user");
        removed
    }

    /// Clear all entries and reset statistics
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let count = entries.len();
        entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.stale_hits.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        drop(entries);

        tracing::info!(removed = count, "cache cleared");
        count
    }

    /// Remove entries past their stale window. Returns the removed count.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.stale_until);
        let removed = before - entries.len();

        if removed > 0 {
            tracing::info!(removed, remaining = entries.len(), "cache cleanup completed");
        }
        removed
    }

    /// Evict the entry with the smallest creation time (caller holds the write lock)
    fn evict_oldest(&self, entries: &mut HashMap<Fingerprint, CacheEntry<V>>) {
        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| entry.created_at)
            .map(|(fp, _)| *fp);

        if let Some(fp) = oldest {
            if let Some(evicted) = entries.remove(&fp) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    username = %evicted.username,
                    accesses = evicted.access_count.load(Ordering::Relaxed),
                    "evicted oldest cache entry"
                );
            }
        }
    }

    /// Number of resident entries (fresh or stale)
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            size: entries.len(),
            max_size: self.config.max_size,
            hits,
            misses,
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}

impl<V: Clone + Send + Sync + 'static> DecisionCache<V> {
    /// Run `cleanup` every `cleanup_interval` until `shutdown` flips to true
    pub fn spawn_cleanup(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            tracing::info!(interval_secs = period.as_secs(), "decision cache cleanup started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.cleanup();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("decision cache cleanup stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

impl<V: Clone> Default for DecisionCache<V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(username: &str, ip: &str) -> CacheKey {
        CacheKey::new(username, Fingerprint::from_parts(username, "staff", ip))
    }

    fn config(ttl_ms: u64, stale_ms: u64, max_size: usize) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_millis(ttl_ms),
            stale_ttl: Duration::from_millis(stale_ms),
            max_size,
            cleanup_interval: Duration::from_millis(stale_ms),
        }
    }

    #[test]
    fn test_cache_set_get() {
        let cache = DecisionCache::new(config(60_000, 120_000, 100));
        let k = key("alice", "192.0.2.1");

        cache.set(&k, true);
        assert_eq!(cache.get(&k), Some(true));
    }

    #[test]
    fn test_cache_miss() {
        let cache: DecisionCache<bool> = DecisionCache::new(config(60_000, 120_000, 100));
        assert!(cache.get(&key("nobody", "192.0.2.1")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_and_stale_windows() {
        let cache = DecisionCache::new(config(100, 500, 100));
        let k = key("alice", "192.0.2.1");
        cache.set(&k, "allow");

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(cache.get(&k), Some("allow"));

        tokio::time::advance(Duration::from_millis(100)).await; // t0+150ms
        assert_eq!(cache.get(&k), None);
        assert_eq!(cache.get_stale(&k), Some("allow"));

        tokio::time::advance(Duration::from_millis(450)).await; // t0+600ms
        assert_eq!(cache.get_stale(&k), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_misses_exactly_at_expiry() {
        let cache = DecisionCache::new(config(100, 500, 100));
        let k = key("alice", "192.0.2.1");
        cache.set(&k, 1u8);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(cache.get(&k), None);
        // Stale window is inclusive
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(cache.get_stale(&k), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_resets_ttl_window() {
        let cache = DecisionCache::new(config(100, 500, 100));
        let k = key("alice", "192.0.2.1");
        cache.set(&k, 1u8);

        tokio::time::advance(Duration::from_millis(80)).await;
        cache.set(&k, 2u8);
        tokio::time::advance(Duration::from_millis(80)).await;
        assert_eq!(cache.get(&k), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let cache = DecisionCache::new(config(60_000, 120_000, 3));
        let keys: Vec<_> = (0..4).map(|i| key(&format!("user{}", i), "192.0.2.1")).collect();

        for k in &keys {
            cache.set(k, true);
            tokio::time::advance(Duration::from_millis(1)).await;
        }

        assert_eq!(cache.len(), 3);
        assert!(cache.get(&keys[0]).is_none(), "oldest entry should be evicted");
        for k in &keys[1..] {
            assert!(cache.get(k).is_some());
        }
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_never_exceeded() {
        let cache = DecisionCache::new(config(60_000, 120_000, 10));
        for i in 0..50 {
            cache.set(&key(&format!("user{}", i), "192.0.2.1"), i);
            tokio::time::advance(Duration::from_millis(1)).await;
            assert!(cache.len() <= 10);
        }
        // Survivors are the ten newest
        assert!(cache.get(&key("user39", "192.0.2.1")).is_none());
        assert_eq!(cache.get(&key("user40", "192.0.2.1")), Some(40));
    }

    #[test]
    fn test_upsert_at_capacity_does_not_evict() {
        let cache = DecisionCache::new(config(60_000, 120_000, 2));
        let a = key("a", "192.0.2.1");
        let b = key("b", "192.0.2.1");
        cache.set(&a, 1);
        cache.set(&b, 2);
        cache.set(&a, 3);

        assert_eq!(cache.get(&a), Some(3));
        assert_eq!(cache.get(&b), Some(2));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_invalidate_user() {
        let cache = DecisionCache::new(config(60_000, 120_000, 100));
        cache.set(&key("bob", "192.0.2.1"), true);
        cache.set(&key("bob", "192.0.2.2"), true);
        cache.set(&key("bobby", "192.0.2.1"), true);
        cache.set(&key("carol", "192.0.2.1"), true);

        assert_eq!(cache.invalidate_user("bob"), 2);
        assert!(cache.get(&key("bob", "192.0.2.1")).is_none());
        assert!(cache.get(&key("bobby", "192.0.2.1")).is_some());
        assert!(cache.get(&key("carol", "192.0.2.1")).is_some());
        assert_eq!(cache.invalidate_user("bob"), 0);
    }

    #[test]
    fn test_fingerprint_collision_is_a_miss() {
        let cache = DecisionCache::new(CacheConfig::default());
        let shared = Fingerprint::from_parts("alice", "staff", "192.0.2.1");
        cache.set(&CacheKey::new("alice", shared), "allow");

        let other = CacheKey::new("bob", shared);
        assert_eq!(cache.get(&other), None);
        assert_eq!(cache.get_stale(&other), None);
        assert_eq!(cache.get(&CacheKey::new("alice", shared)), Some("allow"));
    }

    #[test]
    fn test_invalidate_single() {
        let cache = DecisionCache::new(config(60_000, 120_000, 100));
        let k = key("alice", "192.0.2.1");
        cache.set(&k, true);
        assert!(cache.invalidate(&k));
        assert!(cache.get(&k).is_none());
        assert!(!cache.invalidate(&k));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_keeps_stale_window() {
        let cache = DecisionCache::new(config(100, 500, 100));
        let old = key("old", "192.0.2.1");
        cache.set(&old, 1);
        tokio::time::advance(Duration::from_millis(300)).await;
        let mid = key("mid", "192.0.2.1");
        cache.set(&mid, 2);

        // old is past ttl but within stale window
        assert_eq!(cache.cleanup(), 0);

        tokio::time::advance(Duration::from_millis(250)).await; // old at 550ms
        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_stale(&mid), Some(2));
    }

    #[test]
    fn test_cache_stats_and_clear() {
        let cache = DecisionCache::new(config(60_000, 120_000, 100));
        let k = key("alice", "192.0.2.1");

        cache.set(&k, true);
        cache.get(&k); // hit
        cache.get(&k); // hit
        cache.get(&key("nobody", "192.0.2.1")); // miss
        cache.get_stale(&k); // stale hit

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stale_hits, 1);
        assert_eq!(stats.size, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);

        assert_eq!(cache.clear(), 1);
        let stats = cache.stats();
        assert_eq!((stats.size, stats.hits, stats.misses, stats.stale_hits), (0, 0, 0, 0));
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(config(100, 100, 10).validate().is_err());
        assert!(config(0, 100, 10).validate().is_err());
        assert!(config(100, 500, 0).validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_cleanup_stops_on_shutdown() {
        let cache = Arc::new(DecisionCache::new(config(100, 500, 100)));
        cache.set(&key("alice", "192.0.2.1"), 1);

        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&cache).spawn_cleanup(rx);

        // Two sweep periods: entry is past its stale window by the second tick
        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(cache.is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
