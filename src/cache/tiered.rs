//! In-memory tiered cache
//!
//! One `HashMap` keyed by `(tier, key)` behind a `parking_lot::RwLock`, with
//! least-recently-used eviction once `max_entries` is reached. Timestamps use
//! `tokio::time::Instant` so paused-clock tests can drive expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::time::Instant;

use super::{CacheStats, CacheStore, CacheTier};
use crate::utils::toml_config::CacheConfig;

// ============================================================================
// Cache Entry
// ============================================================================

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    written_at: Instant,
    ttl: Duration,
    last_accessed: Instant,
}

impl CacheEntry {
    fn new(value: Value, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            written_at: now,
            ttl,
            last_accessed: now,
        }
    }

    /// An entry is still served at exactly `ttl` old
    fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.written_at) > self.ttl
    }
}

type EntryKey = (CacheTier, String);

// ============================================================================
// Tiered Cache
// ============================================================================

pub struct TieredCache {
    entries: RwLock<HashMap<EntryKey, CacheEntry>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
    shutdown: AtomicBool,
}

impl TieredCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Remove expired entries; returns how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before - entries.len();
        self.expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Periodically sweep expired entries until [`TieredCache::shutdown`] is called.
    pub fn start_sweep_task(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(every);
            loop {
                interval_timer.tick().await;

                if cache.shutdown.load(Ordering::Relaxed) {
                    break;
                }

                let removed = cache.cleanup_expired();
                if removed > 0 {
                    tracing::debug!("Cache sweep: removed {} expired entries", removed);
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Drop least recently used entries until one more fits. Caller holds the write lock.
    fn evict_lru(&self, entries: &mut HashMap<EntryKey, CacheEntry>) {
        while entries.len() >= self.config.max_entries && !entries.is_empty() {
            let lru_key = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(key, _)| key.clone());

            match lru_key {
                Some(key) => {
                    entries.remove(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }
}

impl Default for TieredCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl CacheStore for TieredCache {
    fn get(&self, key: &str, tier: CacheTier) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }

        let now = Instant::now();
        let entry_key = (tier, key.to_string());
        let mut entries = self.entries.write();

        match entries.get_mut(&entry_key) {
            Some(entry) if entry.is_expired_at(now) => {
                entries.remove(&entry_key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                entry.last_accessed = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put(&self, key: &str, value: Value, tier: CacheTier) {
        self.put_with_ttl(key, value, tier, tier.ttl(&self.config));
    }

    fn put_with_ttl(&self, key: &str, value: Value, tier: CacheTier, ttl: Duration) {
        if !self.config.enabled {
            return;
        }

        let entry_key = (tier, key.to_string());
        let mut entries = self.entries.write();

        if !entries.contains_key(&entry_key) {
            self.evict_lru(&mut entries);
        }
        entries.insert(entry_key, CacheEntry::new(value, ttl));
    }

    fn invalidate(&self, key: &str, tier: CacheTier) {
        self.entries.write().remove(&(tier, key.to_string()));
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries.read();

        let per_tier = CacheTier::all()
            .into_iter()
            .map(|tier| {
                let count = entries
                    .iter()
                    .filter(|((t, _), entry)| *t == tier && !entry.is_expired_at(now))
                    .count();
                (tier, count)
            })
            .collect();

        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entry_count: entries.len(),
            per_tier,
        }
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Assembled, TierLookup};
    use serde_json::json;

    fn small_ttls() -> CacheConfig {
        CacheConfig {
            static_ttl_secs: 3600,
            live_ttl_secs: 60,
            user_ttl_secs: 600,
            query_ttl_secs: 120,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_then_get_within_ttl() {
        let cache = TieredCache::new(small_ttls());
        cache.put("board", json!({"price": 499.0}), CacheTier::Live);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(
            cache.get("board", CacheTier::Live),
            Some(json!({"price": 499.0}))
        );
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss() {
        let cache = TieredCache::new(small_ttls());
        cache.put("board", json!({"price": 499.0}), CacheTier::Live);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cache.get("board", CacheTier::Live).is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get("board", CacheTier::Live).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.entry_count, 0);
    }

    #[test]
    fn test_tiers_are_separate_namespaces() {
        let cache = TieredCache::with_defaults();
        cache.put("k", json!("live"), CacheTier::Live);
        cache.put("k", json!("static"), CacheTier::Static);

        assert_eq!(cache.get("k", CacheTier::Live), Some(json!("live")));
        assert_eq!(cache.get("k", CacheTier::Static), Some(json!("static")));
        assert!(cache.get("k", CacheTier::Query).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_refreshes_written_at() {
        let cache = TieredCache::new(small_ttls());
        cache.put("k", json!(1), CacheTier::Live);
        tokio::time::advance(Duration::from_secs(50)).await;
        cache.put("k", json!(2), CacheTier::Live);
        tokio::time::advance(Duration::from_secs(50)).await;

        assert_eq!(cache.get("k", CacheTier::Live), Some(json!(2)));
    }

    #[test]
    fn test_assemble_merges_in_priority_order() {
        let cache = TieredCache::with_defaults();
        cache.put(
            "item",
            json!({"price": 399.0, "availability": "in_stock", "name": "Custom"}),
            CacheTier::Live,
        );
        cache.put(
            "item",
            json!({"name": "Burton Custom", "flex": "medium"}),
            CacheTier::Static,
        );

        let assembled = cache.assemble(
            "item",
            &[
                TierLookup::required(CacheTier::Live),
                TierLookup::optional(CacheTier::Static),
            ],
        );

        match assembled {
            Assembled::Hit { value, missing } => {
                assert!(missing.is_empty());
                assert_eq!(value["price"], 399.0);
                assert_eq!(value["name"], "Custom");
                assert_eq!(value["flex"], "medium");
            }
            Assembled::Miss => panic!("expected a hit"),
        }
    }

    #[test]
    fn test_assemble_required_miss() {
        let cache = TieredCache::with_defaults();
        cache.put("item", json!({"name": "Custom"}), CacheTier::Static);

        let assembled = cache.assemble(
            "item",
            &[
                TierLookup::required(CacheTier::Live),
                TierLookup::optional(CacheTier::Static),
            ],
        );
        assert!(assembled.is_miss());
    }

    #[test]
    fn test_assemble_optional_miss_is_stale() {
        let cache = TieredCache::with_defaults();
        cache.put("item", json!({"name": "Custom"}), CacheTier::Static);

        let assembled = cache.assemble(
            "item",
            &[
                TierLookup::optional(CacheTier::Live),
                TierLookup::required(CacheTier::Static),
            ],
        );
        assert!(assembled.is_stale());
        assert_eq!(
            assembled,
            Assembled::Hit {
                value: json!({"name": "Custom"}),
                missing: vec![CacheTier::Live],
            }
        );
    }

    #[test]
    fn test_assemble_all_optional_missing() {
        let cache = TieredCache::with_defaults();
        let assembled = cache.assemble("nothing", &[TierLookup::optional(CacheTier::Live)]);
        assert!(assembled.is_miss());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction_at_capacity() {
        let cache = TieredCache::new(CacheConfig {
            max_entries: 2,
            ..Default::default()
        });

        cache.put("a", json!(1), CacheTier::Static);
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.put("b", json!(2), CacheTier::Static);
        tokio::time::advance(Duration::from_millis(1)).await;
        // Touch "a" so "b" becomes least recently used
        assert!(cache.get("a", CacheTier::Static).is_some());
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.put("c", json!(3), CacheTier::Static);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("b", CacheTier::Static).is_none());
        assert!(cache.get("a", CacheTier::Static).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let cache = TieredCache::new(small_ttls());
        cache.put("short", json!(1), CacheTier::Live);
        cache.put("long", json!(2), CacheTier::Static);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = TieredCache::with_defaults();
        cache.put("a", json!(1), CacheTier::User);
        cache.put("b", json!(2), CacheTier::Query);

        cache.invalidate("a", CacheTier::User);
        assert!(cache.get("a", CacheTier::User).is_none());
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = TieredCache::new(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        cache.put("a", json!(1), CacheTier::Static);
        assert!(cache.get("a", CacheTier::Static).is_none());
        assert!(!cache.is_enabled());
    }

    #[test]
    fn test_hit_rate() {
        let cache = TieredCache::with_defaults();
        cache.put("a", json!(1), CacheTier::Static);
        cache.get("a", CacheTier::Static);
        cache.get("missing", CacheTier::Static);

        assert!((cache.stats().hit_rate() - 50.0).abs() < f64::EPSILON);
    }
}
