//! Tiered result cache
//!
//! Entries live in one of four tiers with their own TTL policy:
//!
//! | Tier     | Holds                              | Default TTL |
//! |----------|------------------------------------|-------------|
//! | `STATIC` | descriptive item fields, item indexes | 30 days  |
//! | `LIVE`   | full item snapshots incl. price/stock | 15 minutes |
//! | `USER`   | per-user preferences               | 7 days      |
//! | `QUERY`  | whole query responses              | 1 hour      |
//!
//! Expiry is lazy: an entry past `written_at + ttl` reads as a miss and is
//! dropped on access. `cleanup_expired` (or the sweep task) reclaims the rest.
//!
//! # Assembling
//!
//! [`CacheStore::assemble`] reads one key across several tiers in priority
//! order and shallow-merges JSON objects, the higher-priority tier winning on
//! conflicting fields. A miss on a required tier is a miss overall; a miss on
//! an optional tier yields a partial value flagged stale.

pub mod tiered;

pub use tiered::TieredCache;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

use crate::types::SearchCriteria;
use crate::utils::toml_config::CacheConfig;

// ============================================================================
// Cache Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Static,
    Live,
    User,
    Query,
}

impl CacheTier {
    pub fn all() -> [CacheTier; 4] {
        [
            CacheTier::Static,
            CacheTier::Live,
            CacheTier::User,
            CacheTier::Query,
        ]
    }

    /// TTL for this tier under `config`
    pub fn ttl(self, config: &CacheConfig) -> Duration {
        let secs = match self {
            CacheTier::Static => config.static_ttl_secs,
            CacheTier::Live => config.live_ttl_secs,
            CacheTier::User => config.user_ttl_secs,
            CacheTier::Query => config.query_ttl_secs,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheTier::Static => "static",
            CacheTier::Live => "live",
            CacheTier::User => "user",
            CacheTier::Query => "query",
        };
        f.write_str(name)
    }
}

/// One tier consulted by [`CacheStore::assemble`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLookup {
    pub tier: CacheTier,
    pub required: bool,
}

impl TierLookup {
    pub fn required(tier: CacheTier) -> Self {
        Self {
            tier,
            required: true,
        }
    }

    pub fn optional(tier: CacheTier) -> Self {
        Self {
            tier,
            required: false,
        }
    }
}

/// Result of [`CacheStore::assemble`].
#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
    Hit {
        value: Value,
        /// Optional tiers that had no live entry
        missing: Vec<CacheTier>,
    },
    Miss,
}

impl Assembled {
    pub fn is_miss(&self) -> bool {
        matches!(self, Assembled::Miss)
    }

    /// True for a hit that lacks at least one optional tier
    pub fn is_stale(&self) -> bool {
        matches!(self, Assembled::Hit { missing, .. } if !missing.is_empty())
    }
}

/// Statistics for cache performance monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped because they expired
    pub expirations: u64,
    /// Entries dropped because the cache was full
    pub evictions: u64,
    pub entry_count: usize,
    /// Live entries per tier
    pub per_tier: Vec<(CacheTier, usize)>,
}

impl CacheStats {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

// ============================================================================
// Cache Trait
// ============================================================================

/// Storage interface used by the orchestrator.
pub trait CacheStore: Send + Sync {
    /// Value stored under `(key, tier)`, or `None` if absent or expired
    fn get(&self, key: &str, tier: CacheTier) -> Option<Value>;

    /// Store under `(key, tier)` with the tier's TTL, overwriting any previous entry
    fn put(&self, key: &str, value: Value, tier: CacheTier);

    /// Store with an explicit TTL
    fn put_with_ttl(&self, key: &str, value: Value, tier: CacheTier, ttl: Duration);

    /// Remove `(key, tier)`
    fn invalidate(&self, key: &str, tier: CacheTier);

    /// Remove every entry in every tier
    fn clear(&self);

    fn stats(&self) -> CacheStats;

    fn is_enabled(&self) -> bool;

    /// Read `key` across `tiers` (highest priority first) and merge the hits.
    fn assemble(&self, key: &str, tiers: &[TierLookup]) -> Assembled {
        let mut merged: Option<Value> = None;
        let mut missing = Vec::new();

        for lookup in tiers {
            match self.get(key, lookup.tier) {
                Some(value) => {
                    merged = Some(match merged {
                        None => value,
                        Some(higher) => merge_lower_priority(higher, value),
                    });
                }
                None if lookup.required => return Assembled::Miss,
                None => missing.push(lookup.tier),
            }
        }

        match merged {
            Some(value) => Assembled::Hit { value, missing },
            None => Assembled::Miss,
        }
    }
}

/// Fill fields missing from `higher` with those of `lower`. Non-object values are not merged.
fn merge_lower_priority(mut higher: Value, lower: Value) -> Value {
    if let (Some(high), Value::Object(low)) = (higher.as_object_mut(), lower) {
        for (field, value) in low {
            high.entry(field).or_insert(value);
        }
    }
    higher
}

/// Normalized key for the QUERY tier.
///
/// Case and whitespace differences map to the same key; `user` selects the
/// user-specific variant.
pub fn query_key(raw_query: &str, user: Option<&str>) -> String {
    let normalized = raw_query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b"|");
    hasher.update(user.unwrap_or("*").as_bytes());
    format!("query:{:x}", hasher.finalize())
}

/// Stable digest of structured criteria, used to index what each agent returned for them.
pub fn criteria_fingerprint(criteria: &SearchCriteria) -> String {
    let canonical = serde_json::to_string(criteria).unwrap_or_else(|_| criteria.query.clone());
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Key under which an agent's item ids for a criteria fingerprint are indexed in STATIC.
pub fn item_index_key(agent_id: &str, criteria_fingerprint: &str) -> String {
    format!("index:{}:{}", agent_id, criteria_fingerprint)
}

/// Key for one item snapshot (LIVE) or description (STATIC).
pub fn item_key(agent_id: &str, item_id: &str) -> String {
    format!("item:{}:{}", agent_id, item_id)
}

/// Key for a user's preferences in the USER tier.
pub fn user_key(user_id: &str) -> String {
    format!("user:{}", user_id)
}
