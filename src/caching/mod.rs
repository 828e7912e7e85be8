//! # Caching System Module
//!
//! This module provides the TTL cache shared by every external data source.
//!
//! ## Features
//! - Per-read freshness: `get(key, max_age)` decides staleness at read time
//! - Unconditional overwrite on `set`, which resets the entry's age
//! - Stale entries stay readable through `peek` for degraded fallback
//! - A background sweeper that purges entries past a fixed ceiling
//! - Manual invalidation through `clear`
//!
//! ## Usage Example
//! ```rust
//! use std::time::Duration;
//! use market_data_gateway::caching::{CacheConfig, TtlCache};
//!
//! let cache = TtlCache::new(CacheConfig::default());
//! cache.set("coinbase:stats_BTC", 50_000.0);
//!
//! // A live ticker tolerates 30 seconds of staleness
//! assert_eq!(cache.get("coinbase:stats_BTC", Duration::from_secs(30)), Some(50_000.0));
//! ```

pub mod memory;

pub use memory::{CacheEntry, TtlCache};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How often the sweeper runs
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Entries older than this are purged by the sweeper, whatever age readers ask for
    #[serde(with = "humantime_serde")]
    pub max_entry_age: Duration,

    /// Remove an entry as soon as a read finds it stale.
    ///
    /// Off by default: a removed entry can no longer serve as a degraded fallback.
    pub evict_on_stale_read: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(600),   // 10 minutes
            max_entry_age: Duration::from_secs(86_400), // 24 hours
            evict_on_stale_read: false,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of stored entries, fresh or stale
    pub entries: usize,

    /// Reads answered with a fresh value
    pub hits: u64,

    /// Reads that found nothing usable (absent or stale)
    pub misses: u64,

    /// The subset of misses where an entry existed but was too old
    pub stale_reads: u64,

    /// Entries purged by the sweeper
    pub swept: u64,

    /// Number of `clear` calls
    pub clears: u64,
}

impl CacheStats {
    /// Fraction of reads answered from the cache
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
