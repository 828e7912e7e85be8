//! # In-Memory TTL Cache
//!
//! A concurrent key-value store where every entry remembers when it was written and every
//! read supplies its own maximum age. The same entry can be fresh for a sparkline that
//! tolerates minutes and stale for a price tile that tolerates seconds.
//!
//! A background sweeper purges entries older than a fixed housekeeping ceiling so memory
//! stays bounded regardless of what ages callers ask for.

use super::{CacheConfig, CacheStats};
use crate::observability::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL, CACHE_SWEPT_TOTAL};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A cached value plus the moment it was stored
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached value
    pub value: V,

    /// Monotonic write time, the only input to freshness decisions
    pub stored_at: Instant,

    /// Wall-clock write time, for diagnostics
    pub stored_at_utc: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    /// Create a new entry stamped with the current time
    pub fn new(value: V) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
            stored_at_utc: Utc::now(),
        }
    }

    /// Time elapsed since the entry was written
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.stored_at)
    }

    /// Whether the entry satisfies a reader's freshness tolerance
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.age() <= max_age
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_reads: AtomicU64,
    swept: AtomicU64,
    clears: AtomicU64,
}

/// TTL cache keyed by caller-chosen strings
pub struct TtlCache<V> {
    config: CacheConfig,
    entries: Arc<DashMap<String, CacheEntry<V>>>,
    counters: Arc<CacheCounters>,
    sweeper: Option<JoinHandle<()>>,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a new cache and start its housekeeping sweeper.
    ///
    /// The sweeper runs on the current tokio runtime and stops when the cache is dropped.
    /// Outside a runtime the cache still works, but only manual `sweep()` calls purge entries.
    pub fn new(config: CacheConfig) -> Self {
        let entries = Arc::new(DashMap::new());
        let counters = Arc::new(CacheCounters::default());

        let sweeper = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let entries = entries.clone();
                let counters = counters.clone();
                let sweep_interval = config.sweep_interval;
                let max_entry_age = config.max_entry_age;

                Some(handle.spawn(async move {
                    let mut ticker = interval(sweep_interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        Self::sweep_entries(&entries, &counters, max_entry_age);
                    }
                }))
            }
            Err(_) => {
                warn!("No tokio runtime available, cache sweeper not started");
                None
            }
        };

        Self {
            config,
            entries,
            counters,
            sweeper,
        }
    }

    fn sweep_entries(
        entries: &DashMap<String, CacheEntry<V>>,
        counters: &CacheCounters,
        max_entry_age: Duration,
    ) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| entry.age() <= max_entry_age);
        let removed = before.saturating_sub(entries.len());

        if removed > 0 {
            counters.swept.fetch_add(removed as u64, Ordering::Relaxed);
            metrics::counter!(CACHE_SWEPT_TOTAL).increment(removed as u64);
            debug!(removed, remaining = entries.len(), "Swept aged cache entries");
        }

        removed
    }

    /// Return the value under `key` if it was written no more than `max_age` ago.
    ///
    /// A stale entry reads as absent. It stays in the store for degraded fallback unless
    /// `evict_on_stale_read` is set.
    pub fn get(&self, key: &str, max_age: Duration) -> Option<V> {
        let lookup = self
            .entries
            .get(key)
            .map(|entry| entry.is_fresh(max_age).then(|| entry.value.clone()));

        match lookup {
            Some(Some(value)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(CACHE_HITS_TOTAL).increment(1);
                Some(value)
            }
            Some(None) => {
                self.counters.stale_reads.fetch_add(1, Ordering::Relaxed);
                self.record_miss();

                if self.config.evict_on_stale_read {
                    self.entries
                        .remove_if(key, |_, entry| !entry.is_fresh(max_age));
                }
                None
            }
            None => {
                self.record_miss();
                None
            }
        }
    }

    fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(CACHE_MISSES_TOTAL).increment(1);
    }

    /// Return the entry under `key` regardless of its age
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Store `value` under `key`, replacing any previous entry and resetting its age
    pub fn set(&self, key: &str, value: V) {
        self.entries.insert(key.to_string(), CacheEntry::new(value));
    }

    /// Remove a single entry
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Purge every entry older than the housekeeping ceiling
    pub fn sweep(&self) -> usize {
        Self::sweep_entries(&self.entries, &self.counters, self.config.max_entry_age)
    }

    /// Drop every entry, used for a forced refresh
    pub fn clear(&self) {
        let entry_count = self.entries.len();
        self.entries.clear();
        self.counters.clears.fetch_add(1, Ordering::Relaxed);
        info!(entry_count, "Cleared cache");
    }

    /// Number of stored entries, fresh or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Currently stored keys, in no particular order
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_reads: self.counters.stale_reads.load(Ordering::Relaxed),
            swept: self.counters.swept.load(Ordering::Relaxed),
            clears: self.counters.clears.load(Ordering::Relaxed),
        }
    }
}

impl<V> Drop for TtlCache<V> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, sleep};

    fn test_config() -> CacheConfig {
        CacheConfig {
            sweep_interval: Duration::from_secs(600),
            max_entry_age: Duration::from_secs(3600),
            evict_on_stale_read: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_boundary() {
        let cache = TtlCache::new(test_config());
        cache.set("quote_BTC", 50_000u64);

        advance(Duration::from_secs(30)).await;
        assert_eq!(cache.get("quote_BTC", Duration::from_secs(60)), Some(50_000));

        advance(Duration::from_secs(30)).await;
        assert_eq!(cache.get("quote_BTC", Duration::from_secs(60)), Some(50_000));

        advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("quote_BTC", Duration::from_secs(60)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_age_is_per_read() {
        let cache = TtlCache::new(test_config());
        cache.set("quote_SPY", 512.25f64);

        advance(Duration::from_secs(45)).await;
        assert_eq!(cache.get("quote_SPY", Duration::from_secs(30)), None);
        assert_eq!(cache.get("quote_SPY", Duration::from_secs(600)), Some(512.25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_resets_age() {
        let cache = TtlCache::new(test_config());
        cache.set("quote_ETH", 1u32);

        advance(Duration::from_secs(50)).await;
        cache.set("quote_ETH", 2u32);

        advance(Duration::from_secs(50)).await;
        assert_eq!(cache.get("quote_ETH", Duration::from_secs(60)), Some(2));
        assert_eq!(cache.peek("quote_ETH").unwrap().age(), Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_kept_for_peek() {
        let cache = TtlCache::new(test_config());
        cache.set("series_UNRATE", "3.7".to_string());

        advance(Duration::from_secs(120)).await;
        assert_eq!(cache.get("series_UNRATE", Duration::from_secs(60)), None);

        let entry = cache.peek("series_UNRATE").unwrap();
        assert_eq!(entry.value, "3.7");
        assert_eq!(cache.stats().stale_reads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_on_stale_read() {
        let cache = TtlCache::new(CacheConfig {
            evict_on_stale_read: true,
            ..test_config()
        });
        cache.set("k", 1u8);

        advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get("k", Duration::from_secs(1)), None);
        assert!(cache.peek("k").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sweep_uses_ceiling() {
        // Background sweeps stay out of this test's time horizon
        let cache = TtlCache::new(CacheConfig {
            sweep_interval: Duration::from_secs(7200),
            ..test_config()
        });
        cache.set("old", 1u8);

        advance(Duration::from_secs(3000)).await;
        cache.set("new", 2u8);

        advance(Duration::from_secs(601)).await;
        assert_eq!(cache.sweep(), 1);
        assert!(cache.peek("old").is_none());
        assert!(cache.peek("new").is_some());
        assert_eq!(cache.stats().swept, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let cache = TtlCache::new(CacheConfig {
            sweep_interval: Duration::from_secs(300),
            max_entry_age: Duration::from_secs(60),
            evict_on_stale_read: false,
        });
        cache.set("short_lived", 1u8);

        sleep(Duration::from_secs(301)).await;
        tokio::task::yield_now().await;

        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let cache = TtlCache::new(test_config());
        cache.set("a", 1u8);
        cache.set("b", 2u8);

        assert_eq!(cache.get("a", Duration::from_secs(60)), Some(1));
        assert_eq!(cache.get("missing", Duration::from_secs(60)), None);

        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.clears, 1);
    }

    #[test]
    fn test_works_without_runtime() {
        let cache = TtlCache::new(test_config());
        cache.set("k", 7u8);
        assert_eq!(cache.get("k", Duration::from_secs(1)), Some(7));
        assert!(cache.remove("k"));
        assert!(!cache.remove("k"));
    }
}
