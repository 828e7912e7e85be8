//! # Cache and Request Gate Integration Tests
//!
//! Timing tests run on a paused clock so window arithmetic is exact.

use futures::future::join_all;
use market_data_gateway::{
    CacheConfig, DataSource, MarketDataError, Origin, RateLimitPolicy, RequestGate, SharedCache,
    TtlCache,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{advance, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Quote {
    symbol: String,
    price: f64,
}

fn quote(price: f64) -> Quote {
    Quote {
        symbol: "QQQ".to_string(),
        price,
    }
}

fn shared_cache() -> SharedCache {
    Arc::new(TtlCache::new(CacheConfig::default()))
}

/// Queue `count` operations that record their index and start time
async fn run_recorded(gate: &RequestGate, count: usize) -> Vec<(usize, Instant)> {
    let log = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..count)
        .map(|index| {
            let log = log.clone();
            gate.enqueue(move || async move {
                log.lock().push((index, Instant::now()));
                Ok(index)
            })
        })
        .collect();

    for (index, result) in join_all(handles).await.into_iter().enumerate() {
        assert_eq!(result.unwrap(), index);
    }

    let entries = log.lock().clone();
    entries
}

#[tokio::test(start_paused = true)]
async fn test_burst_beyond_limit_waits_for_window() {
    let gate = RequestGate::new("alpha", RateLimitPolicy::new(5, Duration::from_secs(60)));
    let start = Instant::now();

    let log = run_recorded(&gate, 7).await;

    for (_, at) in &log[..5] {
        assert!(at.duration_since(start) < Duration::from_secs(1));
    }
    for (_, at) in &log[5..] {
        assert!(at.duration_since(start) >= Duration::from_secs(60));
    }

    let order: Vec<usize> = log.iter().map(|(index, _)| *index).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4, 5, 6]);
}

#[tokio::test(start_paused = true)]
async fn test_no_window_ever_exceeds_limit() {
    let limit = 3;
    let window = Duration::from_secs(10);
    let gate = RequestGate::new("capped", RateLimitPolicy::new(limit, window));

    let log = run_recorded(&gate, 11).await;
    let starts: Vec<Instant> = log.iter().map(|(_, at)| *at).collect();

    for (i, from) in starts.iter().enumerate() {
        let in_window = starts[i..]
            .iter()
            .take_while(|at| at.duration_since(*from) < window)
            .count();
        assert!(in_window <= limit as usize, "{} dispatches inside one window", in_window);
    }

    assert!(gate.in_window() <= limit as usize);
    assert_eq!(gate.stats().dispatched, 11);
}

#[tokio::test(start_paused = true)]
async fn test_fifo_across_waits() {
    let gate = RequestGate::new("fifo", RateLimitPolicy::new(2, Duration::from_secs(5)));

    let log = run_recorded(&gate, 9).await;
    let order: Vec<usize> = log.iter().map(|(index, _)| *index).collect();

    assert_eq!(order, (0..9).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_failure_reaches_only_its_caller() {
    let gate = RequestGate::new("isolated", RateLimitPolicy::new(5, Duration::from_secs(60)));

    let first = gate.enqueue(|| async { Ok("first") });
    let second = gate.enqueue(|| async {
        Err::<&str, _>(MarketDataError::transient("isolated", "HTTP 503"))
    });
    let third = gate.enqueue(|| async { Ok("third") });

    assert_eq!(first.await.unwrap(), "first");
    assert!(matches!(
        second.await,
        Err(MarketDataError::TransientSource { .. })
    ));
    assert_eq!(third.await.unwrap(), "third");

    let stats = gate.stats();
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_freshness_is_per_read() {
    let cache: TtlCache<f64> = TtlCache::new(CacheConfig::default());
    cache.set("quote_QQQ", 430.5);

    advance(Duration::from_secs(30)).await;
    assert_eq!(cache.get("quote_QQQ", Duration::from_secs(60)), Some(430.5));
    assert_eq!(cache.get("quote_QQQ", Duration::from_secs(10)), None);

    advance(Duration::from_secs(40)).await;
    assert_eq!(cache.get("quote_QQQ", Duration::from_secs(60)), None);

    // Still present for fallback
    assert!(cache.peek("quote_QQQ").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_purges_past_ceiling() {
    let cache: TtlCache<u32> = TtlCache::new(CacheConfig {
        sweep_interval: Duration::from_secs(60),
        max_entry_age: Duration::from_secs(300),
        evict_on_stale_read: false,
    });
    cache.set("old", 1);

    advance(Duration::from_secs(240)).await;
    cache.set("young", 2);

    advance(Duration::from_secs(120)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(cache.peek("old").is_none());
    assert!(cache.peek("young").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_fetch_with_policy_serves_stale_value_on_failure() {
    let source = DataSource::new(
        "alpha_vantage",
        RateLimitPolicy::new(5, Duration::from_secs(60)),
        shared_cache(),
    );

    let fetched = source
        .fetch_with_policy("quote_QQQ", Duration::from_secs(60), || async {
            Ok(quote(430.5))
        })
        .await
        .unwrap();
    assert_eq!(fetched.origin, Origin::Network);

    advance(Duration::from_secs(120)).await;

    let fetched = source
        .fetch_with_policy("quote_QQQ", Duration::from_secs(60), || async {
            Err::<Quote, _>(MarketDataError::transient("alpha_vantage", "HTTP 500"))
        })
        .await
        .unwrap();

    assert_eq!(fetched.value, quote(430.5));
    match fetched.origin {
        Origin::StaleFallback { age } => assert!(age >= Duration::from_secs(120)),
        other => panic!("expected stale fallback, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_fetch_with_policy_fresh_hit_skips_gate() {
    let source = DataSource::new(
        "coinbase",
        RateLimitPolicy::new(10, Duration::from_secs(1)),
        shared_cache(),
    );

    source
        .fetch_with_policy("ticker_BTC", Duration::from_secs(30), || async {
            Ok(quote(64_000.0))
        })
        .await
        .unwrap();

    advance(Duration::from_secs(10)).await;

    let fetched = source
        .fetch_with_policy("ticker_BTC", Duration::from_secs(30), || async {
            Err::<Quote, _>(MarketDataError::transient("coinbase", "should not run"))
        })
        .await
        .unwrap();

    assert_eq!(fetched.origin, Origin::Cache);
    assert_eq!(source.gate().stats().enqueued, 1);
}

#[tokio::test(start_paused = true)]
async fn test_uncached_failure_propagates() {
    let source = DataSource::new(
        "fred",
        RateLimitPolicy::new(120, Duration::from_secs(60)),
        shared_cache(),
    );

    let result = source
        .fetch_with_policy("series_CPIAUCSL_24", Duration::from_secs(86_400), || async {
            Err::<Quote, _>(MarketDataError::transient("fred", "HTTP 500"))
        })
        .await;

    assert!(matches!(result, Err(MarketDataError::TransientSource { .. })));
    assert!(source.cache().peek("fred:series_CPIAUCSL_24").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_sources_share_cache_without_collisions() {
    let cache = shared_cache();
    let policy = RateLimitPolicy::new(5, Duration::from_secs(60));
    let alpha = DataSource::new("alpha_vantage", policy.clone(), cache.clone());
    let coinbase = DataSource::new("coinbase", policy, cache.clone());

    alpha
        .fetch_with_policy("quote", Duration::from_secs(60), || async { Ok(quote(1.0)) })
        .await
        .unwrap();
    let fetched = coinbase
        .fetch_with_policy("quote", Duration::from_secs(60), || async { Ok(quote(2.0)) })
        .await
        .unwrap();

    assert_eq!(fetched.origin, Origin::Network);
    assert_eq!(fetched.value.price, 2.0);
    assert_eq!(cache.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_independent_gates_do_not_block_each_other() {
    let a = RequestGate::new("alpha_vantage", RateLimitPolicy::new(5, Duration::from_secs(60)));
    let b = RequestGate::new("news", RateLimitPolicy::new(1, Duration::from_secs(12)));
    let start = Instant::now();

    let (a_log, b_log) = tokio::join!(run_recorded(&a, 6), run_recorded(&b, 2));

    assert!(b_log[0].1.duration_since(start) < Duration::from_secs(1));
    let b_second = b_log[1].1.duration_since(start);
    assert!(b_second >= Duration::from_secs(12) && b_second < Duration::from_secs(13));

    let a_sixth = a_log[5].1.duration_since(start);
    assert!(a_sixth >= Duration::from_secs(60) && a_sixth < Duration::from_secs(61));
}

#[tokio::test(start_paused = true)]
async fn test_inter_request_delay_spaces_dispatches() {
    let policy = RateLimitPolicy::new(5, Duration::from_secs(60))
        .with_inter_request_delay(Duration::from_secs(1));
    let gate = RequestGate::new("alpha_vantage", policy);

    let log = run_recorded(&gate, 3).await;

    for pair in log.windows(2) {
        assert!(pair[1].1.duration_since(pair[0].1) >= Duration::from_secs(1));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_enqueues_each_settle_once() {
    let gate = RequestGate::new("busy", RateLimitPolicy::new(1_000, Duration::from_secs(1)));

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let gate = gate.clone();
            tokio::spawn(async move { gate.enqueue(move || async move { Ok(i) }).await })
        })
        .collect();

    let mut results: Vec<i32> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    results.sort_unstable();

    assert_eq!(results, (0..50).collect::<Vec<_>>());
    gate.wait_for_empty(Duration::from_secs(5)).await.unwrap();
    assert_eq!(gate.stats().dispatched, 50);
}
