//! # Data Sources
//!
//! Every external integration reaches the network through one path:
//! [`DataSource::fetch_with_policy`]. It pairs the process-wide TTL cache with the source's
//! own request gate:
//!
//! 1. A fresh cached value is returned immediately, with no network activity.
//! 2. Otherwise the operation is queued on the source's gate and awaited.
//! 3. A successful result is cached under the key and returned.
//! 4. A failure is masked by the cached entry for that key, whatever its age, when one
//!    exists. With nothing cached the failure reaches the caller. Placeholder values are
//!    never produced.
//!
//! The per-source clients (`alpha_vantage`, `coinbase`, `fred`, `news`) only build requests
//! and decode payloads. `order_book` is the exception: a streaming feed that holds no cache
//! entries and never goes through a gate.

pub mod alpha_vantage;
pub mod coinbase;
pub mod fred;
pub mod news;
pub mod order_book;

pub use alpha_vantage::AlphaVantageClient;
pub use coinbase::CoinbaseClient;
pub use fred::FredClient;
pub use news::NewsClient;
pub use order_book::{FeedState, OrderBookConfig, OrderBookFeed};

use crate::caching::TtlCache;
use crate::core::config::SourceConfig;
use crate::core::error::{MarketDataError, MarketDataResult};
use crate::observability::metrics::{SOURCE_FAILURES_TOTAL, SOURCE_STALE_FALLBACK_TOTAL};
use crate::traffic::{RateLimitPolicy, RequestGate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One cache shared by every source; payloads are kept as JSON so any source can use it
pub type SharedCache = Arc<TtlCache<serde_json::Value>>;

/// Where a fetched value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Fresh enough cached value, no network activity
    Cache,
    /// Just fetched from the source
    Network,
    /// The refresh failed and this is the last value cached for the key
    StaleFallback { age: Duration },
}

/// A value plus its provenance
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub origin: Origin,
}

impl<T> Fetched<T> {
    /// True when the value is a degraded fallback
    pub fn is_stale(&self) -> bool {
        matches!(self.origin, Origin::StaleFallback { .. })
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Fetched<U> {
        Fetched {
            value: f(self.value),
            origin: self.origin,
        }
    }
}

/// Maximum acceptable age per kind of read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Freshness {
    /// Spot prices shown as live tickers
    #[serde(with = "humantime_serde")]
    pub live_ticker: Duration,

    /// Price tiles
    #[serde(with = "humantime_serde")]
    pub quote: Duration,

    /// Intraday sparklines and candles
    #[serde(with = "humantime_serde")]
    pub sparkline: Duration,

    #[serde(with = "humantime_serde")]
    pub macro_series: Duration,

    #[serde(with = "humantime_serde")]
    pub headlines: Duration,
}

impl Default for Freshness {
    fn default() -> Self {
        Self {
            live_ticker: Duration::from_secs(30),
            quote: Duration::from_secs(60),
            sparkline: Duration::from_secs(600),
            macro_series: Duration::from_secs(86_400),
            headlines: Duration::from_secs(1_800),
        }
    }
}

impl Freshness {
    /// Every configured tolerance with its name
    pub fn entries(&self) -> [(&'static str, Duration); 5] {
        [
            ("live_ticker", self.live_ticker),
            ("quote", self.quote),
            ("sparkline", self.sparkline),
            ("macro_series", self.macro_series),
            ("headlines", self.headlines),
        ]
    }
}

/// A named external source: its gate plus the shared cache
#[derive(Clone)]
pub struct DataSource {
    name: String,
    gate: RequestGate,
    cache: SharedCache,
}

impl DataSource {
    pub fn new<S: Into<String>>(name: S, policy: RateLimitPolicy, cache: SharedCache) -> Self {
        let name = name.into();
        let gate = RequestGate::new(name.clone(), policy);
        Self { name, gate, cache }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gate(&self) -> &RequestGate {
        &self.gate
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Cache key for this source; keys from different sources never collide
    pub fn cache_key(&self, key: &str) -> String {
        format!("{}:{}", self.name, key)
    }

    /// Serve `key` from cache when fresh, otherwise fetch it through the gate.
    ///
    /// Caller mistakes (`UnknownKey`, `Configuration`) are never masked by a cached value.
    pub async fn fetch_with_policy<T, F, Fut>(
        &self,
        key: &str,
        max_age: Duration,
        operation: F,
    ) -> MarketDataResult<Fetched<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = MarketDataResult<T>> + Send + 'static,
    {
        let cache_key = self.cache_key(key);

        if let Some(cached) = self.cache.get(&cache_key, max_age) {
            match serde_json::from_value::<T>(cached) {
                Ok(value) => {
                    debug!(source = %self.name, key = %cache_key, "Serving cached value");
                    return Ok(Fetched {
                        value,
                        origin: Origin::Cache,
                    });
                }
                Err(e) => {
                    warn!(source = %self.name, key = %cache_key, error = %e, "Cached payload did not decode, refetching");
                }
            }
        }

        match self.gate.enqueue(operation).await {
            Ok(value) => {
                match serde_json::to_value(&value) {
                    Ok(json) => self.cache.set(&cache_key, json),
                    Err(e) => {
                        warn!(source = %self.name, key = %cache_key, error = %e, "Fetched value not cacheable");
                    }
                }
                Ok(Fetched {
                    value,
                    origin: Origin::Network,
                })
            }
            Err(error) => self.fall_back(&cache_key, error),
        }
    }

    fn fall_back<T: DeserializeOwned>(
        &self,
        cache_key: &str,
        error: MarketDataError,
    ) -> MarketDataResult<Fetched<T>> {
        if error.allows_stale_fallback() {
            if let Some(entry) = self.cache.peek(cache_key) {
                if let Ok(value) = serde_json::from_value::<T>(entry.value.clone()) {
                    let age = entry.age();
                    warn!(
                        source = %self.name,
                        key = %cache_key,
                        age_ms = age.as_millis() as u64,
                        error = %error,
                        "Refresh failed, serving stale cached value"
                    );
                    metrics::counter!(SOURCE_STALE_FALLBACK_TOTAL, "source" => self.name.clone())
                        .increment(1);
                    return Ok(Fetched {
                        value,
                        origin: Origin::StaleFallback { age },
                    });
                }
            }
        }

        warn!(
            source = %self.name,
            key = %cache_key,
            error_type = error.error_type(),
            error = %error,
            "Fetch failed with nothing cached"
        );
        metrics::counter!(
            SOURCE_FAILURES_TOTAL,
            "source" => self.name.clone(),
            "error_type" => error.error_type()
        )
        .increment(1);
        Err(error)
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("name", &self.name)
            .field("gate", &self.gate)
            .finish()
    }
}

/// Build the HTTP client a source uses. The client timeout matches the gate deadline.
pub(crate) fn http_client(config: &SourceConfig) -> MarketDataResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(config.rate_limit.operation_timeout)
        .build()
        .map_err(MarketDataError::from)
}

/// Turn a non-2xx response into a source failure
pub(crate) fn ensure_success(
    source_name: &str,
    response: reqwest::Response,
) -> MarketDataResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(MarketDataError::transient(
            source_name,
            format!("HTTP {}", status.as_u16()),
        ))
    }
}

/// Parse a decimal string field, naming the field on failure
pub(crate) fn parse_decimal(source_name: &str, field: &str, raw: &str) -> MarketDataResult<f64> {
    raw.trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .map_err(|_| MarketDataError::transient(source_name, format!("field '{}' is not numeric: {:?}", field, raw)))
}

/// Require an API key before any network activity
pub(crate) fn require_api_key(source_name: &str, config: &SourceConfig) -> MarketDataResult<String> {
    match config.api_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Ok(key.to_string()),
        _ => Err(MarketDataError::config(format!(
            "{} requires an API key",
            source_name
        ))),
    }
}
