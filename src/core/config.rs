//! # Configuration Module
//!
//! This module handles configuration for the gateway: the shared cache, one rate limit per
//! external source, per-read freshness tolerances, the dashboard tile layout, and
//! observability.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Environment variable override support (`MARKET_GATEWAY_*`)
//! - Validation that collects every problem into one error message
//!
//! Durations are written in humantime form (`30s`, `10m`, `24h`).

use crate::caching::CacheConfig;
use crate::core::error::{MarketDataError, MarketDataResult};
use crate::dashboard::DashboardConfig;
use crate::observability::logging::LogFormat;
use crate::observability::ObservabilityConfig;
use crate::sources::{Freshness, OrderBookConfig};
use crate::traffic::RateLimitPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Shared TTL cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// External source endpoints, credentials and rate limits
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Maximum age tolerated per kind of read
    #[serde(default)]
    pub freshness: Freshness,

    /// Tiles the dashboard refreshes
    #[serde(default)]
    pub dashboard: DashboardConfig,

    /// Logging and metrics
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> MarketDataResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MarketDataError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_yaml::from_str(&content)
            .map_err(|e| MarketDataError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from JSON
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> MarketDataResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MarketDataError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_json::from_str(&content)
            .map_err(|e| MarketDataError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: MARKET_GATEWAY_<SECTION>_<FIELD>
    /// For example: MARKET_GATEWAY_FRED_API_KEY=abc123
    pub fn apply_env_overrides(&mut self) -> MarketDataResult<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides_from<L>(&mut self, lookup: L) -> MarketDataResult<()>
    where
        L: Fn(&str) -> Option<String>,
    {
        let duration = |name: &str| -> MarketDataResult<Option<Duration>> {
            lookup(name)
                .map(|raw| {
                    humantime::parse_duration(&raw)
                        .map_err(|e| MarketDataError::config(format!("Invalid {}: {}", name, e)))
                })
                .transpose()
        };

        // Cache overrides
        if let Some(value) = duration("MARKET_GATEWAY_CACHE_SWEEP_INTERVAL")? {
            self.cache.sweep_interval = value;
        }
        if let Some(value) = duration("MARKET_GATEWAY_CACHE_MAX_ENTRY_AGE")? {
            self.cache.max_entry_age = value;
        }

        // Per-source overrides
        let sources = [
            ("ALPHA_VANTAGE", &mut self.sources.alpha_vantage),
            ("COINBASE", &mut self.sources.coinbase),
            ("FRED", &mut self.sources.fred),
            ("NEWS", &mut self.sources.news),
        ];
        for (prefix, source) in sources {
            if let Some(key) = lookup(&format!("MARKET_GATEWAY_{}_API_KEY", prefix)) {
                source.api_key = Some(key);
            }
            if let Some(url) = lookup(&format!("MARKET_GATEWAY_{}_BASE_URL", prefix)) {
                source.base_url = url;
            }
            let limit_var = format!("MARKET_GATEWAY_{}_RATE_LIMIT", prefix);
            if let Some(limit) = lookup(&limit_var) {
                source.rate_limit.limit = limit
                    .parse()
                    .map_err(|e| MarketDataError::config(format!("Invalid {}: {}", limit_var, e)))?;
            }
            if let Some(value) = duration(&format!("MARKET_GATEWAY_{}_RATE_WINDOW", prefix))? {
                source.rate_limit.window = value;
            }
            if let Some(value) = duration(&format!("MARKET_GATEWAY_{}_TIMEOUT", prefix))? {
                source.rate_limit.operation_timeout = value;
            }
        }

        if let Some(value) = duration("MARKET_GATEWAY_REFRESH_INTERVAL")? {
            self.dashboard.refresh_interval = value;
        }

        // Logging configuration overrides
        if let Some(level) = lookup("MARKET_GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = level;
        }
        if let Some(format) = lookup("MARKET_GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(MarketDataError::config(format!(
                        "Invalid MARKET_GATEWAY_LOG_FORMAT: {}",
                        other
                    )))
                }
            };
        }

        // Metrics configuration overrides
        if let Some(enabled) = lookup("MARKET_GATEWAY_METRICS_ENABLED") {
            self.observability.metrics.enabled = enabled.parse().map_err(|e| {
                MarketDataError::config(format!("Invalid MARKET_GATEWAY_METRICS_ENABLED: {}", e))
            })?;
        }
        if let Some(address) = lookup("MARKET_GATEWAY_METRICS_ADDRESS") {
            self.observability.metrics.listen_address = address;
        }

        Ok(())
    }

    /// Comprehensive configuration validation with detailed error messages
    pub fn validate(&self) -> MarketDataResult<()> {
        let mut errors = Vec::new();

        // Cache housekeeping
        if self.cache.sweep_interval.is_zero() {
            errors.push("cache.sweep_interval must be greater than 0".to_string());
        }
        if self.cache.max_entry_age.is_zero() {
            errors.push("cache.max_entry_age must be greater than 0".to_string());
        }

        // A read tolerance above the sweep ceiling could never be satisfied
        for (name, max_age) in self.freshness.entries() {
            if max_age > self.cache.max_entry_age {
                errors.push(format!(
                    "freshness.{} ({}) exceeds cache.max_entry_age ({})",
                    name,
                    humantime::format_duration(max_age),
                    humantime::format_duration(self.cache.max_entry_age)
                ));
            }
        }

        for (name, source) in self.sources.iter() {
            if let Err(e) = source.rate_limit.validate() {
                errors.push(format!("sources.{}: {}", name, e));
            }
            if let Err(e) = Url::parse(&source.base_url) {
                errors.push(format!("sources.{}.base_url is invalid: {}", name, e));
            }
        }

        if self.sources.coinbase_products.is_empty() {
            errors.push("sources.coinbase_products cannot be empty".to_string());
        }
        if self.sources.news_model.trim().is_empty() {
            errors.push("sources.news_model cannot be empty".to_string());
        }

        let feed = &self.sources.coinbase_feed;
        match Url::parse(&feed.url) {
            Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
            Ok(url) => errors.push(format!(
                "sources.coinbase_feed.url must use ws or wss, got {}",
                url.scheme()
            )),
            Err(e) => errors.push(format!("sources.coinbase_feed.url is invalid: {}", e)),
        }
        if feed.product_id.trim().is_empty() {
            errors.push("sources.coinbase_feed.product_id cannot be empty".to_string());
        }
        if feed.connection_timeout.is_zero() {
            errors.push("sources.coinbase_feed.connection_timeout must be greater than 0".to_string());
        }

        // Dashboard layout
        if self.dashboard.refresh_interval.is_zero() {
            errors.push("dashboard.refresh_interval must be greater than 0".to_string());
        }
        if self.dashboard.equities.is_empty()
            && self.dashboard.crypto.is_empty()
            && self.dashboard.macro_cards.is_empty()
            && !self.dashboard.include_headlines
        {
            errors.push("dashboard must configure at least one tile".to_string());
        }
        for tile in self.dashboard.equities.iter().chain(self.dashboard.crypto.iter()) {
            if tile.symbol.trim().is_empty() {
                errors.push("dashboard tile has empty symbol".to_string());
            }
        }
        for tile in &self.dashboard.crypto {
            let symbol = tile.symbol.trim().to_uppercase();
            if !self.sources.coinbase_products.contains_key(&symbol) {
                errors.push(format!(
                    "dashboard crypto tile '{}' has no entry in sources.coinbase_products",
                    tile.symbol
                ));
            }
        }
        for card in &self.dashboard.macro_cards {
            if card.series_id.trim().is_empty() {
                errors.push("dashboard macro card has empty series_id".to_string());
            }
            if card.limit < 2 {
                errors.push(format!(
                    "dashboard macro card '{}' needs a limit of at least 2",
                    card.series_id
                ));
            }
        }

        if self.observability.metrics.enabled
            && self
                .observability
                .metrics
                .listen_address
                .parse::<std::net::SocketAddr>()
                .is_err()
        {
            errors.push(format!(
                "observability.metrics.listen_address is invalid: {}",
                self.observability.metrics.listen_address
            ));
        }

        if !errors.is_empty() {
            return Err(MarketDataError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

/// Connection settings for one external source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Endpoint the client builds requests against
    pub base_url: String,

    /// Credential, when the source needs one
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Outbound rate limit, enforced by the source's request gate
    pub rate_limit: RateLimitPolicy,
}

fn default_user_agent() -> String {
    format!("market-data-gateway/{}", env!("CARGO_PKG_VERSION"))
}

impl SourceConfig {
    fn new(base_url: &str, rate_limit: RateLimitPolicy) -> Self {
        Self {
            base_url: base_url.to_string(),
            api_key: None,
            user_agent: default_user_agent(),
            rate_limit,
        }
    }

    /// Alpha Vantage free tier: 5 calls per minute, with a one second courtesy gap
    pub fn alpha_vantage() -> Self {
        Self::new(
            "https://www.alphavantage.co/query",
            RateLimitPolicy::new(5, Duration::from_secs(60))
                .with_inter_request_delay(Duration::from_secs(1)),
        )
    }

    pub fn coinbase() -> Self {
        Self::new(
            "https://api.exchange.coinbase.com",
            RateLimitPolicy::new(10, Duration::from_secs(1)),
        )
    }

    pub fn fred() -> Self {
        Self::new(
            "https://api.stlouisfed.org/fred/series/observations",
            RateLimitPolicy::new(120, Duration::from_secs(60)),
        )
    }

    /// Gemini `generateContent`; headline generation is slow and tightly metered
    pub fn news() -> Self {
        Self::new(
            "https://generativelanguage.googleapis.com/v1beta/models",
            RateLimitPolicy::new(1, Duration::from_secs(12))
                .with_operation_timeout(Duration::from_secs(60)),
        )
    }
}

/// All external sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "SourceConfig::alpha_vantage")]
    pub alpha_vantage: SourceConfig,

    #[serde(default = "SourceConfig::coinbase")]
    pub coinbase: SourceConfig,

    #[serde(default = "SourceConfig::fred")]
    pub fred: SourceConfig,

    #[serde(default = "SourceConfig::news")]
    pub news: SourceConfig,

    /// Ticker symbol to Coinbase product id
    #[serde(default = "default_coinbase_products")]
    pub coinbase_products: BTreeMap<String, String>,

    /// Model used for headline generation
    #[serde(default = "default_news_model")]
    pub news_model: String,

    /// Live best bid/ask stream
    #[serde(default)]
    pub coinbase_feed: OrderBookConfig,
}

fn default_coinbase_products() -> BTreeMap<String, String> {
    [("BTC", "BTC-USD"), ("ETH", "ETH-USD"), ("SOL", "SOL-USD")]
        .into_iter()
        .map(|(symbol, product)| (symbol.to_string(), product.to_string()))
        .collect()
}

fn default_news_model() -> String {
    "gemini-1.5-flash".to_string()
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            alpha_vantage: SourceConfig::alpha_vantage(),
            coinbase: SourceConfig::coinbase(),
            fred: SourceConfig::fred(),
            news: SourceConfig::news(),
            coinbase_products: default_coinbase_products(),
            news_model: default_news_model(),
            coinbase_feed: OrderBookConfig::default(),
        }
    }
}

impl SourcesConfig {
    /// Each source with its configuration key
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &SourceConfig)> {
        [
            ("alpha_vantage", &self.alpha_vantage),
            ("coinbase", &self.coinbase),
            ("fred", &self.fred),
            ("news", &self.news),
        ]
        .into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config_validation() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_source_limits() {
        let sources = SourcesConfig::default();
        assert_eq!(sources.alpha_vantage.rate_limit.limit, 5);
        assert_eq!(
            sources.alpha_vantage.rate_limit.inter_request_delay,
            Duration::from_secs(1)
        );
        assert_eq!(sources.coinbase.rate_limit.window, Duration::from_secs(1));
        assert_eq!(sources.news.rate_limit.window, Duration::from_secs(12));
        assert!(sources.fred.api_key.is_none());
    }

    #[test]
    fn test_config_serialization_yaml() {
        let config = GatewayConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: GatewayConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.sources.coinbase, deserialized.sources.coinbase);
        assert_eq!(config.freshness, deserialized.freshness);
        assert_eq!(config.cache.max_entry_age, deserialized.cache.max_entry_age);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
sources:
  fred:
    base_url: "http://localhost:9999/fred"
    api_key: "secret"
    rate_limit:
      limit: 2
      window: 10s
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.sources.fred.api_key.as_deref(), Some("secret"));
        assert_eq!(config.sources.fred.rate_limit.limit, 2);
        assert_eq!(config.sources.coinbase, SourceConfig::coinbase());
        assert_eq!(config.freshness, Freshness::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let mut config = GatewayConfig::default();
        config
            .apply_overrides_from(lookup(&[
                ("MARKET_GATEWAY_ALPHA_VANTAGE_API_KEY", "demo"),
                ("MARKET_GATEWAY_COINBASE_RATE_LIMIT", "3"),
                ("MARKET_GATEWAY_NEWS_TIMEOUT", "90s"),
                ("MARKET_GATEWAY_CACHE_MAX_ENTRY_AGE", "48h"),
                ("MARKET_GATEWAY_LOG_FORMAT", "JSON"),
                ("MARKET_GATEWAY_METRICS_ENABLED", "true"),
            ]))
            .unwrap();

        assert_eq!(config.sources.alpha_vantage.api_key.as_deref(), Some("demo"));
        assert_eq!(config.sources.coinbase.rate_limit.limit, 3);
        assert_eq!(
            config.sources.news.rate_limit.operation_timeout,
            Duration::from_secs(90)
        );
        assert_eq!(config.cache.max_entry_age, Duration::from_secs(48 * 3600));
        assert_eq!(config.observability.logging.format, LogFormat::Json);
        assert!(config.observability.metrics.enabled);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = GatewayConfig::default();
        let err = config
            .apply_overrides_from(lookup(&[("MARKET_GATEWAY_FRED_RATE_WINDOW", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("MARKET_GATEWAY_FRED_RATE_WINDOW"));
    }

    #[test]
    fn test_freshness_above_ceiling_is_rejected() {
        let mut config = GatewayConfig::default();
        config.cache.max_entry_age = Duration::from_secs(3600);

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("freshness.macro_series"));
        assert!(!err.contains("freshness.quote"));
    }

    #[test]
    fn test_order_book_feed_validation() {
        let mut config = GatewayConfig::default();
        assert_eq!(config.sources.coinbase_feed.max_reconnect_attempts, 3);
        assert_eq!(config.sources.coinbase_feed.connection_timeout, Duration::from_secs(6));

        config.sources.coinbase_feed.url = "https://ws-feed.exchange.coinbase.com".to_string();
        config.sources.coinbase_feed.connection_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must use ws or wss"));
        assert!(err.contains("coinbase_feed.connection_timeout"));
    }

    #[test]
    fn test_crypto_tile_symbol_case_is_ignored() {
        let mut config = GatewayConfig::default();
        config.dashboard.crypto[0].symbol = " btc ".to_string();
        assert!(config.validate().is_ok());

        config.dashboard.crypto[0].symbol = "doge".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'doge'"));
    }

    #[test]
    fn test_validation_collects_errors() {
        let mut config = GatewayConfig::default();
        config.sources.coinbase.rate_limit.limit = 0;
        config.sources.fred.base_url = "not a url".to_string();
        config.dashboard.refresh_interval = Duration::ZERO;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("sources.coinbase"));
        assert!(err.contains("sources.fred.base_url"));
        assert!(err.contains("dashboard.refresh_interval"));
    }
}
