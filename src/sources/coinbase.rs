//! Coinbase Exchange client for crypto prices
//!
//! API Documentation: https://docs.cdp.coinbase.com/exchange/reference
//!
//! Endpoints used:
//! 1. /products/{product_id}/stats - 24h open, high, low, last, volume
//! 2. /products/{product_id}/ticker - latest trade with best bid/ask
//!
//! Public market data, no credentials. Symbols outside the configured product table are
//! rejected before any request is made.

use super::{ensure_success, http_client, parse_decimal, DataSource, Fetched, Freshness, SharedCache};
use crate::core::config::SourceConfig;
use crate::core::error::{MarketDataError, MarketDataResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const NAME: &str = "coinbase";

/// 24h statistics with change measured against the 24h open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoQuote {
    pub symbol: String,
    pub product_id: String,
    pub price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub change: f64,
    pub change_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotPrice {
    pub symbol: String,
    pub product_id: String,
    pub price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub time: Option<String>,
}

pub struct CoinbaseClient {
    source: DataSource,
    http: reqwest::Client,
    config: SourceConfig,
    products: BTreeMap<String, String>,
    freshness: Freshness,
}

impl CoinbaseClient {
    pub fn new(
        config: SourceConfig,
        products: BTreeMap<String, String>,
        freshness: Freshness,
        cache: SharedCache,
    ) -> MarketDataResult<Self> {
        let http = http_client(&config)?;
        let source = DataSource::new(NAME, config.rate_limit.clone(), cache);

        Ok(Self {
            source,
            http,
            config,
            products,
            freshness,
        })
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    /// Symbols this client can price
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.products.keys().map(String::as_str)
    }

    fn product(&self, symbol: &str) -> MarketDataResult<(String, String)> {
        let symbol = symbol.trim().to_uppercase();
        match self.products.get(&symbol) {
            Some(product_id) => Ok((symbol, product_id.clone())),
            None => Err(MarketDataError::unknown_key(NAME, symbol)),
        }
    }

    fn url(&self, product_id: &str, endpoint: &str) -> String {
        format!(
            "{}/products/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            product_id,
            endpoint
        )
    }

    /// 24h statistics for `symbol`
    pub async fn stats_24h(&self, symbol: &str) -> MarketDataResult<Fetched<CryptoQuote>> {
        let (symbol, product_id) = self.product(symbol)?;
        let request = self
            .http
            .get(self.url(&product_id, "stats"))
            .header("Accept", "application/json");

        self.source
            .fetch_with_policy(&format!("stats_{}", symbol), self.freshness.quote, move || async move {
                let payload = send(request).await?;
                parse_stats(&payload, &symbol, &product_id)
            })
            .await
    }

    /// Latest trade for `symbol`
    pub async fn spot_price(&self, symbol: &str) -> MarketDataResult<Fetched<SpotPrice>> {
        let (symbol, product_id) = self.product(symbol)?;
        let request = self
            .http
            .get(self.url(&product_id, "ticker"))
            .header("Accept", "application/json");

        self.source
            .fetch_with_policy(
                &format!("ticker_{}", symbol),
                self.freshness.live_ticker,
                move || async move {
                    let payload = send(request).await?;
                    parse_ticker(&payload, &symbol, &product_id)
                },
            )
            .await
    }
}

async fn send(request: reqwest::RequestBuilder) -> MarketDataResult<Value> {
    let response = ensure_success(NAME, request.send().await?)?;
    Ok(response.json().await?)
}

/// Coinbase encodes decimals as strings
fn decimal(payload: &Value, field: &str) -> MarketDataResult<f64> {
    match payload.get(field) {
        Some(Value::String(raw)) => parse_decimal(NAME, field, raw),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| MarketDataError::transient(NAME, format!("field '{}' out of range", field))),
        _ => Err(MarketDataError::transient(NAME, format!("missing field '{}'", field))),
    }
}

pub(crate) fn parse_stats(payload: &Value, symbol: &str, product_id: &str) -> MarketDataResult<CryptoQuote> {
    let price = decimal(payload, "last")?;
    let open = decimal(payload, "open")?;
    if open == 0.0 {
        return Err(MarketDataError::transient(NAME, "24h open price is zero"));
    }

    let change = price - open;
    Ok(CryptoQuote {
        symbol: symbol.to_string(),
        product_id: product_id.to_string(),
        price,
        open,
        high: decimal(payload, "high")?,
        low: decimal(payload, "low")?,
        volume: decimal(payload, "volume")?,
        change,
        change_percent: change / open * 100.0,
    })
}

pub(crate) fn parse_ticker(payload: &Value, symbol: &str, product_id: &str) -> MarketDataResult<SpotPrice> {
    Ok(SpotPrice {
        symbol: symbol.to_string(),
        product_id: product_id.to_string(),
        price: decimal(payload, "price")?,
        bid: decimal(payload, "bid").ok(),
        ask: decimal(payload, "ask").ok(),
        time: payload.get("time").and_then(Value::as_str).map(str::to_string),
    })
}
