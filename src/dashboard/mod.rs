//! # Dashboard Aggregation
//!
//! `MarketDataHub` owns the shared cache and one client (with its own request gate) per
//! source, and turns a configured tile layout into a `DashboardSnapshot`.
//!
//! Each tile is either `Ready`, possibly flagged stale when it is a degraded fallback, or
//! `Unavailable` with the reason. A failed source never produces made-up numbers.

use crate::caching::{CacheStats, TtlCache};
use crate::core::config::GatewayConfig;
use crate::core::error::MarketDataResult;
use crate::sources::alpha_vantage::EquitySnapshot;
use crate::sources::coinbase::CryptoQuote;
use crate::sources::fred::{MacroSeries, SeriesMetrics};
use crate::sources::news::Headlines;
use crate::sources::{
    AlphaVantageClient, CoinbaseClient, DataSource, FeedState, Fetched, FredClient, NewsClient,
    OrderBookFeed, SharedCache,
};
use crate::traffic::{GateState, GateStats};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// One price tile in the layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileSpec {
    pub symbol: String,
    pub label: String,
    /// Symbol to show instead when `symbol` cannot be fetched
    #[serde(default)]
    pub fallback: Option<String>,
}

impl TileSpec {
    fn new(symbol: &str, label: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            label: label.to_string(),
            fallback: None,
        }
    }
}

/// One macro card in the layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroCardSpec {
    pub series_id: String,
    #[serde(default = "default_series_limit")]
    pub limit: u32,
    /// Report the period change as a compounded annual rate (quarterly series)
    #[serde(default)]
    pub annualize: bool,
}

fn default_series_limit() -> u32 {
    24
}

impl MacroCardSpec {
    fn new(series_id: &str, limit: u32, annualize: bool) -> Self {
        Self {
            series_id: series_id.to_string(),
            limit,
            annualize,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// How often the binary rebuilds the snapshot
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    pub equities: Vec<TileSpec>,
    pub crypto: Vec<TileSpec>,
    pub macro_cards: Vec<MacroCardSpec>,
    pub include_headlines: bool,
    pub include_sparklines: bool,
    /// Run the live best bid/ask feed alongside the polled tiles
    pub include_order_book: bool,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            equities: vec![
                TileSpec::new("QQQ", "NASDAQ 100 ETF"),
                TileSpec::new("SPY", "S&P 500 ETF"),
                TileSpec {
                    fallback: Some("IYT".to_string()),
                    ..TileSpec::new("DJT", "Dow Transportation")
                },
            ],
            crypto: vec![
                TileSpec::new("BTC", "Bitcoin"),
                TileSpec::new("ETH", "Ethereum"),
                TileSpec::new("SOL", "Solana"),
            ],
            macro_cards: vec![
                MacroCardSpec::new("GDPC1", 20, true),
                MacroCardSpec::new("CPIAUCSL", 24, false),
                MacroCardSpec::new("UNRATE", 24, false),
                MacroCardSpec::new("T10Y2Y", 30, false),
                MacroCardSpec::new("AUSTHPI", 24, false),
            ],
            include_headlines: true,
            include_sparklines: true,
            include_order_book: true,
        }
    }
}

/// What a widget renders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TileState<T> {
    Ready { data: T, stale: bool },
    Unavailable { reason: String },
}

impl<T> TileState<T> {
    pub fn from_result(result: MarketDataResult<Fetched<T>>) -> Self {
        match result {
            Ok(fetched) => TileState::Ready {
                stale: fetched.is_stale(),
                data: fetched.value,
            },
            Err(e) => TileState::Unavailable {
                reason: e.to_string(),
            },
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, TileState::Ready { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, TileState::Ready { stale: true, .. })
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            TileState::Ready { data, .. } => Some(data),
            TileState::Unavailable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tile<T> {
    /// Symbol whose data the tile shows
    pub symbol: String,
    pub label: String,
    /// The configured symbol this tile stands in for, when a fallback was used
    pub proxy_for: Option<String>,
    pub state: TileState<T>,
}

/// A macro series with its derived metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroCard {
    pub series: MacroSeries,
    pub metrics: Option<SeriesMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    /// Correlates the snapshot with the log lines of its refresh
    pub id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub equities: Vec<Tile<EquitySnapshot>>,
    pub crypto: Vec<Tile<CryptoQuote>>,
    pub macro_cards: Vec<Tile<MacroCard>>,
    pub headlines: Option<TileState<Headlines>>,
    pub order_book: Option<FeedState>,
}

impl DashboardSnapshot {
    fn states(&self) -> impl Iterator<Item = (bool, bool)> + '_ {
        let tiles = self
            .equities
            .iter()
            .map(|t| (t.state.is_ready(), t.state.is_stale()))
            .chain(self.crypto.iter().map(|t| (t.state.is_ready(), t.state.is_stale())))
            .chain(
                self.macro_cards
                    .iter()
                    .map(|t| (t.state.is_ready(), t.state.is_stale())),
            );
        tiles
            .chain(
                self.headlines
                    .iter()
                    .map(|state| (state.is_ready(), state.is_stale())),
            )
            .chain(self.order_book.iter().map(|state| (!state.is_unavailable(), false)))
    }

    pub fn unavailable_count(&self) -> usize {
        self.states().filter(|(ready, _)| !ready).count()
    }

    pub fn stale_count(&self) -> usize {
        self.states().filter(|(_, stale)| *stale).count()
    }
}

/// Gate state for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDiagnostics {
    pub name: String,
    pub queue_depth: usize,
    pub in_window: usize,
    pub limit: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub state: GateState,
    pub stats: GateStats,
}

impl SourceDiagnostics {
    fn of(source: &DataSource) -> Self {
        let gate = source.gate();
        Self {
            name: source.name().to_string(),
            queue_depth: gate.queue_depth(),
            in_window: gate.in_window(),
            limit: gate.policy().limit,
            window: gate.policy().window,
            state: gate.state(),
            stats: gate.stats(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubDiagnostics {
    pub cache: CacheStats,
    pub sources: Vec<SourceDiagnostics>,
}

/// Owns the shared cache and every source client
pub struct MarketDataHub {
    config: GatewayConfig,
    cache: SharedCache,
    alpha_vantage: AlphaVantageClient,
    coinbase: CoinbaseClient,
    fred: FredClient,
    news: NewsClient,
    order_book: Option<OrderBookFeed>,
}

impl MarketDataHub {
    /// Validate `config` and build the cache plus one gated client per source.
    ///
    /// Must be called inside a tokio runtime so the cache sweeper and the order book feed
    /// can start.
    pub fn new(config: GatewayConfig) -> MarketDataResult<Self> {
        config.validate()?;

        let cache: SharedCache = Arc::new(TtlCache::new(config.cache.clone()));
        let sources = &config.sources;
        let freshness = &config.freshness;

        let alpha_vantage =
            AlphaVantageClient::new(sources.alpha_vantage.clone(), freshness.clone(), cache.clone())?;
        let coinbase = CoinbaseClient::new(
            sources.coinbase.clone(),
            sources.coinbase_products.clone(),
            freshness.clone(),
            cache.clone(),
        )?;
        let fred = FredClient::new(sources.fred.clone(), freshness.clone(), cache.clone())?;
        let news = NewsClient::new(
            sources.news.clone(),
            sources.news_model.clone(),
            freshness.clone(),
            cache.clone(),
        )?;

        let order_book = config
            .dashboard
            .include_order_book
            .then(|| OrderBookFeed::spawn(sources.coinbase_feed.clone()));

        info!(
            order_book = order_book.is_some(),
            equities = config.dashboard.equities.len(),
            crypto = config.dashboard.crypto.len(),
            macro_cards = config.dashboard.macro_cards.len(),
            "Market data hub initialized"
        );

        Ok(Self {
            config,
            cache,
            alpha_vantage,
            coinbase,
            fred,
            news,
            order_book,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn alpha_vantage(&self) -> &AlphaVantageClient {
        &self.alpha_vantage
    }

    pub fn coinbase(&self) -> &CoinbaseClient {
        &self.coinbase
    }

    pub fn fred(&self) -> &FredClient {
        &self.fred
    }

    pub fn news(&self) -> &NewsClient {
        &self.news
    }

    pub fn order_book(&self) -> Option<&OrderBookFeed> {
        self.order_book.as_ref()
    }

    fn sources(&self) -> [&DataSource; 4] {
        [
            self.alpha_vantage.source(),
            self.coinbase.source(),
            self.fred.source(),
            self.news.source(),
        ]
    }

    /// Refresh every configured tile. Sources are queried concurrently; each source's
    /// gate still serializes its own calls.
    pub async fn snapshot(&self) -> DashboardSnapshot {
        let layout = &self.config.dashboard;

        let equities = join_all(layout.equities.iter().map(|spec| self.equity_tile(spec)));
        let crypto = join_all(layout.crypto.iter().map(|spec| self.crypto_tile(spec)));
        let macro_cards = join_all(layout.macro_cards.iter().map(|spec| self.macro_tile(spec)));
        let headlines = async {
            if layout.include_headlines {
                Some(TileState::from_result(self.news.headlines().await))
            } else {
                None
            }
        };

        let (equities, crypto, macro_cards, headlines) =
            tokio::join!(equities, crypto, macro_cards, headlines);

        let snapshot = DashboardSnapshot {
            id: Uuid::new_v4(),
            generated_at: Utc::now(),
            equities,
            crypto,
            macro_cards,
            headlines,
            order_book: self.order_book.as_ref().map(OrderBookFeed::state),
        };

        info!(
            snapshot_id = %snapshot.id,
            unavailable = snapshot.unavailable_count(),
            stale = snapshot.stale_count(),
            cache_entries = self.cache.len(),
            "Dashboard snapshot refreshed"
        );
        snapshot
    }

    async fn equity(&self, symbol: &str) -> MarketDataResult<Fetched<EquitySnapshot>> {
        if self.config.dashboard.include_sparklines {
            self.alpha_vantage.symbol_snapshot(symbol).await
        } else {
            let quote = self.alpha_vantage.global_quote(symbol).await?;
            Ok(quote.map(|quote| EquitySnapshot::from_quote(quote, None)))
        }
    }

    async fn equity_tile(&self, spec: &TileSpec) -> Tile<EquitySnapshot> {
        let primary = self.equity(&spec.symbol).await;

        let fallback = match (&primary, &spec.fallback) {
            (Err(primary_error), Some(fallback)) => {
                warn!(
                    symbol = %spec.symbol,
                    fallback = %fallback,
                    error = %primary_error,
                    "Primary symbol unavailable, trying fallback"
                );
                Some((fallback, self.equity(fallback).await))
            }
            _ => None,
        };

        let (symbol, proxy_for, state) = match (primary, fallback) {
            (_, Some((fallback, Ok(fetched)))) => (
                fallback.clone(),
                Some(spec.symbol.clone()),
                TileState::from_result(Ok(fetched)),
            ),
            (Err(primary_error), Some((fallback, Err(fallback_error)))) => (
                spec.symbol.clone(),
                None,
                TileState::Unavailable {
                    reason: format!("{}; fallback {}: {}", primary_error, fallback, fallback_error),
                },
            ),
            (result, _) => (spec.symbol.clone(), None, TileState::from_result(result)),
        };

        Tile {
            symbol,
            label: spec.label.clone(),
            proxy_for,
            state,
        }
    }

    async fn crypto_tile(&self, spec: &TileSpec) -> Tile<CryptoQuote> {
        Tile {
            symbol: spec.symbol.clone(),
            label: spec.label.clone(),
            proxy_for: None,
            state: TileState::from_result(self.coinbase.stats_24h(&spec.symbol).await),
        }
    }

    async fn macro_tile(&self, spec: &MacroCardSpec) -> Tile<MacroCard> {
        let result = self.fred.series(&spec.series_id, spec.limit).await;
        let label = result
            .as_ref()
            .ok()
            .and_then(|fetched| fetched.value.info.as_ref())
            .map(|info| info.name.clone())
            .unwrap_or_else(|| spec.series_id.clone());

        let annualize = spec.annualize;
        let result = result.map(|fetched| {
            fetched.map(|series| MacroCard {
                metrics: SeriesMetrics::compute(&series.observations, annualize),
                series,
            })
        });

        Tile {
            symbol: spec.series_id.clone(),
            label,
            proxy_for: None,
            state: TileState::from_result(result),
        }
    }

    /// Drop every cached value so the next snapshot goes to the network
    pub fn force_refresh(&self) {
        self.cache.clear();
        info!("Forced refresh, cache cleared");
    }

    pub fn diagnostics(&self) -> HubDiagnostics {
        HubDiagnostics {
            cache: self.cache.stats(),
            sources: self.sources().into_iter().map(SourceDiagnostics::of).collect(),
        }
    }

    /// Stop the order book feed, close every gate and wait for their queues to drain
    pub async fn shutdown(&self, timeout: Duration) -> MarketDataResult<()> {
        if let Some(feed) = &self.order_book {
            feed.stop();
        }

        let sources = self.sources();
        for source in sources {
            source.gate().start_shutdown();
        }

        let results = join_all(sources.iter().map(|source| source.gate().wait_for_empty(timeout))).await;
        match results.into_iter().find_map(Result::err) {
            Some(error) => Err(error),
            None => {
                info!("All request gates drained");
                Ok(())
            }
        }
    }
}
