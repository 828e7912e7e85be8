//! Alpha Vantage client for equity quotes and intraday sparklines
//!
//! API Documentation: https://www.alphavantage.co/documentation/
//!
//! Endpoints used:
//! 1. function=GLOBAL_QUOTE - latest price, change, day range
//! 2. function=TIME_SERIES_INTRADAY - intraday bars for sparklines
//!
//! Alpha Vantage reports throttling and bad requests inside a 200 response, under
//! `Error Message`, `Note` or `Information`. Those payloads are treated as source failures.

use super::{ensure_success, http_client, parse_decimal, require_api_key, DataSource, Fetched, Freshness, SharedCache};
use crate::core::config::SourceConfig;
use crate::core::error::{MarketDataError, MarketDataResult};
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Source name, also the cache namespace
pub const NAME: &str = "alpha_vantage";

/// Sparklines keep this many of the most recent bars
pub const SPARKLINE_POINTS: usize = 20;

/// Bar interval used for dashboard sparklines
pub const DEFAULT_INTERVAL: &str = "5min";

const INTERVALS: [&str; 5] = ["1min", "5min", "15min", "30min", "60min"];

/// Fields that carry an error or throttling notice in an otherwise successful response
const ERROR_FIELDS: [&str; 3] = ["Error Message", "Note", "Information"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityQuote {
    pub symbol: String,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub volume: u64,
    pub previous_close: f64,
    pub high: f64,
    pub low: f64,
    pub latest_trading_day: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparkPoint {
    /// Bar timestamp as reported, US/Eastern
    pub time: String,
    pub price: f64,
    pub volume: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sparkline {
    pub symbol: String,
    pub interval: String,
    /// Oldest first
    pub points: Vec<SparkPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DayRange {
    pub high: f64,
    pub low: f64,
}

/// Regular-session state of the US equity market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketStatus {
    Open,
    Closed,
}

/// Everything an equity tile shows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub symbol: String,
    pub quote: EquityQuote,
    /// Absent when the intraday series could not be fetched
    pub sparkline: Option<Sparkline>,
    pub range: DayRange,
    pub market_status: MarketStatus,
}

impl EquitySnapshot {
    pub fn from_quote(quote: EquityQuote, sparkline: Option<Sparkline>) -> Self {
        Self {
            symbol: quote.symbol.clone(),
            range: DayRange {
                high: quote.high,
                low: quote.low,
            },
            quote,
            sparkline,
            market_status: market_status_at(Utc::now()),
        }
    }
}

pub struct AlphaVantageClient {
    source: DataSource,
    http: reqwest::Client,
    config: SourceConfig,
    freshness: Freshness,
}

impl AlphaVantageClient {
    pub fn new(config: SourceConfig, freshness: Freshness, cache: SharedCache) -> MarketDataResult<Self> {
        let http = http_client(&config)?;
        let source = DataSource::new(NAME, config.rate_limit.clone(), cache);

        Ok(Self {
            source,
            http,
            config,
            freshness,
        })
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    /// Latest quote for `symbol`
    pub async fn global_quote(&self, symbol: &str) -> MarketDataResult<Fetched<EquityQuote>> {
        let symbol = normalize_symbol(symbol)?;
        let api_key = require_api_key(NAME, &self.config)?;

        let request = self.http.get(&self.config.base_url).query(&[
            ("function", "GLOBAL_QUOTE"),
            ("symbol", symbol.as_str()),
            ("apikey", api_key.as_str()),
        ]);

        self.source
            .fetch_with_policy(&format!("quote_{}", symbol), self.freshness.quote, move || async move {
                let payload = send(request).await?;
                parse_global_quote(&payload)
            })
            .await
    }

    /// The most recent intraday bars for `symbol`, oldest first
    pub async fn intraday(&self, symbol: &str, interval: &str) -> MarketDataResult<Fetched<Sparkline>> {
        let symbol = normalize_symbol(symbol)?;
        if !INTERVALS.contains(&interval) {
            return Err(MarketDataError::unknown_key(NAME, format!("interval {}", interval)));
        }
        let api_key = require_api_key(NAME, &self.config)?;

        let request = self.http.get(&self.config.base_url).query(&[
            ("function", "TIME_SERIES_INTRADAY"),
            ("symbol", symbol.as_str()),
            ("interval", interval),
            ("apikey", api_key.as_str()),
        ]);

        let key = format!("intraday_{}_{}", symbol, interval);
        let interval = interval.to_string();
        self.source
            .fetch_with_policy(&key, self.freshness.sparkline, move || async move {
                let payload = send(request).await?;
                parse_intraday(&payload, &symbol, &interval)
            })
            .await
    }

    /// Quote plus sparkline for a tile. The quote is required, the sparkline is not.
    pub async fn symbol_snapshot(&self, symbol: &str) -> MarketDataResult<Fetched<EquitySnapshot>> {
        let (quote, sparkline) = tokio::join!(
            self.global_quote(symbol),
            self.intraday(symbol, DEFAULT_INTERVAL)
        );

        let quote = quote?;
        let sparkline = match sparkline {
            Ok(fetched) => Some(fetched.value),
            Err(e) => {
                tracing::debug!(source = NAME, symbol, error = %e, "Sparkline unavailable");
                None
            }
        };

        Ok(quote.map(|quote| EquitySnapshot::from_quote(quote, sparkline)))
    }
}

fn normalize_symbol(symbol: &str) -> MarketDataResult<String> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
        return Err(MarketDataError::unknown_key(NAME, symbol));
    }
    Ok(symbol)
}

async fn send(request: reqwest::RequestBuilder) -> MarketDataResult<Value> {
    let response = ensure_success(NAME, request.send().await?)?;
    let payload: Value = response.json().await?;
    check_error_fields(&payload)?;
    Ok(payload)
}

fn check_error_fields(payload: &Value) -> MarketDataResult<()> {
    for field in ERROR_FIELDS {
        if let Some(message) = payload.get(field) {
            let message = message.as_str().unwrap_or("unspecified").to_string();
            return Err(MarketDataError::transient(NAME, format!("{}: {}", field, message)));
        }
    }
    Ok(())
}

fn text<'a>(object: &'a Map<String, Value>, field: &str) -> MarketDataResult<&'a str> {
    object
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| MarketDataError::transient(NAME, format!("missing field '{}'", field)))
}

fn number(object: &Map<String, Value>, field: &str) -> MarketDataResult<f64> {
    parse_decimal(NAME, field, text(object, field)?)
}

fn count(object: &Map<String, Value>, field: &str) -> MarketDataResult<u64> {
    let raw = text(object, field)?;
    raw.trim()
        .parse()
        .map_err(|_| MarketDataError::transient(NAME, format!("field '{}' is not an integer: {:?}", field, raw)))
}

pub(crate) fn parse_global_quote(payload: &Value) -> MarketDataResult<EquityQuote> {
    let quote = payload
        .get("Global Quote")
        .and_then(Value::as_object)
        .filter(|quote| !quote.is_empty())
        .ok_or_else(|| MarketDataError::transient(NAME, "No quote data available"))?;

    Ok(EquityQuote {
        symbol: text(quote, "01. symbol")?.to_string(),
        price: number(quote, "05. price")?,
        change: number(quote, "09. change")?,
        change_percent: number(quote, "10. change percent")?,
        volume: count(quote, "06. volume")?,
        previous_close: number(quote, "08. previous close")?,
        high: number(quote, "03. high")?,
        low: number(quote, "04. low")?,
        latest_trading_day: quote
            .get("07. latest trading day")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

pub(crate) fn parse_intraday(payload: &Value, symbol: &str, interval: &str) -> MarketDataResult<Sparkline> {
    let series = payload
        .get(&format!("Time Series ({})", interval))
        .and_then(Value::as_object)
        .filter(|series| !series.is_empty())
        .ok_or_else(|| MarketDataError::transient(NAME, "No intraday data available"))?;

    // Timestamps are "YYYY-MM-DD HH:MM:SS", so lexical order is chronological
    let mut bars: Vec<(&String, &Value)> = series.iter().collect();
    bars.sort_by(|a, b| a.0.cmp(b.0));
    let skip = bars.len().saturating_sub(SPARKLINE_POINTS);

    let points = bars
        .into_iter()
        .skip(skip)
        .map(|(time, bar)| {
            let bar = bar
                .as_object()
                .ok_or_else(|| MarketDataError::transient(NAME, format!("malformed bar at {}", time)))?;
            Ok(SparkPoint {
                time: time.clone(),
                price: number(bar, "4. close")?,
                volume: count(bar, "5. volume")?,
            })
        })
        .collect::<MarketDataResult<Vec<_>>>()?;

    Ok(Sparkline {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        points,
    })
}

/// US regular session, 09:30 to 16:00 in New York, Monday to Friday.
///
/// Exchange holidays are not modelled.
pub fn market_status_at(now: DateTime<Utc>) -> MarketStatus {
    let local = now.with_timezone(&New_York);
    let minutes = local.hour() * 60 + local.minute();

    let weekday_open = !matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
    if weekday_open && (570..960).contains(&minutes) {
        MarketStatus::Open
    } else {
        MarketStatus::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_parse_global_quote() {
        let payload = json!({
            "Global Quote": {
                "01. symbol": "SPY",
                "02. open": "510.00",
                "03. high": "514.20",
                "04. low": "509.10",
                "05. price": "512.25",
                "06. volume": "61234567",
                "07. latest trading day": "2024-03-08",
                "08. previous close": "510.75",
                "09. change": "1.50",
                "10. change percent": "0.2937%"
            }
        });

        let quote = parse_global_quote(&payload).unwrap();
        assert_eq!(quote.symbol, "SPY");
        assert_eq!(quote.price, 512.25);
        assert_eq!(quote.change_percent, 0.2937);
        assert_eq!(quote.volume, 61_234_567);
        assert_eq!(quote.latest_trading_day.as_deref(), Some("2024-03-08"));
    }

    #[test]
    fn test_empty_global_quote_is_failure() {
        let err = parse_global_quote(&json!({ "Global Quote": {} })).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_error_fields() {
        for field in ERROR_FIELDS {
            let mut notice = Map::new();
            notice.insert(field.to_string(), json!("Thank you for using Alpha Vantage!"));
            let err = check_error_fields(&Value::Object(notice)).unwrap_err();
            assert!(matches!(err, MarketDataError::TransientSource { .. }));
            assert!(err.to_string().contains(field));
        }
        assert!(check_error_fields(&json!({ "Global Quote": {} })).is_ok());
    }

    #[test]
    fn test_parse_intraday_keeps_latest_points_in_order() {
        let mut series = Map::new();
        for minute in 0..25 {
            series.insert(
                format!("2024-03-08 15:{:02}:00", minute),
                json!({ "4. close": format!("{}.0", 100 + minute), "5. volume": "10" }),
            );
        }
        let payload = json!({ "Time Series (5min)": Value::Object(series) });

        let sparkline = parse_intraday(&payload, "QQQ", "5min").unwrap();
        assert_eq!(sparkline.points.len(), SPARKLINE_POINTS);
        assert_eq!(sparkline.points[0].time, "2024-03-08 15:05:00");
        assert_eq!(sparkline.points[0].price, 105.0);
        assert_eq!(sparkline.points[19].price, 124.0);
    }

    #[test]
    fn test_symbol_normalization() {
        assert_eq!(normalize_symbol(" spy ").unwrap(), "SPY");
        assert_eq!(normalize_symbol("brk.b").unwrap(), "BRK.B");
        assert!(matches!(normalize_symbol(""), Err(MarketDataError::UnknownKey { .. })));
        assert!(matches!(normalize_symbol("SP Y&x=1"), Err(MarketDataError::UnknownKey { .. })));
    }

    #[test]
    fn test_market_status() {
        // Friday 2024-03-08 15:00 UTC is 10:00 EST
        let open = Utc.with_ymd_and_hms(2024, 3, 8, 15, 0, 0).unwrap();
        assert_eq!(market_status_at(open), MarketStatus::Open);

        // Same wall time before the open: 14:00 UTC is 09:00 EST
        let early = Utc.with_ymd_and_hms(2024, 3, 8, 14, 0, 0).unwrap();
        assert_eq!(market_status_at(early), MarketStatus::Closed);

        // Monday 2024-07-01 13:30 UTC is 09:30 EDT
        let summer_open = Utc.with_ymd_and_hms(2024, 7, 1, 13, 30, 0).unwrap();
        assert_eq!(market_status_at(summer_open), MarketStatus::Open);

        // Saturday
        let weekend = Utc.with_ymd_and_hms(2024, 3, 9, 16, 0, 0).unwrap();
        assert_eq!(market_status_at(weekend), MarketStatus::Closed);

        // Daylight time starts 2024-03-10: 13:45 UTC on Monday is 09:45 EDT
        let after_switch = Utc.with_ymd_and_hms(2024, 3, 11, 13, 45, 0).unwrap();
        assert_eq!(market_status_at(after_switch), MarketStatus::Open);

        // Back on standard time 2024-11-04: 20:30 UTC is 15:30 EST
        let after_fall_back = Utc.with_ymd_and_hms(2024, 11, 4, 20, 30, 0).unwrap();
        assert_eq!(market_status_at(after_fall_back), MarketStatus::Open);
        let close = Utc.with_ymd_and_hms(2024, 11, 4, 21, 0, 0).unwrap();
        assert_eq!(market_status_at(close), MarketStatus::Closed);
    }
}
