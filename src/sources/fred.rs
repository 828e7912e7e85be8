//! FRED client for macroeconomic series
//!
//! API Documentation: https://fred.stlouisfed.org/docs/api/fred/series_observations.html
//!
//! Observations are requested newest first and returned oldest first. FRED marks missing
//! values with `"."`; those are dropped.

use super::{ensure_success, http_client, require_api_key, DataSource, Fetched, Freshness, SharedCache};
use crate::core::config::SourceConfig;
use crate::core::error::{MarketDataError, MarketDataResult};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const NAME: &str = "fred";

/// Descriptive metadata for the series the dashboard knows about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub name: String,
    pub units: String,
    pub frequency: String,
}

/// Static metadata lookup; unknown series are still fetchable, just unlabelled
pub fn series_info(series_id: &str) -> Option<SeriesInfo> {
    let (name, units, frequency) = match series_id {
        "GDPC1" => ("Real GDP", "Billions of 2017 $", "Quarterly"),
        "CPIAUCSL" => ("CPI All Urban", "Index 1982-84=100", "Monthly"),
        "UNRATE" => ("Unemployment Rate", "Percent", "Monthly"),
        "T10Y2Y" => ("10Y-2Y Treasury Spread", "Percent", "Daily"),
        "AUSTHPI" => ("Austin House Price Index", "Index Jan 2000=100", "Monthly"),
        _ => return None,
    };

    Some(SeriesInfo {
        name: name.to_string(),
        units: units.to_string(),
        frequency: frequency.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroSeries {
    pub series_id: String,
    pub info: Option<SeriesInfo>,
    /// Oldest first
    pub observations: Vec<Observation>,
    /// Date of the newest observation FRED returned, including missing ones
    pub last_update: Option<NaiveDate>,
}

/// Headline numbers derived from a series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesMetrics {
    pub current: f64,
    pub previous: f64,
    pub change: f64,
    /// None when the previous value is zero
    pub change_percent: Option<f64>,
    pub as_of: NaiveDate,
    pub year_ago: Option<f64>,
    pub year_over_year: Option<f64>,
    pub year_over_year_percent: Option<f64>,
    /// Period change compounded over four quarters
    pub annualized_rate_percent: Option<f64>,
}

impl SeriesMetrics {
    /// Compute metrics from chronologically ordered observations.
    ///
    /// Returns `None` with fewer than two observations. The year-ago value is the earliest
    /// observation dated 11 to 13 months before the latest one.
    pub fn compute(observations: &[Observation], annualize: bool) -> Option<Self> {
        let [.., previous, latest] = observations else {
            return None;
        };

        let change = latest.value - previous.value;
        let change_percent = percent_change(previous.value, latest.value);

        let year_ago = observations
            .iter()
            .find(|obs| (months_between(obs.date, latest.date) - 12).abs() <= 1)
            .map(|obs| obs.value);

        let annualized_rate_percent = change_percent
            .filter(|pct| annualize && *pct != 0.0)
            .map(|pct| ((1.0 + pct / 100.0).powi(4) - 1.0) * 100.0);

        Some(Self {
            current: latest.value,
            previous: previous.value,
            change,
            change_percent,
            as_of: latest.date,
            year_ago,
            year_over_year: year_ago.map(|ago| latest.value - ago),
            year_over_year_percent: year_ago.and_then(|ago| percent_change(ago, latest.value)),
            annualized_rate_percent,
        })
    }
}

fn percent_change(from: f64, to: f64) -> Option<f64> {
    (from != 0.0).then(|| (to - from) / from * 100.0)
}

fn months_between(earlier: NaiveDate, later: NaiveDate) -> i32 {
    (later.year() - earlier.year()) * 12 + later.month() as i32 - earlier.month() as i32
}

pub struct FredClient {
    source: DataSource,
    http: reqwest::Client,
    config: SourceConfig,
    freshness: Freshness,
}

impl FredClient {
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

    /// The latest `limit` observations of `series_id`, oldest first
    pub async fn series(&self, series_id: &str, limit: u32) -> MarketDataResult<Fetched<MacroSeries>> {
        let series_id = series_id.trim().to_uppercase();
        if series_id.is_empty() || !series_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(MarketDataError::unknown_key(NAME, series_id));
        }
        if limit == 0 {
            return Err(MarketDataError::config("FRED series limit must be positive"));
        }
        let api_key = require_api_key(NAME, &self.config)?;

        let limit_param = limit.to_string();
        let request = self.http.get(&self.config.base_url).query(&[
            ("series_id", series_id.as_str()),
            ("api_key", api_key.as_str()),
            ("file_type", "json"),
            ("limit", limit_param.as_str()),
            ("sort_order", "desc"),
        ]);

        let key = format!("series_{}_{}", series_id, limit);
        self.source
            .fetch_with_policy(&key, self.freshness.macro_series, move || async move {
                let response = ensure_success(NAME, request.send().await?)?;
                let payload: Value = response.json().await?;
                parse_observations(&payload, &series_id)
            })
            .await
    }
}

pub(crate) fn parse_observations(payload: &Value, series_id: &str) -> MarketDataResult<MacroSeries> {
    if let Some(message) = payload.get("error_message").and_then(Value::as_str) {
        return Err(MarketDataError::transient(NAME, message));
    }

    let raw = payload
        .get("observations")
        .and_then(Value::as_array)
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| MarketDataError::transient(NAME, "No data available"))?;

    let parse_date = |obs: &Value| {
        obs.get("date")
            .and_then(Value::as_str)
            .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
    };

    let last_update = raw.first().and_then(parse_date);

    let mut observations: Vec<Observation> = raw
        .iter()
        .filter_map(|obs| {
            let value = obs.get("value").and_then(Value::as_str)?;
            if value == "." {
                return None;
            }
            match (parse_date(obs), value.parse::<f64>()) {
                (Some(date), Ok(value)) => Some(Observation { date, value }),
                _ => {
                    debug!(source = NAME, series_id, ?obs, "Skipping malformed observation");
                    None
                }
            }
        })
        .collect();
    observations.reverse();

    if observations.is_empty() {
        return Err(MarketDataError::transient(
            NAME,
            format!("{} has no usable observations", series_id),
        ));
    }

    Ok(MacroSeries {
        series_id: series_id.to_string(),
        info: series_info(series_id),
        observations,
        last_update,
    })
}
