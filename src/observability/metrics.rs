//! # Metrics
//!
//! Metric names recorded by the cache, the request gates and the integration layer,
//! plus installation of the Prometheus exporter used by the binary.
//!
//! ## Usage Example
//! ```rust,no_run
//! use market_data_gateway::observability::metrics::{install_exporter, MetricsConfig};
//!
//! # async fn run() -> market_data_gateway::MarketDataResult<()> {
//! let config = MetricsConfig { enabled: true, ..Default::default() };
//! install_exporter(&config)?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::error::{MarketDataError, MarketDataResult};

/// Fresh cache reads
pub const CACHE_HITS_TOTAL: &str = "market_cache_hits_total";
/// Absent or stale cache reads
pub const CACHE_MISSES_TOTAL: &str = "market_cache_misses_total";
/// Entries purged by the housekeeping sweep
pub const CACHE_SWEPT_TOTAL: &str = "market_cache_swept_total";

/// Requests accepted by a gate
pub const GATE_ENQUEUED_TOTAL: &str = "market_gate_enqueued_total";
/// Requests released by the drain loop
pub const GATE_DISPATCHED_TOTAL: &str = "market_gate_dispatched_total";
/// Dispatched operations that returned an error (timeouts included)
pub const GATE_FAILED_TOTAL: &str = "market_gate_failed_total";
/// Dispatched operations that hit their deadline
pub const GATE_TIMEOUTS_TOTAL: &str = "market_gate_timeouts_total";
/// Queued requests cancelled or abandoned before dispatch
pub const GATE_CANCELLED_TOTAL: &str = "market_gate_cancelled_total";
/// Time between enqueue and dispatch
pub const GATE_QUEUE_WAIT_SECONDS: &str = "market_gate_queue_wait_seconds";

/// Fetches answered from a stale entry after the refresh failed
pub const SOURCE_STALE_FALLBACK_TOTAL: &str = "market_source_stale_fallback_total";
/// Fetch failures surfaced to the caller
pub const SOURCE_FAILURES_TOTAL: &str = "market_source_failures_total";

/// Ticker updates received from the order book feed
pub const ORDER_BOOK_UPDATES_TOTAL: &str = "market_order_book_updates_total";
/// Order book feed reconnect attempts
pub const ORDER_BOOK_RECONNECTS_TOTAL: &str = "market_order_book_reconnects_total";

/// Configuration for metrics export
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the Prometheus exporter is installed
    pub enabled: bool,

    /// Address the exporter's HTTP listener binds to
    pub listen_address: String,

    /// Histogram buckets (seconds) for queue wait times
    pub queue_wait_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: "127.0.0.1:9000".to_string(),
            queue_wait_buckets: vec![
                0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0,
            ],
        }
    }
}

/// Install the Prometheus recorder and its HTTP listener.
///
/// Does nothing when metrics are disabled. Must be called from inside a tokio runtime.
pub fn install_exporter(config: &MetricsConfig) -> MarketDataResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config.listen_address.parse().map_err(|e| {
        MarketDataError::config(format!(
            "Invalid metrics listen address {}: {}",
            config.listen_address, e
        ))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(GATE_QUEUE_WAIT_SECONDS.to_string()),
            &config.queue_wait_buckets,
        )
        .map_err(|e| MarketDataError::config(format!("Failed to set histogram buckets: {}", e)))?
        .install()
        .map_err(|e| MarketDataError::config(format!("Failed to install metrics exporter: {}", e)))?;

    info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}
