//! # Observability
//!
//! Structured logging through `tracing` and Prometheus metrics through `metrics`.

// Structured logging
pub mod logging;

// Metric names and exporter
pub mod metrics;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use metrics::{install_exporter, MetricsConfig};

use serde::{Deserialize, Serialize};

/// Observability section of the gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}
