//! # Market Data Gateway - Core Library Crate
//!
//! Cached, rate-limited access to the external market data sources behind a landing-page
//! dashboard: equity quotes (Alpha Vantage), crypto prices (Coinbase Exchange),
//! macroeconomic series (FRED) and ticker headlines (Gemini).
//!
//! ## How a read works
//!
//! Every widget read goes through `DataSource::fetch_with_policy`:
//! - a value cached within the caller's maximum age is returned without touching the network
//! - otherwise the call waits its turn in the source's `RequestGate`, which never lets more
//!   than `limit` calls out per trailing window
//! - a failed refresh falls back to the last cached value for that key, if there is one,
//!   and otherwise fails; nothing is ever fabricated
//!
//! ## Module layout
//! - `core`: error type and configuration
//! - `caching`: the shared TTL cache
//! - `traffic`: rate windows and request gates
//! - `sources`: the integration layer and one client per source
//! - `dashboard`: the tile aggregator used by the binary
//! - `observability`: logging and metrics setup

/// Core functionality: error types and configuration
pub mod core;

/// TTL cache shared by every source
pub mod caching;

/// Outbound rate limiting: one FIFO request gate per source
pub mod traffic;

/// Integration layer and the per-source HTTP clients
pub mod sources;

/// Widget-facing aggregation of every source
pub mod dashboard;

/// Structured logging and Prometheus metrics
pub mod observability;

/// Main error type used throughout the gateway
pub use core::error::{MarketDataError, MarketDataResult};

/// Main configuration structure
pub use core::config::{GatewayConfig, SourceConfig, SourcesConfig};

pub use caching::{CacheConfig, CacheStats, TtlCache};
pub use dashboard::{DashboardConfig, DashboardSnapshot, MarketDataHub, Tile, TileState};
pub use sources::{DataSource, Fetched, Freshness, Origin, SharedCache};
pub use traffic::{GateHandle, GateState, GateStats, RateLimitPolicy, RequestGate, Ticket};
