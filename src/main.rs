//! # Market Data Gateway - Main Entry Point
//!
//! Builds the market data hub from configuration and keeps the dashboard snapshot fresh
//! until interrupted.
//!
//! Configuration is read from the path given as the first argument, or from
//! `MARKET_GATEWAY_CONFIG`. Without either, built-in defaults are used together with any
//! `MARKET_GATEWAY_*` environment overrides (API keys usually arrive this way).

use market_data_gateway::observability::{init_logging, install_exporter};
use market_data_gateway::{DashboardSnapshot, GatewayConfig, MarketDataHub, MarketDataResult};
use std::time::Duration;
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long queued requests get to drain on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> MarketDataResult<()> {
    let config = load_config().await?;

    init_logging(&config.observability.logging);
    info!("🚀 Starting market data gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics.enabled {
        install_exporter(&config.observability.metrics)?;
    }

    let hub = MarketDataHub::new(config)?;
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("📡 Received Ctrl+C, initiating graceful shutdown..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        signal_token.cancel();
    });

    run_refresh_loop(&hub, shutdown).await;

    info!("🛑 Draining request gates...");
    if let Err(e) = hub.shutdown(SHUTDOWN_TIMEOUT).await {
        warn!("Gates did not drain cleanly: {}", e);
    }

    info!("✅ Market data gateway shutdown complete");
    Ok(())
}

async fn load_config() -> MarketDataResult<GatewayConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MARKET_GATEWAY_CONFIG").ok());

    match path {
        Some(path) if path.ends_with(".json") => GatewayConfig::load_from_json(&path).await,
        Some(path) => GatewayConfig::load_from_file(&path).await,
        None => {
            let mut config = GatewayConfig::default();
            config.apply_env_overrides()?;
            config.validate()?;
            Ok(config)
        }
    }
}

/// Rebuild the snapshot every refresh interval until `shutdown` fires
async fn run_refresh_loop(hub: &MarketDataHub, shutdown: CancellationToken) {
    let mut ticker = interval(hub.config().dashboard.refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    snapshot = hub.snapshot() => snapshot,
                };
                report(&snapshot);

                let diagnostics = hub.diagnostics();
                for source in &diagnostics.sources {
                    info!(
                        source = %source.name,
                        queue_depth = source.queue_depth,
                        in_window = source.in_window,
                        limit = source.limit,
                        state = ?source.state,
                        "Gate status"
                    );
                }
            }
        }
    }
}

fn report(snapshot: &DashboardSnapshot) {
    match serde_json::to_string(snapshot) {
        Ok(json) => info!(
            snapshot_id = %snapshot.id,
            unavailable = snapshot.unavailable_count(),
            stale = snapshot.stale_count(),
            snapshot = %json,
            "📊 Dashboard snapshot"
        ),
        Err(e) => error!("Failed to serialize snapshot: {}", e),
    }
}
