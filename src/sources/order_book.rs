//! Live best bid/ask from the Coinbase Exchange WebSocket feed
//!
//! Feed Documentation: https://docs.cdp.coinbase.com/exchange/docs/websocket-overview
//!
//! The feed subscribes to the `ticker` channel for one product and publishes its state on
//! a watch channel. A dropped connection is retried up to `max_reconnect_attempts` times,
//! `reconnect_delay` apart. A successful connection resets that count. Once the retries
//! are spent the state becomes `Unavailable` and stays there; prices are only ever taken
//! from the feed.

use super::parse_decimal;
use crate::core::error::MarketDataResult;
use crate::observability::metrics::{ORDER_BOOK_RECONNECTS_TOTAL, ORDER_BOOK_UPDATES_TOTAL};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NAME: &str = "coinbase_feed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderBookConfig {
    /// `ws://` or `wss://` endpoint of the exchange feed
    pub url: String,
    pub product_id: String,
    pub max_reconnect_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Upper bound on the TCP plus WebSocket handshake
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
}

impl Default for OrderBookConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws-feed.exchange.coinbase.com".to_string(),
            product_id: "BTC-USD".to_string(),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(6),
        }
    }
}

/// Top of the book for one product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestBidAsk {
    pub product_id: String,
    pub bid: f64,
    pub ask: f64,
    /// Last trade price, when the message carried one
    pub price: Option<f64>,
    pub received_at: DateTime<Utc>,
}

impl BestBidAsk {
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

/// What the order book widget shows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FeedState {
    /// No quote yet; `attempt` is 0 for the first connection
    Connecting { attempt: u32 },
    Live { quote: BestBidAsk },
    Unavailable { reason: String },
}

impl FeedState {
    pub fn quote(&self) -> Option<&BestBidAsk> {
        match self {
            FeedState::Live { quote } => Some(quote),
            _ => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, FeedState::Unavailable { .. })
    }
}

#[derive(Debug, Deserialize)]
struct FeedMessage {
    #[serde(rename = "type")]
    kind: String,
    product_id: Option<String>,
    best_bid: Option<String>,
    best_ask: Option<String>,
    price: Option<String>,
    message: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, PartialEq)]
enum FeedEvent {
    Ticker(BestBidAsk),
    /// The exchange rejected the subscription or reported a fault
    Rejected(String),
    Ignored,
}

fn parse_feed_message(text: &str, product_id: &str) -> MarketDataResult<FeedEvent> {
    let message: FeedMessage = serde_json::from_str(text)?;

    match message.kind.as_str() {
        "ticker" => {
            if message.product_id.as_deref() != Some(product_id) {
                return Ok(FeedEvent::Ignored);
            }
            let (Some(bid), Some(ask)) = (message.best_bid.as_deref(), message.best_ask.as_deref())
            else {
                return Ok(FeedEvent::Ignored);
            };

            let bid = parse_decimal(NAME, "best_bid", bid)?;
            let ask = parse_decimal(NAME, "best_ask", ask)?;
            if bid <= 0.0 || ask <= 0.0 {
                return Ok(FeedEvent::Ignored);
            }

            let price = match message.price.as_deref() {
                Some(raw) => Some(parse_decimal(NAME, "price", raw)?),
                None => None,
            };

            Ok(FeedEvent::Ticker(BestBidAsk {
                product_id: product_id.to_string(),
                bid,
                ask,
                price,
                received_at: Utc::now(),
            }))
        }
        "error" => {
            let reason = match (message.message, message.reason) {
                (Some(message), Some(reason)) => format!("{}: {}", message, reason),
                (Some(message), None) => message,
                (None, Some(reason)) => reason,
                (None, None) => "feed reported an error".to_string(),
            };
            Ok(FeedEvent::Rejected(reason))
        }
        _ => Ok(FeedEvent::Ignored),
    }
}

/// Handle on the background feed task. Dropping it stops the task.
#[derive(Debug)]
pub struct OrderBookFeed {
    state: watch::Receiver<FeedState>,
    cancel: CancellationToken,
}

impl OrderBookFeed {
    /// Start the feed task. Must be called from within a tokio runtime.
    pub fn spawn(config: OrderBookConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(FeedState::Connecting { attempt: 0 });
        let cancel = CancellationToken::new();

        info!(url = %config.url, product = %config.product_id, "Starting order book feed");
        tokio::spawn(run(config, state_tx, cancel.clone()));

        Self {
            state: state_rx,
            cancel,
        }
    }

    pub fn state(&self) -> FeedState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<FeedState> {
        self.state.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for OrderBookFeed {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(config: OrderBookConfig, state: watch::Sender<FeedState>, cancel: CancellationToken) {
    let mut reconnects = 0u32;

    loop {
        state.send_replace(FeedState::Connecting {
            attempt: reconnects,
        });

        let reason = tokio::select! {
            _ = cancel.cancelled() => break,
            reason = session(&config, &state, &mut reconnects) => reason,
        };

        if reconnects >= config.max_reconnect_attempts {
            warn!(
                product = %config.product_id,
                reason = %reason,
                attempts = reconnects,
                "Order book feed unavailable, reconnect attempts exhausted"
            );
            state.send_replace(FeedState::Unavailable { reason });
            return;
        }

        reconnects += 1;
        metrics::counter!(ORDER_BOOK_RECONNECTS_TOTAL).increment(1);
        info!(
            product = %config.product_id,
            reason = %reason,
            attempt = reconnects,
            delay_ms = config.reconnect_delay.as_millis() as u64,
            "Order book feed disconnected, reconnecting"
        );

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(config.reconnect_delay) => {}
        }
    }

    debug!(product = %config.product_id, "Order book feed stopped");
    state.send_replace(FeedState::Unavailable {
        reason: "feed stopped".to_string(),
    });
}

/// One connection, from handshake to disconnect. Returns why it ended.
async fn session(
    config: &OrderBookConfig,
    state: &watch::Sender<FeedState>,
    reconnects: &mut u32,
) -> String {
    let stream = match timeout(config.connection_timeout, connect_async(config.url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => return format!("connection failed: {}", e),
        Err(_) => {
            return format!(
                "connection timed out after {}",
                humantime::format_duration(config.connection_timeout)
            )
        }
    };

    *reconnects = 0;
    let (mut sink, mut messages) = stream.split();

    let subscribe = json!({
        "type": "subscribe",
        "product_ids": [config.product_id],
        "channels": ["ticker"]
    });
    if let Err(e) = sink.send(Message::Text(subscribe.to_string())).await {
        return format!("subscribe failed: {}", e);
    }
    debug!(product = %config.product_id, "Subscribed to ticker channel");

    while let Some(message) = messages.next().await {
        match message {
            Ok(Message::Text(text)) => match parse_feed_message(&text, &config.product_id) {
                Ok(FeedEvent::Ticker(quote)) => {
                    metrics::counter!(ORDER_BOOK_UPDATES_TOTAL).increment(1);
                    state.send_replace(FeedState::Live { quote });
                }
                Ok(FeedEvent::Rejected(reason)) => return reason,
                Ok(FeedEvent::Ignored) => {}
                Err(e) => debug!(error = %e, "Unreadable feed message"),
            },
            Ok(Message::Close(_)) => return "closed by server".to_string(),
            Ok(_) => {}
            Err(e) => return format!("feed error: {}", e),
        }
    }

    "closed by server".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::MarketDataError;

    #[test]
    fn test_parse_ticker() {
        let text = r#"{
            "type": "ticker",
            "sequence": 75460183931,
            "product_id": "BTC-USD",
            "price": "63012.55",
            "best_bid": "63012.54",
            "best_ask": "63012.56",
            "side": "buy"
        }"#;

        let FeedEvent::Ticker(quote) = parse_feed_message(text, "BTC-USD").unwrap() else {
            panic!("expected a ticker event");
        };
        assert_eq!(quote.bid, 63012.54);
        assert_eq!(quote.ask, 63012.56);
        assert_eq!(quote.price, Some(63012.55));
        assert!((quote.spread() - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_parse_skips_other_messages() {
        let subscriptions = r#"{"type":"subscriptions","channels":[{"name":"ticker","product_ids":["BTC-USD"]}]}"#;
        assert_eq!(parse_feed_message(subscriptions, "BTC-USD").unwrap(), FeedEvent::Ignored);

        let other_product = r#"{"type":"ticker","product_id":"ETH-USD","best_bid":"1","best_ask":"2"}"#;
        assert_eq!(parse_feed_message(other_product, "BTC-USD").unwrap(), FeedEvent::Ignored);

        let zero_bid = r#"{"type":"ticker","product_id":"BTC-USD","best_bid":"0","best_ask":"2"}"#;
        assert_eq!(parse_feed_message(zero_bid, "BTC-USD").unwrap(), FeedEvent::Ignored);
    }

    #[test]
    fn test_parse_error_message() {
        let text = r#"{"type":"error","message":"Failed to subscribe","reason":"BTC-XYZ is not a valid product"}"#;
        assert_eq!(
            parse_feed_message(text, "BTC-XYZ").unwrap(),
            FeedEvent::Rejected("Failed to subscribe: BTC-XYZ is not a valid product".to_string())
        );
    }

    #[test]
    fn test_parse_bad_payloads() {
        assert!(matches!(
            parse_feed_message("not json", "BTC-USD"),
            Err(MarketDataError::Json { .. })
        ));

        let garbled = r#"{"type":"ticker","product_id":"BTC-USD","best_bid":"abc","best_ask":"2"}"#;
        assert!(parse_feed_message(garbled, "BTC-USD").unwrap_err().is_transient());
    }

    #[test]
    fn test_feed_state_serialization() {
        let state = FeedState::Unavailable {
            reason: "closed by server".to_string(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "unavailable");
        assert!(state.quote().is_none());
        assert!(state.is_unavailable());
    }
}
