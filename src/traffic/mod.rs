//! # Traffic Management Module
//!
//! Outbound traffic control for external data sources. Each source gets its own
//! `RequestGate`: a FIFO queue drained no faster than the source's `RateLimitPolicy`
//! allows. Gates are independent, so a throttled source never delays another one.
//!
//! ## Key Components
//!
//! - `RateLimitPolicy`: calls per trailing window, courtesy delay, operation deadline
//! - `RateWindow`: the trailing-window dispatch history behind admission decisions
//! - `RequestGate`: the queue, its single drain loop, and its diagnostics
//! - `GateHandle`: what `enqueue` returns; await it for the operation's result

pub mod gate;
pub mod window;

pub use gate::{GateHandle, RequestGate};
pub use window::RateWindow;

use crate::core::error::MarketDataResult;
use crate::config_error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Rate limit for one external source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Maximum dispatches inside any trailing window
    pub limit: u32,

    /// Length of the trailing window
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Pause after each dispatch before the next one may start
    #[serde(default, with = "humantime_serde")]
    pub inter_request_delay: Duration,

    /// Deadline for a single dispatched operation
    #[serde(default = "default_operation_timeout", with = "humantime_serde")]
    pub operation_timeout: Duration,
}

fn default_operation_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            limit: 5,
            window: Duration::from_secs(60),
            inter_request_delay: Duration::ZERO,
            operation_timeout: default_operation_timeout(),
        }
    }
}

impl RateLimitPolicy {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            ..Self::default()
        }
    }

    pub fn with_inter_request_delay(mut self, delay: Duration) -> Self {
        self.inter_request_delay = delay;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn validate(&self) -> MarketDataResult<()> {
        if self.limit == 0 {
            return Err(config_error!("rate limit must allow at least one request per window"));
        }
        if self.window.is_zero() {
            return Err(config_error!("rate limit window must be positive"));
        }
        if self.operation_timeout.is_zero() {
            return Err(config_error!("operation timeout must be positive"));
        }
        Ok(())
    }
}

/// Identifies one enqueued request within its gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(pub(crate) u64);

impl Ticket {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a gate's drain loop is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// No drain loop running
    Idle,
    /// Dispatching, or pausing between dispatches
    Draining,
    /// Window full, sleeping until the oldest dispatch ages out
    Waiting,
}

/// Lifetime counters for one gate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStats {
    pub enqueued: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    /// Includes timeouts
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Handles dropped before dispatch
    pub abandoned: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_validation() {
        assert!(RateLimitPolicy::default().validate().is_ok());
        assert!(RateLimitPolicy::new(0, Duration::from_secs(1)).validate().is_err());
        assert!(RateLimitPolicy::new(1, Duration::ZERO).validate().is_err());
        assert!(RateLimitPolicy::new(1, Duration::from_secs(1))
            .with_operation_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_policy_from_yaml() {
        let yaml = r#"
limit: 10
window: 1s
inter_request_delay: 250ms
"#;
        let policy: RateLimitPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.limit, 10);
        assert_eq!(policy.window, Duration::from_secs(1));
        assert_eq!(policy.inter_request_delay, Duration::from_millis(250));
        assert_eq!(policy.operation_timeout, Duration::from_secs(30));
    }
}
