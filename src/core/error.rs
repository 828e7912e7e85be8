//! # Error Handling Module
//!
//! This module defines every failure the gateway can report, using the `thiserror` crate.
//!
//! ## Error Taxonomy
//!
//! The variants fall into three groups:
//! - **Source failures** (`TransientSource`, `HttpClient`, `Json`, `Timeout`): the remote call
//!   failed, returned a malformed payload, or carried an explicit error/rate-limit field.
//! - **Caller mistakes** (`UnknownKey`, `Configuration`): raised before any network activity,
//!   always surfaced, never retried, never cached.
//! - **Gate lifecycle** (`Cancelled`, `GateClosed`): the request never reached its source.
//!
//! Anything but a caller mistake may be masked with a stale cached value
//! (see `MarketDataError::allows_stale_fallback`).
//!
//! ### Propagation
//! The cache never produces errors. The request gate hands the operation's own error back to
//! that operation's caller and nobody else. Only `sources::DataSource::fetch_with_policy`
//! decides whether a failure is masked or surfaced.

use thiserror::Error;

/// Main result type used throughout the gateway
///
/// Instead of writing `Result<T, MarketDataError>` everywhere, we can use `MarketDataResult<T>`.
pub type MarketDataResult<T> = Result<T, MarketDataError>;

/// Error types for market data retrieval
///
/// The `#[error("...")]` attribute from `thiserror` implements `Display` with the given message.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MarketDataError {
    /// The remote source failed: HTTP error status, malformed payload, or an error/rate-limit
    /// field embedded in an otherwise successful response.
    #[error("Source {source_name} failed: {message}")]
    TransientSource { source_name: String, message: String },

    /// An integration-specific lookup failed before any network activity
    /// (for example an unrecognized ticker symbol).
    #[error("Unknown key for {source_name}: {key}")]
    UnknownKey { source_name: String, key: String },

    /// The operation did not finish within its deadline
    #[error("Operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A queued request was cancelled before it was dispatched
    #[error("Request {ticket} cancelled before dispatch")]
    Cancelled { ticket: u64 },

    /// The gate no longer accepts or runs work
    #[error("Request gate for {source_name} is closed")]
    GateClosed { source_name: String },

    /// Configuration-related errors (invalid config, missing API keys, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// HTTP client errors when calling an upstream source
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// I/O errors (file operations, listener binding, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl MarketDataError {
    /// Create a source failure for the named source
    pub fn transient<S: Into<String>, M: Into<String>>(source_name: S, message: M) -> Self {
        Self::TransientSource {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Create an unknown-key error for the named source
    pub fn unknown_key<S: Into<String>, K: Into<String>>(source_name: S, key: K) -> Self {
        Self::UnknownKey {
            source_name: source_name.into(),
            key: key.into(),
        }
    }

    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a timeout error for the named operation
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a gate-closed error for the named source
    pub fn gate_closed<S: Into<String>>(source_name: S) -> Self {
        Self::GateClosed {
            source_name: source_name.into(),
        }
    }

    /// Whether this failure came from talking to a remote source
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientSource { .. }
                | Self::Timeout { .. }
                | Self::HttpClient { .. }
                | Self::Json { .. }
        )
    }

    /// Whether a stale cached value may stand in for a failed refresh.
    ///
    /// Everything except a bad request qualifies: an unknown key or a configuration
    /// error would fail the same way next time, so serving old data would hide it.
    pub fn allows_stale_fallback(&self) -> bool {
        !matches!(self, Self::UnknownKey { .. } | Self::Configuration { .. })
    }

    /// Check if the caller may try again later
    ///
    /// The gate never retries on its own; this is advice for callers only.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientSource { .. } => true,
            Self::Timeout { .. } => true,
            Self::HttpClient { .. } => true,
            Self::Cancelled { .. } => true,
            _ => false,
        }
    }

    /// Get a string representation of the error type for logs and diagnostics
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::TransientSource { .. } => "transient_source_error",
            Self::UnknownKey { .. } => "unknown_key",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::GateClosed { .. } => "gate_closed",
            Self::Configuration { .. } => "configuration_error",
            Self::HttpClient { .. } => "http_client_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::Io { .. } => "io_error",
        }
    }
}

/// Implement conversion from std::io::Error
impl From<std::io::Error> for MarketDataError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_json::Error
impl From<serde_json::Error> for MarketDataError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_yaml::Error
impl From<serde_yaml::Error> for MarketDataError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from reqwest::Error
impl From<reqwest::Error> for MarketDataError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

/// Convenience macro for creating configuration errors
///
/// Usage: `config_error!("Invalid limit: {}", limit)`
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::core::error::MarketDataError::config(format!($($arg)*))
    };
}
