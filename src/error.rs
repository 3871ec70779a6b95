//! Error types for the orderbook-sync crate.
//!
//! The hot update path never returns errors: sequence problems are reported
//! through [`UpdateResult`](crate::orderbook::UpdateResult) and boolean
//! returns. This type covers admission control, session routing and
//! configuration loading.

use crate::types::EventType;

/// The main error type for this crate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Symbol is empty or contains characters outside alnum, `-`, `_`, `/`
    #[error("Invalid symbol: {0:?}")]
    InvalidSymbol(String),

    /// Total subscription cap reached
    #[error("Subscription limit reached ({max} total)")]
    SubscriptionLimit {
        /// Configured maximum
        max: usize,
    },

    /// Too many subscribe calls in the current one-second window
    #[error("Rate limited: more than {max_per_second} subscriptions per second")]
    RateLimited {
        /// Configured per-second maximum
        max_per_second: usize,
    },

    /// No orderbook is tracked for this symbol
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Update arrived for a subscription that is missing or not active
    #[error("No active {event_type} subscription for {symbol}")]
    NotSubscribed {
        /// Symbol of the update
        symbol: String,
        /// Stream of the update
        event_type: EventType,
    },

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error came from admission control and a later retry may succeed
    #[must_use]
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Error::SubscriptionLimit { .. } | Error::RateLimited { .. }
        )
    }
}
