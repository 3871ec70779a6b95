//! Subscription value types.

use serde::{Deserialize, Serialize};

/// Market data stream kind a client can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Orderbook snapshots and deltas
    OrderBook,
    /// Public trades
    Trades,
    /// Best bid/ask ticker
    Ticker,
    /// OHLCV candles
    Candles,
}

impl EventType {
    /// Channel name as used by the exchange feed
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::OrderBook => "orderbook",
            EventType::Trades => "trades",
            EventType::Ticker => "ticker",
            EventType::Candles => "candles",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a (symbol, event type) subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// Requested, waiting for the venue to confirm
    Pending,
    /// Confirmed and receiving data
    Active,
    /// Suspended because the connection dropped
    Paused,
    /// The venue rejected the subscription or the stream failed
    Error,
}

impl SubscriptionState {
    /// Whether data for this subscription should be delivered
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, SubscriptionState::Active)
    }
}
