//! Value types shared by the orderbook and subscription layers.
//!
//! - [`book`] - Price levels, decoded updates and depth snapshots
//! - [`subscription`] - Event types and subscription states

pub mod book;
pub mod subscription;

use serde::{Deserialize, Serialize};

pub use book::{BookData, BookLevel, BookSnapshot};
pub use subscription::{EventType, SubscriptionState};

/// Price of a level.
///
/// Prices arrive already normalized by the upstream decoder, so they are
/// compared for exact equality. No epsilon rounding is applied.
pub type Price = f64;

/// Quantity resting at a level. Zero means "remove the level".
pub type Quantity = f64;

/// Exchange-assigned update id
pub type SequenceId = u64;

/// Timestamp in milliseconds since Unix epoch
pub type TimestampMs = u64;

/// Side of the book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy side, best price is the highest
    Bid,
    /// Sell side, best price is the lowest
    Ask,
}

impl Side {
    /// The other side of the book
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }

    /// `true` for [`Side::Bid`]
    #[must_use]
    pub const fn is_bid(self) -> bool {
        matches!(self, Side::Bid)
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Bid => write!(f, "bid"),
            Side::Ask => write!(f, "ask"),
        }
    }
}
