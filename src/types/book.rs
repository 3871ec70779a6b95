//! Orderbook value types.
//!
//! These are pure in-memory types. The transport layer decodes exchange
//! messages into [`BookData`] before anything in this crate sees them.

use serde::{Deserialize, Serialize};

use super::{Price, Quantity, SequenceId};

/// A single price level.
///
/// A quantity of zero means the level should be removed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Level price
    pub price: Price,
    /// Total quantity at this price
    pub qty: Quantity,
}

impl BookLevel {
    /// Create a new level
    #[must_use]
    pub const fn new(price: Price, qty: Quantity) -> Self {
        Self { price, qty }
    }

    /// Whether this level is a removal instruction.
    ///
    /// Zero, negative and NaN quantities all remove the level.
    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.qty.is_nan() || self.qty <= 0.0
    }
}

impl From<(Price, Quantity)> for BookLevel {
    fn from((price, qty): (Price, Quantity)) -> Self {
        Self { price, qty }
    }
}

/// A decoded book update: either a full snapshot or a delta batch.
///
/// Deltas carry the range of update ids they cover (`U` and `u` in the
/// exchange feed). Snapshots only use `final_update_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookData {
    /// Full replacement when `true`
    pub is_snapshot: bool,
    /// First update id covered by this message (`U`)
    pub first_update_id: SequenceId,
    /// Last update id covered by this message (`u`)
    pub final_update_id: SequenceId,
    /// Bid level changes
    pub bids: Vec<BookLevel>,
    /// Ask level changes
    pub asks: Vec<BookLevel>,
}

impl BookData {
    /// Build a snapshot message
    #[must_use]
    pub fn snapshot(last_update_id: SequenceId, bids: Vec<BookLevel>, asks: Vec<BookLevel>) -> Self {
        Self {
            is_snapshot: true,
            first_update_id: last_update_id,
            final_update_id: last_update_id,
            bids,
            asks,
        }
    }

    /// Build a delta batch covering `first_update_id..=final_update_id`
    #[must_use]
    pub fn delta(
        first_update_id: SequenceId,
        final_update_id: SequenceId,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
    ) -> Self {
        Self {
            is_snapshot: false,
            first_update_id,
            final_update_id,
            bids,
            asks,
        }
    }

    /// Alias for `final_update_id`
    #[must_use]
    pub const fn sequence(&self) -> SequenceId {
        self.final_update_id
    }

    /// Number of level changes carried
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }
}

/// Depth-limited read model of a book.
///
/// Bids are ordered best (highest) first, asks best (lowest) first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// Symbol the book belongs to
    pub symbol: String,
    /// Bid levels, best first
    pub bids: Vec<BookLevel>,
    /// Ask levels, best first
    pub asks: Vec<BookLevel>,
    /// Last applied update id
    pub sequence: SequenceId,
}
