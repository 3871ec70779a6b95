//! Core orderbook data structure.
//!
//! This implementation uses `BTreeMap` for sorted price levels, providing:
//!
//! - O(log n) insertion, deletion, and lookup
//! - O(1) access to best bid/ask (via `first_key_value` / `last_key_value`)
//! - Ordered iteration for depth-of-book queries
//!
//! On top of the ladder it tracks exchange update ids: duplicates are
//! dropped, small gaps are parked in an ordered buffer until the missing
//! updates arrive, and large gaps switch the book to [`BookState::Syncing`]
//! and ask the [`SnapshotSource`] for a fresh snapshot.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::config::OrderBookConfig;
use crate::types::{BookData, BookLevel, BookSnapshot, Price, Quantity, SequenceId, Side};

use super::SnapshotSource;

/// Price wrapper with a total order so `f64` can key a `BTreeMap`.
#[derive(Debug, Clone, Copy)]
struct PriceKey(Price);

impl PartialEq for PriceKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PriceKey {}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Synchronization state of an [`OrderBook`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BookState {
    /// No snapshot applied yet
    #[default]
    Empty,
    /// Seeded from a snapshot and following the delta stream
    Synchronized,
    /// Stream diverged; waiting for a fresh snapshot
    Syncing,
}

/// Outcome of applying a delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum UpdateResult {
    /// The update advanced the book
    Applied,
    /// The update was already covered by the current sequence and was dropped
    Duplicate,
    /// The update does not connect to the current sequence. It was either
    /// buffered, or the book switched to [`BookState::Syncing`].
    GapDetected,
}

/// A delta parked until the updates before it arrive
#[derive(Debug, Clone)]
struct BufferedDelta {
    first_update_id: SequenceId,
    final_update_id: SequenceId,
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
}

/// Sequence-validated orderbook for a single symbol.
///
/// # Design Decisions
///
/// 1. **BTreeMap per side**: sorted levels with O(log n) updates. Bids are
///    stored ascending and read from the back so both sides share one key type.
///
/// 2. **Overlap rule**: a delta covering `first..=final` applies iff
///    `first <= expected_sequence <= final`. Anything at or below the current
///    sequence is a duplicate and never touches the ladder.
///
/// 3. **Gap buffer keyed by starting id**: a fill cascades through the
///    buffer in one forward walk.
///
/// 4. **Depth cap**: with `max_depth_levels > 0` every mutation trims each
///    side to its best N levels.
///
/// # Thread Safety
///
/// This struct is `Send + Sync` but not internally synchronized. Each book
/// is expected to have a single writer.
#[derive(Clone)]
pub struct OrderBook {
    /// Symbol this book tracks
    symbol: String,

    /// Bid levels, ascending (best bid = last)
    bids: BTreeMap<PriceKey, Quantity>,

    /// Ask levels, ascending (best ask = first)
    asks: BTreeMap<PriceKey, Quantity>,

    /// Last applied update id
    sequence: SequenceId,

    state: BookState,

    /// Out-of-order deltas keyed by their first update id
    gap_buffer: BTreeMap<SequenceId, BufferedDelta>,

    gap_count: u64,
    duplicate_count: u64,

    config: OrderBookConfig,

    snapshot_source: Option<Arc<dyn SnapshotSource>>,
}

impl OrderBook {
    /// Create an empty book with default limits
    #[must_use]
    pub fn new(symbol: impl Into<String>) -> Self {
        Self::with_config(symbol, OrderBookConfig::default())
    }

    /// Create an empty book with explicit limits
    #[must_use]
    pub fn with_config(symbol: impl Into<String>, config: OrderBookConfig) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            sequence: 0,
            state: BookState::Empty,
            gap_buffer: BTreeMap::new(),
            gap_count: 0,
            duplicate_count: 0,
            config,
            snapshot_source: None,
        }
    }

    /// Install the provider asked for a snapshot when the book loses sync
    pub fn set_snapshot_request_callback(&mut self, source: Arc<dyn SnapshotSource>) {
        self.snapshot_source = Some(source);
    }

    /// Get the symbol
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Get the synchronization state
    #[must_use]
    pub const fn state(&self) -> BookState {
        self.state
    }

    /// Whether the book is following the stream
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.state == BookState::Synchronized
    }

    /// Last applied update id
    #[must_use]
    pub const fn sequence(&self) -> SequenceId {
        self.sequence
    }

    /// Update id the next delta must cover
    #[must_use]
    pub const fn expected_sequence(&self) -> SequenceId {
        self.sequence.saturating_add(1)
    }

    /// Gaps seen since the last snapshot
    #[must_use]
    pub const fn gap_count(&self) -> u64 {
        self.gap_count
    }

    /// Duplicates dropped since the last snapshot
    #[must_use]
    pub const fn duplicate_count(&self) -> u64 {
        self.duplicate_count
    }

    /// Deltas currently parked in the gap buffer
    #[must_use]
    pub fn buffered_update_count(&self) -> usize {
        self.gap_buffer.len()
    }

    /// Current limits
    #[must_use]
    pub fn config(&self) -> &OrderBookConfig {
        &self.config
    }

    /// Replace the whole book.
    ///
    /// Clears the gap buffer and the gap/duplicate counters. Levels with a
    /// non-positive quantity are skipped; a repeated price keeps its last
    /// quantity.
    pub fn apply_snapshot(&mut self, bids: &[BookLevel], asks: &[BookLevel], sequence: SequenceId) {
        self.bids.clear();
        self.asks.clear();

        for level in bids.iter().filter(|l| !l.is_removal()) {
            self.bids.insert(PriceKey(level.price), level.qty);
        }
        for level in asks.iter().filter(|l| !l.is_removal()) {
            self.asks.insert(PriceKey(level.price), level.qty);
        }

        self.gap_buffer.clear();
        self.gap_count = 0;
        self.duplicate_count = 0;
        self.sequence = sequence;
        self.state = BookState::Synchronized;
        self.truncate_to_depth();

        debug!(
            symbol = %self.symbol,
            sequence,
            bids = self.bids.len(),
            asks = self.asks.len(),
            "snapshot applied"
        );
    }

    /// Apply a single level change carrying update id `seq`
    pub fn apply_delta(&mut self, level: BookLevel, side: Side, seq: SequenceId) -> UpdateResult {
        let level = std::slice::from_ref(&level);
        match side {
            Side::Bid => self.apply_deltas(level, &[], seq, seq),
            Side::Ask => self.apply_deltas(&[], level, seq, seq),
        }
    }

    /// Apply a batch of level changes covering `first_update_id..=final_update_id`.
    ///
    /// All levels are written before the sequence moves to `final_update_id`,
    /// so readers never observe a half-applied batch.
    pub fn apply_deltas(
        &mut self,
        bids: &[BookLevel],
        asks: &[BookLevel],
        first_update_id: SequenceId,
        final_update_id: SequenceId,
    ) -> UpdateResult {
        if self.state != BookState::Synchronized {
            trace!(
                symbol = %self.symbol,
                state = ?self.state,
                final_update_id,
                "delta ignored, book not synchronized"
            );
            return UpdateResult::GapDetected;
        }

        if final_update_id <= self.sequence {
            self.duplicate_count += 1;
            trace!(
                symbol = %self.symbol,
                final_update_id,
                sequence = self.sequence,
                "duplicate delta dropped"
            );
            return UpdateResult::Duplicate;
        }

        let expected = self.expected_sequence();
        if first_update_id <= expected {
            self.write_levels(bids, asks);
            self.sequence = final_update_id;
            self.flush_gap_buffer();
            self.truncate_to_depth();
            return UpdateResult::Applied;
        }

        self.gap_count += 1;
        let gap = first_update_id - expected;

        if gap > self.config.max_sequence_gap {
            warn!(
                symbol = %self.symbol,
                expected,
                got = first_update_id,
                gap,
                max_gap = self.config.max_sequence_gap,
                "sequence gap beyond threshold"
            );
            self.enter_syncing();
            return UpdateResult::GapDetected;
        }

        if self.gap_buffer.len() >= self.config.max_buffer_size
            && !self.gap_buffer.contains_key(&first_update_id)
        {
            warn!(
                symbol = %self.symbol,
                buffered = self.gap_buffer.len(),
                "gap buffer full"
            );
            self.enter_syncing();
            return UpdateResult::GapDetected;
        }

        debug!(
            symbol = %self.symbol,
            expected,
            got = first_update_id,
            gap,
            "buffering out-of-order delta"
        );
        self.gap_buffer.insert(
            first_update_id,
            BufferedDelta {
                first_update_id,
                final_update_id,
                bids: bids.to_vec(),
                asks: asks.to_vec(),
            },
        );
        UpdateResult::GapDetected
    }

    /// Route a decoded update to the snapshot or delta path
    pub fn apply_book_data(&mut self, data: &BookData) -> UpdateResult {
        if data.is_snapshot {
            self.apply_snapshot(&data.bids, &data.asks, data.final_update_id);
            UpdateResult::Applied
        } else {
            self.apply_deltas(
                &data.bids,
                &data.asks,
                data.first_update_id,
                data.final_update_id,
            )
        }
    }

    /// Remove and return the parked out-of-order deltas, lowest id first
    pub fn take_buffered_updates(&mut self) -> Vec<BookData> {
        std::mem::take(&mut self.gap_buffer)
            .into_values()
            .map(|d| BookData::delta(d.first_update_id, d.final_update_id, d.bids, d.asks))
            .collect()
    }

    /// Force a resync from a fresh snapshot
    pub fn request_rebuild(&mut self) {
        info!(symbol = %self.symbol, "manual rebuild requested");
        self.enter_syncing();
    }

    /// Set a price level directly, bypassing sequence tracking.
    ///
    /// A quantity of zero removes the level.
    pub fn set_level(&mut self, price: Price, quantity: Quantity, side: Side) {
        self.write_level(BookLevel::new(price, quantity), side);
        self.truncate_to_depth();
    }

    /// Limit each side to its best `levels` (0 = unlimited) and trim now
    pub fn set_max_depth_levels(&mut self, levels: usize) {
        self.config.max_depth_levels = levels;
        self.truncate_to_depth();
    }

    /// Get the best bid (highest price)
    #[must_use]
    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids
            .last_key_value()
            .map(|(p, &q)| BookLevel::new(p.0, q))
    }

    /// Get the best ask (lowest price)
    #[must_use]
    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks
            .first_key_value()
            .map(|(p, &q)| BookLevel::new(p.0, q))
    }

    /// Get the mid price
    ///
    /// Returns the average of best bid and best ask, or `None` if either is missing.
    #[must_use]
    pub fn mid_price(&self) -> Option<Price> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / 2.0),
            _ => None,
        }
    }

    /// Best ask minus best bid
    #[must_use]
    pub fn spread(&self) -> Option<Price> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Check if the book is crossed (best bid >= best ask)
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    /// Get all bid levels, sorted by price descending (best first)
    pub fn bids(&self) -> impl Iterator<Item = BookLevel> + '_ {
        self.bids.iter().rev().map(|(p, &q)| BookLevel::new(p.0, q))
    }

    /// Get all ask levels, sorted by price ascending (best first)
    pub fn asks(&self) -> impl Iterator<Item = BookLevel> + '_ {
        self.asks.iter().map(|(p, &q)| BookLevel::new(p.0, q))
    }

    /// Get the top `n` levels of one side, best first
    #[must_use]
    pub fn top_levels(&self, side: Side, n: usize) -> Vec<BookLevel> {
        match side {
            Side::Bid => self.bids().take(n).collect(),
            Side::Ask => self.asks().take(n).collect(),
        }
    }

    /// Number of levels on one side
    #[must_use]
    pub fn level_count(&self, side: Side) -> usize {
        match side {
            Side::Bid => self.bids.len(),
            Side::Ask => self.asks.len(),
        }
    }

    /// Total quantity resting on one side
    #[must_use]
    pub fn total_quantity(&self, side: Side) -> Quantity {
        match side {
            Side::Bid => self.bids.values().sum(),
            Side::Ask => self.asks.values().sum(),
        }
    }

    /// Levels whose price is within `pct` percent of the best price on `side`.
    ///
    /// `pct = 1.0` on the bid side returns every bid priced at or above
    /// 99% of the best bid.
    #[must_use]
    pub fn levels_within_range(&self, pct: f64, side: Side) -> Vec<BookLevel> {
        let fraction = pct.max(0.0) / 100.0;
        match side {
            Side::Bid => {
                let Some(best) = self.best_bid() else {
                    return Vec::new();
                };
                let floor = best.price * (1.0 - fraction);
                self.bids().take_while(|l| l.price >= floor).collect()
            }
            Side::Ask => {
                let Some(best) = self.best_ask() else {
                    return Vec::new();
                };
                let ceiling = best.price * (1.0 + fraction);
                self.asks().take_while(|l| l.price <= ceiling).collect()
            }
        }
    }

    /// Volume imbalance over the top `depth` levels (0 = whole book).
    ///
    /// Ranges from -1.0 (all asks) to 1.0 (all bids); 0.0 for an empty book.
    #[must_use]
    pub fn imbalance(&self, depth: usize) -> f64 {
        let n = if depth == 0 { usize::MAX } else { depth };
        let bid_qty: Quantity = self.bids().take(n).map(|l| l.qty).sum();
        let ask_qty: Quantity = self.asks().take(n).map(|l| l.qty).sum();
        let total = bid_qty + ask_qty;
        if total <= 0.0 {
            0.0
        } else {
            (bid_qty - ask_qty) / total
        }
    }

    /// Depth-limited copy of the book (0 = all levels)
    #[must_use]
    pub fn snapshot(&self, depth_limit: usize) -> BookSnapshot {
        let n = if depth_limit == 0 { usize::MAX } else { depth_limit };
        BookSnapshot {
            symbol: self.symbol.clone(),
            bids: self.bids().take(n).collect(),
            asks: self.asks().take(n).collect(),
            sequence: self.sequence,
        }
    }

    /// Reset to an empty, unsynchronized book
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.gap_buffer.clear();
        self.sequence = 0;
        self.gap_count = 0;
        self.duplicate_count = 0;
        self.state = BookState::Empty;
    }

    /// Check if the orderbook is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    fn enter_syncing(&mut self) {
        self.state = BookState::Syncing;
        if let Some(source) = &self.snapshot_source {
            source.request_snapshot(&self.symbol);
        }
    }

    /// Apply buffered deltas that now connect to the sequence.
    fn flush_gap_buffer(&mut self) {
        loop {
            let expected = self.expected_sequence();
            let Some(entry) = self.gap_buffer.first_entry() else {
                break;
            };
            let (first, last) = (entry.get().first_update_id, entry.get().final_update_id);

            if last < expected {
                // Covered by what was just applied
                entry.remove();
                continue;
            }
            if first > expected {
                break;
            }

            let delta = entry.remove();
            self.write_levels(&delta.bids, &delta.asks);
            self.sequence = delta.final_update_id;
            trace!(
                symbol = %self.symbol,
                sequence = self.sequence,
                "buffered delta applied"
            );
        }
    }

    fn write_levels(&mut self, bids: &[BookLevel], asks: &[BookLevel]) {
        for &level in bids {
            self.write_level(level, Side::Bid);
        }
        for &level in asks {
            self.write_level(level, Side::Ask);
        }
    }

    fn write_level(&mut self, level: BookLevel, side: Side) {
        let book = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        if level.is_removal() {
            book.remove(&PriceKey(level.price));
        } else {
            book.insert(PriceKey(level.price), level.qty);
        }
    }

    fn truncate_to_depth(&mut self) {
        let max = self.config.max_depth_levels;
        if max == 0 {
            return;
        }
        while self.bids.len() > max {
            self.bids.pop_first();
        }
        while self.asks.len() > max {
            self.asks.pop_last();
        }
    }
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new("")
    }
}

impl fmt::Debug for OrderBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderBook")
            .field("symbol", &self.symbol)
            .field("state", &self.state)
            .field("sequence", &self.sequence)
            .field("bid_levels", &self.bids.len())
            .field("ask_levels", &self.asks.len())
            .field("buffered", &self.gap_buffer.len())
            .field("gap_count", &self.gap_count)
            .field("duplicate_count", &self.duplicate_count)
            .finish()
    }
}
