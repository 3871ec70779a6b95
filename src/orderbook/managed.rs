//! Snapshot + delta resynchronization for a single symbol.
//!
//! [`ManagedOrderBook`] owns one [`OrderBook`] and runs the usual
//! "buffer the stream, fetch a snapshot, replay" protocol around it:
//!
//! ```text
//! Disconnected --start--> Buffering --request--> FetchingSnapshot
//!                             ^                        |
//!                             +------timeout-----------+
//!                                                      | snapshot
//!                                                      v
//!   Resynchronizing <--forced resync-- Synchronized <-- Synchronizing
//!         |                                               (replay)
//!         +--request--> FetchingSnapshot
//! ```
//!
//! The book performs no I/O. Snapshot fetches go through the injected
//! [`SnapshotSource`] and come back through [`ManagedOrderBook::on_snapshot`].
//! Timeouts are evaluated in [`ManagedOrderBook::on_tick`] against the
//! injected [`Clock`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::config::ManagedBookConfig;
use crate::types::{BookData, BookLevel, BookSnapshot, SequenceId, TimestampMs};

use super::{BookState, OrderBook, SnapshotSource, UpdateResult};

/// Resynchronization state of a [`ManagedOrderBook`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SyncState {
    /// Not started; deltas are ignored
    #[default]
    Disconnected,
    /// Collecting deltas, snapshot request not outstanding
    Buffering,
    /// Collecting deltas while a snapshot request is outstanding
    FetchingSnapshot,
    /// Replaying buffered deltas on top of a fresh snapshot, or waiting for
    /// the updates missing between the snapshot and the replayed deltas
    Synchronizing,
    /// Applying live deltas directly
    Synchronized,
    /// The book diverged and a new cycle is starting.
    ///
    /// Transient: the snapshot request goes out in the same call, which moves
    /// the state on to `FetchingSnapshot`. Only the state-change log sees it.
    Resynchronizing,
}

/// Counters exported for observability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ManagedStats {
    /// Snapshots applied
    pub snapshot_count: u64,
    /// Deltas received while started
    pub delta_count: u64,
    /// Deltas evicted from a full pre-snapshot buffer
    pub dropped_delta_count: u64,
    /// Resync cycles started (forced, manual or after a timeout)
    pub resync_count: u64,
    /// Buffered deltas discarded because the snapshot already covered them
    pub stale_delta_count: u64,
}

/// Orderbook with automatic snapshot resynchronization
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use orderbook_sync::clock::SystemClock;
/// use orderbook_sync::config::ManagedBookConfig;
/// use orderbook_sync::orderbook::{ManagedOrderBook, RecordingSource, SyncState};
/// use orderbook_sync::types::{BookData, BookLevel};
///
/// let source = Arc::new(RecordingSource::new());
/// let mut book = ManagedOrderBook::new(
///     "BTC-USD",
///     ManagedBookConfig::default(),
///     source.clone(),
///     Arc::new(SystemClock::new()),
/// );
///
/// book.start();
/// assert_eq!(source.take_requests(), vec!["BTC-USD"]);
///
/// book.on_delta(BookData::delta(101, 101, vec![BookLevel::new(10.0, 1.0)], vec![]));
/// book.on_snapshot(&[BookLevel::new(9.0, 1.0)], &[BookLevel::new(11.0, 1.0)], 100);
///
/// assert_eq!(book.state(), SyncState::Synchronized);
/// assert_eq!(book.book().sequence(), 101);
/// ```
pub struct ManagedOrderBook {
    symbol: String,
    book: OrderBook,
    state: SyncState,
    stats: ManagedStats,
    /// Deltas received before the current snapshot, oldest first
    pending: VecDeque<BookData>,
    config: ManagedBookConfig,
    source: Arc<dyn SnapshotSource>,
    clock: Arc<dyn Clock>,
    /// When the outstanding snapshot request was issued
    requested_at: Option<TimestampMs>,
    /// When the next snapshot request is due after a timeout
    retry_at: Option<TimestampMs>,
    /// Consecutive snapshot timeouts
    timeout_streak: u32,
}

impl ManagedOrderBook {
    /// Create a stopped book
    pub fn new(
        symbol: impl Into<String>,
        config: ManagedBookConfig,
        source: Arc<dyn SnapshotSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let symbol = symbol.into();
        Self {
            book: OrderBook::with_config(symbol.clone(), config.book_config()),
            symbol,
            state: SyncState::Disconnected,
            stats: ManagedStats::default(),
            pending: VecDeque::new(),
            config,
            source,
            clock,
            requested_at: None,
            retry_at: None,
            timeout_streak: 0,
        }
    }

    /// Get the symbol
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Current resynchronization state
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Counters
    pub fn stats(&self) -> ManagedStats {
        self.stats
    }

    /// The underlying book
    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    /// Depth-limited read model of the underlying book
    pub fn snapshot(&self, depth_limit: usize) -> BookSnapshot {
        self.book.snapshot(depth_limit)
    }

    /// Deltas waiting for the next snapshot
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Settings
    pub fn config(&self) -> &ManagedBookConfig {
        &self.config
    }

    /// Whether live deltas are being applied
    pub fn is_synchronized(&self) -> bool {
        self.state == SyncState::Synchronized
    }

    /// Whether [`start`](Self::start) has been called since the last stop
    pub fn is_started(&self) -> bool {
        self.state != SyncState::Disconnected
    }

    /// Begin buffering and request the first snapshot
    pub fn start(&mut self) {
        if self.is_started() {
            return;
        }
        info!(symbol = %self.symbol, "starting orderbook sync");
        self.set_state(SyncState::Buffering);
        self.issue_snapshot_request();
    }

    /// Return to `Disconnected`, dropping the book and any buffered deltas
    pub fn stop(&mut self) {
        if !self.is_started() {
            return;
        }
        info!(symbol = %self.symbol, "stopping orderbook sync");
        self.set_state(SyncState::Disconnected);
        self.pending.clear();
        self.book.clear();
        self.requested_at = None;
        self.retry_at = None;
        self.timeout_streak = 0;
    }

    /// Feed one decoded update in arrival order.
    ///
    /// Ignored entirely until [`start`](Self::start). Snapshots are routed to
    /// [`on_snapshot`](Self::on_snapshot); deltas are buffered or applied
    /// depending on the state.
    pub fn on_delta(&mut self, data: BookData) {
        if self.state == SyncState::Disconnected {
            trace!(symbol = %self.symbol, "delta ignored, not started");
            return;
        }
        if data.is_snapshot {
            self.on_snapshot(&data.bids, &data.asks, data.final_update_id);
            return;
        }

        self.stats.delta_count += 1;
        match self.state {
            SyncState::Synchronized => {
                self.apply_live(data);
            }
            SyncState::Synchronizing => {
                if self.apply_live(data) {
                    self.finish_if_caught_up();
                }
            }
            SyncState::Buffering | SyncState::FetchingSnapshot | SyncState::Resynchronizing => {
                self.buffer(data);
            }
            SyncState::Disconnected => {}
        }
    }

    /// Deliver a fetched snapshot.
    ///
    /// Seeds the book, discards buffered deltas the snapshot already covers
    /// and replays the rest. Returns `false` if the book is not started.
    pub fn on_snapshot(
        &mut self,
        bids: &[BookLevel],
        asks: &[BookLevel],
        last_update_id: SequenceId,
    ) -> bool {
        if self.state == SyncState::Disconnected {
            debug!(symbol = %self.symbol, last_update_id, "snapshot ignored, not started");
            return false;
        }

        self.stats.snapshot_count += 1;
        self.requested_at = None;
        self.retry_at = None;
        self.timeout_streak = 0;

        self.set_state(SyncState::Synchronizing);
        self.book.apply_snapshot(bids, asks, last_update_id);

        let mut replay = std::mem::take(&mut self.pending).into_iter();
        let mut replayed = 0usize;
        while let Some(delta) = replay.next() {
            if delta.final_update_id <= last_update_id {
                self.stats.stale_delta_count += 1;
                continue;
            }
            if !self.apply_live(delta) {
                // A new cycle started; later deltas may still be useful to it
                for rest in replay {
                    self.buffer(rest);
                }
                return true;
            }
            replayed += 1;
        }

        debug!(
            symbol = %self.symbol,
            last_update_id,
            replayed,
            sequence = self.book.sequence(),
            "replay complete"
        );
        self.finish_if_caught_up();
        true
    }

    /// Drop the current book and start a new snapshot cycle.
    ///
    /// Returns `false` when no cycle was started because the book is stopped
    /// or already waiting for a snapshot.
    pub fn request_rebuild(&mut self) -> bool {
        match self.state {
            SyncState::Synchronized | SyncState::Synchronizing => {
                let parked = self.book.take_buffered_updates();
                self.book.request_rebuild();
                self.begin_resync("manual rebuild");
                for delta in parked {
                    self.buffer(delta);
                }
                true
            }
            _ => false,
        }
    }

    /// Evaluate snapshot timeouts and due retries. Call periodically.
    pub fn on_tick(&mut self) {
        let now = self.clock.now_ms();
        match self.state {
            SyncState::FetchingSnapshot => {
                if let Some(at) = self.requested_at {
                    if now.saturating_sub(at) >= self.config.snapshot_timeout_ms {
                        self.handle_timeout(now);
                    }
                }
            }
            SyncState::Buffering => {
                if self.retry_at.is_some_and(|at| now >= at) {
                    self.issue_snapshot_request();
                }
            }
            _ => {}
        }
    }

    /// Apply a delta to the book. Returns `false` if it forced a resync.
    ///
    /// On a forced resync the deltas the book had parked and the delta itself
    /// move to the pending buffer, so the next snapshot decides which of them
    /// are stale.
    fn apply_live(&mut self, data: BookData) -> bool {
        match self.book.apply_book_data(&data) {
            UpdateResult::GapDetected if self.book.state() == BookState::Syncing => {
                let parked = self.book.take_buffered_updates();
                self.begin_resync("sequence gap");
                for delta in parked {
                    self.buffer(delta);
                }
                self.buffer(data);
                false
            }
            _ => true,
        }
    }

    /// Leave `Synchronizing` once no update is parked behind a missing id
    fn finish_if_caught_up(&mut self) {
        let parked = self.book.buffered_update_count();
        if parked == 0 {
            self.set_state(SyncState::Synchronized);
        } else {
            debug!(
                symbol = %self.symbol,
                parked,
                expected = self.book.expected_sequence(),
                "waiting for missing updates"
            );
        }
    }

    fn buffer(&mut self, data: BookData) {
        self.pending.push_back(data);
        if self.pending.len() > self.config.max_buffer_size {
            self.pending.pop_front();
            self.stats.dropped_delta_count += 1;
            debug!(
                symbol = %self.symbol,
                dropped = self.stats.dropped_delta_count,
                "pre-snapshot buffer full, dropped oldest delta"
            );
        }
    }

    fn begin_resync(&mut self, reason: &'static str) {
        warn!(
            symbol = %self.symbol,
            reason,
            sequence = self.book.sequence(),
            "resynchronizing orderbook"
        );
        self.stats.resync_count += 1;
        self.set_state(SyncState::Resynchronizing);
        self.issue_snapshot_request();
    }

    fn handle_timeout(&mut self, now: TimestampMs) {
        self.timeout_streak += 1;
        self.stats.resync_count += 1;
        self.requested_at = None;

        if self.config.retry.is_exhausted(self.timeout_streak) {
            error!(
                symbol = %self.symbol,
                timeouts = self.timeout_streak,
                "snapshot retries exhausted, stopping"
            );
            self.stop();
            return;
        }

        let delay = self
            .config
            .retry
            .jittered_delay_for_attempt(self.timeout_streak - 1);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        warn!(
            symbol = %self.symbol,
            timeouts = self.timeout_streak,
            retry_in_ms = delay_ms,
            "snapshot request timed out"
        );

        self.set_state(SyncState::Buffering);
        if delay_ms == 0 {
            self.issue_snapshot_request();
        } else {
            self.retry_at = Some(now.saturating_add(delay_ms));
        }
    }

    fn issue_snapshot_request(&mut self) {
        self.requested_at = Some(self.clock.now_ms());
        self.retry_at = None;
        self.set_state(SyncState::FetchingSnapshot);
        debug!(symbol = %self.symbol, "requesting snapshot");
        self.source.request_snapshot(&self.symbol);
    }

    fn set_state(&mut self, next: SyncState) {
        if self.state != next {
            debug!(symbol = %self.symbol, from = ?self.state, to = ?next, "sync state change");
            self.state = next;
        }
    }
}

impl fmt::Debug for ManagedOrderBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedOrderBook")
            .field("symbol", &self.symbol)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .field("pending", &self.pending.len())
            .field("book", &self.book)
            .finish()
    }
}
