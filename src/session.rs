//! Market-data session tying subscriptions to managed orderbooks.
//!
//! [`MarketDataSession`] owns one [`SubscriptionManager`] and one
//! [`ManagedOrderBook`] per symbol with an order-book subscription. Books are
//! created and started on the first order-book subscriber and torn down with
//! the last one. Updates only reach a book while its subscription is active.
//!
//! # Sharing
//!
//! The session itself takes `&mut self` everywhere. For setups where a
//! decoder task and a timer both touch it, wrap it in [`SharedSession`] and
//! let [`spawn_timer_driver`] tick it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::Error;
use crate::orderbook::{ManagedOrderBook, ManagedStats, SnapshotSource, SyncState};
use crate::subscription::SubscriptionManager;
use crate::types::{BookData, BookLevel, BookSnapshot, EventType, SequenceId};

/// Session behind a mutex, shared between the feed and the timer driver
pub type SharedSession = Arc<Mutex<MarketDataSession>>;

/// Subscriptions plus the orderbooks they keep alive.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use orderbook_sync::clock::SystemClock;
/// use orderbook_sync::config::SessionConfig;
/// use orderbook_sync::orderbook::{RecordingSource, SyncState};
/// use orderbook_sync::session::MarketDataSession;
/// use orderbook_sync::types::{BookData, BookLevel, EventType};
///
/// let source = Arc::new(RecordingSource::new());
/// let mut session = MarketDataSession::new(
///     SessionConfig::default(),
///     source.clone(),
///     Arc::new(SystemClock::new()),
/// );
///
/// session.on_connected();
/// session.subscribe("BTC-USD", EventType::OrderBook, "client-1").unwrap();
/// session.subscriptions_mut().confirm_subscription("BTC-USD", EventType::OrderBook);
/// assert_eq!(source.take_requests(), vec!["BTC-USD"]);
///
/// session
///     .on_update("BTC-USD", BookData::snapshot(100, vec![BookLevel::new(99.0, 1.0)], vec![]))
///     .unwrap();
/// assert_eq!(session.sync_state("BTC-USD"), Some(SyncState::Synchronized));
/// ```
pub struct MarketDataSession {
    subscriptions: SubscriptionManager,
    books: FxHashMap<String, ManagedOrderBook>,
    source: Arc<dyn SnapshotSource>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl MarketDataSession {
    /// Create an empty session
    pub fn new(
        config: SessionConfig,
        source: Arc<dyn SnapshotSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            subscriptions: SubscriptionManager::new(config.subscriptions.clone(), clock.clone()),
            books: FxHashMap::default(),
            source,
            clock,
            config,
        }
    }

    /// Wrap the session for sharing with [`spawn_timer_driver`]
    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    /// Subscription registry
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Subscription registry, for confirmations and error reports
    pub fn subscriptions_mut(&mut self) -> &mut SubscriptionManager {
        &mut self.subscriptions
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe a client. The first order-book subscriber of a symbol
    /// starts its managed book.
    pub fn subscribe(
        &mut self,
        symbol: &str,
        event_type: EventType,
        client_id: &str,
    ) -> Result<(), Error> {
        self.subscriptions
            .try_subscribe(symbol, event_type, client_id)?;

        if event_type == EventType::OrderBook && !self.books.contains_key(symbol) {
            let mut book = ManagedOrderBook::new(
                symbol,
                self.config.book.clone(),
                Arc::clone(&self.source),
                Arc::clone(&self.clock),
            );
            if self.subscriptions.is_connected() {
                book.start();
            }
            info!(symbol, "tracking orderbook");
            self.books.insert(symbol.to_string(), book);
        }
        Ok(())
    }

    /// Unsubscribe a client. The book goes away with its last subscriber.
    pub fn unsubscribe(&mut self, symbol: &str, event_type: EventType, client_id: &str) -> bool {
        if !self.subscriptions.unsubscribe(symbol, event_type, client_id) {
            return false;
        }
        if event_type == EventType::OrderBook {
            self.release_unsubscribed_books();
        }
        true
    }

    /// Remove a client from every stream. Returns how many it left.
    pub fn unsubscribe_client(&mut self, client_id: &str) -> usize {
        let removed = self.subscriptions.unsubscribe_client(client_id);
        if removed > 0 {
            self.release_unsubscribed_books();
        }
        removed
    }

    /// Upstream connection is up: resume paused streams and restart books
    pub fn on_connected(&mut self) {
        self.subscriptions.on_connected();
        self.subscriptions.resume_all();
        for book in self.books.values_mut() {
            book.start();
        }
    }

    /// Upstream connection dropped: pause streams and stop every book
    pub fn on_disconnected(&mut self) {
        self.subscriptions.on_disconnected();
        for book in self.books.values_mut() {
            book.stop();
        }
    }

    /// Route one decoded order-book update.
    ///
    /// Fails with [`Error::NotSubscribed`] unless the symbol's order-book
    /// stream is active.
    pub fn on_update(&mut self, symbol: &str, data: BookData) -> Result<(), Error> {
        if !self.subscriptions.is_active(symbol, EventType::OrderBook) {
            trace!(symbol, "update dropped, subscription not active");
            return Err(Error::NotSubscribed {
                symbol: symbol.to_string(),
                event_type: EventType::OrderBook,
            });
        }
        let book = self
            .books
            .get_mut(symbol)
            .ok_or_else(|| Error::UnknownSymbol(symbol.to_string()))?;

        self.subscriptions
            .record_message(symbol, EventType::OrderBook);
        book.on_delta(data);
        Ok(())
    }

    /// Deliver a fetched snapshot for `symbol`.
    ///
    /// Returns whether the book accepted it.
    pub fn on_snapshot(
        &mut self,
        symbol: &str,
        bids: &[BookLevel],
        asks: &[BookLevel],
        last_update_id: SequenceId,
    ) -> Result<bool, Error> {
        let book = self
            .books
            .get_mut(symbol)
            .ok_or_else(|| Error::UnknownSymbol(symbol.to_string()))?;
        Ok(book.on_snapshot(bids, asks, last_update_id))
    }

    /// Start a new snapshot cycle for `symbol`
    pub fn request_rebuild(&mut self, symbol: &str) -> Result<bool, Error> {
        let book = self
            .books
            .get_mut(symbol)
            .ok_or_else(|| Error::UnknownSymbol(symbol.to_string()))?;
        Ok(book.request_rebuild())
    }

    /// Evaluate timeouts and retries on every book
    pub fn tick(&mut self) {
        for book in self.books.values_mut() {
            book.on_tick();
        }
    }

    /// Managed book for `symbol`
    pub fn book(&self, symbol: &str) -> Option<&ManagedOrderBook> {
        self.books.get(symbol)
    }

    /// Depth-limited view of `symbol`'s book
    pub fn snapshot(&self, symbol: &str, depth_limit: usize) -> Option<BookSnapshot> {
        self.books.get(symbol).map(|b| b.snapshot(depth_limit))
    }

    /// Resync state of `symbol`'s book
    pub fn sync_state(&self, symbol: &str) -> Option<SyncState> {
        self.books.get(symbol).map(ManagedOrderBook::state)
    }

    /// Counters of `symbol`'s book
    pub fn stats(&self, symbol: &str) -> Option<ManagedStats> {
        self.books.get(symbol).map(ManagedOrderBook::stats)
    }

    /// Symbols with a tracked book, sorted
    pub fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.books.keys().cloned().collect();
        symbols.sort_unstable();
        symbols
    }

    /// Counters of every book as a JSON object keyed by symbol
    pub fn stats_json(&self) -> Result<String, Error> {
        let report: BTreeMap<&str, ManagedStats> = self
            .books
            .iter()
            .map(|(symbol, book)| (symbol.as_str(), book.stats()))
            .collect();
        Ok(serde_json::to_string(&report)?)
    }

    fn release_unsubscribed_books(&mut self) {
        let subscriptions = &self.subscriptions;
        self.books.retain(|symbol, book| {
            let keep = subscriptions.entry(symbol, EventType::OrderBook).is_some();
            if !keep {
                book.stop();
                info!(symbol = %symbol, "released orderbook");
            }
            keep
        });
    }
}

impl fmt::Debug for MarketDataSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketDataSession")
            .field("subscriptions", &self.subscriptions)
            .field("books", &self.books.len())
            .finish()
    }
}

/// Tick `session` every `period` on the current tokio runtime.
///
/// The task ends on its own once every other handle to the session has been
/// dropped; abort the returned handle to stop it earlier.
pub fn spawn_timer_driver(session: &SharedSession, period: Duration) -> JoinHandle<()> {
    let session: Weak<Mutex<MarketDataSession>> = Arc::downgrade(session);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(session) = session.upgrade() else {
                debug!("session dropped, timer driver exiting");
                break;
            };
            session.lock().tick();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{ManagedBookConfig, SnapshotRetryPolicy, SubscriptionConfig};
    use crate::orderbook::RecordingSource;
    use crate::types::SubscriptionState;

    struct Harness {
        session: MarketDataSession,
        source: Arc<RecordingSource>,
        clock: Arc<ManualClock>,
    }

    fn harness(config: SessionConfig) -> Harness {
        let source = Arc::new(RecordingSource::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let mut session = MarketDataSession::new(config, source.clone(), clock.clone());
        session.on_connected();
        Harness {
            session,
            source,
            clock,
        }
    }

    fn levels(pairs: &[(f64, f64)]) -> Vec<BookLevel> {
        pairs.iter().copied().map(BookLevel::from).collect()
    }

    fn subscribe_active(h: &mut Harness, symbol: &str, client: &str) {
        h.session
            .subscribe(symbol, EventType::OrderBook, client)
            .unwrap();
        h.session
            .subscriptions_mut()
            .confirm_subscription(symbol, EventType::OrderBook);
    }

    #[test]
    fn test_first_orderbook_subscriber_starts_book() {
        let mut h = harness(SessionConfig::default());

        h.session
            .subscribe("BTC-USD", EventType::Trades, "c1")
            .unwrap();
        assert!(h.session.book("BTC-USD").is_none());

        subscribe_active(&mut h, "BTC-USD", "c1");
        subscribe_active(&mut h, "BTC-USD", "c2");
        assert_eq!(
            h.session.sync_state("BTC-USD"),
            Some(SyncState::FetchingSnapshot)
        );
        assert_eq!(h.source.take_requests(), vec!["BTC-USD"]);
    }

    #[test]
    fn test_last_unsubscribe_releases_book() {
        let mut h = harness(SessionConfig::default());
        subscribe_active(&mut h, "BTC-USD", "c1");
        subscribe_active(&mut h, "BTC-USD", "c2");

        assert!(h.session.unsubscribe("BTC-USD", EventType::OrderBook, "c1"));
        assert!(h.session.book("BTC-USD").is_some());

        assert!(h.session.unsubscribe("BTC-USD", EventType::OrderBook, "c2"));
        assert!(h.session.book("BTC-USD").is_none());
        assert!(h.session.tracked_symbols().is_empty());
    }

    #[test]
    fn test_unsubscribe_client_releases_books() {
        let mut h = harness(SessionConfig::default());
        subscribe_active(&mut h, "A", "c1");
        subscribe_active(&mut h, "B", "c1");
        subscribe_active(&mut h, "B", "c2");

        assert_eq!(h.session.unsubscribe_client("c1"), 2);
        assert_eq!(h.session.tracked_symbols(), vec!["B"]);
    }

    #[test]
    fn test_updates_gated_on_active_subscription() {
        let mut h = harness(SessionConfig::default());
        h.session
            .subscribe("BTC-USD", EventType::OrderBook, "c1")
            .unwrap();

        // Still Pending
        let err = h
            .session
            .on_update("BTC-USD", BookData::delta(1, 1, levels(&[(1.0, 1.0)]), vec![]))
            .unwrap_err();
        assert!(matches!(err, Error::NotSubscribed { .. }));
        assert_eq!(h.session.stats("BTC-USD").unwrap().delta_count, 0);

        h.session
            .subscriptions_mut()
            .confirm_subscription("BTC-USD", EventType::OrderBook);
        h.session
            .on_update("BTC-USD", BookData::delta(1, 1, levels(&[(1.0, 1.0)]), vec![]))
            .unwrap();
        assert_eq!(h.session.stats("BTC-USD").unwrap().delta_count, 1);
        assert_eq!(
            h.session
                .subscriptions()
                .message_count("BTC-USD", EventType::OrderBook),
            Some(1)
        );
    }

    #[test]
    fn test_snapshot_and_replay_through_session() {
        let mut h = harness(SessionConfig::default());
        subscribe_active(&mut h, "BTC-USD", "c1");

        h.session
            .on_update(
                "BTC-USD",
                BookData::delta(99, 100, levels(&[(50000.0, 9.0)]), vec![]),
            )
            .unwrap();
        h.session
            .on_update(
                "BTC-USD",
                BookData::delta(101, 101, levels(&[(50000.0, 2.0)]), vec![]),
            )
            .unwrap();

        let accepted = h
            .session
            .on_snapshot(
                "BTC-USD",
                &levels(&[(50000.0, 1.0)]),
                &levels(&[(50001.0, 1.0)]),
                100,
            )
            .unwrap();
        assert!(accepted);

        let book = h.session.book("BTC-USD").unwrap();
        assert_eq!(book.state(), SyncState::Synchronized);
        assert_eq!(book.book().sequence(), 101);
        assert_eq!(book.book().best_bid(), Some(BookLevel::new(50000.0, 2.0)));
        assert_eq!(book.stats().stale_delta_count, 1);

        let view = h.session.snapshot("BTC-USD", 1).unwrap();
        assert_eq!(view.sequence, 101);
        assert_eq!(view.bids.len(), 1);
    }

    #[test]
    fn test_unknown_symbol_errors() {
        let mut h = harness(SessionConfig::default());
        assert!(matches!(
            h.session.on_snapshot("NOPE", &[], &[], 1),
            Err(Error::UnknownSymbol(_))
        ));
        assert!(matches!(
            h.session.request_rebuild("NOPE"),
            Err(Error::UnknownSymbol(_))
        ));
        assert!(h.session.snapshot("NOPE", 10).is_none());
    }

    #[test]
    fn test_admission_errors_propagate() {
        let config = SessionConfig::default().with_subscriptions(
            SubscriptionConfig::default().with_max_total_subscriptions(1),
        );
        let mut h = harness(config);
        subscribe_active(&mut h, "A", "c1");

        let err = h
            .session
            .subscribe("B", EventType::OrderBook, "c1")
            .unwrap_err();
        assert!(err.is_admission());
        assert!(h.session.book("B").is_none());
    }

    #[test]
    fn test_disconnect_stops_books_and_reconnect_restarts() {
        let mut h = harness(SessionConfig::default());
        subscribe_active(&mut h, "BTC-USD", "c1");
        h.session
            .on_snapshot("BTC-USD", &levels(&[(1.0, 1.0)]), &[], 10)
            .unwrap();
        h.source.take_requests();

        h.session.on_disconnected();
        assert_eq!(h.session.sync_state("BTC-USD"), Some(SyncState::Disconnected));
        assert_eq!(
            h.session
                .subscriptions()
                .state("BTC-USD", EventType::OrderBook),
            Some(SubscriptionState::Paused)
        );

        h.session.on_connected();
        assert_eq!(
            h.session.sync_state("BTC-USD"),
            Some(SyncState::FetchingSnapshot)
        );
        assert_eq!(
            h.session
                .subscriptions()
                .state("BTC-USD", EventType::OrderBook),
            Some(SubscriptionState::Pending)
        );
        assert_eq!(h.source.take_requests(), vec!["BTC-USD"]);
    }

    #[test]
    fn test_subscribe_while_disconnected_defers_start() {
        let source = Arc::new(RecordingSource::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut session = MarketDataSession::new(SessionConfig::default(), source.clone(), clock);

        session
            .subscribe("BTC-USD", EventType::OrderBook, "c1")
            .unwrap();
        assert_eq!(session.sync_state("BTC-USD"), Some(SyncState::Disconnected));
        assert_eq!(source.request_count(), 0);

        session.on_connected();
        assert_eq!(source.request_count(), 1);
    }

    #[test]
    fn test_tick_drives_snapshot_timeout() {
        let config = SessionConfig::default().with_book(
            ManagedBookConfig::default()
                .with_snapshot_timeout(Duration::from_millis(500))
                .with_retry(SnapshotRetryPolicy::new().initial_delay_ms(0)),
        );
        let mut h = harness(config);
        subscribe_active(&mut h, "BTC-USD", "c1");
        assert_eq!(h.source.take_requests().len(), 1);

        h.clock.advance_ms(499);
        h.session.tick();
        assert!(h.source.take_requests().is_empty());

        h.clock.advance_ms(1);
        h.session.tick();
        assert_eq!(h.source.take_requests(), vec!["BTC-USD"]);
        assert_eq!(h.session.stats("BTC-USD").unwrap().resync_count, 1);
    }

    #[test]
    fn test_request_rebuild_through_session() {
        let mut h = harness(SessionConfig::default());
        subscribe_active(&mut h, "BTC-USD", "c1");
        assert!(!h.session.request_rebuild("BTC-USD").unwrap());

        h.session
            .on_snapshot("BTC-USD", &levels(&[(1.0, 1.0)]), &[], 10)
            .unwrap();
        h.source.take_requests();
        assert!(h.session.request_rebuild("BTC-USD").unwrap());
        assert_eq!(
            h.session.sync_state("BTC-USD"),
            Some(SyncState::FetchingSnapshot)
        );
        assert!(!h.session.book("BTC-USD").unwrap().book().is_synchronized());
        assert_eq!(h.source.take_requests(), vec!["BTC-USD"]);
    }

    #[test]
    fn test_stats_json() {
        let mut h = harness(SessionConfig::default());
        subscribe_active(&mut h, "BTC-USD", "c1");

        let json = h.session.stats_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["BTC-USD"]["snapshot_count"], 0);
        assert_eq!(value["BTC-USD"]["resync_count"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_driver_fires_timeouts() {
        let config = SessionConfig::default().with_book(
            ManagedBookConfig::default()
                .with_snapshot_timeout(Duration::from_millis(1_000))
                .with_retry(SnapshotRetryPolicy::new().initial_delay_ms(0)),
        );
        let Harness {
            mut session,
            source,
            clock,
        } = harness(config);
        session
            .subscribe("BTC-USD", EventType::OrderBook, "c1")
            .unwrap();
        assert_eq!(source.take_requests().len(), 1);

        let shared = session.into_shared();
        let driver = spawn_timer_driver(&shared, Duration::from_millis(100));

        clock.advance_ms(1_000);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(source.take_requests(), vec!["BTC-USD"]);
        assert_eq!(shared.lock().stats("BTC-USD").unwrap().resync_count, 1);

        drop(shared);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(driver.is_finished());
    }
}
