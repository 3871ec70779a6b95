//! Per (symbol, event type) subscription bookkeeping.
//!
//! # State machine
//!
//! ```text
//! subscribe ──> Pending ──confirm──> Active
//!                  ^                   │
//!                  │ resume_all        │ on_disconnected (also from Pending)
//!                  └────── Paused <────┘
//!
//! mark_error: any ──> Error
//! ```
//!
//! The manager takes `&mut self` and holds no locks; wrap it in a mutex if it
//! has to be shared.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SubscriptionConfig;
use crate::error::Error;
use crate::types::{EventType, SubscriptionState, TimestampMs};

/// Length of the rate-limit window
const RATE_WINDOW_MS: u64 = 1_000;

/// Called with (symbol, event type, old state, new state)
pub type StateChangeCallback =
    Box<dyn Fn(&str, EventType, SubscriptionState, SubscriptionState) + Send + Sync>;

/// Called with the new connection status
pub type ConnectionCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Whether `symbol` is acceptable for subscription.
///
/// Non-empty, ASCII alphanumerics plus `-`, `_` and `/`.
pub fn is_valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty()
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/'))
}

/// Subscribers and lifecycle state of one (symbol, event type) stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    clients: BTreeSet<String>,
    state: SubscriptionState,
    error_message: Option<String>,
    message_count: u64,
}

impl SubscriptionEntry {
    fn new() -> Self {
        Self {
            clients: BTreeSet::new(),
            state: SubscriptionState::Pending,
            error_message: None,
            message_count: 0,
        }
    }

    /// Subscribed client ids, sorted
    pub fn clients(&self) -> impl Iterator<Item = &str> + '_ {
        self.clients.iter().map(String::as_str)
    }

    /// Number of subscribed clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Lifecycle state
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Last error reported for this stream
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Messages recorded for this stream
    pub fn message_count(&self) -> u64 {
        self.message_count
    }
}

/// Registry of client subscriptions with admission control.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use orderbook_sync::clock::SystemClock;
/// use orderbook_sync::config::SubscriptionConfig;
/// use orderbook_sync::subscription::SubscriptionManager;
/// use orderbook_sync::types::{EventType, SubscriptionState};
///
/// let mut subs = SubscriptionManager::new(
///     SubscriptionConfig::default().with_max_total_subscriptions(2),
///     Arc::new(SystemClock::new()),
/// );
///
/// assert!(subs.subscribe("BTC-USD", EventType::OrderBook, "client-1"));
/// assert!(subs.subscribe("ETH-USD", EventType::OrderBook, "client-1"));
/// assert!(!subs.subscribe("SOL-USD", EventType::OrderBook, "client-1"));
/// assert_eq!(subs.total_subscriptions(), 2);
///
/// subs.confirm_subscription("BTC-USD", EventType::OrderBook);
/// assert_eq!(subs.state("BTC-USD", EventType::OrderBook), Some(SubscriptionState::Active));
/// ```
pub struct SubscriptionManager {
    /// symbol -> event type -> entry
    entries: FxHashMap<String, FxHashMap<EventType, SubscriptionEntry>>,
    /// Sum of client counts over all entries
    total: usize,
    /// Timestamps of recent successful subscribes, oldest first
    recent: VecDeque<TimestampMs>,
    config: SubscriptionConfig,
    clock: Arc<dyn Clock>,
    connected: bool,
    on_state_change: Option<StateChangeCallback>,
    on_connection: Option<ConnectionCallback>,
}

impl SubscriptionManager {
    /// Create an empty registry
    pub fn new(config: SubscriptionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: FxHashMap::default(),
            total: 0,
            recent: VecDeque::new(),
            config,
            clock,
            connected: false,
            on_state_change: None,
            on_connection: None,
        }
    }

    /// Register a callback fired on every state transition
    pub fn set_state_change_callback<F>(&mut self, callback: F)
    where
        F: Fn(&str, EventType, SubscriptionState, SubscriptionState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Box::new(callback));
    }

    /// Register a callback fired on connect/disconnect
    pub fn set_connection_callback<F>(&mut self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_connection = Some(Box::new(callback));
    }

    /// Subscribe `client_id` to a stream. Returns `false` if admission failed.
    pub fn subscribe(&mut self, symbol: &str, event_type: EventType, client_id: &str) -> bool {
        self.try_subscribe(symbol, event_type, client_id).is_ok()
    }

    /// Subscribe `client_id` to a stream, reporting why admission failed.
    ///
    /// Subscribing a client twice is a no-op and does not count against the
    /// limits. Failures leave the registry untouched.
    pub fn try_subscribe(
        &mut self,
        symbol: &str,
        event_type: EventType,
        client_id: &str,
    ) -> Result<(), Error> {
        if !is_valid_symbol(symbol) {
            warn!(symbol, "rejected subscription: invalid symbol");
            return Err(Error::InvalidSymbol(symbol.to_string()));
        }

        if self
            .entry(symbol, event_type)
            .is_some_and(|e| e.clients.contains(client_id))
        {
            return Ok(());
        }

        if self.total >= self.config.max_total_subscriptions {
            warn!(
                symbol,
                max = self.config.max_total_subscriptions,
                "rejected subscription: limit reached"
            );
            return Err(Error::SubscriptionLimit {
                max: self.config.max_total_subscriptions,
            });
        }

        let now = self.clock.now_ms();
        self.prune_rate_window(now);
        if self.recent.len() >= self.config.max_subscriptions_per_second {
            warn!(
                symbol,
                max_per_second = self.config.max_subscriptions_per_second,
                "rejected subscription: rate limited"
            );
            return Err(Error::RateLimited {
                max_per_second: self.config.max_subscriptions_per_second,
            });
        }
        self.recent.push_back(now);

        let entry = self
            .entries
            .entry(symbol.to_string())
            .or_default()
            .entry(event_type)
            .or_insert_with(SubscriptionEntry::new);
        entry.clients.insert(client_id.to_string());
        self.total += 1;

        debug!(symbol, %event_type, client_id, total = self.total, "subscribed");
        Ok(())
    }

    /// Remove `client_id` from a stream. Returns `false` if it was not subscribed.
    ///
    /// The entry disappears with its last client, and the symbol with its
    /// last event type.
    pub fn unsubscribe(&mut self, symbol: &str, event_type: EventType, client_id: &str) -> bool {
        let Some(events) = self.entries.get_mut(symbol) else {
            return false;
        };
        let Some(entry) = events.get_mut(&event_type) else {
            return false;
        };
        if !entry.clients.remove(client_id) {
            return false;
        }
        self.total -= 1;

        if entry.clients.is_empty() {
            events.remove(&event_type);
            debug!(symbol, %event_type, "last subscriber left");
        }
        if events.is_empty() {
            self.entries.remove(symbol);
        }
        true
    }

    /// Remove `client_id` from every stream. Returns how many it left.
    pub fn unsubscribe_client(&mut self, client_id: &str) -> usize {
        let targets: Vec<(String, EventType)> = self
            .entries
            .iter()
            .flat_map(|(symbol, events)| {
                events
                    .iter()
                    .filter(move |(_, e)| e.clients.contains(client_id))
                    .map(move |(event_type, _)| (symbol.clone(), *event_type))
            })
            .collect();

        targets
            .iter()
            .filter(|(symbol, event_type)| self.unsubscribe(symbol, *event_type, client_id))
            .count()
    }

    /// Mark a pending stream as confirmed by the venue
    pub fn confirm_subscription(&mut self, symbol: &str, event_type: EventType) -> bool {
        let Some(entry) = self
            .entries
            .get_mut(symbol)
            .and_then(|events| events.get_mut(&event_type))
        else {
            return false;
        };
        if entry.state != SubscriptionState::Pending {
            return false;
        }
        entry.state = SubscriptionState::Active;
        entry.error_message = None;
        notify(
            &self.on_state_change,
            symbol,
            event_type,
            SubscriptionState::Pending,
            SubscriptionState::Active,
        );
        true
    }

    /// Put a stream into the error state
    pub fn mark_error(
        &mut self,
        symbol: &str,
        event_type: EventType,
        message: impl Into<String>,
    ) -> bool {
        let Some(entry) = self
            .entries
            .get_mut(symbol)
            .and_then(|events| events.get_mut(&event_type))
        else {
            return false;
        };
        let old = entry.state;
        let message = message.into();
        warn!(symbol, %event_type, error = %message, "subscription error");
        entry.state = SubscriptionState::Error;
        entry.error_message = Some(message);
        if old != SubscriptionState::Error {
            notify(
                &self.on_state_change,
                symbol,
                event_type,
                old,
                SubscriptionState::Error,
            );
        }
        true
    }

    /// Connection dropped: pause every active or pending stream
    pub fn on_disconnected(&mut self) {
        self.connected = false;
        let paused = self.transition_all(
            |state| matches!(state, SubscriptionState::Active | SubscriptionState::Pending),
            SubscriptionState::Paused,
        );
        info!(paused, "connection lost, subscriptions paused");
        if let Some(callback) = &self.on_connection {
            callback(false);
        }
    }

    /// Connection (re)established
    pub fn on_connected(&mut self) {
        self.connected = true;
        info!("connection established");
        if let Some(callback) = &self.on_connection {
            callback(true);
        }
    }

    /// Move every paused stream back to pending. Returns how many moved.
    pub fn resume_all(&mut self) -> usize {
        let resumed = self.transition_all(
            |state| state == SubscriptionState::Paused,
            SubscriptionState::Pending,
        );
        debug!(resumed, "subscriptions resumed");
        resumed
    }

    /// Count one delivered message for a stream
    pub fn record_message(&mut self, symbol: &str, event_type: EventType) -> bool {
        match self
            .entries
            .get_mut(symbol)
            .and_then(|events| events.get_mut(&event_type))
        {
            Some(entry) => {
                entry.message_count += 1;
                true
            }
            None => false,
        }
    }

    /// Client ids subscribed to a stream, sorted
    pub fn subscribers(&self, symbol: &str, event_type: EventType) -> Vec<String> {
        self.entry(symbol, event_type)
            .map(|e| e.clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Look up a stream
    pub fn entry(&self, symbol: &str, event_type: EventType) -> Option<&SubscriptionEntry> {
        self.entries
            .get(symbol)
            .and_then(|events| events.get(&event_type))
    }

    /// Lifecycle state of a stream
    pub fn state(&self, symbol: &str, event_type: EventType) -> Option<SubscriptionState> {
        self.entry(symbol, event_type).map(SubscriptionEntry::state)
    }

    /// Whether data for a stream should be delivered
    pub fn is_active(&self, symbol: &str, event_type: EventType) -> bool {
        self.state(symbol, event_type)
            .is_some_and(SubscriptionState::is_active)
    }

    /// Last error recorded for a stream
    pub fn error_message(&self, symbol: &str, event_type: EventType) -> Option<&str> {
        self.entry(symbol, event_type)
            .and_then(SubscriptionEntry::error_message)
    }

    /// Messages recorded for a stream
    pub fn message_count(&self, symbol: &str, event_type: EventType) -> Option<u64> {
        self.entry(symbol, event_type)
            .map(SubscriptionEntry::message_count)
    }

    /// Number of (symbol, event type, client) subscriptions
    pub fn total_subscriptions(&self) -> usize {
        self.total
    }

    /// Symbols with at least one subscribed stream, sorted
    pub fn active_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.entries.keys().cloned().collect();
        symbols.sort_unstable();
        symbols
    }

    /// Whether any stream of `symbol` has subscribers
    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.entries.contains_key(symbol)
    }

    /// Streams currently in `state`
    pub fn subscriptions_in_state(&self, state: SubscriptionState) -> Vec<(String, EventType)> {
        let mut found: Vec<(String, EventType)> = self
            .entries
            .iter()
            .flat_map(|(symbol, events)| {
                events
                    .iter()
                    .filter(move |(_, e)| e.state == state)
                    .map(move |(event_type, _)| (symbol.clone(), *event_type))
            })
            .collect();
        found.sort_unstable();
        found
    }

    /// Whether the upstream connection is up
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Admission limits
    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    fn prune_rate_window(&mut self, now: TimestampMs) {
        while self
            .recent
            .front()
            .is_some_and(|&t| now.saturating_sub(t) >= RATE_WINDOW_MS)
        {
            self.recent.pop_front();
        }
    }

    fn transition_all<P>(&mut self, from: P, to: SubscriptionState) -> usize
    where
        P: Fn(SubscriptionState) -> bool,
    {
        let mut changed = Vec::new();
        for (symbol, events) in &mut self.entries {
            for (event_type, entry) in events.iter_mut() {
                if from(entry.state) {
                    changed.push((symbol.clone(), *event_type, entry.state));
                    entry.state = to;
                }
            }
        }
        for (symbol, event_type, old) in &changed {
            notify(&self.on_state_change, symbol, *event_type, *old, to);
        }
        changed.len()
    }
}

fn notify(
    callback: &Option<StateChangeCallback>,
    symbol: &str,
    event_type: EventType,
    old: SubscriptionState,
    new: SubscriptionState,
) {
    if let Some(callback) = callback {
        callback(symbol, event_type, old, new);
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("symbols", &self.entries.len())
            .field("total", &self.total)
            .field("connected", &self.connected)
            .field("config", &self.config)
            .finish()
    }
}
