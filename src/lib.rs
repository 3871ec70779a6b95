//! # orderbook-sync
//!
//! Local orderbook synchronization for streaming market data.
//!
//! ## Features
//!
//! - **Sequence-Validated Orderbook** - Duplicate and gap detection with a bounded gap buffer
//! - **Snapshot Resync** - Buffer the stream, fetch a snapshot, replay what it did not cover
//! - **Subscription Lifecycle** - Per-stream state, admission control, connection tracking
//! - **No I/O in the Core** - Snapshot fetches and time go through injected traits
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use orderbook_sync::clock::SystemClock;
//! use orderbook_sync::config::ManagedBookConfig;
//! use orderbook_sync::orderbook::{ManagedOrderBook, SyncState};
//! use orderbook_sync::types::{BookData, BookLevel};
//!
//! // Called whenever the book needs a fresh snapshot; hand it to your REST task
//! let source = Arc::new(|symbol: &str| println!("fetch snapshot for {symbol}"));
//!
//! let mut book = ManagedOrderBook::new(
//!     "BTC-USD",
//!     ManagedBookConfig::default(),
//!     source,
//!     Arc::new(SystemClock::new()),
//! );
//! book.start();
//!
//! // Live deltas are buffered until the snapshot arrives
//! book.on_delta(BookData::delta(101, 102, vec![BookLevel::new(50000.0, 2.0)], vec![]));
//! book.on_snapshot(
//!     &[BookLevel::new(50000.0, 1.0)],
//!     &[BookLevel::new(50001.0, 1.0)],
//!     100,
//! );
//!
//! assert_eq!(book.state(), SyncState::Synchronized);
//! assert_eq!(book.book().best_bid(), Some(BookLevel::new(50000.0, 2.0)));
//! ```
//!
//! ## Sequence Rules
//!
//! Every update carries an inclusive `[first, final]` id range:
//!
//! - `final <= sequence` is a duplicate and is dropped
//! - `first <= sequence + 1 <= final` is applied
//! - a small gap is buffered until the missing range arrives
//! - a gap above `max_sequence_gap` (or a full gap buffer) triggers a resync
//!
//! ## Architecture
//!
//! - [`orderbook`] - [`OrderBook`], [`ManagedOrderBook`] and the [`SnapshotSource`] seam
//! - [`subscription`] - [`SubscriptionManager`] registry and admission control
//! - [`session`] - [`MarketDataSession`] glue and the tokio timer driver
//! - [`types`] - Levels, updates and subscription enums
//! - [`config`] - Builder-style configuration, loadable from JSON
//! - [`clock`] - Injected time source
//! - [`error`] - Error types for the crate
//!
//! ## Performance
//!
//! - `BTreeMap` price ladders with O(log n) updates and O(1) best level access
//! - `FxHashMap` for symbol-keyed maps
//! - `parking_lot` mutexes (faster than std)
//! - No allocation on the applied-delta path beyond new price levels

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod clock;
pub mod config;
pub mod error;
pub mod orderbook;
pub mod session;
pub mod subscription;
pub mod types;

// Re-export main types at crate root for convenience
pub use config::{ManagedBookConfig, OrderBookConfig, SessionConfig, SubscriptionConfig};
pub use error::Error;
pub use orderbook::{ManagedOrderBook, OrderBook, SnapshotSource, SyncState, UpdateResult};
pub use session::{spawn_timer_driver, MarketDataSession, SharedSession};
pub use subscription::SubscriptionManager;

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(symbol: &str) -> Result<()> {
        Err(Error::UnknownSymbol(symbol.to_string()))
    }

    #[test]
    fn test_result_alias() {
        let err = lookup("BTC-USD").unwrap_err();
        assert_eq!(err.to_string(), "Unknown symbol: BTC-USD");
        assert!(!err.is_admission());
    }
}
