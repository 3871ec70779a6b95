//! Sequence-validated orderbooks.
//!
//! This module provides:
//!
//! - [`OrderBook`] - price ladder with duplicate/gap detection and a gap buffer
//! - [`ManagedOrderBook`] - snapshot + replay resynchronization around one book
//! - [`SnapshotSource`] - the seam through which books ask for snapshots
//!
//! # Example
//!
//! ```rust
//! use orderbook_sync::orderbook::{OrderBook, UpdateResult};
//! use orderbook_sync::types::{BookLevel, Side};
//!
//! let mut book = OrderBook::new("BTC-USD");
//! book.apply_snapshot(
//!     &[BookLevel::new(50000.0, 1.5), BookLevel::new(49999.0, 2.0)],
//!     &[BookLevel::new(50001.0, 1.0)],
//!     100,
//! );
//!
//! let result = book.apply_delta(BookLevel::new(50000.0, 1.0), Side::Bid, 101);
//! assert_eq!(result, UpdateResult::Applied);
//!
//! let result = book.apply_delta(BookLevel::new(50001.0, 0.0), Side::Ask, 99);
//! assert_eq!(result, UpdateResult::Duplicate);
//! ```

pub mod book;
pub mod managed;
pub mod source;

pub use book::{BookState, OrderBook, UpdateResult};
pub use managed::{ManagedOrderBook, ManagedStats, SyncState};
pub use source::{RecordingSource, SnapshotSource};
