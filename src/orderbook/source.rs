//! Snapshot request seam.
//!
//! The core never performs I/O. When a book needs a fresh snapshot it calls
//! [`SnapshotSource::request_snapshot`]; the implementation (usually a REST
//! client task) fetches it and feeds the result back through
//! `apply_snapshot` / `on_snapshot`.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Something that can be asked to fetch a snapshot for a symbol
pub trait SnapshotSource: Send + Sync {
    /// Ask for a fresh snapshot of `symbol`. Must not block.
    fn request_snapshot(&self, symbol: &str);
}

impl<F> SnapshotSource for F
where
    F: Fn(&str) + Send + Sync,
{
    fn request_snapshot(&self, symbol: &str) {
        self(symbol)
    }
}

/// Records every request it receives.
///
/// Useful in tests and when snapshot fetching is driven by polling
/// [`RecordingSource::take_requests`] instead of a callback.
#[derive(Default)]
pub struct RecordingSource {
    requests: Mutex<Vec<String>>,
    total: AtomicUsize,
}

impl RecordingSource {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of requests received
    pub fn request_count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Drain the symbols requested since the last call
    pub fn take_requests(&self) -> Vec<String> {
        std::mem::take(&mut *self.requests.lock())
    }
}

impl SnapshotSource for RecordingSource {
    fn request_snapshot(&self, symbol: &str) {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(symbol.to_string());
    }
}

impl fmt::Debug for RecordingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingSource")
            .field("total", &self.request_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_closure_is_a_source() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let source = move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        };

        source.request_snapshot("BTC-USD");
        source.request_snapshot("ETH-USD");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_recording_source_drains() {
        let source = RecordingSource::new();
        source.request_snapshot("BTC-USD");
        source.request_snapshot("BTC-USD");

        assert_eq!(source.take_requests(), vec!["BTC-USD", "BTC-USD"]);
        assert!(source.take_requests().is_empty());
        assert_eq!(source.request_count(), 2);
    }
}
