//! Configuration for orderbooks, managed books and subscriptions.
//!
//! Every component takes its configuration explicitly. There is no global
//! state, so independent books for different symbols never share settings
//! unless the caller hands them the same values.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::error::Error;

/// Sequencing and depth limits for a single [`OrderBook`](crate::orderbook::OrderBook)
///
/// # Example
///
/// ```rust
/// use orderbook_sync::config::OrderBookConfig;
///
/// let config = OrderBookConfig::default()
///     .with_max_sequence_gap(5)
///     .with_max_depth_levels(20);
/// assert_eq!(config.max_sequence_gap, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OrderBookConfig {
    /// Largest number of missing update ids that is still buffered
    pub max_sequence_gap: u64,
    /// Maximum number of out-of-order deltas held in the gap buffer
    pub max_buffer_size: usize,
    /// Levels kept per side (0 = unlimited)
    pub max_depth_levels: usize,
}

impl Default for OrderBookConfig {
    fn default() -> Self {
        Self {
            max_sequence_gap: 100,
            max_buffer_size: 1000,
            max_depth_levels: 0,
        }
    }
}

impl OrderBookConfig {
    /// Set the maximum bufferable gap
    #[must_use]
    pub fn with_max_sequence_gap(mut self, gap: u64) -> Self {
        self.max_sequence_gap = gap;
        self
    }

    /// Set the gap buffer capacity
    #[must_use]
    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Set the number of levels kept per side
    #[must_use]
    pub fn with_max_depth_levels(mut self, levels: usize) -> Self {
        self.max_depth_levels = levels;
        self
    }

    /// Check the values are usable
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_buffer_size == 0 {
            return Err(Error::Config("max_buffer_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Backoff applied between snapshot requests after a timeout.
///
/// The delay grows exponentially from `initial_delay_ms` and is capped at
/// `max_delay_ms`, so a venue that never answers is polled at a bounded rate.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SnapshotRetryPolicy {
    /// Consecutive timeouts before the book gives up (`None` = keep retrying)
    pub max_retries: Option<u32>,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound for any retry delay
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Random spread applied to each delay, as a fraction (0.1 = ±10%)
    pub jitter: f64,
}

impl Default for SnapshotRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl SnapshotRetryPolicy {
    /// Create a policy with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum consecutive retries
    #[must_use]
    pub fn max_retries(mut self, retries: Option<u32>) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set initial delay in milliseconds
    #[must_use]
    pub fn initial_delay_ms(mut self, ms: u64) -> Self {
        self.initial_delay_ms = ms;
        self
    }

    /// Set maximum delay in milliseconds
    #[must_use]
    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    /// Set backoff multiplier
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set jitter fraction
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether `attempt` consecutive timeouts exhaust the policy
    #[must_use]
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_retries.is_some_and(|max| attempt > max)
    }

    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exp);
        let delay_ms = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }

    /// Delay before retry number `attempt` with jitter applied
    pub fn jittered_delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = self.jitter.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        let ms = (base.as_millis() as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Check the values are usable
    pub fn validate(&self) -> Result<(), Error> {
        if self.backoff_multiplier < 1.0 {
            return Err(Error::Config("backoff_multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::Config("jitter must be within 0.0..=1.0".into()));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(Error::Config(
                "initial_delay_ms must not exceed max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Settings for a [`ManagedOrderBook`](crate::orderbook::ManagedOrderBook)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ManagedBookConfig {
    /// Capacity of the pre-snapshot delta buffer
    pub max_buffer_size: usize,
    /// Levels kept per side (0 = unlimited)
    pub max_depth_levels: usize,
    /// How long to wait for a requested snapshot
    pub snapshot_timeout_ms: u64,
    /// Largest bufferable gap once synchronized
    pub max_sequence_gap: u64,
    /// Backoff between snapshot requests after a timeout
    pub retry: SnapshotRetryPolicy,
}

impl Default for ManagedBookConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 1000,
            max_depth_levels: 0,
            snapshot_timeout_ms: 5_000,
            max_sequence_gap: 100,
            retry: SnapshotRetryPolicy::default(),
        }
    }
}

impl ManagedBookConfig {
    /// Set the pre-snapshot buffer capacity
    #[must_use]
    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Set the number of levels kept per side
    #[must_use]
    pub fn with_max_depth_levels(mut self, levels: usize) -> Self {
        self.max_depth_levels = levels;
        self
    }

    /// Set the snapshot timeout
    #[must_use]
    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the maximum bufferable gap
    #[must_use]
    pub fn with_max_sequence_gap(mut self, gap: u64) -> Self {
        self.max_sequence_gap = gap;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: SnapshotRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Configuration for the inner [`OrderBook`](crate::orderbook::OrderBook)
    #[must_use]
    pub fn book_config(&self) -> OrderBookConfig {
        OrderBookConfig {
            max_sequence_gap: self.max_sequence_gap,
            max_buffer_size: self.max_buffer_size,
            max_depth_levels: self.max_depth_levels,
        }
    }

    /// Check the values are usable
    pub fn validate(&self) -> Result<(), Error> {
        if self.snapshot_timeout_ms == 0 {
            return Err(Error::Config("snapshot_timeout_ms must be positive".into()));
        }
        self.book_config().validate()?;
        self.retry.validate()
    }
}

/// Admission limits for the [`SubscriptionManager`](crate::subscription::SubscriptionManager)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Cap on (symbol, event type, client) subscriptions
    pub max_total_subscriptions: usize,
    /// Successful subscribes allowed in any one-second window
    pub max_subscriptions_per_second: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_total_subscriptions: 1000,
            max_subscriptions_per_second: 10,
        }
    }
}

impl SubscriptionConfig {
    /// Set the total subscription cap
    #[must_use]
    pub fn with_max_total_subscriptions(mut self, max: usize) -> Self {
        self.max_total_subscriptions = max;
        self
    }

    /// Set the per-second subscription rate
    #[must_use]
    pub fn with_max_subscriptions_per_second(mut self, max: usize) -> Self {
        self.max_subscriptions_per_second = max;
        self
    }
}

/// Top-level configuration for a [`MarketDataSession`](crate::session::MarketDataSession)
///
/// # Example
///
/// ```rust
/// use orderbook_sync::config::SessionConfig;
///
/// let config = SessionConfig::from_json_str(
///     r#"{ "book": { "snapshot_timeout_ms": 2000 }, "subscriptions": { "max_total_subscriptions": 50 } }"#,
/// ).unwrap();
/// assert_eq!(config.book.snapshot_timeout_ms, 2000);
/// assert_eq!(config.subscriptions.max_total_subscriptions, 50);
/// ```
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Settings applied to every managed book
    pub book: ManagedBookConfig,
    /// Subscription admission limits
    pub subscriptions: SubscriptionConfig,
}

impl SessionConfig {
    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the managed book settings
    #[must_use]
    pub fn with_book(mut self, book: ManagedBookConfig) -> Self {
        self.book = book;
        self
    }

    /// Set the subscription limits
    #[must_use]
    pub fn with_subscriptions(mut self, subscriptions: SubscriptionConfig) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    /// Check the values are usable
    pub fn validate(&self) -> Result<(), Error> {
        self.book.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = SnapshotRetryPolicy::default();
        assert_eq!(policy.max_retries, None);
        assert_eq!(policy.initial_delay_ms, 100);
        assert_eq!(policy.max_delay_ms, 30_000);
        assert!((policy.backoff_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_delay_calculation() {
        let policy = SnapshotRetryPolicy::new()
            .initial_delay_ms(100)
            .backoff_multiplier(2.0)
            .max_delay_ms(1000);

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        // Capped
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = SnapshotRetryPolicy::new()
            .initial_delay_ms(1000)
            .max_delay_ms(10_000)
            .jitter(0.2);

        for _ in 0..100 {
            let ms = policy.jittered_delay_for_attempt(0).as_millis();
            assert!((799..=1200).contains(&ms), "delay {ms} out of range");
        }
    }

    #[test]
    fn test_exhaustion() {
        let unbounded = SnapshotRetryPolicy::new();
        assert!(!unbounded.is_exhausted(u32::MAX));

        let bounded = SnapshotRetryPolicy::new().max_retries(Some(2));
        assert!(!bounded.is_exhausted(2));
        assert!(bounded.is_exhausted(3));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(SnapshotRetryPolicy::new().backoff_multiplier(0.5).validate().is_err());
        assert!(SnapshotRetryPolicy::new().jitter(1.5).validate().is_err());
        assert!(OrderBookConfig::default().with_max_buffer_size(0).validate().is_err());
        assert!(ManagedBookConfig::default()
            .with_snapshot_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_session_config_from_json() {
        let config = SessionConfig::from_json_str(
            r#"{
                "book": { "max_buffer_size": 16, "retry": { "max_retries": 3 } },
                "subscriptions": { "max_subscriptions_per_second": 2 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.book.max_buffer_size, 16);
        assert_eq!(config.book.retry.max_retries, Some(3));
        assert_eq!(config.book.snapshot_timeout_ms, 5_000);
        assert_eq!(config.subscriptions.max_subscriptions_per_second, 2);
        assert_eq!(config.subscriptions.max_total_subscriptions, 1000);
    }

    #[test]
    fn test_session_config_rejects_bad_json() {
        assert!(matches!(
            SessionConfig::from_json_str("not json"),
            Err(Error::Json(_))
        ));
        assert!(matches!(
            SessionConfig::from_json_str(r#"{ "book": { "snapshot_timeout_ms": 0 } }"#),
            Err(Error::Config(_))
        ));
    }
}
