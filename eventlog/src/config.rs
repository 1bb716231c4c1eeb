//! Configuration for the journal, the read side and the consistency tracker.
//!
//! Scalars with a valid range use `nutype` so an out-of-range value cannot be
//! constructed. All structs deserialize with serde so the host application
//! can load them from whatever source it uses.

use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::keys::KeyStrategy;

/// Number of rows requested from the backend per page.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct BatchSize(usize);

/// Number of tracker scans a gap may survive before it is abandoned.
#[nutype(
    validate(greater_or_equal = 1),
    default = 60,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct MaxAttempts(u32);

/// Number of partitions a stream is spread over.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct ShardCount(u64);

/// Write-side settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// How rows are keyed in the backend.
    pub key_strategy: KeyStrategy,
    /// Largest batch accepted by `put_messages`.
    pub write_batch_limit: BatchSize,
    /// Page size for stream scans such as `highest_sequence_nr`.
    pub replay_batch_size: BatchSize,
}

impl JournalConfig {
    /// Sets the key strategy.
    #[must_use]
    pub const fn with_key_strategy(mut self, key_strategy: KeyStrategy) -> Self {
        self.key_strategy = key_strategy;
        self
    }

    /// Sets the largest accepted write batch.
    #[must_use]
    pub const fn with_write_batch_limit(mut self, limit: BatchSize) -> Self {
        self.write_batch_limit = limit;
        self
    }

    /// Sets the page size for stream scans.
    #[must_use]
    pub const fn with_replay_batch_size(mut self, batch_size: BatchSize) -> Self {
        self.replay_batch_size = batch_size;
        self
    }
}

/// Settings shared by all queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Rows fetched per query cycle.
    pub batch_size: BatchSize,
    /// Wait between polls once a live query has caught up.
    pub refresh_interval: Duration,
    /// Whether a row that fails to decode ends the stream (`true`) or is
    /// logged and skipped (`false`).
    pub fail_fast: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            batch_size: BatchSize::default(),
            refresh_interval: Duration::from_secs(1),
            fail_fast: true,
        }
    }
}

impl QueryConfig {
    /// Sets the query batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: BatchSize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the live polling interval.
    #[must_use]
    pub const fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Sets the decode failure policy.
    #[must_use]
    pub const fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Settings for the sequence consistency tracker.
///
/// `max_attempts` and `max_gap_age` decide when a missing ordering value is
/// given up on. An abandoned gap is skipped forever by tag queries, so both
/// should be derived from how long the backend can take to make a write
/// visible. The defaults are conservative starting points only: at one scan
/// per `query_delay` they both give up after about a minute.
///
/// Whichever threshold is reached first wins. Shortening `query_delay` makes
/// the attempt limit fire sooner, so scale `max_attempts` with it, or use
/// [`TrackerConfig::with_gap_window`] to set both at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Wait between poll cycles once the tracker has caught up.
    pub query_delay: Duration,
    /// Ordering values scanned per cycle.
    pub batch_size: BatchSize,
    /// Scans a gap may stay unresolved before it is abandoned. Only scans
    /// whose window reached the gap count. With a short `query_delay` this
    /// usually fires before `max_gap_age`.
    pub max_attempts: MaxAttempts,
    /// Age after which a gap is abandoned regardless of attempts.
    pub max_gap_age: Duration,
    /// How long a caller waits for the tracker to answer.
    pub ask_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            query_delay: Duration::from_secs(1),
            batch_size: BatchSize::default(),
            max_attempts: MaxAttempts::default(),
            max_gap_age: Duration::from_secs(60),
            ask_timeout: Duration::from_secs(1),
        }
    }
}

impl TrackerConfig {
    /// Sets the poll interval.
    #[must_use]
    pub const fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    /// Sets the scan page size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: BatchSize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the attempt threshold for gap abandonment.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: MaxAttempts) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the age threshold for gap abandonment.
    #[must_use]
    pub const fn with_max_gap_age(mut self, age: Duration) -> Self {
        self.max_gap_age = age;
        self
    }

    /// Abandons gaps after `window`, with the attempt limit matched to the
    /// current `query_delay` so neither threshold fires early.
    #[must_use]
    pub fn with_gap_window(mut self, window: Duration) -> Self {
        let delay_ms = self.query_delay.as_millis().max(1);
        let attempts = u32::try_from(window.as_millis() / delay_ms).unwrap_or(u32::MAX);
        if let Ok(max_attempts) = MaxAttempts::try_new(attempts.max(1)) {
            self.max_attempts = max_attempts;
        }
        self.max_gap_age = window;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_ask_timeout(mut self, timeout: Duration) -> Self {
        self.ask_timeout = timeout;
        self
    }
}

/// Read-side settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadJournalConfig {
    /// Query settings.
    pub query: QueryConfig,
    /// Tracker settings.
    pub tracker: TrackerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_range_is_enforced() {
        assert!(BatchSize::try_new(0).is_err());
        assert!(BatchSize::try_new(10_001).is_err());
        assert_eq!(BatchSize::try_new(1).unwrap().into_inner(), 1);
        assert_eq!(BatchSize::default().into_inner(), 100);
    }

    #[test]
    fn max_attempts_must_be_positive() {
        assert!(MaxAttempts::try_new(0).is_err());
        assert_eq!(MaxAttempts::default().into_inner(), 60);
    }

    #[test]
    fn default_gap_thresholds_agree() {
        let tracker = TrackerConfig::default();
        let attempts_window = tracker.query_delay * tracker.max_attempts.into_inner();
        assert_eq!(attempts_window, tracker.max_gap_age);
    }

    #[test]
    fn gap_window_scales_attempts_with_query_delay() {
        let tracker = TrackerConfig::default()
            .with_query_delay(Duration::from_millis(250))
            .with_gap_window(Duration::from_secs(30));

        assert_eq!(tracker.max_gap_age, Duration::from_secs(30));
        assert_eq!(tracker.max_attempts.into_inner(), 120);

        let tiny = TrackerConfig::default().with_gap_window(Duration::from_millis(10));
        assert_eq!(tiny.max_attempts.into_inner(), 1);
    }

    #[test]
    fn shard_count_must_be_positive() {
        assert!(ShardCount::try_new(0).is_err());
        assert!(ShardCount::try_new(1).is_ok());
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: ReadJournalConfig =
            serde_json::from_str(r#"{"query":{"batch_size":25,"fail_fast":false}}"#).unwrap();

        assert_eq!(config.query.batch_size.into_inner(), 25);
        assert!(!config.query.fail_fast);
        assert_eq!(config.query.refresh_interval, Duration::from_secs(1));
        assert_eq!(config.tracker, TrackerConfig::default());
    }

    #[test]
    fn invalid_batch_size_fails_deserialization() {
        let result: Result<QueryConfig, _> = serde_json::from_str(r#"{"batch_size":0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn builders_override_fields() {
        let tracker = TrackerConfig::default()
            .with_query_delay(Duration::from_millis(20))
            .with_max_attempts(MaxAttempts::try_new(3).unwrap())
            .with_max_gap_age(Duration::from_secs(5));

        assert_eq!(tracker.query_delay, Duration::from_millis(20));
        assert_eq!(tracker.max_attempts.into_inner(), 3);
        assert_eq!(tracker.max_gap_age, Duration::from_secs(5));
    }
}
