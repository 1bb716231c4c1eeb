//! Core types for the event journal.
//!
//! Identifiers that carry validation rules use smart constructors so that an
//! invalid persistence id or tag can never reach the storage layer. Counters
//! (sequence numbers, ordering values) are plain newtypes with `const`
//! constructors because every `u64` is a valid counter value.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Identifier of a single event stream.
///
/// `PersistenceId` values are guaranteed to be non-empty and at most 255
/// characters after trimming.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct PersistenceId(String);

/// Label attached to an event for cross-stream queries.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Tag(String);

/// Position of an event within its own stream.
///
/// Sequence numbers start at 1 for the first event of a stream. Zero is used
/// as "before the first event" in range arguments.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceNr(u64);

impl SequenceNr {
    /// The position before the first event of any stream.
    pub const ZERO: Self = Self(0);

    /// The largest representable sequence number, used as an open upper bound.
    pub const MAX: Self = Self(u64::MAX);

    /// Wraps a raw sequence number.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the following sequence number, saturating at [`SequenceNr::MAX`].
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for SequenceNr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for SequenceNr {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Global ordering value assigned to every row at write time.
///
/// Ordering values are unique across all streams and allocated in
/// non-decreasing order. Zero never identifies a row.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OrderingNr(u64);

impl OrderingNr {
    /// The ordering value before the first row.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw ordering value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the following ordering value.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the preceding ordering value, saturating at zero.
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Returns the ordering value `count` positions after this one.
    #[must_use]
    pub const fn advance(self, count: u64) -> Self {
        Self(self.0.saturating_add(count))
    }
}

impl std::fmt::Display for OrderingNr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for OrderingNr {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Query cursor over the global ordering.
///
/// An offset is exclusive: a query started at offset `n` yields rows whose
/// ordering is strictly greater than `n`. [`Offset::BEGINNING`] starts from the
/// first row.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Offset(OrderingNr);

impl Offset {
    /// Cursor positioned before the first row.
    pub const BEGINNING: Self = Self(OrderingNr::ZERO);

    /// Creates an offset from a raw ordering value.
    pub const fn new(value: u64) -> Self {
        Self(OrderingNr::new(value))
    }

    /// Returns the ordering value this offset points at.
    pub const fn ordering(self) -> OrderingNr {
        self.0
    }
}

impl From<OrderingNr> for Offset {
    fn from(ordering: OrderingNr) -> Self {
        Self(ordering)
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A timestamp for when an event was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
