//! Ordered, append-only event journal over an eventually-consistent
//! key-value store.
//!
//! The journal gives event-sourced applications:
//!
//! - per-stream sequencing by [`PersistenceId`] and [`SequenceNr`]
//! - a global [`OrderingNr`] assigned across all streams at write time
//! - tag-indexed cross-stream queries
//! - bounded ("current") and live-tailing read modes
//!
//! Storage is abstracted behind [`JournalBackend`]. Because the store may make
//! a row with a higher ordering visible before a lower one, tag queries are
//! bounded by a background [`SequenceConsistencyTracker`] that computes the
//! highest ordering value with no gaps below it.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use eventlog::{
//!     AtomicWrite, JournalConfig, JournalDao, JsonSerializer, Offset, ReadJournal,
//!     ReadJournalConfig,
//! };
//!
//! let serializer = Arc::new(JsonSerializer::<MyEvent>::new());
//! let dao = JournalDao::new(backend, serializer, JournalConfig::default());
//! dao.put_messages(AtomicWrite::from(event)).await?;
//!
//! let journal = ReadJournal::start(dao, ReadJournalConfig::default());
//! let mut tagged = journal.current_events_by_tag(tag, Offset::BEGINNING);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod dao;
pub mod errors;
pub mod keys;
pub mod query;
pub mod row;
pub mod serialization;
pub mod tracker;
pub mod types;

pub use backend::{JournalBackend, StreamRange, TagRange};
pub use config::{
    BatchSize, JournalConfig, MaxAttempts, QueryConfig, ReadJournalConfig, ShardCount,
    TrackerConfig,
};
pub use dao::{JournalDao, ReplayRequest};
pub use errors::{
    BackendError, BackendResult, JournalError, JournalResult, Operation, SerializationError,
};
pub use keys::{KeyResolver, KeyStrategy, RowKey};
pub use query::{Envelope, FlowControl, ReadJournal};
pub use row::{AtomicWrite, Decoded, JournalRow, PersistentRepr};
pub use serialization::{JournalSerializer, JsonSerializer};
pub use tracker::{SequenceConsistencyTracker, TrackerHandle, TrackerSnapshot};
pub use types::{Offset, OrderingNr, PersistenceId, SequenceNr, Tag, Timestamp};
