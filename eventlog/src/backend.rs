//! Storage collaborator contract.
//!
//! The journal layers ordering and consistency guarantees on top of an
//! eventually-consistent key-value store. This trait is the port such a store
//! must implement. It is deliberately small: atomic batch put, conditional
//! update, paginated range queries by stream and by tag, a max-ordering probe,
//! an ordering scan for gap detection and a distinct-stream listing.
//!
//! Reads may lag writes. In particular a row with a higher ordering may become
//! visible before a row with a lower one. The
//! [`SequenceConsistencyTracker`](crate::tracker::SequenceConsistencyTracker)
//! exists to repair exactly that.

use async_trait::async_trait;

use crate::errors::BackendResult;
use crate::row::JournalRow;
use crate::types::{OrderingNr, PersistenceId, SequenceNr, Tag};

/// One page of a single stream, `from..=to` by sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRange {
    /// Stream to read.
    pub persistence_id: PersistenceId,
    /// Lowest sequence number to return (inclusive).
    pub from: SequenceNr,
    /// Highest sequence number to return (inclusive).
    pub to: SequenceNr,
    /// Page size.
    pub limit: usize,
    /// Whether tombstoned rows are returned.
    pub include_deleted: bool,
}

/// One page of the tag index, `after < ordering <= to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRange {
    /// Tag to read.
    pub tag: Tag,
    /// Exclusive lower bound.
    pub after: OrderingNr,
    /// Inclusive upper bound.
    pub to: OrderingNr,
    /// Page size.
    pub limit: usize,
}

/// An eventually-consistent key-value store holding journal rows.
#[async_trait]
pub trait JournalBackend: Send + Sync + 'static {
    /// Reserves `count` consecutive global ordering values and returns the
    /// first one. Values are never handed out twice.
    async fn allocate_orderings(&self, count: u64) -> BackendResult<OrderingNr>;

    /// Stores every row or none of them.
    ///
    /// Fails with [`BackendError::ConditionFailed`] if any row's primary key
    /// already exists.
    ///
    /// [`BackendError::ConditionFailed`]: crate::errors::BackendError::ConditionFailed
    async fn put_batch(&self, rows: Vec<JournalRow>) -> BackendResult<()>;

    /// Replaces the message of an existing row, keeping its ordering.
    ///
    /// Fails with [`BackendError::RowNotFound`] if the row does not exist.
    ///
    /// [`BackendError::RowNotFound`]: crate::errors::BackendError::RowNotFound
    async fn update_message(
        &self,
        persistence_id: &PersistenceId,
        sequence_nr: SequenceNr,
        message: Vec<u8>,
    ) -> BackendResult<()>;

    /// Tombstones every row of the stream up to and including `to`.
    ///
    /// Returns how many rows changed state; rows already tombstoned are not
    /// counted.
    async fn mark_deleted(&self, persistence_id: &PersistenceId, to: SequenceNr)
        -> BackendResult<u64>;

    /// Visible rows of one stream, ascending by sequence number.
    async fn query_by_persistence_id(&self, range: &StreamRange) -> BackendResult<Vec<JournalRow>>;

    /// Visible, non-deleted rows carrying a tag, ascending by ordering.
    async fn query_by_tag(&self, range: &TagRange) -> BackendResult<Vec<JournalRow>>;

    /// Highest ordering value currently visible, or zero for an empty store.
    async fn max_ordering(&self) -> BackendResult<OrderingNr>;

    /// Visible ordering values with `after < ordering <= to`, ascending,
    /// tombstoned rows included.
    async fn scan_orderings(
        &self,
        after: OrderingNr,
        to: OrderingNr,
        limit: usize,
    ) -> BackendResult<Vec<OrderingNr>>;

    /// Distinct persistence ids greater than `after`, ascending.
    async fn list_persistence_ids(
        &self,
        after: Option<&PersistenceId>,
        limit: usize,
    ) -> BackendResult<Vec<PersistenceId>>;
}
