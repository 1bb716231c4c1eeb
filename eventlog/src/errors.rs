//! Error types for the event journal.
//!
//! Errors are layered the same way the crate is:
//!
//! - **BackendError**: failures reported by the storage collaborator
//! - **SerializationError**: payload encoding failures, always tied to one row
//! - **JournalError**: everything surfaced by the DAO, tracker and query API
//!
//! A backend failure during a write fails the whole batch. The caller never
//! observes a partial commit and must retry the entire batch.

use std::time::Duration;

use thiserror::Error;

use crate::types::{PersistenceId, SequenceNr};

/// Backend operation that failed, used to give errors context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Reserving a block of global ordering values.
    AllocateOrderings,
    /// Persisting an atomic batch of rows.
    PutBatch,
    /// Replacing the message of an existing row.
    UpdateMessage,
    /// Tombstoning rows of a stream.
    MarkDeleted,
    /// Range query over a single stream.
    QueryByPersistenceId,
    /// Range query over the tag index.
    QueryByTag,
    /// Probing the highest visible ordering value.
    MaxOrdering,
    /// Scanning ordering values for gap detection.
    ScanOrderings,
    /// Listing distinct persistence ids.
    ListPersistenceIds,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AllocateOrderings => "allocate_orderings",
            Self::PutBatch => "put_batch",
            Self::UpdateMessage => "update_message",
            Self::MarkDeleted => "mark_deleted",
            Self::QueryByPersistenceId => "query_by_persistence_id",
            Self::QueryByTag => "query_by_tag",
            Self::MaxOrdering => "max_ordering",
            Self::ScanOrderings => "scan_orderings",
            Self::ListPersistenceIds => "list_persistence_ids",
        };
        f.write_str(name)
    }
}

/// Failures reported by a [`JournalBackend`](crate::backend::JournalBackend).
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The store could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time.
    #[error("backend operation timed out after {0:?}")]
    Timeout(Duration),

    /// A conditional write was rejected, e.g. the primary key already exists.
    #[error("condition check failed: {0}")]
    ConditionFailed(String),

    /// The addressed row does not exist.
    #[error("row not found: {persistence_id}/{sequence_nr}")]
    RowNotFound {
        /// Stream of the missing row.
        persistence_id: PersistenceId,
        /// Sequence number of the missing row.
        sequence_nr: SequenceNr,
    },

    /// Any other failure inside the store.
    #[error("backend internal error: {0}")]
    Internal(String),
}

/// Failures of the serializer collaborator.
///
/// Each variant names the row it belongs to, so a failure on one row never
/// taints the rest of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationError {
    /// An event could not be encoded.
    #[error("failed to serialize event {persistence_id}/{sequence_nr}: {detail}")]
    Serialize {
        /// Stream of the event.
        persistence_id: PersistenceId,
        /// Sequence number of the event.
        sequence_nr: SequenceNr,
        /// Encoder message.
        detail: String,
    },

    /// A stored message could not be decoded.
    #[error("failed to deserialize row {persistence_id}/{sequence_nr}: {detail}")]
    Deserialize {
        /// Stream of the row.
        persistence_id: PersistenceId,
        /// Sequence number of the row.
        sequence_nr: SequenceNr,
        /// Decoder message.
        detail: String,
    },
}

/// Errors surfaced by the journal DAO, the consistency tracker and queries.
#[derive(Debug, Clone, Error)]
pub enum JournalError {
    /// The backend failed while performing `operation`.
    #[error("{operation} failed: {source}")]
    Backend {
        /// The operation that failed.
        operation: Operation,
        /// The backend failure.
        #[source]
        source: BackendError,
    },

    /// The same `(persistence_id, sequence_nr)` appears twice in one batch.
    #[error("duplicate row {persistence_id}/{sequence_nr} in write batch")]
    DuplicateRow {
        /// Stream of the duplicated row.
        persistence_id: PersistenceId,
        /// Duplicated sequence number.
        sequence_nr: SequenceNr,
    },

    /// An update addressed a row that does not exist.
    #[error("cannot update missing row {persistence_id}/{sequence_nr}")]
    RowNotFound {
        /// Stream of the missing row.
        persistence_id: PersistenceId,
        /// Sequence number of the missing row.
        sequence_nr: SequenceNr,
    },

    /// Payload encoding or decoding failed.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// A write batch was rejected before reaching the backend.
    #[error("invalid write batch: {0}")]
    InvalidBatch(String),

    /// The consistency tracker task is no longer running.
    #[error("sequence consistency tracker is unavailable")]
    TrackerUnavailable,

    /// The consistency tracker did not answer in time.
    #[error("sequence consistency tracker did not answer within {0:?}")]
    TrackerTimeout(Duration),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl JournalError {
    /// Wraps a backend failure with the operation that produced it.
    pub const fn backend(operation: Operation, source: BackendError) -> Self {
        Self::Backend { operation, source }
    }

    /// Returns a closure suitable for `map_err` that tags backend failures
    /// with `operation`.
    pub fn during(operation: Operation) -> impl FnOnce(BackendError) -> Self {
        move |source| Self::backend(operation, source)
    }

    /// Returns `true` for failures where retrying the same call may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Backend {
                source: BackendError::Unavailable(_) | BackendError::Timeout(_),
                ..
            } | Self::TrackerTimeout(_)
        )
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;
