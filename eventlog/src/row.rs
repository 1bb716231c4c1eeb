//! Journal rows and the domain-side event representation.
//!
//! A [`JournalRow`] is what the backend stores. A [`PersistentRepr`] is what
//! callers write and what queries hand back once the row's message has been
//! decoded.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{JournalError, JournalResult, SerializationError};
use crate::types::{OrderingNr, PersistenceId, SequenceNr, Tag, Timestamp};

/// A single stored event.
///
/// `(persistence_id, sequence_nr)` is unique and `ordering` is globally
/// unique. Rows are never physically removed by normal operation: deletion
/// sets the `deleted` tombstone and an update replaces `message` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRow {
    /// The stream this row belongs to.
    pub persistence_id: PersistenceId,
    /// Position within the stream, starting at 1.
    pub sequence_nr: SequenceNr,
    /// Tombstone flag.
    pub deleted: bool,
    /// Serialized event, owned by the serializer.
    pub message: Vec<u8>,
    /// Global ordering assigned at write time.
    pub ordering: OrderingNr,
    /// Tags indexed for cross-stream queries.
    pub tags: BTreeSet<Tag>,
}

impl JournalRow {
    /// Returns `true` if the row carries `tag`.
    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }
}

/// An event as seen by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentRepr<E> {
    /// The stream the event belongs to.
    pub persistence_id: PersistenceId,
    /// Position within the stream.
    pub sequence_nr: SequenceNr,
    /// The domain event.
    pub payload: E,
    /// Tags to index the event under.
    pub tags: BTreeSet<Tag>,
    /// Wall-clock time the event was created.
    pub timestamp: Timestamp,
    /// Identity of the journal instance that wrote the event.
    pub writer_uuid: Option<Uuid>,
    /// Whether the row has been tombstoned.
    pub deleted: bool,
}

impl<E> PersistentRepr<E> {
    /// Creates an untagged event stamped with the current time.
    pub fn new(persistence_id: PersistenceId, sequence_nr: SequenceNr, payload: E) -> Self {
        Self {
            persistence_id,
            sequence_nr,
            payload,
            tags: BTreeSet::new(),
            timestamp: Timestamp::now(),
            writer_uuid: None,
            deleted: false,
        }
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.insert(tag);
        self
    }

    /// Replaces the tag set.
    #[must_use]
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    /// Overrides the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// One caller-side write group, persisted all-or-nothing.
#[derive(Debug, Clone)]
pub struct AtomicWrite<E> {
    events: Vec<PersistentRepr<E>>,
}

impl<E> AtomicWrite<E> {
    /// Creates a write group from its events.
    pub const fn new(events: Vec<PersistentRepr<E>>) -> Self {
        Self { events }
    }

    /// Number of events in the group.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if the group holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Distinct streams touched by this group.
    pub fn persistence_ids(&self) -> Vec<PersistenceId> {
        let ids: BTreeSet<&PersistenceId> = self.events.iter().map(|e| &e.persistence_id).collect();
        ids.into_iter().cloned().collect()
    }

    /// Checks the group can be sent to the backend as a single batch.
    pub fn validate(&self, limit: usize) -> JournalResult<()> {
        if self.events.is_empty() {
            return Err(JournalError::InvalidBatch("batch is empty".to_string()));
        }
        if self.events.len() > limit {
            return Err(JournalError::InvalidBatch(format!(
                "batch of {} rows exceeds limit of {limit}",
                self.events.len()
            )));
        }

        let mut seen = HashSet::with_capacity(self.events.len());
        for event in &self.events {
            if event.sequence_nr == SequenceNr::ZERO {
                return Err(JournalError::InvalidBatch(format!(
                    "sequence numbers start at 1 ({})",
                    event.persistence_id
                )));
            }
            if !seen.insert((&event.persistence_id, event.sequence_nr)) {
                return Err(JournalError::DuplicateRow {
                    persistence_id: event.persistence_id.clone(),
                    sequence_nr: event.sequence_nr,
                });
            }
        }
        Ok(())
    }

    /// Consumes the group, returning its events sorted by stream and sequence.
    pub fn into_sorted_events(self) -> Vec<PersistentRepr<E>> {
        let mut events = self.events;
        events.sort_by(|a, b| {
            (&a.persistence_id, a.sequence_nr).cmp(&(&b.persistence_id, b.sequence_nr))
        });
        events
    }
}

impl<E> From<PersistentRepr<E>> for AtomicWrite<E> {
    fn from(event: PersistentRepr<E>) -> Self {
        Self::new(vec![event])
    }
}

/// A stored row together with the outcome of decoding its message.
///
/// Decode failures stay attached to their row instead of failing the read
/// that produced them.
#[derive(Debug, Clone)]
pub struct Decoded<E> {
    /// The raw row.
    pub row: JournalRow,
    /// The decoded event, or why decoding failed.
    pub result: Result<PersistentRepr<E>, SerializationError>,
}

impl<E> Decoded<E> {
    /// Global ordering of the underlying row.
    pub const fn ordering(&self) -> OrderingNr {
        self.row.ordering
    }

    /// Sequence number of the underlying row.
    pub const fn sequence_nr(&self) -> SequenceNr {
        self.row.sequence_nr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(value: &str) -> PersistenceId {
        PersistenceId::try_new(value).unwrap()
    }

    fn event(id: &str, seq: u64) -> PersistentRepr<&'static str> {
        PersistentRepr::new(pid(id), SequenceNr::new(seq), "payload")
    }

    #[test]
    fn empty_batch_is_rejected() {
        let write: AtomicWrite<&str> = AtomicWrite::new(vec![]);
        assert!(matches!(
            write.validate(10),
            Err(JournalError::InvalidBatch(_))
        ));
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let write = AtomicWrite::new(vec![event("p1", 1), event("p1", 2), event("p1", 3)]);
        assert!(write.validate(2).is_err());
        assert!(write.validate(3).is_ok());
    }

    #[test]
    fn duplicate_rows_in_batch_are_rejected() {
        let write = AtomicWrite::new(vec![event("p1", 1), event("p2", 1), event("p1", 1)]);
        let error = write.validate(10).unwrap_err();
        assert!(matches!(
            error,
            JournalError::DuplicateRow { sequence_nr, .. } if sequence_nr == SequenceNr::new(1)
        ));
    }

    #[test]
    fn sequence_zero_is_rejected() {
        let write = AtomicWrite::from(event("p1", 0));
        assert!(write.validate(10).is_err());
    }

    #[test]
    fn events_are_sorted_by_stream_then_sequence() {
        let write = AtomicWrite::new(vec![event("p2", 1), event("p1", 2), event("p1", 1)]);
        assert_eq!(write.persistence_ids(), vec![pid("p1"), pid("p2")]);

        let sorted: Vec<_> = write
            .into_sorted_events()
            .into_iter()
            .map(|e| (e.persistence_id.to_string(), e.sequence_nr.value()))
            .collect();
        assert_eq!(
            sorted,
            vec![
                ("p1".to_string(), 1),
                ("p1".to_string(), 2),
                ("p2".to_string(), 1)
            ]
        );
    }

    #[test]
    fn with_tags_replaces_existing_tags() {
        let blue = Tag::try_new("blue").unwrap();
        let red = Tag::try_new("red").unwrap();
        let repr = event("p1", 1)
            .with_tag(blue.clone())
            .with_tags([red.clone()]);
        assert_eq!(repr.tags, BTreeSet::from([red]));
        assert!(!repr.tags.contains(&blue));
    }
}
