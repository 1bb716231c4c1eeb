use tracing::{debug, instrument, warn};

use super::JournalDao;
use crate::backend::StreamRange;
use crate::errors::{BackendError, JournalError, JournalResult, Operation};
use crate::row::{AtomicWrite, JournalRow, PersistentRepr};
use crate::types::{OrderingNr, PersistenceId, SequenceNr};

impl<E> JournalDao<E>
where
    E: Send + Sync + 'static,
{
    /// Persists one write group as a single atomic batch.
    ///
    /// Ordering values are allocated as one contiguous block and assigned in
    /// `(persistence_id, sequence_nr)` order. Any backend failure fails the
    /// whole batch; nothing is partially committed and the caller retries the
    /// entire group.
    #[instrument(skip(self, write), fields(rows = write.len()))]
    pub async fn put_messages(&self, write: AtomicWrite<E>) -> JournalResult<Vec<JournalRow>> {
        write.validate(self.config.write_batch_limit.into_inner())?;
        let _in_flight = self.in_flight.begin(write.persistence_ids());

        let encoded = self.encode(write)?;
        let count = encoded.len() as u64;

        let first = self
            .backend
            .allocate_orderings(count)
            .await
            .map_err(JournalError::during(Operation::AllocateOrderings))?;

        let rows: Vec<JournalRow> = encoded
            .into_iter()
            .zip(0u64..)
            .map(|(mut row, index)| {
                row.ordering = first.advance(index);
                row
            })
            .collect();

        if let Err(error) = self.backend.put_batch(rows.clone()).await {
            warn!(%error, "write batch rejected");
            return Err(JournalError::backend(Operation::PutBatch, error));
        }

        debug!(first_ordering = %first, count, "write batch persisted");
        Ok(rows)
    }

    /// Persists several write groups, each as its own atomic batch.
    ///
    /// Groups are written one after another so their ordering blocks are
    /// ascending in input order. One result is returned per group.
    pub async fn put_all(&self, writes: Vec<AtomicWrite<E>>) -> Vec<JournalResult<Vec<JournalRow>>> {
        let mut results = Vec::with_capacity(writes.len());
        for write in writes {
            results.push(self.put_messages(write).await);
        }
        results
    }

    /// Tombstones every row of `persistence_id` with a sequence number up to
    /// and including `to`. Returns the number of newly tombstoned rows.
    ///
    /// Repeating the call is harmless and never renumbers anything.
    #[instrument(skip(self))]
    pub async fn delete_messages(
        &self,
        persistence_id: &PersistenceId,
        to: SequenceNr,
    ) -> JournalResult<u64> {
        let deleted = self
            .backend
            .mark_deleted(persistence_id, to)
            .await
            .map_err(JournalError::during(Operation::MarkDeleted))?;
        debug!(deleted, "rows tombstoned");
        Ok(deleted)
    }

    /// Highest sequence number stored for `persistence_id` at or above
    /// `from`, or zero if there is none.
    ///
    /// Tombstoned rows count, so sequence numbers never restart after a
    /// delete. A write to the same stream that is still in flight is awaited
    /// first so its outcome is always observed.
    #[instrument(skip(self))]
    pub async fn highest_sequence_nr(
        &self,
        persistence_id: &PersistenceId,
        from: SequenceNr,
    ) -> JournalResult<SequenceNr> {
        self.in_flight.wait_for(persistence_id).await;

        let limit = self.config.replay_batch_size.into_inner();
        let mut highest = SequenceNr::ZERO;
        let mut next = from;

        loop {
            let range = StreamRange {
                persistence_id: persistence_id.clone(),
                from: next,
                to: SequenceNr::MAX,
                limit,
                include_deleted: true,
            };
            let rows = self
                .backend
                .query_by_persistence_id(&range)
                .await
                .map_err(JournalError::during(Operation::QueryByPersistenceId))?;

            let Some(last) = rows.last() else {
                break;
            };
            highest = highest.max(last.sequence_nr);
            if rows.len() < limit || highest == SequenceNr::MAX {
                break;
            }
            next = highest.next();
        }

        Ok(highest)
    }

    /// Replaces the stored message of an existing event in place.
    ///
    /// The row keeps its ordering and sequence number. Fails with
    /// [`JournalError::RowNotFound`] if the event was never written.
    #[instrument(
        skip(self, event),
        fields(persistence_id = %event.persistence_id, sequence_nr = %event.sequence_nr)
    )]
    pub async fn update_message(&self, event: PersistentRepr<E>) -> JournalResult<()> {
        let message = self.serializer.serialize(&event)?;

        self.backend
            .update_message(&event.persistence_id, event.sequence_nr, message)
            .await
            .map_err(|error| match error {
                BackendError::RowNotFound {
                    persistence_id,
                    sequence_nr,
                } => JournalError::RowNotFound {
                    persistence_id,
                    sequence_nr,
                },
                other => JournalError::backend(Operation::UpdateMessage, other),
            })
    }

    fn encode(&self, write: AtomicWrite<E>) -> JournalResult<Vec<JournalRow>> {
        write
            .into_sorted_events()
            .into_iter()
            .map(|mut event| {
                event.writer_uuid.get_or_insert(self.writer_uuid);
                let message = self.serializer.serialize(&event)?;
                Ok(JournalRow {
                    persistence_id: event.persistence_id,
                    sequence_nr: event.sequence_nr,
                    deleted: false,
                    message,
                    ordering: OrderingNr::ZERO,
                    tags: event.tags,
                })
            })
            .collect()
    }
}
