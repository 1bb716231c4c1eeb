use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tracing::{instrument, trace};

use super::JournalDao;
use crate::backend::{StreamRange, TagRange};
use crate::errors::{JournalError, JournalResult, Operation};
use crate::row::Decoded;
use crate::types::{OrderingNr, PersistenceId, SequenceNr, Tag};

/// Parameters of a replay over a single stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRequest {
    /// Stream to replay.
    pub persistence_id: PersistenceId,
    /// First sequence number to deliver (inclusive).
    pub from: SequenceNr,
    /// Last sequence number to deliver (inclusive).
    pub to: SequenceNr,
    /// Upper bound on the number of rows delivered.
    pub max: u64,
    /// Rows fetched per backend call.
    pub batch_size: usize,
    /// When set, the replay never ends: once caught up it waits this long
    /// and polls again from the last delivered sequence number.
    pub refresh_interval: Option<Duration>,
    /// Whether tombstoned rows are delivered.
    pub include_deleted: bool,
}

impl ReplayRequest {
    /// A finite replay of `from..=to` without tombstoned rows.
    pub const fn new(
        persistence_id: PersistenceId,
        from: SequenceNr,
        to: SequenceNr,
        batch_size: usize,
    ) -> Self {
        Self {
            persistence_id,
            from,
            to,
            max: u64::MAX,
            batch_size,
            refresh_interval: None,
            include_deleted: false,
        }
    }

    /// Caps the number of delivered rows.
    #[must_use]
    pub const fn with_max(mut self, max: u64) -> Self {
        self.max = max;
        self
    }

    /// Turns the replay into a live one.
    #[must_use]
    pub const fn live(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = Some(refresh_interval);
        self
    }

    /// Delivers tombstoned rows too.
    #[must_use]
    pub const fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

struct ReplayCursor<E> {
    dao: JournalDao<E>,
    request: ReplayRequest,
    next: SequenceNr,
    remaining: u64,
    delay_next: bool,
}

impl<E> ReplayCursor<E> {
    fn range(&self) -> StreamRange {
        let page = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        StreamRange {
            persistence_id: self.request.persistence_id.clone(),
            from: self.next,
            to: self.request.to,
            limit: self.request.batch_size.min(page).max(1),
            include_deleted: self.request.include_deleted,
        }
    }

    const fn finished(&self) -> bool {
        self.remaining == 0 || self.next.value() > self.request.to.value()
    }
}

struct TagCursor<E> {
    dao: JournalDao<E>,
    tag: Tag,
    after: OrderingNr,
    to: OrderingNr,
    remaining: usize,
}

struct IdCursor<E> {
    dao: JournalDao<E>,
    after: Option<PersistenceId>,
    remaining: u64,
}

impl<E> JournalDao<E>
where
    E: Send + Sync + 'static,
{
    /// Finite replay of `from..=to`, delivering at most `max` rows.
    pub fn messages(
        &self,
        persistence_id: PersistenceId,
        from: SequenceNr,
        to: SequenceNr,
        max: u64,
    ) -> BoxStream<'static, JournalResult<Decoded<E>>> {
        let batch_size = self.config.replay_batch_size.into_inner();
        self.replay(ReplayRequest::new(persistence_id, from, to, batch_size).with_max(max))
    }

    /// Replay of `from..=to` in pages of `batch_size`, live when
    /// `refresh_interval` is set.
    pub fn messages_with_batch(
        &self,
        persistence_id: PersistenceId,
        from: SequenceNr,
        to: SequenceNr,
        batch_size: usize,
        refresh_interval: Option<Duration>,
    ) -> BoxStream<'static, JournalResult<Decoded<E>>> {
        let mut request = ReplayRequest::new(persistence_id, from, to, batch_size);
        request.refresh_interval = refresh_interval;
        self.replay(request)
    }

    /// Lazily replays one stream in sequence number order.
    ///
    /// Nothing is fetched until the stream is polled and each page is fetched
    /// only once the previous one has been consumed. A backend failure is
    /// yielded as the last item. Per-row decode failures are carried inside
    /// [`Decoded::result`].
    pub fn replay(&self, request: ReplayRequest) -> BoxStream<'static, JournalResult<Decoded<E>>> {
        let cursor = ReplayCursor {
            dao: self.clone(),
            next: request.from,
            remaining: request.max,
            delay_next: false,
            request,
        };

        stream::unfold(Some(cursor), |state| async move {
            let mut cursor = state?;
            loop {
                if cursor.finished() {
                    return None;
                }
                if std::mem::take(&mut cursor.delay_next) {
                    if let Some(interval) = cursor.request.refresh_interval {
                        tokio::time::sleep(interval).await;
                    }
                }

                let range = cursor.range();
                let rows = match cursor.dao.backend.query_by_persistence_id(&range).await {
                    Ok(rows) => rows,
                    Err(error) => {
                        let error = JournalError::backend(Operation::QueryByPersistenceId, error);
                        return Some((vec![Err(error)], None));
                    }
                };

                let Some(last) = rows.last() else {
                    if cursor.request.refresh_interval.is_some() {
                        cursor.delay_next = true;
                        continue;
                    }
                    return None;
                };

                let exhausted = rows.len() < range.limit;
                if last.sequence_nr == SequenceNr::MAX {
                    cursor.remaining = 0;
                } else {
                    cursor.next = last.sequence_nr.next();
                    cursor.remaining = cursor.remaining.saturating_sub(rows.len() as u64);
                }
                trace!(
                    persistence_id = %cursor.request.persistence_id,
                    rows = rows.len(),
                    next = %cursor.next,
                    "replay page fetched"
                );

                let page: Vec<_> = rows.into_iter().map(|row| Ok(cursor.dao.decode(row))).collect();
                if exhausted {
                    if cursor.request.refresh_interval.is_none() {
                        return Some((page, None));
                    }
                    cursor.delay_next = true;
                }
                return Some((page, Some(cursor)));
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }

    /// Rows carrying `tag` with `from < ordering <= to`, ascending by
    /// ordering, at most `max` of them.
    ///
    /// An empty range (`from >= to`) or `max == 0` yields an empty stream
    /// without calling the backend.
    pub fn events_by_tag(
        &self,
        tag: Tag,
        from: OrderingNr,
        to: OrderingNr,
        max: usize,
    ) -> BoxStream<'static, JournalResult<Decoded<E>>> {
        if from >= to || max == 0 {
            return stream::empty().boxed();
        }

        let cursor = TagCursor {
            dao: self.clone(),
            tag,
            after: from,
            to,
            remaining: max,
        };

        stream::unfold(Some(cursor), |state| async move {
            let mut cursor = state?;
            if cursor.remaining == 0 || cursor.after >= cursor.to {
                return None;
            }

            let range = TagRange {
                tag: cursor.tag.clone(),
                after: cursor.after,
                to: cursor.to,
                limit: cursor.remaining,
            };
            let rows = match cursor.dao.backend.query_by_tag(&range).await {
                Ok(rows) => rows,
                Err(error) => {
                    let error = JournalError::backend(Operation::QueryByTag, error);
                    return Some((vec![Err(error)], None));
                }
            };

            let last = rows.last()?.ordering;
            let exhausted = rows.len() < range.limit;
            cursor.after = last;
            cursor.remaining = cursor.remaining.saturating_sub(rows.len());

            let page: Vec<_> = rows.into_iter().map(|row| Ok(cursor.dao.decode(row))).collect();
            Some((page, (!exhausted).then_some(cursor)))
        })
        .flat_map(stream::iter)
        .boxed()
    }

    /// Highest ordering value currently visible in the backend.
    #[instrument(skip(self))]
    pub async fn max_journal_sequence(&self) -> JournalResult<OrderingNr> {
        self.backend
            .max_ordering()
            .await
            .map_err(JournalError::during(Operation::MaxOrdering))
    }

    /// Distinct persistence ids, ascending, at most `max` of them.
    pub fn all_persistence_ids(&self, max: u64) -> BoxStream<'static, JournalResult<PersistenceId>> {
        let cursor = IdCursor {
            dao: self.clone(),
            after: None,
            remaining: max,
        };

        stream::unfold(Some(cursor), |state| async move {
            let mut cursor = state?;
            if cursor.remaining == 0 {
                return None;
            }

            let batch = cursor.dao.config.replay_batch_size.into_inner();
            let limit = usize::try_from(cursor.remaining).map_or(batch, |left| left.min(batch));
            let ids = match cursor
                .dao
                .backend
                .list_persistence_ids(cursor.after.as_ref(), limit)
                .await
            {
                Ok(ids) => ids,
                Err(error) => {
                    let error = JournalError::backend(Operation::ListPersistenceIds, error);
                    return Some((vec![Err(error)], None));
                }
            };

            let last = ids.last()?.clone();
            let exhausted = ids.len() < limit;
            cursor.after = Some(last);
            cursor.remaining = cursor.remaining.saturating_sub(ids.len() as u64);

            let page: Vec<_> = ids.into_iter().map(Ok).collect();
            Some((page, (!exhausted).then_some(cursor)))
        })
        .flat_map(stream::iter)
        .boxed()
    }
}
