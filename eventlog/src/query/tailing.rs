//! Incremental tag queries bounded by the consistency tracker.
//!
//! A tailing query is a lazily driven loop of cycles. Each cycle reads the
//! tracker's `max_ordering`, fetches at most one batch of tagged rows between
//! the cursor and that bound, and lets [`next_step`] decide what happens
//! next. The stream is suspended only while awaiting the backend, the
//! tracker or the refresh delay. Dropping it stops all further cycles.

use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, warn};

use super::flow::{advance_cursor, next_step, FlowControl};
use crate::dao::JournalDao;
use crate::errors::{JournalError, JournalResult};
use crate::row::Decoded;
use crate::tracker::TrackerHandle;
use crate::types::{OrderingNr, Tag};

/// Upper bound of a tailing query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Bound {
    /// Never stops.
    Live,
    /// Stops at the journal's max ordering, resolved on the first poll.
    Current(Option<OrderingNr>),
}

struct Tail<E> {
    dao: JournalDao<E>,
    tracker: TrackerHandle,
    tag: Tag,
    from: OrderingNr,
    bound: Bound,
    batch_size: usize,
    refresh_interval: Duration,
    last_step: FlowControl,
}

impl<E> Tail<E>
where
    E: Send + Sync + 'static,
{
    async fn target(&mut self) -> JournalResult<Option<OrderingNr>> {
        match self.bound {
            Bound::Live => Ok(None),
            Bound::Current(Some(target)) => Ok(Some(target)),
            Bound::Current(None) => {
                let target = self.dao.max_journal_sequence().await?;
                debug!(tag = %self.tag, %target, "current tag query bounded");
                self.bound = Bound::Current(Some(target));
                Ok(Some(target))
            }
        }
    }

    /// Runs one cycle. `Ok(None)` means the cycle was skipped and should be
    /// retried after the refresh interval.
    async fn cycle(&mut self) -> JournalResult<Option<Vec<Decoded<E>>>> {
        let target = self.target().await?;

        let max_ordering = match self.tracker.max_ordering().await {
            Ok(max_ordering) => max_ordering,
            Err(error @ JournalError::TrackerTimeout(_)) => {
                warn!(tag = %self.tag, %error, "tracker did not answer; skipping query cycle");
                self.last_step = FlowControl::ContinueDelayed;
                return Ok(None);
            }
            Err(error) => return Err(error),
        };

        let page: Vec<Decoded<E>> = self
            .dao
            .events_by_tag(self.tag.clone(), self.from, max_ordering, self.batch_size)
            .try_collect()
            .await?;

        let offsets: Vec<OrderingNr> = page.iter().map(Decoded::ordering).collect();
        self.last_step = next_step(target, self.batch_size, max_ordering, &offsets);
        self.from = advance_cursor(self.from, max_ordering, &offsets);

        let delivered = match target {
            Some(target) => page
                .into_iter()
                .filter(|decoded| decoded.ordering() <= target)
                .collect(),
            None => page,
        };
        Ok(Some(delivered))
    }
}

/// Tagged rows after `from`, in ordering order, never past the tracker's
/// safe boundary.
pub(crate) fn tail_by_tag<E>(
    dao: JournalDao<E>,
    tracker: TrackerHandle,
    tag: Tag,
    from: OrderingNr,
    bound: Bound,
    batch_size: usize,
    refresh_interval: Duration,
) -> BoxStream<'static, JournalResult<Decoded<E>>>
where
    E: Send + Sync + 'static,
{
    let tail = Tail {
        dao,
        tracker,
        tag,
        from,
        bound,
        batch_size: batch_size.max(1),
        refresh_interval,
        last_step: FlowControl::Continue,
    };

    stream::unfold(Some(tail), |state| async move {
        let mut tail = state?;
        if tail.last_step == FlowControl::ContinueDelayed {
            tokio::time::sleep(tail.refresh_interval).await;
        }

        match tail.cycle().await {
            Ok(None) => Some((Vec::new(), Some(tail))),
            Ok(Some(rows)) => {
                let rows: Vec<_> = rows.into_iter().map(Ok).collect();
                if tail.last_step == FlowControl::Stop {
                    debug!(tag = %tail.tag, cursor = %tail.from, "tag query complete");
                    Some((rows, None))
                } else {
                    Some((rows, Some(tail)))
                }
            }
            Err(error) => Some((vec![Err(error)], None)),
        }
    })
    .flat_map(stream::iter)
    .boxed()
}
