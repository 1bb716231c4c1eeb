//! Query API.
//!
//! [`ReadJournal`] exposes the read side as streams of [`Envelope`]s. Each
//! query comes in a *current* flavour, which ends once it has delivered
//! everything visible when it started, and a live flavour, which polls
//! forever.
//!
//! Tag queries never read past the [`SequenceConsistencyTracker`]'s
//! `max_ordering`, so they deliver rows in ordering order without skipping a
//! row that was still becoming visible.

mod flow;
mod persistence_ids;
mod tailing;

use std::future;

use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ReadJournalConfig;
use crate::dao::JournalDao;
use crate::errors::JournalResult;
use crate::row::{Decoded, PersistentRepr};
use crate::tracker::{SequenceConsistencyTracker, TrackerHandle};
use crate::types::{Offset, PersistenceId, SequenceNr, Tag, Timestamp};

pub use flow::{advance_cursor, next_step, FlowControl};

use tailing::{tail_by_tag, Bound};

/// An event delivered by a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<E> {
    /// Global ordering of the row; resume a tag query from here.
    pub offset: Offset,
    /// The stream the event belongs to.
    pub persistence_id: PersistenceId,
    /// Position within the stream.
    pub sequence_nr: SequenceNr,
    /// The decoded event.
    pub payload: E,
    /// When the event was written.
    pub timestamp: Timestamp,
}

impl<E> Envelope<E> {
    fn from_repr(offset: Offset, repr: PersistentRepr<E>) -> Self {
        Self {
            offset,
            persistence_id: repr.persistence_id,
            sequence_nr: repr.sequence_nr,
            payload: repr.payload,
            timestamp: repr.timestamp,
        }
    }
}

/// Turns decoded rows into envelopes, applying the decode failure policy.
///
/// With `fail_fast` the first row that fails to decode is yielded as an error
/// and ends the stream. Otherwise it is logged and skipped. A backend error
/// always ends the stream.
fn into_envelopes<E>(
    rows: BoxStream<'static, JournalResult<Decoded<E>>>,
    fail_fast: bool,
) -> BoxStream<'static, JournalResult<Envelope<E>>>
where
    E: Send + 'static,
{
    rows.scan(false, move |ended, item| {
        if *ended {
            return future::ready(None);
        }
        let next = match item {
            Ok(Decoded { row, result }) => match result {
                Ok(repr) => Some(Ok(Envelope::from_repr(Offset::from(row.ordering), repr))),
                Err(error) if fail_fast => {
                    *ended = true;
                    Some(Err(error.into()))
                }
                Err(error) => {
                    warn!(
                        persistence_id = %row.persistence_id,
                        sequence_nr = %row.sequence_nr,
                        ordering = %row.ordering,
                        %error,
                        "skipping row that failed to decode"
                    );
                    None
                }
            },
            Err(error) => {
                *ended = true;
                Some(Err(error))
            }
        };
        future::ready(Some(next))
    })
    .filter_map(future::ready)
    .boxed()
}

/// Read side of the journal.
pub struct ReadJournal<E> {
    dao: JournalDao<E>,
    tracker: TrackerHandle,
    config: ReadJournalConfig,
}

impl<E> Clone for ReadJournal<E> {
    fn clone(&self) -> Self {
        Self {
            dao: self.dao.clone(),
            tracker: self.tracker.clone(),
            config: self.config.clone(),
        }
    }
}

impl<E> std::fmt::Debug for ReadJournal<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadJournal")
            .field("dao", &self.dao)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E> ReadJournal<E>
where
    E: Send + Sync + 'static,
{
    /// Builds a read journal around an already running tracker.
    pub const fn new(
        dao: JournalDao<E>,
        tracker: TrackerHandle,
        config: ReadJournalConfig,
    ) -> Self {
        Self {
            dao,
            tracker,
            config,
        }
    }

    /// Builds a read journal and spawns its tracker on the current runtime.
    pub fn start(dao: JournalDao<E>, config: ReadJournalConfig) -> Self {
        let tracker = SequenceConsistencyTracker::spawn(dao.backend(), config.tracker.clone());
        Self::new(dao, tracker, config)
    }

    /// The tracker this journal bounds tag queries with.
    pub const fn tracker(&self) -> &TrackerHandle {
        &self.tracker
    }

    /// The underlying data access object.
    pub const fn dao(&self) -> &JournalDao<E> {
        &self.dao
    }

    /// Distinct persistence ids known now.
    pub fn current_persistence_ids(&self) -> BoxStream<'static, JournalResult<PersistenceId>> {
        persistence_ids::track_persistence_ids(self.dao.clone(), None)
    }

    /// Distinct persistence ids, including ones created later. Each id is
    /// emitted once.
    pub fn persistence_ids(&self) -> BoxStream<'static, JournalResult<PersistenceId>> {
        persistence_ids::track_persistence_ids(
            self.dao.clone(),
            Some(self.config.query.refresh_interval),
        )
    }

    /// Events of one stream with `from <= sequence_nr <= to`, ending once
    /// the stream has been read.
    pub fn current_events_by_persistence_id(
        &self,
        persistence_id: PersistenceId,
        from: SequenceNr,
        to: SequenceNr,
    ) -> BoxStream<'static, JournalResult<Envelope<E>>> {
        debug!(%persistence_id, %from, %to, "current events by persistence id");
        let rows = self.dao.messages_with_batch(
            persistence_id,
            from,
            to,
            self.config.query.batch_size.into_inner(),
            None,
        );
        into_envelopes(rows, self.config.query.fail_fast)
    }

    /// Events of one stream with `from <= sequence_nr <= to`, following new
    /// writes until `to` has been delivered.
    pub fn events_by_persistence_id(
        &self,
        persistence_id: PersistenceId,
        from: SequenceNr,
        to: SequenceNr,
    ) -> BoxStream<'static, JournalResult<Envelope<E>>> {
        debug!(%persistence_id, %from, %to, "live events by persistence id");
        let rows = self.dao.messages_with_batch(
            persistence_id,
            from,
            to,
            self.config.query.batch_size.into_inner(),
            Some(self.config.query.refresh_interval),
        );
        into_envelopes(rows, self.config.query.fail_fast)
    }

    /// Events tagged `tag` after `offset`, up to the journal's max ordering.
    ///
    /// The stream is lazy: the max ordering is read when it is first polled,
    /// not when this method is called. Rows written in between are included.
    /// Rows written after the first poll are not.
    pub fn current_events_by_tag(
        &self,
        tag: Tag,
        offset: Offset,
    ) -> BoxStream<'static, JournalResult<Envelope<E>>> {
        debug!(%tag, %offset, "current events by tag");
        self.by_tag(tag, offset, Bound::Current(None))
    }

    /// Events tagged `tag` after `offset`, following new writes forever.
    pub fn events_by_tag(
        &self,
        tag: Tag,
        offset: Offset,
    ) -> BoxStream<'static, JournalResult<Envelope<E>>> {
        debug!(%tag, %offset, "live events by tag");
        self.by_tag(tag, offset, Bound::Live)
    }

    fn by_tag(
        &self,
        tag: Tag,
        offset: Offset,
        bound: Bound,
    ) -> BoxStream<'static, JournalResult<Envelope<E>>> {
        let rows = tail_by_tag(
            self.dao.clone(),
            self.tracker.clone(),
            tag,
            offset.ordering(),
            bound,
            self.config.query.batch_size.into_inner(),
            self.config.query.refresh_interval,
        );
        into_envelopes(rows, self.config.query.fail_fast)
    }
}
