//! Live listing of distinct persistence ids.
//!
//! Every cycle re-lists all ids and emits only those not emitted before. The
//! set of known ids grows with the number of distinct streams and is never
//! pruned.

use std::collections::HashSet;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::trace;

use crate::dao::JournalDao;
use crate::errors::JournalResult;
use crate::types::PersistenceId;

struct Listing<E> {
    dao: JournalDao<E>,
    known: HashSet<PersistenceId>,
    refresh_interval: Option<Duration>,
    first: bool,
}

/// Distinct persistence ids, each emitted once.
///
/// With a refresh interval the stream is live and polls forever; without one
/// it lists once and ends.
pub(crate) fn track_persistence_ids<E>(
    dao: JournalDao<E>,
    refresh_interval: Option<Duration>,
) -> BoxStream<'static, JournalResult<PersistenceId>>
where
    E: Send + Sync + 'static,
{
    let listing = Listing {
        dao,
        known: HashSet::new(),
        refresh_interval,
        first: true,
    };

    stream::unfold(Some(listing), |state| async move {
        let mut listing = state?;
        if !std::mem::replace(&mut listing.first, false) {
            if let Some(interval) = listing.refresh_interval {
                tokio::time::sleep(interval).await;
            }
        }

        let listed: Vec<PersistenceId> = match listing
            .dao
            .all_persistence_ids(u64::MAX)
            .try_collect()
            .await
        {
            Ok(listed) => listed,
            Err(error) => return Some((vec![Err(error)], None)),
        };

        let fresh: Vec<_> = listed
            .into_iter()
            .filter(|id| listing.known.insert(id.clone()))
            .map(Ok)
            .collect();
        trace!(new = fresh.len(), known = listing.known.len(), "persistence ids listed");

        let next = listing.refresh_interval.is_some().then_some(listing);
        Some((fresh, next))
    })
    .flat_map(stream::iter)
    .boxed()
}
