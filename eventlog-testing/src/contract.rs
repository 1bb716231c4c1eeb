//! Behavioural contract every [`JournalBackend`] must satisfy.
//!
//! Each scenario takes a factory returning an empty backend and reports the
//! first violated expectation. Use [`backend_contract_tests!`] to run the
//! whole suite against an implementation:
//!
//! ```rust,ignore
//! eventlog_testing::contract::backend_contract_tests! {
//!     suite = in_memory,
//!     make_backend = eventlog_memory::InMemoryBackend::new,
//! }
//! ```
//!
//! The scenarios read their own writes back, so a store with lagging
//! secondary indexes has to be run in a read-after-write mode.

use std::collections::BTreeSet;
use std::fmt;

use eventlog::{
    BackendError, JournalBackend, JournalRow, OrderingNr, PersistenceId, SequenceNr, StreamRange,
    Tag, TagRange,
};

/// A violated expectation, tagged with the scenario it belongs to.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn backend_error(
        scenario: &'static str,
        operation: &'static str,
        error: &BackendError,
    ) -> Self {
        Self::new(
            scenario,
            format!("{operation} returned unexpected error: {error}"),
        )
    }
}

fn failed(
    scenario: &'static str,
    operation: &'static str,
) -> impl FnOnce(BackendError) -> ContractTestFailure {
    move |error| ContractTestFailure::backend_error(scenario, operation, &error)
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

fn persistence_id(
    scenario: &'static str,
    label: &str,
) -> Result<PersistenceId, ContractTestFailure> {
    PersistenceId::try_new(format!("contract-{label}")).map_err(|error| {
        ContractTestFailure::new(scenario, format!("invalid persistence id `{label}`: {error}"))
    })
}

fn tag(scenario: &'static str, label: &str) -> Result<Tag, ContractTestFailure> {
    Tag::try_new(label).map_err(|error| {
        ContractTestFailure::new(scenario, format!("invalid tag `{label}`: {error}"))
    })
}

fn check(
    scenario: &'static str,
    holds: bool,
    detail: impl FnOnce() -> String,
) -> ContractTestResult {
    if holds {
        Ok(())
    } else {
        Err(ContractTestFailure::new(scenario, detail()))
    }
}

/// Allocates orderings for `rows` in order and stores them as one batch.
async fn append<B: JournalBackend>(
    backend: &B,
    scenario: &'static str,
    rows: Vec<(PersistenceId, u64, Vec<Tag>)>,
) -> Result<Vec<JournalRow>, ContractTestFailure> {
    let count = rows.len() as u64;
    let first = backend
        .allocate_orderings(count)
        .await
        .map_err(failed(scenario, "allocate_orderings"))?;

    let rows: Vec<JournalRow> = rows
        .into_iter()
        .zip(0..)
        .map(|((persistence_id, sequence_nr, tags), offset)| JournalRow {
            message: format!("{persistence_id}:{sequence_nr}").into_bytes(),
            persistence_id,
            sequence_nr: SequenceNr::new(sequence_nr),
            deleted: false,
            ordering: first.advance(offset),
            tags: tags.into_iter().collect::<BTreeSet<_>>(),
        })
        .collect();

    backend
        .put_batch(rows.clone())
        .await
        .map_err(failed(scenario, "put_batch"))?;
    Ok(rows)
}

async fn stream<B: JournalBackend>(
    backend: &B,
    scenario: &'static str,
    range: StreamRange,
) -> Result<Vec<JournalRow>, ContractTestFailure> {
    backend
        .query_by_persistence_id(&range)
        .await
        .map_err(failed(scenario, "query_by_persistence_id"))
}

fn whole_stream(persistence_id: &PersistenceId, include_deleted: bool) -> StreamRange {
    StreamRange {
        persistence_id: persistence_id.clone(),
        from: SequenceNr::ZERO,
        to: SequenceNr::MAX,
        limit: 100,
        include_deleted,
    }
}

fn sequence_nrs(rows: &[JournalRow]) -> Vec<u64> {
    rows.iter().map(|row| row.sequence_nr.value()).collect()
}

/// Ordering blocks never overlap and only grow.
pub async fn test_orderings_are_never_reused<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: JournalBackend,
{
    const SCENARIO: &str = "orderings_are_never_reused";

    let backend = make_backend();
    let first = backend
        .allocate_orderings(3)
        .await
        .map_err(failed(SCENARIO, "allocate_orderings"))?;
    let second = backend
        .allocate_orderings(2)
        .await
        .map_err(failed(SCENARIO, "allocate_orderings"))?;

    check(SCENARIO, first > OrderingNr::ZERO, || {
        "ordering values start above zero".to_string()
    })?;
    check(SCENARIO, second >= first.advance(3), || {
        format!("second block starts at {second}, overlapping block starting at {first}")
    })
}

/// A batch with one conflicting key stores nothing.
pub async fn test_put_batch_is_atomic<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: JournalBackend,
{
    const SCENARIO: &str = "put_batch_is_atomic";

    let backend = make_backend();
    let id = persistence_id(SCENARIO, "atomic")?;
    let _ = append(
        &backend,
        SCENARIO,
        vec![(id.clone(), 1, Vec::new()), (id.clone(), 2, Vec::new())],
    )
    .await?;

    let conflicting = append(
        &backend,
        SCENARIO,
        vec![(id.clone(), 3, Vec::new()), (id.clone(), 1, Vec::new())],
    )
    .await;
    check(SCENARIO, conflicting.is_err(), || {
        "rewriting an existing key succeeded".to_string()
    })?;

    let rows = stream(&backend, SCENARIO, whole_stream(&id, true)).await?;
    check(SCENARIO, sequence_nrs(&rows) == [1, 2], || {
        format!("partial batch became visible: {:?}", sequence_nrs(&rows))
    })
}

/// Rewriting an existing key is reported as a failed condition.
pub async fn test_conflict_is_a_condition_failure<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: JournalBackend,
{
    const SCENARIO: &str = "conflict_is_a_condition_failure";

    let backend = make_backend();
    let id = persistence_id(SCENARIO, "conflict")?;
    let mut again = append(&backend, SCENARIO, vec![(id, 1, Vec::new())]).await?;
    for row in &mut again {
        row.ordering = row.ordering.advance(1_000);
    }
    match backend.put_batch(again).await {
        Err(BackendError::ConditionFailed(_)) => Ok(()),
        Err(error) => Err(ContractTestFailure::backend_error(SCENARIO, "put_batch", &error)),
        Ok(()) => Err(ContractTestFailure::new(
            SCENARIO,
            "expected a condition failure but the put succeeded",
        )),
    }
}

/// Stream queries are ascending, bounded on both ends, limited and isolated.
pub async fn test_stream_query_is_bounded<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: JournalBackend,
{
    const SCENARIO: &str = "stream_query_is_bounded";

    let backend = make_backend();
    let id = persistence_id(SCENARIO, "bounded")?;
    let other = persistence_id(SCENARIO, "neighbour")?;
    let mut rows: Vec<_> = (1..=5).map(|seq| (id.clone(), seq, Vec::new())).collect();
    rows.push((other.clone(), 3, Vec::new()));
    let _ = append(&backend, SCENARIO, rows).await?;

    let range = StreamRange {
        persistence_id: id.clone(),
        from: SequenceNr::new(2),
        to: SequenceNr::new(4),
        limit: 10,
        include_deleted: false,
    };
    let bounded = stream(&backend, SCENARIO, range.clone()).await?;
    check(SCENARIO, sequence_nrs(&bounded) == [2, 3, 4], || {
        format!("expected [2, 3, 4], observed {:?}", sequence_nrs(&bounded))
    })?;
    check(
        SCENARIO,
        bounded.iter().all(|row| row.persistence_id == id),
        || "stream query returned rows of another stream".to_string(),
    )?;

    let limited = stream(&backend, SCENARIO, StreamRange { limit: 2, ..range }).await?;
    check(SCENARIO, sequence_nrs(&limited) == [2, 3], || {
        format!("expected [2, 3] under limit 2, observed {:?}", sequence_nrs(&limited))
    })?;

    let missing = persistence_id(SCENARIO, "missing")?;
    let empty = stream(&backend, SCENARIO, whole_stream(&missing, true)).await?;
    check(SCENARIO, empty.is_empty(), || {
        format!("unknown stream returned {} rows", empty.len())
    })
}

/// Tombstoning is counted once and hides rows unless asked for.
pub async fn test_mark_deleted_tombstones_once<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: JournalBackend,
{
    const SCENARIO: &str = "mark_deleted_tombstones_once";

    let backend = make_backend();
    let id = persistence_id(SCENARIO, "tombstones")?;
    let rows = (1..=3).map(|seq| (id.clone(), seq, Vec::new())).collect();
    let _ = append(&backend, SCENARIO, rows).await?;

    for expected in [2, 0] {
        let changed = backend
            .mark_deleted(&id, SequenceNr::new(2))
            .await
            .map_err(failed(SCENARIO, "mark_deleted"))?;
        check(SCENARIO, changed == expected, || {
            format!("expected {expected} rows to change state, observed {changed}")
        })?;
    }

    let live = stream(&backend, SCENARIO, whole_stream(&id, false)).await?;
    check(SCENARIO, sequence_nrs(&live) == [3], || {
        format!("tombstoned rows leaked into replay: {:?}", sequence_nrs(&live))
    })?;

    let all = stream(&backend, SCENARIO, whole_stream(&id, true)).await?;
    let flags: Vec<bool> = all.iter().map(|row| row.deleted).collect();
    check(SCENARIO, flags == [true, true, false], || {
        format!("unexpected tombstone flags {flags:?}")
    })
}

/// Updates replace the message only, and only of existing rows.
pub async fn test_update_keeps_ordering<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: JournalBackend,
{
    const SCENARIO: &str = "update_keeps_ordering";

    let backend = make_backend();
    let id = persistence_id(SCENARIO, "update")?;
    let label = tag(SCENARIO, "updated")?;
    let written = append(&backend, SCENARIO, vec![(id.clone(), 1, vec![label])]).await?;

    backend
        .update_message(&id, SequenceNr::new(1), b"corrected".to_vec())
        .await
        .map_err(failed(SCENARIO, "update_message"))?;

    let rows = stream(&backend, SCENARIO, whole_stream(&id, false)).await?;
    let unchanged_position = rows
        .first()
        .is_some_and(|row| row.ordering == written[0].ordering && row.tags == written[0].tags);
    check(SCENARIO, unchanged_position, || {
        "update changed the ordering or tags of the row".to_string()
    })?;
    check(
        SCENARIO,
        rows.first().is_some_and(|row| row.message == b"corrected"),
        || "update did not replace the message".to_string(),
    )?;

    match backend
        .update_message(&id, SequenceNr::new(9), b"nothing".to_vec())
        .await
    {
        Err(BackendError::RowNotFound { .. }) => Ok(()),
        Err(error) => Err(ContractTestFailure::backend_error(SCENARIO, "update_message", &error)),
        Ok(()) => Err(ContractTestFailure::new(
            SCENARIO,
            "updating a missing row succeeded",
        )),
    }
}

/// Tag queries honour `after < ordering <= to` and skip tombstones.
pub async fn test_tag_query_is_bounded<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: JournalBackend,
{
    const SCENARIO: &str = "tag_query_is_bounded";

    let backend = make_backend();
    let first = persistence_id(SCENARIO, "tagged-a")?;
    let second = persistence_id(SCENARIO, "tagged-b")?;
    let wanted = tag(SCENARIO, "wanted")?;
    let noise = tag(SCENARIO, "noise")?;

    let rows = append(
        &backend,
        SCENARIO,
        vec![
            (first.clone(), 1, vec![wanted.clone()]),
            (second.clone(), 1, vec![noise]),
            (first.clone(), 2, vec![wanted.clone()]),
            (second.clone(), 2, vec![wanted.clone()]),
            (first.clone(), 3, vec![wanted.clone()]),
        ],
    )
    .await?;
    let orderings: Vec<OrderingNr> = rows.iter().map(|row| row.ordering).collect();

    let query = |after: OrderingNr, to: OrderingNr, limit: usize| TagRange {
        tag: wanted.clone(),
        after,
        to,
        limit,
    };

    let tagged = backend
        .query_by_tag(&query(orderings[0], orderings[4], 10))
        .await
        .map_err(failed(SCENARIO, "query_by_tag"))?;
    let observed: Vec<OrderingNr> = tagged.iter().map(|row| row.ordering).collect();
    check(
        SCENARIO,
        observed == [orderings[2], orderings[3], orderings[4]],
        || format!("unexpected tag query result {observed:?} for orderings {orderings:?}"),
    )?;

    let _ = backend
        .mark_deleted(&first, SequenceNr::new(2))
        .await
        .map_err(failed(SCENARIO, "mark_deleted"))?;
    let after_delete = backend
        .query_by_tag(&query(OrderingNr::ZERO, orderings[4], 1))
        .await
        .map_err(failed(SCENARIO, "query_by_tag"))?;
    check(
        SCENARIO,
        after_delete.len() == 1 && after_delete[0].ordering == orderings[3],
        || "tag query returned a tombstoned row or ignored the limit".to_string(),
    )
}

/// The max probe and the ordering scan agree on what is visible.
pub async fn test_max_ordering_matches_scan<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: JournalBackend,
{
    const SCENARIO: &str = "max_ordering_matches_scan";

    let backend = make_backend();
    let empty = backend
        .max_ordering()
        .await
        .map_err(failed(SCENARIO, "max_ordering"))?;
    check(SCENARIO, empty == OrderingNr::ZERO, || {
        format!("empty backend reported max ordering {empty}")
    })?;

    let id = persistence_id(SCENARIO, "scan")?;
    let rows = (1..=4).map(|seq| (id.clone(), seq, Vec::new())).collect();
    let written: Vec<OrderingNr> = append(&backend, SCENARIO, rows)
        .await?
        .iter()
        .map(|row| row.ordering)
        .collect();
    let _ = backend
        .mark_deleted(&id, SequenceNr::new(1))
        .await
        .map_err(failed(SCENARIO, "mark_deleted"))?;

    let max = backend
        .max_ordering()
        .await
        .map_err(failed(SCENARIO, "max_ordering"))?;
    check(SCENARIO, Some(&max) == written.last(), || {
        format!("max ordering {max} does not match last written {written:?}")
    })?;

    let scanned = backend
        .scan_orderings(OrderingNr::ZERO, max, 100)
        .await
        .map_err(failed(SCENARIO, "scan_orderings"))?;
    check(SCENARIO, scanned == written, || {
        format!("scan returned {scanned:?}, expected {written:?} including tombstones")
    })?;

    let page = backend
        .scan_orderings(written[0], max, 2)
        .await
        .map_err(failed(SCENARIO, "scan_orderings"))?;
    check(SCENARIO, page == written[1..3], || {
        format!("bounded scan returned {page:?}")
    })
}

/// Stream listings are distinct, ascending and paginated.
pub async fn test_listing_is_paginated<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: JournalBackend,
{
    const SCENARIO: &str = "listing_is_paginated";

    let backend = make_backend();
    let a = persistence_id(SCENARIO, "a")?;
    let b = persistence_id(SCENARIO, "b")?;
    let c = persistence_id(SCENARIO, "c")?;
    let _ = append(
        &backend,
        SCENARIO,
        vec![
            (c.clone(), 1, Vec::new()),
            (a.clone(), 1, Vec::new()),
            (c.clone(), 2, Vec::new()),
            (b.clone(), 1, Vec::new()),
        ],
    )
    .await?;

    let first_page = backend
        .list_persistence_ids(None, 2)
        .await
        .map_err(failed(SCENARIO, "list_persistence_ids"))?;
    check(SCENARIO, first_page == [a, b.clone()], || {
        format!("unexpected first page {first_page:?}")
    })?;

    let second_page = backend
        .list_persistence_ids(Some(&b), 2)
        .await
        .map_err(failed(SCENARIO, "list_persistence_ids"))?;
    check(SCENARIO, second_page == [c], || {
        format!("unexpected second page {second_page:?}")
    })
}

/// Generates one `#[tokio::test]` per backend contract scenario.
#[macro_export]
macro_rules! backend_contract_tests {
    (suite = $suite:ident, make_backend = $make_backend:expr $(,)?) => {
        mod $suite {
            #[allow(unused_imports)]
            use super::*;
            use $crate::contract::{
                test_conflict_is_a_condition_failure, test_listing_is_paginated,
                test_mark_deleted_tombstones_once, test_max_ordering_matches_scan,
                test_orderings_are_never_reused, test_put_batch_is_atomic,
                test_stream_query_is_bounded, test_tag_query_is_bounded,
                test_update_keeps_ordering,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn orderings_are_never_reused_contract() {
                test_orderings_are_never_reused($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn put_batch_is_atomic_contract() {
                test_put_batch_is_atomic($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn conflict_is_a_condition_failure_contract() {
                test_conflict_is_a_condition_failure($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn stream_query_is_bounded_contract() {
                test_stream_query_is_bounded($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn mark_deleted_tombstones_once_contract() {
                test_mark_deleted_tombstones_once($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn update_keeps_ordering_contract() {
                test_update_keeps_ordering($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn tag_query_is_bounded_contract() {
                test_tag_query_is_bounded($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn max_ordering_matches_scan_contract() {
                test_max_ordering_matches_scan($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn listing_is_paginated_contract() {
                test_listing_is_paginated($make_backend)
                    .await
                    .expect("backend contract failed");
            }
        }
    };
}

pub use backend_contract_tests;
