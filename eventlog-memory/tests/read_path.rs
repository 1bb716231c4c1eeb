//! Read path behaviour against the in-memory backend.

mod common;

use std::time::Duration;

use common::*;
use eventlog::{
    JournalBackend, JournalError, JournalRow, OrderingNr, ReplayRequest, SequenceNr,
    SerializationError,
};
use eventlog_memory::InMemoryBackend;
use futures::{StreamExt, TryStreamExt};

fn sequence_nrs(rows: &[eventlog::Decoded<CartEvent>]) -> Vec<u64> {
    rows.iter().map(|decoded| decoded.sequence_nr().value()).collect()
}

#[tokio::test]
async fn test_replay_is_ordered_and_batched() {
    let backend = InMemoryBackend::new();
    let dao = dao_over(&backend);
    let events: Vec<_> = (1..=7).map(|seq| event("p1", seq, &[])).collect();
    write(&dao, events).await;

    let rows: Vec<_> = dao
        .messages_with_batch(pid("p1"), SequenceNr::new(2), SequenceNr::new(6), 2, None)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(sequence_nrs(&rows), vec![2, 3, 4, 5, 6]);
    assert_eq!(backend.calls().stream_queries, 3);
}

#[tokio::test]
async fn test_replay_is_lazy() {
    let backend = InMemoryBackend::new();
    let dao = dao_over(&backend);
    write(&dao, vec![event("p1", 1, &[])]).await;

    let stream = dao.messages(pid("p1"), SequenceNr::ZERO, SequenceNr::MAX, u64::MAX);
    assert_eq!(backend.calls().stream_queries, 0);
    drop(stream);
    assert_eq!(backend.calls().stream_queries, 0);
}

#[tokio::test]
async fn test_replay_respects_max() {
    let backend = InMemoryBackend::new();
    let dao = dao_over(&backend);
    let events: Vec<_> = (1..=5).map(|seq| event("p1", seq, &[])).collect();
    write(&dao, events).await;

    let rows: Vec<_> = dao
        .messages(pid("p1"), SequenceNr::ZERO, SequenceNr::MAX, 3)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(sequence_nrs(&rows), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_tombstones_are_replayed_only_on_request() {
    let backend = InMemoryBackend::new();
    let dao = dao_over(&backend);
    write(&dao, vec![event("p1", 1, &[]), event("p1", 2, &[])]).await;
    dao.delete_messages(&pid("p1"), SequenceNr::new(1)).await.unwrap();

    let normal: Vec<_> = dao
        .messages(pid("p1"), SequenceNr::ZERO, SequenceNr::MAX, u64::MAX)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(sequence_nrs(&normal), vec![2]);

    let request = ReplayRequest::new(pid("p1"), SequenceNr::ZERO, SequenceNr::MAX, 10)
        .including_deleted();
    let all: Vec<_> = dao.replay(request).try_collect().await.unwrap();
    assert_eq!(sequence_nrs(&all), vec![1, 2]);
    assert!(all[0].row.deleted);
    assert!(all[0].result.as_ref().unwrap().deleted);
}

#[tokio::test]
async fn test_decode_failure_stays_with_its_row() {
    let backend = InMemoryBackend::new();
    let dao = dao_over(&backend);
    write(&dao, vec![event("p1", 1, &[])]).await;
    let ordering = backend.allocate_orderings(1).await.unwrap();
    backend
        .put_batch(vec![JournalRow {
            persistence_id: pid("p1"),
            sequence_nr: SequenceNr::new(2),
            deleted: false,
            message: b"{not json".to_vec(),
            ordering,
            tags: Default::default(),
        }])
        .await
        .unwrap();
    write(&dao, vec![event("p1", 3, &[])]).await;

    let rows: Vec<_> = dao
        .messages(pid("p1"), SequenceNr::ZERO, SequenceNr::MAX, u64::MAX)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(rows.len(), 3);
    assert!(rows[0].result.is_ok());
    assert!(matches!(
        rows[1].result,
        Err(SerializationError::Deserialize { sequence_nr, .. }) if sequence_nr == SequenceNr::new(2)
    ));
    assert!(rows[2].result.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_live_replay_picks_up_later_writes() {
    let backend = InMemoryBackend::new();
    let dao = dao_over(&backend);
    write(&dao, vec![event("p1", 1, &[])]).await;

    let mut live = dao.messages_with_batch(
        pid("p1"),
        SequenceNr::ZERO,
        SequenceNr::MAX,
        10,
        Some(Duration::from_millis(20)),
    );
    let first = live.next().await.unwrap().unwrap();
    assert_eq!(first.sequence_nr(), SequenceNr::new(1));

    let writer = {
        let dao = dao.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            write(&dao, vec![event("p1", 2, &[]), event("p1", 3, &[])]).await;
        })
    };

    let next: Vec<_> = tokio::time::timeout(
        Duration::from_secs(5),
        live.by_ref().take(2).collect::<Vec<_>>(),
    )
    .await
    .unwrap();
    let next: Vec<u64> = next
        .into_iter()
        .map(|decoded| decoded.unwrap().sequence_nr().value())
        .collect();
    assert_eq!(next, vec![2, 3]);
    writer.await.unwrap();
}

#[tokio::test]
async fn test_tag_query_over_empty_range_makes_no_backend_call() {
    let backend = InMemoryBackend::new();
    let dao = dao_over(&backend);
    write(&dao, vec![event("p1", 1, &["a"]), event("p1", 2, &["a"])]).await;
    let max = dao.max_journal_sequence().await.unwrap();
    let before = backend.calls().tag_queries;

    let rows: Vec<_> = dao.events_by_tag(tag("a"), max, max, 10).collect().await;

    assert!(rows.is_empty());
    assert_eq!(backend.calls().tag_queries, before);
}

#[tokio::test]
async fn test_tag_query_is_bounded_and_capped() {
    let backend = InMemoryBackend::new();
    let dao = dao_over(&backend);
    let events: Vec<_> = (1..=6).map(|seq| event("p1", seq, &["a"])).collect();
    write(&dao, events).await;

    let bounded: Vec<u64> = dao
        .events_by_tag(tag("a"), OrderingNr::new(1), OrderingNr::new(4), 10)
        .map_ok(|decoded| decoded.ordering().value())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(bounded, vec![2, 3, 4]);

    let capped: Vec<u64> = dao
        .events_by_tag(tag("a"), OrderingNr::ZERO, OrderingNr::new(6), 2)
        .map_ok(|decoded| decoded.ordering().value())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(capped, vec![1, 2]);
}

#[tokio::test]
async fn test_max_journal_sequence_tracks_visible_rows() {
    let backend = InMemoryBackend::new();
    let dao = dao_over(&backend);
    assert_eq!(dao.max_journal_sequence().await.unwrap(), OrderingNr::ZERO);

    write(&dao, vec![event("p1", 1, &[]), event("p2", 1, &[])]).await;
    assert_eq!(dao.max_journal_sequence().await.unwrap(), OrderingNr::new(2));

    backend.hold_next(1);
    write(&dao, vec![event("p3", 1, &[])]).await;
    assert_eq!(dao.max_journal_sequence().await.unwrap(), OrderingNr::new(2));
}

#[tokio::test]
async fn test_all_persistence_ids_pages_through_streams() {
    let backend = InMemoryBackend::new();
    let dao = dao_with_config(
        &backend,
        eventlog::JournalConfig::default()
            .with_replay_batch_size(eventlog::BatchSize::try_new(2).unwrap()),
    );
    for stream in ["d", "b", "a", "c", "e"] {
        write(&dao, vec![event(stream, 1, &[])]).await;
    }

    let all: Vec<String> = dao
        .all_persistence_ids(u64::MAX)
        .map_ok(|id| id.to_string())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(all, vec!["a", "b", "c", "d", "e"]);
    assert_eq!(backend.calls().listings, 3);

    let limited: Vec<_> = dao.all_persistence_ids(3).try_collect().await.unwrap();
    assert_eq!(limited.len(), 3);
}

#[tokio::test]
async fn test_inverted_range_yields_nothing() {
    let backend = InMemoryBackend::new();
    let dao = dao_over(&backend);
    write(&dao, vec![event("p1", 1, &[])]).await;

    let rows: Vec<Result<_, JournalError>> = dao
        .messages(pid("p1"), SequenceNr::new(5), SequenceNr::new(2), u64::MAX)
        .collect()
        .await;
    assert!(rows.is_empty());
    assert_eq!(backend.calls().stream_queries, 0);
}
