//! Shared fixtures for the in-memory integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use eventlog::{
    AtomicWrite, BatchSize, JournalBackend, JournalConfig, JournalDao, JsonSerializer,
    MaxAttempts, OrderingNr, PersistenceId, PersistentRepr, QueryConfig, ReadJournalConfig,
    SequenceNr, Tag, TrackerConfig, TrackerHandle,
};
use eventlog_memory::InMemoryBackend;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CartEvent {
    ItemAdded { sku: String, quantity: u32 },
    CheckedOut,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn pid(value: &str) -> PersistenceId {
    PersistenceId::try_new(value).unwrap()
}

pub fn tag(value: &str) -> Tag {
    Tag::try_new(value).unwrap()
}

pub fn event(persistence_id: &str, sequence_nr: u64, tags: &[&str]) -> PersistentRepr<CartEvent> {
    PersistentRepr::new(
        pid(persistence_id),
        SequenceNr::new(sequence_nr),
        CartEvent::ItemAdded {
            sku: format!("sku-{sequence_nr}"),
            quantity: 1,
        },
    )
    .with_tags(tags.iter().copied().map(tag))
}

pub fn batch(events: Vec<PersistentRepr<CartEvent>>) -> AtomicWrite<CartEvent> {
    AtomicWrite::new(events)
}

pub fn dao_over(backend: &InMemoryBackend) -> JournalDao<CartEvent> {
    dao_with_config(backend, JournalConfig::default())
}

pub fn dao_with_config(backend: &InMemoryBackend, config: JournalConfig) -> JournalDao<CartEvent> {
    let backend: Arc<dyn JournalBackend> = Arc::new(backend.clone());
    JournalDao::new(backend, Arc::new(JsonSerializer::new()), config)
}

pub fn fast_tracker() -> TrackerConfig {
    TrackerConfig::default()
        .with_query_delay(Duration::from_millis(10))
        .with_max_attempts(MaxAttempts::try_new(1_000).unwrap())
        .with_max_gap_age(Duration::from_secs(3_600))
}

pub fn fast_read_config(batch_size: usize) -> ReadJournalConfig {
    ReadJournalConfig {
        query: QueryConfig::default()
            .with_batch_size(BatchSize::try_new(batch_size).unwrap())
            .with_refresh_interval(Duration::from_millis(10)),
        tracker: fast_tracker(),
    }
}

/// Polls the tracker until it reports at least `target`.
pub async fn wait_for_max(tracker: &TrackerHandle, target: u64) -> OrderingNr {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let max = tracker.max_ordering().await.unwrap();
            if max >= OrderingNr::new(target) {
                return max;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("tracker did not reach target")
}

pub async fn write(dao: &JournalDao<CartEvent>, events: Vec<PersistentRepr<CartEvent>>) {
    dao.put_messages(batch(events)).await.unwrap();
}
