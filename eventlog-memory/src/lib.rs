//! In-memory backend for the `eventlog` journal.
//!
//! [`InMemoryBackend`] implements [`JournalBackend`] on top of a few maps
//! guarded by a lock. It is meant for tests and local development.
//!
//! Real key-value stores make writes visible eventually, not immediately.
//! The in-memory backend can reproduce that: [`InMemoryBackend::hold_next`]
//! keeps the next rows invisible until they are released, and
//! [`InMemoryBackend::with_write_latency`] delays every batch so concurrent
//! writers land out of ordering order. [`InMemoryBackend::set_probe_latency`]
//! slows down the probes the consistency tracker relies on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventlog::backend::{JournalBackend, StreamRange, TagRange};
use eventlog::config::JournalConfig;
use eventlog::errors::{BackendError, BackendResult};
use eventlog::keys::{KeyResolver, KeyStrategy, RowKey};
use eventlog::row::JournalRow;
use eventlog::types::{OrderingNr, PersistenceId, SequenceNr, Tag};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

#[derive(Debug)]
struct StoredRow {
    row: JournalRow,
    visible: bool,
}

#[derive(Debug, Default)]
struct State {
    // Primary table, keyed the way a key-value store would key it
    table: HashMap<RowKey, StoredRow>,
    by_stream: BTreeMap<(PersistenceId, SequenceNr), RowKey>,
    by_tag: BTreeMap<(Tag, OrderingNr), RowKey>,
    by_ordering: BTreeMap<OrderingNr, RowKey>,
    visible_streams: BTreeSet<PersistenceId>,
    hold_remaining: usize,
    held: BTreeSet<OrderingNr>,
}

impl State {
    fn visible_row(&self, key: &RowKey) -> Option<&JournalRow> {
        self.table
            .get(key)
            .filter(|stored| stored.visible)
            .map(|stored| &stored.row)
    }

    fn reveal(&mut self, ordering: OrderingNr) -> bool {
        if !self.held.remove(&ordering) {
            return false;
        }
        let Some(key) = self.by_ordering.get(&ordering) else {
            return false;
        };
        let Some(stored) = self.table.get_mut(key) else {
            return false;
        };
        stored.visible = true;
        self.visible_streams.insert(stored.row.persistence_id.clone());
        true
    }
}

/// Counts of backend calls, for asserting on query behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCalls {
    /// `put_batch` calls.
    pub puts: u64,
    /// `query_by_persistence_id` calls.
    pub stream_queries: u64,
    /// `query_by_tag` calls.
    pub tag_queries: u64,
    /// `max_ordering` calls.
    pub max_probes: u64,
    /// `scan_orderings` calls.
    pub scans: u64,
    /// `list_persistence_ids` calls.
    pub listings: u64,
}

#[derive(Debug, Default)]
struct CallCounters {
    puts: AtomicU64,
    stream_queries: AtomicU64,
    tag_queries: AtomicU64,
    max_probes: AtomicU64,
    scans: AtomicU64,
    listings: AtomicU64,
}

impl CallCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BackendCalls {
        BackendCalls {
            puts: self.puts.load(Ordering::Relaxed),
            stream_queries: self.stream_queries.load(Ordering::Relaxed),
            tag_queries: self.tag_queries.load(Ordering::Relaxed),
            max_probes: self.max_probes.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            listings: self.listings.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe in-memory journal backend.
///
/// Clones share storage.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    state: Arc<RwLock<State>>,
    next_ordering: Arc<AtomicU64>,
    calls: Arc<CallCounters>,
    key_strategy: KeyStrategy,
    write_latency: Option<Duration>,
    probe_latency: Arc<Mutex<Option<Duration>>>,
}

impl InMemoryBackend {
    /// Creates an empty backend keyed by persistence id.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            next_ordering: Arc::new(AtomicU64::new(1)),
            calls: Arc::new(CallCounters::default()),
            key_strategy: KeyStrategy::default(),
            write_latency: None,
            probe_latency: Arc::new(Mutex::new(None)),
        }
    }

    /// Creates an empty backend using the key strategy from `config`.
    pub fn from_config(config: &JournalConfig) -> Self {
        Self::new().with_key_strategy(config.key_strategy)
    }

    /// Uses `key_strategy` to key the primary table.
    #[must_use]
    pub const fn with_key_strategy(mut self, key_strategy: KeyStrategy) -> Self {
        self.key_strategy = key_strategy;
        self
    }

    /// Delays every `put_batch` by `latency` before it is applied.
    #[must_use]
    pub const fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = Some(latency);
        self
    }

    /// Delays every `max_ordering` and `scan_orderings` call started from now
    /// on by `latency`. `None` removes the delay. Shared by all clones.
    pub fn set_probe_latency(&self, latency: Option<Duration>) {
        *self.probe_latency.lock() = latency;
    }

    async fn probe_delay(&self) {
        let latency = *self.probe_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Keeps the next `rows` rows written invisible until released.
    pub fn hold_next(&self, rows: usize) {
        self.state.write().hold_remaining = rows;
    }

    /// Makes a held row visible. Returns `false` if nothing was held at
    /// `ordering`.
    pub fn release(&self, ordering: OrderingNr) -> bool {
        let released = self.state.write().reveal(ordering);
        if released {
            debug!(%ordering, "held row released");
        }
        released
    }

    /// Makes every held row visible.
    pub fn release_all(&self) {
        let mut state = self.state.write();
        let held: Vec<OrderingNr> = state.held.iter().copied().collect();
        for ordering in held {
            state.reveal(ordering);
        }
    }

    /// Ordering values of rows currently held back.
    pub fn held_orderings(&self) -> Vec<OrderingNr> {
        self.state.read().held.iter().copied().collect()
    }

    /// Every stored row, visible or not, in ordering order.
    pub fn rows(&self) -> Vec<JournalRow> {
        let state = self.state.read();
        state
            .by_ordering
            .values()
            .filter_map(|key| state.table.get(key))
            .map(|stored| stored.row.clone())
            .collect()
    }

    /// Backend calls made so far.
    pub fn calls(&self) -> BackendCalls {
        self.calls.snapshot()
    }

    fn check_batch(&self, state: &State, rows: &[JournalRow]) -> BackendResult<Vec<RowKey>> {
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let key = self.key_strategy.resolve(&row.persistence_id, row.sequence_nr);
            if state.table.contains_key(&key) || keys.contains(&key) {
                return Err(BackendError::ConditionFailed(format!(
                    "row {}/{} already exists",
                    row.persistence_id, row.sequence_nr
                )));
            }
            if state.by_ordering.contains_key(&row.ordering) {
                return Err(BackendError::ConditionFailed(format!(
                    "ordering {} already used",
                    row.ordering
                )));
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JournalBackend for InMemoryBackend {
    async fn allocate_orderings(&self, count: u64) -> BackendResult<OrderingNr> {
        let first = self.next_ordering.fetch_add(count, Ordering::SeqCst);
        Ok(OrderingNr::new(first))
    }

    async fn put_batch(&self, rows: Vec<JournalRow>) -> BackendResult<()> {
        CallCounters::bump(&self.calls.puts);
        if let Some(latency) = self.write_latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.write();
        let keys = self.check_batch(&state, &rows)?;

        for (row, key) in rows.into_iter().zip(keys) {
            let visible = if state.hold_remaining > 0 {
                state.hold_remaining -= 1;
                state.held.insert(row.ordering);
                false
            } else {
                true
            };

            trace!(
                persistence_id = %row.persistence_id,
                sequence_nr = %row.sequence_nr,
                ordering = %row.ordering,
                visible,
                "row stored"
            );
            state
                .by_stream
                .insert((row.persistence_id.clone(), row.sequence_nr), key.clone());
            for tag in &row.tags {
                state.by_tag.insert((tag.clone(), row.ordering), key.clone());
            }
            state.by_ordering.insert(row.ordering, key.clone());
            if visible {
                state.visible_streams.insert(row.persistence_id.clone());
            }
            state.table.insert(key, StoredRow { row, visible });
        }
        Ok(())
    }

    async fn update_message(
        &self,
        persistence_id: &PersistenceId,
        sequence_nr: SequenceNr,
        message: Vec<u8>,
    ) -> BackendResult<()> {
        let key = self.key_strategy.resolve(persistence_id, sequence_nr);
        let mut state = self.state.write();
        let stored = state
            .table
            .get_mut(&key)
            .ok_or_else(|| BackendError::RowNotFound {
                persistence_id: persistence_id.clone(),
                sequence_nr,
            })?;
        stored.row.message = message;
        Ok(())
    }

    async fn mark_deleted(
        &self,
        persistence_id: &PersistenceId,
        to: SequenceNr,
    ) -> BackendResult<u64> {
        let mut state = self.state.write();
        let keys: Vec<RowKey> = state
            .by_stream
            .range((persistence_id.clone(), SequenceNr::ZERO)..=(persistence_id.clone(), to))
            .map(|(_, key)| key.clone())
            .collect();

        let mut tombstoned = 0;
        for key in keys {
            if let Some(stored) = state.table.get_mut(&key) {
                if !stored.row.deleted {
                    stored.row.deleted = true;
                    tombstoned += 1;
                }
            }
        }
        Ok(tombstoned)
    }

    async fn query_by_persistence_id(&self, range: &StreamRange) -> BackendResult<Vec<JournalRow>> {
        CallCounters::bump(&self.calls.stream_queries);
        if range.from > range.to {
            return Ok(Vec::new());
        }

        let state = self.state.read();
        let start = (range.persistence_id.clone(), range.from);
        let end = (range.persistence_id.clone(), range.to);
        Ok(state
            .by_stream
            .range(start..=end)
            .filter_map(|(_, key)| state.visible_row(key))
            .filter(|row| range.include_deleted || !row.deleted)
            .take(range.limit)
            .cloned()
            .collect())
    }

    async fn query_by_tag(&self, range: &TagRange) -> BackendResult<Vec<JournalRow>> {
        CallCounters::bump(&self.calls.tag_queries);
        if range.after >= range.to {
            return Ok(Vec::new());
        }

        let state = self.state.read();
        let start = (range.tag.clone(), range.after.next());
        let end = (range.tag.clone(), range.to);
        Ok(state
            .by_tag
            .range(start..=end)
            .filter_map(|(_, key)| state.visible_row(key))
            .filter(|row| !row.deleted)
            .take(range.limit)
            .cloned()
            .collect())
    }

    async fn max_ordering(&self) -> BackendResult<OrderingNr> {
        CallCounters::bump(&self.calls.max_probes);
        self.probe_delay().await;
        let state = self.state.read();
        Ok(state
            .by_ordering
            .iter()
            .rev()
            .find(|(_, key)| state.visible_row(key).is_some())
            .map_or(OrderingNr::ZERO, |(ordering, _)| *ordering))
    }

    async fn scan_orderings(
        &self,
        after: OrderingNr,
        to: OrderingNr,
        limit: usize,
    ) -> BackendResult<Vec<OrderingNr>> {
        CallCounters::bump(&self.calls.scans);
        self.probe_delay().await;
        if after >= to {
            return Ok(Vec::new());
        }

        let state = self.state.read();
        Ok(state
            .by_ordering
            .range(after.next()..=to)
            .filter(|(_, key)| state.visible_row(key).is_some())
            .map(|(ordering, _)| *ordering)
            .take(limit)
            .collect())
    }

    async fn list_persistence_ids(
        &self,
        after: Option<&PersistenceId>,
        limit: usize,
    ) -> BackendResult<Vec<PersistenceId>> {
        CallCounters::bump(&self.calls.listings);
        let state = self.state.read();
        let lower = after.map_or(Bound::Unbounded, |after| Bound::Excluded(after.clone()));
        Ok(state
            .visible_streams
            .range((lower, Bound::Unbounded))
            .take(limit)
            .cloned()
            .collect())
    }
}
