//! Registry of writes that have not completed yet, keyed by stream.
//!
//! A `highest_sequence_nr` read that overlaps a write to the same stream must
//! see that write's outcome, otherwise it can return a stale sequence number.
//! The registry lets the read wait for the write to finish, successfully or
//! not. Writes to different streams never wait on each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use crate::types::PersistenceId;

struct Entry {
    write_id: u64,
    done: watch::Receiver<bool>,
}

/// Tracks at most one in-flight write per persistence id.
#[derive(Clone, Default)]
pub(crate) struct InFlightWrites {
    entries: Arc<Mutex<HashMap<PersistenceId, Entry>>>,
    next_id: Arc<AtomicU64>,
}

impl InFlightWrites {
    /// Registers a write touching `persistence_ids`. The write is considered
    /// complete when the returned guard is dropped.
    pub(crate) fn begin(&self, persistence_ids: Vec<PersistenceId>) -> WriteGuard {
        let write_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = watch::channel(false);

        {
            let mut entries = self.entries.lock();
            for persistence_id in &persistence_ids {
                entries.insert(
                    persistence_id.clone(),
                    Entry {
                        write_id,
                        done: done_rx.clone(),
                    },
                );
            }
        }

        WriteGuard {
            registry: self.clone(),
            write_id,
            persistence_ids,
            done: done_tx,
        }
    }

    /// Waits until the write currently registered for `persistence_id`, if
    /// any, has finished.
    pub(crate) async fn wait_for(&self, persistence_id: &PersistenceId) {
        let pending = self
            .entries
            .lock()
            .get(persistence_id)
            .map(|entry| entry.done.clone());

        if let Some(mut done) = pending {
            trace!(%persistence_id, "waiting for in-flight write");
            // A dropped sender also means the write is over.
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn finish(&self, write_id: u64, persistence_ids: &[PersistenceId]) {
        let mut entries = self.entries.lock();
        for persistence_id in persistence_ids {
            if entries
                .get(persistence_id)
                .is_some_and(|entry| entry.write_id == write_id)
            {
                entries.remove(persistence_id);
            }
        }
    }
}

/// Marks a write as in flight until dropped.
pub(crate) struct WriteGuard {
    registry: InFlightWrites,
    write_id: u64,
    persistence_ids: Vec<PersistenceId>,
    done: watch::Sender<bool>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.done.send_replace(true);
        self.registry.finish(self.write_id, &self.persistence_ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pid(value: &str) -> PersistenceId {
        PersistenceId::try_new(value).unwrap()
    }

    #[test]
    fn wait_is_ready_without_writes() {
        let registry = InFlightWrites::default();
        let p1 = pid("p1");
        let mut wait = tokio_test::task::spawn(registry.wait_for(&p1));
        tokio_test::assert_ready!(wait.poll());
    }

    #[test]
    fn dropping_the_guard_wakes_the_waiter() {
        let registry = InFlightWrites::default();
        let guard = registry.begin(vec![pid("p1")]);
        let p1 = pid("p1");
        let mut wait = tokio_test::task::spawn(registry.wait_for(&p1));
        tokio_test::assert_pending!(wait.poll());

        drop(guard);
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_guard_dropped() {
        let registry = InFlightWrites::default();
        let guard = registry.begin(vec![pid("p1")]);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_for(&pid("p1")).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn other_streams_do_not_wait() {
        let registry = InFlightWrites::default();
        let _guard = registry.begin(vec![pid("p1")]);

        tokio::time::timeout(Duration::from_millis(50), registry.wait_for(&pid("p2")))
            .await
            .expect("p2 has no write in flight");
    }

    #[test]
    fn newer_write_replaces_older_entry() {
        let registry = InFlightWrites::default();
        let first = registry.begin(vec![pid("p1")]);
        let second = registry.begin(vec![pid("p1")]);

        drop(first);
        assert_eq!(registry.len(), 1, "older guard must not evict newer write");

        drop(second);
        assert_eq!(registry.len(), 0);
    }
}
