//! Journal data access: the write path and the read path.
//!
//! [`JournalDao`] is the only component that talks to the backend on behalf
//! of callers. It assigns ordering values, keeps per-stream write ordering for
//! `highest_sequence_nr`, and turns paginated backend queries into lazily
//! consumed streams.

mod in_flight;
mod read;
mod write;

use std::sync::Arc;

use uuid::Uuid;

use crate::backend::JournalBackend;
use crate::config::JournalConfig;
use crate::row::{Decoded, JournalRow};
use crate::serialization::JournalSerializer;

use in_flight::InFlightWrites;

pub use read::ReplayRequest;

/// Data access object over a [`JournalBackend`].
///
/// Cloning is cheap and clones share the backend, the serializer and the
/// in-flight write registry.
pub struct JournalDao<E> {
    backend: Arc<dyn JournalBackend>,
    serializer: Arc<dyn JournalSerializer<E>>,
    config: JournalConfig,
    in_flight: InFlightWrites,
    writer_uuid: Uuid,
}

impl<E> Clone for JournalDao<E> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            serializer: Arc::clone(&self.serializer),
            config: self.config.clone(),
            in_flight: self.in_flight.clone(),
            writer_uuid: self.writer_uuid,
        }
    }
}

impl<E> std::fmt::Debug for JournalDao<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalDao")
            .field("config", &self.config)
            .field("writer_uuid", &self.writer_uuid)
            .finish_non_exhaustive()
    }
}

impl<E> JournalDao<E>
where
    E: Send + Sync + 'static,
{
    /// Creates a DAO with its own writer identity.
    pub fn new(
        backend: Arc<dyn JournalBackend>,
        serializer: Arc<dyn JournalSerializer<E>>,
        config: JournalConfig,
    ) -> Self {
        Self {
            backend,
            serializer,
            config,
            in_flight: InFlightWrites::default(),
            writer_uuid: Uuid::now_v7(),
        }
    }

    /// The backend this DAO writes to.
    pub fn backend(&self) -> Arc<dyn JournalBackend> {
        Arc::clone(&self.backend)
    }

    /// The configuration this DAO was built with.
    pub const fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Identity stamped on every event this DAO writes.
    pub const fn writer_uuid(&self) -> Uuid {
        self.writer_uuid
    }

    fn decode(&self, row: JournalRow) -> Decoded<E> {
        let result = self.serializer.deserialize(&row);
        Decoded { row, result }
    }
}
