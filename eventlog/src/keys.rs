//! Primary key resolution for journal rows.
//!
//! Key-value backends address rows by a partition key and a sort key. The
//! strategy used to derive them is chosen in [`JournalConfig`] and injected
//! into the backend at construction time.
//!
//! [`JournalConfig`]: crate::config::JournalConfig

use serde::{Deserialize, Serialize};

use crate::config::ShardCount;
use crate::types::{PersistenceId, SequenceNr};

/// Resolved primary key of a row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    /// Key the backend partitions on.
    pub partition_key: String,
    /// Key rows are sorted by inside a partition.
    pub sort_key: String,
}

/// Derives storage keys from a row's identity.
pub trait KeyResolver {
    /// Partition key for the row.
    fn partition_key(&self, persistence_id: &PersistenceId, sequence_nr: SequenceNr) -> String;

    /// Sort key for the row.
    fn sort_key(&self, persistence_id: &PersistenceId, sequence_nr: SequenceNr) -> String;

    /// Both keys at once.
    fn resolve(&self, persistence_id: &PersistenceId, sequence_nr: SequenceNr) -> RowKey {
        RowKey {
            partition_key: self.partition_key(persistence_id, sequence_nr),
            sort_key: self.sort_key(persistence_id, sequence_nr),
        }
    }
}

/// Built-in key strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyStrategy {
    /// One partition per stream.
    #[default]
    PersistenceId,
    /// Spread each stream over `shard_count` partitions by sequence number,
    /// avoiding hot partitions for long-lived streams.
    SequenceNumberSharded {
        /// Number of partitions per stream.
        shard_count: ShardCount,
    },
}

impl KeyResolver for KeyStrategy {
    fn partition_key(&self, persistence_id: &PersistenceId, sequence_nr: SequenceNr) -> String {
        match self {
            Self::PersistenceId => persistence_id.to_string(),
            Self::SequenceNumberSharded { shard_count } => {
                let shard = sequence_nr.value() % shard_count.into_inner();
                format!("{persistence_id}-{shard}")
            }
        }
    }

    fn sort_key(&self, _persistence_id: &PersistenceId, sequence_nr: SequenceNr) -> String {
        format!("{:020}", sequence_nr.value())
    }
}
