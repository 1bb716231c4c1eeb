//! Serializer collaborator.
//!
//! The journal never looks inside [`JournalRow::message`]. A serializer maps a
//! [`PersistentRepr`] to bytes on the way in and back on the way out. Row
//! identity, tags and the tombstone flag come from the row itself, so only
//! the payload and write metadata travel inside the message.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::SerializationError;
use crate::row::{JournalRow, PersistentRepr};
use crate::types::Timestamp;

/// Bidirectional mapping between events and stored messages.
pub trait JournalSerializer<E>: Send + Sync {
    /// Encodes an event into the bytes stored in [`JournalRow::message`].
    fn serialize(&self, event: &PersistentRepr<E>) -> Result<Vec<u8>, SerializationError>;

    /// Decodes a stored row back into an event.
    fn deserialize(&self, row: &JournalRow) -> Result<PersistentRepr<E>, SerializationError>;
}

#[derive(Serialize)]
struct EnvelopeRef<'a, E> {
    manifest: &'a str,
    timestamp: Timestamp,
    writer_uuid: Option<Uuid>,
    payload: &'a E,
}

#[derive(Deserialize)]
struct Envelope<E> {
    #[allow(dead_code)]
    manifest: String,
    timestamp: Timestamp,
    writer_uuid: Option<Uuid>,
    payload: E,
}

/// JSON serializer built on serde.
///
/// The stored message is a JSON object holding the payload, its type name,
/// the event timestamp and the writer id.
pub struct JsonSerializer<E> {
    _event: PhantomData<fn() -> E>,
}

impl<E> JsonSerializer<E> {
    /// Creates a new JSON serializer.
    pub const fn new() -> Self {
        Self {
            _event: PhantomData,
        }
    }
}

impl<E> Default for JsonSerializer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for JsonSerializer<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSerializer")
            .field("event", &std::any::type_name::<E>())
            .finish()
    }
}

impl<E> JournalSerializer<E> for JsonSerializer<E>
where
    E: Serialize + DeserializeOwned,
{
    fn serialize(&self, event: &PersistentRepr<E>) -> Result<Vec<u8>, SerializationError> {
        let envelope = EnvelopeRef {
            manifest: std::any::type_name::<E>(),
            timestamp: event.timestamp,
            writer_uuid: event.writer_uuid,
            payload: &event.payload,
        };
        serde_json::to_vec(&envelope).map_err(|error| SerializationError::Serialize {
            persistence_id: event.persistence_id.clone(),
            sequence_nr: event.sequence_nr,
            detail: error.to_string(),
        })
    }

    fn deserialize(&self, row: &JournalRow) -> Result<PersistentRepr<E>, SerializationError> {
        let envelope: Envelope<E> =
            serde_json::from_slice(&row.message).map_err(|error| {
                SerializationError::Deserialize {
                    persistence_id: row.persistence_id.clone(),
                    sequence_nr: row.sequence_nr,
                    detail: error.to_string(),
                }
            })?;

        Ok(PersistentRepr {
            persistence_id: row.persistence_id.clone(),
            sequence_nr: row.sequence_nr,
            payload: envelope.payload,
            tags: row.tags.clone(),
            timestamp: envelope.timestamp,
            writer_uuid: envelope.writer_uuid,
            deleted: row.deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderingNr, PersistenceId, SequenceNr, Tag};
    use std::collections::BTreeSet;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    enum AccountEvent {
        Opened { owner: String },
        Deposited { amount: u64 },
    }

    fn row_for(message: Vec<u8>) -> JournalRow {
        JournalRow {
            persistence_id: PersistenceId::try_new("account-1").unwrap(),
            sequence_nr: SequenceNr::new(2),
            deleted: false,
            message,
            ordering: OrderingNr::new(17),
            tags: BTreeSet::from([Tag::try_new("accounts").unwrap()]),
        }
    }

    #[test]
    fn decoded_event_takes_identity_and_tags_from_row() {
        let serializer = JsonSerializer::<AccountEvent>::new();
        let event = PersistentRepr::new(
            PersistenceId::try_new("account-1").unwrap(),
            SequenceNr::new(2),
            AccountEvent::Deposited { amount: 40 },
        );

        let bytes = serializer.serialize(&event).unwrap();
        let decoded = serializer.deserialize(&row_for(bytes)).unwrap();

        assert_eq!(decoded.payload, AccountEvent::Deposited { amount: 40 });
        assert_eq!(decoded.timestamp, event.timestamp);
        assert_eq!(decoded.sequence_nr, SequenceNr::new(2));
        assert!(decoded.tags.contains(&Tag::try_new("accounts").unwrap()));
    }

    #[test]
    fn garbage_message_fails_for_that_row_only() {
        let serializer = JsonSerializer::<AccountEvent>::new();
        let error = serializer
            .deserialize(&row_for(b"not json".to_vec()))
            .unwrap_err();

        match error {
            SerializationError::Deserialize {
                persistence_id,
                sequence_nr,
                ..
            } => {
                assert_eq!(persistence_id.as_ref(), "account-1");
                assert_eq!(sequence_nr, SequenceNr::new(2));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn payload_of_wrong_shape_is_a_deserialize_error() {
        let writer = JsonSerializer::<String>::new();
        let bytes = writer
            .serialize(&PersistentRepr::new(
                PersistenceId::try_new("account-1").unwrap(),
                SequenceNr::new(2),
                "plain text".to_string(),
            ))
            .unwrap();

        let reader = JsonSerializer::<AccountEvent>::new();
        assert!(reader.deserialize(&row_for(bytes)).is_err());
    }

    #[test]
    fn opened_event_is_stored_with_manifest() {
        let serializer = JsonSerializer::<AccountEvent>::new();
        let bytes = serializer
            .serialize(&PersistentRepr::new(
                PersistenceId::try_new("account-1").unwrap(),
                SequenceNr::new(1),
                AccountEvent::Opened {
                    owner: "ada".to_string(),
                },
            ))
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert!(json["manifest"]
            .as_str()
            .unwrap()
            .ends_with("AccountEvent"));
        assert_eq!(json["payload"]["Opened"]["owner"], "ada");
    }
}
