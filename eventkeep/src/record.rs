//! Persisted forms of events and aggregates.
//!
//! These are the documents backends store. [`EventRecord`] is an [`Event`] with
//! its payload encoded; [`AggregateRecord`] holds the committed version of one
//! aggregate and is the commit point of every append.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::event::{Event, Payload};
use crate::registry::EventTypeRegistry;
use crate::types::{AggregateId, AggregateType, EventId, EventType, Timestamp, Version};

/// Stored form of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique record id.
    #[serde(rename = "_id")]
    pub id: EventId,
    /// Type of the owning aggregate.
    pub aggregate_type: AggregateType,
    /// Id of the owning aggregate.
    pub aggregate_id: AggregateId,
    /// Event type tag.
    pub event_type: EventType,
    /// Encoded payload, absent when the event carries no data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    /// When the event occurred.
    pub timestamp: Timestamp,
    /// Position within the aggregate, starting at 1.
    pub version: Version,
}

/// Why a stored record could not be turned back into an [`Event`].
#[derive(Debug, thiserror::Error)]
#[error("could not decode payload of {event_type}@{version}")]
pub struct RecordDecodeError {
    /// Event type of the record.
    pub event_type: EventType,
    /// Version of the record.
    pub version: Version,
    /// Codec failure.
    #[source]
    pub source: serde_json::Error,
}

impl EventRecord {
    /// Encodes an event into its stored form, generating an id if it has none.
    pub fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: event.id().unwrap_or_else(EventId::generate),
            aggregate_type: event.aggregate_type().clone(),
            aggregate_id: event.aggregate_id().clone(),
            event_type: event.event_type().clone(),
            data: event.payload().encode()?,
            timestamp: event.timestamp(),
            version: event.version(),
        })
    }

    /// Materializes the record, resolving its payload through `registry`.
    ///
    /// Records of unregistered types keep their bytes as [`Payload::Raw`].
    pub fn into_event(self, registry: &EventTypeRegistry) -> Result<Event, RecordDecodeError> {
        let payload = match (self.data, registry.resolve(&self.event_type)) {
            (None, _) => Payload::Empty,
            (Some(bytes), None) => Payload::Raw(bytes),
            (Some(bytes), Some(decode)) => match decode(&bytes) {
                Ok(data) => Payload::Resolved(Arc::from(data)),
                Err(source) => {
                    return Err(RecordDecodeError {
                        event_type: self.event_type,
                        version: self.version,
                        source,
                    })
                }
            },
        };

        Ok(Event::with_payload(
            self.event_type,
            payload,
            self.timestamp,
            self.aggregate_type,
            self.aggregate_id,
            self.version,
        )
        .with_id(self.id))
    }
}

/// Stored form of an aggregate: its id and committed version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRecord {
    /// Id of the aggregate.
    #[serde(rename = "_id")]
    pub aggregate_id: AggregateId,
    /// Number of committed events.
    pub version: Version,
}

impl AggregateRecord {
    /// Creates an aggregate record.
    pub const fn new(aggregate_id: AggregateId, version: Version) -> Self {
        Self {
            aggregate_id,
            version,
        }
    }
}
