//! The runtime view of a stored event.
//!
//! An [`Event`] is what producers hand to [`crate::EventStore::append`] and what
//! [`crate::EventStore::load`] hands back. Its payload is a [`Payload`]: either
//! nothing, raw bytes of a type the registry does not know, or a concrete value
//! materialized through the [`crate::EventTypeRegistry`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::types::{AggregateId, AggregateType, EventId, EventType, Timestamp, Version};

/// Object-safe view of an event payload.
///
/// Implemented for every serializable type, so domain events never implement
/// it by hand.
pub trait EventData: Any + Send + Sync + fmt::Debug {
    /// Encodes the payload into its stored form.
    fn encode(&self) -> Result<Vec<u8>, serde_json::Error>;

    /// Exposes the payload for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T> EventData for T
where
    T: Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Payload carried by an [`Event`].
#[derive(Debug, Clone)]
pub enum Payload {
    /// The event carries no data.
    Empty,
    /// Stored bytes whose event type is not registered.
    Raw(Vec<u8>),
    /// A concrete payload value.
    Resolved(Arc<dyn EventData>),
}

impl Payload {
    /// Encodes the payload for storage. `Empty` has no stored form.
    pub fn encode(&self) -> Result<Option<Vec<u8>>, serde_json::Error> {
        match self {
            Self::Empty => Ok(None),
            Self::Raw(bytes) => Ok(Some(bytes.clone())),
            Self::Resolved(data) => data.encode().map(Some),
        }
    }

    /// Whether the event carries no data.
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// A domain event positioned within an aggregate's history.
#[derive(Debug, Clone)]
pub struct Event {
    id: Option<EventId>,
    event_type: EventType,
    aggregate_type: AggregateType,
    aggregate_id: AggregateId,
    version: Version,
    timestamp: Timestamp,
    payload: Payload,
}

impl Event {
    /// Creates an event carrying `data`.
    pub fn new<D: EventData>(
        event_type: EventType,
        data: D,
        timestamp: Timestamp,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        version: Version,
    ) -> Self {
        Self::with_payload(
            event_type,
            Payload::Resolved(Arc::new(data)),
            timestamp,
            aggregate_type,
            aggregate_id,
            version,
        )
    }

    /// Creates an event that carries no data.
    pub fn without_data(
        event_type: EventType,
        timestamp: Timestamp,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        version: Version,
    ) -> Self {
        Self::with_payload(
            event_type,
            Payload::Empty,
            timestamp,
            aggregate_type,
            aggregate_id,
            version,
        )
    }

    /// Creates an event from an explicit payload.
    pub const fn with_payload(
        event_type: EventType,
        payload: Payload,
        timestamp: Timestamp,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        version: Version,
    ) -> Self {
        Self {
            id: None,
            event_type,
            aggregate_type,
            aggregate_id,
            version,
            timestamp,
            payload,
        }
    }

    /// Sets the record id. Events without one get a generated id when appended.
    #[must_use]
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    /// The record id, if assigned.
    pub const fn id(&self) -> Option<EventId> {
        self.id
    }

    /// The event type tag.
    pub const fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// The type of the owning aggregate.
    pub const fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_type
    }

    /// The id of the owning aggregate.
    pub const fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    /// Position of the event within its aggregate.
    pub const fn version(&self) -> Version {
        self.version
    }

    /// When the event occurred.
    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The payload.
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The resolved payload, if the event type was registered.
    pub fn data(&self) -> Option<&dyn EventData> {
        match &self.payload {
            Payload::Resolved(data) => Some(data.as_ref()),
            Payload::Empty | Payload::Raw(_) => None,
        }
    }

    /// The resolved payload as a concrete type.
    pub fn data_as<T: 'static>(&self) -> Option<&T> {
        self.data().and_then(|data| data.as_any().downcast_ref::<T>())
    }

    /// The stored bytes of an event whose type is not registered.
    pub fn raw_data(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Raw(bytes) => Some(bytes),
            Payload::Empty | Payload::Resolved(_) => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.event_type, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ItemAdded {
        sku: String,
        quantity: u32,
    }

    fn item_added(version: u64) -> Event {
        Event::new(
            EventType::try_new("ItemAdded").unwrap(),
            ItemAdded {
                sku: "sku-1".to_string(),
                quantity: 2,
            },
            Timestamp::now(),
            AggregateType::try_new("Cart").unwrap(),
            AggregateId::try_new("cart-1").unwrap(),
            Version::new(version),
        )
    }

    #[test]
    fn displays_as_type_at_version() {
        assert_eq!(item_added(3).to_string(), "ItemAdded@3");
    }

    #[test]
    fn resolved_payload_downcasts_to_concrete_type() {
        let event = item_added(1);

        let data = event.data_as::<ItemAdded>().expect("payload should downcast");
        assert_eq!(data.quantity, 2);
        assert!(event.data_as::<String>().is_none());
        assert!(event.raw_data().is_none());
    }

    #[test]
    fn resolved_payload_encodes_as_json() {
        let event = item_added(1);

        let bytes = event.payload().encode().unwrap().unwrap();
        let decoded: ItemAdded = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.sku, "sku-1");
    }

    #[test]
    fn empty_payload_has_no_stored_form() {
        let event = Event::without_data(
            EventType::try_new("CartOpened").unwrap(),
            Timestamp::now(),
            AggregateType::try_new("Cart").unwrap(),
            AggregateId::try_new("cart-1").unwrap(),
            Version::new(1),
        );

        assert!(event.payload().is_empty());
        assert!(event.payload().encode().unwrap().is_none());
        assert!(event.data().is_none());
    }

    #[test]
    fn raw_payload_passes_bytes_through() {
        let payload = Payload::Raw(b"{\"legacy\":true}".to_vec());
        assert_eq!(
            payload.encode().unwrap().as_deref(),
            Some(&b"{\"legacy\":true}"[..])
        );
    }

    #[test]
    fn with_id_assigns_record_id() {
        let id = EventId::generate();
        let event = item_added(1).with_id(id);
        assert_eq!(event.id(), Some(id));
    }
}
