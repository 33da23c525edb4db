//! Event type registry for resolving stored payloads into concrete types.
//!
//! The registry maps an [`EventType`] tag to a decoder that turns stored bytes
//! into the Rust type registered under that tag. Loads consult it for every
//! record: registered types come back as [`crate::Payload::Resolved`], unknown
//! types keep their bytes as [`crate::Payload::Raw`] so newer producers never
//! break older readers.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;

use crate::event::EventData;
use crate::types::EventType;

/// Error types specific to the event type registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A type name is already registered with a different Rust type.
    #[error("event type '{event_type}' is already registered with a different type")]
    TypeNameConflict {
        /// The conflicting event type
        event_type: EventType,
    },
}

/// Type-erased decoder turning stored bytes into a payload.
pub type EventDecoder =
    Arc<dyn Fn(&[u8]) -> Result<Box<dyn EventData>, serde_json::Error> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    type_id: TypeId,
    decode: EventDecoder,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("type_id", &self.type_id)
            .field("decode", &"<function>")
            .finish()
    }
}

/// Shared, thread-safe map from event type tags to payload decoders.
///
/// Clones are handles onto the same registry, so a type registered through one
/// clone is visible to every store holding another.
#[derive(Debug, Clone, Default)]
pub struct EventTypeRegistry {
    types: Arc<RwLock<HashMap<EventType, Registration>>>,
}

impl EventTypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` as the payload type of `event_type`.
    ///
    /// Registering the same type twice is a no-op. Registering a different
    /// type under a taken name fails and leaves the existing entry in place.
    pub fn register<T>(&self, event_type: EventType) -> Result<(), RegistryError>
    where
        T: DeserializeOwned + EventData,
    {
        let type_id = TypeId::of::<T>();
        let mut types = self.types.write();

        if let Some(existing) = types.get(&event_type) {
            if existing.type_id != type_id {
                return Err(RegistryError::TypeNameConflict { event_type });
            }
            return Ok(());
        }

        let decode: EventDecoder = Arc::new(|bytes: &[u8]| {
            let data: T = serde_json::from_slice(bytes)?;
            Ok(Box::new(data) as Box<dyn EventData>)
        });
        types.insert(event_type, Registration { type_id, decode });
        drop(types);

        Ok(())
    }

    /// Removes the registration for `event_type`. Returns whether one existed.
    pub fn unregister(&self, event_type: &EventType) -> bool {
        self.types.write().remove(event_type).is_some()
    }

    /// Whether `event_type` has a registered payload type.
    pub fn is_registered(&self, event_type: &EventType) -> bool {
        self.types.read().contains_key(event_type)
    }

    /// All registered event types, sorted.
    pub fn registered_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self.types.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Looks up the decoder for `event_type`.
    pub fn resolve(&self, event_type: &EventType) -> Option<EventDecoder> {
        self.types
            .read()
            .get(event_type)
            .map(|registration| Arc::clone(&registration.decode))
    }
}

/// Builder for constructing registries with multiple types.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: EventTypeRegistry,
}

impl RegistryBuilder {
    /// Creates a builder over an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `event_type`.
    pub fn register<T>(self, event_type: EventType) -> Result<Self, RegistryError>
    where
        T: DeserializeOwned + EventData,
    {
        self.registry.register::<T>(event_type)?;
        Ok(self)
    }

    /// Builds the registry.
    pub fn build(self) -> EventTypeRegistry {
        self.registry
    }
}
