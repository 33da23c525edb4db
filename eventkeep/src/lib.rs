//! `eventkeep` - Append-only, versioned event log for event-sourced aggregates
//!
//! Each aggregate owns an ordered history of events numbered `1, 2, 3, ...`.
//! Writers append after reading the aggregate at some version and the store
//! accepts the batch only if nobody else appended in between (optimistic
//! concurrency control). Readers replay the history, or a slice of it, to
//! rebuild aggregate state.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use eventkeep::{EventStore, EventTypeRegistry, Scope, Version};
//!
//! let store = EventStore::new(Arc::new(backend), EventTypeRegistry::new());
//! let version = store.append(&scope, &events, Version::initial()).await?;
//! let history = store.load(&scope, &aggregate_id).await?;
//! ```
//!
//! Storage is pluggable through the [`Backend`] port; see the
//! `eventkeep-memory` and `eventkeep-postgres` crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod errors;
pub mod event;
pub mod record;
pub mod registry;
pub mod store;
pub mod types;
mod validation;

pub use backend::{
    Backend, BackendError, BackendSession, EventFilter, EventPatch, EventQuery, Operation,
    Upserted,
};
pub use errors::{ErrorContext, ErrorKind, EventStoreError, EventStoreResult};
pub use event::{Event, EventData, Payload};
pub use record::{AggregateRecord, EventRecord, RecordDecodeError};
pub use registry::{EventDecoder, EventTypeRegistry, RegistryBuilder, RegistryError};
pub use store::{EventStore, LoadOptions, RepairReport};
pub use types::{
    AggregateId, AggregateType, EventId, EventType, Namespace, Scope, Timestamp, Version,
};
