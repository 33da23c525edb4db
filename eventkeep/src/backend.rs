//! The port between [`crate::EventStore`] and a concrete backing store.
//!
//! A [`Backend`] is the long-lived client, created once and shared. Each store
//! operation acquires its own [`BackendSession`] and releases it by dropping
//! it, so no operation can leak a session on an early return.
//!
//! Backends provide exactly two atomic guarantees that the store builds its
//! optimistic concurrency on:
//!
//! - [`BackendSession::compare_and_set_version`] changes an aggregate's version
//!   only if it still holds the expected value;
//! - an event record can never take an `(aggregate_id, version)` slot that is
//!   held by a record with a different id, and a record never leaves the slot
//!   it was first written to.

use std::error::Error as StdError;
use std::fmt;

use async_trait::async_trait;

use crate::record::{AggregateRecord, EventRecord};
use crate::types::{AggregateId, EventId, EventType, Scope, Timestamp, Version};

/// Primitive a backend failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Obtaining a session.
    Acquire,
    /// Writing an event record by id.
    UpsertEvent,
    /// Creating an aggregate record.
    InsertAggregate,
    /// Advancing an aggregate record's version.
    CompareAndSetVersion,
    /// Reading an aggregate record.
    FindAggregate,
    /// Reading event records.
    FindEvents,
    /// Patching event records.
    UpdateEvents,
    /// Removing event records by id.
    DeleteEvents,
    /// Dropping a scope's collections.
    DropCollections,
}

impl Operation {
    /// Every primitive, in protocol order.
    pub const ALL: [Self; 9] = [
        Self::Acquire,
        Self::UpsertEvent,
        Self::InsertAggregate,
        Self::CompareAndSetVersion,
        Self::FindAggregate,
        Self::FindEvents,
        Self::UpdateEvents,
        Self::DeleteEvents,
        Self::DropCollections,
    ];
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Acquire => "acquire",
            Self::UpsertEvent => "upsert_event",
            Self::InsertAggregate => "insert_aggregate",
            Self::CompareAndSetVersion => "compare_and_set_version",
            Self::FindAggregate => "find_aggregate",
            Self::FindEvents => "find_events",
            Self::UpdateEvents => "update_events",
            Self::DeleteEvents => "delete_events",
            Self::DropCollections => "drop_collections",
        };
        f.write_str(name)
    }
}

/// Failure reported by a backend primitive.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A unique key is already taken.
    #[error("duplicate key {key} in {collection}")]
    DuplicateKey {
        /// Collection holding the conflicting document.
        collection: String,
        /// The key that was taken.
        key: String,
    },

    /// An aggregate's version no longer holds the expected value.
    #[error("aggregate {aggregate_id} is no longer at version {expected}")]
    VersionMismatch {
        /// Aggregate whose version moved.
        aggregate_id: AggregateId,
        /// Version the caller expected.
        expected: Version,
    },

    /// A version slot is held by a record its aggregate never committed.
    ///
    /// Raised by the store, not by backends. Such records are left behind by
    /// appends that stopped between writing records and committing; see
    /// [`crate::EventStore::repair`].
    #[error("version {version} of aggregate {aggregate_id} is held by an uncommitted record")]
    SlotHeld {
        /// Aggregate owning the slot.
        aggregate_id: AggregateId,
        /// The held version.
        version: Version,
    },

    /// The backend cannot serve requests (closed, unreachable, pool exhausted).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A stored document could not be read back into a record.
    #[error("invalid stored record: {0}")]
    InvalidRecord(String),

    /// Any other failure of a primitive.
    #[error("{operation} operation failed")]
    Failure {
        /// The failing primitive.
        operation: Operation,
        /// Driver error.
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },
}

impl BackendError {
    /// Wraps a driver error raised by `operation`.
    pub fn failure(
        operation: Operation,
        source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self::Failure {
            operation,
            source: source.into(),
        }
    }
}

/// Selection of one aggregate's event records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    /// Aggregate whose records are selected.
    pub aggregate_id: AggregateId,
    /// Lowest version selected, inclusive.
    pub from_version: Version,
    /// Highest version selected, inclusive. `None` selects to the end.
    pub to_version: Option<Version>,
    /// Maximum number of records returned. `None` returns all.
    pub limit: Option<usize>,
}

impl EventQuery {
    /// Selects every record of `aggregate_id`.
    pub fn all(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id,
            from_version: Version::initial(),
            to_version: None,
            limit: None,
        }
    }

    /// Whether `record` falls inside the version range of this query.
    pub fn matches(&self, record: &EventRecord) -> bool {
        record.aggregate_id == self.aggregate_id
            && record.version >= self.from_version
            && self.to_version.map_or(true, |to| record.version <= to)
    }
}

/// Selection of event records to patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// The record occupying one version slot of one aggregate.
    Slot {
        /// Owning aggregate.
        aggregate_id: AggregateId,
        /// Version slot.
        version: Version,
    },
    /// Every record carrying an event type.
    EventType(EventType),
}

impl EventFilter {
    /// Whether `record` is selected by this filter.
    pub fn matches(&self, record: &EventRecord) -> bool {
        match self {
            Self::Slot {
                aggregate_id,
                version,
            } => record.aggregate_id == *aggregate_id && record.version == *version,
            Self::EventType(event_type) => record.event_type == *event_type,
        }
    }
}

/// Fields to overwrite on selected event records. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPatch {
    /// New event type.
    pub event_type: Option<EventType>,
    /// New payload; `Some(None)` removes the payload.
    pub data: Option<Option<Vec<u8>>>,
    /// New timestamp.
    pub timestamp: Option<Timestamp>,
}

impl EventPatch {
    /// A patch changing only the event type.
    pub fn rename(to: EventType) -> Self {
        Self {
            event_type: Some(to),
            ..Self::default()
        }
    }

    /// Applies the patch to `record`.
    pub fn apply(&self, record: &mut EventRecord) {
        if let Some(event_type) = &self.event_type {
            record.event_type = event_type.clone();
        }
        if let Some(data) = &self.data {
            record.data.clone_from(data);
        }
        if let Some(timestamp) = self.timestamp {
            record.timestamp = timestamp;
        }
    }
}

/// Outcome of [`BackendSession::upsert_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    /// No record with the id existed.
    Inserted,
    /// A record with the id was overwritten.
    Replaced,
}

/// A long-lived client of a backing store.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Per-operation handle.
    type Session: BackendSession;

    /// Obtains a session. Sessions are released when dropped.
    async fn acquire(&self) -> Result<Self::Session, BackendError>;

    /// Shuts the client down. Later acquisitions fail.
    async fn close(&self);
}

/// Primitives a store operation runs against one backing store session.
#[async_trait]
pub trait BackendSession: Send {
    /// Writes `record` by id, creating or overwriting it.
    ///
    /// Overwriting is only allowed for a record stored in the same
    /// `(aggregate_id, version)` slot, as when a batch is written again. Fails
    /// with [`BackendError::DuplicateKey`] when another id already holds the
    /// record's slot, or when the id is stored in a different slot.
    async fn upsert_event(
        &mut self,
        scope: &Scope,
        record: &EventRecord,
    ) -> Result<Upserted, BackendError>;

    /// Creates an aggregate record. Fails with [`BackendError::DuplicateKey`]
    /// if the aggregate exists.
    async fn insert_aggregate(
        &mut self,
        scope: &Scope,
        record: &AggregateRecord,
    ) -> Result<(), BackendError>;

    /// Sets the aggregate's version to `new` if it is currently `expected`.
    ///
    /// Fails with [`BackendError::VersionMismatch`] otherwise, including when
    /// the aggregate does not exist.
    async fn compare_and_set_version(
        &mut self,
        scope: &Scope,
        aggregate_id: &AggregateId,
        expected: Version,
        new: Version,
    ) -> Result<(), BackendError>;

    /// Reads an aggregate record.
    async fn find_aggregate(
        &mut self,
        scope: &Scope,
        aggregate_id: &AggregateId,
    ) -> Result<Option<AggregateRecord>, BackendError>;

    /// Reads the records selected by `query`, ascending by version.
    async fn find_events(
        &mut self,
        scope: &Scope,
        query: &EventQuery,
    ) -> Result<Vec<EventRecord>, BackendError>;

    /// Applies `patch` to every record selected by `filter`. Returns the
    /// number of records changed.
    async fn update_events(
        &mut self,
        scope: &Scope,
        filter: &EventFilter,
        patch: &EventPatch,
    ) -> Result<u64, BackendError>;

    /// Removes records by id. Returns the number removed.
    async fn delete_events(&mut self, scope: &Scope, ids: &[EventId]) -> Result<u64, BackendError>;

    /// Drops both collections of `scope`. Dropping absent collections succeeds.
    async fn drop_collections(&mut self, scope: &Scope) -> Result<(), BackendError>;
}
