//! The event store: append, load and correct aggregate histories.
//!
//! [`EventStore`] is a thin, stateless-per-call service over a [`Backend`].
//! Every operation acquires its own session and drops it on return.
//!
//! # Append protocol
//!
//! 1. Validate and encode the whole batch. Nothing is written if any event is
//!    rejected.
//! 2. Write the event records by id. A backend refuses a record whose version
//!    slot is taken by another record, so a writer racing on the same versions
//!    usually loses here.
//! 3. Commit by creating the aggregate record (first append) or moving its
//!    version from the original to the new version. This compare-and-set is
//!    the single commit point: of several appends from the same original
//!    version at most one gets past it.
//! 4. On failure, delete the records this call newly inserted.
//!
//! Readers only return versions up to the committed aggregate version, so
//! records left behind by a crash between steps 2 and 3 stay invisible until
//! [`EventStore::repair`] removes them.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::backend::{
    Backend, BackendError, BackendSession, EventFilter, EventPatch, EventQuery, Upserted,
};
use crate::errors::{ErrorKind, EventStoreError, EventStoreResult};
use crate::event::Event;
use crate::record::{AggregateRecord, EventRecord};
use crate::registry::EventTypeRegistry;
use crate::types::{AggregateId, EventId, EventType, Scope, Version};

/// Options for loading part of an aggregate's history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Maximum number of events to load (None = no limit)
    pub max_events: Option<usize>,
    /// Start loading from this version (inclusive). None = from the first event
    pub from_version: Option<Version>,
    /// Stop loading at this version (inclusive). None = to the committed version
    pub to_version: Option<Version>,
}

impl LoadOptions {
    /// Creates options that load the whole history.
    pub const fn new() -> Self {
        Self {
            max_events: None,
            from_version: None,
            to_version: None,
        }
    }

    /// Sets the maximum number of events to load.
    #[must_use]
    pub const fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = Some(max_events);
        self
    }

    /// Sets the starting version.
    #[must_use]
    pub const fn from_version(mut self, version: Version) -> Self {
        self.from_version = Some(version);
        self
    }

    /// Sets the ending version.
    #[must_use]
    pub const fn to_version(mut self, version: Version) -> Self {
        self.to_version = Some(version);
        self
    }
}

/// Outcome of [`EventStore::repair`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Number of uncommitted records deleted.
    pub removed: u64,
    /// Committed versions that have no record.
    pub missing: Vec<Version>,
}

impl RepairReport {
    /// Whether the aggregate's records matched its committed version exactly.
    pub fn is_clean(&self) -> bool {
        self.removed == 0 && self.missing.is_empty()
    }
}

/// Append-only, versioned event store over a shared backend client.
#[derive(Debug)]
pub struct EventStore<B> {
    backend: Arc<B>,
    registry: EventTypeRegistry,
}

impl<B> Clone for EventStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            registry: self.registry.clone(),
        }
    }
}

impl<B: Backend> EventStore<B> {
    /// Creates a store over `backend`, decoding payloads through `registry`.
    pub const fn new(backend: Arc<B>, registry: EventTypeRegistry) -> Self {
        Self { backend, registry }
    }

    /// The registry used to resolve payloads on load.
    pub const fn registry(&self) -> &EventTypeRegistry {
        &self.registry
    }

    /// The shared backend client.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Appends `events` to an aggregate currently at `original_version`.
    ///
    /// The events must all belong to the same aggregate of the scope's type and
    /// carry the versions `original_version + 1, original_version + 2, ...`.
    /// Returns the aggregate's new version.
    #[instrument(
        name = "event_store.append",
        skip(self, events),
        fields(scope = %scope, original_version = %original_version, event_count = events.len())
    )]
    pub async fn append(
        &self,
        scope: &Scope,
        events: &[Event],
        original_version: Version,
    ) -> EventStoreResult<Version> {
        let (aggregate_id, records, new_version) = encode_batch(scope, events, original_version)?;

        let mut session = self.session(scope, ErrorKind::CouldNotSaveAggregate).await?;
        let mut inserted = Vec::with_capacity(records.len());

        let outcome = write_batch(
            &mut session,
            scope,
            &aggregate_id,
            &records,
            original_version,
            new_version,
            &mut inserted,
        )
        .await;

        match outcome {
            Ok(()) => {
                info!(
                    aggregate_id = %aggregate_id,
                    new_version = %new_version,
                    "[event_store.append] committed events"
                );
                Ok(new_version)
            }
            Err(error) => {
                compensate(&mut session, scope, &inserted).await;
                Err(backend_failure(
                    ErrorKind::CouldNotSaveAggregate,
                    scope,
                    error,
                    "event_store.append",
                ))
            }
        }
    }

    /// Loads the full committed history of an aggregate.
    ///
    /// An aggregate that was never appended to has an empty history.
    pub async fn load(
        &self,
        scope: &Scope,
        aggregate_id: &AggregateId,
    ) -> EventStoreResult<Vec<Event>> {
        self.load_with(scope, aggregate_id, &LoadOptions::new()).await
    }

    /// Loads part of the committed history of an aggregate, ascending by version.
    #[instrument(
        name = "event_store.load",
        skip(self, options),
        fields(scope = %scope, aggregate_id = %aggregate_id)
    )]
    pub async fn load_with(
        &self,
        scope: &Scope,
        aggregate_id: &AggregateId,
        options: &LoadOptions,
    ) -> EventStoreResult<Vec<Event>> {
        if options.max_events == Some(0) {
            return Ok(Vec::new());
        }

        let mut session = self.session(scope, ErrorKind::CouldNotLoadAggregate).await?;
        let load_failure = |error| {
            backend_failure(ErrorKind::CouldNotLoadAggregate, scope, error, "event_store.load")
        };

        let Some(aggregate) = session
            .find_aggregate(scope, aggregate_id)
            .await
            .map_err(load_failure)?
        else {
            debug!("[event_store.load] aggregate has no events");
            return Ok(Vec::new());
        };

        let from_version = options.from_version.unwrap_or_else(Version::initial);
        let to_version = options
            .to_version
            .map_or(aggregate.version, |to| to.min(aggregate.version));
        if from_version > to_version {
            return Ok(Vec::new());
        }

        let query = EventQuery {
            aggregate_id: aggregate_id.clone(),
            from_version,
            to_version: Some(to_version),
            limit: options.max_events,
        };
        let records = session.find_events(scope, &query).await.map_err(load_failure)?;
        drop(session);

        let events = records
            .into_iter()
            .map(|record| {
                record.into_event(&self.registry).map_err(|error| {
                    error!(error = %error, "[event_store.load] could not decode stored payload");
                    EventStoreError::in_scope(ErrorKind::CouldNotUnmarshalEvent, scope)
                        .with_source(error)
                })
            })
            .collect::<EventStoreResult<Vec<_>>>()?;

        debug!(
            event_count = events.len(),
            committed_version = %aggregate.version,
            "[event_store.load] loaded events"
        );
        Ok(events)
    }

    /// Overwrites the type, payload and timestamp of an already committed event.
    ///
    /// The record is found by the event's aggregate id and version; its id and
    /// version stay the same and the aggregate's version does not move.
    #[instrument(
        name = "event_store.replace",
        skip(self, event),
        fields(scope = %scope, event = %event, aggregate_id = %event.aggregate_id())
    )]
    pub async fn replace(&self, scope: &Scope, event: &Event) -> EventStoreResult<()> {
        if event.aggregate_type() != scope.aggregate_type() {
            return Err(rejected(ErrorKind::InvalidEvent, scope, "aggregate type does not match scope"));
        }

        let mut session = self.session(scope, ErrorKind::CouldNotSaveAggregate).await?;
        let save_failure = |error| {
            backend_failure(ErrorKind::CouldNotSaveAggregate, scope, error, "event_store.replace")
        };

        let aggregate = session
            .find_aggregate(scope, event.aggregate_id())
            .await
            .map_err(save_failure)?
            .ok_or_else(|| EventStoreError::in_scope(ErrorKind::AggregateNotFound, scope))?;

        if event.version().is_initial() || event.version() > aggregate.version {
            return Err(rejected(ErrorKind::InvalidEvent, scope, "version is not committed"));
        }

        let data = event.payload().encode().map_err(|error| {
            EventStoreError::in_scope(ErrorKind::CouldNotMarshalEvent, scope).with_source(error)
        })?;

        let filter = EventFilter::Slot {
            aggregate_id: event.aggregate_id().clone(),
            version: event.version(),
        };
        let patch = EventPatch {
            event_type: Some(event.event_type().clone()),
            data: Some(data),
            timestamp: Some(event.timestamp()),
        };

        let updated = session
            .update_events(scope, &filter, &patch)
            .await
            .map_err(save_failure)?;
        if updated == 0 {
            return Err(rejected(ErrorKind::InvalidEvent, scope, "no record holds this version"));
        }

        info!("[event_store.replace] replaced event");
        Ok(())
    }

    /// Renames every event of type `from` in the scope to `to`.
    ///
    /// Returns the number of records renamed.
    #[instrument(
        name = "event_store.rename_event_type",
        skip(self),
        fields(scope = %scope, from = %from, to = %to)
    )]
    pub async fn rename_event_type(
        &self,
        scope: &Scope,
        from: &EventType,
        to: EventType,
    ) -> EventStoreResult<u64> {
        let mut session = self.session(scope, ErrorKind::CouldNotSaveAggregate).await?;

        let renamed = session
            .update_events(scope, &EventFilter::EventType(from.clone()), &EventPatch::rename(to))
            .await
            .map_err(|error| {
                backend_failure(
                    ErrorKind::CouldNotSaveAggregate,
                    scope,
                    error,
                    "event_store.rename_event_type",
                )
            })?;

        info!(renamed, "[event_store.rename_event_type] renamed events");
        Ok(renamed)
    }

    /// Drops every aggregate and event of the scope.
    #[instrument(name = "event_store.clear", skip(self), fields(scope = %scope))]
    pub async fn clear(&self, scope: &Scope) -> EventStoreResult<()> {
        let mut session = self.session(scope, ErrorKind::CouldNotClearDb).await?;

        session
            .drop_collections(scope)
            .await
            .map_err(|error| {
                backend_failure(ErrorKind::CouldNotClearDb, scope, error, "event_store.clear")
            })?;

        info!("[event_store.clear] dropped collections");
        Ok(())
    }

    /// The committed version of an aggregate, `None` if it has no events.
    #[instrument(
        name = "event_store.aggregate_version",
        skip(self),
        fields(scope = %scope, aggregate_id = %aggregate_id)
    )]
    pub async fn aggregate_version(
        &self,
        scope: &Scope,
        aggregate_id: &AggregateId,
    ) -> EventStoreResult<Option<Version>> {
        let mut session = self.session(scope, ErrorKind::CouldNotLoadAggregate).await?;

        let aggregate = session
            .find_aggregate(scope, aggregate_id)
            .await
            .map_err(|error| {
                backend_failure(
                    ErrorKind::CouldNotLoadAggregate,
                    scope,
                    error,
                    "event_store.aggregate_version",
                )
            })?;

        Ok(aggregate.map(|record| record.version))
    }

    /// Reconciles an aggregate's records with its committed version.
    ///
    /// Deletes records above the committed version (all of them if the
    /// aggregate was never committed) and reports committed versions without a
    /// record. Appends refused with [`BackendError::SlotHeld`] succeed again
    /// once the aggregate is repaired. Records of an append still in flight
    /// look the same as leftovers, so run it only while nobody appends to the
    /// aggregate.
    #[instrument(
        name = "event_store.repair",
        skip(self),
        fields(scope = %scope, aggregate_id = %aggregate_id)
    )]
    pub async fn repair(
        &self,
        scope: &Scope,
        aggregate_id: &AggregateId,
    ) -> EventStoreResult<RepairReport> {
        let mut session = self.session(scope, ErrorKind::CouldNotSaveAggregate).await?;
        let save_failure = |error| {
            backend_failure(ErrorKind::CouldNotSaveAggregate, scope, error, "event_store.repair")
        };

        let committed = session
            .find_aggregate(scope, aggregate_id)
            .await
            .map_err(save_failure)?
            .map_or_else(Version::initial, |record| record.version);
        let records = session
            .find_events(scope, &EventQuery::all(aggregate_id.clone()))
            .await
            .map_err(save_failure)?;

        let (kept, orphaned): (Vec<EventRecord>, Vec<EventRecord>) = records
            .into_iter()
            .partition(|record| !record.version.is_initial() && record.version <= committed);

        let orphan_ids: Vec<EventId> = orphaned.iter().map(|record| record.id).collect();
        let removed = if orphan_ids.is_empty() {
            0
        } else {
            session
                .delete_events(scope, &orphan_ids)
                .await
                .map_err(save_failure)?
        };

        let present: HashSet<Version> = kept.iter().map(|record| record.version).collect();
        let missing: Vec<Version> = (1..=committed.into_inner())
            .map(Version::new)
            .filter(|version| !present.contains(version))
            .collect();

        if missing.is_empty() {
            info!(removed, committed_version = %committed, "[event_store.repair] repaired aggregate");
        } else {
            warn!(
                removed,
                missing = missing.len(),
                committed_version = %committed,
                "[event_store.repair] committed versions have no record"
            );
        }

        Ok(RepairReport { removed, missing })
    }

    /// Shuts the shared backend client down.
    ///
    /// Every store sharing the client fails afterwards.
    #[instrument(name = "event_store.close", skip(self))]
    pub async fn close(&self) {
        self.backend.close().await;
        info!("[event_store.close] backend closed");
    }

    async fn session(&self, scope: &Scope, kind: ErrorKind) -> EventStoreResult<B::Session> {
        self.backend.acquire().await.map_err(|error| {
            error!(
                scope = %scope,
                error = %error,
                "[event_store.session] could not acquire backend session"
            );
            EventStoreError::in_scope(kind, scope).with_source(error)
        })
    }
}

/// Validates a batch and encodes it into records.
///
/// Returns the batch's aggregate id and the version it commits alongside the
/// records.
fn encode_batch(
    scope: &Scope,
    events: &[Event],
    original_version: Version,
) -> EventStoreResult<(AggregateId, Vec<EventRecord>, Version)> {
    let Some(first) = events.first() else {
        return Err(rejected(ErrorKind::NoEventsToAppend, scope, "empty batch"));
    };
    let aggregate_id = first.aggregate_id().clone();

    let overflow = || {
        rejected(
            ErrorKind::IncorrectEventVersion,
            scope,
            "versions run past the largest version",
        )
    };
    let new_version = original_version
        .advanced_by(events.len() as u64)
        .ok_or_else(overflow)?;

    let mut expected_version = original_version;
    let mut ids = HashSet::with_capacity(events.len());
    let mut records = Vec::with_capacity(events.len());

    for event in events {
        if event.aggregate_id() != &aggregate_id {
            return Err(rejected(ErrorKind::InvalidEvent, scope, "batch spans several aggregates"));
        }
        if event.aggregate_type() != scope.aggregate_type() {
            return Err(rejected(ErrorKind::InvalidEvent, scope, "aggregate type does not match scope"));
        }

        expected_version = expected_version.next().ok_or_else(overflow)?;
        if event.version() != expected_version {
            return Err(rejected(
                ErrorKind::IncorrectEventVersion,
                scope,
                "versions do not continue from the original version",
            ));
        }

        let record = EventRecord::from_event(event).map_err(|error| {
            warn!(event = %event, error = %error, "[event_store.append] could not encode payload");
            EventStoreError::in_scope(ErrorKind::CouldNotMarshalEvent, scope).with_source(error)
        })?;
        if !ids.insert(record.id) {
            return Err(rejected(ErrorKind::InvalidEvent, scope, "event id used twice in batch"));
        }
        records.push(record);
    }

    Ok((aggregate_id, records, new_version))
}

/// Writes the records and commits the new aggregate version.
///
/// Ids of records that did not exist before are pushed to `inserted` as they
/// are written, so the caller can undo them whatever step fails.
async fn write_batch<S: BackendSession>(
    session: &mut S,
    scope: &Scope,
    aggregate_id: &AggregateId,
    records: &[EventRecord],
    original_version: Version,
    new_version: Version,
    inserted: &mut Vec<EventId>,
) -> Result<(), BackendError> {
    // Stale writers are turned away before any record is touched.
    let current = session.find_aggregate(scope, aggregate_id).await?;
    match current {
        Some(record) if record.version != original_version || original_version.is_initial() => {
            return Err(BackendError::VersionMismatch {
                aggregate_id: aggregate_id.clone(),
                expected: original_version,
            });
        }
        None if !original_version.is_initial() => {
            return Err(BackendError::VersionMismatch {
                aggregate_id: aggregate_id.clone(),
                expected: original_version,
            });
        }
        _ => {}
    }

    for record in records {
        match session.upsert_event(scope, record).await {
            Ok(Upserted::Inserted) => inserted.push(record.id),
            Ok(Upserted::Replaced) => {}
            Err(refused @ BackendError::DuplicateKey { .. }) => {
                return Err(
                    explain_refused_write(session, scope, record, original_version, refused).await,
                );
            }
            Err(error) => return Err(error),
        }
    }

    if original_version.is_initial() {
        let created = session
            .insert_aggregate(scope, &AggregateRecord::new(aggregate_id.clone(), new_version))
            .await;
        match created {
            // Another first append committed in the meantime
            Err(BackendError::DuplicateKey { .. }) => Err(BackendError::VersionMismatch {
                aggregate_id: aggregate_id.clone(),
                expected: original_version,
            }),
            outcome => outcome,
        }
    } else {
        session
            .compare_and_set_version(scope, aggregate_id, original_version, new_version)
            .await
    }
}

/// Tells why a backend refused to store `record`.
///
/// A moved aggregate means another writer committed first. Otherwise the slot
/// is either held by a record the aggregate never committed, or the record's
/// id is already stored elsewhere and `refused` is returned as is.
async fn explain_refused_write<S: BackendSession>(
    session: &mut S,
    scope: &Scope,
    record: &EventRecord,
    original_version: Version,
    refused: BackendError,
) -> BackendError {
    let aggregate_id = &record.aggregate_id;
    let committed = match session.find_aggregate(scope, aggregate_id).await {
        Ok(aggregate) => aggregate.map_or_else(Version::initial, |aggregate| aggregate.version),
        Err(error) => return error,
    };
    if committed != original_version {
        return BackendError::VersionMismatch {
            aggregate_id: aggregate_id.clone(),
            expected: original_version,
        };
    }

    let slot = EventQuery {
        aggregate_id: aggregate_id.clone(),
        from_version: record.version,
        to_version: Some(record.version),
        limit: Some(1),
    };
    match session.find_events(scope, &slot).await {
        Ok(held) if held.iter().any(|stored| stored.id != record.id) => BackendError::SlotHeld {
            aggregate_id: aggregate_id.clone(),
            version: record.version,
        },
        Ok(_) => refused,
        Err(error) => error,
    }
}

/// Removes records a failed append inserted. Failures are logged, not raised.
async fn compensate<S: BackendSession>(session: &mut S, scope: &Scope, inserted: &[EventId]) {
    if inserted.is_empty() {
        return;
    }

    match session.delete_events(scope, inserted).await {
        Ok(removed) => debug!(removed, "[event_store.append] removed uncommitted records"),
        Err(error) => warn!(
            error = %error,
            orphaned = inserted.len(),
            "[event_store.append] could not remove uncommitted records"
        ),
    }
}

fn backend_failure(
    kind: ErrorKind,
    scope: &Scope,
    error: BackendError,
    operation: &'static str,
) -> EventStoreError {
    match &error {
        BackendError::VersionMismatch { .. } => warn!(
            scope = %scope,
            error = %error,
            "[{operation}] optimistic concurrency check failed"
        ),
        BackendError::SlotHeld { .. } => warn!(
            scope = %scope,
            error = %error,
            "[{operation}] uncommitted record blocks the aggregate, repair it"
        ),
        BackendError::DuplicateKey { .. } => warn!(
            scope = %scope,
            error = %error,
            "[{operation}] record id is already stored"
        ),
        _ => error!(
            scope = %scope,
            error = %error,
            "[{operation}] backend operation failed"
        ),
    }
    EventStoreError::in_scope(kind, scope).with_source(error)
}

fn rejected(kind: ErrorKind, scope: &Scope, reason: &'static str) -> EventStoreError {
    debug!(scope = %scope, kind = %kind, reason, "[event_store] rejected request");
    EventStoreError::in_scope(kind, scope)
}
