//! Acceptance scenarios every [`Backend`] must pass.
//!
//! Each `test_*` function builds a fresh [`EventStore`] over a backend from
//! `make_backend`, works in its own uniquely named scope, and reports the first
//! broken expectation as a [`ContractTestFailure`]. Backend crates run the whole
//! suite through [`event_store_contract_tests!`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use eventkeep::{
    AggregateId, AggregateType, Backend, BackendSession, ErrorKind, Event, EventRecord,
    EventStore, EventStoreError, EventStoreResult, EventType, EventTypeRegistry, LoadOptions,
    Namespace, Payload, Scope, Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Barrier;
use uuid::Uuid;

/// A broken expectation, tagged with the scenario it belongs to.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(
        scenario: &'static str,
        operation: &'static str,
        error: &EventStoreError,
    ) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

/// Payload registered under [`CONTRACT_EVENT_TYPE`] by the contract scenarios.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractEvent {
    /// Free-form marker used to tell events apart.
    pub label: String,
}

/// Event type the contract scenarios register [`ContractEvent`] under.
pub const CONTRACT_EVENT_TYPE: &str = "ContractEvent";

const CONTRACT_NAMESPACE: &str = "contract";

fn contract_scope(scenario: &'static str) -> Result<Scope, ContractTestFailure> {
    // Unique aggregate type so scenarios can share one database
    let raw = format!("{scenario}_{}", Uuid::now_v7().simple());

    let aggregate_type = AggregateType::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(
            scenario,
            format!("unable to construct aggregate type `{raw}`: {error}"),
        )
    })?;
    let namespace = Namespace::try_new(CONTRACT_NAMESPACE).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("unable to construct namespace: {error}"))
    })?;

    Ok(Scope::new(namespace, aggregate_type))
}

fn contract_aggregate_id(
    scenario: &'static str,
    label: &str,
) -> Result<AggregateId, ContractTestFailure> {
    let raw = format!("{scenario}-{label}-{}", Uuid::now_v7());

    AggregateId::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(
            scenario,
            format!("unable to construct aggregate id `{raw}`: {error}"),
        )
    })
}

fn contract_event_type(
    scenario: &'static str,
    name: &str,
) -> Result<EventType, ContractTestFailure> {
    EventType::try_new(name).map_err(|error| {
        ContractTestFailure::assertion(
            scenario,
            format!("unable to construct event type `{name}`: {error}"),
        )
    })
}

// Whole seconds survive every backend's timestamp precision.
fn contract_timestamp(
    scenario: &'static str,
    seconds: i64,
) -> Result<Timestamp, ContractTestFailure> {
    DateTime::<Utc>::from_timestamp(1_700_000_000 + seconds, 0)
        .map(Timestamp::new)
        .ok_or_else(|| ContractTestFailure::assertion(scenario, "timestamp out of range"))
}

fn contract_store<F, B>(
    scenario: &'static str,
    make_backend: &F,
) -> Result<EventStore<B>, ContractTestFailure>
where
    F: Fn() -> B,
    B: Backend,
{
    let registry = EventTypeRegistry::new();
    registry
        .register::<ContractEvent>(contract_event_type(scenario, CONTRACT_EVENT_TYPE)?)
        .map_err(|error| {
            ContractTestFailure::assertion(scenario, format!("registry rejected type: {error}"))
        })?;

    Ok(EventStore::new(Arc::new(make_backend()), registry))
}

fn contract_event(
    scenario: &'static str,
    scope: &Scope,
    aggregate_id: &AggregateId,
    version: u64,
    label: &str,
) -> Result<Event, ContractTestFailure> {
    let seconds = i64::try_from(version).unwrap_or(i64::MAX / 2);

    Ok(Event::new(
        contract_event_type(scenario, CONTRACT_EVENT_TYPE)?,
        ContractEvent {
            label: label.to_string(),
        },
        contract_timestamp(scenario, seconds)?,
        scope.aggregate_type().clone(),
        aggregate_id.clone(),
        Version::new(version),
    ))
}

/// Events `original + 1 ..= original + count`, labelled `"{prefix}-{version}"`.
fn contract_batch(
    scenario: &'static str,
    scope: &Scope,
    aggregate_id: &AggregateId,
    original: u64,
    count: u64,
    prefix: &str,
) -> Result<Vec<Event>, ContractTestFailure> {
    (original + 1..=original + count)
        .map(|version| {
            contract_event(
                scenario,
                scope,
                aggregate_id,
                version,
                &format!("{prefix}-{version}"),
            )
        })
        .collect()
}

fn versions(events: &[Event]) -> Vec<u64> {
    events
        .iter()
        .map(|event| event.version().into_inner())
        .collect()
}

fn labels(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .map(|event| {
            event
                .data_as::<ContractEvent>()
                .map_or_else(String::new, |data| data.label.clone())
        })
        .collect()
}

fn expect_error<T: fmt::Debug>(
    scenario: &'static str,
    operation: &'static str,
    result: EventStoreResult<T>,
    expected: ErrorKind,
) -> Result<EventStoreError, ContractTestFailure> {
    match result {
        Err(error) if error.kind() == expected => Ok(error),
        Err(error) => Err(ContractTestFailure::store_error(scenario, operation, &error)),
        Ok(value) => Err(ContractTestFailure::assertion(
            scenario,
            format!("expected {operation} to fail with `{expected}` but it returned {value:?}"),
        )),
    }
}

async fn load_all<B: Backend>(
    scenario: &'static str,
    store: &EventStore<B>,
    scope: &Scope,
    aggregate_id: &AggregateId,
) -> Result<Vec<Event>, ContractTestFailure> {
    store
        .load(scope, aggregate_id)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "load", &error))
}

async fn append_batch<B: Backend>(
    scenario: &'static str,
    store: &EventStore<B>,
    scope: &Scope,
    events: &[Event],
    original: u64,
) -> Result<Version, ContractTestFailure> {
    store
        .append(scope, events, Version::new(original))
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "append", &error))
}

/// Appending a fresh aggregate and extending it yields contiguous versions.
pub async fn test_append_and_load<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "append_and_load";

    let store = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let aggregate_id = contract_aggregate_id(SCENARIO, "order")?;

    // Given: three events appended to a new aggregate
    let first = contract_batch(SCENARIO, &scope, &aggregate_id, 0, 3, "first")?;
    let version = append_batch(SCENARIO, &store, &scope, &first, 0).await?;
    if version != Version::new(3) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected version 3 after first append, observed {version}"),
        ));
    }

    // When: one more event is appended at version 3
    let second = contract_batch(SCENARIO, &scope, &aggregate_id, 3, 1, "second")?;
    let version = append_batch(SCENARIO, &store, &scope, &second, 3).await?;

    // Then: the aggregate is at version 4 with all events in order
    if version != Version::new(4) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected version 4 after second append, observed {version}"),
        ));
    }

    let events = load_all(SCENARIO, &store, &scope, &aggregate_id).await?;
    if versions(&events) != vec![1, 2, 3, 4] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected versions [1, 2, 3, 4], observed {:?}", versions(&events)),
        ));
    }

    let expected_labels = vec!["first-1", "first-2", "first-3", "second-4"];
    if labels(&events) != expected_labels {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("payloads did not round trip, observed {:?}", labels(&events)),
        ));
    }

    if events.iter().any(|event| event.id().is_none()) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "loaded events must carry their record id",
        ));
    }

    let committed = store
        .aggregate_version(&scope, &aggregate_id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "aggregate_version", &error))?;
    if committed != Some(Version::new(4)) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected committed version 4, observed {committed:?}"),
        ));
    }

    Ok(())
}

/// A writer appending from an outdated version is turned away.
pub async fn test_stale_version_rejected<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "stale_version";

    let store = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let aggregate_id = contract_aggregate_id(SCENARIO, "order")?;

    // Given: an aggregate moved from version 3 to 4 by another writer
    let seed = contract_batch(SCENARIO, &scope, &aggregate_id, 0, 3, "seed")?;
    append_batch(SCENARIO, &store, &scope, &seed, 0).await?;
    let winner = contract_batch(SCENARIO, &scope, &aggregate_id, 3, 1, "winner")?;
    append_batch(SCENARIO, &store, &scope, &winner, 3).await?;

    // When: a writer that read version 3 appends
    let loser = contract_batch(SCENARIO, &scope, &aggregate_id, 3, 1, "loser")?;
    let result = store.append(&scope, &loser, Version::new(3)).await;

    // Then: the append fails as a concurrency conflict and history is untouched
    let error = expect_error(SCENARIO, "append", result, ErrorKind::CouldNotSaveAggregate)?;
    if !error.is_concurrency_conflict() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected a concurrency conflict, observed {error}"),
        ));
    }

    let events = load_all(SCENARIO, &store, &scope, &aggregate_id).await?;
    let observed = labels(&events);
    if observed != vec!["seed-1", "seed-2", "seed-3", "winner-4"] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("stale append changed history: {observed:?}"),
        ));
    }

    Ok(())
}

/// Two first appends of the same aggregate cannot both succeed.
pub async fn test_duplicate_first_append<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "duplicate_first_append";

    let store = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let aggregate_id = contract_aggregate_id(SCENARIO, "order")?;

    let first = contract_batch(SCENARIO, &scope, &aggregate_id, 0, 2, "first")?;
    append_batch(SCENARIO, &store, &scope, &first, 0).await?;

    let second = contract_batch(SCENARIO, &scope, &aggregate_id, 0, 1, "second")?;
    let result = store.append(&scope, &second, Version::initial()).await;
    let _ = expect_error(SCENARIO, "append", result, ErrorKind::CouldNotSaveAggregate)?;

    let events = load_all(SCENARIO, &store, &scope, &aggregate_id).await?;
    if labels(&events) != vec!["first-1", "first-2"] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("second first-append overwrote history: {:?}", labels(&events)),
        ));
    }

    Ok(())
}

/// Loading an aggregate that was never appended to yields nothing, not an error.
pub async fn test_missing_aggregate_loads_empty<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "missing_aggregate";

    let store = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let aggregate_id = contract_aggregate_id(SCENARIO, "ghost")?;

    let events = load_all(SCENARIO, &store, &scope, &aggregate_id).await?;
    if !events.is_empty() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "expected load to succeed with no events for an untouched aggregate",
        ));
    }

    let version = store
        .aggregate_version(&scope, &aggregate_id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "aggregate_version", &error))?;
    if version.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected no committed version, observed {version:?}"),
        ));
    }

    Ok(())
}

/// Range and limit options select the expected slice of history.
pub async fn test_load_ranges<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "load_ranges";

    let store = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let aggregate_id = contract_aggregate_id(SCENARIO, "ledger")?;

    let events = contract_batch(SCENARIO, &scope, &aggregate_id, 0, 5, "entry")?;
    append_batch(SCENARIO, &store, &scope, &events, 0).await?;

    let cases: [(LoadOptions, Vec<u64>); 5] = [
        (
            LoadOptions::new()
                .from_version(Version::new(2))
                .to_version(Version::new(4)),
            vec![2, 3, 4],
        ),
        (LoadOptions::new().with_max_events(2), vec![1, 2]),
        (
            LoadOptions::new()
                .from_version(Version::new(3))
                .with_max_events(10),
            vec![3, 4, 5],
        ),
        (LoadOptions::new().with_max_events(0), vec![]),
        (LoadOptions::new().from_version(Version::new(6)), vec![]),
    ];

    for (options, expected) in cases {
        let loaded = store
            .load_with(&scope, &aggregate_id, &options)
            .await
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "load_with", &error))?;

        if versions(&loaded) != expected {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!(
                    "options {options:?} expected versions {expected:?}, observed {:?}",
                    versions(&loaded)
                ),
            ));
        }
    }

    Ok(())
}

/// A batch rejected by validation leaves version and history unchanged.
pub async fn test_validation_leaves_state_unchanged<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "validation_atomic";

    let store = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let aggregate_id = contract_aggregate_id(SCENARIO, "cart")?;
    let other_id = contract_aggregate_id(SCENARIO, "other")?;

    let seed = contract_batch(SCENARIO, &scope, &aggregate_id, 0, 2, "seed")?;
    append_batch(SCENARIO, &store, &scope, &seed, 0).await?;

    // Version gap in the middle of the batch
    let gapped = vec![
        contract_event(SCENARIO, &scope, &aggregate_id, 3, "ok")?,
        contract_event(SCENARIO, &scope, &aggregate_id, 5, "gap")?,
    ];
    let result = store.append(&scope, &gapped, Version::new(2)).await;
    let _ = expect_error(SCENARIO, "append", result, ErrorKind::IncorrectEventVersion)?;

    // Second event belongs to another aggregate
    let mixed = vec![
        contract_event(SCENARIO, &scope, &aggregate_id, 3, "ok")?,
        contract_event(SCENARIO, &scope, &other_id, 4, "stray")?,
    ];
    let result = store.append(&scope, &mixed, Version::new(2)).await;
    let _ = expect_error(SCENARIO, "append", result, ErrorKind::InvalidEvent)?;

    let result = store.append(&scope, &[], Version::new(2)).await;
    let _ = expect_error(SCENARIO, "append", result, ErrorKind::NoEventsToAppend)?;

    let events = load_all(SCENARIO, &store, &scope, &aggregate_id).await?;
    if labels(&events) != vec!["seed-1", "seed-2"] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("rejected batches changed history: {:?}", labels(&events)),
        ));
    }

    let other = load_all(SCENARIO, &store, &scope, &other_id).await?;
    if !other.is_empty() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "rejected batch leaked events into another aggregate",
        ));
    }

    Ok(())
}

/// Replace changes exactly the targeted event.
pub async fn test_replace_is_surgical<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "replace_surgical";

    let store = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let aggregate_id = contract_aggregate_id(SCENARIO, "invoice")?;

    let seed = contract_batch(SCENARIO, &scope, &aggregate_id, 0, 3, "seed")?;
    append_batch(SCENARIO, &store, &scope, &seed, 0).await?;
    let before = load_all(SCENARIO, &store, &scope, &aggregate_id).await?;

    // When: version 2 is replaced with a corrected event
    let corrected_type = contract_event_type(SCENARIO, "Corrected")?;
    let corrected_at = contract_timestamp(SCENARIO, 500)?;
    let replacement = Event::new(
        corrected_type.clone(),
        ContractEvent {
            label: "corrected".to_string(),
        },
        corrected_at,
        scope.aggregate_type().clone(),
        aggregate_id.clone(),
        Version::new(2),
    );
    store
        .replace(&scope, &replacement)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "replace", &error))?;

    // Then: only version 2 changed, keeping its id and slot
    let after = load_all(SCENARIO, &store, &scope, &aggregate_id).await?;
    if versions(&after) != vec![1, 2, 3] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("replace changed versions: {:?}", versions(&after)),
        ));
    }

    let (Some(old), Some(new)) = (before.get(1), after.get(1)) else {
        return Err(ContractTestFailure::assertion(SCENARIO, "version 2 disappeared"));
    };
    if new.id() != old.id() {
        return Err(ContractTestFailure::assertion(SCENARIO, "replace changed the record id"));
    }
    if new.event_type() != &corrected_type || new.timestamp() != corrected_at {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("replace did not overwrite type and timestamp: {new}"),
        ));
    }
    // Corrected is not registered, so its payload comes back raw
    if new.raw_data().is_none() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "replaced payload of unregistered type should load as raw bytes",
        ));
    }

    for index in [0, 2] {
        let (Some(old), Some(new)) = (before.get(index), after.get(index)) else {
            return Err(ContractTestFailure::assertion(SCENARIO, "untouched event disappeared"));
        };
        if old.id() != new.id()
            || old.event_type() != new.event_type()
            || old.timestamp() != new.timestamp()
            || labels(std::slice::from_ref(old)) != labels(std::slice::from_ref(new))
        {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("replace touched neighbouring event {old}"),
            ));
        }
    }

    let version = store
        .aggregate_version(&scope, &aggregate_id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "aggregate_version", &error))?;
    if version != Some(Version::new(3)) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("replace moved the aggregate version to {version:?}"),
        ));
    }

    Ok(())
}

/// Replace refuses unknown aggregates and uncommitted versions.
pub async fn test_replace_rejects_missing_targets<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "replace_missing";

    let store = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let aggregate_id = contract_aggregate_id(SCENARIO, "invoice")?;
    let ghost_id = contract_aggregate_id(SCENARIO, "ghost")?;

    let seed = contract_batch(SCENARIO, &scope, &aggregate_id, 0, 2, "seed")?;
    append_batch(SCENARIO, &store, &scope, &seed, 0).await?;

    let ghost = contract_event(SCENARIO, &scope, &ghost_id, 1, "ghost")?;
    let result = store.replace(&scope, &ghost).await;
    let _ = expect_error(SCENARIO, "replace", result, ErrorKind::AggregateNotFound)?;

    let beyond = contract_event(SCENARIO, &scope, &aggregate_id, 5, "beyond")?;
    let result = store.replace(&scope, &beyond).await;
    let _ = expect_error(SCENARIO, "replace", result, ErrorKind::InvalidEvent)?;

    let events = load_all(SCENARIO, &store, &scope, &aggregate_id).await?;
    if labels(&events) != vec!["seed-1", "seed-2"] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("failed replace changed history: {:?}", labels(&events)),
        ));
    }

    Ok(())
}

/// Renaming an event type rewrites every matching record in the scope.
pub async fn test_rename_event_type<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "rename_event_type";

    let store = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let first_id = contract_aggregate_id(SCENARIO, "first")?;
    let second_id = contract_aggregate_id(SCENARIO, "second")?;
    let created = contract_event_type(SCENARIO, "Created")?;
    let item_created = contract_event_type(SCENARIO, "ItemCreated")?;

    // Given: two aggregates with one `Created` event each, plus an unrelated event
    for aggregate_id in [&first_id, &second_id] {
        let event = Event::without_data(
            created.clone(),
            contract_timestamp(SCENARIO, 1)?,
            scope.aggregate_type().clone(),
            aggregate_id.clone(),
            Version::new(1),
        );
        append_batch(SCENARIO, &store, &scope, &[event], 0).await?;
    }
    let unrelated = contract_event(SCENARIO, &scope, &first_id, 2, "unrelated")?;
    append_batch(SCENARIO, &store, &scope, &[unrelated], 1).await?;

    // When: `Created` is renamed to `ItemCreated`
    let renamed = store
        .rename_event_type(&scope, &created, item_created.clone())
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "rename_event_type", &error))?;

    // Then: both records carry the new type and nothing else changed
    if renamed != 2 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected 2 renamed records, observed {renamed}"),
        ));
    }

    let first = load_all(SCENARIO, &store, &scope, &first_id).await?;
    let second = load_all(SCENARIO, &store, &scope, &second_id).await?;
    let first_types: Vec<&str> = first.iter().map(|e| e.event_type().as_ref()).collect();
    let second_types: Vec<&str> = second.iter().map(|e| e.event_type().as_ref()).collect();

    if first_types != vec!["ItemCreated", CONTRACT_EVENT_TYPE] || second_types != vec!["ItemCreated"] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("unexpected event types after rename: {first_types:?} / {second_types:?}"),
        ));
    }

    Ok(())
}

/// Clearing a scope removes every aggregate and event, and can be repeated.
pub async fn test_clear_scope<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "clear_scope";

    let store = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let other_scope = contract_scope(SCENARIO)?;
    let aggregate_id = contract_aggregate_id(SCENARIO, "account")?;

    let events = contract_batch(SCENARIO, &scope, &aggregate_id, 0, 2, "doomed")?;
    append_batch(SCENARIO, &store, &scope, &events, 0).await?;
    let kept = contract_batch(SCENARIO, &other_scope, &aggregate_id, 0, 1, "kept")?;
    append_batch(SCENARIO, &store, &other_scope, &kept, 0).await?;

    store
        .clear(&scope)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "clear", &error))?;
    store
        .clear(&scope)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "clear", &error))?;

    let cleared = load_all(SCENARIO, &store, &scope, &aggregate_id).await?;
    if !cleared.is_empty() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "expected cleared scope to load no events",
        ));
    }

    // A cleared aggregate starts again from version 0
    let restart = contract_batch(SCENARIO, &scope, &aggregate_id, 0, 1, "restart")?;
    append_batch(SCENARIO, &store, &scope, &restart, 0).await?;

    let untouched = load_all(SCENARIO, &store, &other_scope, &aggregate_id).await?;
    if labels(&untouched) != vec!["kept-1"] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "clear removed events of another scope",
        ));
    }

    Ok(())
}

/// Payloads of unregistered types load as raw bytes; missing payloads load empty.
pub async fn test_unregistered_types_load_raw<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "unregistered_types";

    let writer = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let aggregate_id = contract_aggregate_id(SCENARIO, "doc")?;

    let mut events = contract_batch(SCENARIO, &scope, &aggregate_id, 0, 1, "known")?;
    events.push(Event::without_data(
        contract_event_type(SCENARIO, "Touched")?,
        contract_timestamp(SCENARIO, 2)?,
        scope.aggregate_type().clone(),
        aggregate_id.clone(),
        Version::new(2),
    ));
    append_batch(SCENARIO, &writer, &scope, &events, 0).await?;

    // A reader sharing the backend but knowing no types
    let reader = EventStore::new(Arc::clone(writer.backend()), EventTypeRegistry::new());
    let loaded = load_all(SCENARIO, &reader, &scope, &aggregate_id).await?;

    match loaded.as_slice() {
        [first, second] => {
            let raw_ok = matches!(first.payload(), Payload::Raw(bytes) if !bytes.is_empty());
            let empty_ok = matches!(second.payload(), Payload::Empty);
            if !raw_ok || !empty_ok {
                return Err(ContractTestFailure::assertion(
                    SCENARIO,
                    format!(
                        "expected raw then empty payloads, observed {:?} / {:?}",
                        first.payload(),
                        second.payload()
                    ),
                ));
            }
        }
        other => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("expected 2 events, observed {}", other.len()),
            ));
        }
    }

    Ok(())
}

/// Of several writers appending from the same version, exactly one wins.
pub async fn test_concurrent_appends_single_winner<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "concurrent_appends";
    const WRITERS: usize = 8;

    let store = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let aggregate_id = contract_aggregate_id(SCENARIO, "counter")?;

    let seed = contract_batch(SCENARIO, &scope, &aggregate_id, 0, 1, "seed")?;
    append_batch(SCENARIO, &store, &scope, &seed, 0).await?;

    let barrier = Arc::new(Barrier::new(WRITERS));
    let mut handles = Vec::with_capacity(WRITERS);
    for writer in 0..WRITERS {
        let events = contract_batch(
            SCENARIO,
            &scope,
            &aggregate_id,
            1,
            2,
            &format!("writer{writer}"),
        )?;
        let store = store.clone();
        let scope = scope.clone();
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            let _ = barrier.wait().await;
            store.append(&scope, &events, Version::new(1)).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        let outcome = handle.await.map_err(|error| {
            ContractTestFailure::assertion(SCENARIO, format!("writer task panicked: {error}"))
        })?;
        match outcome {
            Ok(_) => winners += 1,
            Err(error) if error.kind() == ErrorKind::CouldNotSaveAggregate => {}
            Err(error) => {
                return Err(ContractTestFailure::store_error(SCENARIO, "append", &error));
            }
        }
    }

    if winners != 1 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected exactly one winning writer, observed {winners}"),
        ));
    }

    let events = load_all(SCENARIO, &store, &scope, &aggregate_id).await?;
    let observed = labels(&events);
    let winner_prefix = observed
        .get(1)
        .and_then(|label| label.split('-').next())
        .unwrap_or_default()
        .to_string();
    let expected = vec![
        "seed-1".to_string(),
        format!("{winner_prefix}-2"),
        format!("{winner_prefix}-3"),
    ];
    if versions(&events) != vec![1, 2, 3] || observed != expected {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("history mixes writers or has gaps: {observed:?}"),
        ));
    }

    Ok(())
}

/// Repairing a healthy aggregate changes nothing.
pub async fn test_repair_healthy_aggregate<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "repair_healthy";

    let store = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let aggregate_id = contract_aggregate_id(SCENARIO, "account")?;

    let events = contract_batch(SCENARIO, &scope, &aggregate_id, 0, 3, "entry")?;
    append_batch(SCENARIO, &store, &scope, &events, 0).await?;

    let report = store
        .repair(&scope, &aggregate_id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "repair", &error))?;
    if !report.is_clean() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected a clean repair report, observed {report:?}"),
        ));
    }

    let loaded = load_all(SCENARIO, &store, &scope, &aggregate_id).await?;
    if versions(&loaded) != vec![1, 2, 3] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("repair changed history: {:?}", versions(&loaded)),
        ));
    }

    Ok(())
}

/// An event id already stored for one aggregate cannot be appended for another.
pub async fn test_event_ids_stay_in_their_slot<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "event_id_slots";

    let store = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let owner = contract_aggregate_id(SCENARIO, "owner")?;
    let intruder = contract_aggregate_id(SCENARIO, "intruder")?;

    // Given: a committed event of one aggregate
    let committed = contract_batch(SCENARIO, &scope, &owner, 0, 1, "owner")?;
    append_batch(SCENARIO, &store, &scope, &committed, 0).await?;
    let stored = load_all(SCENARIO, &store, &scope, &owner).await?;
    let Some(id) = stored.first().and_then(Event::id) else {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "loaded event must carry its record id",
        ));
    };

    // When: another aggregate appends an event reusing that id
    let reused = contract_event(SCENARIO, &scope, &intruder, 1, "intruder-1")?.with_id(id);
    let result = store.append(&scope, &[reused], Version::initial()).await;

    // Then: the append fails and the first aggregate keeps its event
    let error = expect_error(SCENARIO, "append", result, ErrorKind::CouldNotSaveAggregate)?;
    if error.is_concurrency_conflict() || error.needs_repair() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("a reused id is neither a conflict nor repairable, observed {error}"),
        ));
    }

    let events = load_all(SCENARIO, &store, &scope, &owner).await?;
    if labels(&events) != vec!["owner-1"] || events.first().and_then(Event::id) != Some(id) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("reused id moved a committed event: {:?}", labels(&events)),
        ));
    }

    let intruder_version = store
        .aggregate_version(&scope, &intruder)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "aggregate_version", &error))?;
    if intruder_version.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("refused aggregate was committed at {intruder_version:?}"),
        ));
    }

    Ok(())
}

/// A record left above the committed version blocks appends until repaired.
pub async fn test_uncommitted_records_need_repair<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B,
    B: Backend,
{
    const SCENARIO: &str = "uncommitted_records";

    let store = contract_store(SCENARIO, &make_backend)?;
    let scope = contract_scope(SCENARIO)?;
    let aggregate_id = contract_aggregate_id(SCENARIO, "ledger")?;

    // Given: version 1 committed and a record at version 2 that never was
    let committed = contract_batch(SCENARIO, &scope, &aggregate_id, 0, 1, "committed")?;
    append_batch(SCENARIO, &store, &scope, &committed, 0).await?;

    let leftover = contract_event(SCENARIO, &scope, &aggregate_id, 2, "leftover-2")?;
    let record = EventRecord::from_event(&leftover).map_err(|error| {
        ContractTestFailure::assertion(SCENARIO, format!("could not encode record: {error}"))
    })?;
    let mut session = store.backend().acquire().await.map_err(|error| {
        ContractTestFailure::assertion(SCENARIO, format!("could not acquire session: {error}"))
    })?;
    session.upsert_event(&scope, &record).await.map_err(|error| {
        ContractTestFailure::assertion(SCENARIO, format!("could not write record: {error}"))
    })?;
    drop(session);

    // When: a writer appends from the committed version
    let blocked = contract_batch(SCENARIO, &scope, &aggregate_id, 1, 1, "blocked")?;
    let result = store.append(&scope, &blocked, Version::new(1)).await;

    // Then: the error asks for a repair, after which the append succeeds
    let error = expect_error(SCENARIO, "append", result, ErrorKind::CouldNotSaveAggregate)?;
    if error.is_concurrency_conflict() || !error.needs_repair() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected an error asking for repair, observed {error}"),
        ));
    }

    let report = store
        .repair(&scope, &aggregate_id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "repair", &error))?;
    if report.removed != 1 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected repair to remove 1 record, observed {report:?}"),
        ));
    }

    append_batch(SCENARIO, &store, &scope, &blocked, 1).await?;
    let events = load_all(SCENARIO, &store, &scope, &aggregate_id).await?;
    if labels(&events) != vec!["committed-1", "blocked-2"] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected the repaired history, observed {:?}", labels(&events)),
        ));
    }

    Ok(())
}

/// Generates one `#[tokio::test]` per contract scenario for a backend.
///
/// Attributes written before `suite` are copied onto every generated test,
/// e.g. `#[ignore = "requires docker"]` for backends needing a server.
#[macro_export]
macro_rules! event_store_contract_tests {
    ($(#[$attr:meta])* suite = $suite:ident, make_backend = $make_backend:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_append_and_load, test_clear_scope, test_concurrent_appends_single_winner,
                test_duplicate_first_append, test_event_ids_stay_in_their_slot, test_load_ranges,
                test_missing_aggregate_loads_empty, test_rename_event_type,
                test_repair_healthy_aggregate, test_replace_is_surgical,
                test_replace_rejects_missing_targets, test_stale_version_rejected,
                test_uncommitted_records_need_repair, test_unregistered_types_load_raw,
                test_validation_leaves_state_unchanged,
            };

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn append_and_load_contract() {
                test_append_and_load($make_backend)
                    .await
                    .expect("event store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn stale_version_rejected_contract() {
                test_stale_version_rejected($make_backend)
                    .await
                    .expect("event store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn duplicate_first_append_contract() {
                test_duplicate_first_append($make_backend)
                    .await
                    .expect("event store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn missing_aggregate_loads_empty_contract() {
                test_missing_aggregate_loads_empty($make_backend)
                    .await
                    .expect("event store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn load_ranges_contract() {
                test_load_ranges($make_backend)
                    .await
                    .expect("event store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn validation_leaves_state_unchanged_contract() {
                test_validation_leaves_state_unchanged($make_backend)
                    .await
                    .expect("event store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn replace_is_surgical_contract() {
                test_replace_is_surgical($make_backend)
                    .await
                    .expect("event store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn replace_rejects_missing_targets_contract() {
                test_replace_rejects_missing_targets($make_backend)
                    .await
                    .expect("event store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn rename_event_type_contract() {
                test_rename_event_type($make_backend)
                    .await
                    .expect("event store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn clear_scope_contract() {
                test_clear_scope($make_backend)
                    .await
                    .expect("event store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn unregistered_types_load_raw_contract() {
                test_unregistered_types_load_raw($make_backend)
                    .await
                    .expect("event store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_appends_single_winner_contract() {
                test_concurrent_appends_single_winner($make_backend)
                    .await
                    .expect("event store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn repair_healthy_aggregate_contract() {
                test_repair_healthy_aggregate($make_backend)
                    .await
                    .expect("event store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn event_ids_stay_in_their_slot_contract() {
                test_event_ids_stay_in_their_slot($make_backend)
                    .await
                    .expect("event store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn uncommitted_records_need_repair_contract() {
                test_uncommitted_records_need_repair($make_backend)
                    .await
                    .expect("event store contract failed");
            }
        }
    };
}

pub use event_store_contract_tests;
