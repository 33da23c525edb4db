//! End-to-end scenarios for an inventory aggregate.

use std::sync::Arc;

use eventkeep::{
    AggregateId, AggregateType, ErrorKind, Event, EventStore, EventType, EventTypeRegistry,
    Payload, RegistryBuilder, Scope, Timestamp, Version,
};
use eventkeep_memory::InMemoryBackend;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ItemCreated {
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ItemRenamed {
    name: String,
}

fn init_logging() {
    let _guard = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn event_type(name: &str) -> EventType {
    EventType::try_new(name).expect("valid event type")
}

fn item_type() -> AggregateType {
    AggregateType::try_new("Item").expect("valid aggregate type")
}

fn scope() -> Scope {
    Scope::for_aggregate_type(item_type())
}

fn item_id() -> AggregateId {
    AggregateId::try_new("item-42").expect("valid aggregate id")
}

fn created(version: u64, name: &str) -> Event {
    Event::new(
        event_type("Created"),
        ItemCreated {
            name: name.to_string(),
        },
        Timestamp::now(),
        item_type(),
        item_id(),
        Version::new(version),
    )
}

fn renamed(version: u64, name: &str) -> Event {
    Event::new(
        event_type("Renamed"),
        ItemRenamed {
            name: name.to_string(),
        },
        Timestamp::now(),
        item_type(),
        item_id(),
        Version::new(version),
    )
}

fn store() -> EventStore<InMemoryBackend> {
    let registry = RegistryBuilder::new()
        .register::<ItemCreated>(event_type("Created"))
        .and_then(|builder| builder.register::<ItemRenamed>(event_type("Renamed")))
        .expect("registrations should not conflict")
        .build();
    EventStore::new(Arc::new(InMemoryBackend::new()), registry)
}

#[tokio::test]
async fn appends_advance_the_version_and_stale_writers_lose() {
    init_logging();

    // Given: an item with three events
    let store = store();
    let version = store
        .append(
            &scope(),
            &[created(1, "lamp"), renamed(2, "desk lamp"), renamed(3, "floor lamp")],
            Version::initial(),
        )
        .await
        .expect("first append should succeed");
    assert_eq!(version, Version::new(3));

    let history = store.load(&scope(), &item_id()).await.unwrap();
    let versions: Vec<u64> = history.iter().map(|e| e.version().into_inner()).collect();
    assert_eq!(versions, vec![1, 2, 3]);

    // When: one writer appends from version 3 and another retries from 3
    let version = store
        .append(&scope(), &[renamed(4, "reading lamp")], Version::new(3))
        .await
        .expect("append from the current version should succeed");
    let stale = store
        .append(&scope(), &[renamed(4, "night lamp")], Version::new(3))
        .await;

    // Then: only the first moves the version
    assert_eq!(version, Version::new(4));
    let error = stale.expect_err("stale append should fail");
    assert_eq!(error.kind(), ErrorKind::CouldNotSaveAggregate);
    assert!(error.is_concurrency_conflict());
    let last = store.load(&scope(), &item_id()).await.unwrap().pop().unwrap();
    assert_eq!(
        last.data_as::<ItemRenamed>().map(|data| data.name.as_str()),
        Some("reading lamp")
    );
}

#[tokio::test]
async fn unknown_aggregates_have_no_history() {
    init_logging();
    let store = store();

    let history = store
        .load(&scope(), &AggregateId::try_new("never-written").unwrap())
        .await
        .expect("loading an unknown aggregate should succeed");
    let version = store
        .aggregate_version(&scope(), &AggregateId::try_new("never-written").unwrap())
        .await
        .unwrap();

    assert!(history.is_empty());
    assert_eq!(version, None);
}

#[tokio::test]
async fn renamed_event_types_load_under_their_new_name() {
    init_logging();

    // Given: a stored Created event
    let store = store();
    store
        .append(&scope(), &[created(1, "chair")], Version::initial())
        .await
        .unwrap();

    // When: Created is renamed to ItemCreated, and the new name registered
    let renamed = store
        .rename_event_type(&scope(), &event_type("Created"), event_type("ItemCreated"))
        .await
        .unwrap();
    store
        .registry()
        .register::<ItemCreated>(event_type("ItemCreated"))
        .unwrap();

    // Then: the stored event carries the new tag and the same payload
    assert_eq!(renamed, 1);
    let history = store.load(&scope(), &item_id()).await.unwrap();
    assert_eq!(history[0].event_type().as_str(), "ItemCreated");
    assert_eq!(
        history[0].data_as::<ItemCreated>(),
        Some(&ItemCreated {
            name: "chair".to_string()
        })
    );
}

#[tokio::test]
async fn unregistered_types_are_returned_raw() {
    init_logging();
    let writer = store();
    writer
        .append(&scope(), &[created(1, "table")], Version::initial())
        .await
        .unwrap();

    // A reader sharing the backend but knowing no types
    let reader = EventStore::new(Arc::clone(writer.backend()), EventTypeRegistry::new());
    let history = reader.load(&scope(), &item_id()).await.unwrap();

    assert!(matches!(history[0].payload(), Payload::Raw(_)));
    let raw = history[0].raw_data().expect("raw bytes should be kept");
    let decoded: ItemCreated = serde_json::from_slice(raw).expect("bytes should be json");
    assert_eq!(decoded.name, "table");
}

#[tokio::test]
async fn replace_rewrites_one_event_in_place() {
    init_logging();
    let store = store();
    store
        .append(
            &scope(),
            &[created(1, "sofa"), renamed(2, "couch")],
            Version::initial(),
        )
        .await
        .unwrap();
    let original = store.load(&scope(), &item_id()).await.unwrap();

    store
        .replace(&scope(), &renamed(2, "settee"))
        .await
        .expect("replace should succeed");

    let replaced = store.load(&scope(), &item_id()).await.unwrap();
    assert_eq!(replaced.len(), 2);
    assert_eq!(replaced[0].id(), original[0].id());
    assert_eq!(replaced[1].id(), original[1].id());
    assert_eq!(
        replaced[1].data_as::<ItemRenamed>().map(|data| data.name.as_str()),
        Some("settee")
    );
    assert_eq!(
        store.aggregate_version(&scope(), &item_id()).await.unwrap(),
        Some(Version::new(2))
    );
}

#[tokio::test]
async fn payloadless_events_round_trip_empty() {
    init_logging();
    let store = store();
    let marker = Event::without_data(
        event_type("Archived"),
        Timestamp::now(),
        item_type(),
        item_id(),
        Version::new(1),
    );

    store
        .append(&scope(), &[marker], Version::initial())
        .await
        .unwrap();
    let history = store.load(&scope(), &item_id()).await.unwrap();

    assert!(history[0].payload().is_empty());
    assert!(history[0].raw_data().is_none());
}

#[tokio::test]
async fn original_version_at_the_top_of_the_range_is_rejected() {
    init_logging();
    let store = store();

    let result = store
        .append(&scope(), &[created(5, "lamp")], Version::new(u64::MAX))
        .await;

    let error = result.expect_err("append past the largest version should fail");
    assert_eq!(error.kind(), ErrorKind::IncorrectEventVersion);
    assert_eq!(store.aggregate_version(&scope(), &item_id()).await.unwrap(), None);
}

#[tokio::test]
async fn event_ids_are_never_taken_over_by_another_aggregate() {
    init_logging();

    // Given: an item whose first event has a known id
    let store = store();
    store
        .append(&scope(), &[created(1, "shelf")], Version::initial())
        .await
        .unwrap();
    let id = store.load(&scope(), &item_id()).await.unwrap()[0]
        .id()
        .expect("loaded events carry ids");

    // When: another item is appended reusing that id
    let other_item = AggregateId::try_new("item-43").unwrap();
    let reused = Event::new(
        event_type("Created"),
        ItemCreated {
            name: "crate".to_string(),
        },
        Timestamp::now(),
        item_type(),
        other_item.clone(),
        Version::new(1),
    )
    .with_id(id);
    let result = store.append(&scope(), &[reused], Version::initial()).await;

    // Then: the append fails without touching the first item
    let error = result.expect_err("reused id should be refused");
    assert_eq!(error.kind(), ErrorKind::CouldNotSaveAggregate);
    assert!(!error.is_concurrency_conflict());
    assert!(!error.needs_repair());
    let history = store.load(&scope(), &item_id()).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id(), Some(id));
    assert_eq!(store.aggregate_version(&scope(), &other_item).await.unwrap(), None);
}
