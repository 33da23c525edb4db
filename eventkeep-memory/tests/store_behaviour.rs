//! Store-level behaviour on top of the in-memory backend.

use std::sync::Arc;

use eventkeep::{
    AggregateId, AggregateType, ErrorKind, Event, EventStore, EventType, EventTypeRegistry,
    LoadOptions, Namespace, Scope, Timestamp, Version,
};
use eventkeep_memory::InMemoryBackend;
use futures::future::join_all;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ItemAdded {
    sku: String,
    quantity: u32,
}

fn cart_type() -> AggregateType {
    AggregateType::try_new("Cart").expect("valid aggregate type")
}

fn scope() -> Scope {
    Scope::for_aggregate_type(cart_type())
}

fn cart(id: &str) -> AggregateId {
    AggregateId::try_new(id).expect("valid aggregate id")
}

fn item_added() -> EventType {
    EventType::try_new("ItemAdded").expect("valid event type")
}

fn batch(aggregate_id: &AggregateId, original: u64, count: u64) -> Vec<Event> {
    (original + 1..=original + count)
        .map(|version| {
            Event::new(
                item_added(),
                ItemAdded {
                    sku: format!("sku-{version}"),
                    quantity: 1,
                },
                Timestamp::now(),
                cart_type(),
                aggregate_id.clone(),
                Version::new(version),
            )
        })
        .collect()
}

fn store(backend: &InMemoryBackend) -> EventStore<InMemoryBackend> {
    let registry = EventTypeRegistry::new();
    registry
        .register::<ItemAdded>(item_added())
        .expect("registration should succeed");
    EventStore::new(Arc::new(backend.clone()), registry)
}

fn versions(events: &[Event]) -> Vec<u64> {
    events.iter().map(|event| event.version().into_inner()).collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime should build")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn appended_batches_load_as_one_contiguous_history(
        batch_sizes in prop::collection::vec(1u64..5, 1..8)
    ) {
        let total: u64 = batch_sizes.iter().sum();
        let loaded = runtime().block_on(async {
            let backend = InMemoryBackend::new();
            let store = store(&backend);
            let id = cart("cart-prop");
            let mut current = Version::initial();

            for size in &batch_sizes {
                let new_version = store
                    .append(&scope(), &batch(&id, current.into_inner(), *size), current)
                    .await
                    .expect("append should succeed");
                assert_eq!(Some(new_version), current.advanced_by(*size));
                current = new_version;
            }

            store.load(&scope(), &id).await.expect("load should succeed")
        });

        prop_assert_eq!(versions(&loaded), (1..=total).collect::<Vec<_>>());
    }

    #[test]
    fn ranged_loads_return_the_matching_window(
        total in 1u64..20,
        from in 1u64..25,
        span in 0u64..25,
        max in 1usize..10,
    ) {
        let to = from + span;
        let loaded = runtime().block_on(async {
            let backend = InMemoryBackend::new();
            let store = store(&backend);
            let id = cart("cart-window");
            store
                .append(&scope(), &batch(&id, 0, total), Version::initial())
                .await
                .expect("append should succeed");

            let options = LoadOptions::new()
                .from_version(Version::new(from))
                .to_version(Version::new(to))
                .with_max_events(max);
            store
                .load_with(&scope(), &id, &options)
                .await
                .expect("load should succeed")
        });

        let expected: Vec<u64> = (from..=to.min(total)).take(max).collect();
        prop_assert_eq!(versions(&loaded), expected);
    }
}

#[tokio::test]
async fn registered_payloads_load_as_their_type() {
    // Given: a registered payload type
    let backend = InMemoryBackend::new();
    let store = store(&backend);
    let id = cart("cart-typed");
    store
        .append(&scope(), &batch(&id, 0, 1), Version::initial())
        .await
        .expect("append should succeed");

    // When: the history is loaded
    let loaded = store.load(&scope(), &id).await.expect("load should succeed");

    // Then: the payload comes back typed
    let item = loaded[0]
        .data_as::<ItemAdded>()
        .expect("payload should resolve to ItemAdded");
    assert_eq!(item.sku, "sku-1");
    assert_eq!(item.quantity, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn writers_on_different_aggregates_never_conflict() {
    // Given: one store shared by many writers
    let backend = InMemoryBackend::new();
    let store = store(&backend);

    // When: each writer appends to its own aggregate at the same time
    let writes = (0..16).map(|n| {
        let store = store.clone();
        async move {
            let id = cart(&format!("cart-{n}"));
            store
                .append(&scope(), &batch(&id, 0, 3), Version::initial())
                .await
        }
    });
    let results = join_all(writes).await;

    // Then: all of them commit
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(backend.stored_event_count(&scope()), 48);
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test]
async fn scopes_with_the_same_aggregate_type_are_isolated() {
    let backend = InMemoryBackend::new();
    let store = store(&backend);
    let tenant = Scope::new(
        Namespace::try_new("tenant_a").expect("valid namespace"),
        cart_type(),
    );
    let id = cart("cart-shared-id");

    store
        .append(&scope(), &batch(&id, 0, 2), Version::initial())
        .await
        .expect("default scope append should succeed");
    store
        .append(&tenant, &batch(&id, 0, 1), Version::initial())
        .await
        .expect("tenant scope append should succeed");
    store.clear(&tenant).await.expect("clear should succeed");

    assert_eq!(store.load(&scope(), &id).await.unwrap().len(), 2);
    assert!(store.load(&tenant, &id).await.unwrap().is_empty());
    assert!(!backend.has_collections(&tenant));
}

#[tokio::test]
async fn loading_zero_events_touches_nothing() {
    let backend = InMemoryBackend::new();
    let store = store(&backend);

    let loaded = store
        .load_with(&scope(), &cart("cart-none"), &LoadOptions::new().with_max_events(0))
        .await
        .expect("load should succeed");

    assert!(loaded.is_empty());
    assert!(!backend.has_collections(&scope()));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn commits_and_conflicts_are_logged() {
    // Given: an aggregate at version 1
    let backend = InMemoryBackend::new();
    let store = store(&backend);
    let id = cart("cart-logged");
    store
        .append(&scope(), &batch(&id, 0, 1), Version::initial())
        .await
        .expect("append should succeed");

    // When: a stale writer appends from version 0
    let error = store
        .append(&scope(), &batch(&id, 0, 1), Version::initial())
        .await
        .expect_err("stale append should fail");

    // Then: both the commit and the conflict show up in the logs
    assert_eq!(error.kind(), ErrorKind::CouldNotSaveAggregate);
    assert!(error.is_concurrency_conflict());
    assert!(logs_contain("[event_store.append] committed events"));
    assert!(logs_contain("optimistic concurrency check failed"));
}
