//! In-memory backend for the `eventkeep` event log
//!
//! This crate provides an in-memory implementation of the [`Backend`] port
//! from the eventkeep crate, useful for testing and development scenarios
//! where persistence is not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use eventkeep::{
    AggregateId, AggregateRecord, Backend, BackendError, BackendSession, EventFilter, EventId,
    EventPatch, EventQuery, EventRecord, Scope, Upserted, Version,
};
use parking_lot::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct Collections {
    aggregates: HashMap<AggregateId, AggregateRecord>,
    events: HashMap<EventId, EventRecord>,
}

#[derive(Debug, Default)]
struct Inner {
    // Maps each scope to its aggregates and events collections
    scopes: RwLock<HashMap<Scope, Collections>>,
    open_sessions: AtomicUsize,
    closed: AtomicBool,
}

/// Thread-safe in-memory backend for testing.
///
/// Clones share the same storage. Every primitive runs under one lock, so the
/// version compare-and-set and the slot check are atomic.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
}

impl InMemoryBackend {
    /// Create a new empty in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions acquired and not yet dropped.
    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    /// Number of event records stored in `scope`, committed or not.
    pub fn stored_event_count(&self, scope: &Scope) -> usize {
        self.inner
            .scopes
            .read()
            .get(scope)
            .map_or(0, |collections| collections.events.len())
    }

    /// Whether `scope` currently has collections.
    pub fn has_collections(&self, scope: &Scope) -> bool {
        self.inner.scopes.read().contains_key(scope)
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    type Session = InMemorySession;

    async fn acquire(&self) -> Result<Self::Session, BackendError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(
                "in-memory backend is closed".to_string(),
            ));
        }

        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(InMemorySession {
            inner: Arc::clone(&self.inner),
        })
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        debug!("[memory.close] backend closed");
    }
}

/// Session handed out by [`InMemoryBackend`].
#[derive(Debug)]
pub struct InMemorySession {
    inner: Arc<Inner>,
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.inner.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendSession for InMemorySession {
    async fn upsert_event(
        &mut self,
        scope: &Scope,
        record: &EventRecord,
    ) -> Result<Upserted, BackendError> {
        let mut scopes = self.inner.scopes.write();
        let collections = scopes.entry(scope.clone()).or_default();

        let slot_taken = collections.events.values().any(|stored| {
            stored.id != record.id
                && stored.aggregate_id == record.aggregate_id
                && stored.version == record.version
        });
        if slot_taken {
            return Err(BackendError::DuplicateKey {
                collection: scope.events_collection(),
                key: format!("{}@{}", record.aggregate_id, record.version),
            });
        }

        let moves_slot = collections.events.get(&record.id).is_some_and(|stored| {
            stored.aggregate_id != record.aggregate_id || stored.version != record.version
        });
        if moves_slot {
            return Err(BackendError::DuplicateKey {
                collection: scope.events_collection(),
                key: record.id.to_string(),
            });
        }

        let upserted = match collections.events.insert(record.id, record.clone()) {
            Some(_) => Upserted::Replaced,
            None => Upserted::Inserted,
        };
        Ok(upserted)
    }

    async fn insert_aggregate(
        &mut self,
        scope: &Scope,
        record: &AggregateRecord,
    ) -> Result<(), BackendError> {
        let mut scopes = self.inner.scopes.write();
        let collections = scopes.entry(scope.clone()).or_default();

        if collections.aggregates.contains_key(&record.aggregate_id) {
            return Err(BackendError::DuplicateKey {
                collection: scope.aggregates_collection().to_string(),
                key: record.aggregate_id.to_string(),
            });
        }

        collections
            .aggregates
            .insert(record.aggregate_id.clone(), record.clone());
        Ok(())
    }

    async fn compare_and_set_version(
        &mut self,
        scope: &Scope,
        aggregate_id: &AggregateId,
        expected: Version,
        new: Version,
    ) -> Result<(), BackendError> {
        let mut scopes = self.inner.scopes.write();

        let aggregate = scopes
            .get_mut(scope)
            .and_then(|collections| collections.aggregates.get_mut(aggregate_id))
            .filter(|aggregate| aggregate.version == expected)
            .ok_or_else(|| BackendError::VersionMismatch {
                aggregate_id: aggregate_id.clone(),
                expected,
            })?;

        aggregate.version = new;
        Ok(())
    }

    async fn find_aggregate(
        &mut self,
        scope: &Scope,
        aggregate_id: &AggregateId,
    ) -> Result<Option<AggregateRecord>, BackendError> {
        let scopes = self.inner.scopes.read();

        Ok(scopes
            .get(scope)
            .and_then(|collections| collections.aggregates.get(aggregate_id))
            .cloned())
    }

    async fn find_events(
        &mut self,
        scope: &Scope,
        query: &EventQuery,
    ) -> Result<Vec<EventRecord>, BackendError> {
        let scopes = self.inner.scopes.read();
        let Some(collections) = scopes.get(scope) else {
            return Ok(Vec::new());
        };

        let mut records: Vec<EventRecord> = collections
            .events
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        records.sort_by_key(|record| record.version);

        if let Some(limit) = query.limit {
            records.truncate(limit);
        }

        Ok(records)
    }

    async fn update_events(
        &mut self,
        scope: &Scope,
        filter: &EventFilter,
        patch: &EventPatch,
    ) -> Result<u64, BackendError> {
        let mut scopes = self.inner.scopes.write();
        let Some(collections) = scopes.get_mut(scope) else {
            return Ok(0);
        };

        let mut updated = 0;
        for record in collections.events.values_mut() {
            if filter.matches(record) {
                patch.apply(record);
                updated += 1;
            }
        }

        Ok(updated)
    }

    async fn delete_events(&mut self, scope: &Scope, ids: &[EventId]) -> Result<u64, BackendError> {
        let mut scopes = self.inner.scopes.write();
        let Some(collections) = scopes.get_mut(scope) else {
            return Ok(0);
        };

        let removed = ids
            .iter()
            .filter(|id| collections.events.remove(*id).is_some())
            .count();

        Ok(removed as u64)
    }

    async fn drop_collections(&mut self, scope: &Scope) -> Result<(), BackendError> {
        self.inner.scopes.write().remove(scope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventkeep::{AggregateType, EventType, Timestamp};

    fn scope() -> Scope {
        Scope::for_aggregate_type(AggregateType::try_new("Ledger").unwrap())
    }

    fn record(aggregate_id: &str, version: u64) -> EventRecord {
        EventRecord {
            id: EventId::generate(),
            aggregate_type: AggregateType::try_new("Ledger").unwrap(),
            aggregate_id: AggregateId::try_new(aggregate_id).unwrap(),
            event_type: EventType::try_new("Posted").unwrap(),
            data: None,
            timestamp: Timestamp::now(),
            version: Version::new(version),
        }
    }

    #[tokio::test]
    async fn test_new_backend_is_empty() {
        let backend = InMemoryBackend::new();
        assert!(backend.inner.scopes.read().is_empty());
        assert_eq!(backend.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_clone_shares_storage() {
        let backend1 = InMemoryBackend::new();
        #[allow(clippy::redundant_clone)]
        let backend2 = backend1.clone();

        assert!(Arc::ptr_eq(&backend1.inner, &backend2.inner));
    }

    #[tokio::test]
    async fn test_sessions_are_counted_until_dropped() {
        let backend = InMemoryBackend::new();

        let first = backend.acquire().await.unwrap();
        let second = backend.acquire().await.unwrap();
        assert_eq!(backend.open_sessions(), 2);

        drop(first);
        drop(second);
        assert_eq!(backend.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let backend = InMemoryBackend::new();
        backend.close().await;

        let result = backend.acquire().await;

        assert!(matches!(result, Err(BackendError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_upsert_reports_insert_then_replace() {
        let backend = InMemoryBackend::new();
        let mut session = backend.acquire().await.unwrap();
        let mut stored = record("l-1", 1);

        let first = session.upsert_event(&scope(), &stored).await.unwrap();
        stored.event_type = EventType::try_new("Corrected").unwrap();
        let second = session.upsert_event(&scope(), &stored).await.unwrap();

        assert_eq!(first, Upserted::Inserted);
        assert_eq!(second, Upserted::Replaced);
        assert_eq!(backend.stored_event_count(&scope()), 1);
    }

    #[tokio::test]
    async fn test_occupied_slot_rejects_other_record() {
        let backend = InMemoryBackend::new();
        let mut session = backend.acquire().await.unwrap();
        session.upsert_event(&scope(), &record("l-1", 1)).await.unwrap();

        let result = session.upsert_event(&scope(), &record("l-1", 1)).await;

        assert!(matches!(result, Err(BackendError::DuplicateKey { .. })));
    }

    #[tokio::test]
    async fn test_known_id_cannot_move_to_another_slot() {
        let backend = InMemoryBackend::new();
        let mut session = backend.acquire().await.unwrap();
        let original = record("l-1", 1);
        session.upsert_event(&scope(), &original).await.unwrap();

        let mut moved = record("l-2", 1);
        moved.id = original.id;
        let result = session.upsert_event(&scope(), &moved).await;

        assert!(matches!(result, Err(BackendError::DuplicateKey { .. })));
        let stored = backend.inner.scopes.read()[&scope()].events[&original.id].clone();
        assert_eq!(stored, original);
    }

    #[tokio::test]
    async fn test_insert_aggregate_twice_fails() {
        let backend = InMemoryBackend::new();
        let mut session = backend.acquire().await.unwrap();
        let aggregate = AggregateRecord::new(AggregateId::try_new("l-1").unwrap(), Version::new(1));

        session.insert_aggregate(&scope(), &aggregate).await.unwrap();
        let result = session.insert_aggregate(&scope(), &aggregate).await;

        assert!(matches!(result, Err(BackendError::DuplicateKey { .. })));
    }

    #[tokio::test]
    async fn test_compare_and_set_requires_expected_version() {
        let backend = InMemoryBackend::new();
        let mut session = backend.acquire().await.unwrap();
        let id = AggregateId::try_new("l-1").unwrap();
        session
            .insert_aggregate(&scope(), &AggregateRecord::new(id.clone(), Version::new(2)))
            .await
            .unwrap();

        let stale = session
            .compare_and_set_version(&scope(), &id, Version::new(1), Version::new(3))
            .await;
        let current = session
            .compare_and_set_version(&scope(), &id, Version::new(2), Version::new(3))
            .await;

        assert!(matches!(stale, Err(BackendError::VersionMismatch { .. })));
        assert!(current.is_ok());
        let stored = session.find_aggregate(&scope(), &id).await.unwrap().unwrap();
        assert_eq!(stored.version, Version::new(3));
    }

    #[tokio::test]
    async fn test_compare_and_set_on_missing_aggregate_fails() {
        let backend = InMemoryBackend::new();
        let mut session = backend.acquire().await.unwrap();

        let result = session
            .compare_and_set_version(
                &scope(),
                &AggregateId::try_new("ghost").unwrap(),
                Version::new(1),
                Version::new(2),
            )
            .await;

        assert!(matches!(result, Err(BackendError::VersionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_find_events_sorts_and_limits() {
        let backend = InMemoryBackend::new();
        let mut session = backend.acquire().await.unwrap();
        for version in [3, 1, 2] {
            session
                .upsert_event(&scope(), &record("l-1", version))
                .await
                .unwrap();
        }
        session.upsert_event(&scope(), &record("l-2", 1)).await.unwrap();

        let mut query = EventQuery::all(AggregateId::try_new("l-1").unwrap());
        query.limit = Some(2);
        let found = session.find_events(&scope(), &query).await.unwrap();

        let versions: Vec<u64> = found.iter().map(|r| r.version.into_inner()).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_drop_collections_is_idempotent() {
        let backend = InMemoryBackend::new();
        let mut session = backend.acquire().await.unwrap();
        session.upsert_event(&scope(), &record("l-1", 1)).await.unwrap();

        session.drop_collections(&scope()).await.unwrap();
        session.drop_collections(&scope()).await.unwrap();

        assert!(!backend.has_collections(&scope()));
    }
}
