//! Fault injection for backends.
//!
//! [`ChaosBackend`] wraps any [`Backend`] and fails selected primitives before
//! they reach the wrapped backend, either always (targeted operations) or at
//! random with a configurable probability. Tests use it to check that the
//! store maps failures to the right error kinds, releases its sessions and
//! cleans up after a failed append.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use eventkeep::{
    AggregateId, AggregateRecord, Backend, BackendError, BackendSession, EventFilter, EventId,
    EventPatch, EventQuery, EventRecord, Operation, Scope, Upserted, Version,
};
use nutype::nutype;
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

/// Probability value for chaos engineering injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
///
/// # Examples
///
/// ```ignore
/// use eventkeep_testing::chaos::Probability;
///
/// let never = Probability::try_new(0.0).unwrap();
/// let always = Probability::try_new(1.0).unwrap();
///
/// // Values outside [0.0, 1.0] are rejected
/// assert!(Probability::try_new(1.5).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

/// The error a [`ChaosBackend`] wraps into [`BackendError::Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("injected fault in {operation}")]
pub struct InjectedFault {
    /// The primitive that was failed.
    pub operation: Operation,
}

/// Which primitives fail, and how often.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    targeted: HashSet<Operation>,
}

impl ChaosConfig {
    /// A configuration whose random faults repeat from run to run.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Fails every primitive with the given probability, clamped to [0, 1].
    #[must_use]
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = Probability::try_new(probability.clamp(0.0, 1.0))
            .expect("clamped value is always valid");
        self
    }

    /// Fails every call of `operation`.
    #[must_use]
    pub fn fail_operation(mut self, operation: Operation) -> Self {
        self.targeted.insert(operation);
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: Probability::try_new(0.0).expect("0.0 is valid probability"),
            targeted: HashSet::new(),
        }
    }
}

#[derive(Debug)]
struct ChaosState {
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    injected: AtomicUsize,
}

impl ChaosState {
    fn should_inject(&self, operation: Operation) -> bool {
        if self.config.targeted.contains(&operation) {
            return true;
        }

        let probability: f32 = self.config.failure_probability.into();
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }

        self.rng.lock().random_bool(f64::from(probability))
    }

    fn check(&self, operation: Operation) -> Result<(), BackendError> {
        if !self.should_inject(operation) {
            return Ok(());
        }

        self.injected.fetch_add(1, Ordering::SeqCst);
        debug!(operation = %operation, "[chaos.inject] failing backend operation");
        Err(BackendError::failure(operation, InjectedFault { operation }))
    }
}

/// Wraps a backend so its primitives fail on demand.
#[derive(Debug)]
pub struct ChaosBackend<B> {
    backend: B,
    state: Arc<ChaosState>,
}

impl<B> ChaosBackend<B> {
    /// Wraps `backend` with the given fault configuration.
    pub fn new(backend: B, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            backend,
            state: Arc::new(ChaosState {
                config,
                rng: Mutex::new(rng),
                injected: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of faults injected so far.
    pub fn injected_faults(&self) -> usize {
        self.state.injected.load(Ordering::SeqCst)
    }

    /// The wrapped backend.
    pub const fn inner(&self) -> &B {
        &self.backend
    }
}

/// Adds [`ChaosBackendExt::with_chaos`] to every backend.
pub trait ChaosBackendExt: Sized {
    /// Wraps the backend in a [`ChaosBackend`].
    fn with_chaos(self, config: ChaosConfig) -> ChaosBackend<Self>;
}

impl<B: Backend> ChaosBackendExt for B {
    fn with_chaos(self, config: ChaosConfig) -> ChaosBackend<Self> {
        ChaosBackend::new(self, config)
    }
}

#[async_trait]
impl<B: Backend> Backend for ChaosBackend<B> {
    type Session = ChaosSession<B::Session>;

    async fn acquire(&self) -> Result<Self::Session, BackendError> {
        self.state.check(Operation::Acquire)?;
        let session = self.backend.acquire().await?;

        Ok(ChaosSession {
            session,
            state: Arc::clone(&self.state),
        })
    }

    async fn close(&self) {
        self.backend.close().await;
    }
}

/// Session of a [`ChaosBackend`].
#[derive(Debug)]
pub struct ChaosSession<S> {
    session: S,
    state: Arc<ChaosState>,
}

#[async_trait]
impl<S: BackendSession> BackendSession for ChaosSession<S> {
    async fn upsert_event(
        &mut self,
        scope: &Scope,
        record: &EventRecord,
    ) -> Result<Upserted, BackendError> {
        self.state.check(Operation::UpsertEvent)?;
        self.session.upsert_event(scope, record).await
    }

    async fn insert_aggregate(
        &mut self,
        scope: &Scope,
        record: &AggregateRecord,
    ) -> Result<(), BackendError> {
        self.state.check(Operation::InsertAggregate)?;
        self.session.insert_aggregate(scope, record).await
    }

    async fn compare_and_set_version(
        &mut self,
        scope: &Scope,
        aggregate_id: &AggregateId,
        expected: Version,
        new: Version,
    ) -> Result<(), BackendError> {
        self.state.check(Operation::CompareAndSetVersion)?;
        self.session
            .compare_and_set_version(scope, aggregate_id, expected, new)
            .await
    }

    async fn find_aggregate(
        &mut self,
        scope: &Scope,
        aggregate_id: &AggregateId,
    ) -> Result<Option<AggregateRecord>, BackendError> {
        self.state.check(Operation::FindAggregate)?;
        self.session.find_aggregate(scope, aggregate_id).await
    }

    async fn find_events(
        &mut self,
        scope: &Scope,
        query: &EventQuery,
    ) -> Result<Vec<EventRecord>, BackendError> {
        self.state.check(Operation::FindEvents)?;
        self.session.find_events(scope, query).await
    }

    async fn update_events(
        &mut self,
        scope: &Scope,
        filter: &EventFilter,
        patch: &EventPatch,
    ) -> Result<u64, BackendError> {
        self.state.check(Operation::UpdateEvents)?;
        self.session.update_events(scope, filter, patch).await
    }

    async fn delete_events(&mut self, scope: &Scope, ids: &[EventId]) -> Result<u64, BackendError> {
        self.state.check(Operation::DeleteEvents)?;
        self.session.delete_events(scope, ids).await
    }

    async fn drop_collections(&mut self, scope: &Scope) -> Result<(), BackendError> {
        self.state.check(Operation::DropCollections)?;
        self.session.drop_collections(scope).await
    }
}
