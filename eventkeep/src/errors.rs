//! Error types for eventkeep.
//!
//! Every store operation fails with an [`EventStoreError`]. The error carries an
//! [`ErrorKind`] that callers match on, the scope the operation was working in,
//! and the underlying cause (a [`BackendError`], a codec error or a driver
//! error) as its `source()`.
//!
//! # Error Categories
//!
//! - **Validation**: `NoEventsToAppend`, `InvalidEvent`, `IncorrectEventVersion`.
//!   Raised before anything is written.
//! - **Codec**: `CouldNotMarshalEvent`, `CouldNotUnmarshalEvent`.
//! - **Persistence**: `CouldNotSaveAggregate`, `CouldNotLoadAggregate`,
//!   `AggregateNotFound`, `CouldNotClearDb`.
//! - **Connection**: `CouldNotDialDb`, `NoDbSession`.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! match store.append(&scope, events, version).await {
//!     Ok(new_version) => track(new_version),
//!     Err(e) if e.is_concurrency_conflict() => {
//!         // Another writer committed first: reload and retry the command
//!     }
//!     Err(e) if e.needs_repair() => {
//!         store.repair(&scope, &aggregate_id).await?;
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::backend::BackendError;
use crate::types::{AggregateType, Namespace, Scope};

/// The category of an [`EventStoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    /// An append was called with an empty batch.
    #[error("no events to append")]
    NoEventsToAppend,

    /// An event does not belong where it is being written, or a replace
    /// targets a slot that holds no event.
    #[error("invalid event")]
    InvalidEvent,

    /// The versions of an appended batch do not continue from the original version.
    #[error("incorrect event version")]
    IncorrectEventVersion,

    /// An event payload could not be serialized.
    #[error("could not marshal event")]
    CouldNotMarshalEvent,

    /// Stored bytes could not be decoded into the registered payload type.
    #[error("could not unmarshal event")]
    CouldNotUnmarshalEvent,

    /// The backing store failed while reading an aggregate.
    #[error("could not load aggregate")]
    CouldNotLoadAggregate,

    /// The backing store failed, or a concurrent writer won, while saving.
    #[error("could not save aggregate")]
    CouldNotSaveAggregate,

    /// The aggregate has never been appended to.
    #[error("could not find aggregate")]
    AggregateNotFound,

    /// The scope's collections could not be dropped.
    #[error("could not clear database")]
    CouldNotClearDb,

    /// The backing store could not be reached when the backend was created.
    #[error("could not dial database")]
    CouldNotDialDb,

    /// No usable session could be obtained from the backend client.
    #[error("could not obtain database session")]
    NoDbSession,
}

/// Where an error happened: the namespace and aggregate type of the operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Namespace the operation targeted, if known.
    pub namespace: Option<Namespace>,
    /// Aggregate type the operation targeted, if known.
    pub aggregate_type: Option<AggregateType>,
}

impl From<&Scope> for ErrorContext {
    fn from(scope: &Scope) -> Self {
        Self {
            namespace: Some(scope.namespace().clone()),
            aggregate_type: Some(scope.aggregate_type().clone()),
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.namespace, &self.aggregate_type) {
            (None, None) => Ok(()),
            (Some(namespace), None) => write!(f, " (namespace: {namespace})"),
            (None, Some(aggregate_type)) => write!(f, " (aggregate type: {aggregate_type})"),
            (Some(namespace), Some(aggregate_type)) => write!(
                f,
                " (namespace: {namespace}, aggregate type: {aggregate_type})"
            ),
        }
    }
}

/// Error returned by every event store operation.
#[derive(Debug, Error)]
#[error("{kind}{context}")]
pub struct EventStoreError {
    kind: ErrorKind,
    context: ErrorContext,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl EventStoreError {
    /// Creates an error of the given kind without context or cause.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: ErrorContext::default(),
            source: None,
        }
    }

    /// Creates an error of the given kind attributed to a scope.
    pub fn in_scope(kind: ErrorKind, scope: &Scope) -> Self {
        Self {
            kind,
            context: ErrorContext::from(scope),
            source: None,
        }
    }

    /// Attaches the underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<Box<dyn StdError + Send + Sync + 'static>>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The category of this error.
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The scope the failing operation targeted.
    pub const fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// The backend failure behind this error, if there is one.
    pub fn backend_error(&self) -> Option<&BackendError> {
        self.source
            .as_deref()
            .and_then(|source| source.downcast_ref::<BackendError>())
    }

    /// Whether this error means a concurrent writer committed first.
    ///
    /// Callers typically reload the aggregate and retry their command when
    /// this returns `true`.
    pub fn is_concurrency_conflict(&self) -> bool {
        self.kind == ErrorKind::CouldNotSaveAggregate
            && matches!(self.backend_error(), Some(BackendError::VersionMismatch { .. }))
    }

    /// Whether an append was blocked by a record its aggregate never committed.
    ///
    /// Retrying cannot succeed until [`crate::EventStore::repair`] has removed
    /// the record.
    pub fn needs_repair(&self) -> bool {
        self.kind == ErrorKind::CouldNotSaveAggregate
            && matches!(self.backend_error(), Some(BackendError::SlotHeld { .. }))
    }
}

/// Result type for event store operations.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AggregateId, Version};

    fn order_scope() -> Scope {
        Scope::new(
            Namespace::try_new("shop").unwrap(),
            AggregateType::try_new("Order").unwrap(),
        )
    }

    #[test]
    fn display_includes_kind_and_scope() {
        let error = EventStoreError::in_scope(ErrorKind::CouldNotSaveAggregate, &order_scope());
        assert_eq!(
            error.to_string(),
            "could not save aggregate (namespace: shop, aggregate type: Order)"
        );
    }

    #[test]
    fn display_without_context_is_just_the_kind() {
        let error = EventStoreError::new(ErrorKind::CouldNotDialDb);
        assert_eq!(error.to_string(), "could not dial database");
    }

    #[test]
    fn source_is_preserved() {
        let cause = BackendError::Unavailable("connection reset".to_string());
        let error = EventStoreError::new(ErrorKind::CouldNotLoadAggregate).with_source(cause);

        let source = StdError::source(&error).expect("source should be kept");
        assert!(source.to_string().contains("connection reset"));
    }

    #[test]
    fn version_mismatch_is_a_concurrency_conflict() {
        let cause = BackendError::VersionMismatch {
            aggregate_id: AggregateId::try_new("order-1").unwrap(),
            expected: Version::new(3),
        };
        let error = EventStoreError::in_scope(ErrorKind::CouldNotSaveAggregate, &order_scope())
            .with_source(cause);

        assert!(error.is_concurrency_conflict());
    }

    #[test]
    fn held_slot_needs_repair_instead_of_a_retry() {
        let cause = BackendError::SlotHeld {
            aggregate_id: AggregateId::try_new("order-1").unwrap(),
            version: Version::new(4),
        };
        let error = EventStoreError::in_scope(ErrorKind::CouldNotSaveAggregate, &order_scope())
            .with_source(cause);

        assert!(error.needs_repair());
        assert!(!error.is_concurrency_conflict());
        assert_eq!(error.context(), &ErrorContext::from(&order_scope()));
    }

    #[test]
    fn taken_record_id_is_neither_conflict_nor_repairable() {
        let error = EventStoreError::in_scope(ErrorKind::CouldNotSaveAggregate, &order_scope())
            .with_source(BackendError::DuplicateKey {
                collection: "Order_events".to_string(),
                key: "0190f3a2-0000-7000-8000-000000000000".to_string(),
            });

        assert!(!error.is_concurrency_conflict());
        assert!(!error.needs_repair());
    }

    #[test]
    fn unavailable_backend_is_not_a_concurrency_conflict() {
        let error = EventStoreError::in_scope(ErrorKind::CouldNotSaveAggregate, &order_scope())
            .with_source(BackendError::Unavailable("closed".to_string()));

        assert!(!error.is_concurrency_conflict());
    }

    #[test]
    fn validation_errors_are_not_concurrency_conflicts() {
        let error = EventStoreError::new(ErrorKind::IncorrectEventVersion);
        assert!(!error.is_concurrency_conflict());
    }
}
