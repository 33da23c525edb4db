//! Core types for the eventkeep event log.
//!
//! This module defines the fundamental identifiers and values used throughout
//! the crate. All types use smart constructors to ensure validity at
//! construction time, following the "parse, don't validate" principle.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validation::is_collection_name;

/// Identifier of an aggregate, the owner of an ordered event history.
///
/// `AggregateId` values are guaranteed to be non-empty and at most 255 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateId(String);

/// Discriminator naming the collection pair an aggregate's records live in.
///
/// Restricted to identifier characters because it becomes a collection (table)
/// name in the backing store.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 63, predicate = is_collection_name),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateType(String);

/// Tenant-level partition of the backing store (a database or schema).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 63, predicate = is_collection_name),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Namespace(String);

impl Namespace {
    /// The namespace used when the caller does not partition its data.
    pub fn default_namespace() -> Self {
        Self::try_new("default").expect("\"default\" is always a valid namespace")
    }
}

/// String tag identifying the logical type of an event payload.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventType(String);

/// Unique identifier of a stored event record.
///
/// Records written by this crate get a UUIDv7 (see [`EventId::generate`]), but
/// ids supplied by producers may use any UUID version.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    AsRef,
    Deref,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a fresh, time-ordered identifier.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Version of an aggregate, or position of an event within its aggregate.
///
/// An aggregate at version `n` owns exactly the events `1..=n`. Version 0 means
/// "no events yet" and is never carried by an event.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct Version(u64);

impl Version {
    /// The version of an aggregate that has no events.
    pub fn initial() -> Self {
        Self::new(0)
    }

    /// Returns the version directly after this one, `None` past `u64::MAX`.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        self.advanced_by(1)
    }

    /// Returns this version advanced by `count` events, `None` on overflow.
    #[must_use]
    pub fn advanced_by(self, count: u64) -> Option<Self> {
        self.into_inner().checked_add(count).map(Self::new)
    }

    /// Returns whether this is the version of an aggregate without events.
    pub fn is_initial(self) -> bool {
        self.into_inner() == 0
    }
}

/// A timestamp for when an event occurred.
///
/// Set by the producer of the event and preserved verbatim by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The (namespace, aggregate type) pair every store operation works within.
///
/// A scope names exactly two backing collections: the aggregates collection,
/// holding one version record per aggregate, and the events collection,
/// holding the event records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    namespace: Namespace,
    aggregate_type: AggregateType,
}

impl Scope {
    /// Creates a scope inside an explicit namespace.
    pub const fn new(namespace: Namespace, aggregate_type: AggregateType) -> Self {
        Self {
            namespace,
            aggregate_type,
        }
    }

    /// Creates a scope inside the default namespace.
    pub fn for_aggregate_type(aggregate_type: AggregateType) -> Self {
        Self::new(Namespace::default_namespace(), aggregate_type)
    }

    /// The namespace of this scope.
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The aggregate type of this scope.
    pub const fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_type
    }

    /// Name of the collection holding aggregate records.
    pub fn aggregates_collection(&self) -> &str {
        self.aggregate_type.as_ref()
    }

    /// Name of the collection holding event records.
    pub fn events_collection(&self) -> String {
        format!("{}_events", self.aggregate_type)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.aggregate_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn aggregate_id_accepts_valid_strings(s in "[a-zA-Z0-9_-]{1,255}") {
            let result = AggregateId::try_new(s.clone());
            prop_assert!(result.is_ok());
            let aggregate_id = result.unwrap();
            prop_assert_eq!(aggregate_id.as_ref(), &s);
        }

        #[test]
        fn aggregate_id_rejects_blank_strings(s in " {0,50}") {
            prop_assert!(AggregateId::try_new(s).is_err());
        }

        #[test]
        fn aggregate_type_accepts_identifiers(s in "[a-zA-Z_][a-zA-Z0-9_]{0,62}") {
            prop_assert!(AggregateType::try_new(s).is_ok());
        }

        #[test]
        fn aggregate_type_rejects_separators(prefix in "[a-z]{1,10}", sep in "[.\\-/ \"]", suffix in "[a-z]{1,10}") {
            let candidate = format!("{prefix}{sep}{suffix}");
            prop_assert!(AggregateType::try_new(candidate).is_err());
        }

        #[test]
        fn version_advanced_by_matches_repeated_next(start in 0u64..10_000, count in 0u64..100) {
            let mut stepped = Version::new(start);
            for _ in 0..count {
                stepped = stepped.next().unwrap();
            }
            prop_assert_eq!(Version::new(start).advanced_by(count), Some(stepped));
        }
    }

    #[test]
    fn versions_stop_at_the_top_of_the_range() {
        let last = Version::new(u64::MAX);
        assert_eq!(last.next(), None);
        assert_eq!(Version::new(u64::MAX - 2).advanced_by(3), None);
        assert_eq!(Version::new(u64::MAX - 2).advanced_by(2), Some(last));
    }

    #[test]
    fn event_type_trims_whitespace() {
        let event_type = EventType::try_new("  ItemCreated ").unwrap();
        assert_eq!(event_type.as_ref(), "ItemCreated");
    }

    #[test]
    fn aggregate_type_longer_than_63_chars_is_rejected() {
        assert!(AggregateType::try_new("a".repeat(64)).is_err());
    }

    #[test]
    fn generated_event_ids_are_unique_v7() {
        let first = EventId::generate();
        let second = EventId::generate();
        assert_ne!(first, second);
        assert_eq!(first.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn initial_version_is_zero() {
        assert!(Version::initial().is_initial());
        assert_eq!(Version::initial().next(), Some(Version::new(1)));
    }

    #[test]
    fn scope_names_its_collections() {
        let scope = Scope::new(
            Namespace::try_new("tenant_a").unwrap(),
            AggregateType::try_new("Order").unwrap(),
        );
        assert_eq!(scope.aggregates_collection(), "Order");
        assert_eq!(scope.events_collection(), "Order_events");
        assert_eq!(scope.to_string(), "tenant_a/Order");
    }

    #[test]
    fn default_scope_uses_default_namespace() {
        let scope = Scope::for_aggregate_type(AggregateType::try_new("Order").unwrap());
        assert_eq!(scope.namespace().as_ref(), "default");
    }

    #[test]
    fn timestamp_round_trips_through_datetime() {
        let now = Utc::now();
        let timestamp = Timestamp::from(now);
        assert_eq!(DateTime::<Utc>::from(timestamp), now);
    }
}
