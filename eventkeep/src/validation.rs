//! Shared validation predicates for domain types.
//!
//! This module contains validation functions used by nutype-based domain types
//! across the eventkeep crate.

/// Validation predicate: the value can name a backing collection.
///
/// Namespaces and aggregate types end up as schema and table names in SQL
/// backends, so they are restricted to ASCII letters, digits and underscores
/// and must not start with a digit. Values passing this check never need
/// escaping inside a quoted identifier.
pub(crate) fn is_collection_name(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
