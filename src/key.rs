use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    mutation::{Mutation, MutationStatus},
    query::Query,
    query_state::FetchStatus,
};

/// A structured query identifier: an ordered sequence of JSON segments.
///
/// Keys are compared by deterministic structural hash, never by reference, so
/// two keys built independently from the same data address the same cache
/// entry. Use the [`query_key!`](crate::query_key) macro to build one:
///
/// ```
/// use refetch::query_key;
///
/// let key = query_key!["todos", 5, { "done": false }];
/// assert_eq!(key.0.len(), 3);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryKey(pub Vec<Value>);

impl QueryKey {
    /// Build a key from pre-assembled JSON segments.
    pub fn new(segments: Vec<Value>) -> Self {
        Self(segments)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(segments: Vec<Value>) -> Self {
        Self(segments)
    }
}

/// Build a [`QueryKey`] from JSON-like segments.
///
/// Each segment goes through [`serde_json::json!`], so plain literals, object
/// literals and expressions all work.
#[macro_export]
macro_rules! query_key {
    ($($segment:tt),* $(,)?) => {
        $crate::QueryKey(vec![$($crate::__serde_json::json!($segment)),*])
    };
}

/// Hash a key into the string used as the cache's primary index.
///
/// Object keys are serialized in sorted order at every nesting level, so keys
/// that are structurally equal but were built with different property
/// insertion order hash identically. Arrays and primitives keep their order.
pub fn hash_query_key(key: &QueryKey) -> String {
    let mut out = String::from("[");
    for (index, segment) in key.0.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_stable(segment, &mut out);
    }
    out.push(']');
    out
}

fn write_stable(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).expect("string serialization is infallible"),
                );
                out.push(':');
                write_stable(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        other => {
            out.push_str(
                &serde_json::to_string(other).expect("scalar serialization is infallible"),
            );
        }
    }
}

/// Whether `partial` is a prefix-structural-subset of `key`.
///
/// Every segment of `partial` must match the corresponding segment of `key`;
/// objects match when every property of the partial object matches the same
/// property of the full one, recursively.
pub fn partial_match_key(key: &QueryKey, partial: &QueryKey) -> bool {
    if partial.0.len() > key.0.len() {
        return false;
    }
    partial
        .0
        .iter()
        .zip(key.0.iter())
        .all(|(partial, full)| partial_match_value(full, partial))
}

fn partial_match_value(value: &Value, partial: &Value) -> bool {
    match (value, partial) {
        (Value::Object(value), Value::Object(partial)) => partial.iter().all(|(key, expected)| {
            value
                .get(key)
                .map(|actual| partial_match_value(actual, expected))
                .unwrap_or(false)
        }),
        (Value::Array(value), Value::Array(partial)) => {
            partial.len() <= value.len()
                && partial
                    .iter()
                    .zip(value.iter())
                    .all(|(expected, actual)| partial_match_value(actual, expected))
        }
        (value, partial) => value == partial,
    }
}

/// Which queries a filter should consider, based on observer count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueryTypeFilter {
    /// Queries with at least one attached observer.
    Active,
    /// Queries with no attached observers.
    Inactive,
    /// All queries.
    #[default]
    All,
}

/// Criteria for selecting queries in bulk operations.
///
/// All fields are optional and AND-combined. A bare [`QueryKey`] converts into
/// a partial-match filter, which is what the bulk operations on
/// [`QueryClient`](crate::QueryClient) default to.
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Match against the query key, exactly or partially depending on `exact`.
    pub query_key: Option<QueryKey>,
    /// Require an exact key match. Unset means partial matching for bulk
    /// lookups; single-entity `find` defaults this to `true`.
    pub exact: Option<bool>,
    /// Restrict to active or inactive queries.
    pub query_type: QueryTypeFilter,
    /// Match against computed staleness.
    pub stale: Option<bool>,
    /// Match against the current fetch status.
    pub fetch_status: Option<FetchStatus>,
    /// Arbitrary predicate over the query.
    pub predicate: Option<Rc<dyn Fn(&Query) -> bool>>,
}

impl From<QueryKey> for QueryFilters {
    fn from(query_key: QueryKey) -> Self {
        Self {
            query_key: Some(query_key),
            ..Default::default()
        }
    }
}

/// Criteria for selecting mutations, mirroring [`QueryFilters`].
#[derive(Clone, Default)]
pub struct MutationFilters {
    /// Match against the optional mutation key.
    pub mutation_key: Option<QueryKey>,
    /// Require an exact key match (partial when unset).
    pub exact: Option<bool>,
    /// Match against the mutation status.
    pub status: Option<MutationStatus>,
    /// Arbitrary predicate over the mutation.
    pub predicate: Option<Rc<dyn Fn(&Mutation) -> bool>>,
}

impl From<QueryKey> for MutationFilters {
    fn from(mutation_key: QueryKey) -> Self {
        Self {
            mutation_key: Some(mutation_key),
            ..Default::default()
        }
    }
}

/// Evaluate a filter against a query. All present fields must match.
pub fn match_query(filters: &QueryFilters, query: &Query) -> bool {
    if let Some(key) = &filters.query_key {
        if filters.exact.unwrap_or(false) {
            if query.query_hash() != hash_query_key(key) {
                return false;
            }
        } else if !partial_match_key(query.query_key(), key) {
            return false;
        }
    }

    match filters.query_type {
        QueryTypeFilter::Active if !query.is_active() => return false,
        QueryTypeFilter::Inactive if query.is_active() => return false,
        _ => {}
    }

    if let Some(stale) = filters.stale {
        if query.is_stale() != stale {
            return false;
        }
    }

    if let Some(fetch_status) = filters.fetch_status {
        if query.state().fetch_status != fetch_status {
            return false;
        }
    }

    if let Some(predicate) = &filters.predicate {
        if !predicate(query) {
            return false;
        }
    }

    true
}

/// Evaluate a filter against a mutation.
pub fn match_mutation(filters: &MutationFilters, mutation: &Mutation) -> bool {
    if let Some(key) = &filters.mutation_key {
        match mutation.mutation_key() {
            None => return false,
            Some(actual) => {
                if filters.exact.unwrap_or(false) {
                    if hash_query_key(&actual) != hash_query_key(key) {
                        return false;
                    }
                } else if !partial_match_key(&actual, key) {
                    return false;
                }
            }
        }
    }

    if let Some(status) = filters.status {
        if mutation.state().status != status {
            return false;
        }
    }

    if let Some(predicate) = &filters.predicate {
        if !predicate(mutation) {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_insensitive_to_object_key_order() {
        let a = QueryKey(vec![json!("todos"), json!({ "page": 1, "filter": "done" })]);
        let b = QueryKey(vec![json!("todos"), json!({ "filter": "done", "page": 1 })]);
        assert_eq!(hash_query_key(&a), hash_query_key(&b));
    }

    #[test]
    fn hash_sorts_nested_objects() {
        let a = query_key!([{ "b": { "y": 2, "x": 1 }, "a": 0 }]);
        let b = query_key!([{ "a": 0, "b": { "x": 1, "y": 2 } }]);
        assert_eq!(hash_query_key(&a), hash_query_key(&b));
    }

    #[test]
    fn hash_preserves_array_order() {
        let a = query_key![[1, 2]];
        let b = query_key![[2, 1]];
        assert_ne!(hash_query_key(&a), hash_query_key(&b));
    }

    #[test]
    fn hash_distinguishes_value_types() {
        assert_ne!(hash_query_key(&query_key![1]), hash_query_key(&query_key!["1"]));
    }

    #[test]
    fn partial_match_accepts_prefix() {
        let key = query_key!["todos", 5, { "done": true }];
        assert!(partial_match_key(&key, &query_key!["todos"]));
        assert!(partial_match_key(&key, &query_key!["todos", 5]));
        assert!(partial_match_key(&key, &key));
    }

    #[test]
    fn partial_match_rejects_longer_partial() {
        let key = query_key!["todos"];
        assert!(!partial_match_key(&key, &query_key!["todos", 5]));
    }

    #[test]
    fn partial_match_objects_by_subset() {
        let key = query_key!["todos", { "page": 1, "filter": "done" }];
        assert!(partial_match_key(&key, &query_key!["todos", { "page": 1 }]));
        assert!(!partial_match_key(&key, &query_key!["todos", { "page": 2 }]));
        assert!(!partial_match_key(&key, &query_key!["todos", { "missing": 1 }]));
    }

    #[test]
    fn partial_match_requires_matching_scalars() {
        let key = query_key!["todos", 5];
        assert!(!partial_match_key(&key, &query_key!["posts"]));
        assert!(!partial_match_key(&key, &query_key!["todos", 6]));
    }
}
