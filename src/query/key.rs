use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::Value;

/// One segment of a [`QueryKey`].
pub type KeySegment = Value;

/// Identifies a logical query.
///
/// A key is an ordered list of JSON segments. Two keys are equal when their
/// segments are deeply equal in order. The [`query_hash`](QueryKey::query_hash)
/// is the canonical JSON rendering and is what caches are keyed by.
///
/// # Example
///
/// ```rust
/// use query_atoms::query_key;
///
/// let key = query_key!["todos", 1];
/// assert_eq!(key.query_hash(), r#"["todos",1]"#);
/// assert!(key.starts_with(&query_key!["todos"]));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    pub const fn new(segments: Vec<Value>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical string form of the key. Object members are sorted, so keys
    /// that differ only in member order hash the same.
    pub fn query_hash(&self) -> String {
        Value::Array(self.0.clone()).to_string()
    }

    /// Returns `true` if `prefix` partially matches the start of this key.
    ///
    /// Arrays match element-wise as prefixes and objects match when every
    /// member of the pattern matches, so `["todos", {"done": true}]` is matched
    /// by `["todos"]` and by `["todos", {}]`.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        partial_match_slice(&self.0, &prefix.0)
    }

    /// Matches this key against a filter key, exactly or by prefix.
    pub fn matches(&self, filter: &QueryKey, exact: bool) -> bool {
        if exact {
            self.query_hash() == filter.query_hash()
        } else {
            self.starts_with(filter)
        }
    }
}

fn partial_match_slice(value: &[Value], pattern: &[Value]) -> bool {
    pattern.len() <= value.len()
        && pattern
            .iter()
            .zip(value)
            .all(|(pattern, value)| partial_match(value, pattern))
}

fn partial_match(value: &Value, pattern: &Value) -> bool {
    match (value, pattern) {
        (Value::Object(value), Value::Object(pattern)) => pattern
            .iter()
            .all(|(name, pattern)| value.get(name).is_some_and(|v| partial_match(v, pattern))),
        (Value::Array(value), Value::Array(pattern)) => partial_match_slice(value, pattern),
        _ => value == pattern,
    }
}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.query_hash().hash(state);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.query_hash())
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(segments: Vec<Value>) -> Self {
        Self(segments)
    }
}

impl From<&str> for QueryKey {
    fn from(segment: &str) -> Self {
        Self(vec![Value::from(segment)])
    }
}

impl From<String> for QueryKey {
    fn from(segment: String) -> Self {
        Self(vec![Value::from(segment)])
    }
}

/// Builds a [`QueryKey`] from segments convertible into JSON values.
///
/// ```rust
/// use query_atoms::query_key;
///
/// let user = 7;
/// let key = query_key!["users", user, "posts"];
/// assert_eq!(key.len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
    () => {
        $crate::query::QueryKey::default()
    };
    ($($segment:expr),+ $(,)?) => {
        $crate::query::QueryKey::new(::std::vec![
            $($crate::query::KeySegment::from($segment)),+
        ])
    };
}

/// Whether a filter selects active, inactive or all queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryTypeFilter {
    #[default]
    All,
    Active,
    Inactive,
}

/// Selects queries for client-wide operations such as invalidation.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub query_key: Option<QueryKey>,
    pub exact: bool,
    pub kind: QueryTypeFilter,
}

impl QueryFilters {
    /// Matches every query.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches queries whose key starts with `key`.
    pub fn key(key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(key.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn exact(mut self) -> Self {
        self.exact = true;
        self
    }

    #[must_use]
    pub const fn with_kind(mut self, kind: QueryTypeFilter) -> Self {
        self.kind = kind;
        self
    }

    pub(crate) fn matches(&self, key: &QueryKey, active: bool) -> bool {
        let kind = match self.kind {
            QueryTypeFilter::All => true,
            QueryTypeFilter::Active => active,
            QueryTypeFilter::Inactive => !active,
        };
        kind && self
            .query_key
            .as_ref()
            .is_none_or(|filter| key.matches(filter, self.exact))
    }
}

impl From<QueryKey> for QueryFilters {
    fn from(key: QueryKey) -> Self {
        Self::key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_hash_is_canonical() {
        let a = query_key!["todos", json!({"page": 1, "done": true})];
        let b = query_key!["todos", json!({"done": true, "page": 1})];
        assert_eq!(a.query_hash(), b.query_hash());
        assert_eq!(a.query_hash(), r#"["todos",{"done":true,"page":1}]"#);
    }

    #[test]
    fn test_key_equality_is_order_sensitive() {
        assert_eq!(query_key!["a", 1], query_key!["a", 1]);
        assert_ne!(query_key!["a", 1], query_key![1, "a"]);
    }

    #[test]
    fn test_prefix_matching() {
        let key = query_key!["todos", json!({"status": "done", "page": 2})];
        assert!(key.starts_with(&query_key!["todos"]));
        assert!(key.starts_with(&query_key!["todos", json!({"status": "done"})]));
        assert!(!key.starts_with(&query_key!["todos", json!({"status": "open"})]));
        assert!(!key.starts_with(&query_key!["posts"]));
        assert!(key.starts_with(&query_key![]));
    }

    #[test]
    fn test_filters() {
        let key = query_key!["todos", 1];

        assert!(QueryFilters::all().matches(&key, false));
        assert!(QueryFilters::key("todos").matches(&key, false));
        assert!(!QueryFilters::key("todos").exact().matches(&key, false));
        assert!(
            QueryFilters::key(query_key!["todos", 1])
                .exact()
                .matches(&key, true)
        );
        assert!(
            !QueryFilters::all()
                .with_kind(QueryTypeFilter::Active)
                .matches(&key, false)
        );
    }
}
