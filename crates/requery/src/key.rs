use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Cache identity of a query.
///
/// A key is either a single primitive or an ordered sequence of
/// JSON-serializable values, and canonicalizes to a stable string: primitives
/// to their own string form, sequences to their structural JSON encoding.
/// The encoding preserves order and element type, so `["todo", 1]` and
/// `["todo", "1"]` are distinct identities. Two keys are equal iff their
/// canonical forms are equal.
///
/// Keys are cheap to clone and hash on the canonical form.
#[derive(Debug, Clone, Eq)]
pub struct QueryKey {
    canonical: Arc<str>,
}

impl QueryKey {
    /// Canonicalizes an ordered sequence of values.
    ///
    /// Heterogeneous sequences are most conveniently built with
    /// [`query_key!`](crate::query_key).
    pub fn sequence<I, V>(parts: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let parts: Vec<Value> = parts.into_iter().map(Into::into).collect();
        Self {
            canonical: Value::Array(parts).to_string().into(),
        }
    }

    /// The canonical comparison form of this key.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl std::hash::Hash for QueryKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl From<&str> for QueryKey {
    fn from(key: &str) -> Self {
        Self {
            canonical: key.into(),
        }
    }
}

impl From<String> for QueryKey {
    fn from(key: String) -> Self {
        Self {
            canonical: key.into(),
        }
    }
}

macro_rules! impl_primitive_key {
    ($($ty:ty),+) => {
        $(impl From<$ty> for QueryKey {
            fn from(key: $ty) -> Self {
                Self { canonical: key.to_string().into() }
            }
        })+
    };
}

impl_primitive_key!(i32, i64, u32, u64, bool);

/// Builds a [`QueryKey`] from an ordered sequence of JSON-serializable parts.
///
/// ```
/// use requery::{query_key, QueryKey};
///
/// let by_id = query_key!["todo", 1];
/// assert_ne!(by_id, query_key!["todo", "1"]);
/// assert_eq!(by_id, QueryKey::sequence([serde_json::json!("todo"), serde_json::json!(1)]));
/// ```
#[macro_export]
macro_rules! query_key {
    ($($part:tt),+ $(,)?) => {
        $crate::QueryKey::sequence([$($crate::serde_json::json!($part)),+])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_keys() {
        assert_eq!(QueryKey::from("todos").canonical(), "todos");
        assert_eq!(QueryKey::from(7u64).canonical(), "7");
        assert_eq!(QueryKey::from("todos"), QueryKey::from(String::from("todos")));
    }

    #[test]
    fn test_sequence_preserves_order_and_type() {
        assert_eq!(query_key!["todo", 1].canonical(), r#"["todo",1]"#);
        assert_ne!(query_key!["todo", 1], query_key!["todo", "1"]);
        assert_ne!(query_key!["a", 1], query_key![1, "a"]);
    }

    #[test]
    fn test_primitive_and_sequence_are_distinct() {
        assert_ne!(QueryKey::from("todos"), query_key!["todos"]);
    }

    #[test]
    fn test_structured_components() {
        let filtered = query_key!["todos", { "status": "done", "page": 2 }];
        // Map components encode with sorted keys, so equal maps written in a
        // different field order canonicalize identically.
        assert_eq!(filtered, query_key!["todos", { "page": 2, "status": "done" }]);
        assert_eq!(filtered.canonical(), r#"["todos",{"page":2,"status":"done"}]"#);
    }
}
