//! Cache key derivation.
//!
//! A query is identified by its endpoint name plus its call argument. The
//! default serializer renders the argument as canonical JSON (object keys
//! sorted recursively) so that `{ "a": 1, "b": 2 }` and `{ "b": 2, "a": 1 }`
//! always share one cache entry.

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Stable identity of one query's `(endpoint, argument)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wraps an already-derived key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one request attempt, one subscriber, or one mutation invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Strategy mapping `(endpoint, argument)` to a [`CacheKey`].
///
/// Implemented for plain functions and closures, so a custom serializer can be
/// as small as:
///
/// ```
/// use cloudburst::key::{CacheKey, SerializeQueryArgs, default_serialize_query_args};
/// use serde_json::Value;
///
/// // Ignore the `trace_id` field when computing cache identity.
/// let serializer = |endpoint: &str, args: &Value| {
///     let mut args = args.clone();
///     if let Some(map) = args.as_object_mut() {
///         map.remove("trace_id");
///     }
///     default_serialize_query_args(endpoint, &args)
/// };
/// let key = serializer.serialize("search", &serde_json::json!({ "q": "x", "trace_id": 7 }));
/// assert_eq!(key.as_str(), r#"search({"q":"x"})"#);
/// ```
pub trait SerializeQueryArgs: Send + Sync + 'static {
    /// Derives the cache key. Must be pure: equal inputs give equal keys.
    fn serialize(&self, endpoint: &str, args: &Value) -> CacheKey;
}

impl<F> SerializeQueryArgs for F
where
    F: Fn(&str, &Value) -> CacheKey + Send + Sync + 'static,
{
    fn serialize(&self, endpoint: &str, args: &Value) -> CacheKey {
        self(endpoint, args)
    }
}

/// The default key serializer: `endpoint(<canonical json>)`.
#[must_use]
pub fn default_serialize_query_args(endpoint: &str, args: &Value) -> CacheKey {
    let mut out = String::with_capacity(endpoint.len() + 16);
    out.push_str(endpoint);
    out.push('(');
    write_canonical(&mut out, args);
    out.push(')');
    CacheKey(out)
}

/// Writes `value` as compact JSON with object keys in sorted order.
fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Display on a string Value yields the quoted, escaped form
                let _ = write!(out, "{}", Value::String(key.clone()));
                out.push(':');
                write_canonical(out, item);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}
