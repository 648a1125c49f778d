//! Error types.
//!
//! Two families of errors exist and they never mix:
//!
//! - [`QueryError`] is a *runtime* outcome of one request. It is stored in the
//!   cache entry of the query or mutation that produced it and handed to
//!   whoever awaits the request. It is never raised to the caller of
//!   `initiate`.
//! - [`ApiError`] reports a *setup* defect (duplicate endpoint, missing
//!   executor, unserializable argument). It is returned synchronously.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::definition::EndpointKind;
use crate::key::CacheKey;
use crate::patch::PatchError;

/// Error produced by a query or mutation attempt.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum QueryError {
    /// The transport settled with an error payload. The payload is kept verbatim.
    #[error("Transport error: {0}")]
    Transport(Value),

    /// The executor failed (for example it panicked).
    #[error("Execution failed: {0}")]
    Execution(String),

    /// The executor returned something that is neither data nor an error.
    #[error("Malformed result: {0}")]
    MalformedResult(String),

    /// A value could not be converted between its typed and JSON form.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The attempt was cancelled before it settled.
    #[error("Request aborted")]
    Aborted,
}

impl QueryError {
    /// Builds a transport error from any serializable payload.
    ///
    /// Payloads that cannot be serialized are recorded as their error message.
    pub fn transport(payload: impl Serialize) -> Self {
        match serde_json::to_value(payload) {
            Ok(value) => Self::Transport(value),
            Err(e) => Self::Transport(Value::String(e.to_string())),
        }
    }

    /// Returns `true` if this is a cancellation rather than a failure.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Error reported for a defect in how the API is set up or called.
#[derive(Error, Debug)]
pub enum ApiError {
    /// An endpoint with this name exists and overriding was not requested.
    #[error("Endpoint `{0}` is already registered (pass `override_existing` to replace it)")]
    DuplicateEndpoint(String),

    /// The definition sets neither an argument mapping nor a custom executor.
    #[error("Endpoint `{0}` defines neither `query` nor `query_fn`")]
    MissingExecutor(String),

    #[error("Unknown endpoint `{0}`")]
    UnknownEndpoint(String),

    /// A query was used as a mutation or the other way around.
    #[error("Endpoint `{name}` is a {actual}, not a {expected}")]
    KindMismatch {
        name: String,
        expected: EndpointKind,
        actual: EndpointKind,
    },

    /// The call argument could not be turned into JSON.
    #[error("Failed to serialize the argument of `{endpoint}`: {source}")]
    Serialization {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    /// Cached data did not decode as the endpoint's result type, or the edited
    /// value did not serialize back.
    #[error("Cached result of `{endpoint}` does not match its result type: {source}")]
    ResultType {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    /// Nothing is cached under the key.
    #[error("No cache entry for `{0}`")]
    MissingEntry(CacheKey),

    /// A patch did not apply to the cached data; the entry was left unchanged.
    #[error("Patches do not apply to `{key}`: {source}")]
    Patch {
        key: CacheKey,
        #[source]
        source: PatchError,
    },
}
