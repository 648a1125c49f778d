//! Typed read-only views of cache entries.

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::QueryError;
use crate::key::RequestId;
use crate::state::{MutationSubState, QueryStatus, QuerySubState};

fn decode<T: DeserializeOwned>(data: Option<&Value>) -> (Option<T>, Option<QueryError>) {
    match data.map(|value| T::deserialize(value)) {
        None => (None, None),
        Some(Ok(data)) => (Some(data), None),
        Some(Err(e)) => (None, Some(QueryError::from(e))),
    }
}

/// The state of one query as seen by a consumer.
///
/// Data is kept while a refetch is in flight or after it failed, so a result
/// can be fetching and successful at the same time.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    pub status: QueryStatus,
    /// The last fulfilled data. Kept while a refetch is pending or after it fails.
    pub data: Option<T>,
    /// The error of the last rejected attempt.
    pub error: Option<QueryError>,
    /// `None` until the entry exists.
    pub endpoint: Option<String>,
    pub original_args: Option<Value>,
    /// The attempt that owns the entry.
    pub request_id: Option<RequestId>,
    /// Epoch milliseconds.
    pub started_at: Option<u64>,
    /// Epoch milliseconds of the last successful settlement.
    pub fulfilled_at: Option<u64>,
    stale: bool,
}

impl<T> Default for QueryResult<T> {
    fn default() -> Self {
        Self {
            status: QueryStatus::Uninitialized,
            data: None,
            error: None,
            endpoint: None,
            original_args: None,
            request_id: None,
            started_at: None,
            fulfilled_at: None,
            stale: false,
        }
    }
}

impl<T: DeserializeOwned> QueryResult<T> {
    /// Builds the view of `entry`. Data that does not decode as `T` is
    /// reported as a serialization error.
    pub(crate) fn from_entry(entry: Option<&QuerySubState>, stale_time: Option<Duration>) -> Self {
        let Some(entry) = entry else {
            return Self::default();
        };
        let (data, decode_error) = decode(entry.data.as_ref());
        Self {
            status: entry.status,
            data,
            error: decode_error.or_else(|| entry.error.clone()),
            endpoint: Some(entry.endpoint.clone()),
            original_args: Some(entry.original_args.clone()),
            request_id: Some(entry.request_id),
            started_at: Some(entry.started_at),
            fulfilled_at: entry.fulfilled_at,
            stale: entry.is_stale(stale_time),
        }
    }
}

impl<T> QueryResult<T> {
    /// Returns the data of the last successful fetch, if any.
    #[must_use]
    pub const fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Returns `true` if the query was never started.
    #[must_use]
    pub const fn is_uninitialized(&self) -> bool {
        matches!(self.status, QueryStatus::Uninitialized)
    }

    /// Returns `true` if the query is fetching for the first time.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        matches!(self.status, QueryStatus::Pending) && self.data.is_none()
    }

    /// Returns `true` if any fetch is in flight, including refetches.
    #[must_use]
    pub const fn is_fetching(&self) -> bool {
        matches!(self.status, QueryStatus::Pending)
    }

    /// Returns `true` if data is available from a successful fetch.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        match self.status {
            QueryStatus::Fulfilled => true,
            QueryStatus::Pending => self.data.is_some(),
            QueryStatus::Uninitialized | QueryStatus::Rejected => false,
        }
    }

    /// Returns `true` if the last fetch failed.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Rejected)
    }

    /// Returns `true` if the data is older than the API's stale time.
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        self.stale
    }
}

/// The state of one tracked mutation invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult<T> {
    pub status: QueryStatus,
    pub data: Option<T>,
    pub error: Option<QueryError>,
    pub endpoint: Option<String>,
    pub request_id: Option<RequestId>,
    pub started_at: Option<u64>,
    pub fulfilled_at: Option<u64>,
}

impl<T> Default for MutationResult<T> {
    fn default() -> Self {
        Self {
            status: QueryStatus::Uninitialized,
            data: None,
            error: None,
            endpoint: None,
            request_id: None,
            started_at: None,
            fulfilled_at: None,
        }
    }
}

impl<T: DeserializeOwned> MutationResult<T> {
    pub(crate) fn from_entry(entry: Option<&MutationSubState>) -> Self {
        let Some(entry) = entry else {
            return Self::default();
        };
        let (data, decode_error) = decode(entry.data.as_ref());
        Self {
            status: entry.status,
            data,
            error: decode_error.or_else(|| entry.error.clone()),
            endpoint: Some(entry.endpoint.clone()),
            request_id: Some(entry.request_id),
            started_at: Some(entry.started_at),
            fulfilled_at: entry.fulfilled_at,
        }
    }
}

impl<T> MutationResult<T> {
    #[must_use]
    pub const fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    #[must_use]
    pub const fn is_uninitialized(&self) -> bool {
        matches!(self.status, QueryStatus::Uninitialized)
    }

    #[must_use]
    pub const fn is_loading(&self) -> bool {
        matches!(self.status, QueryStatus::Pending)
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Fulfilled)
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(status: QueryStatus, data: Option<Value>) -> QuerySubState {
        let mut entry = QuerySubState::new("getPost", json!(1), RequestId::new());
        entry.status = status;
        entry.data = data;
        entry
    }

    #[test]
    fn test_missing_entry_is_uninitialized() {
        let result = QueryResult::<u32>::from_entry(None, None);
        assert!(result.is_uninitialized());
        assert!(!result.is_loading());
        assert!(!result.is_success());
        assert_eq!(result.data(), None);
    }

    #[test]
    fn test_loading_vs_fetching() {
        let first = QueryResult::<u32>::from_entry(Some(&entry(QueryStatus::Pending, None)), None);
        assert!(first.is_loading());
        assert!(first.is_fetching());
        assert!(!first.is_success());

        let refetch = QueryResult::<u32>::from_entry(Some(&entry(QueryStatus::Pending, Some(json!(3)))), None);
        assert!(!refetch.is_loading());
        assert!(refetch.is_fetching());
        assert!(refetch.is_success());
        assert_eq!(refetch.data(), Some(&3));
    }

    #[test]
    fn test_rejected_keeps_previous_data() {
        let mut rejected = entry(QueryStatus::Rejected, Some(json!(3)));
        rejected.error = Some(QueryError::transport(500));
        let result = QueryResult::<u32>::from_entry(Some(&rejected), None);
        assert!(result.is_error());
        assert!(!result.is_success());
        assert_eq!(result.data(), Some(&3));
        assert_eq!(result.error, Some(QueryError::transport(500)));
    }

    #[test]
    fn test_undecodable_data_is_an_error() {
        let result = QueryResult::<u32>::from_entry(Some(&entry(QueryStatus::Fulfilled, Some(json!("three")))), None);
        assert_eq!(result.data(), None);
        assert!(matches!(result.error, Some(QueryError::Serialization(_))));
    }

    #[test]
    fn test_mutation_predicates() {
        let entry = MutationSubState {
            status: QueryStatus::Fulfilled,
            endpoint: "addPost".into(),
            original_args: json!({ "title": "x" }),
            data: Some(json!({ "id": 9 })),
            error: None,
            request_id: RequestId::new(),
            started_at: 1,
            fulfilled_at: Some(2),
        };
        let result = MutationResult::<Value>::from_entry(Some(&entry));
        assert!(result.is_success());
        assert!(!result.is_loading());
        assert_eq!(result.data(), Some(&json!({ "id": 9 })));

        let missing = MutationResult::<Value>::from_entry(None);
        assert!(missing.is_uninitialized());
    }
}
