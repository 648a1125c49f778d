//! Typed endpoint handles and subscriptions.
//!
//! Registering an endpoint returns a [`QueryEndpoint`] or [`MutationEndpoint`]
//! carrying the argument and result types. Initiating a query returns a
//! [`QueryHandle`] that keeps the cache entry subscribed until it is dropped.
//!
//! # Example
//!
//! ```
//! use cloudburst::prelude::*;
//! use cloudburst::mock::MockTransport;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut builder = Api::builder(MockTransport::new(|args| Ok(json!(args["id"]))));
//! let get_post = builder.query("getPost", QueryDefinition::<u32, u32>::new().query(|id| json!({ "id": id })))?;
//! let api = builder.build();
//!
//! let handle = get_post.initiate(&api, &7, InitiateOptions::default())?;
//! assert_eq!(handle.result().await?, 7);
//! assert!(handle.select().is_success());
//!
//! drop(handle); // unsubscribes; the entry is removed after `keep_unused_data_for`
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::api::Api;
use crate::definition::EndpointKind;
use crate::error::{ApiError, QueryError};
use crate::key::{CacheKey, RequestId};
use crate::selectors::{MutationResult, QueryResult};
use crate::state::{Action, QuerySubState, SubscriptionOptions};
use crate::thunks::{QueryRequest, SharedResult, start_mutation, start_queries};

/// Options of [`QueryEndpoint::initiate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitiateOptions {
    /// Start a new attempt even if fresh data is cached.
    pub force_refetch: bool,
    /// Register the handle as a subscriber of the entry.
    pub subscribe: bool,
    pub subscription_options: SubscriptionOptions,
}

impl Default for InitiateOptions {
    fn default() -> Self {
        Self {
            force_refetch: false,
            subscribe: true,
            subscription_options: SubscriptionOptions::default(),
        }
    }
}

impl InitiateOptions {
    #[must_use]
    pub const fn with_force_refetch(mut self, force: bool) -> Self {
        self.force_refetch = force;
        self
    }

    #[must_use]
    pub const fn with_subscribe(mut self, subscribe: bool) -> Self {
        self.subscribe = subscribe;
        self
    }

    #[must_use]
    pub const fn with_subscription_options(mut self, options: SubscriptionOptions) -> Self {
        self.subscription_options = options;
        self
    }
}

/// Options of [`MutationEndpoint::initiate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationOptions {
    /// Keep an entry for the invocation in the store until the handle is dropped.
    pub track: bool,
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self { track: true }
    }
}

/// The outcome of one attempt, decoded as `R` once it settles.
#[must_use = "futures do nothing unless polled"]
pub struct Settled<R> {
    inner: SharedResult,
    _marker: PhantomData<fn() -> R>,
}

impl<R> Settled<R> {
    const fn new(inner: SharedResult) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<R> fmt::Debug for Settled<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settled")
            .field("ready", &self.inner.peek().is_some())
            .finish()
    }
}

impl<R: DeserializeOwned> Future for Settled<R> {
    type Output = Result<R, QueryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner
            .poll_unpin(cx)
            .map(|outcome| outcome.and_then(|value| serde_json::from_value(value).map_err(QueryError::from)))
    }
}

/// A registered query endpoint taking `A` and producing `R`.
pub struct QueryEndpoint<A, R> {
    name: Arc<str>,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for QueryEndpoint<A, R> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            _marker: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for QueryEndpoint<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueryEndpoint").field(&self.name).finish()
    }
}

fn serialize_arg<A: Serialize>(endpoint: &str, arg: &A) -> Result<Value, ApiError> {
    serde_json::to_value(arg).map_err(|source| ApiError::Serialization {
        endpoint: endpoint.to_string(),
        source,
    })
}

impl<A, R> QueryEndpoint<A, R> {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<A: Serialize, R> QueryEndpoint<A, R> {
    pub(crate) fn serialize_arg(&self, arg: &A) -> Result<Value, ApiError> {
        serialize_arg(&self.name, arg)
    }

    /// The cache key of this endpoint called with `arg`.
    ///
    /// # Errors
    ///
    /// Fails if `arg` does not serialize.
    pub fn cache_key(&self, api: &Api, arg: &A) -> Result<CacheKey, ApiError> {
        Ok(api.cache_key_of(&self.name, &self.serialize_arg(arg)?))
    }
}

impl<A: Serialize, R: DeserializeOwned> QueryEndpoint<A, R> {
    /// Starts (or joins) the query for `arg`.
    ///
    /// No attempt starts when one is already in flight for the same key, or
    /// when fresh data is cached and `force_refetch` is off. The subscriber
    /// is registered either way.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint is not a registered query or `arg` does not serialize.
    pub fn initiate(&self, api: &Api, arg: &A, options: InitiateOptions) -> Result<QueryHandle<R>, ApiError> {
        let definition = api.definition_of(&self.name, EndpointKind::Query)?;
        let original_args = self.serialize_arg(arg)?;
        let key = api.cache_key_of(&self.name, &original_args);
        let transport_args = definition
            .transport_args(&original_args)
            .map_err(|source| ApiError::Serialization {
                endpoint: self.name.to_string(),
                source,
            })?;

        let subscriber = options.subscribe.then(RequestId::new);
        let request = QueryRequest {
            key: key.clone(),
            endpoint: Arc::clone(&self.name),
            definition,
            original_args: original_args.clone(),
            transport_args: transport_args.clone(),
            force_refetch: options.force_refetch,
            subscribe: subscriber.map(|id| (id, options.subscription_options)),
        };
        let result = start_queries(api, |_| (vec![request], Vec::new()))
            .pop()
            .unwrap_or_else(aborted);

        Ok(QueryHandle {
            api: api.clone(),
            key,
            endpoint: Arc::clone(&self.name),
            original_args,
            transport_args,
            subscriber,
            options: options.subscription_options,
            result,
            _marker: PhantomData,
        })
    }

    /// The current state of the query for `arg`.
    ///
    /// # Errors
    ///
    /// Fails if `arg` does not serialize.
    pub fn select(&self, api: &Api, arg: &A) -> Result<QueryResult<R>, ApiError> {
        let key = self.cache_key(api, arg)?;
        Ok(select_query(api, &key))
    }

    /// A live view of the query for `arg`.
    ///
    /// # Errors
    ///
    /// Fails if `arg` does not serialize.
    pub fn view(&self, api: &Api, arg: &A) -> Result<QueryView<R>, ApiError> {
        let key = self.cache_key(api, arg)?;
        Ok(QueryView::new(api.clone(), key))
    }
}

fn aborted() -> SharedResult {
    futures::future::ready(Err(QueryError::Aborted)).boxed().shared()
}

fn select_query<R: DeserializeOwned>(api: &Api, key: &CacheKey) -> QueryResult<R> {
    let stale_time = api.config().stale_time;
    api.with_state(|state| QueryResult::from_entry(state.queries.get(key), stale_time))
}

/// A subscription to one query entry.
///
/// Dropping the handle unsubscribes. Once an entry has no subscribers it is
/// removed after the API's `keep_unused_data_for`.
pub struct QueryHandle<R> {
    api: Api,
    key: CacheKey,
    endpoint: Arc<str>,
    original_args: Value,
    transport_args: Option<Value>,
    subscriber: Option<RequestId>,
    options: SubscriptionOptions,
    result: SharedResult,
    _marker: PhantomData<fn() -> R>,
}

impl<R> fmt::Debug for QueryHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("key", &self.key)
            .field("subscriber", &self.subscriber)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<R: DeserializeOwned> QueryHandle<R> {
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    /// `None` if the handle was initiated without subscribing.
    #[must_use]
    pub const fn subscriber_id(&self) -> Option<RequestId> {
        self.subscriber
    }

    /// Settles with the outcome of the attempt this handle last started or
    /// joined.
    pub fn result(&self) -> Settled<R> {
        Settled::new(self.result.clone())
    }

    /// Forces a new attempt unless one is already in flight.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint was removed from the API.
    pub fn refetch(&mut self) -> Result<Settled<R>, ApiError> {
        let definition = self.api.definition_of(&self.endpoint, EndpointKind::Query)?;
        let request = QueryRequest {
            key: self.key.clone(),
            endpoint: Arc::clone(&self.endpoint),
            definition,
            original_args: self.original_args.clone(),
            transport_args: self.transport_args.clone(),
            force_refetch: true,
            subscribe: self.subscriber.map(|id| (id, self.options)),
        };
        self.result = start_queries(&self.api, |_| (vec![request], Vec::new()))
            .pop()
            .unwrap_or_else(aborted);
        Ok(self.result())
    }

    #[must_use]
    pub fn select(&self) -> QueryResult<R> {
        select_query(&self.api, &self.key)
    }

    #[must_use]
    pub fn view(&self) -> QueryView<R> {
        QueryView::new(self.api.clone(), self.key.clone())
    }

    /// Replaces this subscriber's options, for example to start polling.
    pub fn update_subscription_options(&mut self, options: SubscriptionOptions) {
        self.options = options;
        if let Some(subscriber) = self.subscriber {
            self.api.dispatch(Action::UpdateSubscriptionOptions {
                key: self.key.clone(),
                subscriber,
                options,
            });
        }
    }

    /// Same as dropping the handle.
    pub fn unsubscribe(self) {}
}

impl<R> Drop for QueryHandle<R> {
    fn drop(&mut self) {
        if let Some(subscriber) = self.subscriber.take() {
            self.api.dispatch(Action::Unsubscribe {
                key: self.key.clone(),
                subscriber,
            });
        }
    }
}

/// A view of one query entry that can wait for changes.
pub struct QueryView<R> {
    api: Api,
    key: CacheKey,
    revision: watch::Receiver<u64>,
    last: Option<QuerySubState>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> fmt::Debug for QueryView<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryView").field("key", &self.key).finish_non_exhaustive()
    }
}

impl<R: DeserializeOwned> QueryView<R> {
    fn new(api: Api, key: CacheKey) -> Self {
        let mut revision = api.changes();
        revision.borrow_and_update();
        let last = api.query_entry(&key);
        Self {
            api,
            key,
            revision,
            last,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn current(&self) -> QueryResult<R> {
        QueryResult::from_entry(self.last.as_ref(), self.api.config().stale_time)
    }

    /// Waits until the entry differs from the last state this view returned.
    ///
    /// Returns `None` once the API is gone.
    pub async fn changed(&mut self) -> Option<QueryResult<R>> {
        loop {
            self.revision.changed().await.ok()?;
            let entry = self.api.query_entry(&self.key);
            if entry != self.last {
                self.last = entry;
                return Some(self.current());
            }
        }
    }
}

/// A registered mutation endpoint taking `A` and producing `R`.
pub struct MutationEndpoint<A, R> {
    name: Arc<str>,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for MutationEndpoint<A, R> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            _marker: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for MutationEndpoint<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MutationEndpoint").field(&self.name).finish()
    }
}

impl<A, R> MutationEndpoint<A, R> {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<A: Serialize, R: DeserializeOwned> MutationEndpoint<A, R> {
    /// Runs the mutation once with `arg`. Mutations are never deduplicated.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint is not a registered mutation or `arg` does not serialize.
    pub fn initiate(&self, api: &Api, arg: &A, options: MutationOptions) -> Result<MutationHandle<R>, ApiError> {
        let definition = api.definition_of(&self.name, EndpointKind::Mutation)?;
        let original_args = serialize_arg(&self.name, arg)?;
        let started = start_mutation(api, Arc::clone(&self.name), definition, original_args, options.track);
        Ok(MutationHandle {
            api: api.clone(),
            request_id: started.request_id,
            token: started.token,
            result: started.result,
            tracked: options.track,
            _marker: PhantomData,
        })
    }
}

/// One mutation invocation. Dropping a tracked handle removes its entry.
pub struct MutationHandle<R> {
    api: Api,
    request_id: RequestId,
    token: CancellationToken,
    result: SharedResult,
    tracked: bool,
    _marker: PhantomData<fn() -> R>,
}

impl<R> fmt::Debug for MutationHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationHandle")
            .field("request_id", &self.request_id)
            .field("tracked", &self.tracked)
            .finish_non_exhaustive()
    }
}

impl<R: DeserializeOwned> MutationHandle<R> {
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn result(&self) -> Settled<R> {
        Settled::new(self.result.clone())
    }

    /// Cancels the invocation. It settles as rejected with [`QueryError::Aborted`].
    pub fn abort(&self) {
        tracing::debug!(request_id = %self.request_id, "Aborting mutation");
        self.token.cancel();
    }

    #[must_use]
    pub fn select(&self) -> MutationResult<R> {
        self.api
            .with_state(|state| MutationResult::from_entry(state.mutations.get(&self.request_id)))
    }

    /// Same as dropping the handle.
    pub fn unsubscribe(self) {}
}

impl<R> Drop for MutationHandle<R> {
    fn drop(&mut self) {
        if self.tracked {
            self.tracked = false;
            self.api.dispatch(Action::RemoveMutationResult {
                request_id: self.request_id,
            });
        }
    }
}
