//! The transport contract.
//!
//! The engine never performs I/O itself. Endpoints that declare `query` hand
//! their transport arguments to the API's [`BaseQuery`]; endpoints that
//! declare `query_fn` run their own executor, which may still reach the base
//! transport through [`BaseQueryApi::base_query`].

#[cfg(feature = "retry")]
pub mod retry;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;
use crate::state::{ApiState, Store};

/// What a transport call settles with.
pub type QueryReturnValue = Result<Value, QueryError>;

/// A function from transport arguments to an eventual result.
///
/// Implemented for async closures:
///
/// ```
/// use cloudburst::QueryError;
/// use cloudburst::transport::{BaseQuery, BaseQueryApi};
/// use serde_json::{Value, json};
///
/// let transport = |args: Value, _api: BaseQueryApi| async move {
///     Ok::<_, QueryError>(json!({ "echo": args }))
/// };
/// # let _ = &transport as &dyn BaseQuery;
/// ```
pub trait BaseQuery: Send + Sync + 'static {
    /// Performs the call. Implementations should stop early when
    /// [`BaseQueryApi::signal`] is cancelled.
    fn call(&self, args: Value, api: BaseQueryApi) -> BoxFuture<'static, QueryReturnValue>;
}

impl<F, Fut> BaseQuery for F
where
    F: Fn(Value, BaseQueryApi) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueryReturnValue> + Send + 'static,
{
    fn call(&self, args: Value, api: BaseQueryApi) -> BoxFuture<'static, QueryReturnValue> {
        self(args, api).boxed()
    }
}

/// Context handed to every transport call and custom executor.
#[derive(Clone)]
pub struct BaseQueryApi {
    signal: CancellationToken,
    endpoint: Arc<str>,
    store: Weak<Store>,
    transport: Option<Arc<dyn BaseQuery>>,
}

impl fmt::Debug for BaseQueryApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseQueryApi")
            .field("endpoint", &self.endpoint)
            .field("cancelled", &self.signal.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl BaseQueryApi {
    pub(crate) fn new(
        signal: CancellationToken,
        endpoint: Arc<str>,
        store: Weak<Store>,
        transport: Arc<dyn BaseQuery>,
    ) -> Self {
        Self {
            signal,
            endpoint,
            store,
            transport: Some(transport),
        }
    }

    /// A context that is not attached to any API, for calling a transport
    /// directly.
    #[must_use]
    pub fn detached(endpoint: &str) -> Self {
        Self {
            signal: CancellationToken::new(),
            endpoint: Arc::from(endpoint),
            store: Weak::new(),
            transport: None,
        }
    }

    /// Cancelled when the attempt is aborted.
    #[must_use]
    pub const fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Name of the endpoint being executed.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Reads the current store state. `None` once the API is gone.
    pub fn with_state<T>(&self, f: impl FnOnce(&ApiState) -> T) -> Option<T> {
        self.store.upgrade().map(|store| store.read(f))
    }

    /// Calls the API's base transport with the same signal and endpoint.
    pub fn base_query(&self, args: Value) -> BoxFuture<'static, QueryReturnValue> {
        match &self.transport {
            Some(transport) => transport.call(args, self.clone()),
            None => future::ready(Err(QueryError::Execution(
                "no base transport is attached to this context".to_string(),
            )))
            .boxed(),
        }
    }
}

/// A transport for APIs whose endpoints all use `query_fn`. Calling it is a
/// setup mistake and rejects the request.
#[must_use]
pub fn dummy_base_query() -> impl BaseQuery {
    |_args: Value, api: BaseQueryApi| async move {
        tracing::error!(
            endpoint = api.endpoint(),
            "Base transport called but the API was set up without one; use `query_fn`"
        );
        Err::<Value, _>(QueryError::Execution(format!(
            "endpoint `{}` has no transport; define it with `query_fn`",
            api.endpoint()
        )))
    }
}
