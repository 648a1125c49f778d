//! Endpoint definitions.
//!
//! A definition describes how one named operation executes and how its
//! result relates to entities. It is built with typed closures and erased to a
//! JSON-level [`EndpointDefinition`] at registration.
//!
//! # Example
//!
//! ```
//! use cloudburst::{EntityDescriptor, MutationDefinition, QueryDefinition};
//! use serde::{Deserialize, Serialize};
//! use serde_json::json;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Post {
//!     id: u32,
//!     title: String,
//! }
//!
//! let get_post = QueryDefinition::<u32, Post>::new()
//!     .query(|id| json!({ "url": format!("/posts/{id}") }))
//!     .provides_with(|_post, _error, id| vec![EntityDescriptor::with_id("Post", *id)]);
//!
//! let add_post = MutationDefinition::<Post, Post>::new()
//!     .query(|post| json!({ "url": "/posts", "method": "POST", "body": post }))
//!     .invalidates(["Post"]);
//! # let _ = (get_post, add_post);
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::Api;
use crate::entity::{EntityDescriptor, ResultDescription};
use crate::error::{ApiError, QueryError};
use crate::key::RequestId;
use crate::transport::{BaseQueryApi, QueryReturnValue};

/// Whether an endpoint reads (query) or writes (mutation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Query,
    Mutation,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
        })
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Marker for the kind of a [`Definition`].
pub trait Kind: sealed::Sealed + Send + Sync + 'static {
    const KIND: EndpointKind;
}

/// Marker type of query definitions.
#[derive(Debug)]
pub enum QueryKind {}

/// Marker type of mutation definitions.
#[derive(Debug)]
pub enum MutationKind {}

impl sealed::Sealed for QueryKind {}
impl sealed::Sealed for MutationKind {}

impl Kind for QueryKind {
    const KIND: EndpointKind = EndpointKind::Query;
}

impl Kind for MutationKind {
    const KIND: EndpointKind = EndpointKind::Mutation;
}

pub type QueryDefinition<A, R> = Definition<QueryKind, A, R>;
pub type MutationDefinition<A, R> = Definition<MutationKind, A, R>;

pub(crate) type ArgsFn = Arc<dyn Fn(&Value) -> Result<Value, serde_json::Error> + Send + Sync>;
pub(crate) type FinishFn = Arc<dyn Fn(Value) -> QueryReturnValue + Send + Sync>;
pub(crate) type CustomFn = Arc<dyn Fn(Value, BaseQueryApi) -> BoxFuture<'static, QueryReturnValue> + Send + Sync>;
type StartHook = Arc<dyn Fn(&Value, &mut LifecycleContext) + Send + Sync>;
type SuccessHook = Arc<dyn Fn(&Value, &mut LifecycleContext, &Value) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&Value, &mut LifecycleContext, &QueryError) + Send + Sync>;

/// How an endpoint produces its result.
#[derive(Clone)]
pub(crate) enum Executor {
    /// Arguments are mapped to transport arguments and sent to the base transport.
    Transport { query: ArgsFn, finish: FinishFn },
    /// A custom executor replaces the transport.
    Custom(CustomFn),
}

#[derive(Clone, Default)]
pub(crate) struct Hooks {
    on_start: Option<StartHook>,
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
}

impl Hooks {
    pub(crate) fn on_start(&self, arg: &Value, ctx: &mut LifecycleContext) {
        if let Some(hook) = &self.on_start {
            hook(arg, ctx);
        }
    }

    pub(crate) fn on_success(&self, arg: &Value, ctx: &mut LifecycleContext, data: &Value) {
        if let Some(hook) = &self.on_success {
            hook(arg, ctx, data);
        }
    }

    pub(crate) fn on_error(&self, arg: &Value, ctx: &mut LifecycleContext, error: &QueryError) {
        if let Some(hook) = &self.on_error {
            hook(arg, ctx, error);
        }
    }
}

/// A registered endpoint with its types erased.
#[derive(Clone)]
pub(crate) struct EndpointDefinition {
    pub(crate) kind: EndpointKind,
    pub(crate) executor: Executor,
    pub(crate) description: Option<ResultDescription>,
    pub(crate) hooks: Hooks,
}

impl fmt::Debug for EndpointDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDefinition")
            .field("kind", &self.kind)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl EndpointDefinition {
    /// Transport arguments for `original_args`. `None` for custom executors.
    pub(crate) fn transport_args(&self, original_args: &Value) -> Result<Option<Value>, serde_json::Error> {
        match &self.executor {
            Executor::Transport { query, .. } => query(original_args).map(Some),
            Executor::Custom(_) => Ok(None),
        }
    }

    /// Starts one execution. Transport arguments are recomputed if missing.
    pub(crate) fn execute(
        &self,
        original_args: Value,
        transport_args: Option<Value>,
        api: BaseQueryApi,
    ) -> BoxFuture<'static, QueryReturnValue> {
        match &self.executor {
            Executor::Transport { query, finish } => {
                let args = match transport_args.map_or_else(|| query(&original_args), Ok) {
                    Ok(args) => args,
                    Err(e) => return futures::future::ready(Err(QueryError::from(e))).boxed(),
                };
                let finish = Arc::clone(finish);
                async move { finish(api.base_query(args).await?) }.boxed()
            }
            Executor::Custom(query_fn) => query_fn(original_args, api),
        }
    }
}

/// Per-invocation context shared by the lifecycle hooks of one request.
///
/// Values stashed in `on_start` (for example the patches of an optimistic
/// update) can be taken back out in `on_success` or `on_error`.
pub struct LifecycleContext {
    api: Api,
    request_id: RequestId,
    endpoint: Arc<str>,
    stash: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl fmt::Debug for LifecycleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleContext")
            .field("request_id", &self.request_id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl LifecycleContext {
    pub(crate) fn new(api: Api, request_id: RequestId, endpoint: Arc<str>) -> Self {
        Self {
            api,
            request_id,
            endpoint,
            stash: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn api(&self) -> &Api {
        &self.api
    }

    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stores a value for later hooks, replacing any value of the same type.
    pub fn insert<T: Any + Send>(&mut self, value: T) {
        self.stash.insert(TypeId::of::<T>(), Box::new(value));
    }

    #[must_use]
    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.stash.get(&TypeId::of::<T>()).and_then(|value| value.downcast_ref::<T>())
    }

    pub fn take<T: Any + Send>(&mut self) -> Option<T> {
        self.stash
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Typed builder of an endpoint.
///
/// `A` is the call argument and `R` the result. Exactly one of
/// [`query`](Self::query) or [`query_fn`](Self::query_fn) must be set.
pub struct Definition<K, A, R> {
    executor: Option<Executor>,
    transform: Option<FinishFn>,
    description: Option<ResultDescription>,
    hooks: Hooks,
    _marker: PhantomData<fn(K, A) -> R>,
}

impl<K, A, R> fmt::Debug for Definition<K, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("has_executor", &self.executor.is_some())
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl<K, A, R> Default for Definition<K, A, R>
where
    K: Kind,
    A: Serialize + DeserializeOwned + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, QueryError> {
    T::deserialize(value).map_err(QueryError::from)
}

impl<K, A, R> Definition<K, A, R>
where
    K: Kind,
    A: Serialize + DeserializeOwned + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            executor: None,
            transform: None,
            description: None,
            hooks: Hooks::default(),
            _marker: PhantomData,
        }
    }

    /// Maps the call argument to the arguments of the base transport.
    #[must_use]
    pub fn query<T, F>(mut self, query: F) -> Self
    where
        T: Serialize,
        F: Fn(&A) -> T + Send + Sync + 'static,
    {
        let query: ArgsFn = Arc::new(move |original: &Value| {
            let arg = A::deserialize(original)?;
            serde_json::to_value(query(&arg))
        });
        let finish: FinishFn = Arc::new(|raw: Value| {
            decode::<R>(&raw).map_err(|e| QueryError::MalformedResult(e.to_string()))?;
            Ok(raw)
        });
        self.executor = Some(Executor::Transport { query, finish });
        self
    }

    /// Replaces the base transport with a custom executor.
    ///
    /// Panics inside the executor are caught and recorded as
    /// [`QueryError::Execution`].
    #[must_use]
    pub fn query_fn<F, Fut>(mut self, query_fn: F) -> Self
    where
        F: Fn(A, BaseQueryApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, QueryError>> + Send + 'static,
    {
        let query_fn = Arc::new(query_fn);
        let custom: CustomFn = Arc::new(move |original: Value, api: BaseQueryApi| {
            let arg = match decode::<A>(&original) {
                Ok(arg) => arg,
                Err(e) => return futures::future::ready(Err(e)).boxed(),
            };
            let fut = query_fn(arg, api);
            async move {
                let result = fut.await?;
                serde_json::to_value(result).map_err(|e| QueryError::MalformedResult(e.to_string()))
            }
            .boxed()
        });
        self.executor = Some(Executor::Custom(custom));
        self
    }

    /// Converts the raw transport payload into the endpoint's result.
    ///
    /// Only applies to endpoints using [`query`](Self::query).
    #[must_use]
    pub fn transform_response<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> Result<R, QueryError> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(move |raw: Value| {
            let result = transform(raw)?;
            serde_json::to_value(result).map_err(|e| QueryError::MalformedResult(e.to_string()))
        }));
        self
    }

    /// Runs right after the request starts, before the executor settles.
    #[must_use]
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&A, &mut LifecycleContext) + Send + Sync + 'static,
    {
        self.hooks.on_start = Some(Arc::new(move |arg: &Value, ctx: &mut LifecycleContext| {
            if let Some(arg) = typed_hook_arg::<A>(arg, ctx) {
                hook(&arg, ctx);
            }
        }));
        self
    }

    /// Runs after the request fulfilled.
    #[must_use]
    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: Fn(&A, &mut LifecycleContext, &R) + Send + Sync + 'static,
    {
        self.hooks.on_success = Some(Arc::new(
            move |arg: &Value, ctx: &mut LifecycleContext, data: &Value| {
                let Some(arg) = typed_hook_arg::<A>(arg, ctx) else {
                    return;
                };
                match decode::<R>(data) {
                    Ok(data) => hook(&arg, ctx, &data),
                    Err(e) => tracing::warn!(endpoint = ctx.endpoint(), error = %e, "Skipping on_success hook"),
                }
            },
        ));
        self
    }

    /// Runs after the request was rejected or aborted.
    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&A, &mut LifecycleContext, &QueryError) + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(Arc::new(
            move |arg: &Value, ctx: &mut LifecycleContext, error: &QueryError| {
                if let Some(arg) = typed_hook_arg::<A>(arg, ctx) {
                    hook(&arg, ctx, error);
                }
            },
        ));
        self
    }

    fn describe_with<F>(mut self, describe: F) -> Self
    where
        F: Fn(Option<&R>, Option<&QueryError>, &A) -> Vec<EntityDescriptor> + Send + Sync + 'static,
    {
        self.description = Some(ResultDescription::Dynamic(Arc::new(
            move |result: Option<&Value>, error: Option<&QueryError>, arg: &Value| {
                let Ok(arg) = decode::<A>(arg) else {
                    return Vec::new();
                };
                let result = result.and_then(|value| decode::<R>(value).ok());
                describe(result.as_ref(), error, &arg)
            },
        )));
        self
    }

    fn describe<I, D>(mut self, descriptors: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<EntityDescriptor>,
    {
        self.description = Some(ResultDescription::Static(
            descriptors.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Erases the types. Fails if no executor was set.
    pub(crate) fn erase(self, name: &str) -> Result<EndpointDefinition, ApiError> {
        let executor = match (self.executor, self.transform) {
            (None, _) => return Err(ApiError::MissingExecutor(name.to_string())),
            (Some(Executor::Transport { query, .. }), Some(transform)) => Executor::Transport {
                query,
                finish: transform,
            },
            (Some(executor), _) => executor,
        };
        Ok(EndpointDefinition {
            kind: K::KIND,
            executor,
            description: self.description,
            hooks: self.hooks,
        })
    }
}

fn typed_hook_arg<A: DeserializeOwned>(arg: &Value, ctx: &LifecycleContext) -> Option<A> {
    match decode::<A>(arg) {
        Ok(arg) => Some(arg),
        Err(e) => {
            tracing::warn!(endpoint = ctx.endpoint(), error = %e, "Skipping hook: argument does not decode");
            None
        }
    }
}

impl<A, R> QueryDefinition<A, R>
where
    A: Serialize + DeserializeOwned + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Entities every result of this query depends on.
    #[must_use]
    pub fn provides<I, D>(self, descriptors: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<EntityDescriptor>,
    {
        self.describe(descriptors)
    }

    /// Entities a result depends on, computed from `(result, error, arg)`.
    #[must_use]
    pub fn provides_with<F>(self, describe: F) -> Self
    where
        F: Fn(Option<&R>, Option<&QueryError>, &A) -> Vec<EntityDescriptor> + Send + Sync + 'static,
    {
        self.describe_with(describe)
    }
}

impl<A, R> MutationDefinition<A, R>
where
    A: Serialize + DeserializeOwned + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Entities a successful invocation changes.
    #[must_use]
    pub fn invalidates<I, D>(self, descriptors: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<EntityDescriptor>,
    {
        self.describe(descriptors)
    }

    /// Entities an invocation changes, computed from `(result, error, arg)`.
    #[must_use]
    pub fn invalidates_with<F>(self, describe: F) -> Self
    where
        F: Fn(Option<&R>, Option<&QueryError>, &A) -> Vec<EntityDescriptor> + Send + Sync + 'static,
    {
        self.describe_with(describe)
    }
}
