//! The API object.
//!
//! An [`Api`] owns the state store, the endpoint registry, the base transport
//! and the coordinator reacting to state changes. It is cheap to clone and
//! every clone refers to the same cache.
//!
//! # Example
//!
//! ```
//! use cloudburst::prelude::*;
//! use cloudburst::mock::MockTransport;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), ApiError> {
//! let mut builder = Api::builder(MockTransport::new(|_| Ok(json!("hello"))))
//!     .keep_unused_data_for(Duration::from_secs(30))
//!     .entity_types(["Greeting"]);
//! let greet = builder.query(
//!     "greet",
//!     QueryDefinition::<String, String>::new()
//!         .query(|name| json!({ "url": format!("/greet/{name}") }))
//!         .provides(["Greeting"]),
//! )?;
//! let api = builder.build();
//! assert!(greet.select(&api, &"ada".to_string())?.is_uninitialized());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ApiConfig;
use crate::coordinator::Coordinator;
use crate::definition::{EndpointDefinition, EndpointKind, MutationDefinition, QueryDefinition};
use crate::entity::{EntityDescriptor, EntityTypes};
use crate::error::ApiError;
use crate::key::{CacheKey, RequestId, SerializeQueryArgs, default_serialize_query_args};
use crate::module::ApiModule;
use crate::patch::{Patch, PatchCollection, apply_to_slot, diff};
use crate::state::{Action, ApiState, MutationSubState, QueryStatus, QuerySubState, Store};
use crate::subscription::{MutationEndpoint, QueryEndpoint};
use crate::thunks::{QueryRequest, RunningQuery, start_queries};
use crate::transport::BaseQuery;

/// Options of [`Api::prefetch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchOptions {
    /// Fetch even if fresh data is cached.
    pub force: bool,
    /// Fetch only if the cached data is at least this old (or missing).
    pub if_older_than: Option<Duration>,
}

impl PrefetchOptions {
    #[must_use]
    pub const fn force() -> Self {
        Self {
            force: true,
            if_older_than: None,
        }
    }

    #[must_use]
    pub const fn if_older_than(age: Duration) -> Self {
        Self {
            force: false,
            if_older_than: Some(age),
        }
    }
}

pub(crate) struct ApiInner {
    pub(crate) store: Arc<Store>,
    pub(crate) config: ApiConfig,
    pub(crate) endpoints: DashMap<String, Arc<EndpointDefinition>>,
    pub(crate) transport: Arc<dyn BaseQuery>,
    pub(crate) serializer: Arc<dyn SerializeQueryArgs>,
    pub(crate) entity_types: EntityTypes,
    pub(crate) running: DashMap<CacheKey, RunningQuery>,
    pub(crate) running_mutations: DashMap<RequestId, CancellationToken>,
    pub(crate) coordinator: Coordinator,
    pub(crate) modules: Vec<Arc<dyn ApiModule>>,
}

/// A data-fetching and caching engine instance.
#[derive(Clone)]
pub struct Api {
    pub(crate) inner: Arc<ApiInner>,
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("name", &self.inner.config.name)
            .field("endpoints", &self.inner.endpoints.len())
            .field("running", &self.inner.running.len())
            .finish_non_exhaustive()
    }
}

/// Collects configuration and endpoints, then builds an [`Api`].
pub struct ApiBuilder {
    config: ApiConfig,
    transport: Arc<dyn BaseQuery>,
    serializer: Arc<dyn SerializeQueryArgs>,
    entity_types: EntityTypes,
    modules: Vec<Arc<dyn ApiModule>>,
    endpoints: Vec<(String, Arc<EndpointDefinition>)>,
}

impl fmt::Debug for ApiBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiBuilder")
            .field("config", &self.config)
            .field("entity_types", &self.entity_types)
            .field("endpoints", &self.endpoints.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ApiBuilder {
    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ApiConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    #[must_use]
    pub fn keep_unused_data_for(mut self, duration: Duration) -> Self {
        self.config.keep_unused_data_for = duration;
        self
    }

    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.config.stale_time = Some(stale_time);
        self
    }

    #[must_use]
    pub fn refetch_on_focus(mut self, enabled: bool) -> Self {
        self.config.refetch_on_focus = enabled;
        self
    }

    #[must_use]
    pub fn refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.config.refetch_on_reconnect = enabled;
        self
    }

    /// Declares the entity types descriptors may use.
    #[must_use]
    pub fn entity_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_types = EntityTypes::new(types);
        self
    }

    /// Overrides how cache keys are derived from query arguments.
    #[must_use]
    pub fn serialize_query_args(mut self, serializer: impl SerializeQueryArgs) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    /// Adds a capability module. Modules are notified in the order added.
    #[must_use]
    pub fn module(mut self, module: impl ApiModule) -> Self {
        self.modules.push(Arc::new(module));
        self
    }

    /// Registers a query endpoint.
    ///
    /// # Errors
    ///
    /// Fails if the name is taken or the definition has no executor.
    pub fn query<A, R>(&mut self, name: &str, definition: QueryDefinition<A, R>) -> Result<QueryEndpoint<A, R>, ApiError>
    where
        A: Serialize + DeserializeOwned + Send + Sync + 'static,
        R: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register(name, definition.erase(name)?)?;
        Ok(QueryEndpoint::new(name))
    }

    /// Registers a mutation endpoint.
    ///
    /// # Errors
    ///
    /// Fails if the name is taken or the definition has no executor.
    pub fn mutation<A, R>(
        &mut self,
        name: &str,
        definition: MutationDefinition<A, R>,
    ) -> Result<MutationEndpoint<A, R>, ApiError>
    where
        A: Serialize + DeserializeOwned + Send + Sync + 'static,
        R: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register(name, definition.erase(name)?)?;
        Ok(MutationEndpoint::new(name))
    }

    fn register(&mut self, name: &str, definition: EndpointDefinition) -> Result<(), ApiError> {
        if self.endpoints.iter().any(|(existing, _)| existing == name) {
            return Err(ApiError::DuplicateEndpoint(name.to_string()));
        }
        self.endpoints.push((name.to_string(), Arc::new(definition)));
        Ok(())
    }

    #[must_use]
    pub fn build(self) -> Api {
        let store = Arc::new(Store::new(&self.config));
        let endpoints = DashMap::with_capacity(self.endpoints.len());
        for (name, definition) in &self.endpoints {
            endpoints.insert(name.clone(), Arc::clone(definition));
        }

        let api = Api {
            inner: Arc::new(ApiInner {
                store,
                config: self.config,
                endpoints,
                transport: self.transport,
                serializer: self.serializer,
                entity_types: self.entity_types,
                running: DashMap::new(),
                running_mutations: DashMap::new(),
                coordinator: Coordinator::default(),
                modules: self.modules,
            }),
        };
        for (name, definition) in &self.endpoints {
            api.notify_injected(name, definition.kind);
        }
        tracing::debug!(
            api = %api.inner.config.name,
            endpoints = self.endpoints.len(),
            modules = api.inner.modules.len(),
            "Api built"
        );
        api
    }
}

impl Api {
    /// Starts building an API on top of `transport`.
    ///
    /// APIs whose endpoints all use `query_fn` can pass
    /// [`dummy_base_query`](crate::transport::dummy_base_query).
    pub fn builder(transport: impl BaseQuery) -> ApiBuilder {
        ApiBuilder {
            config: ApiConfig::default(),
            transport: Arc::new(transport),
            serializer: Arc::new(default_serialize_query_args),
            entity_types: EntityTypes::default(),
            modules: Vec::new(),
            endpoints: Vec::new(),
        }
    }

    pub(crate) fn upgrade(inner: &Weak<ApiInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.inner.config
    }

    /// Reduces `action` and lets modules and the coordinator react to it.
    pub(crate) fn dispatch(&self, action: Action) {
        let action = self.inner.store.dispatch(action);
        self.after_dispatch(&action);
    }

    pub(crate) fn after_dispatch(&self, action: &Action) {
        for module in &self.inner.modules {
            module.action_dispatched(self, action);
        }
        self.inner.coordinator.handle(self, action);
    }

    fn notify_injected(&self, name: &str, kind: EndpointKind) {
        for module in &self.inner.modules {
            tracing::trace!(module = module.name(), endpoint = name, "Notifying module of endpoint");
            module.endpoint_injected(self, name, kind);
        }
    }

    pub(crate) fn endpoint_definition(&self, name: &str) -> Option<Arc<EndpointDefinition>> {
        self.inner.endpoints.get(name).map(|definition| Arc::clone(&definition))
    }

    /// The definition registered under `name`, checked to be of `kind`.
    pub(crate) fn definition_of(&self, name: &str, kind: EndpointKind) -> Result<Arc<EndpointDefinition>, ApiError> {
        let definition = self
            .endpoint_definition(name)
            .ok_or_else(|| ApiError::UnknownEndpoint(name.to_string()))?;
        if definition.kind != kind {
            return Err(ApiError::KindMismatch {
                name: name.to_string(),
                expected: kind,
                actual: definition.kind,
            });
        }
        Ok(definition)
    }

    fn inject(&self, name: &str, definition: EndpointDefinition, override_existing: bool) -> Result<(), ApiError> {
        let kind = definition.kind;
        match self.inner.endpoints.entry(name.to_string()) {
            Entry::Occupied(_) if !override_existing => {
                return Err(ApiError::DuplicateEndpoint(name.to_string()));
            }
            Entry::Occupied(mut entry) => {
                tracing::debug!(endpoint = name, "Overriding endpoint definition");
                entry.insert(Arc::new(definition));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(definition));
            }
        }
        self.notify_injected(name, kind);
        Ok(())
    }

    /// Adds a query endpoint to a built API.
    ///
    /// # Errors
    ///
    /// Fails if the definition has no executor, or if `name` is taken and
    /// `override_existing` is false.
    pub fn inject_query<A, R>(
        &self,
        name: &str,
        definition: QueryDefinition<A, R>,
        override_existing: bool,
    ) -> Result<QueryEndpoint<A, R>, ApiError>
    where
        A: Serialize + DeserializeOwned + Send + Sync + 'static,
        R: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.inject(name, definition.erase(name)?, override_existing)?;
        Ok(QueryEndpoint::new(name))
    }

    /// Adds a mutation endpoint to a built API.
    ///
    /// # Errors
    ///
    /// Fails if the definition has no executor, or if `name` is taken and
    /// `override_existing` is false.
    pub fn inject_mutation<A, R>(
        &self,
        name: &str,
        definition: MutationDefinition<A, R>,
        override_existing: bool,
    ) -> Result<MutationEndpoint<A, R>, ApiError>
    where
        A: Serialize + DeserializeOwned + Send + Sync + 'static,
        R: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.inject(name, definition.erase(name)?, override_existing)?;
        Ok(MutationEndpoint::new(name))
    }

    /// Names of all registered endpoints, sorted.
    #[must_use]
    pub fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.endpoints.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Derives the cache key of `endpoint(args)`.
    pub(crate) fn cache_key_of(&self, endpoint: &str, args: &Value) -> CacheKey {
        self.inner.serializer.serialize(endpoint, args)
    }

    /// Invalidates every query providing one of `descriptors`.
    ///
    /// Unused queries are removed, used ones are refetched.
    pub fn invalidate_entities<I, D>(&self, descriptors: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<EntityDescriptor>,
    {
        let descriptors: Vec<EntityDescriptor> = descriptors.into_iter().map(Into::into).collect();
        if descriptors.is_empty() {
            return;
        }
        self.dispatch(Action::InvalidateEntities(descriptors));
    }

    /// Fetches `endpoint(arg)` into the cache without subscribing to it.
    ///
    /// The entry is garbage-collected like any unused entry once it settles.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint is not a registered query or `arg` does not serialize.
    pub fn prefetch<A, R>(&self, endpoint: &QueryEndpoint<A, R>, arg: &A, options: PrefetchOptions) -> Result<(), ApiError>
    where
        A: Serialize,
    {
        let definition = self.definition_of(endpoint.name(), EndpointKind::Query)?;
        let original_args = endpoint.serialize_arg(arg)?;
        let key = self.cache_key_of(endpoint.name(), &original_args);
        let transport_args = definition
            .transport_args(&original_args)
            .map_err(|source| ApiError::Serialization {
                endpoint: endpoint.name().to_string(),
                source,
            })?;

        let force_refetch = if options.force {
            true
        } else if let Some(threshold) = options.if_older_than {
            let age = self.inner.store.read(|state| state.queries.get(&key).and_then(QuerySubState::age));
            if age.is_some_and(|age| age < threshold) {
                tracing::debug!(key = %key, "Prefetch skipped: cached data is recent");
                return Ok(());
            }
            true
        } else {
            false
        };

        let request = QueryRequest {
            key,
            endpoint: Arc::from(endpoint.name()),
            definition,
            original_args,
            transport_args,
            force_refetch,
            subscribe: None,
        };
        start_queries(self, |_| (vec![request], Vec::new()));
        Ok(())
    }

    /// Edits the cached result of `endpoint(arg)` in place.
    ///
    /// The recipe mutates a typed copy of the data; the difference is
    /// dispatched as a patch and returned with its inverse so the edit can be
    /// rolled back with [`patch_query_result`](Self::patch_query_result).
    /// Returns an empty collection when nothing is cached for the key.
    ///
    /// The recipe runs while the store is locked; it must not call back into
    /// this `Api`.
    ///
    /// # Errors
    ///
    /// Fails if `arg` does not serialize or the cached data does not decode as `R`.
    pub fn update_query_result<A, R, F>(
        &self,
        endpoint: &QueryEndpoint<A, R>,
        arg: &A,
        recipe: F,
    ) -> Result<PatchCollection, ApiError>
    where
        A: Serialize,
        R: Serialize + DeserializeOwned,
        F: FnOnce(&mut R),
    {
        self.edit_query_result(endpoint, arg, recipe, None::<fn() -> R>)
    }

    /// Like [`update_query_result`](Self::update_query_result), but an entry
    /// that exists without data is filled with `insert()` instead. The inverse
    /// of such an insertion clears the data again.
    ///
    /// # Errors
    ///
    /// Fails if `arg` does not serialize or the cached data does not decode as `R`.
    pub fn update_query_result_or_insert<A, R, F, I>(
        &self,
        endpoint: &QueryEndpoint<A, R>,
        arg: &A,
        recipe: F,
        insert: I,
    ) -> Result<PatchCollection, ApiError>
    where
        A: Serialize,
        R: Serialize + DeserializeOwned,
        F: FnOnce(&mut R),
        I: FnOnce() -> R,
    {
        self.edit_query_result(endpoint, arg, recipe, Some(insert))
    }

    fn edit_query_result<A, R, F, I>(
        &self,
        endpoint: &QueryEndpoint<A, R>,
        arg: &A,
        recipe: F,
        insert: Option<I>,
    ) -> Result<PatchCollection, ApiError>
    where
        A: Serialize,
        R: Serialize + DeserializeOwned,
        F: FnOnce(&mut R),
        I: FnOnce() -> R,
    {
        let key = endpoint.cache_key(self, arg)?;
        let name = endpoint.name();
        let result_type = |source| ApiError::ResultType {
            endpoint: name.to_string(),
            source,
        };

        // Read, diff and reduce under one write lock so the patches describe
        // exactly the data they were applied to.
        let (action, collection) = self.inner.store.transact(|state| {
            let cached = state.queries.get(&key).map(|entry| entry.data.as_ref());
            let collection = match (cached, insert) {
                (None, _) | (Some(None), None) => {
                    tracing::debug!(key = %key, "Nothing cached to update");
                    Ok(PatchCollection::default())
                }
                (Some(Some(before)), _) => serde_json::from_value::<R>(before.clone())
                    .and_then(|mut typed| {
                        recipe(&mut typed);
                        serde_json::to_value(&typed)
                    })
                    .map(|after| diff(before, &after))
                    .map_err(result_type),
                (Some(None), Some(insert)) => serde_json::to_value(insert())
                    .map(|value| PatchCollection {
                        patches: vec![Patch::Replace {
                            path: Vec::new(),
                            value,
                        }],
                        inverse_patches: vec![Patch::Remove { path: Vec::new() }],
                    })
                    .map_err(result_type),
            };
            let actions = match &collection {
                Ok(collection) if !collection.patches.is_empty() => vec![Action::QueryResultPatched {
                    key: key.clone(),
                    patches: collection.patches.clone(),
                }],
                _ => Vec::new(),
            };
            (actions, collection)
        });

        if let Some(action) = action {
            self.after_dispatch(&action);
        }
        collection
    }

    /// Applies `patches` to the cached result of `endpoint(arg)`, typically
    /// the inverse patches of an earlier update.
    ///
    /// Either every patch applies or the entry is left unchanged.
    ///
    /// # Errors
    ///
    /// Fails if `arg` does not serialize, nothing is cached for the key, or a
    /// patch does not apply to the cached data.
    pub fn patch_query_result<A, R>(&self, endpoint: &QueryEndpoint<A, R>, arg: &A, patches: Vec<Patch>) -> Result<(), ApiError>
    where
        A: Serialize,
    {
        if patches.is_empty() {
            return Ok(());
        }
        let key = endpoint.cache_key(self, arg)?;
        let (action, outcome) = self.inner.store.transact(|state| {
            let Some(entry) = state.queries.get(&key) else {
                return (Vec::new(), Err(ApiError::MissingEntry(key.clone())));
            };
            let mut data = entry.data.clone();
            if let Err(source) = apply_to_slot(&mut data, &patches) {
                return (Vec::new(), Err(ApiError::Patch { key: key.clone(), source }));
            }
            (vec![Action::QueryResultPatched { key: key.clone(), patches }], Ok(()))
        });

        if let Some(action) = action {
            self.after_dispatch(&action);
        }
        if let Err(e) = &outcome {
            tracing::warn!(key = %key, error = %e, "Patches were not applied");
        }
        outcome
    }

    /// Removes every cached query and mutation and aborts in-flight queries.
    pub fn reset(&self) {
        let (action, ()) = self.inner.store.transact(|state| {
            let queries = state
                .queries
                .keys()
                .cloned()
                .map(|key| Action::RemoveQueryResult { key });
            let mutations = state
                .mutations
                .keys()
                .map(|request_id| Action::RemoveMutationResult { request_id: *request_id });
            (queries.chain(mutations).collect(), ())
        });
        if let Some(action) = action {
            tracing::info!(api = %self.inner.config.name, "Api state reset");
            self.after_dispatch(&action);
        }
    }

    /// The host regained focus.
    pub fn on_focus(&self) {
        self.dispatch(Action::Focus);
    }

    pub fn on_focus_lost(&self) {
        self.dispatch(Action::FocusLost);
    }

    /// The host came back online.
    pub fn on_online(&self) {
        self.dispatch(Action::Online);
    }

    pub fn on_offline(&self) {
        self.dispatch(Action::Offline);
    }

    /// Reads the current state.
    pub fn with_state<T>(&self, f: impl FnOnce(&ApiState) -> T) -> T {
        self.inner.store.read(f)
    }

    /// The whole state as JSON, for debugging.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        self.inner
            .store
            .read(|state| serde_json::to_value(state))
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to serialize api state");
                Value::Null
            })
    }

    /// The cache entry of `key`, if any.
    #[must_use]
    pub fn query_entry(&self, key: &CacheKey) -> Option<QuerySubState> {
        self.inner.store.read(|state| state.queries.get(key).cloned())
    }

    /// The tracked entry of mutation `request_id`, if any.
    #[must_use]
    pub fn mutation_entry(&self, request_id: RequestId) -> Option<MutationSubState> {
        self.inner.store.read(|state| state.mutations.get(&request_id).cloned())
    }

    #[must_use]
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.inner.store.read(|state| state.subscriber_count(key))
    }

    /// Ticks on every state change.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.store.subscribe()
    }

    pub(crate) fn cancel_running(&self, key: &CacheKey) {
        if let Some(running) = self.inner.running.get(key) {
            if !running.token.is_cancelled() {
                tracing::debug!(key = %key, request_id = %running.request_id, "Aborting in-flight query");
                running.token.cancel();
            }
        }
    }

    /// Removes `key` if it still exists and nobody subscribes to it.
    pub(crate) fn remove_if_unused(&self, key: &CacheKey) {
        let (action, ()) = self.inner.store.transact(|state| {
            let unused = state.queries.contains_key(key) && state.subscriber_count(key) == 0;
            let actions = if unused {
                vec![Action::RemoveQueryResult { key: key.clone() }]
            } else {
                Vec::new()
            };
            (actions, ())
        });
        if let Some(action) = action {
            tracing::debug!(key = %key, "Removed unused query");
            self.after_dispatch(&action);
        }
    }

    /// Force-refetches every initialized entry among `keys`.
    pub(crate) fn refetch_keys(&self, keys: &[CacheKey]) {
        start_queries(self, |state: &ApiState| {
            let requests = keys
                .iter()
                .filter_map(|key| {
                    let entry = state.queries.get(key)?;
                    if entry.status == QueryStatus::Uninitialized {
                        return None;
                    }
                    QueryRequest::refetch(self, key, entry)
                })
                .collect();
            (requests, Vec::new())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use serde_json::json;

    fn builder() -> ApiBuilder {
        Api::builder(MockTransport::new(|args| Ok(args.clone())))
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut builder = builder();
        builder
            .query("getPost", QueryDefinition::<u32, Value>::new().query(|id| json!(id)))
            .expect("first registration succeeds");
        let err = builder
            .mutation("getPost", MutationDefinition::<u32, Value>::new().query(|id| json!(id)))
            .expect_err("name is taken");
        assert!(matches!(err, ApiError::DuplicateEndpoint(name) if name == "getPost"));
    }

    #[test]
    fn test_inject_requires_override() {
        let api = builder().build();
        api.inject_query("list", QueryDefinition::<(), Value>::new().query(|()| json!("/a")), false)
            .expect("first injection succeeds");
        let err = api
            .inject_query("list", QueryDefinition::<(), Value>::new().query(|()| json!("/b")), false)
            .expect_err("second injection without override fails");
        assert!(matches!(err, ApiError::DuplicateEndpoint(_)));

        api.inject_query("list", QueryDefinition::<(), Value>::new().query(|()| json!("/b")), true)
            .expect("override succeeds");
        let definition = api.endpoint_definition("list").expect("endpoint exists");
        assert_eq!(
            definition.transport_args(&json!(null)).expect("args map"),
            Some(json!("/b"))
        );
    }

    #[test]
    fn test_definition_of_checks_kind() {
        let mut builder = builder();
        builder
            .mutation("addPost", MutationDefinition::<u32, Value>::new().query(|id| json!(id)))
            .expect("registration succeeds");
        let api = builder.build();

        let err = api
            .definition_of("addPost", EndpointKind::Query)
            .expect_err("a mutation is not a query");
        assert!(matches!(
            err,
            ApiError::KindMismatch {
                expected: EndpointKind::Query,
                actual: EndpointKind::Mutation,
                ..
            }
        ));
        assert!(matches!(
            api.definition_of("missing", EndpointKind::Query),
            Err(ApiError::UnknownEndpoint(_))
        ));
    }

    #[test]
    fn test_builder_config_setters() {
        let api = builder()
            .name("blog")
            .keep_unused_data_for(Duration::from_secs(5))
            .stale_time(Duration::from_secs(1))
            .refetch_on_focus(true)
            .build();
        assert_eq!(api.config().name, "blog");
        assert_eq!(api.config().keep_unused_data_for, Duration::from_secs(5));
        assert_eq!(api.config().stale_time, Some(Duration::from_secs(1)));
        api.with_state(|state| {
            assert!(state.config.refetch_on_focus);
            assert!(!state.config.refetch_on_reconnect);
            assert_eq!(state.config.keep_unused_data_for, Duration::from_secs(5));
        });
    }

    #[test]
    fn test_host_signals_update_config_state() {
        let api = builder().build();
        api.on_focus_lost();
        api.on_offline();
        assert_eq!(api.with_state(|state| (state.config.focused, state.config.online)), (false, false));
        api.on_focus();
        api.on_online();
        assert_eq!(api.with_state(|state| (state.config.focused, state.config.online)), (true, true));
    }

    #[test]
    fn test_snapshot_is_json() {
        let api = builder().build();
        let snapshot = api.snapshot();
        assert_eq!(snapshot["queries"], json!({}));
        assert_eq!(snapshot["config"]["online"], json!(true));
    }

    #[test]
    fn test_endpoint_names_sorted() {
        let mut builder = builder();
        builder
            .query("b", QueryDefinition::<(), Value>::new().query(|()| json!(null)))
            .expect("registers");
        builder
            .query("a", QueryDefinition::<(), Value>::new().query(|()| json!(null)))
            .expect("registers");
        assert_eq!(builder.build().endpoint_names(), vec!["a".to_string(), "b".to_string()]);
    }
}
