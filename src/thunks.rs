//! Request lifecycles.
//!
//! A query attempt is decided and registered while the store's write lock is
//! held, so two callers racing for the same key cannot both start one. The
//! transport call itself runs as a Tokio task and reports back through
//! [`Api::dispatch`].

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::api::Api;
use crate::definition::{EndpointDefinition, LifecycleContext};
use crate::entity::calculate_provided_by;
use crate::error::QueryError;
use crate::key::{CacheKey, RequestId};
use crate::state::{Action, ApiState, QueryStatus, QuerySubState, SubscriptionOptions, now_millis};
use crate::transport::{BaseQueryApi, QueryReturnValue};

/// The settlement of one attempt, awaitable by any number of callers.
pub(crate) type SharedResult = Shared<BoxFuture<'static, QueryReturnValue>>;

/// An attempt that has not settled yet.
pub(crate) struct RunningQuery {
    pub(crate) request_id: RequestId,
    pub(crate) token: CancellationToken,
    pub(crate) result: SharedResult,
}

/// A request to (re)fetch one cache key.
pub(crate) struct QueryRequest {
    pub(crate) key: CacheKey,
    pub(crate) endpoint: Arc<str>,
    pub(crate) definition: Arc<EndpointDefinition>,
    pub(crate) original_args: Value,
    pub(crate) transport_args: Option<Value>,
    pub(crate) force_refetch: bool,
    /// Subscriber to register, whether or not an attempt starts.
    pub(crate) subscribe: Option<(RequestId, SubscriptionOptions)>,
}

impl QueryRequest {
    /// A forced refetch of an existing entry with its stored arguments.
    pub(crate) fn refetch(api: &Api, key: &CacheKey, entry: &QuerySubState) -> Option<Self> {
        let Some(definition) = api.endpoint_definition(&entry.endpoint) else {
            tracing::warn!(key = %key, endpoint = %entry.endpoint, "Cannot refetch: endpoint is not registered");
            return None;
        };
        Some(Self {
            key: key.clone(),
            endpoint: Arc::from(entry.endpoint.as_str()),
            definition,
            original_args: entry.original_args.clone(),
            transport_args: entry.transport_args.clone(),
            force_refetch: true,
            subscribe: None,
        })
    }
}

struct StartedQuery {
    request: QueryRequest,
    request_id: RequestId,
    token: CancellationToken,
    settled: oneshot::Sender<QueryReturnValue>,
}

/// A settlement future fed by a oneshot; a dropped sender reads as an abort.
fn settlement_channel() -> (oneshot::Sender<QueryReturnValue>, SharedResult) {
    let (tx, rx) = oneshot::channel();
    let result = rx
        .map(|received| received.unwrap_or(Err(QueryError::Aborted)))
        .boxed()
        .shared();
    (tx, result)
}

/// The last completed outcome of `entry`, as a settled result.
fn completed(entry: &QuerySubState) -> SharedResult {
    let outcome = match (&entry.data, &entry.error) {
        (Some(data), _) => Ok(data.clone()),
        (None, Some(error)) => Err(error.clone()),
        (None, None) => Err(QueryError::Aborted),
    };
    futures::future::ready(outcome).boxed().shared()
}

/// Plans query requests against the current state and starts those that
/// need an attempt.
///
/// `plan` returns the requests plus any extra actions to reduce in the same
/// batch. An attempt starts unless the entry is already pending, or is
/// fulfilled with fresh data and the request does not force a refetch.
/// Returns one settlement per request, in order.
pub(crate) fn start_queries<P>(api: &Api, plan: P) -> Vec<SharedResult>
where
    P: FnOnce(&ApiState) -> (Vec<QueryRequest>, Vec<Action>),
{
    let stale_time = api.inner.config.stale_time;
    let (action, (results, started)) = api.inner.store.transact(|state| {
        let (requests, extra) = plan(state);
        let mut actions = Vec::with_capacity(requests.len() + extra.len());
        let mut results = Vec::with_capacity(requests.len());
        let mut started = Vec::new();
        let mut seen: HashMap<CacheKey, SharedResult> = HashMap::new();

        for request in requests {
            if let Some((subscriber, options)) = request.subscribe {
                actions.push(Action::Subscribe {
                    key: request.key.clone(),
                    subscriber,
                    options,
                });
            }
            if let Some(result) = seen.get(&request.key) {
                results.push(result.clone());
                continue;
            }

            let entry = state.queries.get(&request.key);
            let in_flight = entry
                .filter(|entry| entry.status == QueryStatus::Pending)
                .and_then(|_| api.inner.running.get(&request.key))
                .filter(|running| !running.token.is_cancelled())
                .map(|running| running.result.clone());
            let result = match (entry, in_flight) {
                (_, Some(result)) => {
                    tracing::debug!(key = %request.key, "Joining in-flight request");
                    result
                }
                (Some(entry), None)
                    if entry.status == QueryStatus::Fulfilled
                        && !request.force_refetch
                        && !entry.is_stale(stale_time) =>
                {
                    tracing::debug!(key = %request.key, "Cache hit");
                    completed(entry)
                }
                _ => {
                    let request_id = RequestId::new();
                    let token = CancellationToken::new();
                    let (settled, result) = settlement_channel();
                    api.inner.running.insert(
                        request.key.clone(),
                        RunningQuery {
                            request_id,
                            token: token.clone(),
                            result: result.clone(),
                        },
                    );
                    actions.push(Action::QueryPending {
                        key: request.key.clone(),
                        request_id,
                        endpoint: request.endpoint.to_string(),
                        original_args: request.original_args.clone(),
                        transport_args: request.transport_args.clone(),
                        started_at: now_millis(),
                    });
                    seen.insert(request.key.clone(), result.clone());
                    results.push(result);
                    started.push(StartedQuery {
                        request,
                        request_id,
                        token,
                        settled,
                    });
                    continue;
                }
            };
            seen.insert(request.key.clone(), result.clone());
            results.push(result);
        }

        actions.extend(extra);
        (actions, (results, started))
    });

    if let Some(action) = action {
        api.after_dispatch(&action);
    }
    for query in started {
        spawn_query(api, query);
    }
    results
}

fn spawn_query(api: &Api, query: StartedQuery) {
    let StartedQuery {
        request,
        request_id,
        token,
        settled,
    } = query;
    tracing::debug!(key = %request.key, request_id = %request_id, endpoint = %request.endpoint, "Starting query");

    let mut ctx = LifecycleContext::new(api.clone(), request_id, Arc::clone(&request.endpoint));
    request.definition.hooks.on_start(&request.original_args, &mut ctx);

    let Ok(runtime) = Handle::try_current() else {
        tracing::warn!(key = %request.key, "No Tokio runtime; query cannot run");
        let outcome = Err(QueryError::Execution("no Tokio runtime to run the query".to_string()));
        settle_query(api, &request, request_id, outcome, &mut ctx, settled);
        return;
    };

    let base = BaseQueryApi::new(
        token.clone(),
        Arc::clone(&request.endpoint),
        Arc::downgrade(&api.inner.store),
        Arc::clone(&api.inner.transport),
    );
    let definition = Arc::clone(&request.definition);
    let original_args = request.original_args.clone();
    let transport_args = request.transport_args.clone();
    let call = async move { definition.execute(original_args, transport_args, base).await };

    let api = api.clone();
    runtime.spawn(async move {
        let outcome = run_guarded(call, &token).await;
        settle_query(&api, &request, request_id, outcome, &mut ctx, settled);
    });
}

/// Runs an executor until it settles, panics or `token` is cancelled.
async fn run_guarded(
    call: impl Future<Output = QueryReturnValue>,
    token: &CancellationToken,
) -> QueryReturnValue {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(QueryError::Aborted),
        outcome = AssertUnwindSafe(call).catch_unwind() => {
            outcome.unwrap_or_else(|panic| Err(QueryError::Execution(panic_message(panic.as_ref()))))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "executor panicked".to_string())
}

fn settle_query(
    api: &Api,
    request: &QueryRequest,
    request_id: RequestId,
    outcome: QueryReturnValue,
    ctx: &mut LifecycleContext,
    settled: oneshot::Sender<QueryReturnValue>,
) {
    let key = request.key.clone();
    let action = match &outcome {
        Ok(data) => Action::QueryFulfilled {
            key: key.clone(),
            request_id,
            data: data.clone(),
            fulfilled_at: now_millis(),
            provided: calculate_provided_by(
                request.definition.description.as_ref(),
                Some(data),
                None,
                &request.original_args,
                &api.inner.entity_types,
            ),
        },
        Err(QueryError::Aborted) => Action::QueryAborted {
            key: key.clone(),
            request_id,
        },
        Err(error) => Action::QueryRejected {
            key: key.clone(),
            request_id,
            error: error.clone(),
        },
    };
    tracing::debug!(key = %key, request_id = %request_id, outcome = action.type_name(), "Query settled");
    api.dispatch(action);

    match &outcome {
        Ok(data) => request.definition.hooks.on_success(&request.original_args, ctx, data),
        Err(error) => request.definition.hooks.on_error(&request.original_args, ctx, error),
    }
    api.inner
        .running
        .remove_if(&key, |_, running| running.request_id == request_id);
    // Nobody awaiting the result is fine.
    let _ = settled.send(outcome);
}

/// A mutation invocation that was started.
pub(crate) struct StartedMutation {
    pub(crate) request_id: RequestId,
    pub(crate) token: CancellationToken,
    pub(crate) result: SharedResult,
}

/// Starts a fresh mutation invocation. Untracked invocations leave no entry
/// in the store but still invalidate on success.
pub(crate) fn start_mutation(
    api: &Api,
    endpoint: Arc<str>,
    definition: Arc<EndpointDefinition>,
    original_args: Value,
    track: bool,
) -> StartedMutation {
    let request_id = RequestId::new();
    let token = CancellationToken::new();
    let (settled, result) = settlement_channel();

    if track {
        api.dispatch(Action::MutationPending {
            request_id,
            endpoint: endpoint.to_string(),
            original_args: original_args.clone(),
            started_at: now_millis(),
        });
    }
    api.inner.running_mutations.insert(request_id, token.clone());
    tracing::debug!(request_id = %request_id, endpoint = %endpoint, "Starting mutation");

    let mut ctx = LifecycleContext::new(api.clone(), request_id, Arc::clone(&endpoint));
    definition.hooks.on_start(&original_args, &mut ctx);

    let mutation = MutationRun {
        definition,
        original_args,
        request_id,
    };
    let Ok(runtime) = Handle::try_current() else {
        tracing::warn!(endpoint = %endpoint, "No Tokio runtime; mutation cannot run");
        let outcome = Err(QueryError::Execution("no Tokio runtime to run the mutation".to_string()));
        mutation.settle(api, outcome, &mut ctx, settled);
        return StartedMutation {
            request_id,
            token,
            result,
        };
    };

    let base = BaseQueryApi::new(
        token.clone(),
        endpoint,
        Arc::downgrade(&api.inner.store),
        Arc::clone(&api.inner.transport),
    );
    let definition = Arc::clone(&mutation.definition);
    let args = mutation.original_args.clone();
    let call = async move { definition.execute(args, None, base).await };

    let api = api.clone();
    let signal = token.clone();
    runtime.spawn(async move {
        let outcome = run_guarded(call, &signal).await;
        mutation.settle(&api, outcome, &mut ctx, settled);
    });

    StartedMutation {
        request_id,
        token,
        result,
    }
}

struct MutationRun {
    definition: Arc<EndpointDefinition>,
    original_args: Value,
    request_id: RequestId,
}

impl MutationRun {
    fn settle(
        &self,
        api: &Api,
        outcome: QueryReturnValue,
        ctx: &mut LifecycleContext,
        settled: oneshot::Sender<QueryReturnValue>,
    ) {
        let request_id = self.request_id;
        let action = match &outcome {
            Ok(data) => Action::MutationFulfilled {
                request_id,
                data: data.clone(),
                fulfilled_at: now_millis(),
                invalidates: calculate_provided_by(
                    self.definition.description.as_ref(),
                    Some(data),
                    None,
                    &self.original_args,
                    &api.inner.entity_types,
                ),
            },
            Err(error) => Action::MutationRejected {
                request_id,
                error: error.clone(),
            },
        };
        tracing::debug!(request_id = %request_id, outcome = action.type_name(), "Mutation settled");
        api.dispatch(action);

        match &outcome {
            Ok(data) => self.definition.hooks.on_success(&self.original_args, ctx, data),
            Err(error) => self.definition.hooks.on_error(&self.original_args, ctx, error),
        }
        api.inner.running_mutations.remove(&request_id);
        let _ = settled.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn explode() -> QueryReturnValue {
        panic!("executor exploded")
    }

    #[tokio::test]
    async fn test_run_guarded_turns_panic_into_execution_error() {
        let token = CancellationToken::new();
        let outcome = run_guarded(explode(), &token).await;
        assert_eq!(outcome, Err(QueryError::Execution("executor exploded".to_string())));
    }

    #[tokio::test]
    async fn test_run_guarded_prefers_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let outcome = run_guarded(async { Ok(json!(1)) }, &token).await;
        assert_eq!(outcome, Err(QueryError::Aborted));
    }

    #[tokio::test]
    async fn test_dropped_sender_reads_as_abort() {
        let (settled, result) = settlement_channel();
        drop(settled);
        assert_eq!(result.await, Err(QueryError::Aborted));
    }

    #[tokio::test]
    async fn test_completed_result_of_entry() {
        let mut entry = QuerySubState::new("getPost", json!(1), RequestId::new());
        entry.data = Some(json!({ "id": 1 }));
        assert_eq!(completed(&entry).await, Ok(json!({ "id": 1 })));

        entry.data = None;
        entry.error = Some(QueryError::transport(404));
        assert_eq!(completed(&entry).await, Err(QueryError::transport(404)));
    }

    #[test]
    fn test_panic_message_of_formatted_panic() {
        let panic: Box<dyn Any + Send> = Box::new(format!("bad {}", 1));
        assert_eq!(panic_message(panic.as_ref()), "bad 1");
        let opaque: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(opaque.as_ref()), "executor panicked");
    }
}
