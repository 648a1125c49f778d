use serde_json::Value;

use super::{ApiState, MutationSubState, QueryStatus, QuerySubState, SubscriptionOptions};
use crate::entity::EntityDescriptor;
use crate::error::QueryError;
use crate::key::{CacheKey, RequestId};
use crate::patch::{Patch, apply_to_slot};

/// A lifecycle event. The only way state changes.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// A query attempt started and now owns the entry.
    QueryPending {
        key: CacheKey,
        request_id: RequestId,
        endpoint: String,
        original_args: Value,
        transport_args: Option<Value>,
        started_at: u64,
    },
    /// The owning attempt succeeded. `provided` replaces what the entry provided before.
    QueryFulfilled {
        key: CacheKey,
        request_id: RequestId,
        data: Value,
        fulfilled_at: u64,
        provided: Vec<EntityDescriptor>,
    },
    /// The owning attempt failed. Previously fulfilled data is kept.
    QueryRejected {
        key: CacheKey,
        request_id: RequestId,
        error: QueryError,
    },
    /// The attempt was cancelled; the entry falls back to its last completed status.
    QueryAborted {
        key: CacheKey,
        request_id: RequestId,
    },
    /// Structural edits of an entry's data, applied all or nothing.
    QueryResultPatched {
        key: CacheKey,
        patches: Vec<Patch>,
    },
    /// Drops the entry, its subscribers and what it provided.
    RemoveQueryResult {
        key: CacheKey,
    },
    Subscribe {
        key: CacheKey,
        subscriber: RequestId,
        options: SubscriptionOptions,
    },
    Unsubscribe {
        key: CacheKey,
        subscriber: RequestId,
    },
    UpdateSubscriptionOptions {
        key: CacheKey,
        subscriber: RequestId,
        options: SubscriptionOptions,
    },
    MutationPending {
        request_id: RequestId,
        endpoint: String,
        original_args: Value,
        started_at: u64,
    },
    /// `invalidates` is resolved from the mutation's declaration and handled by the coordinator.
    MutationFulfilled {
        request_id: RequestId,
        data: Value,
        fulfilled_at: u64,
        invalidates: Vec<EntityDescriptor>,
    },
    MutationRejected {
        request_id: RequestId,
        error: QueryError,
    },
    RemoveMutationResult {
        request_id: RequestId,
    },
    /// Marker handled by the coordinator; leaves the state untouched.
    InvalidateEntities(Vec<EntityDescriptor>),
    /// Host signals.
    Focus,
    FocusLost,
    Online,
    Offline,
    /// Actions reduced together under one lock acquisition.
    Batch(Vec<Action>),
}

impl Action {
    /// A stable name for logs and tests.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::QueryPending { .. } => "queries/pending",
            Self::QueryFulfilled { .. } => "queries/fulfilled",
            Self::QueryRejected { .. } => "queries/rejected",
            Self::QueryAborted { .. } => "queries/aborted",
            Self::QueryResultPatched { .. } => "queries/resultPatched",
            Self::RemoveQueryResult { .. } => "queries/removeQueryResult",
            Self::Subscribe { .. } => "subscriptions/subscribe",
            Self::Unsubscribe { .. } => "subscriptions/unsubscribe",
            Self::UpdateSubscriptionOptions { .. } => "subscriptions/updateOptions",
            Self::MutationPending { .. } => "mutations/pending",
            Self::MutationFulfilled { .. } => "mutations/fulfilled",
            Self::MutationRejected { .. } => "mutations/rejected",
            Self::RemoveMutationResult { .. } => "mutations/removeMutationResult",
            Self::InvalidateEntities(_) => "invalidation/invalidateEntities",
            Self::Focus => "config/focus",
            Self::FocusLost => "config/focusLost",
            Self::Online => "config/online",
            Self::Offline => "config/offline",
            Self::Batch(_) => "batch",
        }
    }

    /// Iterates over this action, or over the members of a batch, depth first.
    pub fn flatten(&self) -> Box<dyn Iterator<Item = &Action> + '_> {
        match self {
            Self::Batch(actions) => Box::new(actions.iter().flat_map(Action::flatten)),
            action => Box::new(std::iter::once(action)),
        }
    }
}

/// Applies one action to the state.
#[allow(clippy::too_many_lines)]
pub(crate) fn reduce(state: &mut ApiState, action: &Action) {
    match action {
        Action::QueryPending {
            key,
            request_id,
            endpoint,
            original_args,
            transport_args,
            started_at,
        } => {
            let entry = state
                .queries
                .entry(key.clone())
                .or_insert_with(|| QuerySubState::new(endpoint, original_args.clone(), *request_id));
            entry.status = QueryStatus::Pending;
            entry.request_id = *request_id;
            entry.original_args.clone_from(original_args);
            entry.transport_args.clone_from(transport_args);
            entry.started_at = *started_at;
        }
        Action::QueryFulfilled {
            key,
            request_id,
            data,
            fulfilled_at,
            provided,
        } => {
            let Some(entry) = owned_entry(state, key, *request_id) else {
                return;
            };
            entry.status = QueryStatus::Fulfilled;
            entry.data = Some(data.clone());
            entry.error = None;
            entry.fulfilled_at = Some(*fulfilled_at);
            entry.fulfilled_instant = Some(tokio::time::Instant::now());
            state.provided.replace(key, provided);
        }
        Action::QueryRejected { key, request_id, error } => {
            let Some(entry) = owned_entry(state, key, *request_id) else {
                return;
            };
            entry.status = QueryStatus::Rejected;
            entry.error = Some(error.clone());
        }
        Action::QueryAborted { key, request_id } => {
            let Some(entry) = owned_entry(state, key, *request_id) else {
                return;
            };
            if entry.status == QueryStatus::Pending {
                entry.status = if entry.data.is_some() {
                    QueryStatus::Fulfilled
                } else if entry.error.is_some() {
                    QueryStatus::Rejected
                } else {
                    QueryStatus::Uninitialized
                };
            }
        }
        Action::QueryResultPatched { key, patches } => {
            let Some(entry) = state.queries.get_mut(key) else {
                return;
            };
            if let Err(e) = apply_to_slot(&mut entry.data, patches) {
                tracing::warn!(key = %key, error = %e, "Failed to apply patches to cached result");
            }
        }
        Action::RemoveQueryResult { key } => {
            state.queries.remove(key);
            state.subscriptions.remove(key);
            state.provided.remove_key(key);
        }
        Action::Subscribe {
            key,
            subscriber,
            options,
        } => {
            state
                .subscriptions
                .entry(key.clone())
                .or_default()
                .insert(*subscriber, *options);
        }
        Action::Unsubscribe { key, subscriber } => {
            if let Some(subscribers) = state.subscriptions.get_mut(key) {
                subscribers.remove(subscriber);
            }
        }
        Action::UpdateSubscriptionOptions {
            key,
            subscriber,
            options,
        } => {
            if let Some(current) = state
                .subscriptions
                .get_mut(key)
                .and_then(|subscribers| subscribers.get_mut(subscriber))
            {
                *current = *options;
            }
        }
        Action::MutationPending {
            request_id,
            endpoint,
            original_args,
            started_at,
        } => {
            state.mutations.insert(
                *request_id,
                MutationSubState {
                    status: QueryStatus::Pending,
                    endpoint: endpoint.clone(),
                    original_args: original_args.clone(),
                    data: None,
                    error: None,
                    request_id: *request_id,
                    started_at: *started_at,
                    fulfilled_at: None,
                },
            );
        }
        Action::MutationFulfilled {
            request_id,
            data,
            fulfilled_at,
            ..
        } => {
            if let Some(entry) = state.mutations.get_mut(request_id) {
                entry.status = QueryStatus::Fulfilled;
                entry.data = Some(data.clone());
                entry.error = None;
                entry.fulfilled_at = Some(*fulfilled_at);
            }
        }
        Action::MutationRejected { request_id, error } => {
            if let Some(entry) = state.mutations.get_mut(request_id) {
                entry.status = QueryStatus::Rejected;
                entry.error = Some(error.clone());
            }
        }
        Action::RemoveMutationResult { request_id } => {
            state.mutations.remove(request_id);
        }
        Action::InvalidateEntities(_) => {}
        Action::Focus => state.config.focused = true,
        Action::FocusLost => state.config.focused = false,
        Action::Online => state.config.online = true,
        Action::Offline => state.config.online = false,
        Action::Batch(actions) => {
            for action in actions {
                reduce(state, action);
            }
        }
    }
}

/// The entry for `key` if `request_id` still owns it.
fn owned_entry<'a>(
    state: &'a mut ApiState,
    key: &CacheKey,
    request_id: RequestId,
) -> Option<&'a mut QuerySubState> {
    match state.queries.get_mut(key) {
        Some(entry) if entry.request_id == request_id => Some(entry),
        Some(entry) => {
            tracing::debug!(
                key = %key,
                request_id = %request_id,
                owner = %entry.request_id,
                "Discarding settlement of a superseded attempt"
            );
            None
        }
        None => {
            tracing::debug!(key = %key, request_id = %request_id, "Discarding settlement for an evicted entry");
            None
        }
    }
}
