//! The state store.
//!
//! All cache entries, subscriber records and the provided-by index live in a
//! single [`ApiState`] behind one lock. State only changes by reducing
//! [`Action`]s, and every reduction happens while holding the write lock, so
//! lifecycle transitions are applied one at a time in a total order.

mod slice;

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::{ApiConfig, millis, millis_opt};
use crate::entity::ProvidedIndex;
use crate::error::QueryError;
use crate::key::{CacheKey, RequestId};

pub use slice::Action;
pub(crate) use slice::reduce;

/// Lifecycle status of a query or mutation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    #[default]
    Uninitialized,
    Pending,
    Fulfilled,
    Rejected,
}

/// Per-subscriber options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionOptions {
    /// Refetch the query every `polling_interval` while subscribed.
    #[serde(with = "millis_opt")]
    pub polling_interval: Option<Duration>,
    /// Overrides [`ApiConfig::refetch_on_focus`] for this subscriber.
    pub refetch_on_focus: Option<bool>,
    /// Overrides [`ApiConfig::refetch_on_reconnect`] for this subscriber.
    pub refetch_on_reconnect: Option<bool>,
}

impl SubscriptionOptions {
    /// Polls every `interval`, inheriting the API's focus and reconnect defaults.
    #[must_use]
    pub const fn polling(interval: Duration) -> Self {
        Self {
            polling_interval: Some(interval),
            refetch_on_focus: None,
            refetch_on_reconnect: None,
        }
    }

    /// Sets [`refetch_on_focus`](Self::refetch_on_focus).
    #[must_use]
    pub const fn with_refetch_on_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_focus = Some(enabled);
        self
    }

    /// Sets [`refetch_on_reconnect`](Self::refetch_on_reconnect).
    #[must_use]
    pub const fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = Some(enabled);
        self
    }
}

/// Subscribers of one cache key, by subscriber id.
pub type Subscribers = HashMap<RequestId, SubscriptionOptions>;

/// The cache entry of one query key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuerySubState {
    pub status: QueryStatus,
    pub endpoint: String,
    pub original_args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_args: Option<Value>,
    pub data: Option<Value>,
    pub error: Option<QueryError>,
    /// The attempt that owns this entry; settlements of other attempts are discarded.
    pub request_id: RequestId,
    /// Epoch milliseconds.
    pub started_at: u64,
    /// Epoch milliseconds of the last successful settlement.
    pub fulfilled_at: Option<u64>,
    #[serde(skip)]
    pub(crate) fulfilled_instant: Option<Instant>,
}

impl QuerySubState {
    pub(crate) fn new(endpoint: &str, original_args: Value, request_id: RequestId) -> Self {
        Self {
            status: QueryStatus::Uninitialized,
            endpoint: endpoint.to_string(),
            original_args,
            transport_args: None,
            data: None,
            error: None,
            request_id,
            started_at: 0,
            fulfilled_at: None,
            fulfilled_instant: None,
        }
    }

    /// Time since the data was last fulfilled.
    #[must_use]
    pub fn age(&self) -> Option<Duration> {
        self.fulfilled_instant.map(|at| at.elapsed())
    }

    /// Whether fulfilled data is older than `stale_time`.
    #[must_use]
    pub fn is_stale(&self, stale_time: Option<Duration>) -> bool {
        match (self.status, stale_time, self.age()) {
            (QueryStatus::Fulfilled, Some(stale_time), Some(age)) => age >= stale_time,
            _ => false,
        }
    }
}

/// The cache entry of one mutation invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationSubState {
    pub status: QueryStatus,
    pub endpoint: String,
    pub original_args: Value,
    pub data: Option<Value>,
    pub error: Option<QueryError>,
    pub request_id: RequestId,
    pub started_at: u64,
    pub fulfilled_at: Option<u64>,
}

/// Host conditions and the refetch defaults derived from [`ApiConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigState {
    pub online: bool,
    pub focused: bool,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
    #[serde(with = "millis")]
    pub keep_unused_data_for: Duration,
}

impl Default for ConfigState {
    fn default() -> Self {
        Self::from(&ApiConfig::default())
    }
}

impl From<&ApiConfig> for ConfigState {
    fn from(config: &ApiConfig) -> Self {
        Self {
            online: true,
            focused: true,
            refetch_on_focus: config.refetch_on_focus,
            refetch_on_reconnect: config.refetch_on_reconnect,
            keep_unused_data_for: config.keep_unused_data_for,
        }
    }
}

/// Everything the engine knows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiState {
    pub queries: HashMap<CacheKey, QuerySubState>,
    pub mutations: HashMap<RequestId, MutationSubState>,
    pub provided: ProvidedIndex,
    pub subscriptions: HashMap<CacheKey, Subscribers>,
    pub config: ConfigState,
}

impl ApiState {
    pub(crate) fn new(config: &ApiConfig) -> Self {
        Self {
            config: ConfigState::from(config),
            ..Self::default()
        }
    }

    /// Number of live subscribers of `key`.
    #[must_use]
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.subscriptions.get(key).map_or(0, HashMap::len)
    }
}

/// Current wall-clock time in epoch milliseconds.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Lock-protected [`ApiState`] plus a revision counter that ticks on every
/// reduction.
#[derive(Debug)]
pub(crate) struct Store {
    state: RwLock<ApiState>,
    revision: watch::Sender<u64>,
}

impl Store {
    pub(crate) fn new(config: &ApiConfig) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: RwLock::new(ApiState::new(config)),
            revision,
        }
    }

    /// Runs `f` against a consistent view of the state.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&ApiState) -> T) -> T {
        f(&self.state.read())
    }

    /// Plans a group of actions against the current state and reduces them
    /// before anyone else can observe or change the state.
    ///
    /// Returns the reduced action (a [`Action::Batch`] when the plan produced
    /// more than one) so that middleware can react to it after the lock is
    /// released.
    pub(crate) fn transact<T>(
        &self,
        plan: impl FnOnce(&ApiState) -> (Vec<Action>, T),
    ) -> (Option<Action>, T) {
        let mut state = self.state.write();
        let (mut actions, out) = plan(&state);
        let action = match actions.len() {
            0 => None,
            1 => actions.pop(),
            _ => Some(Action::Batch(actions)),
        };
        if let Some(action) = &action {
            reduce(&mut state, action);
        }
        drop(state);

        if action.is_some() {
            self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
        }
        (action, out)
    }

    /// Reduces a single action.
    pub(crate) fn dispatch(&self, action: Action) -> Action {
        let (action, ()) = self.transact(|_| (vec![action], ()));
        action.unwrap_or(Action::Batch(Vec::new()))
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
