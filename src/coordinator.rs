//! Reactions to reduced actions: entity invalidation, garbage collection,
//! polling and host-signal refetches.
//!
//! The coordinator never changes state directly. It inspects the state after
//! an action has been reduced and dispatches follow-up actions, either right
//! away (invalidation, refetch on focus) or from timers (removal of unused
//! entries, polling).

mod timer;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::api::Api;
use crate::entity::EntityDescriptor;
use crate::key::CacheKey;
use crate::state::{Action, ApiState, QueryStatus, Subscribers};
use crate::thunks::{QueryRequest, start_queries};

pub(crate) use timer::TimerHandle;

/// Host signal that may trigger refetches of active queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefetchTrigger {
    Focus,
    Reconnect,
}

#[derive(Debug)]
struct PollRegistration {
    next_poll: Instant,
    interval: Duration,
    timer: Option<TimerHandle>,
}

#[derive(Debug, Default)]
pub(crate) struct Coordinator {
    removal_timers: DashMap<CacheKey, TimerHandle>,
    polls: DashMap<CacheKey, PollRegistration>,
}

/// The smallest positive polling interval among `subscribers`.
fn lowest_polling_interval(subscribers: Option<&Subscribers>) -> Option<Duration> {
    subscribers?
        .values()
        .filter_map(|options| options.polling_interval)
        .filter(|interval| !interval.is_zero())
        .min()
}

/// Whether a query with these subscribers should refetch on `trigger`.
///
/// An explicit opt-in by any subscriber wins; otherwise the global default
/// applies unless some subscriber opted out.
fn wants_refetch(subscribers: &Subscribers, trigger: RefetchTrigger, default: bool) -> bool {
    let choices = subscribers.values().map(|options| match trigger {
        RefetchTrigger::Focus => options.refetch_on_focus,
        RefetchTrigger::Reconnect => options.refetch_on_reconnect,
    });
    let mut opted_out = false;
    for choice in choices {
        match choice {
            Some(true) => return true,
            Some(false) => opted_out = true,
            None => {}
        }
    }
    default && !opted_out
}

impl Coordinator {
    pub(crate) fn handle(&self, api: &Api, action: &Action) {
        match action {
            Action::Batch(actions) => {
                for action in actions {
                    self.handle(api, action);
                }
            }
            Action::InvalidateEntities(descriptors) => self.invalidate(api, descriptors),
            Action::MutationFulfilled { invalidates, .. } if !invalidates.is_empty() => {
                self.invalidate(api, invalidates);
            }
            Action::Subscribe { key, .. } => {
                self.removal_timers.remove(key);
                self.update_polling_interval(api, key);
            }
            Action::Unsubscribe { key, .. } => {
                let unused = api.inner.store.read(|state| state.subscriber_count(key) == 0);
                if unused {
                    self.schedule_removal(api, key);
                    api.cancel_running(key);
                }
                self.update_polling_interval(api, key);
            }
            Action::UpdateSubscriptionOptions { key, .. }
            | Action::QueryPending { key, .. }
            | Action::QueryAborted { key, .. } => self.update_polling_interval(api, key),
            Action::QueryFulfilled { key, .. } | Action::QueryRejected { key, .. } => {
                self.start_next_poll(api, key);
                let orphaned = api.inner.store.read(|state| {
                    state.queries.contains_key(key) && state.subscriber_count(key) == 0
                });
                if orphaned && !self.removal_timers.contains_key(key) {
                    self.schedule_removal(api, key);
                }
            }
            Action::RemoveQueryResult { key } => {
                self.removal_timers.remove(key);
                self.polls.remove(key);
                api.cancel_running(key);
            }
            Action::Focus => self.refetch_valid_queries(api, RefetchTrigger::Focus),
            Action::Online => self.refetch_valid_queries(api, RefetchTrigger::Reconnect),
            _ => {}
        }
    }

    /// Evicts unused affected queries and refetches the rest, as one batch.
    fn invalidate(&self, api: &Api, descriptors: &[EntityDescriptor]) {
        start_queries(api, |state: &ApiState| {
            let keys = state.provided.keys_for(descriptors);
            if keys.is_empty() {
                tracing::debug!(entities = descriptors.len(), "Invalidation matched no queries");
                return (Vec::new(), Vec::new());
            }

            let mut evictions = Vec::new();
            let mut refetches = Vec::new();
            for key in keys {
                let Some(entry) = state.queries.get(&key) else {
                    continue;
                };
                if state.subscriber_count(&key) == 0 {
                    evictions.push(Action::RemoveQueryResult { key });
                } else if entry.status != QueryStatus::Uninitialized {
                    refetches.extend(QueryRequest::refetch(api, &key, entry));
                }
            }
            tracing::info!(
                api = %api.inner.config.name,
                evicted = evictions.len(),
                refetched = refetches.len(),
                "Invalidated entities"
            );
            (refetches, evictions)
        });
    }

    /// (Re)arms the removal timer of `key`.
    fn schedule_removal(&self, api: &Api, key: &CacheKey) {
        let delay = api.inner.store.read(|state| state.config.keep_unused_data_for);
        let id = TimerHandle::next_id();
        let weak = Arc::downgrade(&api.inner);
        let timer_key = key.clone();
        let timer = TimerHandle::spawn(id, delay, move || {
            let Some(api) = Api::upgrade(&weak) else {
                return;
            };
            api.inner
                .coordinator
                .removal_timers
                .remove_if(&timer_key, |_, timer| timer.id() == id);
            api.remove_if_unused(&timer_key);
        });
        if let Some(timer) = timer {
            tracing::debug!(key = %key, ?delay, "Scheduled removal of unused query");
            self.removal_timers.insert(key.clone(), timer);
        }
    }

    /// Reschedules polling when the interval changed so that the next poll is
    /// due sooner than currently scheduled.
    fn update_polling_interval(&self, api: &Api, key: &CacheKey) {
        let Some(lowest) = self.polling_interval_for(api, key) else {
            if let Some((_, registration)) = self.polls.remove(key) {
                if let Some(timer) = &registration.timer {
                    timer.cancel();
                }
                tracing::debug!(key = %key, "Stopped polling");
            }
            return;
        };
        let due = Instant::now() + lowest;
        let sooner = self
            .polls
            .get(key)
            .is_none_or(|registration| due < registration.next_poll);
        if sooner {
            self.start_next_poll(api, key);
        }
    }

    /// Schedules the next poll of `key` from its current subscribers.
    fn start_next_poll(&self, api: &Api, key: &CacheKey) {
        let Some(interval) = self.polling_interval_for(api, key) else {
            return;
        };
        let id = TimerHandle::next_id();
        let weak = Arc::downgrade(&api.inner);
        let timer_key = key.clone();
        let timer = TimerHandle::spawn(id, interval, move || {
            let Some(api) = Api::upgrade(&weak) else {
                return;
            };
            if let Some(mut registration) = api.inner.coordinator.polls.get_mut(&timer_key) {
                if registration.timer.as_ref().is_some_and(|timer| timer.id() == id) {
                    registration.timer = None;
                }
            }
            tracing::debug!(key = %timer_key, "Polling query");
            api.refetch_keys(&[timer_key]);
        });
        self.polls.insert(
            key.clone(),
            PollRegistration {
                next_poll: Instant::now() + interval,
                interval,
                timer,
            },
        );
    }

    /// The polling interval of an initialized query, if any subscriber polls.
    fn polling_interval_for(&self, api: &Api, key: &CacheKey) -> Option<Duration> {
        api.inner.store.read(|state| {
            let entry = state.queries.get(key)?;
            if entry.status == QueryStatus::Uninitialized {
                return None;
            }
            lowest_polling_interval(state.subscriptions.get(key))
        })
    }

    fn refetch_valid_queries(&self, api: &Api, trigger: RefetchTrigger) {
        start_queries(api, |state: &ApiState| {
            let default = match trigger {
                RefetchTrigger::Focus => state.config.refetch_on_focus,
                RefetchTrigger::Reconnect => state.config.refetch_on_reconnect,
            };
            let requests: Vec<_> = state
                .subscriptions
                .iter()
                .filter(|(_, subscribers)| !subscribers.is_empty())
                .filter(|(_, subscribers)| wants_refetch(subscribers, trigger, default))
                .filter_map(|(key, _)| {
                    let entry = state.queries.get(key)?;
                    if entry.status == QueryStatus::Uninitialized {
                        return None;
                    }
                    QueryRequest::refetch(api, key, entry)
                })
                .collect();
            tracing::debug!(?trigger, queries = requests.len(), "Refetching active queries");
            (requests, Vec::new())
        });
    }

    #[cfg(test)]
    pub(crate) fn has_removal_timer(&self, key: &CacheKey) -> bool {
        self.removal_timers.contains_key(key)
    }

    #[cfg(test)]
    pub(crate) fn poll_interval(&self, key: &CacheKey) -> Option<Duration> {
        self.polls.get(key).map(|registration| registration.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::RequestId;
    use crate::state::SubscriptionOptions;

    fn subscribers(options: &[SubscriptionOptions]) -> Subscribers {
        options.iter().map(|options| (RequestId::new(), *options)).collect()
    }

    #[test]
    fn test_lowest_polling_interval_ignores_zero_and_unset() {
        let subs = subscribers(&[
            SubscriptionOptions::default(),
            SubscriptionOptions::polling(Duration::ZERO),
            SubscriptionOptions::polling(Duration::from_secs(30)),
            SubscriptionOptions::polling(Duration::from_secs(10)),
        ]);
        assert_eq!(lowest_polling_interval(Some(&subs)), Some(Duration::from_secs(10)));
        assert_eq!(lowest_polling_interval(None), None);
        assert_eq!(
            lowest_polling_interval(Some(&subscribers(&[SubscriptionOptions::default()]))),
            None
        );
    }

    #[test]
    fn test_opt_in_wins_over_opt_out() {
        let subs = subscribers(&[
            SubscriptionOptions::default().with_refetch_on_focus(false),
            SubscriptionOptions::default().with_refetch_on_focus(true),
        ]);
        assert!(wants_refetch(&subs, RefetchTrigger::Focus, false));
        assert!(!wants_refetch(&subs, RefetchTrigger::Reconnect, false));
    }

    #[test]
    fn test_global_default_and_opt_out() {
        let plain = subscribers(&[SubscriptionOptions::default()]);
        assert!(wants_refetch(&plain, RefetchTrigger::Reconnect, true));
        assert!(!wants_refetch(&plain, RefetchTrigger::Reconnect, false));

        let opted_out = subscribers(&[
            SubscriptionOptions::default(),
            SubscriptionOptions::default().with_refetch_on_reconnect(false),
        ]);
        assert!(!wants_refetch(&opted_out, RefetchTrigger::Reconnect, true));
    }
}
