//! Capability modules.
//!
//! A module is added to an [`ApiBuilder`](crate::ApiBuilder) and observes the
//! API from then on: it learns about every registered endpoint and sees every
//! reduced action, in reduction order, before the built-in coordinator reacts
//! to it.
//!
//! ```
//! use cloudburst::prelude::*;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct CountFulfilled(AtomicUsize);
//!
//! impl ApiModule for CountFulfilled {
//!     fn name(&self) -> &'static str {
//!         "count-fulfilled"
//!     }
//!
//!     fn action_dispatched(&self, _api: &Api, action: &Action) {
//!         let fulfilled = action
//!             .flatten()
//!             .filter(|action| matches!(action, Action::QueryFulfilled { .. }))
//!             .count();
//!         self.0.fetch_add(fulfilled, Ordering::Relaxed);
//!     }
//! }
//! ```

use crate::api::Api;
use crate::definition::EndpointKind;
use crate::state::Action;

/// Extension point observing an [`Api`].
///
/// Callbacks run synchronously on the dispatching thread, with no lock held,
/// so they may read state or call back into the API.
pub trait ApiModule: Send + Sync + 'static {
    /// A short name used in log events.
    fn name(&self) -> &'static str;

    /// An endpoint was registered, at build time or by injection.
    fn endpoint_injected(&self, _api: &Api, _name: &str, _kind: EndpointKind) {}

    /// An action was reduced. Grouped actions arrive as one [`Action::Batch`].
    fn action_dispatched(&self, _api: &Api, _action: &Action) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::QueryDefinition;
    use crate::mock::MockTransport;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Injections(Arc<Mutex<Vec<(String, EndpointKind)>>>);

    impl ApiModule for Injections {
        fn name(&self) -> &'static str {
            "injections"
        }

        fn endpoint_injected(&self, _api: &Api, name: &str, kind: EndpointKind) {
            self.0.lock().push((name.to_string(), kind));
        }
    }

    #[test]
    fn test_module_sees_builder_and_injected_endpoints() {
        let injections = Injections::default();
        let mut builder = Api::builder(MockTransport::new(|_| Ok(json!(null)))).module(injections.clone());
        builder
            .query("getPost", QueryDefinition::<u32, Value>::new().query(|id| json!(id)))
            .expect("registers");
        let api = builder.build();
        api.inject_query("listPosts", QueryDefinition::<(), Value>::new().query(|()| json!(null)), false)
            .expect("injects");

        assert_eq!(
            *injections.0.lock(),
            vec![
                ("getPost".to_string(), EndpointKind::Query),
                ("listPosts".to_string(), EndpointKind::Query),
            ]
        );
    }

    #[derive(Clone, Default)]
    struct Actions(Arc<Mutex<Vec<&'static str>>>);

    impl ApiModule for Actions {
        fn name(&self) -> &'static str {
            "actions"
        }

        fn action_dispatched(&self, _api: &Api, action: &Action) {
            self.0.lock().extend(action.flatten().map(Action::type_name));
        }
    }

    #[test]
    fn test_module_sees_dispatched_actions() {
        let actions = Actions::default();
        let api = Api::builder(MockTransport::new(|_| Ok(json!(null))))
            .module(actions.clone())
            .build();
        api.on_offline();
        api.invalidate_entities(["Post"]);
        assert_eq!(
            *actions.0.lock(),
            vec!["config/offline", "invalidation/invalidateEntities"]
        );
    }
}
