//! # Cloudburst - client-side data fetching and caching
//!
//! Cloudburst sits between an application and its remote operations. It
//! caches the results of *queries* by endpoint and argument, deduplicates
//! concurrent identical requests, runs *mutations*, and keeps cached data
//! fresh by invalidating and refetching it when related data changes.
//!
//! ## Architecture
//!
//! 1. **Endpoints**: typed [`QueryDefinition`]s and [`MutationDefinition`]s
//!    registered on an [`ApiBuilder`]
//! 2. **Store**: one [`ApiState`] that only changes by reducing [`Action`]s
//! 3. **Lifecycles**: every attempt goes `pending` and then `fulfilled` or
//!    `rejected`; settlements of superseded attempts are discarded
//! 4. **Coordinator**: reacts to reduced actions with entity invalidation,
//!    garbage collection of unused entries, polling and host-signal refetches
//! 5. **Subscriptions**: [`QueryHandle`]s keep entries alive; dropping the
//!    last one schedules removal
//!
//! ## Core Components
//!
//! - [`Api`]: the engine instance, cheap to clone
//! - [`transport::BaseQuery`]: the transport the engine calls; never implemented here
//! - [`QueryEndpoint`] / [`MutationEndpoint`]: typed entry points
//! - [`patch`]: reversible structural edits for optimistic updates
//! - [`listeners`]: host focus and connectivity signals
//!
//! ## Example
//!
//! ```rust
//! use cloudburst::prelude::*;
//! use cloudburst::mock::MockTransport;
//! use serde::{Deserialize, Serialize};
//! use serde_json::json;
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct Post {
//!     id: u32,
//!     title: String,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = MockTransport::new(|args| Ok(json!({ "id": args["id"], "title": "Hello" })));
//!
//! let mut builder = Api::builder(transport).entity_types(["Post"]);
//! let get_post = builder.query(
//!     "getPost",
//!     QueryDefinition::<u32, Post>::new()
//!         .query(|id| json!({ "id": id }))
//!         .provides_with(|_post, _error, id| vec![EntityDescriptor::with_id("Post", *id)]),
//! )?;
//! let api = builder.build();
//!
//! let handle = get_post.initiate(&api, &1, InitiateOptions::default())?;
//! let post = handle.result().await?;
//! assert_eq!(post.title, "Hello");
//!
//! // Refetches every subscribed query that provided `Post:1`.
//! api.invalidate_entities([EntityDescriptor::with_id("Post", 1)]);
//! # Ok(())
//! # }
//! ```

mod api;
mod config;
mod coordinator;
pub mod definition;
pub mod entity;
mod error;
pub mod key;
pub mod listeners;
pub mod mock;
mod module;
pub mod patch;
pub mod prelude;
mod selectors;
pub mod state;
mod subscription;
mod thunks;
pub mod transport;

pub use api::{Api, ApiBuilder, PrefetchOptions};
pub use config::ApiConfig;
pub use definition::{EndpointKind, LifecycleContext, MutationDefinition, QueryDefinition};
pub use entity::{EntityDescriptor, EntityId, EntityTypes};
pub use error::{ApiError, QueryError};
pub use key::{CacheKey, RequestId};
pub use module::ApiModule;
pub use patch::{Patch, PatchCollection, PatchError, PathSegment};
pub use selectors::{MutationResult, QueryResult};
pub use state::{Action, ApiState, QueryStatus, SubscriptionOptions};
pub use subscription::{
    InitiateOptions, MutationEndpoint, MutationHandle, MutationOptions, QueryEndpoint, QueryHandle, QueryView,
    Settled,
};
