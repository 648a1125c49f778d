//! Prelude module for convenient imports.
//!
//! ```
//! use cloudburst::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`Api`] and [`ApiBuilder`] - The engine and its setup
//! - [`QueryDefinition`] / [`MutationDefinition`] - Endpoint definitions
//! - [`QueryEndpoint`] / [`MutationEndpoint`] - Typed entry points and their handles
//! - [`EntityDescriptor`] - Invalidation targets
//! - [`ApiModule`] and [`Action`] - For observing the API

pub use crate::api::{Api, ApiBuilder, PrefetchOptions};
pub use crate::config::ApiConfig;
pub use crate::definition::{LifecycleContext, MutationDefinition, QueryDefinition};
pub use crate::entity::EntityDescriptor;
pub use crate::error::{ApiError, QueryError};
pub use crate::module::ApiModule;
pub use crate::selectors::{MutationResult, QueryResult};
pub use crate::state::{Action, QueryStatus, SubscriptionOptions};
pub use crate::subscription::{
    InitiateOptions, MutationEndpoint, MutationHandle, MutationOptions, QueryEndpoint, QueryHandle,
};
