// Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use cloudburst::mock::MockTransport;
use cloudburst::prelude::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: u32,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Post {
    pub fn new(id: u32, title: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            tags: Vec::new(),
        }
    }
}

/// Records every reduced action, one entry per dispatch.
#[derive(Clone, Default)]
pub struct RecordingModule {
    dispatches: Arc<Mutex<Vec<Vec<&'static str>>>>,
}

impl RecordingModule {
    /// All recorded action types, flattened.
    pub fn types(&self) -> Vec<&'static str> {
        self.dispatches.lock().iter().flatten().copied().collect()
    }

    /// Recorded action types grouped by dispatch.
    pub fn dispatches(&self) -> Vec<Vec<&'static str>> {
        self.dispatches.lock().clone()
    }

    pub fn clear(&self) {
        self.dispatches.lock().clear();
    }
}

impl ApiModule for RecordingModule {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn action_dispatched(&self, _api: &Api, action: &Action) {
        self.dispatches
            .lock()
            .push(action.flatten().map(Action::type_name).collect());
    }
}

pub type Db = Arc<Mutex<BTreeMap<u32, Post>>>;

/// A small blog backend: `get`, `list` and `update` operations over an
/// in-memory table.
pub fn blog_transport(db: &Db) -> MockTransport {
    let db = Arc::clone(db);
    MockTransport::new(move |args: &Value| {
        let mut db = db.lock();
        match args["op"].as_str() {
            Some("get") => {
                let id = args["id"].as_u64().and_then(|id| u32::try_from(id).ok()).unwrap_or_default();
                db.get(&id)
                    .map(|post| serde_json::to_value(post).unwrap_or_default())
                    .ok_or_else(|| QueryError::transport(json!({ "status": 404 })))
            }
            Some("list") => Ok(serde_json::to_value(db.values().collect::<Vec<_>>()).unwrap_or_default()),
            Some("update") => {
                let post: Post = serde_json::from_value(args["body"].clone())
                    .map_err(|e| QueryError::transport(json!({ "status": 400, "message": e.to_string() })))?;
                db.insert(post.id, post.clone());
                Ok(serde_json::to_value(post).unwrap_or_default())
            }
            _ => Err(QueryError::transport(json!({ "status": 400 }))),
        }
    })
}

pub struct Blog {
    pub api: Api,
    pub mock: MockTransport,
    pub db: Db,
    pub recorder: RecordingModule,
    pub get_post: QueryEndpoint<u32, Post>,
    pub list_posts: QueryEndpoint<(), Vec<Post>>,
    pub update_post: MutationEndpoint<Post, Post>,
}

pub fn seeded_db() -> Db {
    let db: Db = Arc::default();
    {
        let mut table = db.lock();
        table.insert(1, Post::new(1, "First"));
        table.insert(2, Post::new(2, "Second"));
    }
    db
}

pub fn blog() -> Blog {
    blog_with(|builder| builder)
}

/// Builds the blog API, letting the caller adjust the builder first.
pub fn blog_with(configure: impl FnOnce(ApiBuilder) -> ApiBuilder) -> Blog {
    let db = seeded_db();
    let mock = blog_transport(&db);
    let recorder = RecordingModule::default();

    let mut builder = configure(
        Api::builder(mock.clone())
            .entity_types(["Post"])
            .module(recorder.clone()),
    );
    let get_post = builder
        .query(
            "getPost",
            QueryDefinition::<u32, Post>::new()
                .query(|id| json!({ "op": "get", "id": id }))
                .provides_with(|_post, _error, id| vec![EntityDescriptor::with_id("Post", *id)]),
        )
        .expect("getPost registers");
    let list_posts = builder
        .query(
            "listPosts",
            QueryDefinition::<(), Vec<Post>>::new()
                .query(|()| json!({ "op": "list" }))
                .provides_with(|posts, _error, ()| {
                    let mut provided = vec![EntityDescriptor::with_id("Post", "LIST")];
                    provided.extend(
                        posts
                            .into_iter()
                            .flatten()
                            .map(|post| EntityDescriptor::with_id("Post", post.id)),
                    );
                    provided
                }),
        )
        .expect("listPosts registers");
    let update_post = builder
        .mutation(
            "updatePost",
            MutationDefinition::<Post, Post>::new()
                .query(|post| json!({ "op": "update", "body": post }))
                .invalidates_with(|_result, _error, post| vec![EntityDescriptor::with_id("Post", post.id)]),
        )
        .expect("updatePost registers");

    Blog {
        api: builder.build(),
        mock,
        db,
        recorder,
        get_post,
        list_posts,
        update_post,
    }
}

/// Lets spawned request tasks run until `done` holds.
pub async fn until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !done() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition should hold eventually");
}
