// Integration tests for executors: custom query functions, response
// transforms, and how their outcomes are normalized

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use cloudburst::mock::MockTransport;
use cloudburst::prelude::*;
use cloudburst::transport::{BaseQueryApi, dummy_base_query};
use common::Post;
use parking_lot::Mutex;
use serde_json::{Value, json};

async fn explode() -> Result<Post, QueryError> {
    panic!("executor exploded")
}

fn custom_api(definition: QueryDefinition<u32, Post>) -> (Api, QueryEndpoint<u32, Post>) {
    let mut builder = Api::builder(dummy_base_query());
    let endpoint = builder.query("custom", definition).expect("custom registers");
    (builder.build(), endpoint)
}

#[tokio::test]
async fn test_query_fn_success() {
    let (api, custom) = custom_api(
        QueryDefinition::<u32, Post>::new().query_fn(|id, _api| async move { Ok(Post::new(id, "Custom")) }),
    );

    let handle = custom
        .initiate(&api, &5, InitiateOptions::default())
        .expect("initiate");
    assert_eq!(handle.result().await.expect("settles"), Post::new(5, "Custom"));
    assert!(handle.select().is_success());
}

#[tokio::test]
async fn test_query_fn_error_keeps_payload() {
    let (api, custom) = custom_api(
        QueryDefinition::<u32, Post>::new().query_fn(|_id, _api| async move {
            Err(QueryError::transport(json!({ "status": 418, "reason": "teapot" })))
        }),
    );

    let handle = custom
        .initiate(&api, &5, InitiateOptions::default())
        .expect("initiate");
    let err = handle.result().await.expect_err("rejects");
    assert_eq!(err, QueryError::Transport(json!({ "status": 418, "reason": "teapot" })));
    assert_eq!(handle.select().error, Some(err));
}

#[tokio::test]
async fn test_panicking_executor_rejects() {
    let (api, custom) = custom_api(QueryDefinition::<u32, Post>::new().query_fn(|_id, _api| explode()));

    let handle = custom
        .initiate(&api, &5, InitiateOptions::default())
        .expect("initiate");
    let err = handle.result().await.expect_err("rejects");
    assert_eq!(err, QueryError::Execution("executor exploded".to_string()));
    assert!(handle.select().is_error());
}

#[tokio::test]
async fn test_panic_before_the_future_rejects() {
    let (api, custom) = custom_api(QueryDefinition::<u32, Post>::new().query_fn(|id, _api| {
        assert!(id < 100, "id {id} out of range");
        async move { Ok(Post::new(id, "In range")) }
    }));

    let handle = custom
        .initiate(&api, &500, InitiateOptions::default())
        .expect("initiate");
    let err = handle.result().await.expect_err("rejects");
    assert!(matches!(err, QueryError::Execution(message) if message.contains("out of range")));

    let fine = custom
        .initiate(&api, &7, InitiateOptions::default())
        .expect("initiate");
    assert_eq!(fine.result().await.expect("settles").title, "In range");
}

#[tokio::test]
async fn test_unserializable_result_is_malformed() {
    let mut builder = Api::builder(dummy_base_query());
    let grid = builder
        .query(
            "grid",
            QueryDefinition::<(), HashMap<(u8, u8), u8>>::new()
                .query_fn(|(), _api| async move { Ok(HashMap::from([((0, 0), 1)])) }),
        )
        .expect("grid registers");
    let api = builder.build();

    let handle = grid
        .initiate(&api, &(), InitiateOptions::default())
        .expect("initiate");
    let err = handle.result().await.expect_err("rejects");
    assert!(matches!(err, QueryError::MalformedResult(_)));
}

#[tokio::test]
async fn test_transport_result_of_wrong_shape_is_malformed() {
    let mock = MockTransport::new(|_| Ok(json!("not a post")));
    let mut builder = Api::builder(mock);
    let get_post = builder
        .query(
            "getPost",
            QueryDefinition::<u32, Post>::new().query(|id| json!({ "id": id })),
        )
        .expect("getPost registers");
    let api = builder.build();

    let handle = get_post
        .initiate(&api, &1, InitiateOptions::default())
        .expect("initiate");
    let err = handle.result().await.expect_err("rejects");
    assert!(matches!(err, QueryError::MalformedResult(_)));
    assert!(handle.select().data().is_none());
}

#[tokio::test]
async fn test_transform_response_unwraps_envelope() {
    let mock = MockTransport::new(|args: &Value| {
        Ok(json!({ "data": { "id": args["id"], "title": "Wrapped" }, "meta": {} }))
    });
    let mut builder = Api::builder(mock);
    let get_post = builder
        .query(
            "getPost",
            QueryDefinition::<u32, Post>::new()
                .query(|id| json!({ "id": id }))
                .transform_response(|raw| {
                    serde_json::from_value(raw["data"].clone()).map_err(QueryError::from)
                }),
        )
        .expect("getPost registers");
    let api = builder.build();

    let handle = get_post
        .initiate(&api, &3, InitiateOptions::default())
        .expect("initiate");
    assert_eq!(handle.result().await.expect("settles"), Post::new(3, "Wrapped"));
}

#[tokio::test]
async fn test_query_fn_can_reach_base_transport() {
    let mock = MockTransport::new(|args: &Value| Ok(json!({ "id": args["id"], "title": "Base" })));
    let mut builder = Api::builder(mock.clone());
    let composed = builder
        .query(
            "composed",
            QueryDefinition::<u32, Post>::new().query_fn(|id, api: BaseQueryApi| async move {
                let raw = api.base_query(json!({ "id": id })).await?;
                let mut post: Post = serde_json::from_value(raw)?;
                post.title = format!("{} via {}", post.title, api.endpoint());
                Ok(post)
            }),
        )
        .expect("composed registers");
    let api = builder.build();

    let handle = composed
        .initiate(&api, &9, InitiateOptions::default())
        .expect("initiate");
    assert_eq!(handle.result().await.expect("settles").title, "Base via composed");
    assert_eq!(mock.calls(), vec![json!({ "id": 9 })]);
}

#[tokio::test]
async fn test_missing_transport_rejects() {
    let mut builder = Api::builder(dummy_base_query());
    let get_post = builder
        .query(
            "getPost",
            QueryDefinition::<u32, Post>::new().query(|id| json!({ "id": id })),
        )
        .expect("getPost registers");
    let api = builder.build();

    let handle = get_post
        .initiate(&api, &1, InitiateOptions::default())
        .expect("initiate");
    let err = handle.result().await.expect_err("rejects");
    assert!(matches!(err, QueryError::Execution(_)));
}

#[tokio::test]
async fn test_hooks_see_each_outcome() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let on_start = Arc::clone(&seen);
    let on_success = Arc::clone(&seen);
    let on_error = Arc::clone(&seen);

    let mock = MockTransport::new(|args: &Value| Ok(json!({ "id": args["id"], "title": "Hooked" })));
    let mut builder = Api::builder(mock.clone());
    let get_post = builder
        .query(
            "getPost",
            QueryDefinition::<u32, Post>::new()
                .query(|id| json!({ "id": id }))
                .on_start(move |id, ctx| on_start.lock().push(format!("start {id} {}", ctx.endpoint())))
                .on_success(move |id, _ctx, post| on_success.lock().push(format!("success {id} {}", post.title)))
                .on_error(move |id, _ctx, error| on_error.lock().push(format!("error {id} {error}"))),
        )
        .expect("getPost registers");
    let api = builder.build();

    let ok = get_post
        .initiate(&api, &1, InitiateOptions::default())
        .expect("initiate");
    ok.result().await.expect("settles");

    mock.fail_next(1, QueryError::Execution("down".to_string()));
    let failed = get_post
        .initiate(&api, &2, InitiateOptions::default())
        .expect("initiate");
    failed.result().await.expect_err("rejects");

    assert_eq!(
        *seen.lock(),
        vec![
            "start 1 getPost".to_string(),
            "success 1 Hooked".to_string(),
            "start 2 getPost".to_string(),
            "error 2 Execution failed: down".to_string(),
        ]
    );
}
