// Integration tests for entity invalidation: refetching used queries,
// evicting unused ones

mod common;

use cloudburst::prelude::*;
use common::{Post, blog, until};
use serde_json::json;

const PENDING: &str = "queries/pending";

#[tokio::test]
async fn test_mutation_refetches_subscribed_providers() {
    let blog = blog();

    let first = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    let second = blog
        .get_post
        .initiate(&blog.api, &2, InitiateOptions::default())
        .expect("initiate");
    let list = blog
        .list_posts
        .initiate(&blog.api, &(), InitiateOptions::default())
        .expect("initiate");
    let _ = tokio::join!(first.result(), second.result(), list.result());
    assert_eq!(blog.mock.call_count(), 3);
    blog.recorder.clear();

    let mutation = blog
        .update_post
        .initiate(&blog.api, &Post::new(1, "Renamed"), MutationOptions::default())
        .expect("initiate");
    assert_eq!(mutation.result().await.expect("mutation settles").title, "Renamed");

    // Post:1 is provided by getPost(1) and listPosts, refetched together.
    assert!(
        blog.recorder
            .dispatches()
            .contains(&vec![PENDING, PENDING])
    );
    assert!(second.select().is_success());
    assert!(!second.select().is_fetching());

    let joined = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    assert_eq!(joined.result().await.expect("refetch settles").title, "Renamed");
    let listed = blog
        .list_posts
        .initiate(&blog.api, &(), InitiateOptions::default())
        .expect("initiate");
    let posts = listed.result().await.expect("refetch settles");
    assert_eq!(posts[0].title, "Renamed");

    // Three initial queries, one mutation, two refetches.
    assert_eq!(blog.mock.call_count(), 6);
}

#[tokio::test]
async fn test_unused_queries_are_evicted_not_refetched() {
    let blog = blog();

    let handle = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    handle.result().await.expect("settles");
    let key = handle.key().clone();
    drop(handle);
    assert!(blog.api.query_entry(&key).is_some());

    blog.api.invalidate_entities([EntityDescriptor::with_id("Post", 1)]);

    assert!(blog.api.query_entry(&key).is_none());
    assert!(
        blog.api
            .with_state(|state| state.provided.provided_by(&key).is_empty())
    );
    assert_eq!(blog.mock.call_count(), 1);
    assert!(blog.recorder.types().contains(&"queries/removeQueryResult"));
}

#[tokio::test]
async fn test_type_invalidation_reaches_every_id() {
    let blog = blog();

    let first = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    let second = blog
        .get_post
        .initiate(&blog.api, &2, InitiateOptions::default())
        .expect("initiate");
    let _ = tokio::join!(first.result(), second.result());

    blog.api.invalidate_entities(["Post"]);

    assert!(first.select().is_fetching());
    assert!(second.select().is_fetching());
    // Data stays visible while refetching.
    assert!(first.select().is_success());
}

#[tokio::test]
async fn test_id_invalidation_leaves_other_ids_alone() {
    let blog = blog();

    let first = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    let second = blog
        .get_post
        .initiate(&blog.api, &2, InitiateOptions::default())
        .expect("initiate");
    let _ = tokio::join!(first.result(), second.result());

    blog.api.invalidate_entities([EntityDescriptor::with_id("Post", 2)]);

    assert!(!first.select().is_fetching());
    assert!(second.select().is_fetching());
}

#[tokio::test]
async fn test_string_id_reaches_numeric_provision() {
    let blog = blog();

    let handle = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    handle.result().await.expect("settles");

    blog.api.invalidate_entities([EntityDescriptor::with_id("Post", "1")]);

    assert!(handle.select().is_fetching());
    until(|| blog.mock.call_count() == 2).await;
}

#[tokio::test]
async fn test_unmatched_invalidation_changes_nothing() {
    let blog = blog();

    let handle = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    handle.result().await.expect("settles");
    let before = blog.api.snapshot();
    blog.recorder.clear();

    blog.api.invalidate_entities([EntityDescriptor::with_id("Post", 99)]);

    assert_eq!(blog.recorder.dispatches(), vec![vec!["invalidation/invalidateEntities"]]);
    assert_eq!(blog.api.snapshot(), before);
    assert_eq!(blog.mock.call_count(), 1);
}

#[tokio::test]
async fn test_empty_invalidation_dispatches_nothing() {
    let blog = blog();

    blog.api.invalidate_entities(Vec::<EntityDescriptor>::new());

    assert!(blog.recorder.dispatches().is_empty());
}

#[tokio::test]
async fn test_failed_mutation_does_not_invalidate() {
    let blog = blog();

    let handle = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    handle.result().await.expect("settles");

    blog.mock.fail_next(1, QueryError::transport(json!({ "status": 500 })));
    let mutation = blog
        .update_post
        .initiate(&blog.api, &Post::new(1, "Lost"), MutationOptions::default())
        .expect("initiate");
    mutation.result().await.expect_err("mutation fails");

    assert!(mutation.select().is_error());
    assert!(!handle.select().is_fetching());
    assert_eq!(blog.mock.call_count(), 2);
}

#[tokio::test]
async fn test_untracked_mutation_still_invalidates() {
    let blog = blog();

    let handle = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    handle.result().await.expect("settles");

    let mutation = blog
        .update_post
        .initiate(
            &blog.api,
            &Post::new(1, "Quiet"),
            MutationOptions { track: false },
        )
        .expect("initiate");
    mutation.result().await.expect("mutation settles");

    assert!(blog.api.mutation_entry(mutation.request_id()).is_none());
    assert!(handle.select().is_fetching());
}

#[tokio::test]
async fn test_provided_index_follows_latest_result() {
    let blog = blog();

    let list = blog
        .list_posts
        .initiate(&blog.api, &(), InitiateOptions::default())
        .expect("initiate");
    list.result().await.expect("settles");

    let affected = |id: u32| {
        blog.api
            .with_state(|state| state.provided.keys_for(&[EntityDescriptor::with_id("Post", id)]))
    };
    assert!(affected(2).contains(list.key()));

    blog.db.lock().remove(&2);
    let mut list = list;
    list.refetch().expect("registered").await.expect("settles");

    assert!(!affected(2).contains(list.key()));
    assert!(affected(1).contains(list.key()));
}
