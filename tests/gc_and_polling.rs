// Integration tests for timer-driven behavior: removal of unused entries
// and polling. The clock is paused so timers fire deterministically.

mod common;

use std::time::Duration;

use cloudburst::prelude::*;
use common::{blog, blog_with, until};

const KEEP: Duration = Duration::from_secs(10);

#[tokio::test(start_paused = true)]
async fn test_unused_entry_removed_after_grace_period() {
    let blog = blog_with(|builder| builder.keep_unused_data_for(KEEP));

    let handle = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    handle.result().await.expect("settles");
    let key = handle.key().clone();
    drop(handle);

    tokio::time::sleep(KEEP - Duration::from_secs(1)).await;
    assert!(blog.api.query_entry(&key).is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(blog.api.query_entry(&key).is_none());
    assert!(blog.recorder.types().contains(&"queries/removeQueryResult"));
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_cancels_removal() {
    let blog = blog_with(|builder| builder.keep_unused_data_for(KEEP));

    let handle = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    handle.result().await.expect("settles");
    drop(handle);

    tokio::time::sleep(KEEP / 2).await;
    let again = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    again.result().await.expect("cache hit");

    tokio::time::sleep(KEEP * 2).await;
    assert!(blog.api.query_entry(again.key()).is_some());
    assert_eq!(blog.mock.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_one_remaining_subscriber_keeps_entry() {
    let blog = blog_with(|builder| builder.keep_unused_data_for(KEEP));

    let first = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    let second = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    second.result().await.expect("settles");
    drop(first);

    tokio::time::sleep(KEEP * 2).await;
    assert!(blog.api.query_entry(second.key()).is_some());
    assert_eq!(blog.api.subscriber_count(second.key()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_prefetched_entry_is_collected() {
    let blog = blog_with(|builder| builder.keep_unused_data_for(KEEP));

    blog.api
        .prefetch(&blog.get_post, &2, PrefetchOptions::default())
        .expect("prefetch");
    let key = blog.get_post.cache_key(&blog.api, &2).expect("key");
    until(|| {
        blog.get_post
            .select(&blog.api, &2)
            .is_ok_and(|result| result.is_success())
    })
    .await;
    assert_eq!(blog.api.subscriber_count(&key), 0);

    tokio::time::sleep(KEEP + Duration::from_secs(1)).await;
    assert!(blog.api.query_entry(&key).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_skips_recent_data() {
    let blog = blog();

    let handle = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    handle.result().await.expect("settles");

    blog.api
        .prefetch(&blog.get_post, &1, PrefetchOptions::if_older_than(Duration::from_secs(30)))
        .expect("prefetch");
    assert!(!handle.select().is_fetching());

    tokio::time::sleep(Duration::from_secs(31)).await;
    blog.api
        .prefetch(&blog.get_post, &1, PrefetchOptions::if_older_than(Duration::from_secs(30)))
        .expect("prefetch");
    assert!(handle.select().is_fetching());

    until(|| !handle.select().is_fetching()).await;
    assert_eq!(blog.mock.call_count(), 2);
    blog.api
        .prefetch(&blog.get_post, &1, PrefetchOptions::force())
        .expect("prefetch");
    assert!(handle.select().is_fetching());
}

#[tokio::test(start_paused = true)]
async fn test_polling_refetches_until_unsubscribed() {
    let blog = blog();

    let handle = blog
        .get_post
        .initiate(
            &blog.api,
            &1,
            InitiateOptions::default().with_subscription_options(SubscriptionOptions::polling(Duration::from_secs(5))),
        )
        .expect("initiate");
    handle.result().await.expect("settles");
    assert_eq!(blog.mock.call_count(), 1);

    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert_eq!(blog.mock.call_count(), 2);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(blog.mock.call_count(), 3);

    drop(handle);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(blog.mock.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_lowest_polling_interval_wins() {
    let blog = blog();

    let slow = blog
        .get_post
        .initiate(
            &blog.api,
            &1,
            InitiateOptions::default().with_subscription_options(SubscriptionOptions::polling(Duration::from_secs(10))),
        )
        .expect("initiate");
    let fast = blog
        .get_post
        .initiate(
            &blog.api,
            &1,
            InitiateOptions::default().with_subscription_options(SubscriptionOptions::polling(Duration::from_secs(3))),
        )
        .expect("initiate");
    fast.result().await.expect("settles");

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    assert_eq!(blog.mock.call_count(), 2);

    // The poll already scheduled still fires, then the slow interval applies.
    drop(fast);
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(blog.mock.call_count(), 3);
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(blog.mock.call_count(), 3);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(blog.mock.call_count(), 4);
    drop(slow);
}

#[tokio::test(start_paused = true)]
async fn test_updating_options_starts_polling() {
    let blog = blog();

    let mut handle = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    handle.result().await.expect("settles");

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(blog.mock.call_count(), 1);

    handle.update_subscription_options(SubscriptionOptions::polling(Duration::from_secs(2)));
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert_eq!(blog.mock.call_count(), 2);

    handle.update_subscription_options(SubscriptionOptions::default());
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(blog.mock.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reset_clears_every_entry() {
    let blog = blog_with(|builder| builder.keep_unused_data_for(KEEP));

    let query = blog
        .get_post
        .initiate(&blog.api, &1, InitiateOptions::default())
        .expect("initiate");
    query.result().await.expect("settles");
    let mutation = blog
        .update_post
        .initiate(&blog.api, &common::Post::new(2, "Reset me"), MutationOptions::default())
        .expect("initiate");
    mutation.result().await.expect("settles");

    blog.api.reset();

    assert!(blog.api.with_state(|state| state.queries.is_empty() && state.mutations.is_empty()));
    assert!(query.select().is_uninitialized());
    drop(query);
    drop(mutation);
    tokio::time::sleep(KEEP * 2).await;
    assert!(blog.api.with_state(|state| state.queries.is_empty()));
}
