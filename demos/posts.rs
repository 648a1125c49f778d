//! Posts example: caching, deduplication, optimistic updates and
//! invalidation against a simulated backend.
//!
//! The backend is an async closure with a little latency, standing in for
//! an HTTP client. Set `RUST_LOG=cloudburst=debug` to watch the engine work.
//!
//! Run with: `cargo run --example posts`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cloudburst::PatchCollection;
use cloudburst::listeners::{HostSignal, signal_port};
use cloudburst::prelude::*;
use cloudburst::transport::{BaseQuery, BaseQueryApi};
use color_eyre::eyre::Result;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Post {
    id: u32,
    title: String,
    likes: u32,
}

type Table = Arc<Mutex<BTreeMap<u32, Post>>>;

/// Answers `GET /posts`, `GET /posts/{id}` and `PUT /posts/{id}`.
fn backend(table: Table) -> impl BaseQuery {
    move |args: Value, api: BaseQueryApi| {
        let table = Arc::clone(&table);
        async move {
            tokio::select! {
                () = api.signal().cancelled() => return Err(QueryError::Aborted),
                () = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
            let mut table = table.lock();
            let id = args["id"].as_u64().and_then(|id| u32::try_from(id).ok());
            let found = match (args["method"].as_str(), id) {
                (Some("GET"), None) => Some(serde_json::to_value(table.values().collect::<Vec<_>>())?),
                (Some("GET"), Some(id)) => table.get(&id).map(serde_json::to_value).transpose()?,
                (Some("PUT"), Some(id)) => {
                    let post: Post = serde_json::from_value(args["body"].clone())?;
                    table.insert(id, post.clone());
                    Some(serde_json::to_value(post)?)
                }
                _ => None,
            };
            found.ok_or_else(|| QueryError::transport(json!({ "status": 404, "args": args })))
        }
        .boxed()
    }
}

fn install_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    install_tracing();

    let table: Table = Arc::default();
    {
        let mut posts = table.lock();
        posts.insert(1, Post { id: 1, title: "Hello".into(), likes: 3 });
        posts.insert(2, Post { id: 2, title: "World".into(), likes: 0 });
    }

    let mut builder = Api::builder(backend(Arc::clone(&table)))
        .name("posts")
        .keep_unused_data_for(Duration::from_secs(5))
        .refetch_on_reconnect(true)
        .entity_types(["Post"]);

    let get_post = builder.query(
        "getPost",
        QueryDefinition::<u32, Post>::new()
            .query(|id| json!({ "method": "GET", "id": id }))
            .provides_with(|_post, _error, id| vec![EntityDescriptor::with_id("Post", *id)]),
    )?;
    let list_posts = builder.query(
        "listPosts",
        QueryDefinition::<(), Vec<Post>>::new()
            .query(|()| json!({ "method": "GET" }))
            .provides_with(|posts, _error, ()| {
                let mut provided = vec![EntityDescriptor::with_id("Post", "LIST")];
                provided.extend(posts.into_iter().flatten().map(|post| EntityDescriptor::with_id("Post", post.id)));
                provided
            }),
    )?;
    let api = builder.build();

    // The like counter is updated optimistically and rolled back on failure.
    let like_target = get_post.clone();
    let rollback_target = get_post.clone();
    let like_post = api.inject_mutation(
        "likePost",
        MutationDefinition::<Post, Post>::new()
            .query(|post| json!({ "method": "PUT", "id": post.id, "body": post }))
            .invalidates(["Post"])
            .on_start(move |post, ctx| {
                let likes = post.likes;
                match ctx.api().update_query_result(&like_target, &post.id, |cached| cached.likes = likes) {
                    Ok(patches) => ctx.insert(patches),
                    Err(e) => tracing::warn!(error = %e, "Optimistic update failed"),
                }
            })
            .on_error(move |post, ctx, error| {
                tracing::warn!(%error, "Like failed, rolling back");
                if let Some(patches) = ctx.take::<PatchCollection>() {
                    let _ = ctx
                        .api()
                        .patch_query_result(&rollback_target, &post.id, patches.inverse_patches);
                }
            }),
        false,
    )?;

    // Two components asking for the same post share one request.
    let header = get_post.initiate(&api, &1, InitiateOptions::default())?;
    let sidebar = get_post.initiate(&api, &1, InitiateOptions::default())?;
    let (a, b) = tokio::join!(header.result(), sidebar.result());
    println!("header: {:?}", a?);
    println!("sidebar: {:?}", b?);

    let list = list_posts.initiate(&api, &(), InitiateOptions::default())?;
    println!("list: {:?}", list.result().await?);

    // Watch the post while the mutation runs.
    let mut view = header.view();
    let watcher = tokio::spawn(async move {
        let mut refetched = false;
        while let Some(result) = view.changed().await {
            println!(
                "post 1 -> fetching: {}, likes: {:?}",
                result.is_fetching(),
                result.data().map(|post| post.likes)
            );
            refetched |= result.is_fetching();
            if refetched && !result.is_fetching() {
                break;
            }
        }
    });

    let mut liked = header.select().data.unwrap_or(Post { id: 1, title: String::new(), likes: 0 });
    liked.likes += 1;
    let mutation = like_post.initiate(&api, &liked, MutationOptions::default())?;
    println!("mutation: {:?}", mutation.result().await?);
    watcher.await?;

    // Host signals arrive through a channel.
    let (signals, listener) = signal_port(&api);
    signals.send(HostSignal::Offline)?;
    signals.send(HostSignal::Online)?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    listener.cancel().await;

    drop((header, sidebar, list));
    println!("state: {}", serde_json::to_string_pretty(&api.snapshot())?);
    Ok(())
}
