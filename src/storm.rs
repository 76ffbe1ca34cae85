//! Synthetic toggle storm and counter verification
//!
//! Drives random follow / vote / save toggles, views and access-log lines
//! through [`BatchServices`], then checks every denormalized counter
//! against the relation rows it summarizes.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::StormArgs;
use crate::services::BatchServices;
use crate::store::{
    AccessLogEntry, RelationFilter, RelationKind, Store, VoteKind, DOWNVOTES_COUNT, FOLLOWERS_COUNT,
    FOLLOWINGS_COUNT, POSTS, SAVES_COUNT, UPVOTES_COUNT, USERS,
};
use crate::types::Result;

/// One synthetic request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StormRequest {
    Follow { actor: String, target: String },
    Vote { actor: String, post: String, kind: VoteKind },
    Save { actor: String, post: String },
    View { actor: String, post: String },
}

/// What the storm did
#[derive(Debug, Clone, Default, Serialize)]
pub struct StormSummary {
    pub requests: usize,
    pub toggles: usize,
    pub views: usize,
    /// Toggle requests that failed their point lookup
    pub errors: usize,
    pub elapsed_ms: u128,
}

/// A counter that disagrees with its relation rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterDrift {
    pub collection: &'static str,
    pub entity_id: String,
    pub field: &'static str,
    pub counter: i64,
    pub rows: u64,
}

pub fn actor_id(i: usize) -> String {
    format!("user-{}", i)
}

pub fn post_id(i: usize) -> String {
    format!("post-{}", i)
}

/// Random request mix: mostly votes, then views, follows and saves
pub fn generate(args: &StormArgs) -> Vec<StormRequest> {
    let mut rng = rand::thread_rng();
    let actors: Vec<String> = (0..args.storm_actors).map(actor_id).collect();
    let posts: Vec<String> = (0..args.storm_targets).map(post_id).collect();

    (0..args.storm_requests)
        .filter_map(|_| {
            let actor = actors.choose(&mut rng)?.clone();
            let post = posts.choose(&mut rng)?.clone();
            let request = match rng.gen_range(0..10) {
                0..=3 => StormRequest::Vote {
                    actor,
                    post,
                    kind: if rng.gen_bool(0.7) { VoteKind::Up } else { VoteKind::Down },
                },
                4..=5 => StormRequest::View { actor, post },
                6..=7 => {
                    let target = actors.choose(&mut rng)?.clone();
                    if target == actor {
                        return None;
                    }
                    StormRequest::Follow { actor, target }
                }
                _ => StormRequest::Save { actor, post },
            };
            Some(request)
        })
        .collect()
}

/// Issue every request with at most `concurrency` in flight. Returns once
/// every request is buffered; flushing is left to the buffers.
pub async fn run(services: &BatchServices, requests: Vec<StormRequest>, concurrency: usize) -> StormSummary {
    let started = Instant::now();
    let summary = Arc::new(std::sync::Mutex::new(StormSummary {
        requests: requests.len(),
        ..Default::default()
    }));

    stream::iter(requests)
        .for_each_concurrent(concurrency.max(1), |request| {
            let summary = Arc::clone(&summary);
            async move {
                let (is_view, result) = apply(services, &request).await;
                let mut summary = summary.lock().unwrap_or_else(|p| p.into_inner());
                match (is_view, result) {
                    (true, _) => summary.views += 1,
                    (false, Ok(())) => summary.toggles += 1,
                    (false, Err(e)) => {
                        summary.errors += 1;
                        debug!(error = %e, ?request, "Storm request failed");
                    }
                }
            }
        })
        .await;

    let mut summary = summary.lock().unwrap_or_else(|p| p.into_inner()).clone();
    summary.elapsed_ms = started.elapsed().as_millis();
    info!(
        requests = summary.requests,
        toggles = summary.toggles,
        views = summary.views,
        errors = summary.errors,
        elapsed_ms = summary.elapsed_ms as u64,
        "Storm issued"
    );
    summary
}

async fn apply(services: &BatchServices, request: &StormRequest) -> (bool, Result<()>) {
    let started = Instant::now();
    let (is_view, path, actor, result) = match request {
        StormRequest::Follow { actor, target } => (
            false,
            format!("/users/{}/follow", target),
            actor,
            services.toggles().toggle_follow(actor, target).await.map(|_| ()),
        ),
        StormRequest::Vote { actor, post, kind } => (
            false,
            format!("/posts/{}/{}vote", post, kind.as_str()),
            actor,
            services.toggles().toggle_vote(actor, post, *kind).await.map(|_| ()),
        ),
        StormRequest::Save { actor, post } => (
            false,
            format!("/posts/{}/save", post),
            actor,
            services.toggles().toggle_save(actor, post).await.map(|_| ()),
        ),
        StormRequest::View { actor, post } => {
            services.views().track(actor, post);
            (true, format!("/posts/{}", post), actor, Ok(()))
        }
    };

    let status = if result.is_ok() { 200 } else { 500 };
    services.access_log().ingest(
        AccessLogEntry::new("POST", path, status, started.elapsed().as_millis() as u64).with_actor(actor.as_str()),
    );
    (is_view, result)
}

/// Compare every counter touched by a storm over `actors` x `targets`
/// with a count of the rows behind it
pub async fn verify_counters(store: &dyn Store, actors: usize, targets: usize) -> Result<Vec<CounterDrift>> {
    let mut drift = Vec::new();

    for i in 0..actors {
        let user = actor_id(i);
        let checks = [
            (FOLLOWERS_COUNT, RelationFilter::target(user.as_str())),
            (FOLLOWINGS_COUNT, RelationFilter::actor(user.as_str())),
        ];
        for (field, filter) in checks {
            let rows = store.count_relations(RelationKind::Follow, filter).await?;
            let counter = store.counter(USERS, &user, field).await?;
            if counter != rows as i64 {
                drift.push(CounterDrift {
                    collection: USERS,
                    entity_id: user.clone(),
                    field,
                    counter,
                    rows,
                });
            }
        }
    }

    for i in 0..targets {
        let post = post_id(i);
        let checks = [
            (RelationKind::Vote, UPVOTES_COUNT, RelationFilter::target(post.as_str()).with_vote(VoteKind::Up)),
            (RelationKind::Vote, DOWNVOTES_COUNT, RelationFilter::target(post.as_str()).with_vote(VoteKind::Down)),
            (RelationKind::Save, SAVES_COUNT, RelationFilter::target(post.as_str())),
        ];
        for (kind, field, filter) in checks {
            let rows = store.count_relations(kind, filter).await?;
            let counter = store.counter(POSTS, &post, field).await?;
            if counter != rows as i64 {
                drift.push(CounterDrift {
                    collection: POSTS,
                    entity_id: post.clone(),
                    field,
                    counter,
                    rows,
                });
            }
        }
    }

    if drift.is_empty() {
        info!(actors, targets, "Counters match relation rows");
    } else {
        for d in &drift {
            warn!(
                collection = d.collection,
                entity = %d.entity_id,
                field = d.field,
                counter = d.counter,
                rows = d.rows,
                "Counter drift"
            );
        }
    }
    Ok(drift)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storm_args(requests: usize) -> StormArgs {
        StormArgs {
            storm_actors: 5,
            storm_targets: 3,
            storm_requests: requests,
            storm_concurrency: 4,
            storm_strict: false,
        }
    }

    #[test]
    fn test_generate_stays_in_range() {
        let requests = generate(&storm_args(200));
        assert!(requests.len() <= 200);
        for request in &requests {
            match request {
                StormRequest::Follow { actor, target } => assert_ne!(actor, target),
                StormRequest::Vote { post, .. } | StormRequest::Save { post, .. } | StormRequest::View { post, .. } => {
                    assert!(["post-0", "post-1", "post-2"].contains(&post.as_str()))
                }
            }
        }
    }
}
