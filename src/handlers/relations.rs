//! Relation handlers: follows, votes, saves
//!
//! One handler per `(relation collection, OperationKind)`. Each applies its
//! group in one bulk call, then adjusts the denormalized counters on the
//! target (and for follows, the actor) with one call per aggregate
//! collection.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CounterTally, HandlerReport, HandlerTable, MutationHandler, OperationKind};
use crate::store::{
    RelationKind, RelationRow, RelationStore, VoteKind, FOLLOWERS_COUNT, FOLLOWINGS_COUNT, SAVES_COUNT, USERS,
};
use crate::types::Result;

/// Payload of a relation mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationChange {
    pub actor_id: String,
    pub target_id: String,
    /// Vote kind after the change (create/update), or the kind being
    /// removed (delete). `None` for follows and saves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote: Option<VoteKind>,
    /// Stored vote kind an update replaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_vote: Option<VoteKind>,
}

impl RelationChange {
    pub fn new(actor_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            target_id: target_id.into(),
            vote: None,
            previous_vote: None,
        }
    }

    pub fn with_vote(mut self, vote: VoteKind) -> Self {
        self.vote = Some(vote);
        self
    }

    pub fn with_previous_vote(mut self, vote: VoteKind) -> Self {
        self.previous_vote = Some(vote);
        self
    }

    fn row(&self) -> RelationRow {
        RelationRow {
            actor_id: self.actor_id.clone(),
            target_id: self.target_id.clone(),
            vote: self.vote,
        }
    }
}

/// Counter deltas implied by one group of relation changes
pub fn relation_tally(kind: RelationKind, op: OperationKind, changes: &[RelationChange]) -> CounterTally {
    let mut tally = CounterTally::new();
    let sign = match op {
        OperationKind::Create => 1,
        OperationKind::Delete => -1,
        OperationKind::Update => 0,
    };

    for change in changes {
        match kind {
            RelationKind::Follow => {
                tally.add(USERS, &change.target_id, FOLLOWERS_COUNT, sign);
                tally.add(USERS, &change.actor_id, FOLLOWINGS_COUNT, sign);
            }
            RelationKind::Save => {
                tally.add(kind.target_collection(), &change.target_id, SAVES_COUNT, sign);
            }
            RelationKind::Vote if op == OperationKind::Update => {
                if let Some(previous) = change.previous_vote {
                    tally.add(kind.target_collection(), &change.target_id, previous.counter_field(), -1);
                }
                if let Some(next) = change.vote {
                    tally.add(kind.target_collection(), &change.target_id, next.counter_field(), 1);
                }
            }
            RelationKind::Vote => {
                if let Some(vote) = change.vote {
                    tally.add(kind.target_collection(), &change.target_id, vote.counter_field(), sign);
                }
            }
        }
    }
    tally
}

/// Applies one `(kind, op)` group against a [`RelationStore`]
pub struct RelationHandler<S: ?Sized> {
    kind: RelationKind,
    op: OperationKind,
    store: Arc<S>,
}

impl<S: ?Sized> RelationHandler<S> {
    pub fn new(kind: RelationKind, op: OperationKind, store: Arc<S>) -> Self {
        Self { kind, op, store }
    }
}

#[async_trait::async_trait]
impl<S> MutationHandler<RelationChange> for RelationHandler<S>
where
    S: RelationStore + ?Sized + 'static,
{
    async fn handle(&self, changes: Vec<RelationChange>) -> Result<HandlerReport> {
        let tally = relation_tally(self.kind, self.op, &changes);

        let rows = match self.op {
            OperationKind::Create => {
                let rows = changes.iter().map(RelationChange::row).collect();
                self.store.insert_relations(self.kind, rows).await?
            }
            OperationKind::Delete => {
                let pairs = changes
                    .into_iter()
                    .map(|c| (c.actor_id, c.target_id))
                    .collect();
                self.store.delete_relations(self.kind, pairs).await?
            }
            OperationKind::Update => {
                let rows = changes.iter().map(RelationChange::row).collect();
                self.store.update_relations(self.kind, rows).await?
            }
        };

        // Rows are already written; a counter failure here is not rolled back
        let mut counter_updates = 0;
        for (collection, deltas) in tally.into_batches() {
            counter_updates += deltas.len();
            self.store.adjust_counters(&collection, deltas).await?;
        }

        debug!(
            collection = self.kind.collection(),
            op = %self.op,
            rows,
            counter_updates,
            "Relation group applied"
        );
        Ok(HandlerReport { rows, counter_updates })
    }
}

/// Handler table for one relation kind: create and delete, plus update for
/// votes (kind switch)
pub fn relation_handlers<S>(kind: RelationKind, store: Arc<S>) -> HandlerTable<RelationChange>
where
    S: RelationStore + ?Sized + 'static,
{
    let mut table = HandlerTable::new();
    table.register(
        kind.collection(),
        OperationKind::Create,
        RelationHandler::new(kind, OperationKind::Create, Arc::clone(&store)),
    );
    table.register(
        kind.collection(),
        OperationKind::Delete,
        RelationHandler::new(kind, OperationKind::Delete, Arc::clone(&store)),
    );
    if kind == RelationKind::Vote {
        table.register(
            kind.collection(),
            OperationKind::Update,
            RelationHandler::new(kind, OperationKind::Update, store),
        );
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RelationFilter, DOWNVOTES_COUNT, POSTS, UPVOTES_COUNT};

    #[test]
    fn test_follow_tally_touches_both_users() {
        let changes = vec![RelationChange::new("a", "b"), RelationChange::new("c", "b")];
        let batches = relation_tally(RelationKind::Follow, OperationKind::Create, &changes).into_batches();

        assert_eq!(batches.len(), 1);
        let (collection, deltas) = &batches[0];
        assert_eq!(collection, USERS);
        let followers = deltas.iter().find(|d| d.field == FOLLOWERS_COUNT).unwrap();
        assert_eq!((followers.entity_id.as_str(), followers.delta), ("b", 2));
        assert_eq!(deltas.iter().filter(|d| d.field == FOLLOWINGS_COUNT).count(), 2);
    }

    #[test]
    fn test_vote_switch_tally() {
        let changes = vec![RelationChange::new("a", "p")
            .with_vote(VoteKind::Down)
            .with_previous_vote(VoteKind::Up)];
        let batches = relation_tally(RelationKind::Vote, OperationKind::Update, &changes).into_batches();

        let (collection, deltas) = &batches[0];
        assert_eq!(collection, POSTS);
        let delta_of = |field: &str| deltas.iter().find(|d| d.field == field).map(|d| d.delta);
        assert_eq!(delta_of(UPVOTES_COUNT), Some(-1));
        assert_eq!(delta_of(DOWNVOTES_COUNT), Some(1));
    }

    #[tokio::test]
    async fn test_create_then_delete_round_trip_counters() {
        let store = Arc::new(MemoryStore::new());
        let table = relation_handlers(RelationKind::Save, Arc::clone(&store));
        assert!(!table.contains("saves", OperationKind::Update));

        let create = table.get("saves", OperationKind::Create).unwrap();
        let report = create
            .handle(vec![RelationChange::new("u1", "p1"), RelationChange::new("u2", "p1")])
            .await
            .unwrap();
        assert_eq!(report, HandlerReport { rows: 2, counter_updates: 1 });
        assert_eq!(store.counter(POSTS, "p1", SAVES_COUNT).await.unwrap(), 2);

        let delete = table.get("saves", OperationKind::Delete).unwrap();
        delete.handle(vec![RelationChange::new("u1", "p1")]).await.unwrap();
        assert_eq!(store.counter(POSTS, "p1", SAVES_COUNT).await.unwrap(), 1);
        assert_eq!(
            store
                .count_relations(RelationKind::Save, RelationFilter::target("p1"))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_storage_failure_skips_counters() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline("follows", true);
        let handler = RelationHandler::new(RelationKind::Follow, OperationKind::Create, Arc::clone(&store));

        assert!(handler.handle(vec![RelationChange::new("a", "b")]).await.is_err());
        assert_eq!(store.counter(USERS, "b", FOLLOWERS_COUNT).await.unwrap(), 0);
    }
}
