//! Toggle-relation decision protocol
//!
//! A toggle reads the stored relation, folds in whatever is still pending
//! for the same `actor-target` key, applies the requested action, and
//! leaves exactly one record in the buffer: the net change relative to
//! storage. Nothing here awaits a flush.
//!
//! The stored state is read before the buffer is consulted. A flush that
//! lands in between, or a second replica, can still produce a stale
//! decision; the unique index turns a duplicate create into a failed
//! group rather than a duplicate row.

mod vote;

pub use vote::{VoteKind, VoteState};

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::buffer::{MutationDispatcher, PendingRecord};
use crate::handlers::relations::RelationChange;
use crate::handlers::OperationKind;
use crate::store::{RelationKind, Store};
use crate::types::Result;

/// Dedup key shared by every toggle of one actor on one target
pub fn dedup_key(actor_id: &str, target_id: &str) -> String {
    format!("{}-{}", actor_id, target_id)
}

/// `None` when absent, `Some(vote)` when present (`vote` is `None` for
/// follows and saves)
type Presence = Option<Option<VoteKind>>;

/// Result of one toggle, returned without waiting for the flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ToggleOutcome {
    /// Whether the relation exists once pending writes land
    pub active: bool,
    /// Vote kind once pending writes land
    pub vote: Option<VoteKind>,
    /// Net mutation now pending, relative to storage. `None` when the
    /// toggles cancelled out.
    pub decision: Option<OperationKind>,
}

impl ToggleOutcome {
    pub fn vote_state(&self) -> VoteState {
        VoteState::from(self.vote)
    }
}

/// State once `pending` lands on top of storage
fn effective(stored: Presence, pending: Option<&PendingRecord<RelationChange>>) -> Presence {
    match pending {
        None => stored,
        Some(record) => match record.kind {
            OperationKind::Delete => None,
            OperationKind::Create | OperationKind::Update => Some(record.payload.vote),
        },
    }
}

/// Apply a requested action. `requested` is the vote kind for votes and
/// `None` for follows and saves.
fn next_state(current: Presence, requested: Option<VoteKind>) -> Presence {
    match (current, requested) {
        (None, _) => Some(requested),
        (Some(_), None) => None,
        (Some(existing), Some(action)) => VoteState::from(existing).apply(action).kind().map(Some),
    }
}

/// Mutation that moves storage from `stored` to `next`
fn net_change(stored: Presence, next: Presence, actor_id: &str, target_id: &str) -> Option<PendingRecord<RelationChange>> {
    let change = RelationChange::new(actor_id, target_id);
    match (stored, next) {
        (a, b) if a == b => None,
        (None, Some(vote)) => Some(PendingRecord {
            kind: OperationKind::Create,
            payload: RelationChange { vote, ..change },
        }),
        (Some(vote), None) => Some(PendingRecord {
            kind: OperationKind::Delete,
            payload: RelationChange { vote, ..change },
        }),
        (Some(previous), Some(vote)) => Some(PendingRecord {
            kind: OperationKind::Update,
            payload: RelationChange {
                vote,
                previous_vote: previous,
                ..change
            },
        }),
        (None, None) => None,
    }
}

/// Follow, vote and save toggles over their dispatchers
#[derive(Clone)]
pub struct ToggleService {
    store: Arc<dyn Store>,
    follows: MutationDispatcher<RelationChange>,
    votes: MutationDispatcher<RelationChange>,
    saves: MutationDispatcher<RelationChange>,
}

impl ToggleService {
    pub fn new(
        store: Arc<dyn Store>,
        follows: MutationDispatcher<RelationChange>,
        votes: MutationDispatcher<RelationChange>,
        saves: MutationDispatcher<RelationChange>,
    ) -> Self {
        Self {
            store,
            follows,
            votes,
            saves,
        }
    }

    pub async fn toggle_follow(&self, follower_id: &str, following_id: &str) -> Result<ToggleOutcome> {
        self.toggle(RelationKind::Follow, follower_id, following_id, None)
            .await
    }

    pub async fn toggle_vote(&self, voter_id: &str, target_id: &str, action: VoteKind) -> Result<ToggleOutcome> {
        self.toggle(RelationKind::Vote, voter_id, target_id, Some(action))
            .await
    }

    pub async fn toggle_save(&self, user_id: &str, target_id: &str) -> Result<ToggleOutcome> {
        self.toggle(RelationKind::Save, user_id, target_id, None)
            .await
    }

    fn dispatcher(&self, kind: RelationKind) -> &MutationDispatcher<RelationChange> {
        match kind {
            RelationKind::Follow => &self.follows,
            RelationKind::Vote => &self.votes,
            RelationKind::Save => &self.saves,
        }
    }

    async fn toggle(
        &self,
        kind: RelationKind,
        actor_id: &str,
        target_id: &str,
        requested: Option<VoteKind>,
    ) -> Result<ToggleOutcome> {
        let stored: Presence = self
            .store
            .find_relation(kind, actor_id, target_id)
            .await?
            .map(|row| row.vote);

        let key = dedup_key(actor_id, target_id);
        let outcome = self
            .dispatcher(kind)
            .reconcile(kind.collection(), &key, |pending| {
                let next = next_state(effective(stored, pending.as_ref()), requested);
                let net = net_change(stored, next, actor_id, target_id);
                let outcome = ToggleOutcome {
                    active: next.is_some(),
                    vote: next.flatten(),
                    decision: net.as_ref().map(|record| record.kind),
                };
                (net, outcome)
            });

        debug!(
            relation = %kind,
            key = %key,
            active = outcome.active,
            decision = ?outcome.decision,
            "Toggle recorded"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_key() {
        assert_eq!(dedup_key("alice", "post-1"), "alice-post-1");
    }

    #[test]
    fn test_next_state_for_plain_relations() {
        assert_eq!(next_state(None, None), Some(None));
        assert_eq!(next_state(Some(None), None), None);
    }

    #[test]
    fn test_next_state_for_votes() {
        let up = Some(VoteKind::Up);
        let down = Some(VoteKind::Down);
        assert_eq!(next_state(None, up), Some(up));
        assert_eq!(next_state(Some(up), up), None);
        assert_eq!(next_state(Some(up), down), Some(down));
    }

    #[test]
    fn test_net_change_relative_to_storage() {
        let up = Some(VoteKind::Up);
        let down = Some(VoteKind::Down);

        let create = net_change(None, Some(down), "a", "p").unwrap();
        assert_eq!(create.kind, OperationKind::Create);
        assert_eq!(create.payload.vote, down);

        let switch = net_change(Some(up), Some(down), "a", "p").unwrap();
        assert_eq!(switch.kind, OperationKind::Update);
        assert_eq!(switch.payload.previous_vote, up);

        let delete = net_change(Some(up), None, "a", "p").unwrap();
        assert_eq!(delete.kind, OperationKind::Delete);
        assert_eq!(delete.payload.vote, up);

        assert!(net_change(Some(up), Some(up), "a", "p").is_none());
        assert!(net_change(None, None, "a", "p").is_none());
    }

    #[test]
    fn test_effective_overlays_pending() {
        let pending = PendingRecord {
            kind: OperationKind::Delete,
            payload: RelationChange::new("a", "b"),
        };
        assert_eq!(effective(Some(None), Some(&pending)), None);
        assert_eq!(effective(Some(None), None), Some(None));
    }
}
