//! In-memory store backed by DashMap
//!
//! Mirrors the MongoDB backend closely enough for tests and dev mode:
//! unique `(kind, actor, target)` rows, counters created on first use,
//! unordered bulk inserts that keep going past duplicates.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use super::{
    AccessLogEntry, ActivityStore, CounterDelta, NotificationChange, RelationFilter, RelationKind, RelationRow,
    RelationStore, NOTIFICATIONS,
};
use crate::types::{BatchError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredNotification {
    user_id: String,
    read: bool,
}

/// Thread-safe in-memory implementation of both storage traits
#[derive(Default)]
pub struct MemoryStore {
    relations: DashMap<(RelationKind, String, String), RelationRow>,
    counters: DashMap<(String, String, String), i64>,
    notifications: DashMap<String, StoredNotification>,
    access_logs: DashMap<String, AccessLogEntry>,
    /// Collections whose writes currently fail
    offline: DashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write against `collection` fail until brought back online
    pub fn set_offline(&self, collection: &str, offline: bool) {
        if offline {
            self.offline.insert(collection.to_string());
        } else {
            self.offline.remove(collection);
        }
    }

    /// Insert a relation row directly, bypassing counters
    pub fn seed_relation(&self, kind: RelationKind, row: RelationRow) {
        self.relations
            .insert((kind, row.actor_id.clone(), row.target_id.clone()), row);
    }

    /// Set a counter directly
    pub fn seed_counter(&self, collection: &str, entity_id: &str, field: &str, value: i64) {
        self.counters
            .insert((collection.to_string(), entity_id.to_string(), field.to_string()), value);
    }

    pub fn seed_notification(&self, notification_id: &str, user_id: &str) {
        self.notifications.insert(
            notification_id.to_string(),
            StoredNotification {
                user_id: user_id.to_string(),
                read: false,
            },
        );
    }

    /// `Some(read)` if the notification exists
    pub fn notification_read(&self, notification_id: &str) -> Option<bool> {
        self.notifications.get(notification_id).map(|n| n.read)
    }

    pub fn access_log_count(&self) -> usize {
        self.access_logs.len()
    }

    pub fn relation_count(&self, kind: RelationKind) -> usize {
        self.relations.iter().filter(|r| r.key().0 == kind).count()
    }

    fn check_online(&self, collection: &str) -> Result<()> {
        if self.offline.contains(collection) {
            return Err(BatchError::Storage(format!("collection '{}' is offline", collection)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RelationStore for MemoryStore {
    async fn find_relation(&self, kind: RelationKind, actor_id: &str, target_id: &str) -> Result<Option<RelationRow>> {
        Ok(self
            .relations
            .get(&(kind, actor_id.to_string(), target_id.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn insert_relations(&self, kind: RelationKind, rows: Vec<RelationRow>) -> Result<u64> {
        self.check_online(kind.collection())?;

        let mut inserted = 0u64;
        let mut duplicates = Vec::new();
        for row in rows {
            match self
                .relations
                .entry((kind, row.actor_id.clone(), row.target_id.clone()))
            {
                Entry::Occupied(_) => duplicates.push(format!("{}-{}", row.actor_id, row.target_id)),
                Entry::Vacant(slot) => {
                    slot.insert(row);
                    inserted += 1;
                }
            }
        }

        if !duplicates.is_empty() {
            return Err(BatchError::Storage(format!(
                "duplicate key in '{}' for {}",
                kind.collection(),
                duplicates.join(", ")
            )));
        }
        debug!(collection = kind.collection(), inserted, "Inserted relations");
        Ok(inserted)
    }

    async fn delete_relations(&self, kind: RelationKind, pairs: Vec<(String, String)>) -> Result<u64> {
        self.check_online(kind.collection())?;

        let deleted = pairs
            .into_iter()
            .filter(|(actor, target)| {
                self.relations
                    .remove(&(kind, actor.clone(), target.clone()))
                    .is_some()
            })
            .count() as u64;
        Ok(deleted)
    }

    async fn update_relations(&self, kind: RelationKind, rows: Vec<RelationRow>) -> Result<u64> {
        self.check_online(kind.collection())?;

        let mut modified = 0u64;
        for row in rows {
            if let Some(mut stored) = self
                .relations
                .get_mut(&(kind, row.actor_id.clone(), row.target_id.clone()))
            {
                if stored.vote != row.vote {
                    stored.vote = row.vote;
                    modified += 1;
                }
            }
        }
        Ok(modified)
    }

    async fn adjust_counters(&self, collection: &str, deltas: Vec<CounterDelta>) -> Result<u64> {
        self.check_online(collection)?;

        let applied = deltas.len() as u64;
        for CounterDelta { entity_id, field, delta } in deltas {
            *self
                .counters
                .entry((collection.to_string(), entity_id, field))
                .or_insert(0) += delta;
        }
        Ok(applied)
    }

    async fn counter(&self, collection: &str, entity_id: &str, field: &str) -> Result<i64> {
        Ok(self
            .counters
            .get(&(collection.to_string(), entity_id.to_string(), field.to_string()))
            .map(|c| *c)
            .unwrap_or(0))
    }

    async fn count_relations(&self, kind: RelationKind, filter: RelationFilter) -> Result<u64> {
        Ok(self
            .relations
            .iter()
            .filter(|r| r.key().0 == kind && filter.matches(r.value()))
            .count() as u64)
    }
}

#[async_trait::async_trait]
impl ActivityStore for MemoryStore {
    async fn mark_notifications_read(&self, changes: Vec<NotificationChange>) -> Result<u64> {
        self.check_online(NOTIFICATIONS)?;

        let mut modified = 0u64;
        for change in changes {
            if let Some(mut stored) = self.notifications.get_mut(&change.notification_id) {
                if stored.user_id == change.user_id && !stored.read {
                    stored.read = true;
                    modified += 1;
                }
            }
        }
        Ok(modified)
    }

    async fn delete_notifications(&self, changes: Vec<NotificationChange>) -> Result<u64> {
        self.check_online(NOTIFICATIONS)?;

        let deleted = changes
            .into_iter()
            .filter(|change| {
                self.notifications
                    .remove_if(&change.notification_id, |_, stored| stored.user_id == change.user_id)
                    .is_some()
            })
            .count() as u64;
        Ok(deleted)
    }

    async fn insert_access_logs(&self, entries: Vec<AccessLogEntry>) -> Result<u64> {
        self.check_online(super::ACCESS_LOGS)?;

        let inserted = entries.len() as u64;
        for entry in entries {
            self.access_logs.insert(entry.id.clone(), entry);
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{VoteKind, POSTS, UPVOTES_COUNT};

    #[tokio::test]
    async fn test_insert_rejects_duplicates_but_keeps_others() {
        let store = MemoryStore::new();
        store.seed_relation(RelationKind::Follow, RelationRow::new("a", "b"));

        let result = store
            .insert_relations(
                RelationKind::Follow,
                vec![RelationRow::new("a", "b"), RelationRow::new("a", "c")],
            )
            .await;

        assert!(result.unwrap_err().to_string().contains("a-b"));
        assert!(store
            .find_relation(RelationKind::Follow, "a", "c")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_update_switches_vote_kind() {
        let store = MemoryStore::new();
        store.seed_relation(RelationKind::Vote, RelationRow::vote("a", "p", VoteKind::Up));

        let modified = store
            .update_relations(RelationKind::Vote, vec![RelationRow::vote("a", "p", VoteKind::Down)])
            .await
            .unwrap();
        assert_eq!(modified, 1);

        let count = store
            .count_relations(RelationKind::Vote, RelationFilter::target("p").with_vote(VoteKind::Down))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_counters_start_at_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.counter(POSTS, "p", UPVOTES_COUNT).await.unwrap(), 0);

        store
            .adjust_counters(
                POSTS,
                vec![CounterDelta {
                    entity_id: "p".into(),
                    field: UPVOTES_COUNT.into(),
                    delta: 2,
                }],
            )
            .await
            .unwrap();
        assert_eq!(store.counter(POSTS, "p", UPVOTES_COUNT).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_offline_collection_fails_writes() {
        let store = MemoryStore::new();
        store.set_offline("follows", true);

        let err = store
            .insert_relations(RelationKind::Follow, vec![RelationRow::new("a", "b")])
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Storage(_)));

        store.set_offline("follows", false);
        tokio_test::assert_ok!(
            store
                .insert_relations(RelationKind::Follow, vec![RelationRow::new("a", "b")])
                .await
        );
    }

    #[tokio::test]
    async fn test_notification_changes_are_owner_scoped() {
        let store = MemoryStore::new();
        store.seed_notification("n1", "alice");
        store.seed_notification("n2", "alice");

        let change = |id: &str, user: &str| NotificationChange {
            notification_id: id.into(),
            user_id: user.into(),
        };

        let read = store
            .mark_notifications_read(vec![change("n1", "alice"), change("n2", "mallory")])
            .await
            .unwrap();
        assert_eq!(read, 1);
        assert_eq!(store.notification_read("n1"), Some(true));
        assert_eq!(store.notification_read("n2"), Some(false));

        let deleted = store
            .delete_notifications(vec![change("n2", "mallory"), change("n1", "alice")])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.notification_read("n1"), None);
    }
}
