//! MongoDB implementation of the storage traits

use bson::{doc, oid::ObjectId, Bson, Document};
use tracing::debug;

use super::mongo::{MongoClient, MongoCollection, UpdateStatement};
use super::schemas::{
    AccessLogDoc, FollowDoc, NotificationDoc, RelationSchema, SaveDoc, VoteDoc, ACCESS_LOG_COLLECTION,
    NOTIFICATION_COLLECTION,
};
use crate::store::{
    AccessLogEntry, ActivityStore, CounterDelta, NotificationChange, RelationFilter, RelationKind, RelationRow,
    RelationStore,
};
use crate::types::Result;

/// Relation and activity storage on MongoDB
#[derive(Clone)]
pub struct MongoStore {
    client: MongoClient,
    follows: MongoCollection<FollowDoc>,
    votes: MongoCollection<VoteDoc>,
    saves: MongoCollection<SaveDoc>,
    notifications: MongoCollection<NotificationDoc>,
    access_logs: MongoCollection<AccessLogDoc>,
}

impl MongoStore {
    /// Open every collection, creating indexes
    pub async fn connect(client: MongoClient) -> Result<Self> {
        let store = Self {
            follows: client.collection(RelationKind::Follow.collection()).await?,
            votes: client.collection(RelationKind::Vote.collection()).await?,
            saves: client.collection(RelationKind::Save.collection()).await?,
            notifications: client.collection(NOTIFICATION_COLLECTION).await?,
            access_logs: client.collection(ACCESS_LOG_COLLECTION).await?,
            client,
        };
        debug!(db = %store.client.db_name(), "MongoStore ready");
        Ok(store)
    }
}

// =============================================================================
// Filter builders
// =============================================================================

/// Filter for one `(actor, target)` pair
pub(crate) fn pair_filter(kind: RelationKind, actor_id: &str, target_id: &str) -> Document {
    let mut filter = Document::new();
    filter.insert(kind.actor_field(), actor_id);
    filter.insert(kind.target_field(), target_id);
    filter
}

/// Filter matching any of the given pairs
pub(crate) fn pairs_filter(kind: RelationKind, pairs: &[(String, String)]) -> Document {
    let any: Vec<Bson> = pairs
        .iter()
        .map(|(actor, target)| Bson::Document(pair_filter(kind, actor, target)))
        .collect();
    doc! { "$or": any }
}

pub(crate) fn count_filter(kind: RelationKind, filter: &RelationFilter) -> Document {
    let mut out = Document::new();
    if let Some(actor) = &filter.actor_id {
        out.insert(kind.actor_field(), actor.as_str());
    }
    if let Some(target) = &filter.target_id {
        out.insert(kind.target_field(), target.as_str());
    }
    if let Some(vote) = filter.vote {
        out.insert("vote", vote.as_str());
    }
    out
}

/// Entity ids are ObjectIds when they parse as one, plain strings otherwise
pub(crate) fn entity_filter(entity_id: &str) -> Document {
    match ObjectId::parse_str(entity_id) {
        Ok(oid) => doc! { "_id": oid },
        Err(_) => doc! { "_id": entity_id },
    }
}

/// One upserting `$inc` per delta
pub(crate) fn counter_statements(deltas: Vec<CounterDelta>) -> Vec<UpdateStatement> {
    deltas
        .into_iter()
        .map(|CounterDelta { entity_id, field, delta }| {
            let mut inc = Document::new();
            inc.insert(field, delta);
            UpdateStatement::new(entity_filter(&entity_id), doc! { "$inc": inc }).upsert()
        })
        .collect()
}

/// One `$set` of the vote kind per row
pub(crate) fn vote_statements(kind: RelationKind, rows: &[RelationRow]) -> Vec<UpdateStatement> {
    rows.iter()
        .filter_map(|row| {
            let vote = row.vote?;
            Some(UpdateStatement::new(
                pair_filter(kind, &row.actor_id, &row.target_id),
                doc! { "$set": { "vote": vote.as_str(), "metadata.updated_at": bson::DateTime::now() } },
            ))
        })
        .collect()
}

/// Owner-scoped filter over many notifications
pub(crate) fn notifications_filter(changes: &[NotificationChange]) -> Document {
    let any: Vec<Bson> = changes
        .iter()
        .map(|c| Bson::Document(doc! { "_id": c.notification_id.as_str(), "userId": c.user_id.as_str() }))
        .collect();
    doc! { "$or": any }
}

// =============================================================================
// Generic relation operations
// =============================================================================

async fn find<T: RelationSchema>(coll: &MongoCollection<T>, actor_id: &str, target_id: &str) -> Result<Option<RelationRow>> {
    Ok(coll
        .find_one(pair_filter(T::KIND, actor_id, target_id))
        .await?
        .map(T::into_row))
}

async fn insert<T: RelationSchema>(coll: &MongoCollection<T>, rows: Vec<RelationRow>) -> Result<u64> {
    coll.insert_many(rows.into_iter().map(T::from_row).collect()).await
}

async fn delete<T: RelationSchema>(coll: &MongoCollection<T>, pairs: &[(String, String)]) -> Result<u64> {
    coll.delete_many(pairs_filter(T::KIND, pairs)).await
}

async fn count<T: RelationSchema>(coll: &MongoCollection<T>, filter: &RelationFilter) -> Result<u64> {
    coll.count(count_filter(T::KIND, filter)).await
}

#[async_trait::async_trait]
impl RelationStore for MongoStore {
    async fn find_relation(&self, kind: RelationKind, actor_id: &str, target_id: &str) -> Result<Option<RelationRow>> {
        match kind {
            RelationKind::Follow => find(&self.follows, actor_id, target_id).await,
            RelationKind::Vote => find(&self.votes, actor_id, target_id).await,
            RelationKind::Save => find(&self.saves, actor_id, target_id).await,
        }
    }

    async fn insert_relations(&self, kind: RelationKind, rows: Vec<RelationRow>) -> Result<u64> {
        match kind {
            RelationKind::Follow => insert(&self.follows, rows).await,
            RelationKind::Vote => insert(&self.votes, rows).await,
            RelationKind::Save => insert(&self.saves, rows).await,
        }
    }

    async fn delete_relations(&self, kind: RelationKind, pairs: Vec<(String, String)>) -> Result<u64> {
        if pairs.is_empty() {
            return Ok(0);
        }
        match kind {
            RelationKind::Follow => delete(&self.follows, &pairs).await,
            RelationKind::Vote => delete(&self.votes, &pairs).await,
            RelationKind::Save => delete(&self.saves, &pairs).await,
        }
    }

    async fn update_relations(&self, kind: RelationKind, rows: Vec<RelationRow>) -> Result<u64> {
        self.client
            .bulk_update(kind.collection(), vote_statements(kind, &rows))
            .await
    }

    async fn adjust_counters(&self, collection: &str, deltas: Vec<CounterDelta>) -> Result<u64> {
        self.client
            .bulk_update(collection, counter_statements(deltas))
            .await
    }

    async fn counter(&self, collection: &str, entity_id: &str, field: &str) -> Result<i64> {
        let found = self
            .client
            .raw_collection(collection)
            .find_one(entity_filter(entity_id))
            .await?;

        Ok(match found.as_ref().and_then(|d| d.get(field)) {
            Some(Bson::Int64(n)) => *n,
            Some(Bson::Int32(n)) => i64::from(*n),
            Some(Bson::Double(n)) => *n as i64,
            _ => 0,
        })
    }

    async fn count_relations(&self, kind: RelationKind, filter: RelationFilter) -> Result<u64> {
        match kind {
            RelationKind::Follow => count(&self.follows, &filter).await,
            RelationKind::Vote => count(&self.votes, &filter).await,
            RelationKind::Save => count(&self.saves, &filter).await,
        }
    }
}

#[async_trait::async_trait]
impl ActivityStore for MongoStore {
    async fn mark_notifications_read(&self, changes: Vec<NotificationChange>) -> Result<u64> {
        if changes.is_empty() {
            return Ok(0);
        }
        let mut filter = notifications_filter(&changes);
        filter.insert("read", false);
        self.notifications
            .update_many(filter, doc! { "$set": { "read": true, "readAt": bson::DateTime::now() } })
            .await
    }

    async fn delete_notifications(&self, changes: Vec<NotificationChange>) -> Result<u64> {
        if changes.is_empty() {
            return Ok(0);
        }
        self.notifications
            .delete_many(notifications_filter(&changes))
            .await
    }

    async fn insert_access_logs(&self, entries: Vec<AccessLogEntry>) -> Result<u64> {
        self.access_logs
            .insert_many(entries.into_iter().map(AccessLogDoc::from).collect())
            .await
    }
}
