//! Storage seam for handlers
//!
//! Handlers are the only callers of these traits. Two backends exist:
//! [`MemoryStore`] (dashmap, used in tests and dev mode) and
//! [`MongoStore`](crate::db::MongoStore) (MongoDB).

mod memory;

pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Result;

/// Collection holding user documents and their follow counters
pub const USERS: &str = "users";
/// Collection holding post documents and their vote/save/view counters
pub const POSTS: &str = "posts";
pub const NOTIFICATIONS: &str = "notifications";
pub const ACCESS_LOGS: &str = "access_logs";

pub const FOLLOWERS_COUNT: &str = "followersCount";
pub const FOLLOWINGS_COUNT: &str = "followingsCount";
pub const UPVOTES_COUNT: &str = "upvotesCount";
pub const DOWNVOTES_COUNT: &str = "downvotesCount";
pub const SAVES_COUNT: &str = "savesCount";
pub const VIEWS_COUNT: &str = "viewsCount";

// =============================================================================
// Relations
// =============================================================================

/// Many-to-many relation kinds that toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// follower -> followed user
    Follow,
    /// voter -> post, carries a vote kind
    Vote,
    /// user -> saved post
    Save,
}

impl RelationKind {
    /// Collection holding the relation rows
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Follow => "follows",
            Self::Vote => "votes",
            Self::Save => "saves",
        }
    }

    pub fn actor_field(&self) -> &'static str {
        match self {
            Self::Follow => "followerId",
            Self::Vote => "voterId",
            Self::Save => "userId",
        }
    }

    pub fn target_field(&self) -> &'static str {
        match self {
            Self::Follow => "followingId",
            Self::Vote | Self::Save => "targetId",
        }
    }

    /// Collection of the entity the relation points at
    pub fn target_collection(&self) -> &'static str {
        match self {
            Self::Follow => USERS,
            Self::Vote | Self::Save => POSTS,
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.collection())
    }
}

/// Direction of a vote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteKind {
    #[default]
    Up,
    Down,
}

impl VoteKind {
    /// Post counter tracking this kind
    pub fn counter_field(&self) -> &'static str {
        match self {
            Self::Up => UPVOTES_COUNT,
            Self::Down => DOWNVOTES_COUNT,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

/// One stored relation row. At most one per `(kind, actor, target)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRow {
    pub actor_id: String,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote: Option<VoteKind>,
}

impl RelationRow {
    pub fn new(actor_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            target_id: target_id.into(),
            vote: None,
        }
    }

    pub fn vote(actor_id: impl Into<String>, target_id: impl Into<String>, vote: VoteKind) -> Self {
        Self {
            vote: Some(vote),
            ..Self::new(actor_id, target_id)
        }
    }
}

/// Filter for counting relation rows
#[derive(Debug, Clone, Default)]
pub struct RelationFilter {
    pub actor_id: Option<String>,
    pub target_id: Option<String>,
    pub vote: Option<VoteKind>,
}

impl RelationFilter {
    pub fn target(target_id: impl Into<String>) -> Self {
        Self {
            target_id: Some(target_id.into()),
            ..Default::default()
        }
    }

    pub fn actor(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: Some(actor_id.into()),
            ..Default::default()
        }
    }

    pub fn with_vote(mut self, vote: VoteKind) -> Self {
        self.vote = Some(vote);
        self
    }

    pub fn matches(&self, row: &RelationRow) -> bool {
        self.actor_id.as_deref().map_or(true, |a| a == row.actor_id)
            && self.target_id.as_deref().map_or(true, |t| t == row.target_id)
            && self.vote.map_or(true, |v| row.vote == Some(v))
    }
}

/// One signed adjustment of a denormalized counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub entity_id: String,
    pub field: String,
    pub delta: i64,
}

/// Relation rows and the counters derived from them
#[async_trait::async_trait]
pub trait RelationStore: Send + Sync {
    /// Point lookup of the current relation between actor and target
    async fn find_relation(&self, kind: RelationKind, actor_id: &str, target_id: &str) -> Result<Option<RelationRow>>;

    /// Bulk insert. Fails if any row violates uniqueness; other rows may
    /// still have been written.
    async fn insert_relations(&self, kind: RelationKind, rows: Vec<RelationRow>) -> Result<u64>;

    /// Bulk delete by `(actor, target)` pair
    async fn delete_relations(&self, kind: RelationKind, pairs: Vec<(String, String)>) -> Result<u64>;

    /// Bulk update of the vote kind on existing rows
    async fn update_relations(&self, kind: RelationKind, rows: Vec<RelationRow>) -> Result<u64>;

    /// One bulk counter adjustment against one aggregate collection
    async fn adjust_counters(&self, collection: &str, deltas: Vec<CounterDelta>) -> Result<u64>;

    /// Current counter value, zero when the entity or field is missing
    async fn counter(&self, collection: &str, entity_id: &str, field: &str) -> Result<i64>;

    async fn count_relations(&self, kind: RelationKind, filter: RelationFilter) -> Result<u64>;
}

// =============================================================================
// Activity
// =============================================================================

/// Read or delete request for one notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationChange {
    pub notification_id: String,
    pub user_id: String,
}

/// One ingested HTTP access log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    pub id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    pub latency_ms: u64,
    pub at: DateTime<Utc>,
}

impl AccessLogEntry {
    pub fn new(method: impl Into<String>, path: impl Into<String>, status: u16, latency_ms: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            path: path.into(),
            status,
            actor_id: None,
            latency_ms,
            at: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

/// Notification state and access logs
#[async_trait::async_trait]
pub trait ActivityStore: Send + Sync {
    /// Mark notifications read, scoped to their owner
    async fn mark_notifications_read(&self, changes: Vec<NotificationChange>) -> Result<u64>;

    /// Delete notifications, scoped to their owner
    async fn delete_notifications(&self, changes: Vec<NotificationChange>) -> Result<u64>;

    async fn insert_access_logs(&self, entries: Vec<AccessLogEntry>) -> Result<u64>;
}

/// Everything the batch handlers need from storage
pub trait Store: RelationStore + ActivityStore {}

impl<T: RelationStore + ActivityStore + ?Sized> Store for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_kind_fields() {
        assert_eq!(RelationKind::Follow.collection(), "follows");
        assert_eq!(RelationKind::Follow.target_collection(), USERS);
        assert_eq!(RelationKind::Vote.actor_field(), "voterId");
        assert_eq!(RelationKind::Save.target_collection(), POSTS);
    }

    #[test]
    fn test_filter_matches() {
        let row = RelationRow::vote("a", "p", VoteKind::Up);
        assert!(RelationFilter::target("p").matches(&row));
        assert!(RelationFilter::target("p").with_vote(VoteKind::Up).matches(&row));
        assert!(!RelationFilter::target("p").with_vote(VoteKind::Down).matches(&row));
        assert!(!RelationFilter::actor("b").matches(&row));
    }

    #[test]
    fn test_access_log_serializes_camel_case() {
        let entry = AccessLogEntry::new("GET", "/posts/1", 200, 12).with_actor("u1");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"latencyMs\":12"));
        assert!(json.contains("\"actorId\":\"u1\""));
    }
}
