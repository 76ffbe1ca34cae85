//! Relation documents: follows, votes, saves
//!
//! Each collection carries a unique `(actor, target)` index, the storage
//! guarantee behind "at most one relation per pair".

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::store::{RelationKind, RelationRow, VoteKind};

/// A relation schema that converts to and from [`RelationRow`]
pub trait RelationSchema:
    Serialize + DeserializeOwned + Unpin + Send + Sync + Default + IntoIndexes + MutMetadata
{
    const KIND: RelationKind;

    fn from_row(row: RelationRow) -> Self;

    fn into_row(self) -> RelationRow;
}

fn unique_pair_index(actor: &str, target: &str, name: &str) -> Vec<(Document, Option<IndexOptions>)> {
    let mut keys = Document::new();
    keys.insert(actor, 1);
    keys.insert(target, 1);

    let mut by_target = Document::new();
    by_target.insert(target, 1);

    vec![
        (
            keys,
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name(format!("{}_pair_unique", name))
                    .build(),
            ),
        ),
        // Counter reconciliation counts rows per target
        (
            by_target,
            Some(IndexOptions::builder().name(format!("{}_target_index", name)).build()),
        ),
    ]
}

/// `follows` document
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct FollowDoc {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub follower_id: String,

    pub following_id: String,
}

impl IntoIndexes for FollowDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        unique_pair_index("followerId", "followingId", "follows")
    }
}

impl MutMetadata for FollowDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

impl RelationSchema for FollowDoc {
    const KIND: RelationKind = RelationKind::Follow;

    fn from_row(row: RelationRow) -> Self {
        Self {
            id: None,
            metadata: Metadata::new(),
            follower_id: row.actor_id,
            following_id: row.target_id,
        }
    }

    fn into_row(self) -> RelationRow {
        RelationRow::new(self.follower_id, self.following_id)
    }
}

/// `votes` document
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct VoteDoc {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub voter_id: String,

    pub target_id: String,

    #[serde(default)]
    pub vote: VoteKind,
}

impl IntoIndexes for VoteDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        unique_pair_index("voterId", "targetId", "votes")
    }
}

impl MutMetadata for VoteDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

impl RelationSchema for VoteDoc {
    const KIND: RelationKind = RelationKind::Vote;

    fn from_row(row: RelationRow) -> Self {
        Self {
            id: None,
            metadata: Metadata::new(),
            voter_id: row.actor_id,
            target_id: row.target_id,
            vote: row.vote.unwrap_or_default(),
        }
    }

    fn into_row(self) -> RelationRow {
        RelationRow::vote(self.voter_id, self.target_id, self.vote)
    }
}

/// `saves` document
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SaveDoc {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub user_id: String,

    pub target_id: String,
}

impl IntoIndexes for SaveDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        unique_pair_index("userId", "targetId", "saves")
    }
}

impl MutMetadata for SaveDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

impl RelationSchema for SaveDoc {
    const KIND: RelationKind = RelationKind::Save;

    fn from_row(row: RelationRow) -> Self {
        Self {
            id: None,
            metadata: Metadata::new(),
            user_id: row.actor_id,
            target_id: row.target_id,
        }
    }

    fn into_row(self) -> RelationRow {
        RelationRow::new(self.user_id, self.target_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_names_match_relation_kind() {
        for (kind, indices) in [
            (FollowDoc::KIND, FollowDoc::into_indices()),
            (VoteDoc::KIND, VoteDoc::into_indices()),
            (SaveDoc::KIND, SaveDoc::into_indices()),
        ] {
            let keys: Vec<&String> = indices[0].0.keys().collect();
            assert_eq!(keys, vec![kind.actor_field(), kind.target_field()]);
            assert_eq!(indices[0].1.as_ref().unwrap().unique, Some(true));
        }
    }

    #[test]
    fn test_vote_doc_serializes_camel_case() {
        let doc = VoteDoc::from_row(RelationRow::vote("a", "p", VoteKind::Down));
        let bson = bson::to_document(&doc).unwrap();
        assert_eq!(bson.get_str("voterId").unwrap(), "a");
        assert_eq!(bson.get_str("vote").unwrap(), "down");
        assert!(!bson.contains_key("_id"));
        assert_eq!(doc.into_row().vote, Some(VoteKind::Down));
    }
}
