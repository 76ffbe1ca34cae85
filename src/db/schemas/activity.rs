//! Notification and access-log documents

use bson::{doc, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::store::AccessLogEntry;

pub const NOTIFICATION_COLLECTION: &str = "notifications";
pub const ACCESS_LOG_COLLECTION: &str = "access_logs";

/// `notifications` document. Created elsewhere; this crate only marks
/// read and deletes.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDoc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub user_id: String,

    #[serde(default)]
    pub read: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime>,
}

impl IntoIndexes for NotificationDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "userId": 1, "read": 1 },
            Some(
                IndexOptions::builder()
                    .name("user_read_index".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for NotificationDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// `access_logs` document
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogDoc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub method: String,

    pub path: String,

    pub status: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,

    pub latency_ms: i64,

    pub at: DateTime,
}

impl Default for AccessLogDoc {
    fn default() -> Self {
        Self {
            id: String::new(),
            metadata: Metadata::default(),
            method: String::new(),
            path: String::new(),
            status: 0,
            actor_id: None,
            latency_ms: 0,
            at: DateTime::now(),
        }
    }
}

impl From<AccessLogEntry> for AccessLogDoc {
    fn from(entry: AccessLogEntry) -> Self {
        Self {
            id: entry.id,
            metadata: Metadata::new(),
            method: entry.method,
            path: entry.path,
            status: i32::from(entry.status),
            actor_id: entry.actor_id,
            latency_ms: i64::try_from(entry.latency_ms).unwrap_or(i64::MAX),
            at: DateTime::from_chrono(entry.at),
        }
    }
}

impl IntoIndexes for AccessLogDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "at": -1 },
                Some(IndexOptions::builder().name("at_index".to_string()).build()),
            ),
            (
                doc! { "path": 1, "status": 1 },
                Some(
                    IndexOptions::builder()
                        .name("path_status_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for AccessLogDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_log_doc_from_entry() {
        let entry = AccessLogEntry::new("POST", "/votes", 201, 7).with_actor("u1");
        let id = entry.id.clone();
        let doc = AccessLogDoc::from(entry);

        let bson = bson::to_document(&doc).unwrap();
        assert_eq!(bson.get_str("_id").unwrap(), id);
        assert_eq!(bson.get_i32("status").unwrap(), 201);
        assert_eq!(bson.get_i64("latencyMs").unwrap(), 7);
        assert!(bson.get_datetime("at").is_ok());
    }
}
