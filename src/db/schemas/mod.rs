//! MongoDB document schemas
//!
//! Relation collections (follows, votes, saves) and activity collections
//! (notifications, access logs). Counter documents in `users` and `posts`
//! are patched in place and have no schema here.

mod activity;
mod metadata;
mod relation;

pub use activity::{AccessLogDoc, NotificationDoc, ACCESS_LOG_COLLECTION, NOTIFICATION_COLLECTION};
pub use metadata::Metadata;
pub use relation::{FollowDoc, RelationSchema, SaveDoc, VoteDoc};
