//! Activity handlers: notification read/delete and access-log ingestion

use std::sync::Arc;

use super::{HandlerReport, HandlerTable, MutationHandler, OperationKind};
use crate::store::{AccessLogEntry, ActivityStore, NotificationChange, ACCESS_LOGS, NOTIFICATIONS};
use crate::types::{BatchError, Result};

/// Marks (update) or deletes (delete) a group of notifications
pub struct NotificationHandler<S: ?Sized> {
    op: OperationKind,
    store: Arc<S>,
}

#[async_trait::async_trait]
impl<S> MutationHandler<NotificationChange> for NotificationHandler<S>
where
    S: ActivityStore + ?Sized + 'static,
{
    async fn handle(&self, changes: Vec<NotificationChange>) -> Result<HandlerReport> {
        let rows = match self.op {
            OperationKind::Update => self.store.mark_notifications_read(changes).await?,
            OperationKind::Delete => self.store.delete_notifications(changes).await?,
            OperationKind::Create => {
                return Err(BatchError::Internal(
                    "notifications cannot be created through the batch layer".to_string(),
                ))
            }
        };
        Ok(HandlerReport { rows, counter_updates: 0 })
    }
}

pub fn notification_handlers<S>(store: Arc<S>) -> HandlerTable<NotificationChange>
where
    S: ActivityStore + ?Sized + 'static,
{
    HandlerTable::new()
        .with(
            NOTIFICATIONS,
            OperationKind::Update,
            NotificationHandler {
                op: OperationKind::Update,
                store: Arc::clone(&store),
            },
        )
        .with(
            NOTIFICATIONS,
            OperationKind::Delete,
            NotificationHandler {
                op: OperationKind::Delete,
                store,
            },
        )
}

/// Appends a group of access-log entries
pub struct AccessLogHandler<S: ?Sized> {
    store: Arc<S>,
}

#[async_trait::async_trait]
impl<S> MutationHandler<AccessLogEntry> for AccessLogHandler<S>
where
    S: ActivityStore + ?Sized + 'static,
{
    async fn handle(&self, entries: Vec<AccessLogEntry>) -> Result<HandlerReport> {
        let rows = self.store.insert_access_logs(entries).await?;
        Ok(HandlerReport { rows, counter_updates: 0 })
    }
}

pub fn access_log_handlers<S>(store: Arc<S>) -> HandlerTable<AccessLogEntry>
where
    S: ActivityStore + ?Sized + 'static,
{
    HandlerTable::new().with(ACCESS_LOGS, OperationKind::Create, AccessLogHandler { store })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_notification_routes() {
        let store = Arc::new(MemoryStore::new());
        store.seed_notification("n1", "alice");
        store.seed_notification("n2", "alice");
        let table = notification_handlers(Arc::clone(&store));

        let change = |id: &str| NotificationChange {
            notification_id: id.into(),
            user_id: "alice".into(),
        };

        let read = table.get(NOTIFICATIONS, OperationKind::Update).unwrap();
        assert_eq!(read.handle(vec![change("n1")]).await.unwrap().rows, 1);
        assert_eq!(store.notification_read("n1"), Some(true));

        let delete = table.get(NOTIFICATIONS, OperationKind::Delete).unwrap();
        assert_eq!(delete.handle(vec![change("n2")]).await.unwrap().rows, 1);
        assert_eq!(store.notification_read("n2"), None);
    }

    #[tokio::test]
    async fn test_notification_create_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.seed_notification("n1", "alice");
        let handler = NotificationHandler {
            op: OperationKind::Create,
            store: Arc::clone(&store),
        };

        let err = handler
            .handle(vec![NotificationChange {
                notification_id: "n1".into(),
                user_id: "alice".into(),
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Internal(_)));
        assert_eq!(store.notification_read("n1"), Some(false));
    }

    #[tokio::test]
    async fn test_access_logs_insert_in_one_call() {
        let store = Arc::new(MemoryStore::new());
        let table = access_log_handlers(Arc::clone(&store));

        let handler = table.get(ACCESS_LOGS, OperationKind::Create).unwrap();
        let entries = (0..3)
            .map(|i| AccessLogEntry::new("GET", format!("/posts/{}", i), 200, 5))
            .collect();
        let report = handler.handle(entries).await.unwrap();

        assert_eq!(report.rows, 3);
        assert_eq!(store.access_log_count(), 3);
    }
}
