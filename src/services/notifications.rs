//! Notification read/delete batching

use crate::buffer::{BufferStats, MutationDispatcher, MutationRecord};
use crate::store::{NotificationChange, NOTIFICATIONS};
use crate::types::Result;

/// Buffers read and delete requests keyed by notification id
#[derive(Clone)]
pub struct NotificationBuffer {
    dispatcher: MutationDispatcher<NotificationChange>,
}

impl NotificationBuffer {
    pub fn new(dispatcher: MutationDispatcher<NotificationChange>) -> Self {
        Self { dispatcher }
    }

    pub fn mark_read(&self, user_id: &str, notification_id: &str) {
        self.dispatcher
            .enqueue(MutationRecord::update(NOTIFICATIONS, notification_id, change(user_id, notification_id)));
    }

    pub fn delete(&self, user_id: &str, notification_id: &str) {
        self.dispatcher
            .enqueue(MutationRecord::delete(NOTIFICATIONS, notification_id, change(user_id, notification_id)));
    }

    pub async fn flush(&self) -> Result<()> {
        self.dispatcher.flush().await
    }

    pub fn pending_len(&self) -> usize {
        self.dispatcher.pending_len()
    }

    pub fn stats(&self) -> BufferStats {
        self.dispatcher.stats()
    }

    pub(crate) fn dispatcher(&self) -> &MutationDispatcher<NotificationChange> {
        &self.dispatcher
    }
}

fn change(user_id: &str, notification_id: &str) -> NotificationChange {
    NotificationChange {
        notification_id: notification_id.to_string(),
        user_id: user_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferConfig;
    use crate::handlers::activity::notification_handlers;
    use crate::logging::TracingSink;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_read_and_delete_flush_as_two_groups() {
        let store = Arc::new(MemoryStore::new());
        for id in ["n1", "n2", "n3"] {
            store.seed_notification(id, "alice");
        }
        let buffer = NotificationBuffer::new(MutationDispatcher::new(
            BufferConfig::for_notifications(),
            notification_handlers(Arc::clone(&store)),
            Arc::new(TracingSink::new(false)),
        ));

        buffer.mark_read("alice", "n1");
        buffer.mark_read("alice", "n1");
        buffer.mark_read("alice", "n2");
        buffer.delete("alice", "n3");
        assert_eq!(buffer.pending_len(), 3);

        buffer.flush().await.unwrap();
        assert_eq!(store.notification_read("n1"), Some(true));
        assert_eq!(store.notification_read("n2"), Some(true));
        assert_eq!(store.notification_read("n3"), None);
        assert_eq!(buffer.stats().deduplicated, 1);
    }
}
