//! View tracking on a write coalescer
//!
//! Repeated views of one post by one viewer inside a flush window count
//! once.

use std::sync::Arc;

use crate::buffer::{BufferStats, WriteCoalescer, WriteIntent};
use crate::store::{CounterDelta, Store, POSTS, VIEWS_COUNT};
use crate::types::Result;

/// Buffers `+1 viewsCount` per `(viewer, post)`
#[derive(Clone)]
pub struct ViewTracker {
    coalescer: WriteCoalescer,
    store: Arc<dyn Store>,
}

impl ViewTracker {
    pub fn new(coalescer: WriteCoalescer, store: Arc<dyn Store>) -> Self {
        Self { coalescer, store }
    }

    pub fn dedup_key(viewer_id: &str, post_id: &str) -> String {
        format!("view-{}-{}", viewer_id, post_id)
    }

    /// Record a view. Returns at once; the counter moves on flush.
    pub fn track(&self, viewer_id: &str, post_id: &str) {
        let store = Arc::clone(&self.store);
        let delta = CounterDelta {
            entity_id: post_id.to_string(),
            field: VIEWS_COUNT.to_string(),
            delta: 1,
        };
        self.coalescer
            .enqueue(WriteIntent::keyed(Self::dedup_key(viewer_id, post_id), move || async move {
                store.adjust_counters(POSTS, vec![delta]).await.map(|_| ())
            }));
    }

    pub async fn flush(&self) -> Result<()> {
        self.coalescer.flush().await
    }

    pub fn pending_len(&self) -> usize {
        self.coalescer.pending_len()
    }

    pub fn stats(&self) -> BufferStats {
        self.coalescer.stats()
    }

    pub(crate) fn coalescer(&self) -> &WriteCoalescer {
        &self.coalescer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferConfig;
    use crate::logging::TracingSink;
    use crate::store::{MemoryStore, RelationStore};

    #[tokio::test]
    async fn test_repeat_views_count_once_per_window() {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn Store> = memory.clone();
        let tracker = ViewTracker::new(
            WriteCoalescer::new(BufferConfig::for_views(), Arc::new(TracingSink::new(false))),
            store,
        );

        tracker.track("alice", "p1");
        tracker.track("alice", "p1");
        tracker.track("bob", "p1");
        assert_eq!(tracker.pending_len(), 2);

        tracker.flush().await.unwrap();
        assert_eq!(memory.counter(POSTS, "p1", VIEWS_COUNT).await.unwrap(), 2);

        tracker.track("alice", "p1");
        tracker.flush().await.unwrap();
        assert_eq!(memory.counter(POSTS, "p1", VIEWS_COUNT).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_view_write_is_reported() {
        let memory = Arc::new(MemoryStore::new());
        memory.set_offline(POSTS, true);
        let tracker = ViewTracker::new(
            WriteCoalescer::new(BufferConfig::for_views(), Arc::new(TracingSink::new(false))),
            memory,
        );

        tracker.track("alice", "p1");
        let err = tracker.flush().await.unwrap_err();
        assert_eq!(err.failures()[0].key, "view-alice-p1");
    }
}
