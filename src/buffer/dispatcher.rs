//! Batched Mutation Dispatcher - group typed payloads, one handler per group
//!
//! Records are keyed by `(kind, collection, dedup_id)`. On flush the dedup
//! ids are dropped, records are grouped by `(kind, collection)` and every
//! group goes to its registered handler in a single call. Groups run
//! concurrently and settle independently.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{BufferConfig, BufferStats, ClaimedBatch, FlushSummary, FlushTrigger, OperationBuffer, SharedSink};
use crate::handlers::{HandlerReport, HandlerTable, OperationKind};
use crate::logging::FlushSink;
use crate::types::{BatchError, FlushFailure, Result};

/// Buffer key of a mutation record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub kind: OperationKind,
    pub collection: String,
    pub dedup_id: String,
}

/// A buffered mutation request
#[derive(Debug, Clone)]
pub struct MutationRecord<P> {
    pub dedup_id: String,
    pub kind: OperationKind,
    pub collection: String,
    pub payload: P,
}

impl<P> MutationRecord<P> {
    /// Without a dedup id the record gets a fresh UUID and never collapses
    pub fn new(kind: OperationKind, collection: impl Into<String>, dedup_id: Option<String>, payload: P) -> Self {
        Self {
            dedup_id: dedup_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            kind,
            collection: collection.into(),
            payload,
        }
    }

    pub fn create(collection: impl Into<String>, dedup_id: impl Into<String>, payload: P) -> Self {
        Self::new(OperationKind::Create, collection, Some(dedup_id.into()), payload)
    }

    pub fn update(collection: impl Into<String>, dedup_id: impl Into<String>, payload: P) -> Self {
        Self::new(OperationKind::Update, collection, Some(dedup_id.into()), payload)
    }

    pub fn delete(collection: impl Into<String>, dedup_id: impl Into<String>, payload: P) -> Self {
        Self::new(OperationKind::Delete, collection, Some(dedup_id.into()), payload)
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            kind: self.kind,
            collection: self.collection.clone(),
            dedup_id: self.dedup_id.clone(),
        }
    }
}

/// A record still waiting for flush, as seen by [`MutationDispatcher::reconcile`]
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecord<P> {
    pub kind: OperationKind,
    pub payload: P,
}

/// Buffered payload plus its arrival order
struct Slot<P> {
    seq: u64,
    payload: P,
}

struct DispatcherInner<P: Send + 'static> {
    buffer: OperationBuffer<RecordKey, Slot<P>>,
    handlers: HandlerTable<P>,
    sink: SharedSink,
    seq: AtomicU64,
}

/// Buffers mutation records and dispatches them in grouped bulk calls.
///
/// Cloning is cheap and shares the buffer. `enqueue` and `reconcile` must be
/// called from within a Tokio runtime.
pub struct MutationDispatcher<P: Send + 'static> {
    inner: Arc<DispatcherInner<P>>,
}

impl<P: Send + 'static> Clone for MutationDispatcher<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> MutationDispatcher<P>
where
    P: Send + 'static,
{
    pub fn new(config: BufferConfig, handlers: HandlerTable<P>, sink: Arc<dyn FlushSink>) -> Self {
        debug!(
            buffer = %config.name,
            flush_delay_ms = config.flush_delay.as_millis() as u64,
            max_size = config.max_size,
            routes = handlers.len(),
            "MutationDispatcher initialized"
        );
        Self {
            inner: Arc::new(DispatcherInner {
                buffer: OperationBuffer::new(config),
                handlers,
                sink,
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Buffer a record, replacing any pending record with the same
    /// `(kind, collection, dedup_id)`. Returns immediately.
    pub fn enqueue(&self, record: MutationRecord<P>) {
        let key = record.key();
        let slot = self.inner.slot(record.payload);
        let timer_inner = Arc::clone(&self.inner);
        let full = self
            .inner
            .buffer
            .insert(key, slot, move |id| spawn_timer(timer_inner, id));
        self.spawn_threshold(full);
    }

    /// Atomically replace whatever is pending for `(collection, dedup_id)`,
    /// of any kind.
    ///
    /// `f` receives the most recent pending record (if any) and returns the
    /// record to leave in the buffer, or `None` to leave nothing, plus a
    /// value handed back to the caller. `f` runs under the buffer lock and
    /// must not block.
    pub fn reconcile<R, F>(&self, collection: &str, dedup_id: &str, f: F) -> R
    where
        F: FnOnce(Option<PendingRecord<P>>) -> (Option<PendingRecord<P>>, R),
    {
        let timer_inner = Arc::clone(&self.inner);
        let inner = &self.inner;
        let ((result, stored, replaced), full) = inner.buffer.mutate(
            |entries| {
                let mut latest: Option<(OperationKind, Slot<P>)> = None;
                for kind in OperationKind::ALL {
                    let key = RecordKey {
                        kind,
                        collection: collection.to_string(),
                        dedup_id: dedup_id.to_string(),
                    };
                    if let Some(slot) = entries.remove(&key) {
                        if latest.as_ref().map_or(true, |(_, l)| slot.seq > l.seq) {
                            latest = Some((kind, slot));
                        }
                    }
                }
                let replaced = latest.is_some();
                let current = latest.map(|(kind, slot)| PendingRecord {
                    kind,
                    payload: slot.payload,
                });

                let (next, result) = f(current);
                let stored = next.is_some();
                if let Some(PendingRecord { kind, payload }) = next {
                    let key = RecordKey {
                        kind,
                        collection: collection.to_string(),
                        dedup_id: dedup_id.to_string(),
                    };
                    entries.insert(key, inner.slot(payload));
                }
                (result, stored, replaced)
            },
            move |id| spawn_timer(timer_inner, id),
        );

        if stored {
            inner.buffer.note_enqueue(replaced);
        }
        self.spawn_threshold(full);
        result
    }

    /// Copy of the most recent pending record for `(collection, dedup_id)`
    pub fn pending(&self, collection: &str, dedup_id: &str) -> Option<PendingRecord<P>>
    where
        P: Clone,
    {
        self.inner.buffer.peek(|entries| {
            OperationKind::ALL
                .into_iter()
                .filter_map(|kind| {
                    let key = RecordKey {
                        kind,
                        collection: collection.to_string(),
                        dedup_id: dedup_id.to_string(),
                    };
                    entries.get(&key).map(|slot| {
                        (
                            slot.seq,
                            PendingRecord {
                                kind,
                                payload: slot.payload.clone(),
                            },
                        )
                    })
                })
                .max_by_key(|(seq, _)| *seq)
                .map(|(_, record)| record)
        })
    }

    /// Flush now and wait for every group to settle, including groups of a
    /// timer or threshold flush that was already running.
    ///
    /// Under `FailureMode::LogOnly` this returns `Ok` even when groups fail;
    /// the failures are visible in the flush sink and in [`stats`](Self::stats).
    /// The result covers the manual batch only.
    pub async fn flush(&self) -> Result<()> {
        let batch = self.inner.buffer.take();
        let result = self.inner.run(batch, FlushTrigger::Manual).await;
        self.inner.buffer.wait_idle().await;
        result
    }

    pub fn name(&self) -> &str {
        self.inner.buffer.name()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.buffer.len()
    }

    /// Timer or threshold flushes still running
    pub fn in_flight(&self) -> usize {
        self.inner.buffer.in_flight()
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.buffer.stats()
    }

    fn spawn_threshold(&self, full: Option<ClaimedBatch<RecordKey, Slot<P>>>) {
        let Some(batch) = full else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_detached(batch, FlushTrigger::Threshold).await });
    }
}

fn spawn_timer<P: Send + 'static>(inner: Arc<DispatcherInner<P>>, id: u64) -> JoinHandle<()> {
    let delay = inner.buffer.config().flush_delay;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(batch) = inner.buffer.take_fired(id) else {
            return;
        };
        inner.run_detached(batch, FlushTrigger::Timer).await;
    })
}

impl<P: Send + 'static> DispatcherInner<P> {
    /// Run a claimed batch, releasing its guard only once every group settled
    async fn run_detached(&self, batch: ClaimedBatch<RecordKey, Slot<P>>, trigger: FlushTrigger) {
        let ClaimedBatch { entries, guard } = batch;
        if let Err(e) = self.run(entries, trigger).await {
            error!(buffer = %self.buffer.name(), error = %e, "Unobserved dispatcher flush failure");
        }
        drop(guard);
    }

    fn slot(&self, payload: P) -> Slot<P> {
        Slot {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            payload,
        }
    }

    async fn run(&self, batch: HashMap<RecordKey, Slot<P>>, trigger: FlushTrigger) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let records = batch.len();

        let mut groups: BTreeMap<(OperationKind, String), Vec<Slot<P>>> = BTreeMap::new();
        for (key, slot) in batch {
            groups.entry((key.kind, key.collection)).or_default().push(slot);
        }
        let group_count = groups.len();
        debug!(buffer = %self.buffer.name(), records, groups = group_count, %trigger, "Dispatching grouped mutations");

        let mut failures = Vec::new();
        let mut labels = Vec::with_capacity(group_count);
        let mut tasks = Vec::with_capacity(group_count);

        for ((kind, collection), mut slots) in groups {
            let label = format!("{}:{}", kind, collection);
            slots.sort_by_key(|slot| slot.seq);
            let size = slots.len();

            let Some(handler) = self.handlers.get(&collection, kind) else {
                let cause = BatchError::HandlerNotFound { collection, kind };
                warn!(buffer = %self.buffer.name(), group = %label, "{}", cause);
                failures.push(FlushFailure::new(label, size, &cause));
                continue;
            };

            let payloads: Vec<P> = slots.into_iter().map(|slot| slot.payload).collect();
            labels.push((label, size));
            // One task per group so a panicking handler settles as a failure
            tasks.push(tokio::spawn(async move { handler.handle(payloads).await }));
        }

        let outcomes = join_all(tasks).await;
        let mut rows = 0u64;
        for ((label, size), outcome) in labels.into_iter().zip(outcomes) {
            match outcome {
                Ok(Ok(HandlerReport { rows: written, .. })) => rows += written,
                Ok(Err(e)) => failures.push(FlushFailure::new(label, size, &e)),
                Err(join_error) => failures.push(FlushFailure::new(
                    label,
                    size,
                    &BatchError::Internal(format!("handler aborted: {}", join_error)),
                )),
            }
        }

        let summary = FlushSummary {
            trigger,
            records,
            groups: group_count,
            rows,
            failures,
            started,
        };
        self.buffer.complete(summary, self.sink.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FailureMode;
    use crate::logging::TracingSink;
    use std::time::Duration;
    use tokio::sync::Mutex;

    type Calls = Arc<Mutex<Vec<(String, Vec<u32>)>>>;

    fn recording_table(calls: &Calls, routes: &[(&str, OperationKind)]) -> HandlerTable<u32> {
        let mut table = HandlerTable::new();
        for (collection, kind) in routes {
            let calls = Arc::clone(calls);
            let label = format!("{}:{}", kind, collection);
            table.register_fn(*collection, *kind, move |payloads: Vec<u32>| {
                let calls = Arc::clone(&calls);
                let label = label.clone();
                async move {
                    let rows = payloads.len() as u64;
                    calls.lock().await.push((label, payloads));
                    Ok(HandlerReport { rows, counter_updates: 0 })
                }
            });
        }
        table
    }

    fn dispatcher(table: HandlerTable<u32>, delay_ms: u64, max_size: usize) -> MutationDispatcher<u32> {
        MutationDispatcher::new(
            BufferConfig::dispatcher("test", Duration::from_millis(delay_ms), max_size),
            table,
            Arc::new(TracingSink::new(true)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_flush_after_delay_sees_every_payload_once() {
        let calls: Calls = Arc::default();
        let d = dispatcher(recording_table(&calls, &[("votes", OperationKind::Create)]), 200, 10);

        for i in 0..4 {
            d.enqueue(MutationRecord::create("votes", format!("a{}-p", i), i));
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(calls.lock().await.is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = calls.lock().await.clone();
        assert_eq!(seen.len(), 1);
        let mut payloads = seen[0].1.clone();
        payloads.sort();
        assert_eq!(payloads, vec![0, 1, 2, 3]);
        assert_eq!(d.stats().flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_flushes_before_delay() {
        let calls: Calls = Arc::default();
        let d = dispatcher(recording_table(&calls, &[("votes", OperationKind::Create)]), 10_000, 3);

        for i in 0..3 {
            d.enqueue(MutationRecord::create("votes", format!("k{}", i), i));
        }
        assert_eq!(d.pending_len(), 0);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_waits_for_running_threshold_flush() {
        let calls: Calls = Arc::default();
        let mut table: HandlerTable<u32> = HandlerTable::new();
        let slow_calls = Arc::clone(&calls);
        table.register_fn("votes", OperationKind::Create, move |payloads: Vec<u32>| {
            let calls = Arc::clone(&slow_calls);
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let rows = payloads.len() as u64;
                calls.lock().await.push(("create:votes".to_string(), payloads));
                Ok(HandlerReport { rows, counter_updates: 0 })
            }
        });
        let d = dispatcher(table, 60_000, 2);

        d.enqueue(MutationRecord::create("votes", "a-p", 1));
        d.enqueue(MutationRecord::create("votes", "b-p", 2));
        assert_eq!(d.pending_len(), 0);
        assert_eq!(d.in_flight(), 1);

        tokio_test::assert_ok!(d.flush().await);
        assert_eq!(calls.lock().await.len(), 1);
        assert_eq!(d.in_flight(), 0);
        assert_eq!(d.stats().flushed_records, 2);
    }

    #[tokio::test]
    async fn test_same_key_keeps_last_payload() {
        let calls: Calls = Arc::default();
        let d = dispatcher(recording_table(&calls, &[("votes", OperationKind::Create)]), 1000, 10);

        d.enqueue(MutationRecord::create("votes", "a-p", 1));
        d.enqueue(MutationRecord::create("votes", "a-p", 2));
        d.flush().await.unwrap();

        assert_eq!(*calls.lock().await, vec![("create:votes".to_string(), vec![2])]);
        assert_eq!(d.stats().deduplicated, 1);
    }

    #[tokio::test]
    async fn test_groups_by_kind_and_collection() {
        let calls: Calls = Arc::default();
        let routes = [
            ("votes", OperationKind::Create),
            ("votes", OperationKind::Delete),
            ("saves", OperationKind::Create),
        ];
        let d = dispatcher(recording_table(&calls, &routes), 1000, 100);

        d.enqueue(MutationRecord::create("votes", "a", 1));
        d.enqueue(MutationRecord::create("votes", "b", 2));
        d.enqueue(MutationRecord::delete("votes", "c", 3));
        d.enqueue(MutationRecord::create("saves", "a", 4));
        d.flush().await.unwrap();

        let mut seen = calls.lock().await.clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("create:saves".to_string(), vec![4]),
                ("create:votes".to_string(), vec![1, 2]),
                ("delete:votes".to_string(), vec![3]),
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_group_does_not_block_others() {
        let calls: Calls = Arc::default();
        let mut table = recording_table(&calls, &[("votes", OperationKind::Create)]);
        table.register_fn("follows", OperationKind::Create, |_: Vec<u32>| async {
            Err(BatchError::Storage("follows offline".into()))
        });
        let d = dispatcher(table, 1000, 100);

        d.enqueue(MutationRecord::create("follows", "a-b", 1));
        d.enqueue(MutationRecord::create("votes", "a-p", 2));

        tokio_test::assert_ok!(d.flush().await);
        assert_eq!(*calls.lock().await, vec![("create:votes".to_string(), vec![2])]);
        assert_eq!(d.stats().failed_records, 1);
    }

    #[tokio::test]
    async fn test_missing_handler_is_a_group_failure() {
        let calls: Calls = Arc::default();
        let d = MutationDispatcher::new(
            BufferConfig::dispatcher("strict", Duration::from_secs(1), 10)
                .with_failure_mode(FailureMode::Propagate),
            recording_table(&calls, &[("votes", OperationKind::Create)]),
            Arc::new(TracingSink::new(false)),
        );

        d.enqueue(MutationRecord::update("votes", "a-p", 7));
        d.enqueue(MutationRecord::create("votes", "b-p", 8));

        let err = d.flush().await.unwrap_err();
        let failures = err.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, "update:votes");
        assert!(failures[0].message.contains("No handler registered"));
        assert_eq!(calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_replaces_any_kind() {
        let calls: Calls = Arc::default();
        let d = dispatcher(recording_table(&calls, &[]), 1000, 100);

        d.enqueue(MutationRecord::create("votes", "a-p", 1));
        let seen = d.reconcile("votes", "a-p", |current| {
            let kind = current.as_ref().map(|c| c.kind);
            (
                Some(PendingRecord {
                    kind: OperationKind::Update,
                    payload: 2,
                }),
                kind,
            )
        });
        assert_eq!(seen, Some(OperationKind::Create));
        assert_eq!(d.pending_len(), 1);
        assert_eq!(
            d.pending("votes", "a-p"),
            Some(PendingRecord {
                kind: OperationKind::Update,
                payload: 2
            })
        );

        d.reconcile("votes", "a-p", |_| (None, ()));
        assert_eq!(d.pending_len(), 0);
        assert!(d.pending("votes", "a-p").is_none());
    }

    #[tokio::test]
    async fn test_panicking_handler_settles_as_failure() {
        let mut table: HandlerTable<u32> = HandlerTable::new();
        table.register_fn("votes", OperationKind::Create, |_: Vec<u32>| async {
            if true {
                panic!("handler bug");
            }
            Ok(HandlerReport::default())
        });
        let d = dispatcher(table, 1000, 10);

        d.enqueue(MutationRecord::create("votes", "a-p", 1));
        tokio_test::assert_ok!(d.flush().await);
        assert_eq!(d.stats().failed_records, 1);
    }
}
