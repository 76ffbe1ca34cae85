//! Write Coalescer - buffer async actions, run the survivors on flush
//!
//! Each intent carries a dedup id. Re-enqueueing the same id before a flush
//! replaces the earlier action, so a burst of redundant requests on one
//! logical entity only pays for the final one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{join_all, BoxFuture, FutureExt};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use super::{BufferConfig, BufferStats, ClaimedBatch, FlushSummary, FlushTrigger, OperationBuffer, SharedSink};
use crate::logging::FlushSink;
use crate::types::{BatchError, FlushFailure, Result};

/// Deferred action run at flush time
pub type IntentAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A buffered "run this async action" request
pub struct WriteIntent {
    pub dedup_id: String,
    pub action: IntentAction,
}

impl WriteIntent {
    /// Create an intent. Without a dedup id the intent gets a fresh UUID and
    /// is never collapsed with another.
    pub fn new<F, Fut>(dedup_id: Option<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            dedup_id: dedup_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            action: Box::new(move || action().boxed()),
        }
    }

    /// Create an intent that collapses with others under `dedup_id`
    pub fn keyed<F, Fut>(dedup_id: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::new(Some(dedup_id.into()), action)
    }
}

impl std::fmt::Debug for WriteIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteIntent")
            .field("dedup_id", &self.dedup_id)
            .finish_non_exhaustive()
    }
}

struct CoalescerInner {
    buffer: OperationBuffer<String, WriteIntent>,
    sink: SharedSink,
}

/// Buffers write intents and runs them concurrently on flush.
///
/// Cloning is cheap and shares the buffer. `enqueue` must be called from
/// within a Tokio runtime.
#[derive(Clone)]
pub struct WriteCoalescer {
    inner: Arc<CoalescerInner>,
}

impl WriteCoalescer {
    pub fn new(config: BufferConfig, sink: Arc<dyn FlushSink>) -> Self {
        debug!(
            buffer = %config.name,
            flush_delay_ms = config.flush_delay.as_millis() as u64,
            max_size = config.max_size,
            "WriteCoalescer initialized"
        );
        Self {
            inner: Arc::new(CoalescerInner {
                buffer: OperationBuffer::new(config),
                sink,
            }),
        }
    }

    /// Buffer an intent, replacing any pending intent with the same dedup id.
    ///
    /// Returns immediately. Reaching `max_size` flushes on a spawned task.
    pub fn enqueue(&self, intent: WriteIntent) {
        let key = intent.dedup_id.clone();
        let timer_inner = Arc::clone(&self.inner);
        let full = self
            .inner
            .buffer
            .insert(key, intent, move |id| spawn_timer(timer_inner, id));

        if let Some(batch) = full {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run_detached(batch, FlushTrigger::Threshold).await });
        }
    }

    /// Flush now and wait for every action to settle, then wait for any
    /// timer or threshold flush that was already running.
    ///
    /// With `FailureMode::Propagate` a flush with failures returns one
    /// `BatchError::Aggregate` naming each failed dedup id of the manual batch.
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
}

fn spawn_timer(inner: Arc<CoalescerInner>, id: u64) -> JoinHandle<()> {
    let delay = inner.buffer.config().flush_delay;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(batch) = inner.buffer.take_fired(id) else {
            return;
        };
        inner.run_detached(batch, FlushTrigger::Timer).await;
    })
}

impl CoalescerInner {
    async fn run_detached(&self, batch: ClaimedBatch<String, WriteIntent>, trigger: FlushTrigger) {
        let ClaimedBatch { entries, guard } = batch;
        if let Err(e) = self.run(entries, trigger).await {
            // Nobody awaits a detached flush; this log is the only trace
            error!(buffer = %self.buffer.name(), error = %e, "Unobserved coalescer flush failure");
        }
        drop(guard);
    }

    async fn run(&self, batch: HashMap<String, WriteIntent>, trigger: FlushTrigger) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let records = batch.len();
        debug!(buffer = %self.buffer.name(), records, %trigger, "Flushing coalesced intents");

        // One task per action so a panicking action settles as a failure
        let (ids, tasks): (Vec<String>, Vec<_>) = batch
            .into_values()
            .map(|WriteIntent { dedup_id, action }| (dedup_id, tokio::spawn(action())))
            .unzip();
        let outcomes = join_all(tasks).await;

        let failures: Vec<FlushFailure> = ids
            .into_iter()
            .zip(outcomes)
            .filter_map(|(dedup_id, outcome)| match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(FlushFailure::new(dedup_id, 1, &e)),
                Err(join_error) => Some(FlushFailure::new(
                    dedup_id,
                    1,
                    &BatchError::Internal(format!("action aborted: {}", join_error)),
                )),
            })
            .collect();

        let summary = FlushSummary {
            trigger,
            records,
            groups: records,
            rows: (records - failures.len()) as u64,
            failures,
            started,
        };
        self.buffer.complete(summary, self.sink.as_ref())
    }
}
