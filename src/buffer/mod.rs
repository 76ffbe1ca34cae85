//! Operation buffers - coalesce bursts of writes into bulk flushes
//!
//! Both primitives share one data structure, [`OperationBuffer`]: a map keyed
//! by a dedup key, a size threshold, a flush delay and a pending timer.
//!
//! - [`WriteCoalescer`] buffers async actions and runs them all on flush.
//! - [`MutationDispatcher`] buffers typed payloads tagged with
//!   `(OperationKind, collection)` and hands each group to one handler.
//!
//! ## Flush triggers
//!
//! 1. **Timer** - first enqueue into an idle buffer arms a `flush_delay` timer.
//!    Later enqueues do not push it back.
//! 2. **Threshold** - an enqueue that brings the buffer to `max_size` swaps the
//!    buffer out immediately and flushes on a spawned task.
//! 3. **Manual** - `flush()`, used at shutdown.
//!
//! Timer and threshold flushes run detached, but each one holds a
//! [`FlushGuard`] while it runs. `flush()` drains the buffer and then waits
//! for every guarded flush to finish, so a returned `flush()` means nothing
//! accepted before it is still in memory.
//!
//! Buffered state lives only in memory. A crash loses at most the entries of
//! the current `flush_delay` window.

mod coalescer;
mod dispatcher;

pub use coalescer::{IntentAction, WriteCoalescer, WriteIntent};
pub use dispatcher::{MutationDispatcher, MutationRecord, PendingRecord, RecordKey};

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::logging::{FlushEvent, FlushSink};
use crate::types::{BatchError, FlushFailure, Result};

// =============================================================================
// Configuration
// =============================================================================

/// What a flush does with failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// `flush()` returns one aggregate error naming every failure
    Propagate,
    /// Failures only reach the flush sink; `flush()` returns `Ok`
    LogOnly,
}

impl std::str::FromStr for FailureMode {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "propagate" => Ok(Self::Propagate),
            "log_only" | "log-only" | "logonly" => Ok(Self::LogOnly),
            other => Err(BatchError::Config(format!("unknown failure mode '{}'", other))),
        }
    }
}

/// Configuration for one buffer instance
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Name used in logs, flush events and stats
    pub name: String,
    /// Delay between the first enqueue into an idle buffer and its flush
    pub flush_delay: Duration,
    /// Entry count that triggers an immediate flush
    pub max_size: usize,
    /// Failure policy for this instance
    pub failure_mode: FailureMode,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self::dispatcher("default", Duration::from_millis(2000), 100)
    }
}

impl BufferConfig {
    /// Config with the coalescer's failure contract (aggregate error)
    pub fn coalescer(name: impl Into<String>, flush_delay: Duration, max_size: usize) -> Self {
        Self {
            name: name.into(),
            flush_delay,
            max_size,
            failure_mode: FailureMode::Propagate,
        }
    }

    /// Config with the dispatcher's failure contract (report and swallow)
    pub fn dispatcher(name: impl Into<String>, flush_delay: Duration, max_size: usize) -> Self {
        Self {
            name: name.into(),
            flush_delay,
            max_size,
            failure_mode: FailureMode::LogOnly,
        }
    }

    /// Vote toggles: shorter delay and a larger threshold to stay
    /// responsive under voting storms
    pub fn for_votes() -> Self {
        Self::dispatcher("votes", Duration::from_millis(500), 500)
    }

    pub fn for_follows() -> Self {
        Self::dispatcher("follows", Duration::from_millis(2000), 100)
    }

    pub fn for_saves() -> Self {
        Self::dispatcher("saves", Duration::from_millis(2000), 100)
    }

    /// View tracking: long window, repeated views collapse per viewer
    pub fn for_views() -> Self {
        Self::coalescer("views", Duration::from_millis(5000), 1000)
    }

    pub fn for_notifications() -> Self {
        Self::dispatcher("notifications", Duration::from_millis(1000), 200)
    }

    /// Access logs are append-only, so only the threshold bounds them
    pub fn for_access_log() -> Self {
        Self::dispatcher("access_logs", Duration::from_millis(3000), 1000)
    }

    pub fn with_flush_delay(mut self, flush_delay: Duration) -> Self {
        self.flush_delay = flush_delay;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Point-in-time statistics for a buffer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    /// Entries accepted by `enqueue`
    pub enqueued: u64,
    /// Entries that overwrote a pending entry with the same key
    pub deduplicated: u64,
    /// Non-empty flushes run
    pub flushes: u64,
    /// Entries consumed by flushes
    pub flushed_records: u64,
    /// Entries lost to failed actions or handler groups
    pub failed_records: u64,
    /// Currently buffered entries
    pub pending: usize,
}

#[derive(Default)]
struct StatCounters {
    enqueued: AtomicU64,
    deduplicated: AtomicU64,
    flushes: AtomicU64,
    flushed_records: AtomicU64,
    failed_records: AtomicU64,
}

// =============================================================================
// Flush trigger
// =============================================================================

/// What started a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    Timer,
    Threshold,
    Manual,
}

impl std::fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timer => write!(f, "timer"),
            Self::Threshold => write!(f, "threshold"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Outcome of running one captured batch, before the failure policy applies
pub(crate) struct FlushSummary {
    pub trigger: FlushTrigger,
    pub records: usize,
    pub groups: usize,
    pub rows: u64,
    pub failures: Vec<FlushFailure>,
    pub started: Instant,
}

// =============================================================================
// Operation Buffer
// =============================================================================

/// Count of detached flushes still running
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Held by a detached flush for as long as it runs
pub(crate) struct FlushGuard(Arc<InFlight>);

impl Drop for FlushGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Entries taken by a timer or threshold flush, tracked until dropped
pub(crate) struct ClaimedBatch<K, V> {
    pub entries: HashMap<K, V>,
    pub guard: FlushGuard,
}

struct PendingTimer {
    id: u64,
    handle: JoinHandle<()>,
}

struct BufferState<K, V> {
    entries: HashMap<K, V>,
    timer: Option<PendingTimer>,
    next_timer_id: u64,
}

/// Keyed write buffer with a size bound and a single pending flush timer.
///
/// Every mutation runs inside one short critical section that never awaits,
/// so `enqueue` and the flush swap are atomic with respect to each other.
pub struct OperationBuffer<K, V> {
    config: BufferConfig,
    state: Mutex<BufferState<K, V>>,
    stats: StatCounters,
    in_flight: Arc<InFlight>,
}

impl<K, V> OperationBuffer<K, V>
where
    K: Eq + Hash,
{
    pub fn new(mut config: BufferConfig) -> Self {
        config.max_size = config.max_size.max(1);
        Self {
            config,
            state: Mutex::new(BufferState {
                entries: HashMap::new(),
                timer: None,
                next_timer_id: 0,
            }),
            stats: StatCounters::default(),
            in_flight: Arc::default(),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Number of entries waiting for the next flush
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a flush timer is armed
    pub fn has_pending_timer(&self) -> bool {
        self.lock().timer.is_some()
    }

    /// Timer or threshold flushes that have claimed a batch and not finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Wait until no detached flush is running.
    ///
    /// Must not be awaited from inside a flush of the same buffer.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            tokio::pin!(notified);
            // Register before reading the count so a guard dropped in
            // between still wakes us
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Insert under `key`, replacing any pending entry (last write wins).
    ///
    /// Returns the swapped-out batch when the insert reached `max_size`.
    /// `arm_timer` is called at most once, with the lock held, when the buffer
    /// has entries and no timer yet.
    pub(crate) fn insert<F>(&self, key: K, value: V, arm_timer: F) -> Option<ClaimedBatch<K, V>>
    where
        F: FnOnce(u64) -> JoinHandle<()>,
    {
        let (replaced, batch) = self.mutate(|entries| entries.insert(key, value).is_some(), arm_timer);
        self.note_enqueue(replaced);
        batch
    }

    pub(crate) fn note_enqueue(&self, replaced: bool) {
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.stats.deduplicated.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Run `f` against the live entries, then apply the threshold and timer
    /// rules exactly as an insert would.
    pub(crate) fn mutate<R, F, A>(&self, f: F, arm_timer: A) -> (R, Option<ClaimedBatch<K, V>>)
    where
        F: FnOnce(&mut HashMap<K, V>) -> R,
        A: FnOnce(u64) -> JoinHandle<()>,
    {
        let mut state = self.lock();
        let result = f(&mut state.entries);

        if state.entries.len() >= self.config.max_size {
            let entries = Self::swap(&mut state);
            return (result, Some(self.claim(entries)));
        }

        if !state.entries.is_empty() && state.timer.is_none() {
            state.next_timer_id += 1;
            let id = state.next_timer_id;
            state.timer = Some(PendingTimer {
                id,
                handle: arm_timer(id),
            });
        }

        (result, None)
    }

    /// Read the live entries without changing them
    pub(crate) fn peek<R>(&self, f: impl FnOnce(&HashMap<K, V>) -> R) -> R {
        f(&self.lock().entries)
    }

    /// Take the buffered entries for a manual flush, cancelling the timer
    pub(crate) fn take(&self) -> HashMap<K, V> {
        let mut state = self.lock();
        Self::swap(&mut state)
    }

    /// Take the buffered entries from inside timer `id`.
    ///
    /// Returns `None` if another flush already claimed this window. The timer
    /// detaches itself instead of aborting, since it is the running task.
    pub(crate) fn take_fired(&self, id: u64) -> Option<ClaimedBatch<K, V>> {
        let mut state = self.lock();
        if !state.timer.as_ref().is_some_and(|timer| timer.id == id) {
            return None;
        }
        state.timer = None;
        let entries = std::mem::take(&mut state.entries);
        Some(self.claim(entries))
    }

    /// Count a detached flush in before the lock is released, so a
    /// concurrent `wait_idle` cannot miss it
    fn claim(&self, entries: HashMap<K, V>) -> ClaimedBatch<K, V> {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        ClaimedBatch {
            entries,
            guard: FlushGuard(Arc::clone(&self.in_flight)),
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            deduplicated: self.stats.deduplicated.load(Ordering::Relaxed),
            flushes: self.stats.flushes.load(Ordering::Relaxed),
            flushed_records: self.stats.flushed_records.load(Ordering::Relaxed),
            failed_records: self.stats.failed_records.load(Ordering::Relaxed),
            pending: self.len(),
        }
    }

    /// Record a finished flush, report it to the sink and apply the failure
    /// policy.
    pub(crate) fn complete(&self, summary: FlushSummary, sink: &dyn FlushSink) -> Result<()> {
        let failed_records: usize = summary.failures.iter().map(|f| f.records).sum();
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .flushed_records
            .fetch_add(summary.records as u64, Ordering::Relaxed);
        self.stats
            .failed_records
            .fetch_add(failed_records as u64, Ordering::Relaxed);

        let event = FlushEvent {
            at: Utc::now(),
            buffer: self.config.name.clone(),
            trigger: summary.trigger,
            records: summary.records,
            groups: summary.groups,
            rows: summary.rows,
            failures: summary.failures,
            duration_ms: summary.started.elapsed().as_secs_f64() * 1000.0,
        };
        sink.record(&event);

        if event.failures.is_empty() || self.config.failure_mode == FailureMode::LogOnly {
            return Ok(());
        }

        Err(BatchError::Aggregate {
            buffer: event.buffer,
            failures: event.failures,
        })
    }

    fn swap(state: &mut BufferState<K, V>) -> HashMap<K, V> {
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
        std::mem::take(&mut state.entries)
    }

    fn lock(&self) -> MutexGuard<'_, BufferState<K, V>> {
        // Critical sections never panic mid-update, so a poisoned lock still
        // holds a consistent map.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared handle to a buffer's flush sink
pub(crate) type SharedSink = Arc<dyn FlushSink>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::TracingSink;

    fn idle_timer(_: u64) -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    #[tokio::test]
    async fn test_insert_arms_one_timer() {
        let buffer: OperationBuffer<String, u32> =
            OperationBuffer::new(BufferConfig::dispatcher("t", Duration::from_secs(1), 10));
        let mut armed = 0;

        assert!(buffer
            .insert("a".into(), 1, |_| {
                armed += 1;
                idle_timer(0)
            })
            .is_none());
        assert!(buffer
            .insert("b".into(), 2, |_| {
                armed += 1;
                idle_timer(0)
            })
            .is_none());

        assert_eq!(armed, 1);
        assert!(buffer.has_pending_timer());
        assert_eq!(buffer.len(), 2);
    }

    #[tokio::test]
    async fn test_threshold_swaps_buffer() {
        let buffer: OperationBuffer<String, u32> =
            OperationBuffer::new(BufferConfig::dispatcher("t", Duration::from_secs(1), 2));

        assert!(buffer.insert("a".into(), 1, idle_timer).is_none());
        let batch = buffer.insert("b".into(), 2, idle_timer).expect("threshold batch");

        assert_eq!(batch.entries.len(), 2);
        assert!(buffer.is_empty());
        assert!(!buffer.has_pending_timer());
        assert_eq!(buffer.in_flight(), 1);
        drop(batch);
        assert_eq!(buffer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_blocks_until_claimed_batch_finishes() {
        let buffer: Arc<OperationBuffer<String, u32>> =
            Arc::new(OperationBuffer::new(BufferConfig::dispatcher("t", Duration::from_secs(1), 1)));

        // Idle buffer returns at once
        buffer.wait_idle().await;

        let batch = buffer.insert("a".into(), 1, idle_timer).expect("threshold batch");
        let waiter = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.wait_idle().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(batch);
        tokio_test::assert_ok!(waiter.await);
        assert_eq!(buffer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_key_is_replaced() {
        let buffer: OperationBuffer<String, u32> =
            OperationBuffer::new(BufferConfig::dispatcher("t", Duration::from_secs(1), 10));

        buffer.insert("a".into(), 1, idle_timer);
        buffer.insert("a".into(), 2, idle_timer);

        let batch = buffer.take();
        assert_eq!(batch.get("a"), Some(&2));
        let stats = buffer.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.deduplicated, 1);
    }

    #[tokio::test]
    async fn test_stale_timer_claims_nothing() {
        let buffer: OperationBuffer<String, u32> =
            OperationBuffer::new(BufferConfig::dispatcher("t", Duration::from_secs(1), 10));

        buffer.insert("a".into(), 1, idle_timer);
        let _ = buffer.take();
        buffer.insert("b".into(), 2, idle_timer);

        // Timer 1 was cancelled by the manual take; timer 2 owns the window
        assert!(buffer.take_fired(1).is_none());
        let batch = buffer.take_fired(2).expect("current timer");
        assert_eq!(batch.entries.len(), 1);
        assert!(!buffer.has_pending_timer());
    }

    #[test]
    fn test_zero_max_size_is_clamped() {
        let buffer: OperationBuffer<String, u32> =
            OperationBuffer::new(BufferConfig::default().with_max_size(0));
        assert_eq!(buffer.config().max_size, 1);
    }

    #[test]
    fn test_complete_applies_failure_mode() {
        let sink = TracingSink::new(false);
        let cause = BatchError::Storage("down".into());

        let propagate: OperationBuffer<String, u32> = OperationBuffer::new(
            BufferConfig::coalescer("p", Duration::from_secs(1), 10),
        );
        let err = propagate
            .complete(
                FlushSummary {
                    trigger: FlushTrigger::Manual,
                    records: 2,
                    groups: 2,
                    rows: 1,
                    failures: vec![FlushFailure::new("k1", 1, &cause)],
                    started: Instant::now(),
                },
                &sink,
            )
            .unwrap_err();
        assert_eq!(err.failures()[0].key, "k1");
        assert_eq!(propagate.stats().failed_records, 1);

        let log_only: OperationBuffer<String, u32> = OperationBuffer::new(
            BufferConfig::dispatcher("l", Duration::from_secs(1), 10),
        );
        let result = log_only.complete(
            FlushSummary {
                trigger: FlushTrigger::Manual,
                records: 1,
                groups: 1,
                rows: 0,
                failures: vec![FlushFailure::new("k1", 1, &cause)],
                started: Instant::now(),
            },
            &sink,
        );
        assert!(result.is_ok());
        assert_eq!(log_only.stats().flushes, 1);
    }

    #[test]
    fn test_presets() {
        let votes = BufferConfig::for_votes();
        let default = BufferConfig::default();
        assert!(votes.flush_delay < default.flush_delay);
        assert!(votes.max_size > default.max_size);
        assert_eq!(BufferConfig::for_views().failure_mode, FailureMode::Propagate);
        assert_eq!(BufferConfig::for_follows().failure_mode, FailureMode::LogOnly);
        assert_eq!("log-only".parse::<FailureMode>().unwrap(), FailureMode::LogOnly);
        assert!("retry".parse::<FailureMode>().is_err());
    }
}
