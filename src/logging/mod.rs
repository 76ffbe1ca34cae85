//! Flush observability
//!
//! Every non-empty flush produces one [`FlushEvent`], handed to the buffer's
//! [`FlushSink`]. Failures always reach the sink, whatever the buffer's
//! failure mode.

pub mod flush_log;

pub use flush_log::FlushLogger;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::buffer::FlushTrigger;
use crate::types::FlushFailure;

/// Outcome of one flush
#[derive(Debug, Clone, Serialize)]
pub struct FlushEvent {
    /// When the flush finished
    pub at: DateTime<Utc>,
    /// Buffer name
    pub buffer: String,
    pub trigger: FlushTrigger,
    /// Buffered entries consumed
    pub records: usize,
    /// Handler groups (dispatcher) or actions (coalescer) run
    pub groups: usize,
    /// Rows reported written by handlers
    pub rows: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FlushFailure>,
    pub duration_ms: f64,
}

impl FlushEvent {
    pub fn failed_records(&self) -> usize {
        self.failures.iter().map(|f| f.records).sum()
    }

    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Receives flush events. Called from flush tasks; must not block for long.
pub trait FlushSink: Send + Sync {
    fn record(&self, event: &FlushEvent);
}

/// Sink that reports flushes through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink {
    dev_mode: bool,
}

impl TracingSink {
    /// In dev mode every flush is logged at info and each failure at error.
    /// Otherwise successful flushes go to debug and failures are summarized
    /// in one warning.
    pub fn new(dev_mode: bool) -> Self {
        Self { dev_mode }
    }
}

impl FlushSink for TracingSink {
    fn record(&self, event: &FlushEvent) {
        if event.failures.is_empty() {
            if self.dev_mode {
                info!(
                    buffer = %event.buffer,
                    trigger = %event.trigger,
                    records = event.records,
                    groups = event.groups,
                    rows = event.rows,
                    duration_ms = event.duration_ms,
                    "Flush complete"
                );
            } else {
                debug!(
                    buffer = %event.buffer,
                    trigger = %event.trigger,
                    records = event.records,
                    rows = event.rows,
                    "Flush complete"
                );
            }
            return;
        }

        if self.dev_mode {
            for failure in &event.failures {
                error!(
                    buffer = %event.buffer,
                    trigger = %event.trigger,
                    key = %failure.key,
                    records = failure.records,
                    "Flush failure: {}",
                    failure.message
                );
            }
        } else {
            warn!(
                buffer = %event.buffer,
                trigger = %event.trigger,
                failed = event.failures.len(),
                failed_records = event.failed_records(),
                records = event.records,
                "Flush completed with failures"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BatchError;

    #[test]
    fn test_event_jsonl_omits_empty_failures() {
        let event = FlushEvent {
            at: Utc::now(),
            buffer: "votes".into(),
            trigger: FlushTrigger::Timer,
            records: 3,
            groups: 1,
            rows: 3,
            failures: vec![],
            duration_ms: 1.5,
        };
        let line = event.to_jsonl().unwrap();
        assert!(line.contains("\"trigger\":\"timer\""));
        assert!(!line.contains("failures"));
    }

    #[test]
    fn test_failed_records_sums_failures() {
        let cause = BatchError::Storage("x".into());
        let event = FlushEvent {
            at: Utc::now(),
            buffer: "follows".into(),
            trigger: FlushTrigger::Manual,
            records: 5,
            groups: 2,
            rows: 0,
            failures: vec![
                FlushFailure::new("create:follows", 3, &cause),
                FlushFailure::new("delete:follows", 2, &cause),
            ],
            duration_ms: 0.0,
        };
        assert_eq!(event.failed_records(), 5);
        // Must not panic in either mode
        TracingSink::new(true).record(&event);
        TracingSink::new(false).record(&event);
    }
}
