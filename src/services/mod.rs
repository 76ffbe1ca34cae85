//! Services layer
//!
//! [`BatchServices`] owns one independently configured buffer per use case
//! and is the only place they are wired together.
//!
//! ## Services
//!
//! - **ToggleService**: follow / vote / save toggles on three dispatchers
//! - **ViewTracker**: view counting on a write coalescer
//! - **NotificationBuffer**: notification read and delete
//! - **AccessLogIngest**: bulk access-log inserts

pub mod access_log;
pub mod notifications;
pub mod views;

pub use access_log::AccessLogIngest;
pub use notifications::NotificationBuffer;
pub use views::ViewTracker;

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::buffer::{BufferConfig, BufferStats, MutationDispatcher, WriteCoalescer};
use crate::handlers::activity::{access_log_handlers, notification_handlers};
use crate::handlers::relations::{relation_handlers, RelationChange};
use crate::logging::FlushSink;
use crate::store::{RelationKind, Store};
use crate::toggle::ToggleService;
use crate::types::Result;

/// Buffer configuration per use case
#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub votes: BufferConfig,
    pub follows: BufferConfig,
    pub saves: BufferConfig,
    pub views: BufferConfig,
    pub notifications: BufferConfig,
    pub access_logs: BufferConfig,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            votes: BufferConfig::for_votes(),
            follows: BufferConfig::for_follows(),
            saves: BufferConfig::for_saves(),
            views: BufferConfig::for_views(),
            notifications: BufferConfig::for_notifications(),
            access_logs: BufferConfig::for_access_log(),
        }
    }
}

/// What one buffer gave up at shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferDrain {
    pub buffer: String,
    /// Entries pending when shutdown began
    pub records: usize,
    /// Entries lost to failures during the final flush
    pub failed_records: u64,
    /// Aggregate error, for buffers that propagate failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of [`BatchServices::shutdown`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub buffers: Vec<BufferDrain>,
}

impl ShutdownReport {
    pub fn records(&self) -> usize {
        self.buffers.iter().map(|b| b.records).sum()
    }

    pub fn failed_records(&self) -> u64 {
        self.buffers.iter().map(|b| b.failed_records).sum()
    }

    /// No buffer lost anything in the final flush
    pub fn is_clean(&self) -> bool {
        self.buffers
            .iter()
            .all(|b| b.failed_records == 0 && b.error.is_none())
    }
}

/// Composition root for every batched write path
#[derive(Clone)]
pub struct BatchServices {
    toggles: ToggleService,
    votes: MutationDispatcher<RelationChange>,
    follows: MutationDispatcher<RelationChange>,
    saves: MutationDispatcher<RelationChange>,
    views: ViewTracker,
    notifications: NotificationBuffer,
    access_log: AccessLogIngest,
}

impl BatchServices {
    /// Build every buffer with its handlers. Must run inside a Tokio runtime
    /// before the first enqueue.
    pub fn new(store: Arc<dyn Store>, settings: BufferSettings, sink: Arc<dyn FlushSink>) -> Self {
        let votes = MutationDispatcher::new(
            settings.votes,
            relation_handlers(RelationKind::Vote, Arc::clone(&store)),
            Arc::clone(&sink),
        );
        let follows = MutationDispatcher::new(
            settings.follows,
            relation_handlers(RelationKind::Follow, Arc::clone(&store)),
            Arc::clone(&sink),
        );
        let saves = MutationDispatcher::new(
            settings.saves,
            relation_handlers(RelationKind::Save, Arc::clone(&store)),
            Arc::clone(&sink),
        );

        let toggles = ToggleService::new(Arc::clone(&store), follows.clone(), votes.clone(), saves.clone());
        let views = ViewTracker::new(
            WriteCoalescer::new(settings.views, Arc::clone(&sink)),
            Arc::clone(&store),
        );
        let notifications = NotificationBuffer::new(MutationDispatcher::new(
            settings.notifications,
            notification_handlers(Arc::clone(&store)),
            Arc::clone(&sink),
        ));
        let access_log = AccessLogIngest::new(MutationDispatcher::new(
            settings.access_logs,
            access_log_handlers(store),
            sink,
        ));

        info!("Batch services initialized");
        Self {
            toggles,
            votes,
            follows,
            saves,
            views,
            notifications,
            access_log,
        }
    }

    pub fn toggles(&self) -> &ToggleService {
        &self.toggles
    }

    pub fn views(&self) -> &ViewTracker {
        &self.views
    }

    pub fn notifications(&self) -> &NotificationBuffer {
        &self.notifications
    }

    pub fn access_log(&self) -> &AccessLogIngest {
        &self.access_log
    }

    /// Entries waiting across every buffer
    pub fn pending_len(&self) -> usize {
        self.votes.pending_len()
            + self.follows.pending_len()
            + self.saves.pending_len()
            + self.views.pending_len()
            + self.notifications.pending_len()
            + self.access_log.pending_len()
    }

    /// Stats per buffer, by name
    pub fn stats(&self) -> Vec<(String, BufferStats)> {
        vec![
            (self.votes.name().to_string(), self.votes.stats()),
            (self.follows.name().to_string(), self.follows.stats()),
            (self.saves.name().to_string(), self.saves.stats()),
            (self.views.coalescer().name().to_string(), self.views.stats()),
            (
                self.notifications.dispatcher().name().to_string(),
                self.notifications.stats(),
            ),
            (self.access_log.dispatcher().name().to_string(), self.access_log.stats()),
        ]
    }

    /// Flush every buffer and report what each one drained.
    ///
    /// Relation buffers go first so counters settle before the report is
    /// read. Failures never stop the remaining buffers from draining.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        for dispatcher in [&self.votes, &self.follows, &self.saves] {
            report
                .buffers
                .push(drain(dispatcher.name(), dispatcher.pending_len(), || dispatcher.stats(), dispatcher.flush()).await);
        }

        let coalescer = self.views.coalescer();
        report
            .buffers
            .push(drain(coalescer.name(), coalescer.pending_len(), || coalescer.stats(), coalescer.flush()).await);

        let notifications = self.notifications.dispatcher();
        report.buffers.push(
            drain(
                notifications.name(),
                notifications.pending_len(),
                || notifications.stats(),
                notifications.flush(),
            )
            .await,
        );

        let access_log = self.access_log.dispatcher();
        report.buffers.push(
            drain(
                access_log.name(),
                access_log.pending_len(),
                || access_log.stats(),
                access_log.flush(),
            )
            .await,
        );

        if report.is_clean() {
            info!(records = report.records(), "All buffers drained");
        } else {
            warn!(
                records = report.records(),
                failed_records = report.failed_records(),
                "Buffers drained with failures"
            );
        }
        report
    }
}

async fn drain<S, F>(name: &str, records: usize, stats: S, flush: F) -> BufferDrain
where
    S: Fn() -> BufferStats,
    F: std::future::Future<Output = Result<()>>,
{
    let failed_before = stats().failed_records;
    let error = flush.await.err().map(|e| e.to_string());
    BufferDrain {
        buffer: name.to_string(),
        records,
        failed_records: stats().failed_records - failed_before,
        error,
    }
}
