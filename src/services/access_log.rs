//! Access-log ingestion batching

use crate::buffer::{BufferStats, MutationDispatcher, MutationRecord};
use crate::handlers::OperationKind;
use crate::store::{AccessLogEntry, ACCESS_LOGS};
use crate::types::Result;

/// Buffers access-log lines and inserts them in bulk. Entries never
/// collapse.
#[derive(Clone)]
pub struct AccessLogIngest {
    dispatcher: MutationDispatcher<AccessLogEntry>,
}

impl AccessLogIngest {
    pub fn new(dispatcher: MutationDispatcher<AccessLogEntry>) -> Self {
        Self { dispatcher }
    }

    pub fn ingest(&self, entry: AccessLogEntry) {
        self.dispatcher
            .enqueue(MutationRecord::new(OperationKind::Create, ACCESS_LOGS, None, entry));
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

    pub(crate) fn dispatcher(&self) -> &MutationDispatcher<AccessLogEntry> {
        &self.dispatcher
    }
}
