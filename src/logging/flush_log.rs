//! JSONL flush log
//!
//! Appends one [`FlushEvent`] per line for offline analysis of batching
//! behaviour (records per flush, failure rate, latency).

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{error, info};

use super::{FlushEvent, FlushSink, TracingSink};

/// Flush sink that writes JSONL and forwards to tracing
#[derive(Clone)]
pub struct FlushLogger {
    inner: Arc<Mutex<FlushLoggerInner>>,
    tracing: TracingSink,
}

struct FlushLoggerInner {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

impl FlushLogger {
    /// Logger with no file yet; events only reach tracing
    pub fn new(dev_mode: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FlushLoggerInner {
                writer: None,
                path: None,
            })),
            tracing: TracingSink::new(dev_mode),
        }
    }

    /// Start appending to `path`, creating it if needed
    pub fn init_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.writer = Some(BufWriter::new(file));
        inner.path = Some(path.clone());

        info!("Flush logging initialized to {}", path.display());
        Ok(())
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .path
            .clone()
    }
}

impl FlushSink for FlushLogger {
    fn record(&self, event: &FlushEvent) {
        self.tracing.record(event);

        let line = match event.to_jsonl() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize flush event: {}", e);
                return;
            }
        };

        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(ref mut writer) = inner.writer {
            if let Err(e) = writeln!(writer, "{}", line) {
                error!("Failed to write flush event: {}", e);
            }
            if let Err(e) = writer.flush() {
                error!("Failed to flush flush log: {}", e);
            }
        }
    }
}
