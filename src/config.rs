//! Configuration for the write coalescer
//!
//! CLI arguments and environment variable handling using clap. Buffer
//! presets live on [`BufferConfig`]; every preset can be overridden here.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

pub use crate::buffer::{BufferConfig, FailureMode};
use crate::services::BufferSettings;

/// Storage backend behind the handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// In-process DashMap store, lost on exit
    Memory,
    /// MongoDB at `--mongodb-uri`
    Mongo,
}

/// write-coalescer - buffer, dedupe and bulk-flush community writes
#[derive(Parser, Debug, Clone)]
#[command(name = "write-coalescer")]
#[command(about = "Drive a toggle storm through the write-coalescing batch layer")]
pub struct Args {
    /// Storage backend
    #[arg(long, env = "STORE", value_enum, default_value = "mongo")]
    pub store: StoreBackend,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "write_coalescer")]
    pub mongodb_db: String,

    /// Development mode: fall back to the memory store when MongoDB is
    /// unreachable, log every flush
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Append one JSON line per flush to this file
    #[arg(long, env = "FLUSH_LOG")]
    pub flush_log: Option<PathBuf>,

    /// Failure mode applied to every buffer (propagate, log_only).
    /// Unset keeps each preset's own mode.
    #[arg(long, env = "FAILURE_MODE")]
    pub failure_mode: Option<FailureMode>,

    #[command(flatten)]
    pub buffers: BufferArgs,

    #[command(flatten)]
    pub storm: StormArgs,
}

/// Per-buffer overrides of the presets
#[derive(Parser, Debug, Clone, Default)]
pub struct BufferArgs {
    #[arg(long, env = "VOTES_FLUSH_DELAY_MS")]
    pub votes_flush_delay_ms: Option<u64>,

    #[arg(long, env = "VOTES_MAX_SIZE")]
    pub votes_max_size: Option<usize>,

    #[arg(long, env = "FOLLOWS_FLUSH_DELAY_MS")]
    pub follows_flush_delay_ms: Option<u64>,

    #[arg(long, env = "FOLLOWS_MAX_SIZE")]
    pub follows_max_size: Option<usize>,

    #[arg(long, env = "SAVES_FLUSH_DELAY_MS")]
    pub saves_flush_delay_ms: Option<u64>,

    #[arg(long, env = "SAVES_MAX_SIZE")]
    pub saves_max_size: Option<usize>,

    #[arg(long, env = "VIEWS_FLUSH_DELAY_MS")]
    pub views_flush_delay_ms: Option<u64>,

    #[arg(long, env = "VIEWS_MAX_SIZE")]
    pub views_max_size: Option<usize>,

    #[arg(long, env = "NOTIFICATIONS_FLUSH_DELAY_MS")]
    pub notifications_flush_delay_ms: Option<u64>,

    #[arg(long, env = "NOTIFICATIONS_MAX_SIZE")]
    pub notifications_max_size: Option<usize>,

    #[arg(long, env = "ACCESS_LOGS_FLUSH_DELAY_MS")]
    pub access_logs_flush_delay_ms: Option<u64>,

    #[arg(long, env = "ACCESS_LOGS_MAX_SIZE")]
    pub access_logs_max_size: Option<usize>,
}

/// Synthetic load driven by the binary
#[derive(Parser, Debug, Clone)]
pub struct StormArgs {
    /// Distinct actors issuing toggles
    #[arg(long, env = "STORM_ACTORS", default_value = "50")]
    pub storm_actors: usize,

    /// Distinct targets (users to follow, posts to vote on and save)
    #[arg(long, env = "STORM_TARGETS", default_value = "20")]
    pub storm_targets: usize,

    /// Total requests issued
    #[arg(long, env = "STORM_REQUESTS", default_value = "5000")]
    pub storm_requests: usize,

    /// Requests in flight at once
    #[arg(long, env = "STORM_CONCURRENCY", default_value = "16")]
    pub storm_concurrency: usize,

    /// Exit non-zero when a counter drifts from its relation count
    #[arg(long, env = "STORM_STRICT", default_value = "false")]
    pub storm_strict: bool,
}

/// Longest flush delay accepted, past which buffered writes are effectively
/// parked
const MAX_FLUSH_DELAY_MS: u64 = 10 * 60 * 1000;

fn apply(config: BufferConfig, delay_ms: Option<u64>, max_size: Option<usize>, mode: Option<FailureMode>) -> BufferConfig {
    let mut config = config;
    if let Some(ms) = delay_ms {
        config = config.with_flush_delay(Duration::from_millis(ms));
    }
    if let Some(size) = max_size {
        config = config.with_max_size(size);
    }
    if let Some(mode) = mode {
        config = config.with_failure_mode(mode);
    }
    config
}

impl Args {
    /// Presets with every override applied
    pub fn buffer_settings(&self) -> BufferSettings {
        let b = &self.buffers;
        let mode = self.failure_mode;
        let defaults = BufferSettings::default();
        BufferSettings {
            votes: apply(defaults.votes, b.votes_flush_delay_ms, b.votes_max_size, mode),
            follows: apply(defaults.follows, b.follows_flush_delay_ms, b.follows_max_size, mode),
            saves: apply(defaults.saves, b.saves_flush_delay_ms, b.saves_max_size, mode),
            views: apply(defaults.views, b.views_flush_delay_ms, b.views_max_size, mode),
            notifications: apply(
                defaults.notifications,
                b.notifications_flush_delay_ms,
                b.notifications_max_size,
                mode,
            ),
            access_logs: apply(
                defaults.access_logs,
                b.access_logs_flush_delay_ms,
                b.access_logs_max_size,
                mode,
            ),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.store == StoreBackend::Mongo && self.mongodb_uri.trim().is_empty() {
            return Err("MONGODB_URI is required for the mongo store".to_string());
        }

        let b = &self.buffers;
        let sizes = [
            ("VOTES_MAX_SIZE", b.votes_max_size),
            ("FOLLOWS_MAX_SIZE", b.follows_max_size),
            ("SAVES_MAX_SIZE", b.saves_max_size),
            ("VIEWS_MAX_SIZE", b.views_max_size),
            ("NOTIFICATIONS_MAX_SIZE", b.notifications_max_size),
            ("ACCESS_LOGS_MAX_SIZE", b.access_logs_max_size),
        ];
        for (name, size) in sizes {
            if size == Some(0) {
                return Err(format!("{} must be at least 1", name));
            }
        }

        let delays = [
            ("VOTES_FLUSH_DELAY_MS", b.votes_flush_delay_ms),
            ("FOLLOWS_FLUSH_DELAY_MS", b.follows_flush_delay_ms),
            ("SAVES_FLUSH_DELAY_MS", b.saves_flush_delay_ms),
            ("VIEWS_FLUSH_DELAY_MS", b.views_flush_delay_ms),
            ("NOTIFICATIONS_FLUSH_DELAY_MS", b.notifications_flush_delay_ms),
            ("ACCESS_LOGS_FLUSH_DELAY_MS", b.access_logs_flush_delay_ms),
        ];
        for (name, delay) in delays {
            if delay.is_some_and(|ms| ms > MAX_FLUSH_DELAY_MS) {
                return Err(format!("{} must not exceed {} ms", name, MAX_FLUSH_DELAY_MS));
            }
        }

        let s = &self.storm;
        if s.storm_actors == 0 || s.storm_targets == 0 {
            return Err("STORM_ACTORS and STORM_TARGETS must be at least 1".to_string());
        }
        if s.storm_concurrency == 0 {
            return Err("STORM_CONCURRENCY must be at least 1".to_string());
        }

        Ok(())
    }
}
