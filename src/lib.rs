//! Write coalescer - batch layer for high-frequency community writes
//!
//! Follows, votes, saves, views, notification updates and access-log lines
//! are accepted immediately, buffered in memory, deduplicated per key and
//! flushed in bulk when a timer fires or a buffer fills.
//!
//! ## Components
//!
//! - **Buffer**: the shared flush engine, a closure-based write coalescer
//!   and a typed mutation dispatcher
//! - **Handlers**: bulk handlers per (operation, collection) with counter
//!   aggregation
//! - **Toggle**: the follow / vote / save decision protocol
//! - **Store**: storage seam with MongoDB and in-memory backends
//! - **Services**: one configured buffer per use case and ordered shutdown
//! - **Storm**: synthetic load and counter verification for the binary

pub mod buffer;
pub mod config;
pub mod db;
pub mod handlers;
pub mod logging;
pub mod services;
pub mod store;
pub mod storm;
pub mod toggle;
pub mod types;

pub use buffer::{BufferConfig, BufferStats, FailureMode, MutationDispatcher, MutationRecord, WriteCoalescer, WriteIntent};
pub use config::Args;
pub use services::{BatchServices, BufferSettings, ShutdownReport};
pub use types::{BatchError, Result};
