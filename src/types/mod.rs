//! Shared types

pub mod error;

pub use error::{BatchError, FlushFailure, Result};
