//! MongoDB backend
//!
//! One pluggable implementation of the storage traits in [`crate::store`].

pub mod mongo;
pub mod schemas;
mod store;

pub use mongo::{IntoIndexes, MongoClient, MongoCollection, MutMetadata, UpdateStatement};
pub use store::MongoStore;
