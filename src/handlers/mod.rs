//! Handler registry - the only code that talks to storage
//!
//! A [`MutationDispatcher`](crate::buffer::MutationDispatcher) groups its
//! buffered records by `(OperationKind, collection)` and calls exactly one
//! handler per group with every payload in that group. A handler must:
//!
//! 1. apply the whole group in one bulk storage call,
//! 2. tally per foreign key how often it appears (see [`CounterTally`]),
//! 3. adjust counters with one bulk call per aggregate collection.
//!
//! Nothing is rolled back if step 3 fails after step 1 succeeded.

pub mod activity;
pub mod relations;
mod tally;

pub use tally::CounterTally;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::Result;

/// Kind of bulk mutation a record asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [Self::Create, Self::Update, Self::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a handler did with its group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HandlerReport {
    /// Relation or log rows written
    pub rows: u64,
    /// Counter adjustments issued
    pub counter_updates: usize,
}

/// Applies one `(kind, collection)` group of payloads
#[async_trait::async_trait]
pub trait MutationHandler<P>: Send + Sync
where
    P: Send + 'static,
{
    async fn handle(&self, payloads: Vec<P>) -> Result<HandlerReport>;
}

/// Adapter so plain async closures can be registered as handlers
pub struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<P, F, Fut> MutationHandler<P> for FnHandler<F>
where
    P: Send + 'static,
    F: Fn(Vec<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerReport>> + Send + 'static,
{
    async fn handle(&self, payloads: Vec<P>) -> Result<HandlerReport> {
        (self.0)(payloads).await
    }
}

/// Table mapping `(collection, kind)` to its handler
pub struct HandlerTable<P: Send + 'static> {
    handlers: HashMap<(String, OperationKind), Arc<dyn MutationHandler<P>>>,
}

impl<P: Send + 'static> Default for HandlerTable<P> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<P> HandlerTable<P>
where
    P: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same route
    pub fn register<H>(&mut self, collection: impl Into<String>, kind: OperationKind, handler: H) -> &mut Self
    where
        H: MutationHandler<P> + 'static,
    {
        self.handlers
            .insert((collection.into(), kind), Arc::new(handler));
        self
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(&mut self, collection: impl Into<String>, kind: OperationKind, f: F) -> &mut Self
    where
        F: Fn(Vec<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerReport>> + Send + 'static,
    {
        self.register(collection, kind, FnHandler(f))
    }

    /// Builder form of [`register`](Self::register)
    pub fn with<H>(mut self, collection: impl Into<String>, kind: OperationKind, handler: H) -> Self
    where
        H: MutationHandler<P> + 'static,
    {
        self.register(collection, kind, handler);
        self
    }

    pub fn get(&self, collection: &str, kind: OperationKind) -> Option<Arc<dyn MutationHandler<P>>> {
        self.handlers.get(&(collection.to_string(), kind)).cloned()
    }

    pub fn contains(&self, collection: &str, kind: OperationKind) -> bool {
        self.handlers.contains_key(&(collection.to_string(), kind))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered routes, sorted for stable output
    pub fn routes(&self) -> Vec<(String, OperationKind)> {
        let mut routes: Vec<_> = self.handlers.keys().cloned().collect();
        routes.sort();
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_fn_and_lookup() {
        let mut table: HandlerTable<u32> = HandlerTable::new();
        table.register_fn("votes", OperationKind::Create, |payloads: Vec<u32>| async move {
            Ok(HandlerReport {
                rows: payloads.len() as u64,
                counter_updates: 0,
            })
        });

        assert!(table.contains("votes", OperationKind::Create));
        assert!(table.get("votes", OperationKind::Delete).is_none());

        let handler = table.get("votes", OperationKind::Create).unwrap();
        let report = handler.handle(vec![1, 2, 3]).await.unwrap();
        assert_eq!(report.rows, 3);
    }

    #[test]
    fn test_routes_sorted() {
        let mut table: HandlerTable<u32> = HandlerTable::new();
        for (collection, kind) in [
            ("votes", OperationKind::Delete),
            ("follows", OperationKind::Create),
            ("votes", OperationKind::Create),
        ] {
            table.register_fn(collection, kind, |_: Vec<u32>| async { Ok(HandlerReport::default()) });
        }

        assert_eq!(
            table.routes(),
            vec![
                ("follows".to_string(), OperationKind::Create),
                ("votes".to_string(), OperationKind::Create),
                ("votes".to_string(), OperationKind::Delete),
            ]
        );
    }

    #[test]
    fn test_operation_kind_display() {
        assert_eq!(OperationKind::Create.to_string(), "create");
        assert_eq!(serde_json::to_string(&OperationKind::Delete).unwrap(), "\"delete\"");
    }
}
