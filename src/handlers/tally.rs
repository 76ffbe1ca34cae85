//! Counter tally - fold per-row deltas into one adjustment per key

use std::collections::BTreeMap;

use crate::store::CounterDelta;

/// Accumulates signed counter deltas per `(collection, entity, field)`.
///
/// Handlers feed one entry per payload; [`into_batches`](Self::into_batches)
/// yields one list per aggregate collection so each collection costs a single
/// bulk call. Keys that net to zero are dropped.
#[derive(Debug, Default)]
pub struct CounterTally {
    deltas: BTreeMap<(String, String, String), i64>,
}

impl CounterTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, collection: &str, entity_id: &str, field: &str, delta: i64) {
        *self
            .deltas
            .entry((collection.to_string(), entity_id.to_string(), field.to_string()))
            .or_insert(0) += delta;
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.values().all(|d| *d == 0)
    }

    /// Deltas grouped by aggregate collection, in key order
    pub fn into_batches(self) -> Vec<(String, Vec<CounterDelta>)> {
        let mut batches: BTreeMap<String, Vec<CounterDelta>> = BTreeMap::new();
        for ((collection, entity_id, field), delta) in self.deltas {
            if delta == 0 {
                continue;
            }
            batches.entry(collection).or_default().push(CounterDelta {
                entity_id,
                field,
                delta,
            });
        }
        batches.into_iter().collect()
    }
}
