//! Entity-count maintenance driven by create/delete events.

use std::collections::BTreeMap;

use pumpkin_core::{CounterAction, CounterKind};
use pumpkin_storage::{DocumentStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterEvent {
    pub kind: CounterKind,
    pub action: CounterAction,
}

impl CounterEvent {
    pub fn new(kind: CounterKind, action: CounterAction) -> Self {
        Self { kind, action }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterValue {
    pub kind: CounterKind,
    pub value: u64,
}

/// Apply one event as an atomic increment. Deletes never take a counter below zero.
pub async fn apply_counter_event(
    store: &dyn DocumentStore,
    event: CounterEvent,
) -> Result<CounterValue, StoreError> {
    let value = store
        .increment_counter(event.kind, event.action.delta())
        .await?;
    info!(
        counter = event.kind.field(),
        action = ?event.action,
        value,
        "counter updated"
    );
    Ok(CounterValue {
        kind: event.kind,
        value,
    })
}

/// Current value of every counter, keyed by persisted field name.
pub async fn read_counters(store: &dyn DocumentStore) -> Result<BTreeMap<&'static str, u64>, StoreError> {
    let mut out = BTreeMap::new();
    for kind in CounterKind::ALL {
        out.insert(kind.field(), store.read_counter(kind).await?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pumpkin_storage::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn create_then_delete_round_trips_to_zero() {
        let store = MemoryStore::new();
        let created = CounterEvent::new(CounterKind::Pumpkins, CounterAction::Created);
        let deleted = CounterEvent::new(CounterKind::Pumpkins, CounterAction::Deleted);

        assert_eq!(apply_counter_event(&store, created).await.unwrap().value, 1);
        assert_eq!(apply_counter_event(&store, deleted).await.unwrap().value, 0);
        assert_eq!(apply_counter_event(&store, deleted).await.unwrap().value, 0);
    }

    #[tokio::test]
    async fn concurrent_creates_are_all_counted() {
        let store = Arc::new(MemoryStore::new());
        let handles = (0..25)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let event = CounterEvent::new(CounterKind::Users, CounterAction::Created);
                    apply_counter_event(store.as_ref(), event).await
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.expect("join").expect("increment");
        }

        let counters = read_counters(store.as_ref()).await.unwrap();
        assert_eq!(counters["userCount"], 25);
        assert_eq!(counters["pumpkinCount"], 0);
        assert_eq!(counters["measurementCount"], 0);
    }
}
