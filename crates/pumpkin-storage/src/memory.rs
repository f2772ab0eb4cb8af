use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use pumpkin_core::{Collection, CounterKind, Document, RecordId};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{check_group_size, DocumentStore, Mutation, StoreError};

type Documents = BTreeMap<String, Map<String, Value>>;

const NO_FAILURE: usize = usize::MAX;

/// In-process store used by tests and fixture-directory runs.
#[derive(Debug)]
pub struct MemoryStore {
    collections: RwLock<HashMap<Collection, Documents>>,
    group_sizes: Mutex<Vec<usize>>,
    group_attempts: AtomicUsize,
    fail_at_attempt: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            group_sizes: Mutex::new(Vec::new()),
            group_attempts: AtomicUsize::new(0),
            fail_at_attempt: AtomicUsize::new(NO_FAILURE),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, collection: Collection, id: impl Into<String>, fields: Value) {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.collections
            .write()
            .await
            .entry(collection)
            .or_default()
            .insert(id.into(), fields);
    }

    pub async fn get(&self, collection: Collection, id: &str) -> Option<Map<String, Value>> {
        self.collections
            .read()
            .await
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    pub async fn len(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .await
            .get(&collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Sizes of every group committed so far, in commit order.
    pub async fn committed_group_sizes(&self) -> Vec<usize> {
        self.group_sizes.lock().await.clone()
    }

    /// Make the `attempt`-th `commit_group` call (0-based, counted from now) fail.
    pub fn fail_group_at(&self, attempt: usize) {
        let base = self.group_attempts.load(Ordering::SeqCst);
        self.fail_at_attempt.store(base + attempt, Ordering::SeqCst);
    }

    /// Load `<collection>.json` arrays from `dir`. Missing files are empty collections.
    pub async fn load_json_dir(dir: &Path) -> anyhow::Result<Self> {
        let store = Self::new();
        for collection in Collection::ALL {
            let path = dir.join(format!("{}.json", collection.as_str()));
            if !fs::try_exists(&path)
                .await
                .with_context(|| format!("checking {}", path.display()))?
            {
                debug!(path = %path.display(), "fixture collection missing; treating as empty");
                continue;
            }
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let rows: Vec<Value> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;

            let mut docs = Documents::new();
            for row in rows {
                let Value::Object(mut fields) = row else {
                    warn!(%collection, "skipping fixture row that is not an object");
                    continue;
                };
                let raw_id = fields.remove("id").unwrap_or(Value::Null);
                match RecordId::from_json(&raw_id) {
                    Ok(id) => {
                        docs.insert(id.into_string(), fields);
                    }
                    Err(err) => warn!(%collection, error = %err, "skipping fixture row with invalid id"),
                }
            }
            store.collections.write().await.insert(collection, docs);
        }
        Ok(store)
    }

    /// Write every collection back as `<collection>.json` with the id inlined.
    pub async fn dump_json_dir(&self, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let snapshot = self.collections.read().await.clone();
        for (collection, docs) in snapshot {
            let rows = docs
                .into_iter()
                .map(|(id, fields)| {
                    let mut row = Map::new();
                    row.insert("id".to_string(), Value::String(id));
                    row.extend(fields);
                    Value::Object(row)
                })
                .collect::<Vec<_>>();
            let path = dir.join(format!("{}.json", collection.as_str()));
            let bytes = serde_json::to_vec_pretty(&rows)
                .with_context(|| format!("serializing {collection}"))?;
            fs::write(&path, bytes)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load_collection(&self, collection: Collection) -> Result<Vec<Document>, StoreError> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(&collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit_group(&self, group: &[Mutation]) -> Result<(), StoreError> {
        check_group_size(group)?;
        let attempt = self.group_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt == self.fail_at_attempt.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!(
                "injected failure on group attempt {attempt}"
            )));
        }

        let mut guard = self.collections.write().await;
        for mutation in group {
            let docs = guard.entry(mutation.collection).or_default();
            let existing = docs.entry(mutation.id.as_str().to_string()).or_default();
            mutation.apply_to(existing);
        }
        drop(guard);

        self.group_sizes.lock().await.push(group.len());
        Ok(())
    }

    async fn increment_counter(&self, kind: CounterKind, delta: i64) -> Result<u64, StoreError> {
        let mut guard = self.collections.write().await;
        let doc = guard
            .entry(Collection::Stats)
            .or_default()
            .entry(kind.document_id().to_string())
            .or_default();
        let current = doc.get(kind.field()).and_then(Value::as_i64).unwrap_or(0);
        let next = current.saturating_add(delta).max(0);
        doc.insert(kind.field().to_string(), Value::from(next));
        Ok(next as u64)
    }

    async fn read_counter(&self, kind: CounterKind) -> Result<u64, StoreError> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(&Collection::Stats)
            .and_then(|docs| docs.get(kind.document_id()))
            .and_then(|doc| doc.get(kind.field()))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn counters_floor_at_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.increment_counter(CounterKind::Users, -1).await.unwrap(), 0);
        assert_eq!(store.increment_counter(CounterKind::Users, 1).await.unwrap(), 1);
        assert_eq!(store.increment_counter(CounterKind::Users, 1).await.unwrap(), 2);
        assert_eq!(store.increment_counter(CounterKind::Users, -1).await.unwrap(), 1);
        assert_eq!(store.read_counter(CounterKind::Users).await.unwrap(), 1);
        assert_eq!(store.read_counter(CounterKind::Pumpkins).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn counters_live_in_named_stats_documents() {
        let store = MemoryStore::new();
        store.increment_counter(CounterKind::Users, 1).await.unwrap();
        store.increment_counter(CounterKind::Pumpkins, 1).await.unwrap();

        let users = store.get(Collection::Stats, "userStats").await.expect("userStats");
        assert_eq!(users.get("userCount"), Some(&json!(1)));
        assert!(store.get(Collection::Stats, "pumpkinStats").await.is_some());
        assert!(store.get(Collection::Stats, "users").await.is_none());
        assert!(store.get(Collection::Stats, "measurementStats").await.is_none());
    }

    #[tokio::test]
    async fn merge_keys_on_the_untrimmed_id() {
        let store = MemoryStore::new();
        store
            .insert(Collection::Pumpkins, " p1", json!({ "weight": 900.0, "year": 2023 }))
            .await;
        let id = RecordId::parse(" p1").unwrap();
        store
            .commit_group(&[Mutation::merge(
                Collection::Pumpkins,
                id,
                json!({ "lifetimeGlobalRank": 1 }).as_object().cloned().unwrap(),
            )])
            .await
            .unwrap();

        let doc = store.get(Collection::Pumpkins, " p1").await.expect("padded doc");
        assert_eq!(doc.get("weight"), Some(&json!(900.0)));
        assert_eq!(doc.get("lifetimeGlobalRank"), Some(&json!(1)));
        assert!(store.get(Collection::Pumpkins, "p1").await.is_none());
        assert_eq!(store.len(Collection::Pumpkins).await, 1);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment_counter(CounterKind::Measurements, 1).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("increment");
        }
        assert_eq!(store.read_counter(CounterKind::Measurements).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn injected_failure_leaves_earlier_groups_committed() {
        let store = MemoryStore::new();
        store.fail_group_at(1);
        let group = |id: &str| {
            vec![Mutation::merge(
                Collection::Growers,
                RecordId::parse(id).unwrap(),
                json!({ "bestRank": 1 }).as_object().cloned().unwrap(),
            )]
        };
        store.commit_group(&group("g1")).await.expect("first group");
        assert!(store.commit_group(&group("g2")).await.is_err());
        assert!(store.get(Collection::Growers, "g1").await.is_some());
        assert!(store.get(Collection::Growers, "g2").await.is_none());
        assert_eq!(store.committed_group_sizes().await, vec![1]);
    }

    #[tokio::test]
    async fn json_dir_round_trip_keeps_ids_and_skips_bad_rows() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("pumpkins.json"),
            serde_json::to_vec(&json!([
                { "id": "b", "weight": 80.0, "year": 2023 },
                { "id": "a", "weight": 50.0, "year": 2023 },
                { "id": 7, "weight": 10.0, "year": 2023 },
                { "weight": 10.0, "year": 2023 }
            ]))
            .unwrap(),
        )
        .unwrap();

        let store = MemoryStore::load_json_dir(dir.path()).await.expect("load");
        let docs = store.load_collection(Collection::Pumpkins).await.unwrap();
        assert_eq!(docs.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(store.load_collection(Collection::Growers).await.unwrap().is_empty());

        let out = tempdir().expect("tempdir");
        store.dump_json_dir(out.path()).await.expect("dump");
        let dumped: Vec<Value> =
            serde_json::from_str(&std::fs::read_to_string(out.path().join("pumpkins.json")).unwrap())
                .unwrap();
        assert_eq!(dumped[0]["id"], json!("a"));
        assert_eq!(dumped[1]["weight"], json!(80.0));
    }
}
