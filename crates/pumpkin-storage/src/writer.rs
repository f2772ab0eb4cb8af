use pumpkin_core::{Collection, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{DocumentStore, Mutation, StoreError, MAX_GROUP_OPERATIONS};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub queued: usize,
    pub committed: usize,
    pub skipped: usize,
    pub chunks: usize,
}

/// A chunk commit failed. Chunks before `chunk` stay committed.
#[derive(Debug, Error)]
#[error("chunk {chunk} ({size} mutations) failed after {committed} committed mutations: {source}")]
pub struct ChunkCommitError {
    pub chunk: usize,
    pub size: usize,
    pub committed: usize,
    #[source]
    pub source: StoreError,
}

/// Queues mutations and commits them in groups of at most `max_ops`.
///
/// Full chunks commit as soon as they fill; [`BatchedWriter::finish`] commits
/// the partial tail. The first failed chunk ends the write sequence.
pub struct BatchedWriter<'a> {
    store: &'a dyn DocumentStore,
    max_ops: usize,
    pending: Vec<Mutation>,
    summary: WriteSummary,
}

impl<'a> BatchedWriter<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self::with_max_ops(store, MAX_GROUP_OPERATIONS)
    }

    /// `max_ops` is clamped to `1..=MAX_GROUP_OPERATIONS`.
    pub fn with_max_ops(store: &'a dyn DocumentStore, max_ops: usize) -> Self {
        let max_ops = max_ops.clamp(1, MAX_GROUP_OPERATIONS);
        Self {
            store,
            max_ops,
            pending: Vec::with_capacity(max_ops),
            summary: WriteSummary::default(),
        }
    }

    pub fn max_ops(&self) -> usize {
        self.max_ops
    }

    pub async fn merge(
        &mut self,
        collection: Collection,
        raw_id: &str,
        fields: Map<String, Value>,
    ) -> Result<bool, ChunkCommitError> {
        self.merge_clearing(collection, raw_id, fields, &[]).await
    }

    pub async fn merge_clearing(
        &mut self,
        collection: Collection,
        raw_id: &str,
        fields: Map<String, Value>,
        clear: &[&str],
    ) -> Result<bool, ChunkCommitError> {
        let Some(id) = self.validate(collection, raw_id) else {
            return Ok(false);
        };
        let mutation = Mutation::merge(collection, id, fields).clearing(clear.iter().copied());
        self.push(mutation).await
    }

    pub async fn replace(
        &mut self,
        collection: Collection,
        raw_id: &str,
        fields: Map<String, Value>,
    ) -> Result<bool, ChunkCommitError> {
        let Some(id) = self.validate(collection, raw_id) else {
            return Ok(false);
        };
        self.push(Mutation::replace(collection, id, fields)).await
    }

    /// Commit the partial tail and return the totals.
    pub async fn finish(mut self) -> Result<WriteSummary, ChunkCommitError> {
        if !self.pending.is_empty() {
            self.flush_chunk().await?;
        }
        Ok(self.summary)
    }

    fn validate(&mut self, collection: Collection, raw_id: &str) -> Option<RecordId> {
        match RecordId::parse(raw_id) {
            Ok(id) => Some(id),
            Err(err) => {
                self.summary.skipped += 1;
                warn!(%collection, raw_id, error = %err, "skipping update with invalid record id");
                None
            }
        }
    }

    async fn push(&mut self, mutation: Mutation) -> Result<bool, ChunkCommitError> {
        self.pending.push(mutation);
        self.summary.queued += 1;
        if self.pending.len() >= self.max_ops {
            self.flush_chunk().await?;
        }
        Ok(true)
    }

    async fn flush_chunk(&mut self) -> Result<(), ChunkCommitError> {
        let chunk = std::mem::replace(&mut self.pending, Vec::with_capacity(self.max_ops));
        let index = self.summary.chunks;
        if let Err(source) = self.store.commit_group(&chunk).await {
            return Err(ChunkCommitError {
                chunk: index,
                size: chunk.len(),
                committed: self.summary.committed,
                source,
            });
        }
        self.summary.chunks += 1;
        self.summary.committed += chunk.len();
        debug!(
            chunk = index,
            size = chunk.len(),
            backend = self.store.backend_name(),
            "committed mutation chunk"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use serde_json::json;

    fn rank_fields(rank: usize) -> Map<String, Value> {
        json!({ "lifetimeGlobalRank": rank }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn chunks_never_exceed_the_group_limit() {
        let store = MemoryStore::new();
        let mut writer = BatchedWriter::new(&store);
        for i in 0..1201 {
            writer
                .merge(Collection::Pumpkins, &format!("p{i:04}"), rank_fields(i + 1))
                .await
                .expect("queue");
        }
        let summary = writer.finish().await.expect("finish");

        assert_eq!(store.committed_group_sizes().await, vec![500, 500, 201]);
        assert_eq!(summary.committed, 1201);
        assert_eq!(summary.chunks, 3);
        assert_eq!(store.len(Collection::Pumpkins).await, 1201);
    }

    #[tokio::test]
    async fn oversized_chunk_setting_is_clamped() {
        let store = MemoryStore::new();
        assert_eq!(BatchedWriter::with_max_ops(&store, 10_000).max_ops(), 500);
        assert_eq!(BatchedWriter::with_max_ops(&store, 0).max_ops(), 1);
    }

    #[tokio::test]
    async fn invalid_ids_are_skipped_not_fatal() {
        let store = MemoryStore::new();
        let mut writer = BatchedWriter::with_max_ops(&store, 2);
        assert!(!writer.merge(Collection::Growers, "", rank_fields(1)).await.unwrap());
        assert!(!writer.merge(Collection::Growers, "   ", rank_fields(1)).await.unwrap());
        assert!(writer.merge(Collection::Growers, "g1", rank_fields(1)).await.unwrap());
        let summary = writer.finish().await.unwrap();

        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.committed, 1);
        assert!(store.get(Collection::Growers, "g1").await.is_some());
    }

    #[tokio::test]
    async fn failed_chunk_aborts_remaining_writes() {
        let store = MemoryStore::new();
        store.fail_group_at(1);
        let mut writer = BatchedWriter::with_max_ops(&store, 3);

        let mut failure = None;
        for i in 0..10 {
            if let Err(err) = writer
                .merge(Collection::Pumpkins, &format!("p{i}"), rank_fields(i + 1))
                .await
            {
                failure = Some(err);
                break;
            }
        }

        let err = failure.expect("second chunk fails");
        assert_eq!(err.chunk, 1);
        assert_eq!(err.committed, 3);
        assert_eq!(store.committed_group_sizes().await, vec![3]);
        assert_eq!(store.len(Collection::Pumpkins).await, 3);
    }

    #[tokio::test]
    async fn empty_writer_commits_nothing() {
        let store = MemoryStore::new();
        let summary = BatchedWriter::new(&store).finish().await.unwrap();
        assert_eq!(summary, WriteSummary::default());
        assert!(store.committed_group_sizes().await.is_empty());
    }
}
