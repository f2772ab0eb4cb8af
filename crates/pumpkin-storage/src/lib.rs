//! Document store contracts, backends, and the chunked batch writer.

use async_trait::async_trait;
use pumpkin_core::{Collection, CounterKind, Document, RecordId};
use serde_json::{Map, Value};
use thiserror::Error;

mod memory;
mod postgres;
mod writer;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use writer::{BatchedWriter, ChunkCommitError, WriteSummary};

pub const CRATE_NAME: &str = "pumpkin-storage";

/// Largest mutation group the host store accepts in one atomic commit.
pub const MAX_GROUP_OPERATIONS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Merge the given fields into the existing document.
    Merge,
    /// Replace the whole document.
    Replace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub collection: Collection,
    pub id: RecordId,
    pub mode: WriteMode,
    pub fields: Map<String, Value>,
    /// Fields removed before `fields` is applied. Ignored in replace mode.
    pub clear: Vec<String>,
}

impl Mutation {
    pub fn merge(collection: Collection, id: RecordId, fields: Map<String, Value>) -> Self {
        Self {
            collection,
            id,
            mode: WriteMode::Merge,
            fields,
            clear: Vec::new(),
        }
    }

    pub fn replace(collection: Collection, id: RecordId, fields: Map<String, Value>) -> Self {
        Self {
            collection,
            id,
            mode: WriteMode::Replace,
            fields,
            clear: Vec::new(),
        }
    }

    pub fn clearing<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clear.extend(names.into_iter().map(Into::into));
        self
    }

    /// Apply this mutation to an in-memory field map.
    pub fn apply_to(&self, existing: &mut Map<String, Value>) {
        match self.mode {
            WriteMode::Replace => *existing = self.fields.clone(),
            WriteMode::Merge => {
                for name in &self.clear {
                    existing.remove(name);
                }
                for (k, v) in &self.fields {
                    existing.insert(k.clone(), v.clone());
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mutation group of {size} operations exceeds the limit of {limit}")]
    GroupTooLarge { size: usize, limit: usize },
    #[error("stored document {collection}/{id} is not a JSON object")]
    CorruptDocument { collection: Collection, id: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Backing store for competition documents.
///
/// Reads are whole-collection snapshots; no transaction spans separate
/// `load_collection` calls. Writes go through `commit_group`, which is atomic
/// for one group of at most [`MAX_GROUP_OPERATIONS`] mutations.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Every document of `collection`, ordered by ascending id.
    async fn load_collection(&self, collection: Collection) -> Result<Vec<Document>, StoreError>;

    async fn commit_group(&self, group: &[Mutation]) -> Result<(), StoreError>;

    /// Atomically add `delta` to a counter, flooring at zero. Returns the new value.
    async fn increment_counter(&self, kind: CounterKind, delta: i64) -> Result<u64, StoreError>;

    async fn read_counter(&self, kind: CounterKind) -> Result<u64, StoreError>;

    fn backend_name(&self) -> &'static str;
}

pub fn check_group_size(group: &[Mutation]) -> Result<(), StoreError> {
    if group.len() > MAX_GROUP_OPERATIONS {
        return Err(StoreError::GroupTooLarge {
            size: group.len(),
            limit: MAX_GROUP_OPERATIONS,
        });
    }
    Ok(())
}
