//! Snapshot store for container records.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::ContainerRecord;

pub mod document;
pub mod filter;

pub use document::DocumentStore;
pub use filter::{Filter, QueryError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt document at {}:{line}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    /// Insert would break the uniqueness of `id`.
    #[error("container {0} is already stored")]
    Duplicate(String),
}

/// A record as held by the store, tagged with its internal key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    #[serde(rename = "_key")]
    pub key: u64,
    #[serde(flatten)]
    pub record: ContainerRecord,
}

/// Queryable document store holding one record per known container.
///
/// Every mutating operation is all-or-nothing: on error the store is left as
/// it was before the call.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn find(&self, filter: &Filter) -> Result<Vec<StoredRecord>, StoreError>;

    /// Inserts new records. Fails without writing anything if any `id` is
    /// already stored or repeated within the batch.
    async fn insert(&self, records: Vec<ContainerRecord>) -> Result<usize, StoreError>;

    /// Replaces records by `id`, inserting those not yet stored.
    async fn update(&self, records: Vec<ContainerRecord>) -> Result<usize, StoreError>;

    /// Removes records by internal key.
    async fn remove(&self, keys: &[u64]) -> Result<usize, StoreError>;

    async fn count(&self, filter: &Filter) -> Result<usize, StoreError>;
}
