use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::RwLock;

use super::{Filter, SnapshotStore, StoreError, StoredRecord};
use crate::types::ContainerRecord;

#[derive(Debug, Default)]
struct Inner {
    docs: Vec<StoredRecord>,
    next_key: u64,
}

/// In-memory document store, optionally persisted as newline-delimited JSON.
///
/// The file is loaded as-is on open, so a snapshot written by a racing
/// process may contain repeated ids. [`SnapshotStore::insert`] refuses to
/// create new duplicates.
#[derive(Debug)]
pub struct DocumentStore {
    path: Option<PathBuf>,
    inner: RwLock<Inner>,
}

impl DocumentStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Opens the store, loading `path` when it exists.
    pub async fn open(path: Option<PathBuf>) -> Result<Self, StoreError> {
        let Some(path) = path else {
            return Ok(Self::in_memory());
        };

        let docs = match tokio::fs::read_to_string(&path).await {
            Ok(content) => parse_documents(&path, &content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let next_key = docs.iter().map(|d| d.key + 1).max().unwrap_or(0);
        info!(
            "Loaded {} container records from {}",
            docs.len(),
            path.display()
        );

        Ok(Self {
            path: Some(path),
            inner: RwLock::new(Inner { docs, next_key }),
        })
    }

    async fn persist(&self, docs: &[StoredRecord]) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut content = String::new();
        for doc in docs {
            content.push_str(&serde_json::to_string(doc)?);
            content.push('\n');
        }

        let tmp = path.with_extension("tmp");
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        tokio::fs::write(&tmp, content).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        debug!("Persisted {} records to {}", docs.len(), path.display());
        Ok(())
    }
}

fn parse_documents(path: &Path, content: &str) -> Result<Vec<StoredRecord>, StoreError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })
        })
        .collect()
}

fn matching(docs: &[StoredRecord], filter: &Filter) -> Result<Vec<StoredRecord>, StoreError> {
    let mut found = Vec::new();
    for doc in docs {
        if filter.matches(&serde_json::to_value(&doc.record)?) {
            found.push(doc.clone());
        }
    }
    Ok(found)
}

#[async_trait]
impl SnapshotStore for DocumentStore {
    async fn find(&self, filter: &Filter) -> Result<Vec<StoredRecord>, StoreError> {
        let inner = self.inner.read().await;
        matching(&inner.docs, filter)
    }

    async fn insert(&self, records: Vec<ContainerRecord>) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.write().await;

        let mut seen: HashSet<&str> = inner.docs.iter().map(|d| d.record.id.as_str()).collect();
        for record in &records {
            if !seen.insert(record.id.as_str()) {
                return Err(StoreError::Duplicate(record.id.clone()));
            }
        }

        let mut docs = inner.docs.clone();
        let mut next_key = inner.next_key;
        let inserted = records.len();
        for record in records {
            docs.push(StoredRecord {
                key: next_key,
                record,
            });
            next_key += 1;
        }

        self.persist(&docs).await?;
        inner.docs = docs;
        inner.next_key = next_key;
        Ok(inserted)
    }

    async fn update(&self, records: Vec<ContainerRecord>) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.write().await;

        let mut docs = inner.docs.clone();
        let mut next_key = inner.next_key;
        let updated = records.len();
        for record in records {
            match docs.iter_mut().find(|d| d.record.id == record.id) {
                Some(existing) => existing.record = record,
                None => {
                    docs.push(StoredRecord {
                        key: next_key,
                        record,
                    });
                    next_key += 1;
                }
            }
        }

        self.persist(&docs).await?;
        inner.docs = docs;
        inner.next_key = next_key;
        Ok(updated)
    }

    async fn remove(&self, keys: &[u64]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.write().await;

        let keys: HashSet<u64> = keys.iter().copied().collect();
        let docs: Vec<StoredRecord> = inner
            .docs
            .iter()
            .filter(|d| !keys.contains(&d.key))
            .cloned()
            .collect();
        let removed = inner.docs.len() - docs.len();

        self.persist(&docs).await?;
        inner.docs = docs;
        Ok(removed)
    }

    async fn count(&self, filter: &Filter) -> Result<usize, StoreError> {
        let inner = self.inner.read().await;
        Ok(matching(&inner.docs, filter)?.len())
    }
}
