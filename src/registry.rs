//! Container registry.
//!
//! The registry mirrors the daemon's running containers into the snapshot
//! store. Each reconciliation pass diffs the live container set against the
//! stored one, applies the difference, and publishes a
//! [`RegistryEvent::Change`] when something changed (or on the very first
//! pass). Passes are serialized; failures become
//! [`RegistryEvent::Error`] notifications and never reach the caller.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::serializer::{PassHandle, Serializer};
use crate::store::{Filter, SnapshotStore, StoredRecord};
use crate::types::{ChangeEvent, ContainerRecord, DaemonEvent, RegistryEvent};

/// Capacity of the notification channel.
const EVENT_BUFFER: usize = 256;

/// Result of comparing the live container set with the stored one.
#[derive(Debug, Default)]
pub struct ReconciliationDiff {
    pub created: BTreeMap<String, ContainerRecord>,
    pub updated: BTreeMap<String, ContainerRecord>,
    pub removed: BTreeMap<String, StoredRecord>,
}

impl ReconciliationDiff {
    /// Classifies every live record against the stored index.
    pub fn compute(stored: Vec<StoredRecord>, live: Vec<ContainerRecord>) -> Self {
        let mut remaining: BTreeMap<String, StoredRecord> = stored
            .into_iter()
            .map(|doc| (doc.record.id.clone(), doc))
            .collect();
        let mut diff = Self::default();

        for record in live {
            match remaining.remove(&record.id) {
                Some(doc) if doc.record.content_hash != record.content_hash => {
                    diff.updated.insert(record.id.clone(), record);
                }
                Some(_) => {}
                None => {
                    diff.created.insert(record.id.clone(), record);
                }
            }
        }

        diff.removed = remaining;
        diff
    }
}

/// Counts produced by one applied pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub total_in_store: usize,
    pub total_in_daemon: usize,
}

pub struct Registry {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn SnapshotStore>,
    serializer: Serializer,
    initialized: AtomicBool,
    events: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, store: Arc<dyn SnapshotStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let panics = events.clone();
        Arc::new(Self {
            runtime,
            store,
            serializer: Serializer::new("reconciliation", move |err| {
                let _ = panics.send(RegistryEvent::Error(Arc::new(err)));
            }),
            initialized: AtomicBool::new(false),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// True once the first reconciliation pass has completed successfully.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub async fn find(&self, filter: &Filter) -> Result<Vec<ContainerRecord>> {
        let docs = self.store.find(filter).await?;
        Ok(docs.into_iter().map(|doc| doc.record).collect())
    }

    /// Runs one reconciliation pass behind any pass already in flight and
    /// waits for it to settle.
    pub async fn reconcile(self: &Arc<Self>, trigger: Option<DaemonEvent>) {
        self.schedule(trigger).await;
    }

    /// Queues a reconciliation pass and returns a handle that settles with it.
    pub fn schedule(self: &Arc<Self>, trigger: Option<DaemonEvent>) -> PassHandle {
        let this = Arc::clone(self);
        self.serializer.schedule(async move {
            if let Err(e) = this.run_pass(trigger).await {
                this.emit_error(e);
            }
        })
    }

    /// Queues a reconciliation pass without waiting for it.
    pub fn trigger(self: &Arc<Self>, trigger: Option<DaemonEvent>) {
        let _ = self.schedule(trigger);
    }

    /// Resolves once all passes scheduled so far have settled.
    pub fn idle(&self) -> PassHandle {
        self.serializer.idle()
    }

    /// Follows the daemon event stream, reconciling on every relevant event.
    /// A full pass runs on each (re)subscription so nothing missed while
    /// disconnected goes unnoticed. Never returns.
    pub async fn watch(self: Arc<Self>, reconnect_delay: Duration) {
        loop {
            self.trigger(None);

            let mut stream = self.runtime.events();
            info!("Listening for Docker events...");
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(event) if event.is_relevant() => {
                        debug!("Container event: {} for {}", event.status, event.daemon_id);
                        self.trigger(Some(event));
                    }
                    Ok(event) => {
                        debug!("Ignoring {} event {}", event.kind, event.status);
                    }
                    Err(RuntimeError::MalformedEvent(msg)) => {
                        self.emit_error(Error::Parse(msg));
                    }
                    Err(e) => {
                        self.emit_error(e.into());
                        break;
                    }
                }
            }

            warn!(
                "Docker event stream ended. Reconnecting in {:?}...",
                reconnect_delay
            );
            sleep(reconnect_delay).await;
        }
    }

    async fn run_pass(&self, trigger: Option<DaemonEvent>) -> Result<PassSummary> {
        debug!("Update container list start");
        let stored = self.load_unique().await?;

        let summaries = self.runtime.list_containers().await?;
        let total_in_daemon = summaries.len();
        let mut live = Vec::with_capacity(total_in_daemon);
        for summary in summaries {
            let Some(id) = summary.id else {
                warn!("Skipping container without id in daemon listing");
                continue;
            };
            let detail = self.runtime.inspect_container(&id).await?;
            live.push(ContainerRecord::compose(&detail));
        }

        let diff = ReconciliationDiff::compute(stored, live);
        let summary = self.apply(diff, total_in_daemon).await?;

        let first_pass = !self.is_initialized();
        debug!(
            "created: {}, updated: {}, removed: {}, total in store: {}, total in docker: {}",
            summary.created,
            summary.updated,
            summary.removed,
            summary.total_in_store,
            summary.total_in_daemon
        );

        if summary.created > 0 || summary.updated > 0 || summary.removed > 0 || first_pass {
            info!(
                "Containers list has been changed (created: {}, updated: {}, removed: {})",
                summary.created, summary.updated, summary.removed
            );
            self.emit(RegistryEvent::Change(ChangeEvent {
                trigger,
                created: summary.created,
                updated: summary.updated,
                removed: summary.removed,
                is_initialization: first_pass,
            }));
        }

        self.initialized.store(true, Ordering::SeqCst);
        debug!("Update container list end");
        Ok(summary)
    }

    /// Loads every stored record, first dropping repeated ids so the index
    /// built from them is unique. The first stored copy of an id survives.
    async fn load_unique(&self) -> Result<Vec<StoredRecord>> {
        let docs = self.store.find(&Filter::all()).await?;

        let mut seen = HashSet::new();
        let duplicates: Vec<u64> = docs
            .iter()
            .filter(|doc| !seen.insert(doc.record.id.clone()))
            .map(|doc| doc.key)
            .collect();

        if duplicates.is_empty() {
            return Ok(docs);
        }

        warn!("Removing {} duplicated container records", duplicates.len());
        self.store.remove(&duplicates).await?;
        Ok(self.store.find(&Filter::all()).await?)
    }

    /// Writes the diff: removals, then updates, then creations, so an id
    /// that disappeared and came back in one pass never collides.
    async fn apply(&self, diff: ReconciliationDiff, total_in_daemon: usize) -> Result<PassSummary> {
        let mut summary = PassSummary {
            total_in_daemon,
            ..PassSummary::default()
        };

        if !diff.removed.is_empty() {
            let keys: Vec<u64> = diff.removed.values().map(|doc| doc.key).collect();
            debug!("Removing containers {:?}", diff.removed.keys().collect::<Vec<_>>());
            summary.removed = self.store.remove(&keys).await?;
        }
        if !diff.updated.is_empty() {
            summary.updated = self.store.update(diff.updated.into_values().collect()).await?;
        }
        if !diff.created.is_empty() {
            summary.created = self.store.insert(diff.created.into_values().collect()).await?;
        }

        summary.total_in_store = self.store.count(&Filter::all()).await?;
        Ok(summary)
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscriber is not an error.
        let _ = self.events.send(event);
    }

    fn emit_error(&self, err: Error) {
        error!("Container registry error: {}", err);
        self.emit(RegistryEvent::Error(Arc::new(err)));
    }
}
