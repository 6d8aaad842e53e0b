//! Configuration generator.
//!
//! A generation pass walks every template mapping, renders it against the
//! current snapshot, writes the destination only when the rendered content
//! hash differs from the file on disk, and finally restarts each dependent
//! service at most once. Passes are serialized the same way as registry
//! passes; errors are published as [`GeneratorEvent::Error`] per mapping
//! and never abort the rest of the pass.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};

use crate::error::{Error, Result};
use crate::mapping::TemplateMapping;
use crate::registry::Registry;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::serializer::{PassHandle, Serializer};
use crate::store::Filter;
use crate::template::{RenderContext, TemplateEngine, TemplateQueries};
use crate::types::{ChangeEvent, ContainerRecord, RegistryEvent};

const EVENT_BUFFER: usize = 64;

/// What caused a generation pass.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// The registry reported a change.
    Containers(ChangeEvent),
    /// A template source file was modified.
    SourceChanged(PathBuf),
    /// Regeneration without a specific cause, e.g. after missed notifications.
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationReport {
    pub rendered: usize,
    pub written: Vec<PathBuf>,
    pub restarted: Vec<String>,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub enum GeneratorEvent {
    Generated(GenerationReport),
    Error(Arc<Error>),
}

/// Outcome of rendering one mapping.
#[derive(Debug)]
struct RenderOutcome {
    content: String,
    hash: String,
    previous_hash: Option<String>,
}

impl RenderOutcome {
    fn changed(&self) -> bool {
        self.previous_hash.as_deref() != Some(self.hash.as_str())
    }
}

/// Container queries exposed to templates.
struct ContainerQueries {
    registry: Arc<Registry>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
}

#[async_trait]
impl TemplateQueries for ContainerQueries {
    async fn containers(&self, filter: Filter) -> Result<Vec<ContainerRecord>> {
        self.registry.find(&filter).await
    }

    async fn inspect(&self, id: &str) -> Result<serde_json::Value> {
        let runtime = self.runtime.as_ref().ok_or(RuntimeError::NotConfigured)?;
        let detail = runtime.inspect_container(id).await?;
        serde_json::to_value(detail).map_err(|e| Error::Parse(e.to_string()))
    }
}

pub struct Generator<E: TemplateEngine> {
    mappings: Vec<TemplateMapping>,
    registry: Arc<Registry>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    queries: Arc<ContainerQueries>,
    engine: Arc<E>,
    /// Compiled templates keyed by source path, with the source hash they
    /// were compiled from.
    compiled: Mutex<HashMap<PathBuf, (String, E::Compiled)>>,
    serializer: Serializer,
    events: broadcast::Sender<GeneratorEvent>,
}

impl<E: TemplateEngine> Generator<E> {
    pub fn new(
        mappings: Vec<TemplateMapping>,
        registry: Arc<Registry>,
        runtime: Option<Arc<dyn ContainerRuntime>>,
        engine: E,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let panics = events.clone();
        let queries = Arc::new(ContainerQueries {
            registry: Arc::clone(&registry),
            runtime: runtime.clone(),
        });
        Arc::new(Self {
            mappings,
            registry,
            runtime,
            queries,
            engine: Arc::new(engine),
            compiled: Mutex::new(HashMap::new()),
            serializer: Serializer::new("generation", move |err| {
                let _ = panics.send(GeneratorEvent::Error(Arc::new(err)));
            }),
            events,
        })
    }

    pub fn mappings(&self) -> &[TemplateMapping] {
        &self.mappings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GeneratorEvent> {
        self.events.subscribe()
    }

    /// Runs one generation pass behind any pass in flight and waits for it.
    pub async fn regenerate(self: &Arc<Self>, trigger: Trigger) {
        self.schedule(trigger).await;
    }

    /// Queues a generation pass and returns a handle that settles with it.
    pub fn schedule(self: &Arc<Self>, trigger: Trigger) -> PassHandle {
        let this = Arc::clone(self);
        self.serializer.schedule(async move {
            let report = this.run_pass(&trigger).await;
            info!(
                "Generation finished: {} rendered, {} written, {} restarted, {} failed",
                report.rendered,
                report.written.len(),
                report.restarted.len(),
                report.failed
            );
            this.emit(GeneratorEvent::Generated(report));
        })
    }

    /// Queues a generation pass without waiting for it.
    pub fn trigger(self: &Arc<Self>, trigger: Trigger) {
        let _ = self.schedule(trigger);
    }

    pub fn idle(&self) -> PassHandle {
        self.serializer.idle()
    }

    /// Regenerates on every registry change. When notifications were
    /// dropped because this subscriber fell behind, one full pass makes up
    /// for all of them.
    pub async fn follow(self: Arc<Self>, mut changes: broadcast::Receiver<RegistryEvent>) {
        loop {
            match changes.recv().await {
                Ok(RegistryEvent::Change(change)) => {
                    self.trigger(Trigger::Containers(change));
                }
                Ok(RegistryEvent::Error(_)) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} container notifications, regenerating", missed);
                    self.trigger(Trigger::Manual);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Regenerates whenever a watched template source changes.
    pub async fn follow_sources(self: Arc<Self>, mut changed: mpsc::UnboundedReceiver<PathBuf>) {
        while let Some(path) = changed.recv().await {
            info!("Template {} changed", path.display());
            self.trigger(Trigger::SourceChanged(path));
        }
    }

    async fn run_pass(&self, trigger: &Trigger) -> GenerationReport {
        debug!("Generation pass triggered by {:?}", trigger);
        let mut report = GenerationReport::default();
        let mut restarts = BTreeSet::new();

        // Last declared first.
        for mapping in self.mappings.iter().rev() {
            match self.process(mapping, trigger, &mut restarts).await {
                Ok(written) => {
                    report.rendered += 1;
                    report.written.extend(written);
                }
                Err(e) => {
                    report.failed += 1;
                    self.emit_error(e);
                }
            }
        }

        report.restarted = self.restart_all(restarts).await;
        report
    }

    /// Renders one mapping and records its service for restart when
    /// warranted. Returns the destination if it was rewritten.
    async fn process(
        &self,
        mapping: &TemplateMapping,
        trigger: &Trigger,
        restarts: &mut BTreeSet<String>,
    ) -> Result<Option<PathBuf>> {
        let mut eligible = self.restart_eligible(mapping, trigger).await;

        let previous_hash = match &mapping.destination {
            Some(dest) => file_hash(dest).await,
            None => None,
        };
        let content = self.render(&mapping.source).await?;
        let outcome = RenderOutcome {
            hash: content_hash(content.as_bytes()),
            content,
            previous_hash,
        };

        let mut written = None;
        if outcome.changed() {
            if let Some(dest) = &mapping.destination {
                tokio::fs::write(dest, &outcome.content)
                    .await
                    .map_err(|e| Error::io(dest, e))?;
                info!("Wrote {}", dest.display());
                written = Some(dest.clone());
            }
        } else {
            debug!("{} is unchanged, skipping write", mapping);
            eligible = false;
        }

        if let Some(service) = &mapping.service {
            if self.runtime.is_some() && eligible {
                restarts.insert(service.clone());
            }
        }
        Ok(written)
    }

    /// A restart is pointless when the container that triggered the pass is
    /// already the service's running container.
    async fn restart_eligible(&self, mapping: &TemplateMapping, trigger: &Trigger) -> bool {
        let (Some(service), Trigger::Containers(change)) = (&mapping.service, trigger) else {
            return true;
        };
        if change.is_initialization {
            return true;
        }
        let Some(daemon_id) = change.daemon_id() else {
            return true;
        };

        let filter = Filter::And(vec![
            Filter::eq("name", format!("/{}", service)),
            Filter::eq("daemonId", daemon_id),
        ]);
        match self.registry.find(&filter).await {
            Ok(found) if !found.is_empty() => {
                debug!(
                    "Service {} already runs container {}, no restart needed",
                    service, daemon_id
                );
                false
            }
            Ok(_) => true,
            Err(e) => {
                self.emit_error(e);
                true
            }
        }
    }

    async fn render(&self, source: &Path) -> Result<String> {
        let text = tokio::fs::read_to_string(source)
            .await
            .map_err(|e| Error::io(source, e))?;
        let compiled = self.compile(source, &text)?;

        let context = Arc::new(RenderContext::new(
            self.queries.clone(),
            Handle::current(),
        ));
        let engine = Arc::clone(&self.engine);
        let ctx = Arc::clone(&context);
        let rendered = tokio::task::spawn_blocking(move || engine.render(&compiled, ctx))
            .await
            .map_err(|e| render_error(source, e))?
            .map_err(|e| render_error(source, e));

        for err in context.take_errors() {
            self.emit_error(err);
        }
        rendered
    }

    /// Returns the compiled template for `source`, recompiling only when its
    /// content hash differs from the cached one.
    fn compile(&self, source: &Path, text: &str) -> Result<E::Compiled> {
        let hash = content_hash(text.as_bytes());
        let mut cache = self
            .compiled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some((cached_hash, compiled)) = cache.get(source) {
            if *cached_hash == hash {
                return Ok(compiled.clone());
            }
        }

        debug!("Compiling template {}", source.display());
        let name = source.to_string_lossy();
        let compiled = self
            .engine
            .compile(&name, text)
            .map_err(|e| render_error(source, e))?;
        cache.insert(source.to_path_buf(), (hash, compiled.clone()));
        Ok(compiled)
    }

    /// Restarts every service concurrently. A failed restart is reported on
    /// its own and does not affect the others.
    async fn restart_all(&self, services: BTreeSet<String>) -> Vec<String> {
        let Some(runtime) = &self.runtime else {
            return Vec::new();
        };

        let results = join_all(services.into_iter().map(|service| async move {
            info!("Restart container: {}", service);
            let result = runtime.restart_container(&service).await;
            (service, result)
        }))
        .await;

        let mut restarted = Vec::new();
        for (service, result) in results {
            match result {
                Ok(()) => restarted.push(service),
                Err(source) => self.emit_error(Error::Restart { service, source }),
            }
        }
        restarted
    }

    fn emit(&self, event: GeneratorEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, err: Error) {
        error!("Configuration generator error: {}", err);
        self.emit(GeneratorEvent::Error(Arc::new(err)));
    }
}

fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash of a file's content, or `None` when it is missing or unreadable.
async fn file_hash(path: &Path) -> Option<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(content_hash(&bytes)),
        Err(e) => {
            debug!("No previous content for {}: {}", path.display(), e);
            None
        }
    }
}

fn render_error(template: &Path, err: impl std::fmt::Display) -> Error {
    Error::Render {
        template: template.to_path_buf(),
        message: err.to_string(),
    }
}
