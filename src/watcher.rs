//! Template source watching.
//!
//! Parent directories are watched rather than the files themselves, so
//! editors that save by replacing the file are still noticed. Bursts of
//! events for one file are collapsed: a change is reported once the file
//! has been quiet for the debounce window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Collapses repeated changes per path until they settle.
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Records a change, pushing the path's deadline back by one window.
    fn touch(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path, now + self.window);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Removes and returns every path whose deadline has passed.
    fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &due {
            self.pending.remove(path);
        }
        due.sort();
        due
    }
}

pub struct SourceWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
    watched: usize,
}

impl SourceWatcher {
    /// Starts watching `sources`, sending each settled change on `changed`
    /// as the path it was configured with.
    pub fn spawn(
        sources: &[PathBuf],
        debounce: Duration,
        changed: mpsc::UnboundedSender<PathBuf>,
    ) -> notify::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;

        // A source whose directory cannot be watched is reported and skipped.
        let mut watched: HashMap<PathBuf, PathBuf> = HashMap::new();
        for source in sources {
            let resolved = resolve(source);
            if let Some(dir) = resolved.parent() {
                if !watched.values().any(|p| p.parent() == Some(dir)) {
                    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                        error!("Cannot watch template {}: {}", source.display(), e);
                        continue;
                    }
                    debug!("Watching {}", dir.display());
                }
            }
            watched.insert(source.clone(), resolved);
        }
        info!("Watching {} template sources", watched.len());

        // Resolved path -> configured path.
        let lookup: HashMap<PathBuf, PathBuf> =
            watched.into_iter().map(|(orig, res)| (res, orig)).collect();
        let count = lookup.len();
        let task = tokio::spawn(run(rx, lookup, Debouncer::new(debounce), changed));

        Ok(Self {
            _watcher: watcher,
            task,
            watched: count,
        })
    }

    /// Number of sources actually being watched.
    pub fn watched(&self) -> usize {
        self.watched
    }
}

impl Drop for SourceWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn resolve(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    // Not created yet: anchor it to a canonical parent.
    let absolute = std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf());
    match (absolute.parent(), absolute.file_name()) {
        (Some(dir), Some(name)) => std::fs::canonicalize(dir)
            .map(|dir| dir.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

async fn run(
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    lookup: HashMap<PathBuf, PathBuf>,
    mut debouncer: Debouncer,
    changed: mpsc::UnboundedSender<PathBuf>,
) {
    loop {
        let deadline = debouncer.next_deadline();
        tokio::select! {
            event = events.recv() => match event {
                Some(Ok(event)) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        continue;
                    }
                    for path in &event.paths {
                        if lookup.contains_key(path) {
                            debouncer.touch(path.clone(), Instant::now());
                        }
                    }
                }
                Some(Err(e)) => error!("File watcher error: {}", e),
                None => break,
            },
            _ = async {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                for path in debouncer.take_due(Instant::now()) {
                    let Some(source) = lookup.get(&path) else { continue };
                    if changed.send(source.clone()).is_err() {
                        return;
                    }
                }
            }
        }
    }
}
