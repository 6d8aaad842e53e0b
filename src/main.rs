//! Dockgen daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};

use dockgen::cli::Cli;
use dockgen::config::Config;
use dockgen::generator::{Generator, GeneratorEvent};
use dockgen::registry::Registry;
use dockgen::runtime::{ContainerRuntime, DockerRuntime};
use dockgen::store::DocumentStore;
use dockgen::template::MiniJinjaEngine;
use dockgen::types::RegistryEvent;
use dockgen::watcher::SourceWatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cli = Cli::parse();
    let cfg = Config::load(&cli)?;
    info!("Starting dockgen with config: {:?}", cfg);
    let mappings = cfg.mappings()?;

    // Container runtime (Docker) and snapshot store
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect(cfg.socket_path.as_deref())?);
    let store = Arc::new(DocumentStore::open(cfg.database.filename.clone()).await?);

    let registry = Registry::new(Arc::clone(&runtime), store);
    let generator = Generator::new(
        mappings,
        Arc::clone(&registry),
        Some(Arc::clone(&runtime)),
        MiniJinjaEngine,
    );

    // Subscribe before anything can emit.
    let registry_errors = registry.subscribe();
    let generator_events = generator.subscribe();
    let changes = registry.subscribe();

    let log_handle = tokio::spawn(log_notifications(registry_errors, generator_events));

    let follow_handle = tokio::spawn(Arc::clone(&generator).follow(changes));

    // Template sources
    let (changed_tx, changed_rx) = mpsc::unbounded_channel();
    let sources: Vec<PathBuf> = generator.mappings().iter().map(|m| m.source.clone()).collect();
    let _source_watcher = match SourceWatcher::spawn(&sources, cfg.watch_debounce(), changed_tx) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            error!("Template sources will not be watched: {}", err);
            None
        }
    };
    let sources_handle = tokio::spawn(Arc::clone(&generator).follow_sources(changed_rx));

    // Docker events
    let watch_handle = tokio::spawn(Arc::clone(&registry).watch(cfg.event_reconnect()));

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    watch_handle.abort();
    sources_handle.abort();
    follow_handle.abort();
    log_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}

/// Drains both notification channels. Errors were already logged when they
/// were raised; this reports generation results and dropped notifications.
async fn log_notifications(
    mut registry: broadcast::Receiver<RegistryEvent>,
    mut generator: broadcast::Receiver<GeneratorEvent>,
) {
    loop {
        tokio::select! {
            event = registry.recv() => match event {
                Ok(RegistryEvent::Change(change)) => {
                    info!(
                        "Containers changed ({}): {} created, {} updated, {} removed",
                        change.status().unwrap_or("resync"),
                        change.created,
                        change.updated,
                        change.removed
                    );
                }
                Ok(RegistryEvent::Error(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    error!("Dropped {} registry notifications", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = generator.recv() => match event {
                Ok(GeneratorEvent::Generated(report)) if !report.written.is_empty() => {
                    info!("Regenerated {:?}", report.written);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    error!("Dropped {} generator notifications", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
