//! Scripted daemon used by the registry and generator tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bollard::models::{
    ContainerConfig, ContainerInspectResponse, ContainerSummary, EndpointSettings, NetworkSettings,
};
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::types::DaemonEvent;

pub type EventSender = mpsc::UnboundedSender<Result<DaemonEvent, RuntimeError>>;

#[derive(Default)]
pub struct MockRuntime {
    containers: Mutex<Vec<ContainerInspectResponse>>,
    failing_inspect: Mutex<HashSet<String>>,
    failing_restart: Mutex<HashSet<String>>,
    restarts: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Result<DaemonEvent, RuntimeError>>>>,
    inspect_delay: Option<Duration>,
    panic_on_list: AtomicBool,
    inspecting: AtomicUsize,
    pub inspect_peak: AtomicUsize,
    pub list_calls: AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect calls sleep for `delay`, giving concurrent triggers a chance
    /// to interleave.
    pub fn with_inspect_delay(delay: Duration) -> Self {
        Self {
            inspect_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_containers(&self, containers: Vec<ContainerInspectResponse>) {
        *self.containers.lock().unwrap() = containers;
    }

    pub fn fail_inspect(&self, daemon_id: &str) {
        self.failing_inspect.lock().unwrap().insert(daemon_id.to_string());
    }

    pub fn fail_restart(&self, name: &str) {
        self.failing_restart.lock().unwrap().insert(name.to_string());
    }

    /// The next listing panics instead of answering.
    pub fn panic_on_next_list(&self) {
        self.panic_on_list.store(true, Ordering::SeqCst);
    }

    pub fn restarts(&self) -> Vec<String> {
        let mut restarts = self.restarts.lock().unwrap().clone();
        restarts.sort();
        restarts
    }

    /// Hands out the sending side of the event stream returned by `events()`.
    pub fn event_sender(&self) -> EventSender {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_list.swap(false, Ordering::SeqCst) {
            panic!("daemon listing exploded");
        }
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                ..Default::default()
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, RuntimeError> {
        let now = self.inspecting.fetch_add(1, Ordering::SeqCst) + 1;
        self.inspect_peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.inspect_delay {
            tokio::time::sleep(delay).await;
        }
        self.inspecting.fetch_sub(1, Ordering::SeqCst);
        if self.failing_inspect.lock().unwrap().contains(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id.as_deref() == Some(id))
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.restarts.lock().unwrap().push(id.to_string());
        if self.failing_restart.lock().unwrap().contains(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn events(&self) -> BoxStream<'static, Result<DaemonEvent, RuntimeError>> {
        match self.events.lock().unwrap().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed(),
            None => stream::pending().boxed(),
        }
    }
}

/// Builds an inspect document with one network and a TCP port.
pub fn container(daemon_id: &str, name: &str, ip: &str, env: &[&str]) -> ContainerInspectResponse {
    ContainerInspectResponse {
        id: Some(daemon_id.to_string()),
        name: Some(name.to_string()),
        config: Some(ContainerConfig {
            env: Some(env.iter().map(|e| e.to_string()).collect()),
            ..Default::default()
        }),
        network_settings: Some(NetworkSettings {
            ports: Some(HashMap::from([("80/tcp".to_string(), None)])),
            networks: Some(HashMap::from([(
                "bridge".to_string(),
                EndpointSettings {
                    ip_address: Some(ip.to_string()),
                    ..Default::default()
                },
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn daemon_event(daemon_id: &str, status: &str) -> DaemonEvent {
    DaemonEvent {
        daemon_id: daemon_id.to_string(),
        status: status.to_string(),
        kind: "container".to_string(),
        actor_name: None,
    }
}

/// A 64-character daemon id made of one repeated character.
pub fn daemon_id(c: char) -> String {
    c.to_string().repeat(64)
}
