use super::{ContainerRuntime, RuntimeError};
use crate::types::{DaemonEvent, RELEVANT_STATUSES};
use anyhow::Result;
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary, EventMessage};
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, info};

/// Seconds before an idle request to the daemon socket times out.
const SOCKET_TIMEOUT_SECS: u64 = 120;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the daemon on `socket_path`, or on the platform's local
    /// defaults (`DOCKER_HOST`, then the unix socket on Linux) when unset.
    pub fn connect(socket_path: Option<&str>) -> Result<Self> {
        let docker = match socket_path {
            Some(path) => {
                info!("Connecting to Docker daemon at {}", path);
                Docker::connect_with_socket(path, SOCKET_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            None => {
                info!("Connecting to Docker daemon using local defaults");
                Docker::connect_with_local_defaults()?
            }
        };
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        Ok(self.docker.list_containers(Some(opts)).await?)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, RuntimeError> {
        Ok(self.docker.inspect_container(id, None).await?)
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError> {
        debug!("Restarting container {}", id);
        Ok(self.docker.restart_container(id, None).await?)
    }

    fn events(&self) -> BoxStream<'static, Result<DaemonEvent, RuntimeError>> {
        let opts = EventsOptions::<String> {
            filters: [
                ("type", ["container"].as_slice()),
                ("event", RELEVANT_STATUSES.as_slice()),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect(),
            ..Default::default()
        };

        self.docker
            .events(Some(opts))
            .map(|msg| match msg {
                Ok(event) => to_daemon_event(event),
                Err(e) => Err(RuntimeError::Docker(e)),
            })
            .boxed()
    }
}

fn to_daemon_event(event: EventMessage) -> Result<DaemonEvent, RuntimeError> {
    let status = event
        .action
        .filter(|a| !a.is_empty())
        .ok_or_else(|| RuntimeError::MalformedEvent("event without action".into()))?;
    let kind = event.typ.map(|t| t.to_string()).unwrap_or_default();

    let (daemon_id, actor_name) = match event.actor {
        Some(actor) => {
            let name = actor
                .attributes
                .as_ref()
                .and_then(|attrs| attrs.get("name").cloned());
            (actor.id.unwrap_or_default(), name)
        }
        None => (String::new(), None),
    };

    Ok(DaemonEvent {
        daemon_id,
        status,
        kind,
        actor_name,
    })
}
