use async_trait::async_trait;
use bollard::models::{ContainerInspectResponse, ContainerSummary};
use futures_util::stream::BoxStream;

use crate::types::DaemonEvent;

pub mod docker;
pub use docker::DockerRuntime;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),

    #[error("malformed daemon event: {0}")]
    MalformedEvent(String),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("no container daemon configured")]
    NotConfigured,
}

/// Gateway to the container daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Lists running containers.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, RuntimeError>;

    /// Restarts a container by id or name.
    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Subscribes to container lifecycle events. The stream ends when the
    /// daemon connection drops; callers resubscribe.
    fn events(&self) -> BoxStream<'static, Result<DaemonEvent, RuntimeError>>;
}
