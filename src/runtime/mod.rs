use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::types::ContainerDescriptor;

pub mod docker;
pub use docker::DockerRuntime;

#[cfg(test)]
pub mod fake;

/// The compose files and env file that define the managed stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeStack {
    pub files: Vec<PathBuf>,
    pub env_file: PathBuf,
}

/// Operations the reconciler needs from the local container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Full inspect document of a container, or [`RuntimeError::NotFound`].
    async fn inspect(&self, name: &str) -> Result<serde_json::Value, RuntimeError>;

    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;

    /// Removes a container, together with its anonymous volumes when
    /// `purge_volumes` is set.
    async fn remove(&self, name: &str, purge_volumes: bool) -> Result<(), RuntimeError>;

    /// All containers, running or not, whose name starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ContainerDescriptor>, RuntimeError>;

    /// Brings the whole stack up detached, recreating anything whose
    /// definition or image changed.
    async fn compose_up(&self, stack: &ComposeStack) -> Result<(), RuntimeError>;
}
