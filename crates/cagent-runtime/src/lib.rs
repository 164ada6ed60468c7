//! Execution runtime abstraction for cagent
//!
//! The lifecycle core drives containers only through [`ContainerRuntime`]; it
//! never knows which backend is active.

mod docker;
mod error;
pub mod labels;
mod types;

pub use docker::DockerRuntime;
pub use error::*;
pub use labels::LabelFilter;
pub use nix::sys::signal::Signal;
pub use types::*;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Capability set of a container backend
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make the image available locally, pulling it if needed
    async fn pull_image(&self, req: &PullImage, sink: &dyn EventSink) -> Result<()>;

    /// Create (but do not start) the backend container for `id`
    async fn create_container(
        &self,
        id: &ContainerId,
        spec: &RunSpec,
        sink: &dyn EventSink,
    ) -> Result<RuntimeId>;

    /// Start a created container.
    ///
    /// The returned waiter stays live until the container exits or
    /// `wait_token` is cancelled.
    async fn run_container(
        &self,
        id: &RuntimeId,
        wait_token: CancellationToken,
        sink: &dyn EventSink,
    ) -> Result<RunningContainer>;

    /// Deliver a signal to a running container
    async fn signal_container(&self, id: &RuntimeId, signal: Signal) -> Result<()>;

    /// Remove a container
    async fn remove_container(&self, id: &RuntimeId, force: bool) -> Result<()>;

    /// Containers matching `filter`, keyed by the scheduler container id label
    async fn list_running_containers(
        &self,
        filter: &LabelFilter,
    ) -> Result<HashMap<ContainerId, RuntimeContainer>>;

    /// Find the backend container for `id` again after an agent restart
    async fn reattach_container(
        &self,
        id: &ContainerId,
        wait_token: CancellationToken,
    ) -> Result<Reattached>;

    /// Get runtime information
    fn info(&self) -> RuntimeInfo;
}

/// Factory function to create a runtime based on type
pub async fn create_runtime(
    runtime_type: RuntimeType,
    config: &cagent_config::AgentConfig,
) -> Result<Arc<dyn ContainerRuntime>> {
    match runtime_type {
        RuntimeType::Docker => {
            let socket = config.runtime.docker.expanded();
            let runtime = DockerRuntime::new(&socket).await?;
            Ok(Arc::new(runtime))
        }
        RuntimeType::Podman => {
            // Podman is driven through its Docker-compatible API
            let socket = config.runtime.podman.expanded();
            let runtime = DockerRuntime::new_podman(&socket).await?;
            Ok(Arc::new(runtime))
        }
    }
}

/// Create the runtime named by `[runtime] kind`
pub async fn create_default_runtime(
    config: &cagent_config::AgentConfig,
) -> Result<Arc<dyn ContainerRuntime>> {
    let runtime_type: RuntimeType = config
        .runtime
        .kind
        .parse()
        .map_err(RuntimeError::ConfigError)?;
    tracing::debug!("Using {} runtime", runtime_type);
    create_runtime(runtime_type, config).await
}
