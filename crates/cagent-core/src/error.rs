//! Error types for cagent-core

use crate::ContainerFailure;
use cagent_config::DeviceId;
use cagent_runtime::{ContainerId, RuntimeError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] cagent_config::ConfigError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// A backend call failed at the named stage of a container's life
    #[error("{stage}: {source}")]
    Backend {
        stage: &'static str,
        source: RuntimeError,
    },

    #[error(transparent)]
    Failure(#[from] ContainerFailure),

    #[error("Container already exists: {0}")]
    ContainerExists(ContainerId),

    #[error("Device {0} is not in this agent's inventory")]
    UnknownDevice(DeviceId),

    #[error("Device {device} can't be exposed to the container: {reason}")]
    DeviceMapping { device: DeviceId, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failed to publish event: {0}")]
    Publish(String),
}

impl CoreError {
    pub(crate) fn backend(stage: &'static str) -> impl FnOnce(RuntimeError) -> Self {
        move |source| Self::Backend { stage, source }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
