//! Error types for container runtimes

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Failed to connect to container runtime: {0}")]
    ConnectionError(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Container runtime error: {0}")]
    RuntimeError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Failed to publish runtime event: {0}")]
    EventSink(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::ContainerNotFound(message),
            other => Self::RuntimeError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
