//! Events published as containers move through their lifecycle

use crate::{CoreError, Result};
use async_trait::async_trait;
use cagent_runtime::{
    ContainerId, ContainerSummary, ExitCode, LogLevel, RuntimeContainerInfo,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Classification of a container's abnormal termination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    /// Pull, create or run failed, or the backend misbehaved
    TaskError,
    /// The workload exited non-zero
    ContainerFailed,
    /// Killed before it ever ran
    ContainerAborted,
    /// Nothing is known about the container any more
    ContainerMissing,
    /// Reattaching after an agent restart failed
    RestoreError,
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskError => write!(f, "task error"),
            Self::ContainerFailed => write!(f, "container failed"),
            Self::ContainerAborted => write!(f, "container aborted"),
            Self::ContainerMissing => write!(f, "container missing"),
            Self::RestoreError => write!(f, "restore error"),
        }
    }
}

/// Why a container stopped, when it did not stop cleanly
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{failure_type}: {err_msg}")]
pub struct ContainerFailure {
    pub failure_type: FailureType,
    pub err_msg: String,
    pub exit_code: Option<ExitCode>,
}

impl ContainerFailure {
    pub fn new(failure_type: FailureType, err_msg: impl Into<String>) -> Self {
        Self {
            failure_type,
            err_msg: err_msg.into(),
            exit_code: None,
        }
    }

    /// Failure for a workload that exited with a non-zero code
    pub fn exited(code: ExitCode) -> Self {
        Self {
            failure_type: FailureType::ContainerFailed,
            err_msg: format!("container failed with non-zero exit code: {}", code),
            exit_code: Some(code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStarted {
    pub info: RuntimeContainerInfo,
}

/// Terminal payload; `failure == None` means a clean exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStopped {
    pub failure: Option<ContainerFailure>,
}

impl ContainerStopped {
    pub fn clean() -> Self {
        Self { failure: None }
    }

    pub fn failed(failure: ContainerFailure) -> Self {
        Self {
            failure: Some(failure),
        }
    }
}

/// A container changed state.
///
/// `container_started` is set on the transition to running and
/// `container_stopped` on the terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStateChanged {
    pub container: ContainerSummary,
    pub container_started: Option<ContainerStarted>,
    pub container_stopped: Option<ContainerStopped>,
}

impl ContainerStateChanged {
    pub fn failure(&self) -> Option<&ContainerFailure> {
        self.container_stopped.as_ref()?.failure.as_ref()
    }

    /// Terminal event for a container the agent knows nothing more about
    pub fn missing(container: ContainerSummary, err_msg: impl Into<String>) -> Self {
        Self::stopped(
            container,
            ContainerFailure::new(FailureType::ContainerMissing, err_msg),
        )
    }

    pub fn stopped(mut container: ContainerSummary, failure: ContainerFailure) -> Self {
        container.state = cagent_runtime::ContainerState::Terminated;
        Self {
            container,
            container_started: None,
            container_stopped: Some(ContainerStopped::failed(failure)),
        }
    }
}

/// A log line written by the agent about a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerLog {
    pub container_id: ContainerId,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub source: String,
}

/// Begin or end marker of a timed operation on a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatsRecord {
    pub container_id: ContainerId,
    pub allocation_id: String,
    pub task_type: String,
    pub kind: String,
    pub end_stats: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Everything the lifecycle engine reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StateChange(ContainerStateChanged),
    Log(ContainerLog),
    Stats(ContainerStatsRecord),
}

impl Event {
    pub fn container_id(&self) -> &ContainerId {
        match self {
            Self::StateChange(e) => &e.container.id,
            Self::Log(e) => &e.container_id,
            Self::Stats(e) => &e.container_id,
        }
    }
}

/// Sink for [`Event`]s. May block to apply backpressure.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Publisher backed by a bounded channel
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<Event>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| CoreError::Publish("event receiver dropped".to_string()))
    }
}
