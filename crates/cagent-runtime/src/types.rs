//! Common types shared by the agent core and container runtimes

use crate::{Result, RuntimeError};
use async_trait::async_trait;
use cagent_config::Device;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Scheduler-assigned container ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Backend-assigned container ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeId(pub String);

impl RuntimeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// First 12 characters, the way `docker ps` shows ids
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle phase of a container. Progresses forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Assigned,
    Pulling,
    Starting,
    Running,
    Terminated,
}

impl ContainerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Map a backend status string (`docker ps` state) onto a lifecycle phase
    pub fn from_backend_status(status: &str) -> Option<Self> {
        match status.to_lowercase().as_str() {
            "created" => Some(Self::Starting),
            "running" | "paused" | "restarting" => Some(Self::Running),
            "exited" | "dead" | "removing" => Some(Self::Terminated),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assigned => write!(f, "assigned"),
            Self::Pulling => write!(f, "pulling"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

impl std::str::FromStr for ContainerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "assigned" => Ok(Self::Assigned),
            "pulling" => Ok(Self::Pulling),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "terminated" => Ok(Self::Terminated),
            _ => Err(format!("Unknown container state: {}", s)),
        }
    }
}

/// Point-in-time view of a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: ContainerId,
    pub state: ContainerState,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub description: String,
}

impl ContainerSummary {
    pub fn new(id: ContainerId, state: ContainerState, devices: Vec<Device>) -> Self {
        Self {
            id,
            state,
            devices,
            description: String::new(),
        }
    }
}

/// Everything needed to launch one container
#[derive(Debug, Clone, Default)]
pub struct Spec {
    /// Kind of task the container serves (used to tag stats)
    pub task_type: String,
    pub pull_spec: PullSpec,
    pub run_spec: RunSpec,
}

/// How the image should be pulled
#[derive(Debug, Clone, Default)]
pub struct PullSpec {
    pub registry: Option<RegistryAuth>,
    pub force_pull: bool,
}

/// Registry credentials
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryAuth {
    pub username: Option<String>,
    pub password: Option<String>,
    pub server_address: Option<String>,
    pub email: Option<String>,
}

/// Configuration for creating a container
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    /// Image to use
    pub image: String,
    /// Entrypoint override
    pub entrypoint: Option<Vec<String>>,
    /// Command to run
    pub cmd: Option<Vec<String>>,
    /// Environment as `KEY=VALUE` entries
    pub env: Vec<String>,
    /// Labels
    pub labels: HashMap<String, String>,
    /// Working directory
    pub working_dir: Option<String>,
    /// User to run as
    pub user: Option<String>,
    /// Volume mounts
    pub mounts: Vec<MountConfig>,
    /// Network mode
    pub network_mode: Option<String>,
    /// Privileged mode
    pub privileged: bool,
    /// Capabilities to add
    pub cap_add: Vec<String>,
    /// Capabilities to drop
    pub cap_drop: Vec<String>,
    /// GPU UUIDs to expose through the nvidia driver
    pub gpu_device_ids: Vec<String>,
    /// Host device nodes to expose
    pub devices: Vec<DeviceMapping>,
    /// Security options, e.g. `seccomp=unconfined`
    pub security_opt: Vec<String>,
    /// Extra groups for the container's user
    pub group_add: Vec<String>,
    /// Remove the container once it exits
    pub auto_remove: bool,
}

/// A host device node exposed inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMapping {
    pub path_on_host: String,
    pub path_in_container: String,
    /// cgroup permissions, e.g. `rwm`
    pub permissions: String,
}

impl DeviceMapping {
    /// Same path on both sides, with full access
    pub fn same_path(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            path_on_host: path.clone(),
            path_in_container: path,
            permissions: "rwm".to_string(),
        }
    }
}

/// Mount configuration
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub mount_type: MountType,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Mount type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountType {
    Bind,
    Volume,
    Tmpfs,
}

impl std::fmt::Display for MountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind => write!(f, "bind"),
            Self::Volume => write!(f, "volume"),
            Self::Tmpfs => write!(f, "tmpfs"),
        }
    }
}

/// A request to pull an image
#[derive(Debug, Clone, Default)]
pub struct PullImage {
    pub name: String,
    pub force_pull: bool,
    pub registry: Option<RegistryAuth>,
}

impl PullImage {
    pub fn from_spec(spec: &Spec) -> Self {
        Self {
            name: spec.run_spec.image.clone(),
            force_pull: spec.pull_spec.force_pull,
            registry: spec.pull_spec.registry.clone(),
        }
    }
}

/// Process exit status reported by a backend
pub type ExitCode = i64;

/// What a backend reports when a container exits
#[derive(Debug, Clone, PartialEq)]
pub struct ExitStatus {
    pub status_code: ExitCode,
    /// Backend-reported error, if the exit could not be observed cleanly
    pub error: Option<String>,
}

impl ExitStatus {
    pub fn code(status_code: ExitCode) -> Self {
        Self {
            status_code,
            error: None,
        }
    }
}

/// Notification sources for the termination of a running container.
///
/// `exit` resolves when the container exits. `errors` resolves if watching the
/// container failed. At most one of the two ever carries a value.
#[derive(Debug)]
pub struct ContainerWaiter {
    pub exit: oneshot::Receiver<ExitStatus>,
    pub errors: oneshot::Receiver<RuntimeError>,
}

/// Backend side of a [`ContainerWaiter`]
#[derive(Debug)]
pub struct WaiterHandle {
    exit: oneshot::Sender<ExitStatus>,
    errors: oneshot::Sender<RuntimeError>,
}

impl ContainerWaiter {
    pub fn channel() -> (WaiterHandle, ContainerWaiter) {
        let (exit_tx, exit_rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();
        (
            WaiterHandle {
                exit: exit_tx,
                errors: err_tx,
            },
            ContainerWaiter {
                exit: exit_rx,
                errors: err_rx,
            },
        )
    }
}

impl WaiterHandle {
    /// Report the container's exit
    pub fn exit(self, status: ExitStatus) {
        let _ = self.exit.send(status);
    }

    /// Report that watching the container failed
    pub fn fail(self, err: RuntimeError) {
        let _ = self.errors.send(err);
    }
}

/// Backend details about a started container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeContainerInfo {
    pub runtime_id: RuntimeId,
    pub name: String,
    pub image: String,
    pub started_at: Option<DateTime<Utc>>,
}

/// A started container and the means to await its exit
#[derive(Debug)]
pub struct RunningContainer {
    pub info: RuntimeContainerInfo,
    pub waiter: ContainerWaiter,
}

/// Outcome of looking a container up again after an agent restart
#[derive(Debug)]
pub enum Reattached {
    /// Still running; monitor it as usual
    Running(RunningContainer),
    /// Exited while nobody was watching
    Exited(ExitCode),
    /// The backend has no such container
    Missing,
}

/// A container as listed by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeContainer {
    pub runtime_id: RuntimeId,
    pub name: String,
    pub image: String,
    /// Backend state string (`created`, `running`, `exited`, ...)
    pub status: String,
    pub labels: HashMap<String, String>,
}

/// Severity of a log line produced by the agent on behalf of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

/// A log line emitted while driving the backend
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Stats kind recorded around an image pull
pub const IMAGE_PULL_STATS: &str = "IMAGEPULL";

/// Begin or end marker of a timed backend operation
#[derive(Debug, Clone, PartialEq)]
pub struct StatsEvent {
    pub kind: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Progress reported by a backend while it works on a container
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    Log(LogEvent),
    Stats(StatsEvent),
}

impl RuntimeEvent {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log(LogEvent {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        })
    }

    pub fn begin_stats(kind: impl Into<String>) -> Self {
        Self::Stats(StatsEvent {
            kind: kind.into(),
            start_time: Some(Utc::now()),
            end_time: None,
        })
    }

    pub fn end_stats(kind: impl Into<String>) -> Self {
        Self::Stats(StatsEvent {
            kind: kind.into(),
            start_time: None,
            end_time: Some(Utc::now()),
        })
    }
}

/// Receiver of [`RuntimeEvent`]s. Publishing may block the backend call.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: RuntimeEvent) -> Result<()>;
}

/// Container runtime type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Docker,
    Podman,
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Podman => write!(f, "podman"),
        }
    }
}

impl std::str::FromStr for RuntimeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            _ => Err(format!("Unknown runtime type: {}", s)),
        }
    }
}

/// Runtime information
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub runtime_type: RuntimeType,
    pub api_version: String,
}
