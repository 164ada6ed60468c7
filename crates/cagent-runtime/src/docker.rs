//! Docker runtime implementation using bollard

use crate::labels::CONTAINER_ID_LABEL;
use crate::{
    ContainerId, ContainerRuntime, ContainerWaiter, EventSink, ExitStatus, LabelFilter, LogLevel,
    MountType, PullImage, Reattached, RegistryAuth, Result, RunSpec, RunningContainer,
    RuntimeContainer, RuntimeContainerInfo, RuntimeError, RuntimeEvent, RuntimeId, RuntimeInfo,
    RuntimeType, Signal, IMAGE_PULL_STATS,
};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::service::{ContainerInspectResponse, DeviceRequest, HostConfig, Mount};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Runtime backed by a Docker-compatible API socket
pub struct DockerRuntime {
    client: Docker,
    runtime_type: RuntimeType,
}

impl DockerRuntime {
    /// Create a new Docker runtime
    pub async fn new(socket_path: &str) -> Result<Self> {
        let client = if socket_path.starts_with("unix://") || socket_path.starts_with('/') {
            let path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?
        } else if socket_path.starts_with("http://") || socket_path.starts_with("https://") {
            Docker::connect_with_http(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?
        } else {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?
        };

        client
            .ping()
            .await
            .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            runtime_type: RuntimeType::Docker,
        })
    }

    /// Create a new runtime for Podman (uses Docker-compatible API)
    pub async fn new_podman(socket_path: &str) -> Result<Self> {
        let mut runtime = Self::new(socket_path).await?;
        runtime.runtime_type = RuntimeType::Podman;
        Ok(runtime)
    }

    /// Check the daemon is reachable
    pub async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse> {
        Ok(self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?)
    }

    /// Watch for the container's next exit until `token` is cancelled
    fn spawn_waiter(&self, id: &RuntimeId, token: CancellationToken) -> ExitWatch {
        let (handle, waiter) = ContainerWaiter::channel();
        let (observed, observed_rx) = oneshot::channel::<ExitStatus>();
        let client = self.client.clone();
        let id = id.0.clone();
        let task_token = token.clone();

        tokio::spawn(async move {
            let options = WaitContainerOptions {
                condition: "next-exit",
            };
            let mut exits = client.wait_container(&id, Some(options));

            tokio::select! {
                _ = task_token.cancelled() => {
                    tracing::trace!("Stopped waiting on {}", id);
                }
                // The exit happened before the daemon registered our wait
                Ok(status) = observed_rx => {
                    tracing::debug!("Container {} exited before the wait was registered", id);
                    handle.exit(status);
                }
                next = exits.next() => match next {
                    Some(Ok(response)) => handle.exit(ExitStatus {
                        status_code: response.status_code,
                        error: response.error.and_then(|e| e.message).filter(|m| !m.is_empty()),
                    }),
                    // bollard reports non-zero exits as errors
                    Some(Err(bollard::errors::Error::DockerContainerWaitError { error, code })) => {
                        handle.exit(ExitStatus {
                            status_code: code,
                            error: Some(error).filter(|m| !m.is_empty()),
                        })
                    }
                    Some(Err(e)) => handle.fail(e.into()),
                    None => handle.fail(RuntimeError::RuntimeError(
                        "wait stream closed without an exit status".to_string(),
                    )),
                },
            }
        });

        ExitWatch {
            waiter,
            observed,
            token,
        }
    }
}

/// A waiter being set up, plus a way to report an exit seen by inspection
struct ExitWatch {
    waiter: ContainerWaiter,
    observed: oneshot::Sender<ExitStatus>,
    token: CancellationToken,
}

/// Exit status of an inspected container that is no longer running
fn exited_status(inspect: &ContainerInspectResponse) -> Option<ExitStatus> {
    let state = inspect.state.as_ref()?;
    if state.running.unwrap_or(false) {
        return None;
    }
    Some(ExitStatus::code(state.exit_code.unwrap_or_default()))
}

fn credentials(auth: &RegistryAuth) -> DockerCredentials {
    DockerCredentials {
        username: auth.username.clone(),
        password: auth.password.clone(),
        email: auth.email.clone(),
        serveraddress: auth.server_address.clone(),
        ..Default::default()
    }
}

fn container_info(id: &RuntimeId, inspect: &ContainerInspectResponse) -> RuntimeContainerInfo {
    let started_at = inspect
        .state
        .as_ref()
        .and_then(|s| s.started_at.as_deref())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    RuntimeContainerInfo {
        runtime_id: id.clone(),
        name: inspect
            .name
            .as_deref()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        image: inspect
            .config
            .as_ref()
            .and_then(|c| c.image.clone())
            .unwrap_or_default(),
        started_at,
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Host-side settings of a container: mounts, devices, privileges
fn host_config(spec: &RunSpec) -> HostConfig {
    let mounts: Vec<Mount> = spec
        .mounts
        .iter()
        .map(|m| Mount {
            target: Some(m.target.clone()),
            source: Some(m.source.clone()),
            typ: Some(match m.mount_type {
                MountType::Bind => bollard::service::MountTypeEnum::BIND,
                MountType::Volume => bollard::service::MountTypeEnum::VOLUME,
                MountType::Tmpfs => bollard::service::MountTypeEnum::TMPFS,
            }),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect();

    let device_requests = if spec.gpu_device_ids.is_empty() {
        None
    } else {
        Some(vec![DeviceRequest {
            driver: Some("nvidia".into()),
            device_ids: Some(spec.gpu_device_ids.clone()),
            capabilities: Some(vec![vec![
                "gpu".into(),
                "compute".into(),
                "utility".into(),
            ]]),
            ..Default::default()
        }])
    };

    let devices = spec
        .devices
        .iter()
        .map(|d| bollard::service::DeviceMapping {
            path_on_host: Some(d.path_on_host.clone()),
            path_in_container: Some(d.path_in_container.clone()),
            cgroup_permissions: Some(d.permissions.clone()),
        })
        .collect();

    HostConfig {
        auto_remove: Some(spec.auto_remove),
        mounts: non_empty(mounts),
        network_mode: spec.network_mode.clone(),
        privileged: Some(spec.privileged),
        cap_add: non_empty(spec.cap_add.clone()),
        cap_drop: non_empty(spec.cap_drop.clone()),
        device_requests,
        devices: non_empty(devices),
        security_opt: non_empty(spec.security_opt.clone()),
        group_add: non_empty(spec.group_add.clone()),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, req: &PullImage, sink: &dyn EventSink) -> Result<()> {
        if !req.force_pull {
            match self.client.inspect_image(&req.name).await {
                Ok(_) => {
                    sink.publish(RuntimeEvent::log(
                        LogLevel::Info,
                        format!("image present, skipping pull: {}", req.name),
                    ))
                    .await?;
                    return Ok(());
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        sink.publish(RuntimeEvent::begin_stats(IMAGE_PULL_STATS)).await?;
        sink.publish(RuntimeEvent::log(
            LogLevel::Info,
            format!("pulling image {}", req.name),
        ))
        .await?;

        let options = CreateImageOptions {
            from_image: req.name.as_str(),
            ..Default::default()
        };
        let creds = req.registry.as_ref().map(credentials);
        let mut stream = self.client.create_image(Some(options), None, creds);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(RuntimeError::ImageNotFound(error));
                    }
                    // Status lines only, no progress bars
                    if info.progress.is_none() {
                        if let Some(status) = info.status {
                            sink.publish(RuntimeEvent::log(LogLevel::Info, status))
                                .await?;
                        }
                    }
                }
                Err(e) => return Err(RuntimeError::ImageNotFound(e.to_string())),
            }
        }

        sink.publish(RuntimeEvent::end_stats(IMAGE_PULL_STATS)).await?;
        Ok(())
    }

    async fn create_container(
        &self,
        id: &ContainerId,
        spec: &RunSpec,
        sink: &dyn EventSink,
    ) -> Result<RuntimeId> {
        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            entrypoint: spec.entrypoint.clone(),
            env: non_empty(spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            user: spec.user.clone(),
            labels: if spec.labels.is_empty() {
                None
            } else {
                Some(spec.labels.clone())
            },
            host_config: Some(host_config(spec)),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, container_config)
            .await?;

        for warning in response.warnings {
            sink.publish(RuntimeEvent::log(
                LogLevel::Warning,
                format!("warning when creating container: {}", warning),
            ))
            .await?;
        }

        tracing::debug!("Created backend container {} for {}", response.id, id);
        Ok(RuntimeId::new(response.id))
    }

    async fn run_container(
        &self,
        id: &RuntimeId,
        wait_token: CancellationToken,
        _sink: &dyn EventSink,
    ) -> Result<RunningContainer> {
        // Subscribe to the next exit before starting, or a fast exit is lost
        let watch = self.spawn_waiter(id, wait_token.child_token());
        tokio::task::yield_now().await;

        if let Err(e) = self
            .client
            .start_container(&id.0, None::<StartContainerOptions<String>>)
            .await
        {
            watch.token.cancel();
            return Err(e.into());
        }

        let inspect = match self.inspect(&id.0).await {
            Ok(inspect) => inspect,
            Err(e) => {
                watch.token.cancel();
                if let Err(rm) = self.remove_container(id, true).await {
                    tracing::warn!("Failed to remove {} after inspect failed: {}", id.short(), rm);
                }
                return Err(e);
            }
        };

        // The wait request may reach the daemon after a fast exit
        if let Some(status) = exited_status(&inspect) {
            let _ = watch.observed.send(status);
        }

        Ok(RunningContainer {
            info: container_info(id, &inspect),
            waiter: watch.waiter,
        })
    }

    async fn signal_container(&self, id: &RuntimeId, signal: Signal) -> Result<()> {
        let options = KillContainerOptions {
            signal: signal.as_str(),
        };
        self.client.kill_container(&id.0, Some(options)).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &RuntimeId, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.client.remove_container(&id.0, Some(options)).await?;
        Ok(())
    }

    async fn list_running_containers(
        &self,
        filter: &LabelFilter,
    ) -> Result<HashMap<ContainerId, RuntimeContainer>> {
        let options = ListContainersOptions {
            all: false,
            filters: HashMap::from([("label".to_string(), vec![filter.to_string()])]),
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;

        let mut running = HashMap::new();
        for c in containers {
            let labels = c.labels.unwrap_or_default();
            let Some(cid) = labels.get(CONTAINER_ID_LABEL).cloned() else {
                tracing::warn!(
                    "Container {:?} matches {} but has no {} label",
                    c.id,
                    filter,
                    CONTAINER_ID_LABEL
                );
                continue;
            };

            running.insert(
                ContainerId::new(cid),
                RuntimeContainer {
                    runtime_id: RuntimeId::new(c.id.unwrap_or_default()),
                    name: c
                        .names
                        .and_then(|n| n.first().cloned())
                        .unwrap_or_default()
                        .trim_start_matches('/')
                        .to_string(),
                    image: c.image.unwrap_or_default(),
                    status: c.state.unwrap_or_default(),
                    labels,
                },
            );
        }

        Ok(running)
    }

    async fn reattach_container(
        &self,
        id: &ContainerId,
        wait_token: CancellationToken,
    ) -> Result<Reattached> {
        let options = ListContainersOptions {
            all: true,
            filters: HashMap::from([(
                "label".to_string(),
                vec![LabelFilter::container(id).to_string()],
            )]),
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;
        let runtime_id = match containers.as_slice() {
            [] => return Ok(Reattached::Missing),
            [c] => RuntimeId::new(c.id.clone().unwrap_or_default()),
            many => {
                return Err(RuntimeError::RuntimeError(format!(
                    "expected at most one container for {}, found {}",
                    id,
                    many.len()
                )))
            }
        };

        // Subscribe before inspecting, so an exit in between is not missed
        let watch = self.spawn_waiter(&runtime_id, wait_token.child_token());
        let inspect = match self.inspect(&runtime_id.0).await {
            Ok(inspect) => inspect,
            Err(e) => {
                watch.token.cancel();
                return Err(e);
            }
        };
        if let Some(status) = exited_status(&inspect) {
            watch.token.cancel();
            return Ok(Reattached::Exited(status.status_code));
        }

        Ok(Reattached::Running(RunningContainer {
            info: container_info(&runtime_id, &inspect),
            waiter: watch.waiter,
        }))
    }

    fn info(&self) -> RuntimeInfo {
        RuntimeInfo {
            runtime_type: self.runtime_type,
            api_version: bollard::API_DEFAULT_VERSION.to_string(),
        }
    }
}
