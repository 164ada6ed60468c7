//! Test support utilities for cagent-core
//!
//! Provides MockRuntime and helpers for unit testing containers and the
//! ContainerManager without requiring a real Docker/Podman runtime.

use crate::{ChannelPublisher, Event, StartContainer};
use async_trait::async_trait;
use cagent_config::{AgentConfig, Device, DeviceType};
use cagent_runtime::labels::{self, AGENT_LABEL};
use cagent_runtime::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// Exit code reported for containers killed with SIGKILL
pub const KILLED_EXIT_CODE: ExitCode = 137;

/// Records which methods were called on the mock
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Pull { image: String, force: bool },
    Create { id: String, image: String },
    Run { runtime_id: String },
    Signal { runtime_id: String, signal: Signal },
    Remove { runtime_id: String, force: bool },
    List { filter: String },
    Reattach { id: String },
}

/// What `reattach_container` should find for a container
#[derive(Debug, Clone)]
pub enum MockReattach {
    Running,
    Exited(ExitCode),
    Missing,
    Error(RuntimeError),
}

/// Configurable mock container runtime for testing
pub struct MockRuntime {
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    /// Result for pull calls
    pub pull_result: Arc<Mutex<Result<()>>>,
    /// Result for create calls; success yields runtime id `rt-<container id>`
    pub create_result: Arc<Mutex<Result<()>>>,
    /// Result for run calls
    pub run_result: Arc<Mutex<Result<()>>>,
    /// Result for signal calls
    pub signal_result: Arc<Mutex<Result<()>>>,
    /// Result for remove calls
    pub remove_result: Arc<Mutex<Result<()>>>,
    /// Result for list calls
    pub list_result: Arc<Mutex<Result<HashMap<ContainerId, RuntimeContainer>>>>,
    /// Per-container reattach outcome; unlisted containers are missing
    pub reattach_results: Arc<Mutex<HashMap<ContainerId, MockReattach>>>,
    /// If set, containers exit with this code as soon as they run
    pub exit_on_run: Arc<Mutex<Option<ExitCode>>>,
    pull_gate: Gate,
    create_gate: Gate,
    run_gate: Gate,
    waiters: Arc<Mutex<HashMap<RuntimeId, WaiterHandle>>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create a new mock runtime with default success results
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            pull_result: Arc::new(Mutex::new(Ok(()))),
            create_result: Arc::new(Mutex::new(Ok(()))),
            run_result: Arc::new(Mutex::new(Ok(()))),
            signal_result: Arc::new(Mutex::new(Ok(()))),
            remove_result: Arc::new(Mutex::new(Ok(()))),
            list_result: Arc::new(Mutex::new(Ok(HashMap::new()))),
            reattach_results: Arc::new(Mutex::new(HashMap::new())),
            exit_on_run: Arc::new(Mutex::new(None)),
            pull_gate: Gate::default(),
            create_gate: Gate::default(),
            run_gate: Gate::default(),
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record a call
    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    /// Get all recorded calls
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Check if a specific call was made
    pub fn was_called(&self, call: &MockCall) -> bool {
        self.calls.lock().unwrap().contains(call)
    }

    /// Block every pull until [`MockRuntime::release_pulls`]
    pub fn hold_pulls(&self) {
        self.pull_gate.hold();
    }

    pub fn release_pulls(&self) {
        self.pull_gate.release();
    }

    /// Block every create until [`MockRuntime::release_creates`]
    pub fn hold_creates(&self) {
        self.create_gate.hold();
    }

    pub fn release_creates(&self) {
        self.create_gate.release();
    }

    /// Block every run until [`MockRuntime::release_runs`]
    pub fn hold_runs(&self) {
        self.run_gate.hold();
    }

    pub fn release_runs(&self) {
        self.run_gate.release();
    }

    /// Make a running container exit
    pub fn exit(&self, runtime_id: &str, code: ExitCode) -> bool {
        match self.waiters.lock().unwrap().remove(&RuntimeId::new(runtime_id)) {
            Some(handle) => {
                handle.exit(ExitStatus::code(code));
                true
            }
            None => false,
        }
    }

    /// Make watching a running container fail
    pub fn fail_waiter(&self, runtime_id: &str, err: RuntimeError) -> bool {
        match self.waiters.lock().unwrap().remove(&RuntimeId::new(runtime_id)) {
            Some(handle) => {
                handle.fail(err);
                true
            }
            None => false,
        }
    }

    /// Whether the mock is currently watching a container
    pub fn is_running(&self, runtime_id: &str) -> bool {
        self.waiters
            .lock()
            .unwrap()
            .contains_key(&RuntimeId::new(runtime_id))
    }

    pub fn set_reattach(&self, id: &str, outcome: MockReattach) {
        self.reattach_results
            .lock()
            .unwrap()
            .insert(ContainerId::new(id), outcome);
    }

    fn watch(&self, runtime_id: RuntimeId, wait_token: CancellationToken) -> ContainerWaiter {
        let (handle, waiter) = ContainerWaiter::channel();
        self.waiters.lock().unwrap().insert(runtime_id.clone(), handle);

        // The backend stops reporting once the caller stops waiting
        let waiters = self.waiters.clone();
        tokio::spawn(async move {
            wait_token.cancelled().await;
            waiters.lock().unwrap().remove(&runtime_id);
        });
        waiter
    }
}

/// While held, callers of [`Gate::pass`] block until released
#[derive(Default)]
struct Gate(Mutex<Option<Arc<Semaphore>>>);

impl Gate {
    fn hold(&self) {
        *self.0.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    fn release(&self) {
        if let Some(gate) = self.0.lock().unwrap().take() {
            gate.close();
        }
    }

    async fn pass(&self) {
        let gate = self.0.lock().unwrap().clone();
        if let Some(gate) = gate {
            // Closing the semaphore lets everyone through
            let _ = gate.acquire().await;
        }
    }
}

/// Runtime id the mock assigns to a container
pub fn mock_runtime_id(id: &str) -> String {
    format!("rt-{}", id)
}

fn mock_info(runtime_id: &RuntimeId) -> RuntimeContainerInfo {
    RuntimeContainerInfo {
        runtime_id: runtime_id.clone(),
        name: format!("mock-{}", runtime_id),
        image: "mock:latest".to_string(),
        started_at: Some(chrono::Utc::now()),
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(&self, req: &PullImage, sink: &dyn EventSink) -> Result<()> {
        self.record(MockCall::Pull {
            image: req.name.clone(),
            force: req.force_pull,
        });

        self.pull_gate.pass().await;

        let result = self.pull_result.lock().unwrap().clone();
        if result.is_ok() {
            sink.publish(RuntimeEvent::begin_stats(IMAGE_PULL_STATS))
                .await?;
            sink.publish(RuntimeEvent::log(
                LogLevel::Info,
                format!("pulled {}", req.name),
            ))
            .await?;
            sink.publish(RuntimeEvent::end_stats(IMAGE_PULL_STATS))
                .await?;
        }
        result
    }

    async fn create_container(
        &self,
        id: &ContainerId,
        spec: &RunSpec,
        _sink: &dyn EventSink,
    ) -> Result<RuntimeId> {
        self.record(MockCall::Create {
            id: id.to_string(),
            image: spec.image.clone(),
        });
        self.create_gate.pass().await;
        self.create_result.lock().unwrap().clone()?;
        Ok(RuntimeId::new(mock_runtime_id(id.as_ref())))
    }

    async fn run_container(
        &self,
        id: &RuntimeId,
        wait_token: CancellationToken,
        _sink: &dyn EventSink,
    ) -> Result<RunningContainer> {
        self.record(MockCall::Run {
            runtime_id: id.to_string(),
        });
        self.run_gate.pass().await;
        self.run_result.lock().unwrap().clone()?;

        let waiter = self.watch(id.clone(), wait_token);
        let exit_on_run = *self.exit_on_run.lock().unwrap();
        if let Some(code) = exit_on_run {
            self.exit(&id.0, code);
        }

        Ok(RunningContainer {
            info: mock_info(id),
            waiter,
        })
    }

    async fn signal_container(&self, id: &RuntimeId, signal: Signal) -> Result<()> {
        self.record(MockCall::Signal {
            runtime_id: id.to_string(),
            signal,
        });
        self.signal_result.lock().unwrap().clone()?;
        if signal == Signal::SIGKILL {
            self.exit(&id.0, KILLED_EXIT_CODE);
        }
        Ok(())
    }

    async fn remove_container(&self, id: &RuntimeId, force: bool) -> Result<()> {
        self.record(MockCall::Remove {
            runtime_id: id.to_string(),
            force,
        });
        self.remove_result.lock().unwrap().clone()
    }

    async fn list_running_containers(
        &self,
        filter: &LabelFilter,
    ) -> Result<HashMap<ContainerId, RuntimeContainer>> {
        self.record(MockCall::List {
            filter: filter.to_string(),
        });
        let listed = self.list_result.lock().unwrap().clone()?;
        Ok(listed
            .into_iter()
            .filter(|(_, c)| filter.matches(&c.labels))
            .collect())
    }

    async fn reattach_container(
        &self,
        id: &ContainerId,
        wait_token: CancellationToken,
    ) -> Result<Reattached> {
        self.record(MockCall::Reattach { id: id.to_string() });
        let outcome = self
            .reattach_results
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or(MockReattach::Missing);

        match outcome {
            MockReattach::Running => {
                let runtime_id = RuntimeId::new(mock_runtime_id(id.as_ref()));
                let waiter = self.watch(runtime_id.clone(), wait_token);
                Ok(Reattached::Running(RunningContainer {
                    info: mock_info(&runtime_id),
                    waiter,
                }))
            }
            MockReattach::Exited(code) => Ok(Reattached::Exited(code)),
            MockReattach::Missing => Ok(Reattached::Missing),
            MockReattach::Error(e) => Err(e),
        }
    }

    fn info(&self) -> RuntimeInfo {
        RuntimeInfo {
            runtime_type: RuntimeType::Docker,
            api_version: "mock".to_string(),
        }
    }
}

/// Agent config with `n` CUDA devices
pub fn test_config(n: u32) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.agent.agent_id = "test-agent".to_string();
    config.agent.recent_exits_cache_size = 4;
    config.devices = (0..n)
        .map(|i| {
            let mut d = Device::new(i, DeviceType::Cuda);
            d.uuid = format!("GPU-{}", i);
            d
        })
        .collect();
    config
}

/// Launch request for a container running `entrypoint`
pub fn start_request(id: &str, devices: Vec<Device>, entrypoint: &[&str]) -> StartContainer {
    let mut spec = Spec {
        task_type: "TRIAL".to_string(),
        ..Default::default()
    };
    spec.run_spec.image = "python:3.11".to_string();
    spec.run_spec.entrypoint = Some(entrypoint.iter().map(|s| s.to_string()).collect());
    spec.run_spec.auto_remove = true;

    StartContainer {
        container: ContainerSummary::new(ContainerId::new(id), ContainerState::Assigned, devices),
        spec,
    }
}

/// A backend container launched by `agent_id`, as the runtime would list it
pub fn listed_container(agent_id: &str, summary: &ContainerSummary) -> RuntimeContainer {
    let mut labels = labels::container_labels("TRIAL", summary);
    labels.insert(AGENT_LABEL.to_string(), agent_id.to_string());
    RuntimeContainer {
        runtime_id: RuntimeId::new(mock_runtime_id(summary.id.as_ref())),
        name: format!("mock-{}", summary.id),
        image: "mock:latest".to_string(),
        status: match summary.state {
            ContainerState::Running => "running",
            ContainerState::Terminated => "exited",
            _ => "created",
        }
        .to_string(),
        labels,
    }
}

/// Publisher whose events are collected by the test
pub fn test_publisher() -> (Arc<ChannelPublisher>, mpsc::Receiver<Event>) {
    let (publisher, rx) = ChannelPublisher::new(256);
    (Arc::new(publisher), rx)
}

/// Next state change for `id`, skipping everything else
pub async fn next_state_change(
    rx: &mut mpsc::Receiver<Event>,
    id: &str,
) -> crate::ContainerStateChanged {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(Event::StateChange(e)) if e.container.id.as_ref() == id => return e,
                Some(_) => continue,
                None => panic!("publisher closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for a state change")
}

/// Wait until `check` holds, polling
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held")
}
