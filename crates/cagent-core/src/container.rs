//! Per-container lifecycle state machine
//!
//! A [`Container`] drives one workload through
//! `Assigned -> Pulling -> Starting -> Running -> Terminated` on its own task,
//! publishing a state change for every step. Whatever happens, a container that
//! is not detached produces exactly one terminal event.

use crate::launch;
use crate::{
    ContainerFailure, ContainerLog, ContainerStarted, ContainerStateChanged, ContainerStatsRecord,
    ContainerStopped, CoreError, Event, FailureType, Publisher, Result,
};
use async_trait::async_trait;
use cagent_config::Device;
use cagent_runtime::{
    ContainerId, ContainerRuntime, ContainerState, ContainerSummary, ContainerWaiter, EventSink,
    ExitStatus, PullImage, Reattached, RunningContainer, RuntimeError, RuntimeEvent, RuntimeId,
    Signal, Spec,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Signal queue depth of a freshly launched container
pub const START_SIGNAL_CAPACITY: usize = 32;
/// Signal queue depth of a reattached container
pub const REATTACH_SIGNAL_CAPACITY: usize = 16;

pub(crate) const GONE_ON_REATTACH: &str = "container is gone on reattachment";

/// Request to launch a fresh container
#[derive(Debug, Clone)]
pub struct StartContainer {
    pub container: ContainerSummary,
    pub spec: Spec,
}

struct Lifecycle {
    state: ContainerState,
    /// Latched by the first transition to `Terminated`
    exit: Option<ContainerStateChanged>,
}

/// Handle to one container's state machine
pub struct Container {
    id: ContainerId,
    allocation_id: String,
    task_type: String,
    devices: Vec<Device>,
    description: String,
    lifecycle: Mutex<Lifecycle>,
    signals: mpsc::Sender<Signal>,
    /// Cancelled on detach; the run-loop's own scope is a child of this
    scope: CancellationToken,
    done: watch::Receiver<bool>,
    runtime: Arc<dyn ContainerRuntime>,
    publisher: Arc<dyn Publisher>,
}

impl Container {
    /// Launch a container. The run-loop starts immediately on its own task.
    pub fn start(
        req: StartContainer,
        runtime: Arc<dyn ContainerRuntime>,
        publisher: Arc<dyn Publisher>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let allocation_id = launch::allocation_id(&req.spec);
        let task_type = req.spec.task_type.clone();
        let (container, signals, done) = Self::build(
            req.container,
            allocation_id,
            task_type,
            START_SIGNAL_CAPACITY,
            runtime,
            publisher,
            parent,
        );

        let span = tracing::info_span!("container", container_id = %container.id);
        let this = container.clone();
        let spec = req.spec;
        tokio::spawn(
            async move {
                let result = this.run(spec, signals).await;
                this.finalize(result).await;
                let _ = done.send(true);
            }
            .instrument(span),
        );

        container
    }

    /// Pick up monitoring of a container that outlived a previous agent
    pub fn reattach(
        summary: ContainerSummary,
        runtime: Arc<dyn ContainerRuntime>,
        publisher: Arc<dyn Publisher>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (container, signals, done) = Self::build(
            summary,
            String::new(),
            String::new(),
            REATTACH_SIGNAL_CAPACITY,
            runtime,
            publisher,
            parent,
        );

        let span = tracing::info_span!("container", container_id = %container.id, reattached = true);
        let this = container.clone();
        tokio::spawn(
            async move {
                let result = this.run_reattached(signals).await;
                this.finalize(result).await;
                let _ = done.send(true);
            }
            .instrument(span),
        );

        container
    }

    fn build(
        summary: ContainerSummary,
        allocation_id: String,
        task_type: String,
        signal_capacity: usize,
        runtime: Arc<dyn ContainerRuntime>,
        publisher: Arc<dyn Publisher>,
        parent: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Signal>, watch::Sender<bool>) {
        let (signals_tx, signals_rx) = mpsc::channel(signal_capacity);
        let (done_tx, done_rx) = watch::channel(false);

        let container = Arc::new(Self {
            id: summary.id,
            allocation_id,
            task_type,
            devices: summary.devices,
            description: summary.description,
            lifecycle: Mutex::new(Lifecycle {
                state: summary.state,
                exit: None,
            }),
            signals: signals_tx,
            scope: parent.child_token(),
            done: done_rx,
            runtime,
            publisher,
        });

        (container, signals_rx, done_tx)
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Allocation owning this container; empty when unknown
    pub fn allocation_id(&self) -> &str {
        &self.allocation_id
    }

    /// Current snapshot of the container
    pub fn summary(&self) -> ContainerSummary {
        let lifecycle = self.lock();
        self.summary_of(&lifecycle)
    }

    /// Queue a signal for the container without waiting.
    ///
    /// The signal is dropped with a warning if the queue is full or the
    /// container has already finished.
    pub fn signal(&self, signal: Signal) {
        if self.is_done() {
            tracing::warn!(container_id = %self.id, "ignoring signal on exited container: {}", signal);
            return;
        }
        if self.scope.is_cancelled() {
            tracing::warn!(
                container_id = %self.id,
                "ignoring signal on container due to cancellation: {}",
                signal
            );
            return;
        }

        match self.signals.try_send(signal) {
            Ok(()) => {}
            Err(TrySendError::Full(signal)) => {
                tracing::warn!(container_id = %self.id, "signal queue full, dropping {}", signal);
            }
            Err(TrySendError::Closed(signal)) => {
                tracing::warn!(container_id = %self.id, "ignoring signal on exited container: {}", signal);
            }
        }
    }

    /// Stop monitoring and wait for the run-loop, leaving the backend container as is
    pub async fn detach(&self) {
        self.scope.cancel();
        self.wait_done().await;
    }

    /// Kill the container and wait for its terminal event
    pub async fn stop(&self) -> Option<ContainerStateChanged> {
        self.signal(Signal::SIGKILL);
        self.wait().await
    }

    /// Wait for the run-loop to finish.
    ///
    /// Returns the terminal event, or `None` if the container was detached.
    pub async fn wait(&self) -> Option<ContainerStateChanged> {
        self.wait_done().await;
        self.exit()
    }

    /// The terminal event, once one was published
    pub fn exit(&self) -> Option<ContainerStateChanged> {
        self.lock().exit.clone()
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    async fn wait_done(&self) {
        let mut done = self.done.clone();
        // A dropped sender means the task is gone too
        let _ = done.wait_for(|finished| *finished).await;
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn summary_of(&self, lifecycle: &Lifecycle) -> ContainerSummary {
        ContainerSummary {
            id: self.id.clone(),
            state: lifecycle.state,
            devices: self.devices.clone(),
            description: self.description.clone(),
        }
    }

    #[cfg(test)]
    fn queued_signals(&self) -> usize {
        self.signals.max_capacity() - self.signals.capacity()
    }

    async fn run(&self, spec: Spec, mut signals: mpsc::Receiver<Signal>) -> Result<()> {
        tracing::trace!("starting container launch");
        let launch_token = self.scope.child_token();
        let mut killed = false;

        // Until the container runs, only SIGKILL means anything
        let launched = {
            let launch = self.launch(spec, &launch_token);
            tokio::pin!(launch);
            loop {
                tokio::select! {
                    result = &mut launch => break result,
                    Some(signal) = signals.recv() => {
                        if signal == Signal::SIGKILL {
                            tracing::trace!("signal {}, cancelling launch", signal);
                            killed = true;
                            launch_token.cancel();
                        } else {
                            tracing::warn!("ignoring signal other than SIGKILL {} before running", signal);
                        }
                    }
                }
            }
        };

        let running = match launched {
            Ok(running) => running,
            Err(CoreError::Cancelled) if killed => {
                return Err(ContainerFailure::new(
                    FailureType::ContainerAborted,
                    "container killed before running",
                )
                .into())
            }
            Err(e) if killed => {
                return Err(ContainerFailure::new(
                    FailureType::ContainerAborted,
                    format!("container killed before running: {}", e),
                )
                .into())
            }
            Err(e) => return Err(e),
        };

        self.transition(
            ContainerState::Running,
            Some(ContainerStarted {
                info: running.info.clone(),
            }),
            None,
        )
        .await?;

        // A kill that raced with a successful start still has to be delivered
        let pending = killed.then_some(Signal::SIGKILL);
        self.monitor(running, &mut signals, pending).await
    }

    async fn launch(&self, spec: Spec, token: &CancellationToken) -> Result<RunningContainer> {
        let sink = EventShim { container: self };

        tracing::trace!("pulling image");
        self.transition(ContainerState::Pulling, None, None).await?;
        let pull = PullImage::from_spec(&spec);
        tokio::select! {
            result = self.runtime.pull_image(&pull, &sink) => {
                result.map_err(CoreError::backend("pulling container image"))?
            }
            _ = token.cancelled() => return Err(CoreError::Cancelled),
        }
        if token.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        tracing::trace!("creating container");
        self.transition(ContainerState::Starting, None, None).await?;
        let runtime_id = self
            .runtime
            .create_container(&self.id, &spec.run_spec, &sink)
            .await
            .map_err(CoreError::backend("creating container"))?;
        let auto_remove = spec.run_spec.auto_remove;
        drop(spec);

        let result = if token.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            tracing::trace!(runtime_id = %runtime_id, "starting container");
            self.runtime
                .run_container(&runtime_id, self.scope.clone(), &sink)
                .await
                .map_err(CoreError::backend("starting container"))
        };

        if result.is_err() && auto_remove {
            tracing::trace!("cleaning up container that never ran");
            if let Err(e) = self.runtime.remove_container(&runtime_id, true).await {
                tracing::debug!("couldn't clean up container {}: {}", runtime_id.short(), e);
            }
        }
        result
    }

    async fn run_reattached(&self, mut signals: mpsc::Receiver<Signal>) -> Result<()> {
        tracing::trace!("entering reattach");
        let found = tokio::select! {
            found = self.runtime.reattach_container(&self.id, self.scope.clone()) => found,
            _ = self.scope.cancelled() => return Err(CoreError::Cancelled),
        };

        match found {
            Err(RuntimeError::Cancelled) => Err(CoreError::Cancelled),
            Err(e) => Err(ContainerFailure::new(FailureType::RestoreError, e.to_string()).into()),
            Ok(Reattached::Exited(code)) => exit_result(ExitStatus::code(code)),
            Ok(Reattached::Missing) => {
                Err(ContainerFailure::new(FailureType::ContainerMissing, GONE_ON_REATTACH).into())
            }
            Ok(Reattached::Running(running)) => self.monitor(running, &mut signals, None).await,
        }
    }

    async fn monitor(
        &self,
        running: RunningContainer,
        signals: &mut mpsc::Receiver<Signal>,
        pending: Option<Signal>,
    ) -> Result<()> {
        tracing::trace!("in monitoring loop");
        let runtime_id = running.info.runtime_id;
        let ContainerWaiter {
            mut exit,
            mut errors,
        } = running.waiter;

        if let Some(signal) = pending {
            self.forward(&runtime_id, signal).await;
        }

        let mut errors_open = true;
        loop {
            tokio::select! {
                status = &mut exit => {
                    return match status {
                        Ok(status) => exit_result(status),
                        Err(_) => Err(match errors.try_recv() {
                            Ok(e) => waiter_failed(e),
                            Err(_) if self.scope.is_cancelled() => CoreError::Cancelled,
                            Err(_) => waiter_failed(RuntimeError::RuntimeError(
                                "waiter closed without an exit status".to_string(),
                            )),
                        }),
                    };
                }
                err = &mut errors, if errors_open => match err {
                    Ok(e) => return Err(waiter_failed(e)),
                    Err(_) => errors_open = false,
                },
                Some(signal) = signals.recv() => self.forward(&runtime_id, signal).await,
                _ = self.scope.cancelled() => {
                    tracing::trace!("container scope cancelled");
                    return Err(CoreError::Cancelled);
                }
            }
        }
    }

    async fn forward(&self, runtime_id: &RuntimeId, signal: Signal) {
        tracing::trace!("container signaled: {}", signal);
        if let Err(e) = self.runtime.signal_container(runtime_id, signal).await {
            tracing::error!("failed to signal {} with {}: {}", runtime_id.short(), signal, e);
        }
    }

    async fn finalize(&self, result: Result<()>) {
        tracing::trace!("finalizing container exit");
        if self.scope.is_cancelled() {
            tracing::warn!(outcome = ?result, "orphaning container");
            return;
        }

        let stopped = match result {
            Ok(()) => ContainerStopped::clean(),
            Err(CoreError::Failure(failure)) => ContainerStopped::failed(failure),
            Err(e) => ContainerStopped::failed(ContainerFailure::new(
                FailureType::TaskError,
                e.to_string(),
            )),
        };

        if let Err(e) = self
            .transition(ContainerState::Terminated, None, Some(stopped))
            .await
        {
            tracing::error!("finalizing container: {}", e);
        }
    }

    /// Move to `state` and publish the change.
    ///
    /// The first transition to `Terminated` fixes the value `wait` returns.
    async fn transition(
        &self,
        state: ContainerState,
        started: Option<ContainerStarted>,
        stopped: Option<ContainerStopped>,
    ) -> Result<()> {
        let changed = {
            let mut lifecycle = self.lock();
            tracing::info!("transitioning state from {} to {}", lifecycle.state, state);
            lifecycle.state = state;
            let changed = ContainerStateChanged {
                container: self.summary_of(&lifecycle),
                container_started: started,
                container_stopped: stopped,
            };
            if state == ContainerState::Terminated && lifecycle.exit.is_none() {
                lifecycle.exit = Some(changed.clone());
            }
            changed
        };

        self.publisher.publish(Event::StateChange(changed)).await
    }
}

fn exit_result(status: ExitStatus) -> Result<()> {
    tracing::trace!("container exited with {}", status.status_code);
    if let Some(message) = status.error {
        return Err(CoreError::Backend {
            stage: "receiving container exit",
            source: RuntimeError::RuntimeError(message),
        });
    }
    match status.status_code {
        0 => Ok(()),
        code => Err(ContainerFailure::exited(code).into()),
    }
}

fn waiter_failed(source: RuntimeError) -> CoreError {
    CoreError::Backend {
        stage: "failed while waiting for container to exit",
        source,
    }
}

/// Republishes backend progress as container events
struct EventShim<'a> {
    container: &'a Container,
}

#[async_trait]
impl EventSink for EventShim<'_> {
    async fn publish(&self, event: RuntimeEvent) -> cagent_runtime::Result<()> {
        let c = self.container;
        let event = match event {
            RuntimeEvent::Log(log) => Event::Log(ContainerLog {
                container_id: c.id.clone(),
                timestamp: log.timestamp,
                level: log.level,
                message: log.message,
                source: "agent".to_string(),
            }),
            RuntimeEvent::Stats(stats) => Event::Stats(ContainerStatsRecord {
                container_id: c.id.clone(),
                allocation_id: c.allocation_id.clone(),
                task_type: c.task_type.clone(),
                kind: stats.kind,
                end_stats: stats.start_time.is_none() && stats.end_time.is_some(),
                start_time: stats.start_time,
                end_time: stats.end_time,
            }),
        };

        c.publisher
            .publish(event)
            .await
            .map_err(|e| RuntimeError::EventSink(e.to_string()))
    }
}
