//! Container manager - owns every container this agent is responsible for

mod reattach;

pub use reattach::*;

use crate::launch;
use crate::recent::RecentExits;
use crate::{
    Container, ContainerStateChanged, CoreError, Event, Publisher, Result, StartContainer,
};
use cagent_config::AgentConfig;
use cagent_runtime::{ContainerId, ContainerRuntime, ContainerState, ContainerSummary, Signal};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Live containers and what is remembered about finished ones
pub(crate) struct Fleet {
    pub(crate) containers: HashMap<ContainerId, Arc<Container>>,
    pub(crate) recent_exits: RecentExits,
}

/// Main container manager
pub struct ContainerManager {
    config: AgentConfig,
    runtime: Arc<dyn ContainerRuntime>,
    publisher: Arc<dyn Publisher>,
    fleet: Arc<RwLock<Fleet>>,
    /// Parent scope of every container; cancelling it detaches them all
    shutdown: CancellationToken,
    /// Tasks waiting on container exits
    watchers: TaskTracker,
}

impl ContainerManager {
    /// Create a new container manager
    pub fn new(
        config: AgentConfig,
        runtime: Arc<dyn ContainerRuntime>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let recent_exits = RecentExits::new(config.agent.recent_exits_cache_size);
        Self {
            config,
            runtime,
            publisher,
            fleet: Arc::new(RwLock::new(Fleet {
                containers: HashMap::new(),
                recent_exits,
            })),
            shutdown: CancellationToken::new(),
            watchers: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Cancelling this token detaches every container
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Launch a new container
    pub async fn start_container(&self, req: StartContainer) -> Result<()> {
        for device in &req.container.devices {
            if !self.config.devices.iter().any(|d| d.id == device.id) {
                return Err(CoreError::UnknownDevice(device.id));
            }
        }

        let id = req.container.id.clone();
        let spec = launch::augment_spec(&self.config, &req.container, req.spec)?;

        let mut fleet = self.fleet.write().await;
        if self.shutdown.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if fleet.containers.contains_key(&id) {
            return Err(CoreError::ContainerExists(id));
        }

        tracing::info!("starting container {}", id);
        let container = Container::start(
            StartContainer {
                container: req.container,
                spec,
            },
            self.runtime.clone(),
            self.publisher.clone(),
            &self.shutdown,
        );
        fleet.containers.insert(id, container.clone());
        drop(fleet);

        self.watch(container);
        Ok(())
    }

    /// Forget a container once its run-loop is done, remembering its exit
    pub(crate) fn watch(&self, container: Arc<Container>) {
        let fleet = self.fleet.clone();
        self.watchers.spawn(async move {
            let exit = container.wait().await;

            let mut fleet = fleet.write().await;
            if let Some(exit) = exit {
                fleet.recent_exits.push(exit);
            }
            let tracked = fleet
                .containers
                .get(container.id())
                .is_some_and(|c| Arc::ptr_eq(c, &container));
            if tracked {
                fleet.containers.remove(container.id());
            }
            tracing::debug!("container {} no longer tracked", container.id());
        });
    }

    /// Deliver a signal to a container.
    ///
    /// For containers that already finished, the last terminal event is
    /// published again instead, or a `ContainerMissing` failure if it was
    /// forgotten.
    pub async fn signal_container(&self, id: &ContainerId, signal: Signal) -> Result<()> {
        let missing = || {
            ContainerStateChanged::missing(
                ContainerSummary::new(id.clone(), ContainerState::Terminated, Vec::new()),
                format!(
                    "cannot signal container with {}, container actor not found: {}",
                    signal, id
                ),
            )
        };

        let resend = {
            let fleet = self.fleet.read().await;
            match fleet.containers.get(id) {
                Some(container) if !container.is_done() => {
                    container.signal(signal);
                    return Ok(());
                }
                // Finished, but its watcher hasn't untracked it yet
                Some(container) => container.exit().unwrap_or_else(missing),
                None => match fleet.recent_exits.find(id) {
                    Some(exit) => exit.clone(),
                    None => missing(),
                },
            }
        };

        tracing::debug!("resending terminal event for finished container {}", id);
        self.publisher.publish(Event::StateChange(resend)).await
    }

    /// Stop monitoring every container, leaving them running at the backend
    pub async fn detach(&self) {
        let containers = self.live().await;
        tracing::info!("detaching {} containers", containers.len());
        join_all(containers.iter().map(|c| c.detach())).await;
        self.drain_watchers().await;
    }

    /// Kill every container and wait for their terminal events
    pub async fn close(&self) {
        let containers = self.live().await;
        tracing::info!("stopping {} containers", containers.len());
        join_all(containers.iter().map(|c| c.stop())).await;
        self.drain_watchers().await;
    }

    /// Number of live containers
    pub async fn num_containers(&self) -> usize {
        self.fleet.read().await.containers.len()
    }

    /// Snapshot of every live container, ordered by id
    pub async fn summaries(&self) -> Vec<ContainerSummary> {
        let mut summaries: Vec<_> = self
            .fleet
            .read()
            .await
            .containers
            .values()
            .map(|c| c.summary())
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    async fn live(&self) -> Vec<Arc<Container>> {
        self.fleet.read().await.containers.values().cloned().collect()
    }

    async fn drain_watchers(&self) {
        self.watchers.close();
        self.watchers.wait().await;
        self.watchers.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::{FailureType, ChannelPublisher};
    use cagent_config::{Device, DeviceType};
    use tokio::sync::mpsc;

    /// Create a test manager with MockRuntime and `devices` CUDA slots
    fn test_manager(
        mock: &Arc<MockRuntime>,
        devices: u32,
    ) -> (ContainerManager, mpsc::Receiver<Event>) {
        let (publisher, rx) = test_publisher();
        let manager = ContainerManager::new(test_config(devices), mock.clone(), publisher);
        (manager, rx)
    }

    async fn run_to_exit(
        manager: &ContainerManager,
        rx: &mut mpsc::Receiver<Event>,
        id: &str,
    ) -> ContainerStateChanged {
        manager
            .start_container(start_request(id, vec![], &["true"]))
            .await
            .unwrap();
        loop {
            let change = next_state_change(rx, id).await;
            if change.container.state == ContainerState::Terminated {
                return change;
            }
        }
    }

    async fn wait_untracked(manager: &ContainerManager, expected: usize) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while manager.num_containers().await != expected {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    // ==================== Start ====================

    #[tokio::test]
    async fn test_start_tracks_container() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, mut rx) = test_manager(&mock, 2);
        let devices = manager.config().devices.clone();

        manager
            .start_container(start_request("c1", devices.clone(), &["sleep", "60"]))
            .await
            .unwrap();
        assert_eq!(manager.num_containers().await, 1);

        for _ in 0..3 {
            next_state_change(&mut rx, "c1").await;
        }
        let summaries = manager.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].state, ContainerState::Running);
        assert_eq!(summaries[0].devices, devices);
    }

    #[tokio::test]
    async fn test_start_augments_spec() {
        let mock = Arc::new(MockRuntime::new());
        *mock.exit_on_run.lock().unwrap() = Some(0);
        let (manager, mut rx) = test_manager(&mock, 0);

        run_to_exit(&manager, &mut rx, "c1").await;
        assert!(mock.was_called(&MockCall::Create {
            id: "c1".to_string(),
            image: "python:3.11".to_string()
        }));
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_device() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, _rx) = test_manager(&mock, 1);

        let err = manager
            .start_container(start_request(
                "c1",
                vec![Device::new(5, DeviceType::Cuda)],
                &["true"],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownDevice(5)));
        assert_eq!(manager.num_containers().await, 0);
        assert!(mock.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_unmappable_rocm_device() {
        let mock = Arc::new(MockRuntime::new());
        let (publisher, _rx) = test_publisher();
        let mut config = test_config(0);
        let mut gpu = Device::new(0, DeviceType::Rocm);
        gpu.pci_bus = "0000:ff:1f.7".to_string();
        config.devices.push(gpu);
        let manager = ContainerManager::new(config, mock.clone(), publisher);

        let err = manager
            .start_container(start_request(
                "c1",
                vec![Device::new(0, DeviceType::Rocm)],
                &["true"],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DeviceMapping { device: 0, .. }));
        assert!(err.to_string().contains("pci-0000:ff:1f.7-card"));
        assert_eq!(manager.num_containers().await, 0);
        assert!(mock.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_duplicate() {
        let mock = Arc::new(MockRuntime::new());
        mock.hold_pulls();
        let (manager, _rx) = test_manager(&mock, 0);

        manager
            .start_container(start_request("c1", vec![], &["true"]))
            .await
            .unwrap();
        let err = manager
            .start_container(start_request("c1", vec![], &["true"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ContainerExists(_)));
        assert_eq!(manager.num_containers().await, 1);
    }

    #[tokio::test]
    async fn test_exit_untracks_container() {
        let mock = Arc::new(MockRuntime::new());
        *mock.exit_on_run.lock().unwrap() = Some(0);
        let (manager, mut rx) = test_manager(&mock, 0);

        let exit = run_to_exit(&manager, &mut rx, "c1").await;
        assert!(exit.failure().is_none());
        wait_untracked(&manager, 0).await;

        // Same id may be reused once the first is gone
        run_to_exit(&manager, &mut rx, "c1").await;
    }

    // ==================== Signal ====================

    #[tokio::test]
    async fn test_signal_live_container() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, mut rx) = test_manager(&mock, 0);

        manager
            .start_container(start_request("c1", vec![], &["sleep", "60"]))
            .await
            .unwrap();
        for _ in 0..3 {
            next_state_change(&mut rx, "c1").await;
        }

        manager
            .signal_container(&ContainerId::new("c1"), Signal::SIGKILL)
            .await
            .unwrap();
        let exit = next_state_change(&mut rx, "c1").await;
        assert_eq!(exit.container.state, ContainerState::Terminated);
        assert_eq!(
            exit.failure().and_then(|f| f.exit_code),
            Some(KILLED_EXIT_CODE)
        );
    }

    #[tokio::test]
    async fn test_signal_resends_cached_exit() {
        let mock = Arc::new(MockRuntime::new());
        *mock.exit_on_run.lock().unwrap() = Some(4);
        let (manager, mut rx) = test_manager(&mock, 0);

        let exit = run_to_exit(&manager, &mut rx, "c1").await;
        wait_untracked(&manager, 0).await;

        manager
            .signal_container(&ContainerId::new("c1"), Signal::SIGKILL)
            .await
            .unwrap();
        let resent = next_state_change(&mut rx, "c1").await;
        assert_eq!(resent, exit);
        assert_eq!(resent.failure().unwrap().exit_code, Some(4));
    }

    #[tokio::test]
    async fn test_signal_unknown_container_is_missing() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, mut rx) = test_manager(&mock, 0);

        manager
            .signal_container(&ContainerId::new("ghost"), Signal::SIGTERM)
            .await
            .unwrap();
        let event = next_state_change(&mut rx, "ghost").await;
        let failure = event.failure().unwrap();
        assert_eq!(failure.failure_type, FailureType::ContainerMissing);
        assert!(failure.err_msg.contains("container actor not found: ghost"));
    }

    #[tokio::test]
    async fn test_ring_cache_evicts_oldest() {
        let mock = Arc::new(MockRuntime::new());
        *mock.exit_on_run.lock().unwrap() = Some(1);
        let (manager, mut rx) = test_manager(&mock, 0);
        let capacity = manager.config().agent.recent_exits_cache_size;

        for i in 0..capacity + 2 {
            run_to_exit(&manager, &mut rx, &format!("c{}", i)).await;
            wait_untracked(&manager, 0).await;
        }

        for i in 0..2 {
            let id = format!("c{}", i);
            manager
                .signal_container(&ContainerId::new(id.as_str()), Signal::SIGKILL)
                .await
                .unwrap();
            let event = next_state_change(&mut rx, &id).await;
            assert_eq!(
                event.failure().unwrap().failure_type,
                FailureType::ContainerMissing
            );
        }

        for i in 2..capacity + 2 {
            let id = format!("c{}", i);
            manager
                .signal_container(&ContainerId::new(id.as_str()), Signal::SIGKILL)
                .await
                .unwrap();
            let event = next_state_change(&mut rx, &id).await;
            let failure = event.failure().unwrap();
            assert_eq!(failure.failure_type, FailureType::ContainerFailed);
            assert_eq!(failure.exit_code, Some(1));
        }
    }

    #[tokio::test]
    async fn test_signal_finished_but_still_tracked() {
        let mock = Arc::new(MockRuntime::new());
        *mock.exit_on_run.lock().unwrap() = Some(4);
        let (manager, mut rx) = test_manager(&mock, 0);

        // Tracked without a watcher, as between exit and untracking
        let container = Container::start(
            start_request("c1", vec![], &["false"]),
            mock.clone(),
            manager.publisher.clone(),
            &manager.shutdown,
        );
        let exit = container.wait().await.unwrap();
        manager
            .fleet
            .write()
            .await
            .containers
            .insert(container.id().clone(), container.clone());
        while rx.try_recv().is_ok() {}

        manager
            .signal_container(&ContainerId::new("c1"), Signal::SIGKILL)
            .await
            .unwrap();
        let resent = next_state_change(&mut rx, "c1").await;
        assert_eq!(resent, exit);
        assert_eq!(resent.failure().unwrap().exit_code, Some(4));
        assert!(!mock
            .get_calls()
            .iter()
            .any(|c| matches!(c, MockCall::Signal { .. })));
    }

    #[tokio::test]
    async fn test_signal_detached_but_still_tracked() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, mut rx) = test_manager(&mock, 0);

        let container = Container::start(
            start_request("c1", vec![], &["sleep", "60"]),
            mock.clone(),
            manager.publisher.clone(),
            &manager.shutdown,
        );
        for _ in 0..3 {
            next_state_change(&mut rx, "c1").await;
        }
        container.detach().await;
        manager
            .fleet
            .write()
            .await
            .containers
            .insert(container.id().clone(), container.clone());

        manager
            .signal_container(&ContainerId::new("c1"), Signal::SIGTERM)
            .await
            .unwrap();
        let event = next_state_change(&mut rx, "c1").await;
        assert_eq!(
            event.failure().unwrap().failure_type,
            FailureType::ContainerMissing
        );
    }

    // ==================== Detach / Close ====================

    #[tokio::test]
    async fn test_detach_leaves_containers_running() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, mut rx) = test_manager(&mock, 0);

        for id in ["c1", "c2"] {
            manager
                .start_container(start_request(id, vec![], &["sleep", "60"]))
                .await
                .unwrap();
            for _ in 0..3 {
                next_state_change(&mut rx, id).await;
            }
        }

        manager.detach().await;
        assert_eq!(manager.num_containers().await, 0);
        assert!(!mock
            .get_calls()
            .iter()
            .any(|c| matches!(c, MockCall::Signal { .. } | MockCall::Remove { .. })));

        // Nothing was finalized, so nothing is cached
        manager
            .signal_container(&ContainerId::new("c1"), Signal::SIGKILL)
            .await
            .unwrap();
        let event = loop {
            let change = next_state_change(&mut rx, "c1").await;
            if change.failure().is_some() {
                break change;
            }
        };
        assert_eq!(
            event.failure().unwrap().failure_type,
            FailureType::ContainerMissing
        );
    }

    #[tokio::test]
    async fn test_close_kills_everything() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, mut rx) = test_manager(&mock, 0);

        manager
            .start_container(start_request("c1", vec![], &["sleep", "60"]))
            .await
            .unwrap();
        for _ in 0..3 {
            next_state_change(&mut rx, "c1").await;
        }
        mock.hold_pulls();
        manager
            .start_container(start_request("c2", vec![], &["sleep", "60"]))
            .await
            .unwrap();
        next_state_change(&mut rx, "c2").await;

        manager.close().await;
        assert_eq!(manager.num_containers().await, 0);

        let mut failures = HashMap::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::StateChange(change) = event {
                if let Some(failure) = change.failure() {
                    failures.insert(change.container.id.to_string(), failure.failure_type);
                }
            }
        }
        assert_eq!(failures["c1"], FailureType::ContainerFailed);
        assert_eq!(failures["c2"], FailureType::ContainerAborted);
    }

    #[tokio::test]
    async fn test_shutdown_token_detaches() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, mut rx) = test_manager(&mock, 0);

        manager
            .start_container(start_request("c1", vec![], &["sleep", "60"]))
            .await
            .unwrap();
        for _ in 0..3 {
            next_state_change(&mut rx, "c1").await;
        }

        manager.shutdown_token().cancel();
        wait_untracked(&manager, 0).await;
        let m = mock.clone();
        eventually(move || !m.is_running("rt-c1")).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_after_shutdown_is_rejected() {
        let mock = Arc::new(MockRuntime::new());
        *mock.exit_on_run.lock().unwrap() = Some(0);
        let (manager, mut rx) = test_manager(&mock, 0);

        manager.shutdown_token().cancel();
        let err = manager
            .start_container(start_request("c1", vec![], &["true"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert_eq!(manager.num_containers().await, 0);
        assert!(mock.get_calls().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publisher_is_injected() {
        // Two managers never see each other's events
        let mock = Arc::new(MockRuntime::new());
        *mock.exit_on_run.lock().unwrap() = Some(0);
        let (a, mut rx_a) = test_manager(&mock, 0);
        let (publisher, mut rx_b) = ChannelPublisher::new(16);
        let b = ContainerManager::new(test_config(0), mock.clone(), Arc::new(publisher));

        run_to_exit(&a, &mut rx_a, "only-a").await;
        assert_eq!(b.num_containers().await, 0);
        assert!(rx_b.try_recv().is_err());
    }
}
