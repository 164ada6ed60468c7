//! Recovering containers after an agent restart or a master connection blip

use super::ContainerManager;
use crate::container::GONE_ON_REATTACH;
use crate::{Container, ContainerFailure, CoreError, FailureType, Result};
use cagent_runtime::labels::parse_container_labels;
use cagent_runtime::{ContainerSummary, LabelFilter, Signal};
use serde::{Deserialize, Serialize};

/// A container the master believes is still alive on this agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerReattach {
    pub container: ContainerSummary,
}

/// Outcome of recovering one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerReattachAck {
    pub container: ContainerSummary,
    pub failure: Option<ContainerFailure>,
}

impl ContainerReattachAck {
    fn restored(container: ContainerSummary) -> Self {
        Self {
            container,
            failure: None,
        }
    }

    fn failed(container: ContainerSummary, failure_type: FailureType, msg: impl Into<String>) -> Self {
        Self {
            container,
            failure: Some(ContainerFailure::new(failure_type, msg)),
        }
    }
}

impl ContainerManager {
    /// Rebuild containers from what the backend still runs for this agent.
    ///
    /// Backend containers nobody expects are killed. A listing failure aborts
    /// the whole call.
    pub async fn reattach_containers(
        &self,
        expected: Vec<ContainerReattach>,
    ) -> Result<Vec<ContainerReattachAck>> {
        let filter = LabelFilter::agent(&self.config.agent.agent_id);
        let mut running = self
            .runtime
            .list_running_containers(&filter)
            .await
            .map_err(CoreError::backend("listing running containers"))?;
        tracing::info!(
            "reattaching {} containers, backend reports {}",
            expected.len(),
            running.len()
        );

        let mut acks = Vec::with_capacity(expected.len());
        for ContainerReattach { container: want } in expected {
            let Some(found) = running.remove(&want.id) else {
                tracing::info!("container {} is gone", want.id);
                acks.push(ContainerReattachAck::failed(
                    want,
                    FailureType::ContainerMissing,
                    GONE_ON_REATTACH,
                ));
                continue;
            };

            let restored =
                match parse_container_labels(&found.labels, &found.status, &self.config.devices) {
                    Ok(restored) => restored,
                    Err(e) => {
                        acks.push(ContainerReattachAck::failed(
                            want,
                            FailureType::RestoreError,
                            format!("failed to restore info from container labels: {}", e),
                        ));
                        continue;
                    }
                };

            if restored.state != want.state {
                let msg = format!(
                    "container has changed state while offline. now: {}, was: {}",
                    restored.state, want.state
                );
                acks.push(ContainerReattachAck::failed(want, FailureType::RestoreError, msg));
                continue;
            }

            let mut fleet = self.fleet.write().await;
            if self.shutdown.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if let Some(stale) = fleet.containers.get(&restored.id) {
                tracing::warn!(
                    "reattach found container {} already tracked, killing it",
                    restored.id
                );
                stale.signal(Signal::SIGKILL);
                drop(fleet);
                acks.push(ContainerReattachAck::failed(
                    want,
                    FailureType::RestoreError,
                    "container is already tracked by this agent",
                ));
                continue;
            }

            tracing::info!("reattaching container {} in state {}", restored.id, restored.state);
            let container = Container::reattach(
                restored.clone(),
                self.runtime.clone(),
                self.publisher.clone(),
                &self.shutdown,
            );
            fleet.containers.insert(restored.id.clone(), container.clone());
            drop(fleet);

            self.watch(container);
            acks.push(ContainerReattachAck::restored(restored));
        }

        for (id, orphan) in running {
            tracing::info!("will kill container {}", id);
            if let Err(e) = self
                .runtime
                .signal_container(&orphan.runtime_id, Signal::SIGKILL)
                .await
            {
                tracing::warn!("failed to kill unexpected container {}: {}", id, e);
            }
        }

        Ok(acks)
    }

    /// Answer for each container from memory alone, without asking the backend
    pub async fn revalidate_containers(
        &self,
        expected: Vec<ContainerReattach>,
    ) -> Vec<ContainerReattachAck> {
        let fleet = self.fleet.read().await;
        expected
            .into_iter()
            .map(|ContainerReattach { container: want }| {
                if let Some(live) = fleet.containers.get(&want.id) {
                    return ContainerReattachAck::restored(live.summary());
                }
                match fleet.recent_exits.find(&want.id) {
                    Some(exit) => ContainerReattachAck {
                        container: exit.container.clone(),
                        failure: exit.failure().cloned(),
                    },
                    None => ContainerReattachAck::failed(
                        want,
                        FailureType::RestoreError,
                        "failed to restore container on master blip",
                    ),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::Event;
    use cagent_runtime::{ContainerId, ContainerState, RuntimeError};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn test_manager(mock: &Arc<MockRuntime>) -> (ContainerManager, tokio::sync::mpsc::Receiver<Event>) {
        let (publisher, rx) = test_publisher();
        let manager = ContainerManager::new(test_config(2), mock.clone(), publisher);
        (manager, rx)
    }

    fn running(id: &str) -> ContainerSummary {
        ContainerSummary::new(ContainerId::new(id), ContainerState::Running, vec![])
    }

    fn expect(summaries: &[ContainerSummary]) -> Vec<ContainerReattach> {
        summaries
            .iter()
            .map(|s| ContainerReattach { container: s.clone() })
            .collect()
    }

    fn set_listed(mock: &MockRuntime, agent_id: &str, summaries: &[ContainerSummary]) {
        let listed: HashMap<_, _> = summaries
            .iter()
            .map(|s| (s.id.clone(), listed_container(agent_id, s)))
            .collect();
        *mock.list_result.lock().unwrap() = Ok(listed);
    }

    // ==================== Reattach ====================

    #[tokio::test]
    async fn test_reattach_subset_and_kill_orphans() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, _rx) = test_manager(&mock);

        let a = running("a");
        let b = running("b");
        let c = running("c");
        let orphan = running("orphan");
        set_listed(&mock, "test-agent", &[a.clone(), c.clone(), orphan.clone()]);
        for id in ["a", "c"] {
            mock.set_reattach(id, MockReattach::Running);
        }

        let acks = manager
            .reattach_containers(expect(&[a.clone(), b.clone(), c.clone()]))
            .await
            .unwrap();
        assert_eq!(acks.len(), 3);

        let by_id: HashMap<_, _> = acks
            .iter()
            .map(|ack| (ack.container.id.to_string(), ack))
            .collect();
        assert!(by_id["a"].failure.is_none());
        assert!(by_id["c"].failure.is_none());
        let gone = by_id["b"].failure.as_ref().unwrap();
        assert_eq!(gone.failure_type, FailureType::ContainerMissing);
        assert_eq!(gone.err_msg, GONE_ON_REATTACH);

        assert_eq!(manager.num_containers().await, 2);
        assert!(mock.was_called(&MockCall::Signal {
            runtime_id: mock_runtime_id("orphan"),
            signal: Signal::SIGKILL,
        }));
        assert!(mock.was_called(&MockCall::List {
            filter: "cagent.agent.id=test-agent".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_reattach_ignores_other_agents() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, _rx) = test_manager(&mock);
        set_listed(&mock, "someone-else", &[running("x")]);

        let acks = manager.reattach_containers(Vec::new()).await.unwrap();
        assert!(acks.is_empty());
        assert!(!mock
            .get_calls()
            .iter()
            .any(|c| matches!(c, MockCall::Signal { .. })));
    }

    #[tokio::test]
    async fn test_reattach_listing_error_aborts() {
        let mock = Arc::new(MockRuntime::new());
        *mock.list_result.lock().unwrap() =
            Err(RuntimeError::ConnectionError("daemon down".to_string()));
        let (manager, _rx) = test_manager(&mock);

        let err = manager
            .reattach_containers(expect(&[running("a")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("daemon down"));
        assert_eq!(manager.num_containers().await, 0);
    }

    #[tokio::test]
    async fn test_reattach_state_drift_is_error() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, _rx) = test_manager(&mock);
        set_listed(&mock, "test-agent", &[running("a")]);

        let was = ContainerSummary::new(ContainerId::new("a"), ContainerState::Starting, vec![]);
        let acks = manager.reattach_containers(expect(&[was])).await.unwrap();
        let failure = acks[0].failure.as_ref().unwrap();
        assert_eq!(failure.failure_type, FailureType::RestoreError);
        assert_eq!(
            failure.err_msg,
            "container has changed state while offline. now: running, was: starting"
        );
        assert_eq!(manager.num_containers().await, 0);
    }

    #[tokio::test]
    async fn test_reattach_bad_labels() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, _rx) = test_manager(&mock);

        let a = running("a");
        let mut listed = listed_container("test-agent", &a);
        listed
            .labels
            .insert(cagent_runtime::labels::CONTAINER_DEVICES_LABEL.to_string(), "9".to_string());
        *mock.list_result.lock().unwrap() = Ok(HashMap::from([(a.id.clone(), listed)]));

        let acks = manager.reattach_containers(expect(&[a])).await.unwrap();
        let failure = acks[0].failure.as_ref().unwrap();
        assert_eq!(failure.failure_type, FailureType::RestoreError);
        assert!(failure
            .err_msg
            .starts_with("failed to restore info from container labels"));
    }

    #[tokio::test]
    async fn test_reattached_container_exits() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, mut rx) = test_manager(&mock);
        let a = running("a");
        set_listed(&mock, "test-agent", &[a.clone()]);
        mock.set_reattach("a", MockReattach::Running);

        manager.reattach_containers(expect(&[a])).await.unwrap();
        let m = mock.clone();
        eventually(move || m.is_running(&mock_runtime_id("a"))).await;
        mock.exit(&mock_runtime_id("a"), 3);

        let exit = next_state_change(&mut rx, "a").await;
        assert_eq!(exit.container.state, ContainerState::Terminated);
        assert_eq!(exit.failure().unwrap().exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_reattach_already_tracked_kills_stale() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, mut rx) = test_manager(&mock);
        let a = running("a");
        set_listed(&mock, "test-agent", &[a.clone()]);
        mock.set_reattach("a", MockReattach::Running);

        manager.reattach_containers(expect(&[a.clone()])).await.unwrap();
        let m = mock.clone();
        eventually(move || m.is_running(&mock_runtime_id("a"))).await;

        let acks = manager.reattach_containers(expect(&[a])).await.unwrap();
        let failure = acks[0].failure.as_ref().unwrap();
        assert_eq!(failure.failure_type, FailureType::RestoreError);
        assert_eq!(failure.err_msg, "container is already tracked by this agent");

        let exit = loop {
            let change = next_state_change(&mut rx, "a").await;
            if change.container.state == ContainerState::Terminated {
                break change;
            }
        };
        assert_eq!(exit.failure().unwrap().exit_code, Some(KILLED_EXIT_CODE));
        assert!(mock.was_called(&MockCall::Signal {
            runtime_id: mock_runtime_id("a"),
            signal: Signal::SIGKILL,
        }));
    }

    #[tokio::test]
    async fn test_reattach_after_shutdown_is_rejected() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, _rx) = test_manager(&mock);
        let a = running("a");
        set_listed(&mock, "test-agent", &[a.clone()]);
        mock.set_reattach("a", MockReattach::Running);

        manager.shutdown_token().cancel();
        let err = manager.reattach_containers(expect(&[a])).await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert_eq!(manager.num_containers().await, 0);
        assert!(!mock
            .get_calls()
            .iter()
            .any(|c| matches!(c, MockCall::Reattach { .. })));
    }

    // ==================== Revalidate ====================

    #[tokio::test]
    async fn test_revalidate() {
        let mock = Arc::new(MockRuntime::new());
        let (manager, mut rx) = test_manager(&mock);

        manager
            .start_container(start_request("live", vec![], &["sleep", "60"]))
            .await
            .unwrap();
        for _ in 0..3 {
            next_state_change(&mut rx, "live").await;
        }

        *mock.exit_on_run.lock().unwrap() = Some(2);
        manager
            .start_container(start_request("done", vec![], &["false"]))
            .await
            .unwrap();
        loop {
            let change = next_state_change(&mut rx, "done").await;
            if change.container.state == ContainerState::Terminated {
                break;
            }
        }
        eventually_untracked(&manager, "done").await;

        let acks = manager
            .revalidate_containers(expect(&[running("live"), running("done"), running("lost")]))
            .await;
        assert_eq!(acks.len(), 3);

        assert!(acks[0].failure.is_none());
        assert_eq!(acks[0].container.state, ContainerState::Running);

        assert_eq!(acks[1].container.state, ContainerState::Terminated);
        assert_eq!(acks[1].failure.as_ref().unwrap().exit_code, Some(2));

        let lost = acks[2].failure.as_ref().unwrap();
        assert_eq!(lost.failure_type, FailureType::RestoreError);
        assert_eq!(lost.err_msg, "failed to restore container on master blip");
        assert!(!mock
            .get_calls()
            .iter()
            .any(|c| matches!(c, MockCall::List { .. })));
    }

    async fn eventually_untracked(manager: &ContainerManager, id: &str) {
        let id = ContainerId::new(id);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while manager.summaries().await.iter().any(|s| s.id == id) {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
