//! Labels written on every backend container launched by the agent
//!
//! The agent keeps no durable state of its own. After a restart, everything it
//! knows about a container comes back from these labels.

use crate::{ContainerId, ContainerState, ContainerSummary, Result, RuntimeError};
use cagent_config::{Device, DeviceId};
use std::collections::HashMap;

/// Marks a container as agent-managed; value is the task type
pub const CONTAINER_TYPE_LABEL: &str = "cagent.container.type";
/// Version of the label scheme below
pub const CONTAINER_VERSION_LABEL: &str = "cagent.container.version";
/// Current label scheme version
pub const CONTAINER_VERSION_VALUE: &str = "0";
pub const CONTAINER_ID_LABEL: &str = "cagent.container.id";
/// Comma separated device ids
pub const CONTAINER_DEVICES_LABEL: &str = "cagent.container.devices";
pub const CONTAINER_DESCRIPTION_LABEL: &str = "cagent.container.description";
pub const AGENT_LABEL: &str = "cagent.agent.id";
pub const CLUSTER_LABEL: &str = "cagent.cluster.id";
pub const MASTER_LABEL: &str = "cagent.master.id";

/// Label selector for listing backend containers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilter {
    pub key: String,
    pub value: String,
}

impl LabelFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// All containers launched by the given agent
    pub fn agent(agent_id: &str) -> Self {
        Self::new(AGENT_LABEL, agent_id)
    }

    /// The backend container for one scheduler container
    pub fn container(id: &ContainerId) -> Self {
        Self::new(CONTAINER_ID_LABEL, id.as_ref())
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        labels.get(&self.key).is_some_and(|v| *v == self.value)
    }
}

impl std::fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Labels identifying a container to a future agent process
pub fn container_labels(task_type: &str, summary: &ContainerSummary) -> HashMap<String, String> {
    let devices = summary
        .devices
        .iter()
        .map(|d| d.id.to_string())
        .collect::<Vec<_>>()
        .join(",");

    HashMap::from([
        (CONTAINER_TYPE_LABEL.to_string(), task_type.to_string()),
        (
            CONTAINER_VERSION_LABEL.to_string(),
            CONTAINER_VERSION_VALUE.to_string(),
        ),
        (CONTAINER_ID_LABEL.to_string(), summary.id.to_string()),
        (CONTAINER_DEVICES_LABEL.to_string(), devices),
        (
            CONTAINER_DESCRIPTION_LABEL.to_string(),
            summary.description.clone(),
        ),
    ])
}

/// Rebuild a container summary from its backend labels and status
pub fn parse_container_labels(
    labels: &HashMap<String, String>,
    status: &str,
    inventory: &[Device],
) -> Result<ContainerSummary> {
    match labels.get(CONTAINER_VERSION_LABEL).map(String::as_str) {
        Some(CONTAINER_VERSION_VALUE) => {}
        Some(other) => {
            return Err(RuntimeError::Unsupported(format!(
                "container label version {}",
                other
            )))
        }
        None => {
            return Err(RuntimeError::RuntimeError(format!(
                "container is missing label {}",
                CONTAINER_VERSION_LABEL
            )))
        }
    }

    let id = labels
        .get(CONTAINER_ID_LABEL)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            RuntimeError::RuntimeError(format!("container is missing label {}", CONTAINER_ID_LABEL))
        })?;

    let state = ContainerState::from_backend_status(status).ok_or_else(|| {
        RuntimeError::RuntimeError(format!("unexpected container status: {}", status))
    })?;

    let devices = match labels.get(CONTAINER_DEVICES_LABEL) {
        Some(raw) => parse_devices(raw, inventory)?,
        None => Vec::new(),
    };

    Ok(ContainerSummary {
        id: ContainerId::new(id.as_str()),
        state,
        devices,
        description: labels
            .get(CONTAINER_DESCRIPTION_LABEL)
            .cloned()
            .unwrap_or_default(),
    })
}

fn parse_devices(raw: &str, inventory: &[Device]) -> Result<Vec<Device>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let id: DeviceId = s.parse().map_err(|_| {
                RuntimeError::RuntimeError(format!("invalid device id in labels: {}", s))
            })?;
            inventory
                .iter()
                .find(|d| d.id == id)
                .cloned()
                .ok_or_else(|| {
                    RuntimeError::RuntimeError(format!("unknown device in labels: {}", id))
                })
        })
        .collect()
}
