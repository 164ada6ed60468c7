//! Launch spec augmentation
//!
//! Every container learns who launched it (environment), every backend
//! container records enough to be reattached later (labels), and gets access
//! to the GPUs it was assigned.

use crate::{CoreError, Result};
use cagent_config::{device_uuids_by_type, AgentConfig, Device, DeviceType};
use cagent_runtime::labels::{self, AGENT_LABEL, CLUSTER_LABEL, MASTER_LABEL};
use cagent_runtime::{ContainerSummary, DeviceMapping, RunSpec, Spec};
use std::collections::HashMap;
use std::path::Path;

/// Environment key carrying the owning allocation
pub const ALLOCATION_ID_ENV: &str = "CAGENT_ALLOCATION_ID";

/// udev links to DRM nodes, named by PCI address
const DRI_BY_PATH: &str = "/dev/dri/by-path";

/// Environment injected into every container launched by this agent
pub fn global_env(config: &AgentConfig) -> Vec<String> {
    let master = &config.master;
    let mut env = vec![
        format!("CAGENT_CLUSTER_ID={}", master.cluster_id),
        format!("CAGENT_MASTER_ID={}", master.master_id),
        format!("CAGENT_MASTER={}", master.master_url()),
        format!("CAGENT_MASTER_HOST={}", master.effective_host()),
        format!("CAGENT_MASTER_PORT={}", master.effective_port()),
        format!("CAGENT_AGENT_ID={}", config.agent.agent_id),
    ];
    env.extend(config.agent.global_env.iter().cloned());
    env
}

/// Labels identifying this agent on every container it launches
pub fn agent_labels(config: &AgentConfig) -> HashMap<String, String> {
    HashMap::from([
        (AGENT_LABEL.to_string(), config.agent.agent_id.clone()),
        (CLUSTER_LABEL.to_string(), config.master.cluster_id.clone()),
        (MASTER_LABEL.to_string(), config.master.master_id.clone()),
    ])
}

fn container_env(container: &ContainerSummary) -> Vec<String> {
    let slot_ids = container
        .devices
        .iter()
        .map(|d| d.id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    vec![
        format!("CAGENT_CONTAINER_ID={}", container.id),
        format!("CAGENT_SLOT_IDS=[{}]", slot_ids),
    ]
}

/// Fill in the parts of a launch spec owned by the agent
pub fn augment_spec(
    config: &AgentConfig,
    container: &ContainerSummary,
    mut spec: Spec,
) -> Result<Spec> {
    let run = &mut spec.run_spec;
    run.auto_remove = !config.agent.container_auto_remove_disabled;

    run.env.extend(global_env(config));
    run.env.extend(container_env(container));

    run.labels.extend(agent_labels(config));
    run.labels
        .extend(labels::container_labels(&spec.task_type, container));

    run.gpu_device_ids
        .extend(device_uuids_by_type(&container.devices, DeviceType::Cuda));
    if container
        .devices
        .iter()
        .any(|d| d.device_type == DeviceType::Rocm)
    {
        // The inventory knows where each card sits on the PCI bus
        let assigned: Vec<Device> = container
            .devices
            .iter()
            .map(|d| {
                config
                    .devices
                    .iter()
                    .find(|c| c.id == d.id)
                    .unwrap_or(d)
                    .clone()
            })
            .collect();
        add_rocm_devices(run, &assigned, Path::new(DRI_BY_PATH))?;
    }

    Ok(spec)
}

/// Expose the AMD compute node plus the card and render nodes of each
/// assigned ROCm device
fn add_rocm_devices(run: &mut RunSpec, devices: &[Device], by_path: &Path) -> Result<()> {
    run.security_opt.push("seccomp=unconfined".to_string());
    run.group_add.push("video".to_string());
    run.devices.push(DeviceMapping::same_path("/dev/kfd"));

    for device in devices.iter().filter(|d| d.device_type == DeviceType::Rocm) {
        if device.pci_bus.is_empty() {
            return Err(CoreError::DeviceMapping {
                device: device.id,
                reason: "no PCI bus address configured".to_string(),
            });
        }
        let bus = device.pci_bus.to_lowercase();
        for node in ["card", "render"] {
            let link = by_path.join(format!("pci-{}-{}", bus, node));
            let resolved =
                std::fs::canonicalize(&link).map_err(|e| CoreError::DeviceMapping {
                    device: device.id,
                    reason: format!("resolving {}: {}", link.display(), e),
                })?;
            tracing::debug!("mapping {} for device {}", resolved.display(), device.id);
            run.devices
                .push(DeviceMapping::same_path(resolved.to_string_lossy()));
        }
    }
    Ok(())
}

/// Allocation owning the container, if the spec names one
pub fn allocation_id(spec: &Spec) -> String {
    spec.run_spec
        .env
        .iter()
        .find_map(|e| {
            e.strip_prefix(ALLOCATION_ID_ENV)
                .and_then(|rest| rest.strip_prefix('='))
        })
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cagent_runtime::labels::{CONTAINER_DEVICES_LABEL, CONTAINER_ID_LABEL};
    use cagent_runtime::{ContainerId, ContainerState};

    fn container() -> ContainerSummary {
        let mut gpu = Device::new(1, DeviceType::Cuda);
        gpu.uuid = "GPU-1234".to_string();
        ContainerSummary::new(
            ContainerId::new("c-9"),
            ContainerState::Assigned,
            vec![Device::new(0, DeviceType::Cpu), gpu],
        )
    }

    #[test]
    fn test_augment_spec() {
        let mut config = AgentConfig::default();
        config.agent.agent_id = "node-3".to_string();
        config.agent.global_env = vec!["EXTRA=1".to_string()];
        config.master.cluster_id = "cluster".to_string();

        let mut spec = Spec::default();
        spec.task_type = "TRIAL".to_string();
        spec.run_spec.env.push("USER_VAR=x".to_string());

        let spec = augment_spec(&config, &container(), spec).unwrap();
        let run = &spec.run_spec;

        assert!(run.auto_remove);
        assert_eq!(run.env[0], "USER_VAR=x");
        assert!(run.env.contains(&"CAGENT_AGENT_ID=node-3".to_string()));
        assert!(run.env.contains(&"CAGENT_MASTER=http://localhost:8080".to_string()));
        assert!(run.env.contains(&"EXTRA=1".to_string()));
        assert!(run.env.contains(&"CAGENT_CONTAINER_ID=c-9".to_string()));
        assert!(run.env.contains(&"CAGENT_SLOT_IDS=[0,1]".to_string()));

        assert_eq!(run.labels[AGENT_LABEL], "node-3");
        assert_eq!(run.labels[CONTAINER_ID_LABEL], "c-9");
        assert_eq!(run.labels[CONTAINER_DEVICES_LABEL], "0,1");
        assert_eq!(run.gpu_device_ids, vec!["GPU-1234"]);
        assert!(run.devices.is_empty());
        assert!(run.security_opt.is_empty());
    }

    fn rocm_device(id: u32, pci_bus: &str) -> Device {
        let mut device = Device::new(id, DeviceType::Rocm);
        device.pci_bus = pci_bus.to_string();
        device
    }

    #[cfg(unix)]
    #[test]
    fn test_rocm_devices_resolve_by_pci_bus() {
        let tmp = tempfile::tempdir().unwrap();
        let dri = tmp.path().join("dri");
        let by_path = dri.join("by-path");
        std::fs::create_dir_all(&by_path).unwrap();
        for node in ["card3", "renderD131"] {
            std::fs::write(dri.join(node), "").unwrap();
        }
        std::os::unix::fs::symlink("../card3", by_path.join("pci-0000:c3:00.0-card")).unwrap();
        std::os::unix::fs::symlink("../renderD131", by_path.join("pci-0000:c3:00.0-render"))
            .unwrap();

        let mut run = RunSpec::default();
        let devices = vec![Device::new(0, DeviceType::Cpu), rocm_device(1, "0000:C3:00.0")];
        add_rocm_devices(&mut run, &devices, &by_path).unwrap();

        let card = std::fs::canonicalize(dri.join("card3")).unwrap();
        let render = std::fs::canonicalize(dri.join("renderD131")).unwrap();
        assert_eq!(
            run.devices,
            vec![
                DeviceMapping::same_path("/dev/kfd"),
                DeviceMapping::same_path(card.to_string_lossy()),
                DeviceMapping::same_path(render.to_string_lossy()),
            ]
        );
        assert_eq!(run.security_opt, vec!["seccomp=unconfined"]);
        assert_eq!(run.group_add, vec!["video"]);
    }

    #[test]
    fn test_rocm_device_needs_resolvable_nodes() {
        let tmp = tempfile::tempdir().unwrap();

        let err = add_rocm_devices(&mut RunSpec::default(), &[rocm_device(2, "")], tmp.path())
            .unwrap_err();
        assert!(matches!(err, CoreError::DeviceMapping { device: 2, .. }));

        let err = add_rocm_devices(
            &mut RunSpec::default(),
            &[rocm_device(2, "0000:c3:00.0")],
            tmp.path(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("pci-0000:c3:00.0-card"));
    }

    #[test]
    fn test_auto_remove_disabled() {
        let mut config = AgentConfig::default();
        config.agent.container_auto_remove_disabled = true;
        let spec = augment_spec(&config, &container(), Spec::default()).unwrap();
        assert!(!spec.run_spec.auto_remove);
    }

    #[test]
    fn test_allocation_id() {
        let mut spec = Spec::default();
        assert_eq!(allocation_id(&spec), "");

        spec.run_spec.env = vec![
            "CAGENT_ALLOCATION_ID_OTHER=no".to_string(),
            "CAGENT_ALLOCATION_ID=alloc-42".to_string(),
        ];
        assert_eq!(allocation_id(&spec), "alloc-42");
    }
}
