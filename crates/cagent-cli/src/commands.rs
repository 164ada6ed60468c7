//! CLI command implementations

use anyhow::{anyhow, bail, Context, Result};
use cagent_config::{AgentConfig, DeviceId};
use cagent_core::launch::ALLOCATION_ID_ENV;
use cagent_core::{ChannelPublisher, ContainerManager, ContainerStateChanged, Event, StartContainer};
use cagent_runtime::labels::parse_container_labels;
use cagent_runtime::{
    ContainerId, ContainerRuntime, ContainerState, ContainerSummary, LabelFilter, RuntimeContainer,
    Signal, Spec,
};
use std::sync::Arc;

/// Events buffered between the manager and stdout
const EVENT_BUFFER: usize = 256;

/// Task type attached to containers launched from the command line
const CLI_TASK_TYPE: &str = "COMMAND";

/// Options for `cagent run`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub image: String,
    pub force_pull: bool,
    pub devices: Vec<DeviceId>,
    pub allocation: Option<String>,
    pub id: Option<String>,
    pub description: Option<String>,
    /// Shell-style entrypoint override, e.g. `"python -u"`
    pub entrypoint: Option<String>,
    pub cmd: Vec<String>,
}

/// Turn command line options into a launch request
pub fn build_request(config: &AgentConfig, opts: RunOptions) -> Result<StartContainer> {
    let devices = opts
        .devices
        .iter()
        .map(|id| {
            config
                .devices
                .iter()
                .find(|d| d.id == *id)
                .cloned()
                .ok_or_else(|| anyhow!("Device {} is not configured for this agent", id))
        })
        .collect::<Result<Vec<_>>>()?;

    let entrypoint = match opts.entrypoint.as_deref() {
        Some(raw) => Some(
            shell_words::split(raw).with_context(|| format!("Invalid entrypoint: {}", raw))?,
        ),
        None => None,
    };
    if entrypoint.is_none() && opts.cmd.is_empty() {
        bail!("No command specified");
    }

    let id = opts
        .id
        .unwrap_or_else(|| format!("cagent-{}", uuid::Uuid::new_v4()));

    let mut spec = Spec {
        task_type: CLI_TASK_TYPE.to_string(),
        ..Default::default()
    };
    spec.pull_spec.force_pull = opts.force_pull;
    spec.run_spec.image = opts.image;
    spec.run_spec.entrypoint = entrypoint;
    spec.run_spec.cmd = (!opts.cmd.is_empty()).then_some(opts.cmd);
    if let Some(allocation) = opts.allocation {
        spec.run_spec
            .env
            .push(format!("{}={}", ALLOCATION_ID_ENV, allocation));
    }

    let mut container =
        ContainerSummary::new(ContainerId::new(id), ContainerState::Assigned, devices);
    container.description = opts.description.unwrap_or_default();

    Ok(StartContainer { container, spec })
}

/// Exit code the CLI should report for a terminal event
pub fn exit_code(exit: &ContainerStateChanged) -> i32 {
    match exit.failure() {
        None => 0,
        Some(failure) => failure
            .exit_code
            .and_then(|code| i32::try_from(code).ok())
            .unwrap_or(1),
    }
}

/// Launch one container and stream its events as JSON lines until it exits.
///
/// Returns the workload's exit code.
pub async fn run(
    config: AgentConfig,
    runtime: Arc<dyn ContainerRuntime>,
    opts: RunOptions,
) -> Result<i32> {
    let req = build_request(&config, opts)?;
    let id = req.container.id.clone();

    let (publisher, mut events) = ChannelPublisher::new(EVENT_BUFFER);
    let manager = ContainerManager::new(config, runtime, Arc::new(publisher));
    manager.start_container(req).await?;
    tracing::debug!("started container {}", id);

    let mut interrupted = false;
    let code = loop {
        tokio::select! {
            event = events.recv() => {
                let event = event.ok_or_else(|| anyhow!("Event stream closed"))?;
                println!("{}", serde_json::to_string(&event)?);
                if let Event::StateChange(change) = &event {
                    if change.container.id == id && change.container.state == ContainerState::Terminated {
                        break exit_code(change);
                    }
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("Interrupted, killing container {}", id);
                manager.signal_container(&id, Signal::SIGKILL).await?;
            }
        }
    };

    manager.close().await;
    Ok(code)
}

/// List this agent's containers running at the backend
pub async fn ps(config: &AgentConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<()> {
    let filter = LabelFilter::agent(&config.agent.agent_id);
    let listed = runtime
        .list_running_containers(&filter)
        .await
        .context("Failed to list containers")?;

    if listed.is_empty() {
        println!("No containers found");
        return Ok(());
    }

    println!(
        "{:<40} {:<14} {:<12} {:<10} IMAGE",
        "CONTAINER", "RUNTIME ID", "STATE", "DEVICES"
    );
    let mut rows: Vec<_> = listed.into_values().collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    for row in &rows {
        println!("{}", ps_line(config, row));
    }
    Ok(())
}

fn ps_line(config: &AgentConfig, row: &RuntimeContainer) -> String {
    match parse_container_labels(&row.labels, &row.status, &config.devices) {
        Ok(summary) => {
            let devices = summary
                .devices
                .iter()
                .map(|d| d.id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            format!(
                "{:<40} {:<14} {:<12} {:<10} {}",
                summary.id.to_string(),
                row.runtime_id.short(),
                summary.state.to_string(),
                if devices.is_empty() { "-".to_string() } else { devices },
                row.image
            )
        }
        Err(e) => format!(
            "{:<40} {:<14} {:<12} {:<10} {} (unreadable labels: {})",
            row.name,
            row.runtime_id.short(),
            row.status,
            "?",
            row.image,
            e
        ),
    }
}

/// Show the configuration, or just where it lives
pub fn config(path_only: bool) -> Result<()> {
    let config_path = AgentConfig::config_path()?;
    if path_only {
        println!("{}", config_path.display());
        return Ok(());
    }

    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)?;
        println!("# Config file: {:?}\n", config_path);
        println!("{}", content);
    } else {
        println!("# Config file: {:?} (not created yet)\n", config_path);
        println!("# Default configuration:");
        let content = toml::to_string_pretty(&AgentConfig::default())?;
        println!("{}", content);
    }
    Ok(())
}
