//! cagent - container lifecycle agent CLI

use cagent_cli::commands::{self, RunOptions};
use cagent_config::{AgentConfig, DeviceId};
use cagent_runtime::{create_default_runtime, create_runtime, ContainerRuntime, RuntimeType};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "cagent")]
#[command(author, version, about = "Container lifecycle agent", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override the configured runtime (docker or podman)
    #[arg(long, global = true, value_parser = ["docker", "podman"])]
    runtime: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a container and stream its lifecycle events as JSON lines
    Run {
        /// Image to run
        #[arg(long, default_value = "ubuntu:22.04")]
        image: String,
        /// Pull the image even if it is present locally
        #[arg(long)]
        force_pull: bool,
        /// Device id from the inventory to assign (repeatable)
        #[arg(long = "device")]
        devices: Vec<DeviceId>,
        /// Allocation the container belongs to
        #[arg(long)]
        allocation: Option<String>,
        /// Container id (generated if not specified)
        #[arg(long)]
        id: Option<String>,
        /// Free-form description stored on the container
        #[arg(long)]
        description: Option<String>,
        /// Entrypoint override, split like a shell would
        #[arg(long)]
        entrypoint: Option<String>,
        /// Command to run
        #[arg(trailing_var_arg = true)]
        cmd: Vec<String>,
    },

    /// List this agent's running containers
    Ps,

    /// Show the agent configuration
    Config {
        /// Only print where the config file lives
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    // Logs go to stderr, stdout carries events
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Config doesn't need a runtime
    if let Commands::Config { path } = cli.command {
        commands::config(path)?;
        return Ok(0);
    }

    let config = match AgentConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Could not load config ({}), using defaults", e);
            AgentConfig::default()
        }
    };
    let runtime = connect(cli.runtime.as_deref(), &config).await?;
    let info = runtime.info();
    tracing::debug!("Connected to {} (API {})", info.runtime_type, info.api_version);

    match cli.command {
        Commands::Run {
            image,
            force_pull,
            devices,
            allocation,
            id,
            description,
            entrypoint,
            cmd,
        } => {
            let opts = RunOptions {
                image,
                force_pull,
                devices,
                allocation,
                id,
                description,
                entrypoint,
                cmd,
            };
            commands::run(config, runtime, opts).await
        }
        Commands::Ps => {
            commands::ps(&config, runtime).await?;
            Ok(0)
        }
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

async fn connect(
    kind: Option<&str>,
    config: &AgentConfig,
) -> anyhow::Result<Arc<dyn ContainerRuntime>> {
    let runtime = match kind {
        Some(kind) => {
            let runtime_type: RuntimeType = kind.parse().map_err(anyhow::Error::msg)?;
            create_runtime(runtime_type, config).await?
        }
        None => create_default_runtime(config).await?,
    };
    Ok(runtime)
}
