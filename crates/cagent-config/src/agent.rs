//! Agent configuration for cagent
//!
//! Located at `~/.config/cagent/config.toml`

use crate::{ConfigError, Device, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default number of terminal events kept for containers that are no longer tracked
pub const DEFAULT_RECENT_EXITS_CACHE_SIZE: usize = 32;

/// Agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentOptions,
    pub master: MasterOptions,
    pub runtime: RuntimeOptions,
    pub devices: Vec<Device>,
}

/// Agent identity and container policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOptions {
    /// Identity of this agent, written as a label on every container it launches
    pub agent_id: String,
    /// Capacity of the ring of recent terminal events
    pub recent_exits_cache_size: usize,
    /// Keep containers around after they exit
    pub container_auto_remove_disabled: bool,
    /// Extra `KEY=VALUE` entries injected into every container environment
    pub global_env: Vec<String>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            agent_id: "default".to_string(),
            recent_exits_cache_size: DEFAULT_RECENT_EXITS_CACHE_SIZE,
            container_auto_remove_disabled: false,
            global_env: Vec::new(),
        }
    }
}

/// Where the scheduler lives, as seen by the agent and by its containers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterOptions {
    pub cluster_id: String,
    pub master_id: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Host containers should use to reach the master, if different
    pub container_master_host: Option<String>,
    /// Port containers should use to reach the master, if different
    pub container_master_port: Option<u16>,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            master_id: String::new(),
            host: "localhost".to_string(),
            port: 8080,
            tls: false,
            container_master_host: None,
            container_master_port: None,
        }
    }
}

impl MasterOptions {
    /// Master host as seen from inside a container
    pub fn effective_host(&self) -> &str {
        self.container_master_host
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(&self.host)
    }

    /// Master port as seen from inside a container
    pub fn effective_port(&self) -> u16 {
        self.container_master_port
            .filter(|p| *p != 0)
            .unwrap_or(self.port)
    }

    /// Master URL as seen from inside a container
    pub fn master_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.effective_host(), self.effective_port())
    }
}

/// Container runtime selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Backend to launch containers with ("docker" or "podman")
    pub kind: String,
    pub docker: SocketOptions,
    pub podman: SocketOptions,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            kind: "docker".to_string(),
            docker: SocketOptions {
                socket: default_docker_socket(),
            },
            podman: SocketOptions {
                socket: default_podman_socket(),
            },
        }
    }
}

/// Socket of a Docker-compatible API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketOptions {
    pub socket: String,
}

impl SocketOptions {
    /// Socket path with `~` and environment variables expanded
    pub fn expanded(&self) -> String {
        shellexpand::full(&self.socket)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| self.socket.clone())
    }
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_podman_socket() -> String {
    std::env::var("XDG_RUNTIME_DIR")
        .map(|dir| format!("{}/podman/podman.sock", dir))
        .unwrap_or_else(|_| "/run/podman/podman.sock".to_string())
}

impl AgentConfig {
    /// Load agent configuration from the default path
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load agent configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
                path: path.to_path_buf(),
                source: e,
            })?;
        config.validate()?;

        tracing::debug!(
            "Loaded config from {:?}: agent_id={}, devices={}",
            path,
            config.agent.agent_id,
            config.devices.len()
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                path: path.to_path_buf(),
                source: e,
            })?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "cagent").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Reject configurations the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.agent.agent_id.is_empty() {
            return Err(ConfigError::Invalid("agent.agent_id must not be empty".into()));
        }
        if self.agent.recent_exits_cache_size == 0 {
            return Err(ConfigError::Invalid(
                "agent.recent_exits_cache_size must be at least 1".into(),
            ));
        }
        if let Some(bad) = self.agent.global_env.iter().find(|e| !e.contains('=')) {
            return Err(ConfigError::Invalid(format!(
                "agent.global_env entry '{}' is not KEY=VALUE",
                bad
            )));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device id {}",
                    device.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceType;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.agent.agent_id, "default");
        assert_eq!(config.agent.recent_exits_cache_size, 32);
        assert_eq!(config.runtime.kind, "docker");
        assert!(config.devices.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[agent]
agent_id = "node-7"
recent_exits_cache_size = 8
global_env = ["HTTP_PROXY=http://proxy:3128"]

[master]
cluster_id = "c1"
master_id = "m1"
host = "master.internal"
port = 8443
tls = true
container_master_host = "10.0.0.2"

[runtime]
kind = "podman"

[[devices]]
id = 0
brand = "NVIDIA A100"
uuid = "GPU-0"
kind = "cuda"

[[devices]]
id = 1
kind = "cpu"

[[devices]]
id = 2
uuid = "0x6a2f"
kind = "rocm"
pci_bus = "0000:C3:00.0"
"#;

        let config: AgentConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.agent.agent_id, "node-7");
        assert_eq!(config.agent.recent_exits_cache_size, 8);
        assert_eq!(config.runtime.kind, "podman");
        assert_eq!(config.devices.len(), 3);
        assert_eq!(config.devices[0].device_type, DeviceType::Cuda);
        assert_eq!(config.devices[1].uuid, "");
        assert_eq!(config.devices[2].device_type, DeviceType::Rocm);
        assert_eq!(config.devices[2].pci_bus, "0000:C3:00.0");
        assert_eq!(config.master.master_url(), "https://10.0.0.2:8443");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig::load_from(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(config.agent.agent_id, "default");
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/config.toml");

        let mut config = AgentConfig::default();
        config.agent.agent_id = "roundtrip".to_string();
        config.devices.push(Device::new(3, DeviceType::Rocm));
        config.save_to(&path).unwrap();

        let loaded = AgentConfig::load_from(&path).unwrap();
        assert_eq!(loaded.agent.agent_id, "roundtrip");
        assert_eq!(loaded.devices, config.devices);
    }

    #[test]
    fn test_rejects_zero_cache_size() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[agent]\nrecent_exits_cache_size = 0\n").unwrap();

        let err = AgentConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("recent_exits_cache_size"));
    }

    #[test]
    fn test_rejects_duplicate_devices() {
        let mut config = AgentConfig::default();
        config.devices.push(Device::new(0, DeviceType::Cuda));
        config.devices.push(Device::new(0, DeviceType::Cpu));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_master_url_without_overrides() {
        let master = MasterOptions::default();
        assert_eq!(master.master_url(), "http://localhost:8080");
    }
}
