use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tools::types::{EndpointSet, ToolEndpoint, TransportKind};

pub const DEFAULT_IMAGE: &str = "ghcr.io/tongyi-mai/mobile_world:latest";
pub const DEFAULT_NAME_PREFIX: &str = "mobile_world_env";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub containers: ContainerSettings,
    pub artifacts_root: PathBuf,
    pub tools: ToolSettings,
    pub server: ServerSettings,
    pub tasks: TaskSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            containers: ContainerSettings::default(),
            artifacts_root: PathBuf::from("./artifacts"),
            tools: ToolSettings::default(),
            server: ServerSettings::default(),
            tasks: TaskSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    pub name_prefix: String,
    pub image: String,
    pub control_port_start: u16,
    pub adb_port_start: u16,
    pub viewer_port_start: u16,
    pub vnc_port_start: u16,
    /// Ports the emulator image listens on inside the container.
    pub container_control_port: u16,
    pub container_adb_port: u16,
    pub container_viewer_port: u16,
    pub container_vnc_port: u16,
    pub port_scan_window: usize,
    pub max_concurrent_launches: usize,
    pub ready_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub privileged: bool,
    pub auto_remove: bool,
    /// Also allocates and publishes the VNC and web viewer ports.
    pub enable_vnc: bool,
    /// `.env` file handed to the in-container server, typically holding
    /// tool-server API keys.
    pub env_file: Option<PathBuf>,
    pub server_command: String,
    pub server_process_pattern: String,
    pub restart_settle_ms: u64,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            control_port_start: 6800,
            adb_port_start: 5556,
            viewer_port_start: 7860,
            vnc_port_start: 5800,
            container_control_port: 6800,
            container_adb_port: 5556,
            container_viewer_port: 7860,
            container_vnc_port: 5800,
            port_scan_window: 1000,
            max_concurrent_launches: 4,
            ready_timeout_secs: 600,
            poll_interval_ms: 1000,
            privileged: true,
            auto_remove: true,
            enable_vnc: false,
            env_file: None,
            server_command: "cd /app/service && uv run mobile-world server --port 6800 --enable-mcp"
                .to_string(),
            server_process_pattern: "mobile-world server".to_string(),
            restart_settle_ms: 2000,
        }
    }
}

impl ContainerSettings {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub call_timeout_secs: u64,
    pub servers: BTreeMap<String, ToolServerSettings>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: 60,
            servers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerSettings {
    pub transport: TransportKind,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Environment variable holding a bearer token for this server.
    #[serde(default)]
    pub bearer_token_env: Option<String>,
}

impl ToolSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Resolves the configured servers into an endpoint set, reading bearer
    /// tokens from the environment.
    pub fn endpoint_set(&self) -> EndpointSet {
        let endpoints = self.servers.iter().map(|(name, server)| {
            let mut headers = server.headers.clone();
            if let Some(var) = &server.bearer_token_env {
                match std::env::var(var) {
                    Ok(token) => {
                        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
                    }
                    Err(_) => {
                        tracing::warn!(server = %name, env = %var, "bearer token variable is not set");
                    }
                }
            }
            ToolEndpoint {
                name: name.clone(),
                transport: server.transport,
                url: server.url.clone(),
                headers,
            }
        });
        EndpointSet::new(endpoints)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    pub snapshot_settle_ms: u64,
    pub agent_timeout_secs: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            snapshot_settle_ms: 2000,
            agent_timeout_secs: 600,
        }
    }
}

impl TaskSettings {
    pub fn snapshot_settle(&self) -> Duration {
        Duration::from_millis(self.snapshot_settle_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

impl Config {
    /// Loads the YAML file at `path` (defaults when absent) and applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup("ARTIFACTS_ROOT") {
            self.artifacts_root = PathBuf::from(root);
        }
        if let Some(image) = lookup("DROIDBENCH_IMAGE") {
            self.containers.image = image;
        }
        if let Some(prefix) = lookup("DROIDBENCH_NAME_PREFIX") {
            self.containers.name_prefix = prefix;
        }
    }
}
