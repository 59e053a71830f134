use std::{collections::HashMap, fmt, path::PathBuf, time::SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ports::{PortError, PortPair, VncPorts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Pending,
    Starting,
    Ready,
    Unhealthy,
    /// Present in the runtime but not running. Still holds its name and ports.
    Stopped,
    Removed,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Unhealthy => "unhealthy",
            Self::Stopped => "stopped",
            Self::Removed => "removed",
        }
    }

    /// Whether the record still holds its name and ports.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Removed)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to create one emulator container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub index: u32,
    pub name: String,
    pub image: String,
    pub ports: PortPair,
    /// Host ports for the VNC server and the web viewer, when VNC is enabled.
    pub vnc_ports: Option<VncPorts>,
    /// Serial the host-side ADB client uses to reach the emulator.
    pub adb_serial: String,
    pub container_control_port: u16,
    pub container_adb_port: u16,
    pub container_viewer_port: u16,
    pub container_vnc_port: u16,
    pub privileged: bool,
    pub auto_remove: bool,
    pub env: Vec<String>,
    /// Host `.env` file bind-mounted at [`SERVICE_ENV_PATH`].
    pub env_file: Option<PathBuf>,
    pub labels: HashMap<String, String>,
}

/// Where the in-container server reads tool-server keys from.
pub const SERVICE_ENV_PATH: &str = "/app/service/.env";

impl ContainerConfig {
    /// Container port to host port, for every port this config publishes.
    pub fn published_ports(&self) -> Vec<(u16, u16)> {
        let mut published = vec![
            (self.container_control_port, self.ports.control),
            (self.container_adb_port, self.ports.adb),
        ];
        if let Some(vnc) = self.vnc_ports {
            published.push((self.container_viewer_port, vnc.viewer));
            published.push((self.container_vnc_port, vnc.vnc));
        }
        published
    }
}

/// The store's view of a container this process launched or adopted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub index: u32,
    pub name: String,
    pub control_port: u16,
    pub adb_port: u16,
    pub viewer_port: Option<u16>,
    pub vnc_port: Option<u16>,
    pub adb_serial: String,
    pub image: String,
    pub created_at: SystemTime,
    pub status: ContainerStatus,
    pub container_id: Option<String>,
}

impl ContainerRecord {
    pub fn from_config(config: &ContainerConfig) -> Self {
        Self {
            index: config.index,
            name: config.name.clone(),
            control_port: config.ports.control,
            adb_port: config.ports.adb,
            viewer_port: config.vnc_ports.map(|vnc| vnc.viewer),
            vnc_port: config.vnc_ports.map(|vnc| vnc.vnc),
            adb_serial: config.adb_serial.clone(),
            image: config.image.clone(),
            created_at: SystemTime::now(),
            status: ContainerStatus::Pending,
            container_id: None,
        }
    }

    /// Host ports this record keeps others from using.
    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        [Some(self.control_port), Some(self.adb_port), self.viewer_port, self.vnc_port]
            .into_iter()
            .flatten()
            .filter(|port| *port != 0)
    }
}

/// A container as reported by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeContainer {
    pub id: Option<String>,
    pub name: String,
    pub image: Option<String>,
    pub running: bool,
    pub status: Option<String>,
    pub started_at: Option<String>,
    pub created: Option<i64>,
    /// Host port published for each container port.
    pub published: HashMap<u16, u16>,
}

impl RuntimeContainer {
    pub fn host_port_for(&self, container_port: u16) -> Option<u16> {
        self.published.get(&container_port).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub index: Option<u32>,
    pub status: ContainerStatus,
    pub running: bool,
    pub runtime_status: Option<String>,
    pub image: Option<String>,
    pub control_port: Option<u16>,
    pub adb_port: Option<u16>,
    pub viewer_port: Option<u16>,
    pub vnc_port: Option<u16>,
    pub adb_serial: Option<String>,
    pub started_at: Option<String>,
    pub created_at: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchOutcome {
    pub index: u32,
    pub name: String,
    pub control_port: u16,
    pub adb_port: u16,
    pub viewer_port: Option<u16>,
    pub vnc_port: Option<u16>,
    pub launched: bool,
    pub ready: Option<bool>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error(transparent)]
    Ports(#[from] PortError),
    #[error("failed to launch container `{}` (index {}, ports {}/{}): {reason}", .config.name, .config.index, .config.ports.control, .config.ports.adb)]
    LaunchFailed {
        config: Box<ContainerConfig>,
        reason: String,
    },
    #[error("container `{0}` not found")]
    NotFound(String),
    #[error("container name `{0}` is already tracked")]
    NameTaken(String),
    #[error("container runtime error during {operation} on `{target}`: {reason}")]
    Runtime {
        operation: &'static str,
        target: String,
        reason: String,
    },
}

impl ContainerError {
    pub fn runtime(operation: &'static str, target: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Runtime {
            operation,
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

pub type ContainerResult<T> = Result<T, ContainerError>;
