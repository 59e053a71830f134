use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("found {found} of {requested} free ports within a window of {window} probes")]
    Exhausted {
        requested: usize,
        found: usize,
        window: usize,
    },
}

/// Host ports published for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub control: u16,
    pub adb: u16,
}

/// Host ports for the VNC server and its web viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VncPorts {
    pub viewer: u16,
    pub vnc: u16,
}
