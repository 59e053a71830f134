//! Orchestration core for running GUI agents against containerised Android
//! emulators: container lifecycle, the task execution state machine and a
//! synchronous bridge to asynchronous tool servers.

pub mod api;
pub mod config;
pub mod containers;
pub mod ports;
pub mod tasks;
pub mod tools;

pub use config::Config;
pub use containers::manager::ContainerManager;
pub use tasks::runtime::TaskRuntime;
pub use tools::bridge::ToolBridgeClient;
