pub mod docker;
pub mod health;
pub mod manager;
pub mod prereq;
pub mod runtime;
pub mod store;
pub mod types;

pub use docker::DockerRuntime;
pub use health::{HealthProbe, HttpHealthProbe};
pub use manager::ContainerManager;
pub use prereq::{PrerequisiteCheck, PrerequisiteReport};
pub use runtime::ContainerRuntime;
pub use store::RecordStore;
pub use types::{
    ContainerConfig, ContainerError, ContainerInfo, ContainerRecord, ContainerResult,
    ContainerStatus, LaunchOutcome, RemovalReport, RuntimeContainer,
};
