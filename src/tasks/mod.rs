pub mod artifacts;
pub mod builtin;
pub mod device;
pub mod registry;
pub mod runtime;
pub mod state;
pub mod types;

pub use artifacts::{ArtifactError, ArtifactStore, MallConfig};
pub use device::{AdbController, CommandOutput, DeviceController};
pub use registry::TaskRegistry;
pub use runtime::{Agent, AgentSession, TaskRuntime};
pub use types::{
    Evaluation, HookResult, RunSnapshot, RunStatus, SuccessCheck, TaskContext, TaskDescription,
    TaskError, TaskReport, TaskSpec, TeardownOutcome,
};
