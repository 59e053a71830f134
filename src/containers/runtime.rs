use async_trait::async_trait;

use super::types::{ContainerConfig, ContainerResult, RuntimeContainer};

/// The container engine operations the lifecycle manager depends on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates and starts a container, returning its runtime id once the
    /// engine reports it started.
    async fn create_and_start(&self, config: &ContainerConfig) -> ContainerResult<String>;

    /// Lists containers (running or not) whose name starts with `prefix`.
    async fn list(&self, prefix: &str) -> ContainerResult<Vec<RuntimeContainer>>;

    async fn inspect(&self, name: &str) -> ContainerResult<Option<RuntimeContainer>>;

    /// Stops and removes `name`. Returns false when it did not exist.
    async fn stop_and_remove(&self, name: &str) -> ContainerResult<bool>;

    /// Runs `bash -c command` inside the container. Detached execs report
    /// exit code 0 once started.
    async fn exec(&self, name: &str, command: &str, detach: bool) -> ContainerResult<i64>;

    async fn ping(&self) -> ContainerResult<()>;
}
