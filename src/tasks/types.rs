use std::{
    collections::BTreeSet,
    fmt,
    future::Future,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::{
    artifacts::{ArtifactError, ArtifactStore},
    device::DeviceController,
};
use crate::tools::ToolBridgeClient;

pub const DEFAULT_SNAPSHOT: &str = "init_state";

/// Errors raised by task hooks. Anything a hook returns is converted to a
/// diagnostic at the runtime boundary.
pub type HookResult<T> = anyhow::Result<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    SnapshotReset,
    Initializing,
    ReadyForAgent,
    Evaluating,
    TornDown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::SnapshotReset => "snapshot_reset",
            Self::Initializing => "initializing",
            Self::ReadyForAgent => "ready_for_agent",
            Self::Evaluating => "evaluating",
            Self::TornDown => "torn_down",
        }
    }

    /// True while initialization has not completed.
    pub fn is_before_ready(&self) -> bool {
        matches!(self, Self::Created | Self::SnapshotReset | Self::Initializing)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score in `[0, 1]` plus a human readable diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub score: f64,
    pub message: String,
}

impl Evaluation {
    pub fn new(score: f64, message: impl Into<String>) -> Self {
        Self {
            score: clamp_score(score),
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(1.0, message)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(0.0, message)
    }

    /// Partial credit for `met` of `total` sub-conditions.
    pub fn partial(met: usize, total: usize, message: impl Into<String>) -> Self {
        let score = if total == 0 {
            0.0
        } else {
            met as f64 / total as f64
        };
        Self::new(score, message)
    }

    pub fn normalized(self) -> Self {
        Self::new(self.score, self.message)
    }

    pub fn is_success(&self) -> bool {
        self.score >= 1.0
    }
}

impl From<f64> for Evaluation {
    fn from(score: f64) -> Self {
        Self::new(score, String::new())
    }
}

impl From<(f64, String)> for Evaluation {
    fn from((score, message): (f64, String)) -> Self {
        Self::new(score, message)
    }
}

impl From<(f64, &str)> for Evaluation {
    fn from((score, message): (f64, &str)) -> Self {
        Self::new(score, message)
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        tracing::warn!("evaluation returned NaN, scoring 0");
        return 0.0;
    }
    if !(0.0..=1.0).contains(&score) {
        tracing::warn!(score, "evaluation score out of range, clamping");
    }
    score.clamp(0.0, 1.0)
}

/// What a hook sees of the run it belongs to. Cheap to clone; async checks
/// receive it by value.
#[derive(Clone)]
pub struct TaskContext {
    pub(crate) task_name: String,
    pub(crate) run_id: Uuid,
    pub(crate) device_name: String,
    pub(crate) device: Arc<dyn DeviceController>,
    pub(crate) tools: Arc<ToolBridgeClient>,
    pub(crate) artifacts: ArtifactStore,
    pub(crate) answer: String,
    pub(crate) relevant_information: Arc<Mutex<Option<String>>>,
}

impl TaskContext {
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn device(&self) -> &dyn DeviceController {
        self.device.as_ref()
    }

    pub fn tools(&self) -> &ToolBridgeClient {
        &self.tools
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn device_dir(&self) -> Result<PathBuf, ArtifactError> {
        self.artifacts.device_dir(&self.device_name)
    }

    /// The agent's answer as it stood when evaluation began.
    pub fn answer(&self) -> &str {
        &self.answer
    }

    /// Information the simulated user may share when the agent asks.
    pub fn set_relevant_information(&self, text: impl Into<String>) {
        if let Ok(mut slot) = self.relevant_information.lock() {
            *slot = Some(text.into());
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_name", &self.task_name)
            .field("run_id", &self.run_id)
            .field("device_name", &self.device_name)
            .field("answer", &self.answer)
            .finish_non_exhaustive()
    }
}

pub type InitHook = Arc<dyn Fn(&TaskContext) -> HookResult<bool> + Send + Sync>;
pub type TearDownHook = Arc<dyn Fn(&TaskContext) -> HookResult<bool> + Send + Sync>;
pub type SyncCheck = Arc<dyn Fn(&TaskContext) -> HookResult<Evaluation> + Send + Sync>;
pub type AsyncCheck =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, HookResult<Evaluation>> + Send + Sync>;

/// How a task decides success. Sync checks run on a blocking thread; async
/// checks are awaited and may use the tool bridge's async API.
#[derive(Clone)]
pub enum SuccessCheck {
    Sync(SyncCheck),
    Async(AsyncCheck),
}

impl SuccessCheck {
    pub fn sync<F>(check: F) -> Self
    where
        F: Fn(&TaskContext) -> HookResult<Evaluation> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(check))
    }

    pub fn future<F, Fut>(check: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult<Evaluation>> + Send + 'static,
    {
        Self::Async(Arc::new(move |ctx| check(ctx).boxed()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::Async(_) => "async",
        }
    }
}

/// A registered task: what to ask the agent, how to prepare the device and
/// how to score the outcome.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub goal: String,
    pub apps: BTreeSet<String>,
    pub snapshot: Option<String>,
    pub tags: BTreeSet<String>,
    pub relevant_information: Option<String>,
    pub start_on_home_screen: bool,
    pub(crate) initialize: Option<InitHook>,
    pub(crate) check: SuccessCheck,
    pub(crate) tear_down: Option<TearDownHook>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, goal: impl Into<String>, check: SuccessCheck) -> Self {
        Self {
            name: name.into(),
            goal: goal.into(),
            apps: BTreeSet::new(),
            snapshot: Some(DEFAULT_SNAPSHOT.to_string()),
            tags: BTreeSet::new(),
            relevant_information: None,
            start_on_home_screen: true,
            initialize: None,
            check,
            tear_down: None,
        }
    }

    pub fn apps<I, S>(mut self, apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.apps = apps.into_iter().map(Into::into).collect();
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn snapshot(mut self, tag: Option<&str>) -> Self {
        self.snapshot = tag.map(str::to_string);
        self
    }

    pub fn relevant_information(mut self, text: impl Into<String>) -> Self {
        self.relevant_information = Some(text.into());
        self
    }

    pub fn start_on_home_screen(mut self, enabled: bool) -> Self {
        self.start_on_home_screen = enabled;
        self
    }

    pub fn on_initialize<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TaskContext) -> HookResult<bool> + Send + Sync + 'static,
    {
        self.initialize = Some(Arc::new(hook));
        self
    }

    pub fn on_tear_down<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TaskContext) -> HookResult<bool> + Send + Sync + 'static,
    {
        self.tear_down = Some(Arc::new(hook));
        self
    }

    pub fn describe(&self) -> TaskDescription {
        TaskDescription {
            name: self.name.clone(),
            goal: self.goal.clone(),
            apps: self.apps.clone(),
            snapshot: self.snapshot.clone(),
            tags: self.tags.clone(),
            evaluation: self.check.kind(),
        }
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("snapshot", &self.snapshot)
            .field("apps", &self.apps)
            .field("evaluation", &self.check.kind())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskDescription {
    pub name: String,
    pub goal: String,
    pub apps: BTreeSet<String>,
    pub snapshot: Option<String>,
    pub tags: BTreeSet<String>,
    pub evaluation: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub task_name: String,
    pub device: String,
    pub status: RunStatus,
    pub score: Option<f64>,
    pub message: Option<String>,
    pub answer: String,
    pub user_prompt: Option<String>,
    pub evaluations: u32,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeardownOutcome {
    pub run_id: Uuid,
    pub already_torn_down: bool,
    pub hook_succeeded: bool,
    pub score: Option<f64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub run_id: Uuid,
    pub task_name: String,
    pub device: String,
    pub initialized: bool,
    pub agent_timed_out: bool,
    pub answer: String,
    pub score: f64,
    pub message: String,
    pub teardown: TeardownOutcome,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task `{0}` is not registered")]
    TaskNotFound(String),
    #[error("task `{0}` is already registered")]
    DuplicateTask(String),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("run {run_id} is not initialized (status {status})")]
    NotInitialized { run_id: Uuid, status: RunStatus },
    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },
    #[error("run {run_id}: {operation} is not allowed while {status}")]
    InvalidState {
        run_id: Uuid,
        status: RunStatus,
        operation: &'static str,
    },
    #[error("device operation failed: {0}")]
    Device(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_are_clamped_into_range() {
        assert_eq!(Evaluation::new(1.7, "").score, 1.0);
        assert_eq!(Evaluation::new(-0.2, "").score, 0.0);
        assert_eq!(Evaluation::new(f64::NAN, "").score, 0.0);
        assert_eq!(Evaluation::partial(2, 3, "two of three").score, 2.0 / 3.0);
        assert_eq!(Evaluation::partial(1, 0, "").score, 0.0);
    }

    #[test]
    fn bare_scores_have_empty_messages() {
        let evaluation: Evaluation = 0.5.into();
        assert_eq!(evaluation.message, "");
        let evaluation: Evaluation = (1.0, "done").into();
        assert!(evaluation.is_success());
    }

    #[test]
    fn tasks_default_to_the_init_snapshot() {
        let spec = TaskSpec::new("t", "goal", SuccessCheck::sync(|_| Ok(1.0.into())))
            .apps(["Chrome", "Maps"]);
        assert_eq!(spec.snapshot.as_deref(), Some(DEFAULT_SNAPSHOT));
        assert!(spec.start_on_home_screen);

        let description = spec.snapshot(None).describe();
        assert_eq!(description.snapshot, None);
        assert_eq!(description.evaluation, "sync");
        assert!(description.apps.contains("Maps"));
    }

    #[test]
    fn status_names_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::ReadyForAgent).unwrap(),
            "\"ready_for_agent\""
        );
        assert!(RunStatus::Initializing.is_before_ready());
        assert!(!RunStatus::Evaluating.is_before_ready());
    }
}
