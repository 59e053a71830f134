use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinError,
};
use uuid::Uuid;

use super::{
    artifacts::ArtifactStore,
    device::{CommandOutput, DeviceController},
    registry::TaskRegistry,
    state::valid_state_transition,
    types::{
        Evaluation, RunSnapshot, RunStatus, SuccessCheck, TaskContext, TaskError, TaskReport,
        TaskSpec, TeardownOutcome,
    },
};
use crate::{config::TaskSettings, tools::ToolBridgeClient};

pub const NO_RELEVANT_INFORMATION: &str = "No more task-related information can be provided.";

/// Apps whose tasks run against the real current date; every other task
/// sees a fixed date so answers stay reproducible.
const TIME_SYNC_APPS: [&str; 3] = ["Chrome", "Maps", "MCP-arXiv"];
const FIXED_DATE: &str = "2025-10-16";

/// What an agent gets when control is handed over.
pub struct AgentSession {
    pub run_id: Uuid,
    pub task_name: String,
    pub goal: String,
    pub user_prompt: Option<String>,
    pub device: Arc<dyn DeviceController>,
}

/// The agent under test. The runtime never drives its action loop; it only
/// waits for it to finish or time out.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Operates the device and returns the final textual answer, if any.
    async fn run(&self, session: AgentSession) -> anyhow::Result<Option<String>>;
}

struct RunState {
    status: RunStatus,
    initialized: bool,
    score: Option<f64>,
    message: Option<String>,
    answer: String,
    user_prompt: Option<String>,
    evaluations: u32,
    teardown_hook_succeeded: Option<bool>,
    created_at: SystemTime,
    updated_at: SystemTime,
}

struct Run {
    id: Uuid,
    task: Arc<TaskSpec>,
    device_name: String,
    device: Arc<dyn DeviceController>,
    state: StdMutex<RunState>,
    /// Held for the whole of initialize, evaluate and tear down so those
    /// never overlap for one run.
    lifecycle: Mutex<()>,
    relevant_information: Arc<StdMutex<Option<String>>>,
}

impl Run {
    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> RunStatus {
        self.state().status
    }

    fn apply(&self, state: &mut RunState, to: RunStatus) -> Result<(), TaskError> {
        if !valid_state_transition(&state.status, &to) {
            return Err(TaskError::InvalidTransition {
                run_id: self.id,
                from: state.status,
                to,
            });
        }
        tracing::info!(run_id = %self.id, task = %self.task.name, from = %state.status, %to, "run transition");
        state.status = to;
        state.updated_at = SystemTime::now();
        Ok(())
    }

    fn transition(&self, to: RunStatus) -> Result<(), TaskError> {
        let mut state = self.state();
        self.apply(&mut state, to)
    }

    /// Evaluation and answer handoff need a completed initialization.
    fn ensure_ready(&self, operation: &'static str) -> Result<(), TaskError> {
        let state = self.state();
        if state.status.is_before_ready() || (!state.initialized && state.status != RunStatus::TornDown) {
            return Err(TaskError::NotInitialized {
                run_id: self.id,
                status: state.status,
            });
        }
        if state.status == RunStatus::TornDown {
            return Err(TaskError::InvalidState {
                run_id: self.id,
                status: state.status,
                operation,
            });
        }
        Ok(())
    }

    fn teardown_outcome(&self, already_torn_down: bool) -> TeardownOutcome {
        let state = self.state();
        TeardownOutcome {
            run_id: self.id,
            already_torn_down,
            hook_succeeded: state.teardown_hook_succeeded.unwrap_or(true),
            score: state.score,
            message: state.message.clone(),
        }
    }

    fn snapshot(&self) -> RunSnapshot {
        let state = self.state();
        RunSnapshot {
            run_id: self.id,
            task_name: self.task.name.clone(),
            device: self.device_name.clone(),
            status: state.status,
            score: state.score,
            message: state.message.clone(),
            answer: state.answer.clone(),
            user_prompt: state.user_prompt.clone(),
            evaluations: state.evaluations,
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }
}

/// Drives task runs through
/// `created → snapshot_reset → initializing → ready_for_agent → evaluating → torn_down`.
///
/// Distinct runs are independent; the only state they share is the tool
/// bridge and the artifact root.
pub struct TaskRuntime {
    registry: Arc<TaskRegistry>,
    tools: Arc<ToolBridgeClient>,
    artifacts: ArtifactStore,
    settings: TaskSettings,
    runs: RwLock<HashMap<Uuid, Arc<Run>>>,
}

impl TaskRuntime {
    pub fn new(
        registry: TaskRegistry,
        tools: Arc<ToolBridgeClient>,
        artifacts: ArtifactStore,
        settings: TaskSettings,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            tools,
            artifacts,
            settings,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn tools(&self) -> &Arc<ToolBridgeClient> {
        &self.tools
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn settings(&self) -> &TaskSettings {
        &self.settings
    }

    async fn run(&self, run_id: Uuid) -> Result<Arc<Run>, TaskError> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(TaskError::RunNotFound(run_id))
    }

    fn context(&self, run: &Run, answer: String) -> TaskContext {
        TaskContext {
            task_name: run.task.name.clone(),
            run_id: run.id,
            device_name: run.device_name.clone(),
            device: run.device.clone(),
            tools: self.tools.clone(),
            artifacts: self.artifacts.clone(),
            answer,
            relevant_information: run.relevant_information.clone(),
        }
    }

    /// Creates a run of `task_name` against `device`.
    pub async fn start_run(
        &self,
        task_name: &str,
        device_name: &str,
        device: Arc<dyn DeviceController>,
    ) -> Result<Uuid, TaskError> {
        let task = self.registry.get(task_name)?;
        let now = SystemTime::now();
        let run = Run {
            id: Uuid::new_v4(),
            relevant_information: Arc::new(StdMutex::new(task.relevant_information.clone())),
            task,
            device_name: device_name.to_string(),
            device,
            state: StdMutex::new(RunState {
                status: RunStatus::Created,
                initialized: false,
                score: None,
                message: None,
                answer: String::new(),
                user_prompt: None,
                evaluations: 0,
                teardown_hook_succeeded: None,
                created_at: now,
                updated_at: now,
            }),
            lifecycle: Mutex::new(()),
        };
        let run_id = run.id;
        tracing::info!(%run_id, task = %task_name, device = %device_name, "run created");
        self.runs.write().await.insert(run_id, Arc::new(run));
        Ok(run_id)
    }

    /// Resets the device and runs the task's initialize hook. A failure
    /// tears the run down with score 0 and is reported through the
    /// returned snapshot, not as an error.
    pub async fn initialize(&self, run_id: Uuid) -> Result<RunSnapshot, TaskError> {
        let run = self.run(run_id).await?;
        let _lifecycle = run.lifecycle.lock().await;

        let status = run.status();
        if status != RunStatus::Created {
            return Err(TaskError::InvalidTransition {
                run_id,
                from: status,
                to: RunStatus::Initializing,
            });
        }

        if let Err(reason) = self.prepare(&run).await {
            tracing::error!(%run_id, task = %run.task.name, %reason, "initialization failed");
            {
                let mut state = run.state();
                state.score = Some(0.0);
                state.message = Some(reason);
            }
            self.tear_down_locked(&run).await;
        }
        Ok(run.snapshot())
    }

    async fn prepare(&self, run: &Run) -> Result<(), String> {
        let task = &run.task;

        if let Some(tag) = task.snapshot.clone() {
            run.transition(RunStatus::SnapshotReset)
                .map_err(|e| e.to_string())?;
            tracing::debug!(run_id = %run.id, snapshot = %tag, "loading snapshot");
            let device = run.device.clone();
            let loaded = blocking(move || {
                let result = device.load_snapshot(&tag);
                if result.success {
                    // a couple of key events force the launcher to redraw
                    device.app_switch();
                    device.home();
                }
                (tag, result)
            })
            .await
            .map_err(|panic| format!("snapshot load {panic}"))?;
            if !loaded.1.success {
                return Err(format!(
                    "failed to load snapshot `{}`: {}",
                    loaded.0,
                    loaded.1.error.unwrap_or_default()
                ));
            }
            tokio::time::sleep(self.settings.snapshot_settle()).await;
        }

        run.transition(RunStatus::Initializing)
            .map_err(|e| e.to_string())?;

        if needs_time_sync(task) {
            let device = run.device.clone();
            let synced = blocking(move || device.sync_time())
                .await
                .map_err(|panic| format!("time sync {panic}"))?;
            if !synced.success {
                return Err(format!(
                    "failed to sync device time: {}",
                    synced.error.unwrap_or_default()
                ));
            }
        }

        // clear leftovers in case an earlier run skipped its teardown
        let artifacts = self.artifacts.clone();
        let device_name = run.device_name.clone();
        match blocking(move || artifacts.clear_device_state(&device_name)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(run_id = %run.id, error = %e, "failed to clear device artifacts"),
            Err(panic) => tracing::warn!(run_id = %run.id, %panic, "clearing device artifacts"),
        }

        if let Some(hook) = task.initialize.clone() {
            let ctx = self.context(run, String::new());
            match blocking(move || hook(&ctx)).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return Err("initialize hook returned false".to_string()),
                Ok(Err(e)) => return Err(format!("initialize hook failed: {e:#}")),
                Err(panic) => return Err(format!("initialize hook {panic}")),
            }
        }

        let relevant_information = run
            .relevant_information
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| NO_RELEVANT_INFORMATION.to_string());
        let prompt = user_prompt(&task.goal, &relevant_information, &current_date(task));

        if task.start_on_home_screen {
            let device = run.device.clone();
            if let Ok(result) = blocking(move || device.home()).await {
                if !result.success {
                    tracing::warn!(run_id = %run.id, error = ?result.error, "failed to return home");
                }
            }
        }

        let mut state = run.state();
        state.answer.clear();
        state.user_prompt = Some(prompt);
        state.initialized = true;
        run.apply(&mut state, RunStatus::ReadyForAgent)
            .map_err(|e| e.to_string())
    }

    /// Stores the agent's latest answer. The latest write before an
    /// evaluation starts is what that evaluation sees.
    pub async fn set_answer(&self, run_id: Uuid, answer: impl Into<String>) -> Result<(), TaskError> {
        let run = self.run(run_id).await?;
        run.ensure_ready("set_answer")?;
        let mut state = run.state();
        state.answer = answer.into();
        state.updated_at = SystemTime::now();
        Ok(())
    }

    /// Delivers an SMS to the device while the agent is working.
    pub async fn simulate_sms(
        &self,
        run_id: Uuid,
        sender: &str,
        message: &str,
    ) -> Result<CommandOutput, TaskError> {
        let run = self.run(run_id).await?;
        run.ensure_ready("simulate_sms")?;
        let device = run.device.clone();
        let (sender, message) = (sender.to_string(), message.to_string());
        blocking(move || device.simulate_sms(&sender, &message))
            .await
            .map_err(TaskError::Device)
    }

    /// Runs the task's success check. May be called again; each call
    /// replaces the stored score. Check failures become score 0.
    pub async fn evaluate(&self, run_id: Uuid) -> Result<Evaluation, TaskError> {
        let run = self.run(run_id).await?;
        // fail fast instead of queueing behind a running initialization
        run.ensure_ready("evaluate")?;
        let _lifecycle = run.lifecycle.lock().await;
        run.ensure_ready("evaluate")?;

        let answer = {
            let mut state = run.state();
            run.apply(&mut state, RunStatus::Evaluating)?;
            state.evaluations += 1;
            state.answer.clone()
        };
        tracing::info!(%run_id, task = %run.task.name, %answer, "evaluating");

        let ctx = self.context(&run, answer);
        let evaluation = run_check(&run.task.check, ctx).await;

        {
            let mut state = run.state();
            state.score = Some(evaluation.score);
            state.message = Some(evaluation.message.clone());
            state.updated_at = SystemTime::now();
        }
        tracing::info!(%run_id, score = evaluation.score, message = %evaluation.message, "evaluated");
        Ok(evaluation)
    }

    /// Runs the teardown hook and clears injected device state. A second
    /// call is a no-op that reports `already_torn_down`.
    pub async fn tear_down(&self, run_id: Uuid) -> Result<TeardownOutcome, TaskError> {
        let run = self.run(run_id).await?;
        let _lifecycle = run.lifecycle.lock().await;
        Ok(self.tear_down_locked(&run).await)
    }

    async fn tear_down_locked(&self, run: &Run) -> TeardownOutcome {
        if run.status() == RunStatus::TornDown {
            tracing::debug!(run_id = %run.id, "run already torn down");
            return run.teardown_outcome(true);
        }

        let mut hook_succeeded = true;
        if let Some(hook) = run.task.tear_down.clone() {
            let answer = run.state().answer.clone();
            let ctx = self.context(run, answer);
            match blocking(move || hook(&ctx)).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    tracing::warn!(run_id = %run.id, "teardown hook returned false");
                    hook_succeeded = false;
                }
                Ok(Err(e)) => {
                    tracing::warn!(run_id = %run.id, error = %format!("{e:#}"), "teardown hook failed");
                    hook_succeeded = false;
                }
                Err(panic) => {
                    tracing::warn!(run_id = %run.id, %panic, "teardown hook");
                    hook_succeeded = false;
                }
            }
        }

        let artifacts = self.artifacts.clone();
        let device_name = run.device_name.clone();
        match blocking(move || artifacts.clear_device_state(&device_name)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(run_id = %run.id, error = %e, "failed to clear device artifacts"),
            Err(panic) => tracing::warn!(run_id = %run.id, %panic, "clearing device artifacts"),
        }

        {
            let mut state = run.state();
            state.answer.clear();
            state.user_prompt = None;
            state.initialized = false;
            state.teardown_hook_succeeded = Some(hook_succeeded);
            if let Err(e) = run.apply(&mut state, RunStatus::TornDown) {
                tracing::error!(run_id = %run.id, error = %e, "teardown transition rejected");
            }
        }
        run.teardown_outcome(false)
    }

    pub async fn snapshot(&self, run_id: Uuid) -> Result<RunSnapshot, TaskError> {
        Ok(self.run(run_id).await?.snapshot())
    }

    pub async fn list_runs(&self) -> Vec<RunSnapshot> {
        let mut runs: Vec<RunSnapshot> = self
            .runs
            .read()
            .await
            .values()
            .map(|run| run.snapshot())
            .collect();
        runs.sort_by_key(|run| run.created_at);
        runs
    }

    /// Forgets a run. Teardown is the caller's business.
    pub async fn discard_run(&self, run_id: Uuid) -> Result<RunSnapshot, TaskError> {
        self.runs
            .write()
            .await
            .remove(&run_id)
            .map(|run| run.snapshot())
            .ok_or(TaskError::RunNotFound(run_id))
    }

    /// Forgets every run bound to `device`, e.g. when its container is recycled.
    pub async fn discard_runs_for_device(&self, device: &str) -> usize {
        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|_, run| run.device_name != device);
        let discarded = before - runs.len();
        if discarded > 0 {
            tracing::info!(%device, discarded, "discarded runs");
        }
        discarded
    }

    /// Runs a task end to end: initialize, hand over to `agent` for at most
    /// `agent_timeout` (the configured agent timeout when `None`), evaluate,
    /// tear down. Teardown always runs.
    pub async fn execute(
        &self,
        task_name: &str,
        device_name: &str,
        device: Arc<dyn DeviceController>,
        agent: &dyn Agent,
        agent_timeout: Option<Duration>,
    ) -> Result<TaskReport, TaskError> {
        let agent_timeout = agent_timeout.unwrap_or_else(|| self.settings.agent_timeout());
        let run_id = self.start_run(task_name, device_name, device.clone()).await?;
        let initialized = self.initialize(run_id).await?;

        if initialized.status == RunStatus::TornDown {
            let teardown = self.tear_down(run_id).await?;
            return Ok(TaskReport {
                run_id,
                task_name: task_name.to_string(),
                device: device_name.to_string(),
                initialized: false,
                agent_timed_out: false,
                answer: String::new(),
                score: initialized.score.unwrap_or(0.0),
                message: initialized.message.unwrap_or_default(),
                teardown,
            });
        }

        let session = AgentSession {
            run_id,
            task_name: task_name.to_string(),
            goal: self.registry.get(task_name)?.goal.clone(),
            user_prompt: initialized.user_prompt.clone(),
            device,
        };
        let agent_timed_out = match tokio::time::timeout(agent_timeout, agent.run(session)).await {
            Ok(Ok(Some(answer))) => {
                self.set_answer(run_id, answer).await?;
                false
            }
            Ok(Ok(None)) => false,
            Ok(Err(e)) => {
                tracing::warn!(%run_id, error = %format!("{e:#}"), "agent failed");
                false
            }
            Err(_) => {
                tracing::warn!(%run_id, ?agent_timeout, "agent timed out, evaluating anyway");
                true
            }
        };

        let answer = self.snapshot(run_id).await?.answer;
        let evaluation = match self.evaluate(run_id).await {
            Ok(evaluation) => evaluation,
            Err(e) => Evaluation::failure(e.to_string()),
        };
        let teardown = self.tear_down(run_id).await?;

        Ok(TaskReport {
            run_id,
            task_name: task_name.to_string(),
            device: device_name.to_string(),
            initialized: true,
            agent_timed_out,
            answer,
            score: evaluation.score,
            message: evaluation.message,
            teardown,
        })
    }
}

async fn run_check(check: &SuccessCheck, ctx: TaskContext) -> Evaluation {
    let outcome = match check {
        SuccessCheck::Sync(check) => {
            let check = check.clone();
            tokio::task::spawn_blocking(move || check(&ctx)).await
        }
        SuccessCheck::Async(check) => tokio::spawn(check(ctx)).await,
    };
    match outcome {
        Ok(Ok(evaluation)) => evaluation.normalized(),
        Ok(Err(e)) => Evaluation::failure(format!("evaluation failed: {e:#}")),
        Err(e) => Evaluation::failure(format!("evaluation {}", join_failure(e))),
    }
}

/// Runs blocking device or hook code off the async workers. A panic comes
/// back as `Err` with its message.
async fn blocking<T, F>(f: F) -> Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(join_failure)
}

fn join_failure(e: JoinError) -> String {
    if e.is_panic() {
        format!("panicked: {}", panic_message(e.into_panic()))
    } else {
        "was cancelled".to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

fn needs_time_sync(task: &TaskSpec) -> bool {
    task.apps
        .iter()
        .any(|app| TIME_SYNC_APPS.contains(&app.as_str()))
}

fn current_date(task: &TaskSpec) -> String {
    if needs_time_sync(task) {
        chrono::Local::now().format("%Y-%m-%d").to_string()
    } else {
        FIXED_DATE.to_string()
    }
}

/// System prompt for the simulated user that answers the agent's questions.
pub fn user_prompt(goal: &str, relevant_information: &str, today: &str) -> String {
    format!(
        "You are acting as a mobile phone user. \
         A mobile GUI agent is executing a task on your phone. \
         The task goal is: {goal}. \
         You need to answer questions from the mobile GUI agent. \
         The relevant information for the task is: {relevant_information}. \
         If the question is not related to the task or no more task-related information is available, \
         you need to refuse to answer in a polite manner. \
         DO NOT make up any information. You can ONLY give the answer based on the relevant information and the task goal. \
         Today is {today}. If the question is about the date, you need to answer the correct date based on the current date."
    )
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::Value;

    use super::*;
    use crate::tools::{ToolError, ToolInfo, ToolTransport, types::ToolEndpoint};

    #[derive(Default)]
    struct FakeDevice {
        calls: StdMutex<Vec<String>>,
        snapshot_fails: bool,
    }

    impl FakeDevice {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) -> CommandOutput {
            self.calls.lock().unwrap().push(call);
            CommandOutput::ok("")
        }
    }

    impl DeviceController for FakeDevice {
        fn serial(&self) -> &str {
            "fake"
        }

        fn load_snapshot(&self, tag: &str) -> CommandOutput {
            self.record(format!("load_snapshot {tag}"));
            if self.snapshot_fails {
                CommandOutput::failed("snapshot missing")
            } else {
                CommandOutput::ok("OK")
            }
        }

        fn home(&self) -> CommandOutput {
            self.record("home".to_string())
        }

        fn app_switch(&self) -> CommandOutput {
            self.record("app_switch".to_string())
        }

        fn push_file(&self, local: &Path, remote: &str) -> CommandOutput {
            self.record(format!("push {} {remote}", local.display()))
        }

        fn refresh_media_scan(&self, remote: &str) -> CommandOutput {
            self.record(format!("scan {remote}"))
        }

        fn simulate_sms(&self, sender: &str, message: &str) -> CommandOutput {
            self.record(format!("sms {sender} {message}"))
        }

        fn execute_shell(&self, command: &str, root: bool) -> CommandOutput {
            self.record(format!("shell root={root} {command}"))
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolTransport for NoTools {
        async fn list_tools(&self) -> Result<Vec<ToolInfo>, ToolError> {
            Err(ToolError::NoEndpoints)
        }

        async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<Vec<Value>, ToolError> {
            Err(ToolError::NoEndpoints)
        }

        fn endpoint_for(&self, _name: &str) -> Option<ToolEndpoint> {
            None
        }
    }

    fn runtime_with(tasks: Vec<TaskSpec>, artifacts: &Path) -> TaskRuntime {
        let mut registry = TaskRegistry::new();
        for task in tasks {
            registry.register(task).unwrap();
        }
        TaskRuntime::new(
            registry,
            Arc::new(ToolBridgeClient::new(NoTools, Duration::from_secs(1))),
            ArtifactStore::new(artifacts),
            TaskSettings {
                snapshot_settle_ms: 0,
                agent_timeout_secs: 1,
            },
        )
    }

    fn answer_check(expected: &'static str) -> SuccessCheck {
        SuccessCheck::sync(move |ctx| {
            Ok(if ctx.answer() == expected {
                Evaluation::success(format!("answered {expected}"))
            } else {
                Evaluation::failure(format!("expected {expected}, got '{}'", ctx.answer()))
            })
        })
    }

    #[tokio::test]
    async fn full_lifecycle_resets_initializes_evaluates_and_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(
            vec![
                TaskSpec::new("echo", "say 42", answer_check("42"))
                    .relevant_information("The number is 42.")
                    .on_tear_down(|ctx| {
                        ctx.device().execute_shell("am force-stop com.example", false);
                        Ok(true)
                    }),
            ],
            dir.path(),
        );
        let device = Arc::new(FakeDevice::default());

        let run_id = runtime.start_run("echo", "env_0", device.clone()).await.unwrap();
        assert_eq!(runtime.snapshot(run_id).await.unwrap().status, RunStatus::Created);

        let ready = runtime.initialize(run_id).await.unwrap();
        assert_eq!(ready.status, RunStatus::ReadyForAgent);
        let prompt = ready.user_prompt.unwrap();
        assert!(prompt.contains("The task goal is: say 42."));
        assert!(prompt.contains("The number is 42."));
        assert!(prompt.contains(FIXED_DATE));
        assert_eq!(
            device.calls()[..3],
            ["load_snapshot init_state", "app_switch", "home"]
        );

        runtime.set_answer(run_id, "41").await.unwrap();
        runtime.set_answer(run_id, "42").await.unwrap();
        let evaluation = runtime.evaluate(run_id).await.unwrap();
        assert_eq!(evaluation.score, 1.0);

        let teardown = runtime.tear_down(run_id).await.unwrap();
        assert!(!teardown.already_torn_down);
        assert!(teardown.hook_succeeded);
        assert_eq!(teardown.score, Some(1.0));
        assert!(device.calls().last().unwrap().contains("force-stop"));

        let again = runtime.tear_down(run_id).await.unwrap();
        assert!(again.already_torn_down);
        assert_eq!(again.score, Some(1.0));
        assert_eq!(device.calls().iter().filter(|c| c.contains("force-stop")).count(), 1);
    }

    #[tokio::test]
    async fn tasks_without_snapshot_skip_the_reset() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(
            vec![TaskSpec::new("plain", "goal", answer_check("x")).snapshot(None)],
            dir.path(),
        );
        let device = Arc::new(FakeDevice::default());
        let run_id = runtime.start_run("plain", "env_0", device.clone()).await.unwrap();

        runtime.initialize(run_id).await.unwrap();
        assert_eq!(device.calls(), vec!["home"]);
    }

    #[tokio::test]
    async fn failed_initialization_tears_down_with_zero_score() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(
            vec![TaskSpec::new("broken", "goal", answer_check("x")).on_initialize(|_| Ok(false))],
            dir.path(),
        );
        let run_id = runtime
            .start_run("broken", "env_0", Arc::new(FakeDevice::default()))
            .await
            .unwrap();

        let snapshot = runtime.initialize(run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::TornDown);
        assert_eq!(snapshot.score, Some(0.0));
        assert!(snapshot.message.unwrap().contains("returned false"));
        assert_eq!(snapshot.evaluations, 0);

        assert!(matches!(
            runtime.evaluate(run_id).await,
            Err(TaskError::InvalidState { .. })
        ));
        assert!(runtime.tear_down(run_id).await.unwrap().already_torn_down);
    }

    #[tokio::test]
    async fn snapshot_failure_aborts_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(
            vec![TaskSpec::new("t", "goal", answer_check("x"))],
            dir.path(),
        );
        let device = Arc::new(FakeDevice {
            snapshot_fails: true,
            ..FakeDevice::default()
        });
        let run_id = runtime.start_run("t", "env_0", device).await.unwrap();

        let snapshot = runtime.initialize(run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::TornDown);
        assert!(snapshot.message.unwrap().contains("snapshot missing"));
    }

    #[tokio::test]
    async fn check_errors_and_panics_score_zero() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(
            vec![
                TaskSpec::new(
                    "panics",
                    "goal",
                    SuccessCheck::sync(|_| panic!("index out of bounds")),
                ),
                TaskSpec::new(
                    "errors",
                    "goal",
                    SuccessCheck::future(|_ctx| async { Err::<Evaluation, _>(anyhow::anyhow!("backend unreachable")) }),
                ),
            ],
            dir.path(),
        );

        for (task, expected) in [("panics", "index out of bounds"), ("errors", "backend unreachable")] {
            let run_id = runtime
                .start_run(task, "env_0", Arc::new(FakeDevice::default()))
                .await
                .unwrap();
            runtime.initialize(run_id).await.unwrap();

            let evaluation = runtime.evaluate(run_id).await.unwrap();
            assert_eq!(evaluation.score, 0.0);
            assert!(evaluation.message.contains(expected), "{}", evaluation.message);
            assert!(!runtime.tear_down(run_id).await.unwrap().already_torn_down);
        }
    }

    #[tokio::test]
    async fn re_evaluation_replaces_the_score() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(vec![TaskSpec::new("t", "goal", answer_check("yes"))], dir.path());
        let run_id = runtime
            .start_run("t", "env_0", Arc::new(FakeDevice::default()))
            .await
            .unwrap();
        runtime.initialize(run_id).await.unwrap();

        runtime.set_answer(run_id, "no").await.unwrap();
        assert_eq!(runtime.evaluate(run_id).await.unwrap().score, 0.0);
        runtime.set_answer(run_id, "yes").await.unwrap();
        assert_eq!(runtime.evaluate(run_id).await.unwrap().score, 1.0);

        let snapshot = runtime.snapshot(run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Evaluating);
        assert_eq!(snapshot.score, Some(1.0));
        assert_eq!(snapshot.evaluations, 2);
    }

    #[tokio::test]
    async fn answers_require_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(vec![TaskSpec::new("t", "goal", answer_check("x"))], dir.path());
        let run_id = runtime
            .start_run("t", "env_0", Arc::new(FakeDevice::default()))
            .await
            .unwrap();

        assert!(matches!(
            runtime.set_answer(run_id, "early").await,
            Err(TaskError::NotInitialized { status: RunStatus::Created, .. })
        ));
        assert!(matches!(
            runtime.evaluate(run_id).await,
            Err(TaskError::NotInitialized { .. })
        ));
        assert!(matches!(
            runtime.snapshot(Uuid::new_v4()).await,
            Err(TaskError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn time_sensitive_apps_sync_the_clock() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(
            vec![TaskSpec::new("web", "goal", answer_check("x")).apps(["Chrome"]).snapshot(None)],
            dir.path(),
        );
        let device = Arc::new(FakeDevice::default());
        let run_id = runtime.start_run("web", "env_0", device.clone()).await.unwrap();
        runtime.initialize(run_id).await.unwrap();

        assert!(device.calls()[0].starts_with("shell root=true date @"));
    }

    #[tokio::test]
    async fn hooks_can_share_relevant_information_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(
            vec![
                TaskSpec::new("mall", "goal", SuccessCheck::sync(|ctx| {
                    let callbacks = ctx.artifacts().recent_callbacks(ctx.device_name(), 1)?;
                    Ok(Evaluation::new(if callbacks.is_empty() { 0.0 } else { 1.0 }, "callbacks"))
                }))
                .on_initialize(|ctx| {
                    ctx.set_relevant_information("My user id is mashu001.");
                    Ok(true)
                }),
            ],
            dir.path(),
        );
        let run_id = runtime
            .start_run("mall", "env_3", Arc::new(FakeDevice::default()))
            .await
            .unwrap();
        let ready = runtime.initialize(run_id).await.unwrap();
        assert!(ready.user_prompt.unwrap().contains("My user id is mashu001."));

        runtime
            .artifacts()
            .write_callback("env_3", "mall", &serde_json::json!({"order": 1}))
            .unwrap();
        assert_eq!(runtime.evaluate(run_id).await.unwrap().score, 1.0);

        runtime.tear_down(run_id).await.unwrap();
        assert!(runtime.artifacts().recent_callbacks("env_3", 1).unwrap().is_empty());
    }

    struct ScriptedAgent {
        answer: Option<&'static str>,
        delay: Duration,
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        async fn run(&self, session: AgentSession) -> anyhow::Result<Option<String>> {
            assert!(session.user_prompt.is_some());
            tokio::time::sleep(self.delay).await;
            Ok(self.answer.map(str::to_string))
        }
    }

    #[tokio::test]
    async fn execute_runs_the_whole_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(vec![TaskSpec::new("t", "goal", answer_check("done"))], dir.path());
        let agent = ScriptedAgent {
            answer: Some("done"),
            delay: Duration::ZERO,
        };

        let report = runtime
            .execute("t", "env_0", Arc::new(FakeDevice::default()), &agent, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(report.initialized);
        assert!(!report.agent_timed_out);
        assert_eq!(report.answer, "done");
        assert_eq!(report.score, 1.0);
        assert!(!report.teardown.already_torn_down);
        assert_eq!(
            runtime.snapshot(report.run_id).await.unwrap().status,
            RunStatus::TornDown
        );
    }

    #[tokio::test]
    async fn agent_timeout_still_evaluates_and_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(vec![TaskSpec::new("t", "goal", answer_check("done"))], dir.path());
        let agent = ScriptedAgent {
            answer: Some("done"),
            delay: Duration::from_secs(30),
        };

        let report = runtime
            .execute("t", "env_0", Arc::new(FakeDevice::default()), &agent, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(report.agent_timed_out);
        assert_eq!(report.score, 0.0);
        assert!(report.message.contains("got ''"));
        assert_eq!(
            runtime.snapshot(report.run_id).await.unwrap().status,
            RunStatus::TornDown
        );
    }

    #[tokio::test]
    async fn configured_agent_timeout_applies_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(vec![TaskSpec::new("t", "goal", answer_check("done"))], dir.path());
        assert_eq!(runtime.settings().agent_timeout(), Duration::from_secs(1));
        let agent = ScriptedAgent {
            answer: Some("done"),
            delay: Duration::from_secs(30),
        };

        let started = std::time::Instant::now();
        let report = runtime
            .execute("t", "env_0", Arc::new(FakeDevice::default()), &agent, None)
            .await
            .unwrap();
        assert!(report.agent_timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!report.teardown.already_torn_down);
    }

    #[tokio::test]
    async fn discarding_runs_by_device() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(vec![TaskSpec::new("t", "goal", answer_check("x"))], dir.path());
        for device in ["env_0", "env_0", "env_1"] {
            runtime
                .start_run("t", device, Arc::new(FakeDevice::default()))
                .await
                .unwrap();
        }

        assert_eq!(runtime.discard_runs_for_device("env_0").await, 2);
        let remaining = runtime.list_runs().await;
        assert_eq!(remaining.len(), 1);
        runtime.discard_run(remaining[0].run_id).await.unwrap();
        assert!(runtime.list_runs().await.is_empty());
    }
}
