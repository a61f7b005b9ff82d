//! Test cluster builder and a scriptable tool handler.

#![allow(dead_code)]

use super::MockScheduler;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tasker_cluster::config::{ArchiveConfig, DriverConfig, ExecutionConfig};
use tasker_cluster::constants::workdir::END_OF_JOB_MARKER;
use tasker_cluster::execution::{ClusterController, JobFiles};
use tasker_cluster::models::{NewTask, Task, TaskId};
use tasker_cluster::prerequisites::PrerequisiteEvaluator;
use tasker_cluster::recovery::RecoveryController;
use tasker_cluster::state_machine::{StatusTransitionEngine, TaskStatus};
use tasker_cluster::storage::LocalDirectoryStorage;
use tasker_cluster::store::{MemoryStore, TaskStore};
use tasker_cluster::subtasks::SubtaskSubmitter;
use tasker_cluster::tools::{ShellTool, ToolContext, ToolHandler, ToolRegistry};
use tasker_cluster::worker::TaskWorker;
use tempfile::TempDir;

pub const ENDPOINT: i64 = 1;
pub const USER: i64 = 7;

/// Behavior of one [`ScriptedTool`] step, read from the task parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepBehavior {
    Succeed,
    ReturnFalse,
    RaiseError,
    Panic,
}

impl StepBehavior {
    fn of(params: &serde_json::Value, step: &str) -> Self {
        match params.get(step).and_then(serde_json::Value::as_str) {
            Some("false") => Self::ReturnFalse,
            Some("error") => Self::RaiseError,
            Some("panic") => Self::Panic,
            _ => Self::Succeed,
        }
    }

    fn run(self, step: &str) -> anyhow::Result<bool> {
        match self {
            Self::Succeed => Ok(true),
            Self::ReturnFalse => Ok(false),
            Self::RaiseError => Err(anyhow::anyhow!("{step} blew up")),
            Self::Panic => panic!("{step} panicked"),
        }
    }
}

/// Tool whose every step is driven by the task parameters and recorded.
///
/// `{"prepare": "false", "commands": ["run"], "collect": "error"}` makes
/// setup return false, submits one command line and raises at
/// post-processing. Recovery and restart hooks read `recover` and `restart`.
#[derive(Debug, Default)]
pub struct ScriptedTool {
    calls: Mutex<Vec<(TaskId, String)>>,
}

impl ScriptedTool {
    pub fn calls_for(&self, task_id: TaskId) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| *id == task_id)
            .map(|(_, step)| step.clone())
            .collect()
    }

    fn step(&self, ctx: &ToolContext<'_>, step: &str, key: &str) -> anyhow::Result<bool> {
        self.calls.lock().push((ctx.task.task_id, step.to_string()));
        StepBehavior::of(ctx.params(), key).run(step)
    }
}

#[async_trait]
impl ToolHandler for ScriptedTool {
    fn tool_class(&self) -> &str {
        "Scripted"
    }

    async fn prepare(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        self.step(ctx, "prepare", "prepare")
    }

    async fn build_remote_commands(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<Vec<String>> {
        self.calls
            .lock()
            .push((ctx.task.task_id, "build_remote_commands".to_string()));
        let commands = ctx
            .params()
            .get("commands")
            .and_then(serde_json::Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(|l| l.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(commands)
    }

    async fn collect_results(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        self.step(ctx, "collect_results", "collect")
    }

    async fn recover_from_setup_failure(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        self.step(ctx, "recover_from_setup_failure", "recover")
    }

    async fn recover_from_cluster_failure(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        self.step(ctx, "recover_from_cluster_failure", "recover")
    }

    async fn recover_from_post_process_failure(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        self.step(ctx, "recover_from_post_process_failure", "recover")
    }

    async fn restart_at_setup(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        self.step(ctx, "restart_at_setup", "restart")
    }

    async fn restart_at_cluster(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        self.step(ctx, "restart_at_cluster", "restart")
    }

    async fn restart_at_post_process(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        self.step(ctx, "restart_at_post_process", "restart")
    }
}

/// Everything a test needs around one in-memory cluster endpoint
pub struct TestCluster {
    pub dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub scheduler: Arc<MockScheduler>,
    pub tool: Arc<ScriptedTool>,
    pub controller: ClusterController,
    pub driver_config: DriverConfig,
}

impl TestCluster {
    pub async fn new() -> Self {
        Self::with_config(ExecutionConfig::default(), test_driver_config()).await
    }

    /// Post-processing never waits for late job output
    pub async fn with_config(mut execution: ExecutionConfig, driver_config: DriverConfig) -> Self {
        execution.post_process_grace_seconds = 0;
        execution.max_post_process_deferral_seconds = 0;
        Self::with_exact_config(execution, driver_config).await
    }

    pub async fn with_exact_config(mut execution: ExecutionConfig, driver_config: DriverConfig) -> Self {
        let dir = TempDir::new().expect("tempdir");
        execution.workdir_root = dir.path().join("work");

        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(MockScheduler::new());
        let tool = Arc::new(ScriptedTool::default());
        let tools = ToolRegistry::new();
        tools.register(Arc::new(ShellTool));
        tools.register(tool.clone());

        let storage = LocalDirectoryStorage::new(dir.path().join("storage"))
            .await
            .expect("storage");
        let task_store: Arc<dyn TaskStore> = store.clone();
        let controller = ClusterController::new(
            StatusTransitionEngine::with_builtin_callbacks(task_store),
            scheduler.clone(),
            Arc::new(storage),
            Arc::new(tools),
            execution,
            ArchiveConfig::default(),
        );

        Self {
            dir,
            store,
            scheduler,
            tool,
            controller,
            driver_config,
        }
    }

    pub fn worker(&self) -> TaskWorker {
        TaskWorker::new(self.controller.clone(), self.driver_config.clone())
    }

    pub fn recovery(&self) -> RecoveryController {
        RecoveryController::new(self.controller.clone())
    }

    pub fn subtasks(&self) -> SubtaskSubmitter {
        SubtaskSubmitter::new(self.controller.clone())
    }

    pub fn evaluator(&self) -> PrerequisiteEvaluator {
        PrerequisiteEvaluator::new(self.store.clone())
    }

    pub async fn create(&self, new_task: NewTask) -> Task {
        self.store.create_task(new_task).await.expect("create task")
    }

    /// A `Scripted` task with the given parameters
    pub async fn scripted(&self, params: serde_json::Value) -> Task {
        self.create(NewTask::new(USER, ENDPOINT, "Scripted").with_params(params))
            .await
    }

    pub async fn task(&self, task_id: TaskId) -> Task {
        self.store.get_task(task_id).await.expect("task exists")
    }

    pub async fn status(&self, task_id: TaskId) -> TaskStatus {
        self.task(task_id).await.status
    }

    pub async fn log_messages(&self, task_id: TaskId) -> Vec<String> {
        self.task(task_id)
            .await
            .log
            .into_iter()
            .map(|entry| entry.message)
            .collect()
    }

    pub fn workdir(&self, task: &Task) -> Option<PathBuf> {
        self.controller.existing_workdir(task)
    }

    /// Write what a finished job leaves behind for the current run
    pub async fn simulate_job_output(&self, task_id: TaskId, exit_code: i32) {
        let task = self.task(task_id).await;
        let workdir = self.workdir(&task).expect("workdir exists");
        let files = JobFiles::for_task(&task, &workdir);
        tokio::fs::write(files.exit_status(), format!("{exit_code}\n"))
            .await
            .unwrap();
        tokio::fs::write(files.wrapper_stdout(), format!("job output\n{END_OF_JOB_MARKER}\n"))
            .await
            .unwrap();
    }

    /// Run driver passes over one task until its status stops changing
    pub async fn drive(&self, task_id: TaskId, max_passes: usize) -> TaskStatus {
        let worker = self.worker();
        let mut last = self.status(task_id).await;
        for _ in 0..max_passes {
            worker.process_task(task_id).await.expect("process task");
            let now = self.status(task_id).await;
            if now == last {
                break;
            }
            last = now;
        }
        last
    }
}

/// Driver settings without recency skipping or bursts
pub fn test_driver_config() -> DriverConfig {
    DriverConfig {
        endpoint_id: ENDPOINT,
        recent_update_skip_seconds: 0,
        single_task_bursts: 1,
        single_task_burst_pause_ms: 0,
        idle_rounds_before_sleep: 2,
        ..DriverConfig::default()
    }
}

pub fn shell_params(commands: &[&str]) -> serde_json::Value {
    json!({ "commands": commands })
}
