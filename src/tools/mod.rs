//! # Tool Handlers
//!
//! Every job kind plugs into the controllers through [`ToolHandler`]: prepare
//! the work directory, produce the shell lines to run remotely, and collect
//! the results afterwards. Recovery and restart hooks are optional and
//! default to "not supported".
//!
//! ## Failure semantics
//!
//! Steps return `anyhow::Result<bool>`. `Ok(false)` is a plain failure of the
//! step, `Err(_)` is treated as a raised error. Both are caught by the
//! controller and turned into a status transition plus a task log entry;
//! neither ever reaches the driver.
//!
//! Handlers are looked up by tool class in a [`ToolRegistry`].

pub mod registry;
pub mod shell;

use crate::execution::script::JobFiles;
use crate::models::Task;
use crate::scheduler::ResourceHints;
use crate::state_machine::Stage;
use async_trait::async_trait;
use std::path::Path;

pub use registry::ToolRegistry;
pub use shell::ShellTool;

/// What a step gets to work with
pub struct ToolContext<'a> {
    pub task: &'a mut Task,
    pub workdir: &'a Path,
    pub files: &'a JobFiles,
}

impl ToolContext<'_> {
    pub fn params(&self) -> &serde_json::Value {
        &self.task.params
    }

    /// Add an entry to the task's own log; persisted by the controller
    pub fn addlog(&mut self, message: impl Into<String>) {
        self.task.addlog(message);
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Registry key, e.g. `"Shell"`
    fn tool_class(&self) -> &str;

    /// Prepare the work directory before submission
    async fn prepare(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<bool>;

    /// Shell lines to run on the cluster; empty means no remote stage
    async fn build_remote_commands(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<Vec<String>>;

    /// Inspect the outputs once the job is gone; `false` means the job failed
    async fn collect_results(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<bool>;

    /// Resource estimates for the scheduler; unset values fall back to config
    fn resource_hints(&self, _task: &Task) -> ResourceHints {
        ResourceHints::default()
    }

    async fn recover_from_setup_failure(&self, _ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn recover_from_cluster_failure(&self, _ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn recover_from_post_process_failure(
        &self,
        _ctx: &mut ToolContext<'_>,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn restart_at_setup(&self, _ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn restart_at_cluster(&self, _ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn restart_at_post_process(&self, _ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Name of the recovery hook for `stage`, as shown in task logs
pub fn recovery_hook_name(stage: Stage) -> &'static str {
    match stage {
        Stage::Setup => "recover_from_setup_failure",
        Stage::Cluster => "recover_from_cluster_failure",
        Stage::PostProcess => "recover_from_post_process_failure",
    }
}

pub fn restart_hook_name(stage: Stage) -> &'static str {
    match stage {
        Stage::Setup => "restart_at_setup",
        Stage::Cluster => "restart_at_cluster",
        Stage::PostProcess => "restart_at_post_process",
    }
}

/// Run the recovery hook matching `stage`
pub async fn run_recovery_hook(
    tool: &dyn ToolHandler,
    stage: Stage,
    ctx: &mut ToolContext<'_>,
) -> anyhow::Result<bool> {
    match stage {
        Stage::Setup => tool.recover_from_setup_failure(ctx).await,
        Stage::Cluster => tool.recover_from_cluster_failure(ctx).await,
        Stage::PostProcess => tool.recover_from_post_process_failure(ctx).await,
    }
}

/// Run the restart preparation hook matching `stage`
pub async fn run_restart_hook(
    tool: &dyn ToolHandler,
    stage: Stage,
    ctx: &mut ToolContext<'_>,
) -> anyhow::Result<bool> {
    match stage {
        Stage::Setup => tool.restart_at_setup(ctx).await,
        Stage::Cluster => tool.restart_at_cluster(ctx).await,
        Stage::PostProcess => tool.restart_at_post_process(ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTask;
    use chrono::Utc;

    struct Minimal;

    #[async_trait]
    impl ToolHandler for Minimal {
        fn tool_class(&self) -> &str {
            "Minimal"
        }

        async fn prepare(&self, _ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn build_remote_commands(
            &self,
            _ctx: &mut ToolContext<'_>,
        ) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn collect_results(&self, _ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_hooks_default_to_unsupported() {
        let mut task = NewTask::new(1, 1, "Minimal").into_task(1, Utc::now());
        let files = JobFiles::for_task(&task, "/tmp");
        let workdir = std::path::PathBuf::from("/tmp");
        let mut ctx = ToolContext {
            task: &mut task,
            workdir: &workdir,
            files: &files,
        };
        for stage in Stage::ALL {
            assert!(!run_recovery_hook(&Minimal, stage, &mut ctx).await.unwrap());
            assert!(!run_restart_hook(&Minimal, stage, &mut ctx).await.unwrap());
        }
        assert_eq!(Minimal.resource_hints(ctx.task), ResourceHints::default());
    }

    #[test]
    fn test_hook_names() {
        assert_eq!(recovery_hook_name(Stage::Cluster), "recover_from_cluster_failure");
        assert_eq!(restart_hook_name(Stage::PostProcess), "restart_at_post_process");
    }
}
