//! Built-in tool running a list of shell lines.
//!
//! Parameters:
//!
//! ```json
//! {
//!   "commands": ["echo hello > out.txt"],
//!   "expected_outputs": ["out.txt"],
//!   "walltime_seconds": 600,
//!   "memory_mb": 512,
//!   "cores": 1
//! }
//! ```
//!
//! Only `commands` is required. An empty list makes a local-only task.

use super::{ToolContext, ToolHandler};
use crate::execution::script::JobFiles;
use crate::models::Task;
use crate::scheduler::ResourceHints;
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
struct ShellParams {
    commands: Vec<String>,
    #[serde(default)]
    expected_outputs: Vec<String>,
    walltime_seconds: Option<u64>,
    memory_mb: Option<u64>,
    cores: Option<u32>,
}

fn parse(params: &serde_json::Value) -> anyhow::Result<ShellParams> {
    serde_json::from_value(params.clone()).context("invalid Shell parameters")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShellTool;

#[async_trait]
impl ToolHandler for ShellTool {
    fn tool_class(&self) -> &str {
        "Shell"
    }

    async fn prepare(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        let params = parse(ctx.params())?;
        if params.commands.iter().any(|line| line.contains('\0')) {
            bail!("command lines cannot contain NUL bytes");
        }
        ctx.addlog(format!("Prepared {} command line(s).", params.commands.len()));
        Ok(true)
    }

    async fn build_remote_commands(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<Vec<String>> {
        let params = parse(ctx.params())?;
        Ok(params
            .commands
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .collect())
    }

    async fn collect_results(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        let params = parse(ctx.params())?;

        if !params.commands.iter().all(|line| line.trim().is_empty()) {
            match ctx.files.exit_code().await? {
                Some(0) => {}
                Some(code) => {
                    ctx.addlog(format!("Commands exited with status {code}."));
                    return Ok(false);
                }
                None => {
                    ctx.addlog("No exit status was recorded for the commands.");
                    return Ok(false);
                }
            }
        }

        let missing: Vec<&String> = params
            .expected_outputs
            .iter()
            .filter(|name| !ctx.workdir.join(name).exists())
            .collect();
        if !missing.is_empty() {
            ctx.addlog(format!("Missing expected outputs: {missing:?}"));
            return Ok(false);
        }
        Ok(true)
    }

    fn resource_hints(&self, task: &Task) -> ResourceHints {
        let params = parse(&task.params).unwrap_or_default();
        ResourceHints {
            walltime: params.walltime_seconds.map(Duration::from_secs),
            memory_mb: params.memory_mb,
            cores: params.cores,
        }
    }

    // Shell commands are safe to run again from scratch

    async fn recover_from_setup_failure(&self, _ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn recover_from_cluster_failure(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        ctx.files.remove_stale_outputs().await?;
        Ok(true)
    }

    async fn recover_from_post_process_failure(
        &self,
        _ctx: &mut ToolContext<'_>,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn restart_at_setup(&self, _ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn restart_at_cluster(&self, _ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Carry the previous run's exit status over to the new run id
    async fn restart_at_post_process(&self, ctx: &mut ToolContext<'_>) -> anyhow::Result<bool> {
        let previous = JobFiles::for_run(ctx.task, ctx.workdir, ctx.task.run_number - 1);
        if !previous.exit_status().exists() {
            ctx.addlog("No exit status from the previous run to post-process again.");
            return Ok(false);
        }
        tokio::fs::copy(previous.exit_status(), ctx.files.exit_status()).await?;
        Ok(true)
    }
}
