use super::{ShellTool, ToolHandler};
use crate::error::{Result, TaskerError};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Tool handlers keyed by tool class.
///
/// A fully qualified class such as `Tools::Shell` also resolves through its
/// last path segment, matching [`Task::name`](crate::models::Task::name).
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn ToolHandler>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in tools
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(ShellTool));
        registry
    }

    /// Register a handler; replaces any handler with the same class
    pub fn register(&self, tool: Arc<dyn ToolHandler>) {
        let class = tool.tool_class().to_string();
        if self.tools.insert(class.clone(), tool).is_some() {
            info!(tool_class = %class, "Replaced tool handler");
        } else {
            debug!(tool_class = %class, "Registered tool handler");
        }
    }

    pub fn get(&self, tool_class: &str) -> Result<Arc<dyn ToolHandler>> {
        if let Some(tool) = self.tools.get(tool_class) {
            return Ok(tool.value().clone());
        }
        let short = tool_class.rsplit("::").next().unwrap_or(tool_class);
        self.tools
            .get(short)
            .map(|tool| tool.value().clone())
            .ok_or_else(|| TaskerError::ToolError(format!("No handler registered for tool '{tool_class}'")))
    }

    pub fn contains(&self, tool_class: &str) -> bool {
        self.get(tool_class).is_ok()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
