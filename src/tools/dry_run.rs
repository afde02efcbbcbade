//! Executor that acknowledges calls without touching any external system
//!
//! Used by the CLI until a real tool host is wired in, and by tests to
//! observe exactly which calls made it past the permission gate.

use crate::tool::{ToolContext, ToolDefinition, ToolError, ToolExecutor};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

/// A call that reached the executor
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedCall {
    pub agent: String,
    pub tool: String,
    pub args: Value,
}

#[derive(Debug, Default)]
pub struct DryRunExecutor {
    calls: Mutex<Vec<ExecutedCall>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls executed so far, in order
    pub fn calls(&self) -> Vec<ExecutedCall> {
        self.calls.lock().clone()
    }

    pub fn executed_tools(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.tool.clone()).collect()
    }
}

#[async_trait]
impl ToolExecutor for DryRunExecutor {
    async fn execute(
        &self,
        tool: &ToolDefinition,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        if ctx.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        self.calls.lock().push(ExecutedCall {
            agent: ctx.agent.clone(),
            tool: tool.id.clone(),
            args: args.clone(),
        });

        Ok(json!({
            "status": "ok",
            "dry_run": true,
            "tool": tool.id,
            "side_effect": tool.side_effect,
        }))
    }
}
