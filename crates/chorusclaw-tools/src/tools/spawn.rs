//! Spawn tool - hands a narrower objective to a detached sub-task.
//!
//! The tool only starts the work. The sub-task runs on its own and reports
//! back through the bot's mailbox, so the calling turn finishes immediately.

use crate::registry::{Tool, ToolContext, ToolInvocationError, ToolOutcome, ToolResult};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared handle to the sub-task spawner, set after construction.
/// This breaks the circular dependency: tools need the spawner, the spawner needs tools.
pub type SpawnerHandle = Arc<RwLock<Option<Arc<dyn SubtaskSpawner>>>>;

/// Everything a spawner needs to start one sub-task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtaskRequest {
    pub bot_name: String,
    pub channel_id: String,
    pub origin_event_id: String,
    pub objective: String,
    pub context: Option<String>,
    /// Depth the sub-task itself will run at.
    pub depth: usize,
}

/// Implemented by the agent layer. Decouples the tool from the concrete runtime type.
#[async_trait::async_trait]
pub trait SubtaskSpawner: Send + Sync {
    /// Start a sub-task and return its id without waiting for it.
    async fn spawn_subtask(&self, request: SubtaskRequest) -> Result<String, String>;
}

pub struct SpawnTool {
    spawner: SpawnerHandle,
}

impl SpawnTool {
    pub fn new(spawner: SpawnerHandle) -> Self {
        Self { spawner }
    }
}

#[async_trait::async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Start a background sub-task with a narrower objective. Returns at once; the \
         sub-task's result arrives later as a separate message addressed to you."
    }

    fn prompt(&self) -> &str {
        "Use spawn for work that takes several steps and does not need to block your reply:\n\
         - OBJECTIVE: one sentence, specific enough to be finished without follow-up questions\n\
         - CONTEXT: only what the sub-task cannot work out on its own\n\
         - Tell the channel you started it; do not wait for it in the same reply"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["objective"],
            "properties": {
                "objective": {
                    "type": "string",
                    "description": "What the sub-task should accomplish. One sentence."
                },
                "context": {
                    "type": "string",
                    "description": "Optional background the sub-task needs."
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let objective = match args.get("objective").and_then(|v| v.as_str()) {
            Some(o) if !o.trim().is_empty() => o,
            _ => return Err(ToolInvocationError::invalid("spawn", "'objective' is required")),
        };
        let context = args
            .get("context")
            .and_then(|v| v.as_str())
            .filter(|c| !c.trim().is_empty())
            .map(str::to_string);

        let spawner = match self.spawner.read().await.as_ref() {
            Some(s) => s.clone(),
            None => {
                return Err(ToolInvocationError::failed(
                    "spawn",
                    "sub-tasks are not available in this gateway",
                ))
            }
        };

        let request = SubtaskRequest {
            bot_name: ctx.bot_name.clone(),
            channel_id: ctx.channel_id.clone(),
            origin_event_id: ctx.event_id.clone(),
            objective: objective.to_string(),
            context,
            depth: ctx.depth + 1,
        };

        let task_id = spawner
            .spawn_subtask(request)
            .await
            .map_err(|e| ToolInvocationError::failed("spawn", e))?;

        tracing::info!(bot = %ctx.bot_name, task = %task_id, "sub-task started");
        Ok(ToolResult::text(format!(
            "Sub-task {} started. Its result will arrive as a later message.",
            task_id
        )))
    }
}
