//! Channel info tool - tells the model where it is speaking.

use crate::registry::{Tool, ToolContext, ToolOutcome, ToolResult};
use serde_json::{json, Value};

pub struct ChannelInfoTool;

#[async_trait::async_trait]
impl Tool for ChannelInfoTool {
    fn name(&self) -> &str {
        "channel_info"
    }

    fn description(&self) -> &str {
        "Report your bot name, the current channel id and the id of the message you are answering."
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn execute(&self, _args: Value, ctx: &ToolContext) -> ToolOutcome {
        Ok(ToolResult::Json(json!({
            "bot": ctx.bot_name,
            "channel_id": ctx.channel_id,
            "event_id": ctx.event_id,
            "subtask_depth": ctx.depth,
        })))
    }
}
