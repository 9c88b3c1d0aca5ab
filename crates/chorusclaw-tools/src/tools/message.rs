//! Message tool - post an interim message to the channel mid-turn.

use crate::registry::{Tool, ToolContext, ToolInvocationError, ToolOutcome, ToolResult};
use chorusclaw_core::{OutboundMessage, TransportError};
use serde_json::{json, Value};
use std::sync::Arc;

/// Outbound path into the shared channel. Implemented by the message bus.
#[async_trait::async_trait]
pub trait ChannelPoster: Send + Sync {
    async fn post(&self, msg: OutboundMessage) -> Result<(), TransportError>;
}

pub struct MessageTool {
    poster: Arc<dyn ChannelPoster>,
}

impl MessageTool {
    pub fn new(poster: Arc<dyn ChannelPoster>) -> Self {
        Self { poster }
    }
}

#[async_trait::async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Post a short message to the channel right now, before your final reply. \
         Use it for progress notes on long work, not for your answer."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["text"],
            "properties": {
                "text": {
                    "type": "string",
                    "description": "Message text"
                },
                "channel_id": {
                    "type": "string",
                    "description": "Target channel. Defaults to the current one."
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let text = match args.get("text").and_then(|v| v.as_str()) {
            Some(t) if !t.trim().is_empty() => t,
            _ => return Err(ToolInvocationError::invalid("message", "'text' is required")),
        };
        let channel = args
            .get("channel_id")
            .and_then(|v| v.as_str())
            .unwrap_or(ctx.channel_id.as_str());

        let msg = OutboundMessage::new(&ctx.bot_name, channel, text).in_reply_to(&ctx.event_id);
        self.poster
            .post(msg)
            .await
            .map_err(|e| ToolInvocationError::failed("message", e.to_string()))?;
        Ok(ToolResult::text(format!("Message sent to {}", channel)))
    }
}
