//! Folding a delta stream into one complete model reply

use crate::provider::{LlmError, LlmResult, LlmStream};
use crate::types::{AccumulatedToolCall, StreamDelta, Usage};
use futures::StreamExt;
use std::collections::HashMap;
use tracing::debug;

/// A fully received model turn.
#[derive(Clone, Debug, Default)]
pub struct ModelReply {
    pub text: String,
    /// Tool calls in the order the model issued them.
    pub tool_calls: Vec<AccumulatedToolCall>,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl ModelReply {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Drain a stream into a [`ModelReply`].
///
/// The first error item aborts collection. Thinking deltas are dropped.
pub async fn collect_reply(mut stream: LlmStream) -> LlmResult<ModelReply> {
    let mut reply = ModelReply::default();
    let mut open: HashMap<String, usize> = HashMap::new();

    while let Some(delta) = stream.next().await {
        match delta? {
            StreamDelta::Text(t) => reply.text.push_str(&t),
            StreamDelta::Thinking(_) => {}
            StreamDelta::ToolCallStart { id, name } => {
                open.insert(id.clone(), reply.tool_calls.len());
                reply.tool_calls.push(AccumulatedToolCall {
                    id,
                    name,
                    arguments: String::new(),
                });
            }
            StreamDelta::ToolCallDelta { id, arguments } => {
                let idx = open.get(&id).copied().ok_or_else(|| {
                    LlmError::InvalidResponse(format!("delta for unknown tool call {}", id))
                })?;
                reply.tool_calls[idx].arguments.push_str(&arguments);
            }
            StreamDelta::ToolCallEnd { id } => {
                open.remove(&id);
            }
            StreamDelta::Done { stop_reason, usage } => {
                reply.stop_reason = stop_reason;
                reply.usage = usage;
                break;
            }
            StreamDelta::Error(e) => return Err(LlmError::StreamError(e)),
        }
    }

    debug!(
        chars = reply.text.len(),
        tool_calls = reply.tool_calls.len(),
        "Model reply collected"
    );
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(items: Vec<LlmResult<StreamDelta>>) -> LlmStream {
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn interleaved_tool_deltas_stay_with_their_call() {
        let reply = collect_reply(stream_of(vec![
            Ok(StreamDelta::Text("Let me check. ".into())),
            Ok(StreamDelta::ToolCallStart { id: "a".into(), name: "one".into() }),
            Ok(StreamDelta::ToolCallStart { id: "b".into(), name: "two".into() }),
            Ok(StreamDelta::ToolCallDelta { id: "b".into(), arguments: "{\"x\":".into() }),
            Ok(StreamDelta::ToolCallDelta { id: "a".into(), arguments: "{}".into() }),
            Ok(StreamDelta::ToolCallDelta { id: "b".into(), arguments: "1}".into() }),
            Ok(StreamDelta::ToolCallEnd { id: "a".into() }),
            Ok(StreamDelta::ToolCallEnd { id: "b".into() }),
            Ok(StreamDelta::Done { stop_reason: Some("tool_use".into()), usage: None }),
        ]))
        .await
        .unwrap();

        assert_eq!(reply.text, "Let me check. ");
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[0].name, "one");
        assert_eq!(reply.tool_calls[1].parse_arguments().unwrap()["x"], 1);
        assert_eq!(reply.stop_reason.as_deref(), Some("tool_use"));
    }

    #[tokio::test]
    async fn error_item_aborts() {
        let result = collect_reply(stream_of(vec![
            Ok(StreamDelta::Text("partial".into())),
            Err(LlmError::StreamError("reset".into())),
        ]))
        .await;
        assert!(matches!(result, Err(LlmError::StreamError(_))));
    }

    #[tokio::test]
    async fn orphan_delta_is_invalid() {
        let result = collect_reply(stream_of(vec![Ok(StreamDelta::ToolCallDelta {
            id: "ghost".into(),
            arguments: "{}".into(),
        })]))
        .await;
        assert!(matches!(result, Err(LlmError::InvalidResponse(_))));
    }
}
