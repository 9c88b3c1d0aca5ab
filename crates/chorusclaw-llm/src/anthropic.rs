//! Anthropic Claude API provider with SSE streaming

use crate::provider::{LlmError, LlmProvider, LlmResult, LlmStream};
use crate::types::{LlmContent, LlmRequest, StreamDelta, Usage};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str { "anthropic" }

    fn models(&self) -> &[&str] {
        &[
            "claude-opus-4",
            "claude-sonnet-4",
            "claude-haiku-4",
        ]
    }

    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmStream> {
        let body = AnthropicRequest {
            model: request.model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| AnthropicMessage {
                    role: m.role.clone(),
                    content: match &m.content {
                        LlmContent::Text(s) => serde_json::json!(s),
                        LlmContent::Blocks(blocks) => {
                            serde_json::to_value(blocks).unwrap_or_default()
                        }
                    },
                })
                .collect(),
            max_tokens: request.max_tokens.unwrap_or(4096),
            stream: true,
            system: request.system.clone(),
            tools: request.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|t| AnthropicTool {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        input_schema: t.input_schema.clone(),
                    })
                    .collect()
            }),
        };

        debug!(model = %body.model, messages = body.messages.len(), "Anthropic request");

        let send = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send();

        let response = match &cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(LlmError::Cancelled),
                r = send => r?,
            },
            None => send.await?,
        };

        let status = response.status();

        if !status.is_success() {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let error_text = response.text().await.unwrap_or_default();
            error!("Anthropic error {}: {}", status, error_text);
            return Err(classify_status(status.as_u16(), error_text, retry_after_ms));
        }

        let stream = parse_sse_stream(response.bytes_stream(), cancel);
        Ok(Box::pin(stream))
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
pub(crate) fn classify_status(status: u16, body: String, retry_after_ms: Option<u64>) -> LlmError {
    match status {
        401 | 403 => LlmError::AuthFailed(body),
        429 => LlmError::RateLimited {
            retry_after_ms: retry_after_ms.unwrap_or(60_000),
        },
        400 if body.contains("prompt is too long") => LlmError::ContextOverflow(body),
        400 | 404 | 422 => LlmError::InvalidResponse(format!("{}: {}", status, body)),
        _ => LlmError::RequestFailed(format!("{}: {}", status, body)),
    }
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

pub(crate) fn parse_sse_stream<E: std::fmt::Display + Send + 'static>(
    bytes_stream: impl futures::Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    cancel: Option<CancellationToken>,
) -> impl futures::Stream<Item = LlmResult<StreamDelta>> + Send {
    async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut current_tool_id: Option<String> = None;
        let mut stop_reason: Option<String> = None;
        let mut usage: Option<Usage> = None;

        tokio::pin!(bytes_stream);

        loop {
            let next = match &cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => None,
                    n = bytes_stream.next() => Some(n),
                },
                None => Some(bytes_stream.next().await),
            };
            let Some(next) = next else {
                yield Err(LlmError::Cancelled);
                break;
            };
            let Some(chunk_result) = next else { break };
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(LlmError::StreamError(e.to_string()));
                    break;
                }
            };

            buffer.extend_from_slice(&chunk);

            // Decode whole events only; a chunk may end inside a multi-byte char.
            while let Some(event_end) = find_event_end(&buffer) {
                let event_bytes: Vec<u8> = buffer.drain(..event_end + 2).collect();
                let event_str = String::from_utf8_lossy(&event_bytes[..event_end]).into_owned();

                let mut event_type = String::new();
                let mut event_data = String::new();

                for line in event_str.lines() {
                    if let Some(rest) = line.strip_prefix("event: ") {
                        event_type = rest.to_string();
                    } else if let Some(rest) = line.strip_prefix("data: ") {
                        event_data = rest.to_string();
                    }
                }

                if event_data.is_empty() { continue; }

                match event_type.as_str() {
                    "content_block_start" => {
                        if let Ok(data) = serde_json::from_str::<ContentBlockStart>(&event_data) {
                            match data.content_block {
                                ContentBlockType::ToolUse { id, name } => {
                                    current_tool_id = Some(id.clone());
                                    yield Ok(StreamDelta::ToolCallStart { id, name });
                                }
                                ContentBlockType::Text { .. } => {}
                            }
                        }
                    }
                    "content_block_delta" => {
                        if let Ok(data) = serde_json::from_str::<ContentBlockDelta>(&event_data) {
                            match data.delta {
                                DeltaType::TextDelta { text } => {
                                    yield Ok(StreamDelta::Text(text));
                                }
                                DeltaType::ThinkingDelta { thinking } => {
                                    yield Ok(StreamDelta::Thinking(thinking));
                                }
                                DeltaType::InputJsonDelta { partial_json } => {
                                    if let Some(id) = &current_tool_id {
                                        yield Ok(StreamDelta::ToolCallDelta {
                                            id: id.clone(),
                                            arguments: partial_json,
                                        });
                                    }
                                }
                            }
                        }
                    }
                    "content_block_stop" => {
                        if let Some(id) = current_tool_id.take() {
                            yield Ok(StreamDelta::ToolCallEnd { id });
                        }
                    }
                    "message_delta" => {
                        if let Ok(data) = serde_json::from_str::<MessageDelta>(&event_data) {
                            if let Some(reason) = data.delta.stop_reason {
                                debug!(stop_reason = %reason, "Message complete");
                                stop_reason = Some(reason);
                            }
                            if data.usage.is_some() {
                                usage = data.usage;
                            }
                        }
                    }
                    "message_stop" => {
                        yield Ok(StreamDelta::Done {
                            stop_reason: stop_reason.take().or_else(|| Some("end_turn".to_string())),
                            usage: usage.take(),
                        });
                    }
                    "error" => {
                        match serde_json::from_str::<ErrorEvent>(&event_data) {
                            Ok(data) if data.error.error_type == "overloaded_error" => {
                                yield Err(LlmError::RequestFailed(data.error.message));
                            }
                            Ok(data) => yield Err(LlmError::StreamError(data.error.message)),
                            Err(e) => warn!("Unparseable error event: {}", e),
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    #[allow(dead_code)]
    index: u32,
    content_block: ContentBlockType,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlockType {
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
    #[serde(rename = "text")]
    #[allow(dead_code)]
    Text { text: String },
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    #[allow(dead_code)]
    index: u32,
    delta: DeltaType,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum DeltaType {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaContent,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct MessageDeltaContent {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}
