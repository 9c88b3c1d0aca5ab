//! ScriptedProvider - deterministic model replies for tests and dry runs
//!
//! Each call to `complete_stream` pops the next [`ScriptStep`]. When the
//! script runs out the fallback step is used. Every request is recorded so
//! tests can inspect the exact prompt a bot sent.

use crate::provider::{LlmError, LlmProvider, LlmResult, LlmStream, ProviderFactory};
use crate::types::{LlmRequest, StreamDelta};
use async_stream::stream;
use chorusclaw_core::BotIdentity;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One scripted model behaviour.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Text-only final answer
    Text(String),
    /// A single tool_use call
    ToolCall { name: String, args: Value },
    /// Several tool_use calls in one turn
    MultiToolCall(Vec<(String, Value)>),
    /// Text followed by a tool call
    TextThenTool {
        text: String,
        tool_name: String,
        tool_args: Value,
    },
    /// Fail before streaming with a retryable error
    TransientError(String),
    /// Fail with a rate limit
    RateLimited(u64),
    /// Fail with rejected credentials
    AuthError(String),
    /// Never answer; the caller's timeout has to fire
    Hang,
    /// Panic inside the provider
    Panic(String),
}

impl ScriptStep {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn tool(name: impl Into<String>, args: Value) -> Self {
        Self::ToolCall {
            name: name.into(),
            args,
        }
    }
}

pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptStep>>,
    fallback: ScriptStep,
    requests: Mutex<Vec<LlmRequest>>,
    latency: Duration,
}

impl ScriptedProvider {
    /// Always answer with the same step.
    pub fn constant(step: ScriptStep) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: step,
            requests: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    /// Play `steps` in order, then fall back to a fixed text reply.
    pub fn sequence(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: ScriptStep::Text("(script exhausted)".into()),
            requests: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    pub fn with_fallback(mut self, step: ScriptStep) -> Self {
        self.fallback = step;
        self
    }

    /// Delay every call by `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn push(&self, step: ScriptStep) {
        self.steps.lock().await.push_back(step);
    }

    pub async fn call_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    /// Every request received so far, oldest first.
    pub async fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn last_request(&self) -> Option<LlmRequest> {
        self.requests.lock().await.last().cloned()
    }

    async fn next_step(&self) -> ScriptStep {
        self.steps
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

fn mock_tool_id() -> String {
    format!("toolu_mock_{}", uuid::Uuid::new_v4().simple())
}

fn tool_deltas(name: String, args: &Value) -> Vec<StreamDelta> {
    let id = mock_tool_id();
    vec![
        StreamDelta::ToolCallStart {
            id: id.clone(),
            name,
        },
        StreamDelta::ToolCallDelta {
            id: id.clone(),
            arguments: args.to_string(),
        },
        StreamDelta::ToolCallEnd { id },
    ]
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn models(&self) -> &[&str] {
        &[""]
    }

    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmStream> {
        self.requests.lock().await.push(request);
        let step = self.next_step().await;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(LlmError::Cancelled);
        }

        let deltas: Vec<StreamDelta> = match step {
            ScriptStep::Text(text) => {
                let mut d: Vec<StreamDelta> = text
                    .as_bytes()
                    .chunks(20)
                    .map(|c| StreamDelta::Text(String::from_utf8_lossy(c).to_string()))
                    .collect();
                d.push(StreamDelta::Done {
                    stop_reason: Some("end_turn".into()),
                    usage: None,
                });
                d
            }
            ScriptStep::ToolCall { name, args } => {
                let mut d = tool_deltas(name, &args);
                d.push(StreamDelta::Done {
                    stop_reason: Some("tool_use".into()),
                    usage: None,
                });
                d
            }
            ScriptStep::MultiToolCall(calls) => {
                let mut d: Vec<StreamDelta> = calls
                    .into_iter()
                    .flat_map(|(name, args)| tool_deltas(name, &args))
                    .collect();
                d.push(StreamDelta::Done {
                    stop_reason: Some("tool_use".into()),
                    usage: None,
                });
                d
            }
            ScriptStep::TextThenTool {
                text,
                tool_name,
                tool_args,
            } => {
                let mut d = vec![StreamDelta::Text(text)];
                d.extend(tool_deltas(tool_name, &tool_args));
                d.push(StreamDelta::Done {
                    stop_reason: Some("tool_use".into()),
                    usage: None,
                });
                d
            }
            ScriptStep::TransientError(msg) => return Err(LlmError::RequestFailed(msg)),
            ScriptStep::RateLimited(ms) => {
                return Err(LlmError::RateLimited { retry_after_ms: ms })
            }
            ScriptStep::AuthError(msg) => return Err(LlmError::AuthFailed(msg)),
            ScriptStep::Hang => {
                match cancel {
                    Some(token) => token.cancelled().await,
                    None => futures::future::pending::<()>().await,
                }
                return Err(LlmError::Cancelled);
            }
            ScriptStep::Panic(msg) => panic!("{}", msg),
        };

        Ok(Box::pin(stream! {
            for delta in deltas {
                yield Ok(delta);
            }
        }))
    }
}

/// Hands out a pre-registered [`ScriptedProvider`] per bot name.
#[derive(Default, Clone)]
pub struct ScriptedFactory {
    providers: HashMap<String, Arc<ScriptedProvider>>,
    fallback: Option<Arc<ScriptedProvider>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bot(mut self, name: impl Into<String>, provider: Arc<ScriptedProvider>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    /// Provider used for any bot without its own script.
    pub fn with_fallback(mut self, provider: Arc<ScriptedProvider>) -> Self {
        self.fallback = Some(provider);
        self
    }
}

impl ProviderFactory for ScriptedFactory {
    fn build(&self, identity: &BotIdentity) -> LlmResult<Arc<dyn LlmProvider>> {
        let provider = self
            .providers
            .get(&identity.name)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| {
                LlmError::AuthFailed(format!("no script registered for bot '{}'", identity.name))
            })?;
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::collect_reply;
    use serde_json::json;

    #[tokio::test]
    async fn text_step_streams_in_chunks() {
        let mock = ScriptedProvider::constant(ScriptStep::text("a reasonably long answer text"));
        let stream = mock.complete_stream(LlmRequest::default(), None).await.unwrap();
        let reply = collect_reply(stream).await.unwrap();
        assert_eq!(reply.text, "a reasonably long answer text");
        assert_eq!(mock.call_count().await, 1);
    }

    #[tokio::test]
    async fn sequence_then_fallback() {
        let mock = ScriptedProvider::sequence(vec![
            ScriptStep::tool("channel_info", json!({})),
            ScriptStep::text("second"),
        ]);
        let first = collect_reply(mock.complete_stream(LlmRequest::default(), None).await.unwrap())
            .await
            .unwrap();
        assert_eq!(first.tool_calls[0].name, "channel_info");

        let second = collect_reply(mock.complete_stream(LlmRequest::default(), None).await.unwrap())
            .await
            .unwrap();
        assert_eq!(second.text, "second");

        let third = collect_reply(mock.complete_stream(LlmRequest::default(), None).await.unwrap())
            .await
            .unwrap();
        assert!(third.text.contains("exhausted"));
    }

    #[tokio::test]
    async fn error_steps_classify() {
        let mock = ScriptedProvider::sequence(vec![
            ScriptStep::TransientError("503".into()),
            ScriptStep::AuthError("bad key".into()),
        ]);
        let e1 = mock.complete_stream(LlmRequest::default(), None).await.err().unwrap();
        assert!(e1.is_transient());
        let e2 = mock.complete_stream(LlmRequest::default(), None).await.err().unwrap();
        assert!(e2.is_permanent());
    }

    #[tokio::test]
    async fn hang_is_released_by_cancel() {
        let mock = Arc::new(ScriptedProvider::constant(ScriptStep::Hang));
        let token = CancellationToken::new();
        let t = token.clone();
        let m = mock.clone();
        let task = tokio::spawn(async move { m.complete_stream(LlmRequest::default(), Some(t)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(LlmError::Cancelled)));
    }

    #[tokio::test]
    async fn factory_routes_by_bot_name() {
        let a = Arc::new(ScriptedProvider::constant(ScriptStep::text("from a")));
        let factory = ScriptedFactory::new().with_bot("a", a.clone());
        assert!(factory.build(&BotIdentity::new("a", "m", "k")).is_ok());
        assert!(factory.build(&BotIdentity::new("b", "m", "k")).is_err());
    }
}
