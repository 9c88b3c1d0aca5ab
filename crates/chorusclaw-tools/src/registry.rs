//! Tool registry and trait definitions
//!
//! Tools are registered while the gateway is being assembled. The registry is
//! then moved into an `Arc` and shared read-only by every bot, so it holds no
//! per-invocation state.

use chorusclaw_llm::LlmTool;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Clone, Debug, PartialEq)]
pub enum ToolResult {
    Text(String),
    Json(Value),
}

impl ToolResult {
    pub fn text(s: impl Into<String>) -> Self { Self::Text(s.into()) }

    pub fn to_content_string(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Json(v) => serde_json::to_string_pretty(v).unwrap_or_default(),
        }
    }
}

/// Typed failure of a single tool invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolInvocationError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool '{0}' is disabled")]
    Disabled(String),

    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("'{tool}' failed: {message}")]
    Failed { tool: String, message: String },
}

impl ToolInvocationError {
    pub fn invalid(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

pub type ToolOutcome = Result<ToolResult, ToolInvocationError>;

/// Who is calling a tool, and on behalf of which event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolContext {
    pub bot_name: String,
    pub channel_id: String,
    pub event_id: String,
    /// 0 for a bot's own loop, 1 for a sub-task it spawned, and so on.
    pub depth: usize,
}

impl ToolContext {
    pub fn new(
        bot_name: impl Into<String>,
        channel_id: impl Into<String>,
        event_id: impl Into<String>,
    ) -> Self {
        Self {
            bot_name: bot_name.into(),
            channel_id: channel_id.into(),
            event_id: event_id.into(),
            depth: 0,
        }
    }

    pub fn at_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }
}

/// The Tool trait - implement this to add a new capability.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (e.g. "spawn", "message").
    fn name(&self) -> &str;

    /// Human-readable description sent to the LLM.
    fn description(&self) -> &str;

    /// System prompt fragment for this tool (injected into LLM context).
    fn prompt(&self) -> &str { "" }

    /// JSON Schema for input parameters.
    fn input_schema(&self) -> Value;

    /// Whether this tool only reads state (no side effects).
    fn is_read_only(&self) -> bool { false }

    /// Whether this tool is currently enabled.
    fn is_enabled(&self) -> bool { true }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome;

    /// Convert to the LLM tool definition format.
    fn to_llm_tool(&self) -> LlmTool {
        LlmTool {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self { Self::new() }
}

impl ToolRegistry {
    pub fn new() -> Self { Self { tools: BTreeMap::new() } }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub async fn invoke(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let tool = match self.tools.get(name) {
            Some(tool) if tool.is_enabled() => tool,
            Some(_) => return Err(ToolInvocationError::Disabled(name.to_string())),
            None => return Err(ToolInvocationError::UnknownTool(name.to_string())),
        };
        debug!(bot = %ctx.bot_name, tool = %name, depth = ctx.depth, "invoking tool");
        tool.execute(args, ctx).await
    }

    /// LLM tool definitions for all enabled tools, sorted by name.
    pub fn get_definitions(&self) -> Vec<LlmTool> {
        self.get_definitions_excluding(&[])
    }

    pub fn get_definitions_excluding(&self, excluded: &[&str]) -> Vec<LlmTool> {
        self.tools
            .values()
            .filter(|t| t.is_enabled() && !excluded.contains(&t.name()))
            .map(|t| t.to_llm_tool())
            .collect()
    }

    /// Get system prompt fragments from all enabled tools.
    pub fn combined_prompts(&self) -> String {
        self.tools.values()
            .filter(|t| t.is_enabled())
            .map(|t| t.prompt())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// True when every named tool exists and is read-only.
    pub fn all_read_only<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> bool {
        names
            .into_iter()
            .all(|n| self.tools.get(n).is_some_and(|t| t.is_read_only()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo {
        enabled: bool,
    }

    #[async_trait::async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str { "echo" }
        fn description(&self) -> &str { "echo args" }
        fn input_schema(&self) -> Value { json!({"type": "object"}) }
        fn is_read_only(&self) -> bool { true }
        fn is_enabled(&self) -> bool { self.enabled }
        async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolOutcome {
            Ok(ToolResult::Json(args))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new("bot", "chan", "ev-1")
    }

    #[tokio::test]
    async fn unknown_and_disabled_are_typed() {
        let mut reg = ToolRegistry::new();
        reg.register(Echo { enabled: false });
        assert_eq!(
            reg.invoke("nope", json!({}), &ctx()).await,
            Err(ToolInvocationError::UnknownTool("nope".into()))
        );
        assert_eq!(
            reg.invoke("echo", json!({}), &ctx()).await,
            Err(ToolInvocationError::Disabled("echo".into()))
        );
        assert!(reg.get_definitions().is_empty());
    }

    #[tokio::test]
    async fn invoke_passes_arguments_through() {
        let mut reg = ToolRegistry::new();
        reg.register(Echo { enabled: true });
        let out = reg.invoke("echo", json!({"a": 1}), &ctx()).await.unwrap();
        assert_eq!(out, ToolResult::Json(json!({"a": 1})));
        assert!(reg.all_read_only(["echo"]));
        assert!(!reg.all_read_only(["echo", "missing"]));
    }
}
