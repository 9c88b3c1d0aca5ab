//! Chorusclaw LLM - provider adapters with streaming support

pub mod anthropic;
pub mod provider;
pub mod reply;
pub mod scripted;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use provider::{AnthropicFactory, LlmError, LlmProvider, LlmResult, LlmStream, ProviderFactory};
pub use reply::{collect_reply, ModelReply};
pub use scripted::{ScriptStep, ScriptedFactory, ScriptedProvider};
pub use tokio_util::sync::CancellationToken;
pub use types::*;
