//! LLM Provider trait

use crate::anthropic::AnthropicProvider;
use crate::types::{LlmRequest, StreamDelta};
use chorusclaw_core::BotIdentity;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result type for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// LLM error types
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl LlmError {
    /// Worth another attempt with the same request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed(_)
                | Self::RateLimited { .. }
                | Self::StreamError(_)
                | Self::Timeout(_)
                | Self::NetworkError(_)
        )
    }

    /// The bot cannot make progress until an operator intervenes.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::AuthFailed(_))
    }

    /// Minimum wait the provider asked for, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Stream type for LLM responses
pub type LlmStream = Pin<Box<dyn Stream<Item = LlmResult<StreamDelta>> + Send>>;

/// LLM Provider trait
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn models(&self) -> &[&str];

    fn supports_model(&self, model: &str) -> bool {
        self.models()
            .iter()
            .any(|m| *m == model || model.starts_with(m))
    }

    /// Stream a completion response. If `cancel` is provided and triggered,
    /// the underlying HTTP connection is dropped and the stream yields `LlmError::Cancelled`.
    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmStream>;
}

/// Binds a provider to one bot's credential and endpoint.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, identity: &BotIdentity) -> LlmResult<Arc<dyn LlmProvider>>;
}

/// Builds an [`AnthropicProvider`] per bot, honouring `base_url` overrides.
#[derive(Debug, Default, Clone)]
pub struct AnthropicFactory;

impl ProviderFactory for AnthropicFactory {
    fn build(&self, identity: &BotIdentity) -> LlmResult<Arc<dyn LlmProvider>> {
        if identity.credential.trim().is_empty() {
            return Err(LlmError::AuthFailed(format!(
                "bot '{}' has no credential",
                identity.name
            )));
        }
        let mut provider = AnthropicProvider::new(identity.credential.clone());
        if let Some(url) = &identity.base_url {
            provider = provider.with_base_url(url.clone());
        }
        Ok(Arc::new(provider))
    }
}
