//! Agent error types

use chorusclaw_core::{FailureKind, TransportError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("provider setup failed: {0}")]
    ProviderSetup(String),

    #[error("model rejected credentials: {0}")]
    ModelPermanent(String),

    #[error("model unavailable after {attempts} attempts: {last}")]
    ModelExhausted { attempts: u32, last: String },

    #[error("model error: {0}")]
    Model(String),

    #[error("tool loop exceeded {0} iterations")]
    ToolIterationsExceeded(usize),

    #[error("publish failed: {0}")]
    Publish(#[from] TransportError),

    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::ProviderSetup(_) => FailureKind::Configuration,
            Self::ModelPermanent(_) => FailureKind::ModelPermanent,
            Self::ModelExhausted { .. } | Self::Model(_) | Self::Cancelled => {
                FailureKind::ModelTransient
            }
            Self::ToolIterationsExceeded(_) => FailureKind::Tool,
            Self::Publish(_) => FailureKind::Transport,
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
