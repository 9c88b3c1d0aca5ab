//! Gateway error types

use chorusclaw_core::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] chorusclaw_core::Error),

    #[error("unknown bot: {0}")]
    UnknownBot(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("gateway is shutting down")]
    ShuttingDown,
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
