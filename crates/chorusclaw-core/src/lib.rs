//! Chorusclaw Core - Types, configuration, and error handling shared by every crate

pub mod config;
pub mod error;
pub mod types;

pub use config::*;
pub use error::{BotFailure, Error, FailureKind, Result, TransportError};
pub use types::*;
