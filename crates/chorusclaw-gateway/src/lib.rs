//! Chorusclaw Gateway - bot supervision and channel transports

pub mod error;
pub mod manager;
pub mod server;
pub mod transport;

pub use error::{GatewayError, GatewayResult};
pub use manager::{BotManager, BotState, BotStatus, RunningGateway};
pub use server::{serve, start_gateway};
pub use transport::{ChannelTransport, ConsoleTransport};
