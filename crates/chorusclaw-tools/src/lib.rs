//! Chorusclaw Tools - capabilities the bots can call
//!
//! Each tool is a self-contained file in src/tools/.
//! To add a tool: create the file, implement Tool trait, register below.

pub mod registry;
pub mod tools;

pub use registry::{Tool, ToolContext, ToolInvocationError, ToolOutcome, ToolRegistry, ToolResult};
pub use tools::channel_info::ChannelInfoTool;
pub use tools::message::{ChannelPoster, MessageTool};
pub use tools::spawn::{SpawnTool, SpawnerHandle, SubtaskRequest, SubtaskSpawner};

use std::sync::Arc;
use tokio::sync::RwLock;

/// Create an empty spawner handle. Fill it once the sub-task manager exists:
/// `*handle.write().await = Some(manager)`.
pub fn create_spawner_handle() -> SpawnerHandle {
    Arc::new(RwLock::new(None))
}

/// Create the registry shared by every bot.
///
/// Edit this function to add or remove built-in tools.
pub fn create_default_registry(poster: Arc<dyn ChannelPoster>, spawner: SpawnerHandle) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    // --- Read-only ---
    registry.register(ChannelInfoTool);

    // --- Side effects ---
    registry.register(MessageTool::new(poster));
    registry.register(SpawnTool::new(spawner));

    registry
}
