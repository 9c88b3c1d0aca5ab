//! Chorusclaw Agent - per-bot loops over a shared message bus

pub mod agent_loop;
pub mod bus;
pub mod context;
pub mod conversation;
pub mod discussion;
pub mod error;
pub mod subtask;

pub use agent_loop::{finalize_reply, AgentLoop, EngineMode, LoopDeps, LoopExit, LoopPhase, TurnEngine};
pub use bus::{Mailbox, MessageBus, TransportSink};
pub use context::{
    estimate_tokens, message_tokens, retention_policy, ContextBuilder, MostRecent, Prompt,
    RetentionPolicy, TokenBudget, SKIP_MARKER,
};
pub use conversation::{Author, ConversationState, Turn};
pub use discussion::{Decision, DiscussionPolicy, RecentIds};
pub use error::{AgentError, AgentResult};
pub use subtask::{SubtaskEntry, SubtaskManager, SubtaskStatus};
pub use tokio_util::sync::CancellationToken;
