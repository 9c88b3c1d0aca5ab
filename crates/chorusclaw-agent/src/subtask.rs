//! Sub-task manager - tracks detached sub-tasks spawned by bots.
//!
//! A sub-task runs the same model/tool cycle as its bot with a private
//! conversation. When it finishes, its report is delivered to the bot's own
//! mailbox as a `SubtaskCompletion` event, so the bot picks it up like any
//! other message.
//!
//! Finished entries stay queryable for a while; only the most recent
//! `FINISHED_SUBTASK_WINDOW` of them are kept.
//!
//! Task ids are readable: a kebab-case prefix from the objective plus a
//! short random suffix (e.g. `compare-three-options-3fa9c`).

use crate::agent_loop::TurnEngine;
use crate::bus::MessageBus;
use crate::context::ContextBuilder;
use crate::conversation::ConversationState;
use crate::error::AgentError;
use chorusclaw_core::{AgentSettings, BotIdentity, InboundEvent};
use chorusclaw_llm::LlmProvider;
use chorusclaw_tools::{SubtaskRequest, SubtaskSpawner, ToolContext, ToolRegistry};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const FINISHED_SUBTASK_WINDOW: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtaskStatus {
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Metadata for a tracked sub-task.
#[derive(Debug, Clone)]
pub struct SubtaskEntry {
    pub id: String,
    pub bot_name: String,
    pub objective: String,
    pub depth: usize,
    pub status: SubtaskStatus,
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
    /// Report text, truncated to 500 chars.
    pub last_output: String,
}

/// What a bot's sub-tasks run with: its identity and its provider.
#[derive(Clone)]
struct BotBinding {
    identity: Arc<BotIdentity>,
    provider: Arc<dyn LlmProvider>,
}

/// Build a task id from an objective.
pub fn task_id(objective: &str) -> String {
    let prefix = objective
        .split_whitespace()
        .filter(|w| w.len() > 1)
        .take(3)
        .map(|w| {
            w.to_lowercase()
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let prefix = if prefix.is_empty() {
        "task".to_string()
    } else {
        prefix.chars().take(24).collect()
    };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &suffix[..5])
}

fn preview(text: &str) -> String {
    if text.chars().count() > 500 {
        let head: String = text.chars().take(497).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

/// Entries plus the order in which they finished.
struct Registry {
    entries: DashMap<String, SubtaskEntry>,
    finished: Mutex<VecDeque<String>>,
    keep_finished: usize,
}

impl Registry {
    fn finish(&self, id: &str, status: SubtaskStatus, output: &str) {
        {
            let Some(mut entry) = self.entries.get_mut(id) else {
                return;
            };
            entry.status = status;
            entry.ended_at = Some(Instant::now());
            entry.last_output = preview(output);
        }
        let mut finished = self
            .finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        finished.push_back(id.to_string());
        while finished.len() > self.keep_finished {
            if let Some(old) = finished.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}

pub struct SubtaskManager {
    registry: Arc<Registry>,
    bindings: DashMap<String, BotBinding>,
    bus: Arc<MessageBus>,
    tools: Arc<ToolRegistry>,
    context: Arc<ContextBuilder>,
    settings: Arc<AgentSettings>,
    cancel: CancellationToken,
}

impl SubtaskManager {
    pub fn new(
        bus: Arc<MessageBus>,
        tools: Arc<ToolRegistry>,
        context: Arc<ContextBuilder>,
        settings: Arc<AgentSettings>,
    ) -> Self {
        Self {
            registry: Arc::new(Registry {
                entries: DashMap::new(),
                finished: Mutex::new(VecDeque::new()),
                keep_finished: FINISHED_SUBTASK_WINDOW,
            }),
            bindings: DashMap::new(),
            bus,
            tools,
            context,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Keep at most `n` finished entries. Only valid before the first spawn.
    pub fn with_finished_window(mut self, n: usize) -> Self {
        if let Some(registry) = Arc::get_mut(&mut self.registry) {
            registry.keep_finished = n;
        }
        self
    }

    /// Register the provider a bot's sub-tasks will use. Called at loop start,
    /// so a restarted loop replaces the old binding.
    pub fn bind(&self, identity: Arc<BotIdentity>, provider: Arc<dyn LlmProvider>) {
        self.bindings.insert(
            identity.name.clone(),
            BotBinding { identity, provider },
        );
    }

    pub fn get(&self, id: &str) -> Option<SubtaskEntry> {
        self.registry.entries.get(id).map(|e| e.clone())
    }

    /// All sub-tasks of `bot_name`, oldest first.
    pub fn list_for(&self, bot_name: &str) -> Vec<SubtaskEntry> {
        let mut list: Vec<SubtaskEntry> = self
            .registry
            .entries
            .iter()
            .filter(|e| e.bot_name == bot_name)
            .map(|e| e.clone())
            .collect();
        list.sort_by_key(|e| e.started_at);
        list
    }

    pub fn running_count(&self) -> usize {
        self.registry
            .entries
            .iter()
            .filter(|e| e.status == SubtaskStatus::Running)
            .count()
    }

    /// Cancel every running sub-task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[async_trait::async_trait]
impl SubtaskSpawner for SubtaskManager {
    async fn spawn_subtask(&self, request: SubtaskRequest) -> Result<String, String> {
        let max_depth = self.settings.max_subtask_depth;
        if request.depth > max_depth {
            return Err(format!(
                "sub-tasks cannot nest deeper than {} level(s)",
                max_depth
            ));
        }
        if self.cancel.is_cancelled() {
            return Err("the gateway is shutting down".to_string());
        }
        let binding = self
            .bindings
            .get(&request.bot_name)
            .map(|b| b.clone())
            .ok_or_else(|| format!("bot '{}' is not running", request.bot_name))?;

        let id = task_id(&request.objective);
        self.registry.entries.insert(
            id.clone(),
            SubtaskEntry {
                id: id.clone(),
                bot_name: request.bot_name.clone(),
                objective: request.objective.clone(),
                depth: request.depth,
                status: SubtaskStatus::Running,
                started_at: Instant::now(),
                ended_at: None,
                last_output: String::new(),
            },
        );
        info!(task = %id, bot = %request.bot_name, depth = request.depth, "sub-task registered");

        let engine = TurnEngine::new(
            binding.identity,
            binding.provider,
            self.tools.clone(),
            self.context.clone(),
            self.settings.clone(),
        )
        .for_subtask(request.depth < max_depth);

        let mut brief = format!("Objective: {}", request.objective);
        if let Some(context) = &request.context {
            brief.push_str("\n\nContext: ");
            brief.push_str(context);
        }
        let objective_event = InboundEvent::human(
            request.channel_id.clone(),
            request.bot_name.clone(),
            request.bot_name.clone(),
            brief,
        )
        .with_event_id(id.clone());

        let registry = self.registry.clone();
        let bus = self.bus.clone();
        let cancel = self.cancel.child_token();
        let max_iterations = self.settings.subtask_max_iterations;
        let max_stored = self.settings.max_stored_turns;
        let task = id.clone();

        tokio::spawn(async move {
            let mut state = ConversationState::new(max_stored);
            let ctx = ToolContext::new(&request.bot_name, &request.channel_id, &task)
                .at_depth(request.depth);
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(AgentError::Cancelled),
                r = engine.run(&mut state, &objective_event, &ctx, max_iterations, &cancel) => r,
            };

            let (report, is_error) = match result {
                Ok(text) if text.trim().is_empty() => {
                    ("The sub-task finished without a report.".to_string(), false)
                }
                Ok(text) => (text, false),
                Err(AgentError::Cancelled) => {
                    registry.finish(&task, SubtaskStatus::Cancelled, "");
                    debug!(task = %task, "sub-task cancelled");
                    return;
                }
                Err(e) => (e.to_string(), true),
            };

            let status = if is_error {
                SubtaskStatus::Failed
            } else {
                SubtaskStatus::Complete
            };
            registry.finish(&task, status, &report);
            info!(task = %task, bot = %request.bot_name, %status, "sub-task finished");

            let event =
                InboundEvent::subtask_completion(request.channel_id.clone(), task.clone(), report, is_error);
            if !bus.deliver_to_bot(&request.bot_name, event) {
                warn!(task = %task, bot = %request.bot_name, "sub-task result undeliverable");
            }
        });

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_is_readable_and_unique() {
        let a = task_id("Compare three hosting options!");
        let b = task_id("Compare three hosting options!");
        assert!(a.starts_with("compare-three-hosting-"));
        assert_ne!(a, b);
        assert!(task_id("  ").starts_with("task-"));
    }

    #[test]
    fn preview_truncates_long_output() {
        let long = "x".repeat(600);
        assert_eq!(preview(&long).chars().count(), 500);
        assert_eq!(preview("short"), "short");
    }
}
