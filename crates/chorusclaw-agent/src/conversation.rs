//! Per-bot conversation history.
//!
//! A `ConversationState` is owned by value by exactly one agent loop (or one
//! sub-task). Turns of the cycle in progress stay in `pending` until the loop
//! commits them, so a failed cycle never leaves half an exchange behind.

use chorusclaw_core::{EventKind, InboundEvent, Role, ToolInvocation};

/// Who produced a turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Author {
    Human { id: String, display_name: String },
    /// Another bot in the channel.
    Bot { name: String },
    /// The bot that owns this history.
    Myself,
    Tool { name: String },
    Subtask { task_id: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub author: Author,
    pub content: String,
    pub tool_calls: Vec<ToolInvocation>,
    /// Set on tool results, correlating them with the call.
    pub invocation_id: Option<String>,
    pub is_error: bool,
}

impl Turn {
    /// An event from the channel (or a sub-task report) as seen by `self_name`.
    pub fn inbound(event: &InboundEvent, self_name: &str) -> Self {
        let (author, is_error) = match &event.kind {
            EventKind::SubtaskCompletion { task_id, is_error } => (
                Author::Subtask {
                    task_id: task_id.clone(),
                },
                *is_error,
            ),
            EventKind::Chat if event.is_own_echo(self_name) => (Author::Myself, false),
            EventKind::Chat if event.is_self_origin => (
                Author::Bot {
                    name: event.sender_display_name.clone(),
                },
                false,
            ),
            EventKind::Chat => (
                Author::Human {
                    id: event.sender_id.clone(),
                    display_name: event.sender_display_name.clone(),
                },
                false,
            ),
        };
        let role = if author == Author::Myself {
            Role::Assistant
        } else {
            Role::User
        };
        Self {
            role,
            author,
            content: event.text.clone(),
            tool_calls: Vec::new(),
            invocation_id: None,
            is_error,
        }
    }

    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolInvocation>) -> Self {
        Self {
            role: Role::Assistant,
            author: Author::Myself,
            content: text.into(),
            tool_calls,
            invocation_id: None,
            is_error: false,
        }
    }

    pub fn tool_result(
        invocation_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::Tool,
            author: Author::Tool {
                name: tool_name.into(),
            },
            content: content.into(),
            tool_calls: Vec::new(),
            invocation_id: Some(invocation_id.into()),
            is_error,
        }
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool
    }

    /// A turn that may open a prompt: anything that is not ours and not a tool result.
    pub fn starts_exchange(&self) -> bool {
        self.role == Role::User
    }
}

#[derive(Clone, Debug)]
pub struct ConversationState {
    committed: Vec<Turn>,
    pending: Vec<Turn>,
    max_stored: usize,
}

impl ConversationState {
    pub fn new(max_stored: usize) -> Self {
        Self {
            committed: Vec::new(),
            pending: Vec::new(),
            max_stored: max_stored.max(1),
        }
    }

    pub fn committed(&self) -> &[Turn] {
        &self.committed
    }

    pub fn pending(&self) -> &[Turn] {
        &self.pending
    }

    pub fn push_pending(&mut self, turn: Turn) {
        self.pending.push(turn);
    }

    /// Commit `inbound` followed by every pending turn.
    pub fn commit(&mut self, inbound: Turn) {
        self.committed.push(inbound);
        self.committed.append(&mut self.pending);
        self.enforce_cap();
    }

    /// Commit only `inbound`; the exchange it triggered is thrown away.
    pub fn commit_inbound_only(&mut self, inbound: Turn) {
        self.pending.clear();
        self.committed.push(inbound);
        self.enforce_cap();
    }

    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    fn enforce_cap(&mut self) {
        if self.committed.len() <= self.max_stored {
            return;
        }
        let mut cut = self.committed.len() - self.max_stored;
        while cut < self.committed.len() && !self.committed[cut].starts_exchange() {
            cut += 1;
        }
        if cut == self.committed.len() {
            // Keep at least the most recent exchange whole.
            cut = self
                .committed
                .iter()
                .rposition(Turn::starts_exchange)
                .unwrap_or(cut);
        }
        self.committed.drain(..cut);
    }
}
