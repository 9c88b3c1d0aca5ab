//! Core types for Chorusclaw

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Sender id used for synthetic sub-task completion events.
pub const SUBTASK_SENDER: &str = "subtask";

/// Where an inbound event came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Ordinary traffic from the shared channel.
    Chat,
    /// A detached sub-task finished and reports back to its bot.
    SubtaskCompletion { task_id: String, is_error: bool },
}

/// One event observed on the shared channel. Immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event_id: String,
    pub source_channel_id: String,
    pub sender_id: String,
    pub sender_display_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// True when one of this gateway's bots produced the message.
    pub is_self_origin: bool,
    pub kind: EventKind,
}

impl InboundEvent {
    /// A message typed by a human in the channel.
    pub fn human(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        display_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            source_channel_id: channel.into(),
            sender_id: sender_id.into(),
            sender_display_name: display_name.into(),
            text: text.into(),
            timestamp: Utc::now(),
            is_self_origin: false,
            kind: EventKind::Chat,
        }
    }

    /// A message one of our own bots posted, echoed back by the transport.
    pub fn from_bot(
        channel: impl Into<String>,
        bot_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let bot_name = bot_name.into();
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            source_channel_id: channel.into(),
            sender_id: bot_name.clone(),
            sender_display_name: bot_name,
            text: text.into(),
            timestamp: Utc::now(),
            is_self_origin: true,
            kind: EventKind::Chat,
        }
    }

    /// Synthetic event reporting a finished sub-task to the bot that spawned it.
    pub fn subtask_completion(
        channel: impl Into<String>,
        task_id: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            source_channel_id: channel.into(),
            sender_id: SUBTASK_SENDER.to_string(),
            sender_display_name: SUBTASK_SENDER.to_string(),
            text: text.into(),
            timestamp: Utc::now(),
            is_self_origin: false,
            kind: EventKind::SubtaskCompletion {
                task_id: task_id.into(),
                is_error,
            },
        }
    }

    pub fn with_event_id(mut self, id: impl Into<String>) -> Self {
        self.event_id = id.into();
        self
    }

    /// True when this is `bot_name`'s own message coming back from the channel.
    pub fn is_own_echo(&self, bot_name: &str) -> bool {
        self.is_self_origin && (self.sender_id == bot_name || self.sender_display_name == bot_name)
    }

    pub fn is_subtask_completion(&self) -> bool {
        matches!(self.kind, EventKind::SubtaskCompletion { .. })
    }

    /// Human traffic: not produced by any bot and not synthetic.
    pub fn is_human(&self) -> bool {
        !self.is_self_origin && matches!(self.kind, EventKind::Chat)
    }
}

/// One configured bot. Created at startup, never mutated afterwards.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotIdentity {
    pub name: String,
    pub model: String,
    /// Opaque credential, only ever read by the model-invocation collaborator.
    pub credential: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl BotIdentity {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            credential: credential.into(),
            persona: None,
            base_url: None,
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// First 50 characters of the persona, for status displays.
    pub fn persona_preview(&self) -> String {
        match &self.persona {
            Some(p) if p.chars().count() > 50 => {
                format!("{}...", p.chars().take(50).collect::<String>())
            }
            Some(p) => p.clone(),
            None => String::new(),
        }
    }

    /// Credential with everything but the first four characters masked.
    pub fn masked_credential(&self) -> String {
        let prefix: String = self.credential.chars().take(4).collect();
        format!("{}***", prefix)
    }
}

impl std::fmt::Debug for BotIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotIdentity")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("credential", &"<redacted>")
            .field("persona", &self.persona)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Check a set of identities before any loop starts.
///
/// Names must be unique and non-empty; model and credential must be present.
pub fn validate_identities(identities: &[BotIdentity]) -> crate::Result<()> {
    if identities.is_empty() {
        return Err(crate::Error::config("no bots configured"));
    }
    let mut seen = HashSet::new();
    for identity in identities {
        if identity.name.trim().is_empty() {
            return Err(crate::Error::config("bot name must not be empty"));
        }
        if !seen.insert(identity.name.as_str()) {
            return Err(crate::Error::DuplicateBotName(identity.name.clone()));
        }
        if identity.credential.trim().is_empty() {
            return Err(crate::Error::missing_field(&identity.name, "credential"));
        }
        if identity.model.trim().is_empty() {
            return Err(crate::Error::missing_field(&identity.name, "model"));
        }
    }
    Ok(())
}

/// A reply produced by one bot, addressed to one channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub bot_name: String,
    pub target_channel_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to_event_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(
        bot_name: impl Into<String>,
        target_channel_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            bot_name: bot_name.into(),
            target_channel_id: target_channel_id.into(),
            text: text.into(),
            in_reply_to_event_id: None,
        }
    }

    pub fn in_reply_to(mut self, event_id: impl Into<String>) -> Self {
        self.in_reply_to_event_id = Some(event_id.into());
        self
    }
}

/// A capability requested by the model, correlated by `invocation_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub invocation_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Message role
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Handle identifying one mailbox on the bus.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}
