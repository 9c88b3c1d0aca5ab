//! Error types for Chorusclaw

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("duplicate bot name: {0}")]
    DuplicateBotName(String),

    #[error("bot '{bot}' has no {field}")]
    MissingField { bot: String, field: &'static str },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("toml error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    pub fn missing_field(bot: impl Into<String>, field: &'static str) -> Self {
        Self::MissingField {
            bot: bot.into(),
            field,
        }
    }
}

/// Failures raised by the channel transport or the bus outbound path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport rejected message: {0}")]
    Rejected(String),

    #[error("transport closed")]
    Closed,

    #[error("transport io: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Classification attached to every failure that concerns one bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Configuration,
    Transport,
    ModelTransient,
    ModelPermanent,
    Tool,
    LoopCrash,
}

impl FailureKind {
    /// Plain chat sentence shown in the channel, or `None` for failures that
    /// are only logged.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            Self::Configuration | Self::LoopCrash => None,
            Self::Transport => Some("I couldn't deliver my reply to the channel."),
            Self::ModelTransient => Some(
                "Sorry, I couldn't come up with a reply just now. Please try again in a moment.",
            ),
            Self::ModelPermanent => Some(
                "I can't reach my language model with the credentials I was given, so I'm pausing until an operator fixes it.",
            ),
            Self::Tool => Some("One of my tools failed while I was working on that."),
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::Transport => "transport",
            Self::ModelTransient => "model-transient",
            Self::ModelPermanent => "model-permanent",
            Self::Tool => "tool",
            Self::LoopCrash => "loop-crash",
        };
        f.write_str(s)
    }
}

/// A failure tagged with the bot it happened to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotFailure {
    pub bot: String,
    pub kind: FailureKind,
    pub message: String,
}

impl BotFailure {
    pub fn new(bot: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            bot: bot.into(),
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for BotFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bot '{}' [{}]: {}", self.bot, self.kind, self.message)
    }
}

impl std::error::Error for BotFailure {}
