//! Gateway configuration
//!
//! Loaded once from TOML at startup and treated as a fixed snapshot for the
//! lifetime of the process. Every section falls back to defaults.

use crate::error::{Error, Result};
use crate::types::{validate_identities, BotIdentity};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bot definitions, in startup order.
    pub bots: Vec<BotConfig>,
    /// Channel the console transport posts into.
    pub channel: ChannelConfig,
    pub bus: BusConfig,
    pub agent: AgentSettings,
    pub multi_bot: MultiBotConfig,
    pub supervisor: SupervisorConfig,
}

/// One `[[bots]]` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub name: String,
    pub model: String,
    /// Inline credential. Prefer `api_key_env`.
    pub api_key: Option<String>,
    /// Environment variable holding the credential.
    pub api_key_env: Option<String>,
    pub persona: Option<String>,
    /// Base endpoint override for the model provider.
    pub api_base: Option<String>,
}

impl BotConfig {
    /// Resolve the credential, reading `api_key_env` when no inline key is set.
    pub fn resolve_credential(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                self.api_key_env
                    .as_ref()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|k| !k.trim().is_empty())
            })
    }

    pub fn to_identity(&self) -> Result<BotIdentity> {
        let credential = self
            .resolve_credential()
            .ok_or_else(|| Error::missing_field(&self.name, "credential"))?;
        Ok(BotIdentity {
            name: self.name.clone(),
            model: self.model.clone(),
            credential,
            persona: self.persona.clone().filter(|p| !p.trim().is_empty()),
            base_url: self.api_base.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel id used by the console transport.
    pub id: String,
    /// Display name given to the local human on the console.
    pub human_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Events buffered per bot before the oldest unread one is dropped.
    pub mailbox_capacity: usize,
}

/// How much history is kept in each prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetentionConfig {
    MostRecent { turns: usize },
    TokenBudget { tokens: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Model/tool round-trips allowed for a single inbound event.
    pub max_tool_iterations: usize,
    /// Attempts per model call, including the first.
    pub model_max_attempts: u32,
    /// Base delay for exponential retry backoff.
    pub retry_base_ms: u64,
    pub model_timeout_secs: u64,
    pub max_tokens: u32,
    /// Attempts to hand a reply to the bus before giving up.
    pub publish_max_attempts: u32,
    /// Sub-tasks may not spawn further sub-tasks beyond this depth.
    pub max_subtask_depth: usize,
    pub subtask_max_iterations: usize,
    pub retention: RetentionConfig,
    /// Hard cap on turns kept in memory per bot.
    pub max_stored_turns: usize,
    /// Tool output longer than this is truncated before entering history.
    pub max_tool_output_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiBotConfig {
    /// Replies a bot may give to other bots before a human speaks again.
    pub max_bot_rounds: usize,
    pub reply_delay_min_ms: u64,
    pub reply_delay_max_ms: u64,
    pub mute_commands: Vec<String>,
    pub unmute_commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Restarts allowed inside one window before a bot is marked failed.
    pub max_restarts: u32,
    pub restart_window_secs: u64,
    pub restart_delay_ms: u64,
    pub shutdown_timeout_secs: u64,
}

// ============================================================
// Defaults
// ============================================================

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: "console".to_string(),
            human_name: "you".to_string(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self::MostRecent { turns: 40 }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_tool_iterations: 10,
            model_max_attempts: 3,
            retry_base_ms: 500,
            model_timeout_secs: 120,
            max_tokens: 4096,
            publish_max_attempts: 2,
            max_subtask_depth: 1,
            subtask_max_iterations: 15,
            retention: RetentionConfig::default(),
            max_stored_turns: 400,
            max_tool_output_chars: 50_000,
        }
    }
}

impl Default for MultiBotConfig {
    fn default() -> Self {
        Self {
            max_bot_rounds: 3,
            reply_delay_min_ms: 0,
            reply_delay_max_ms: 0,
            mute_commands: ["闭麦", "全体闭麦", "mute", "mute all", "安静", "别说了", "停"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            unmute_commands: ["开麦", "unmute", "继续", "说吧", "开始讨论"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_window_secs: 300,
            restart_delay_ms: 1000,
            shutdown_timeout_secs: 10,
        }
    }
}

// ============================================================
// Accessors
// ============================================================

impl AgentSettings {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }
}

impl MultiBotConfig {
    fn matches(list: &[String], text: &str) -> bool {
        let needle = text.trim().to_lowercase();
        list.iter().any(|c| c.to_lowercase() == needle)
    }

    pub fn is_mute_command(&self, text: &str) -> bool {
        Self::matches(&self.mute_commands, text)
    }

    pub fn is_unmute_command(&self, text: &str) -> bool {
        Self::matches(&self.unmute_commands, text)
    }

    pub fn reply_delay_range(&self) -> (Duration, Duration) {
        let min = self.reply_delay_min_ms;
        let max = self.reply_delay_max_ms.max(min);
        (Duration::from_millis(min), Duration::from_millis(max))
    }
}

impl SupervisorConfig {
    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl GatewayConfig {
    /// Load from a specific path. A missing or malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Default path: ~/.chorusclaw/chorusclaw.toml
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".chorusclaw").join("chorusclaw.toml")
    }

    /// Resolve every bot into an identity and validate the set.
    pub fn identities(&self) -> Result<Vec<BotIdentity>> {
        let identities = self
            .bots
            .iter()
            .map(BotConfig::to_identity)
            .collect::<Result<Vec<_>>>()?;
        validate_identities(&identities)?;
        Ok(identities)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
