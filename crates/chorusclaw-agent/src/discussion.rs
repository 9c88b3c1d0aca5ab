//! Per-bot discussion policy: who gets an answer, who is only observed.
//!
//! Humans always get an answer. Other bots get one while the channel is not
//! muted and the bot has not used up its rounds since the last human message.

use chorusclaw_core::{InboundEvent, MultiBotConfig};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};

/// What the loop should do with one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Reply. A skip marker in the reply is stripped rather than honoured.
    MustReply,
    /// Reply unless the model answers with the skip marker.
    MayReply,
    /// Record in history, send nothing.
    Observe,
    /// A mute or unmute command. Record, never reply.
    Control,
}

impl Decision {
    pub fn replies(&self) -> bool {
        matches!(self, Self::MustReply | Self::MayReply)
    }
}

#[derive(Debug, Default, Clone)]
struct ChannelState {
    muted: bool,
    bot_rounds: usize,
}

/// Mute flag and round counter per channel, owned by one loop.
#[derive(Debug)]
pub struct DiscussionPolicy {
    config: MultiBotConfig,
    channels: HashMap<String, ChannelState>,
}

impl DiscussionPolicy {
    pub fn new(config: MultiBotConfig) -> Self {
        Self {
            config,
            channels: HashMap::new(),
        }
    }

    /// Classify `event` and update mute state. Round counting happens in
    /// [`record_reply`](Self::record_reply) once a reply actually went out.
    pub fn decide(&mut self, bot_name: &str, event: &InboundEvent) -> Decision {
        if event.is_subtask_completion() {
            return Decision::MustReply;
        }
        let max_rounds = self.config.max_bot_rounds;
        let is_mute = self.config.is_mute_command(&event.text);
        let is_unmute = self.config.is_unmute_command(&event.text);
        let state = self
            .channels
            .entry(event.source_channel_id.clone())
            .or_default();

        if event.is_human() {
            if is_mute {
                state.muted = true;
                info!(bot = %bot_name, channel = %event.source_channel_id, "muted");
                return Decision::Control;
            }
            if is_unmute {
                state.muted = false;
                state.bot_rounds = 0;
                info!(bot = %bot_name, channel = %event.source_channel_id, "unmuted");
                return Decision::Control;
            }
            state.bot_rounds = 0;
            return Decision::MustReply;
        }

        if state.muted {
            debug!(bot = %bot_name, from = %event.sender_id, "muted, observing bot message");
            return Decision::Observe;
        }
        if state.bot_rounds >= max_rounds {
            debug!(bot = %bot_name, rounds = state.bot_rounds, "round limit reached");
            return Decision::Observe;
        }
        Decision::MayReply
    }

    /// Count a reply sent in answer to `event`.
    pub fn record_reply(&mut self, event: &InboundEvent) {
        if event.is_human() || event.is_subtask_completion() {
            return;
        }
        let state = self
            .channels
            .entry(event.source_channel_id.clone())
            .or_default();
        state.bot_rounds += 1;
    }

    pub fn is_muted(&self, channel_id: &str) -> bool {
        self.channels.get(channel_id).is_some_and(|s| s.muted)
    }

    pub fn rounds(&self, channel_id: &str) -> usize {
        self.channels.get(channel_id).map_or(0, |s| s.bot_rounds)
    }
}

pub const RECENT_EVENT_WINDOW: usize = 256;

/// Bounded memory of event ids already handled.
#[derive(Debug)]
pub struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Remember `id`. Returns false if it was already in the window.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for RecentIds {
    fn default() -> Self {
        Self::new(RECENT_EVENT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_rounds: usize) -> DiscussionPolicy {
        DiscussionPolicy::new(MultiBotConfig {
            max_bot_rounds: max_rounds,
            ..Default::default()
        })
    }

    #[test]
    fn humans_always_get_an_answer() {
        let mut p = policy(0);
        let ev = InboundEvent::human("c", "u", "Ann", "hello");
        assert_eq!(p.decide("a", &ev), Decision::MustReply);
    }

    #[test]
    fn round_limit_resets_when_a_human_speaks() {
        let mut p = policy(2);
        let bot = InboundEvent::from_bot("c", "b", "idea");
        for _ in 0..2 {
            assert_eq!(p.decide("a", &bot), Decision::MayReply);
            p.record_reply(&bot);
        }
        assert_eq!(p.decide("a", &bot), Decision::Observe);

        p.decide("a", &InboundEvent::human("c", "u", "Ann", "go on"));
        assert_eq!(p.rounds("c"), 0);
        assert_eq!(p.decide("a", &bot), Decision::MayReply);
    }

    #[test]
    fn mute_only_silences_bot_to_bot() {
        let mut p = policy(5);
        assert_eq!(
            p.decide("a", &InboundEvent::human("c", "u", "Ann", " Mute ")),
            Decision::Control
        );
        assert!(p.is_muted("c"));
        assert!(!p.is_muted("other"));
        assert_eq!(
            p.decide("a", &InboundEvent::from_bot("c", "b", "x")),
            Decision::Observe
        );
        assert_eq!(
            p.decide("a", &InboundEvent::human("c", "u", "Ann", "question")),
            Decision::MustReply
        );
        assert_eq!(
            p.decide("a", &InboundEvent::human("c", "u", "Ann", "unmute")),
            Decision::Control
        );
        assert_eq!(
            p.decide("a", &InboundEvent::from_bot("c", "b", "x")),
            Decision::MayReply
        );
    }

    #[test]
    fn recent_ids_window_evicts_oldest() {
        let mut ids = RecentIds::new(2);
        assert!(ids.insert("a"));
        assert!(!ids.insert("a"));
        assert!(ids.insert("b"));
        assert!(ids.insert("c"));
        assert_eq!(ids.len(), 2);
        assert!(ids.insert("a"));
    }
}
