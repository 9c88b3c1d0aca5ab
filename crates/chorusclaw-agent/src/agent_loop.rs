//! Agent loop - one task per bot, draining its mailbox one event at a time.
//!
//! `TurnEngine` is the model/tool cycle shared by channel loops and
//! sub-tasks. `AgentLoop` wraps it with mailbox handling, discussion policy,
//! reply emission and history commits.

use crate::bus::{Mailbox, MessageBus};
use crate::context::{ContextBuilder, Prompt, SKIP_MARKER};
use crate::conversation::{ConversationState, Turn};
use crate::discussion::{Decision, DiscussionPolicy, RecentIds};
use crate::error::{AgentError, AgentResult};
use crate::subtask::SubtaskManager;
use chorusclaw_core::{
    AgentSettings, BotIdentity, FailureKind, InboundEvent, MultiBotConfig, OutboundMessage,
    ToolInvocation, TransportError,
};
use chorusclaw_llm::{
    collect_reply, LlmError, LlmProvider, LlmRequest, LlmResult, ModelReply, ProviderFactory,
};
use chorusclaw_tools::{
    create_default_registry, create_spawner_handle, ToolContext, ToolInvocationError, ToolOutcome,
    ToolRegistry,
};
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where a loop is in its cycle. Published on a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    BuildingContext,
    AwaitingModel,
    DispatchingTools,
    Emitting,
    Stopped,
    Halted,
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::BuildingContext => "building-context",
            Self::AwaitingModel => "awaiting-model",
            Self::DispatchingTools => "dispatching-tools",
            Self::Emitting => "emitting",
            Self::Stopped => "stopped",
            Self::Halted => "halted",
        };
        f.write_str(s)
    }
}

/// How a loop ended without crashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Cancelled or mailbox closed.
    Stopped,
    /// Permanent model failure; needs an operator.
    Halted,
}

/// Shared, read-only collaborators handed to every loop.
#[derive(Clone)]
pub struct LoopDeps {
    pub bus: Arc<MessageBus>,
    pub tools: Arc<ToolRegistry>,
    pub context: Arc<ContextBuilder>,
    pub subtasks: Arc<SubtaskManager>,
    pub providers: Arc<dyn ProviderFactory>,
    pub settings: Arc<AgentSettings>,
    pub multi_bot: Arc<MultiBotConfig>,
}

impl LoopDeps {
    /// Build the registry, context builder and sub-task manager around `bus`.
    ///
    /// The spawn tool is wired to the sub-task manager after both exist.
    pub async fn wire(
        bus: Arc<MessageBus>,
        providers: Arc<dyn ProviderFactory>,
        settings: AgentSettings,
        multi_bot: MultiBotConfig,
    ) -> Self {
        let spawner = create_spawner_handle();
        let tools = Arc::new(create_default_registry(bus.clone(), spawner.clone()));
        let context = Arc::new(ContextBuilder::from_config(
            tools.clone(),
            &settings.retention,
        ));
        let settings = Arc::new(settings);
        let subtasks = Arc::new(SubtaskManager::new(
            bus.clone(),
            tools.clone(),
            context.clone(),
            settings.clone(),
        ));
        *spawner.write().await = Some(subtasks.clone());

        Self {
            bus,
            tools,
            context,
            subtasks,
            providers,
            settings,
            multi_bot: Arc::new(multi_bot),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Channel,
    Subtask { allow_spawn: bool },
}

/// Runs the model/tool cycle for one event against a conversation.
pub struct TurnEngine {
    identity: Arc<BotIdentity>,
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    context: Arc<ContextBuilder>,
    settings: Arc<AgentSettings>,
    mode: EngineMode,
    phase: Option<Arc<watch::Sender<LoopPhase>>>,
}

impl TurnEngine {
    pub fn new(
        identity: Arc<BotIdentity>,
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        context: Arc<ContextBuilder>,
        settings: Arc<AgentSettings>,
    ) -> Self {
        Self {
            identity,
            provider,
            tools,
            context,
            settings,
            mode: EngineMode::Channel,
            phase: None,
        }
    }

    pub fn for_subtask(mut self, allow_spawn: bool) -> Self {
        self.mode = EngineMode::Subtask { allow_spawn };
        self
    }

    pub fn with_phase(mut self, phase: Arc<watch::Sender<LoopPhase>>) -> Self {
        self.phase = Some(phase);
        self
    }

    fn set_phase(&self, phase: LoopPhase) {
        if let Some(tx) = &self.phase {
            tx.send_replace(phase);
        }
    }

    pub fn prompt(&self, state: &ConversationState, event: &InboundEvent) -> Prompt {
        match self.mode {
            EngineMode::Channel => self.context.build(state, event, &self.identity),
            EngineMode::Subtask { allow_spawn } => {
                self.context
                    .build_subtask(state, event, &self.identity, allow_spawn)
            }
        }
    }

    /// Answer `event`, dispatching tools until the model gives a final text.
    ///
    /// Tool exchanges are left in `state.pending()`; committing is up to the caller.
    pub async fn run(
        &self,
        state: &mut ConversationState,
        event: &InboundEvent,
        ctx: &ToolContext,
        max_iterations: usize,
        cancel: &CancellationToken,
    ) -> AgentResult<String> {
        let mut iterations = 0;
        loop {
            iterations += 1;
            if iterations > max_iterations {
                return Err(AgentError::ToolIterationsExceeded(max_iterations));
            }

            self.set_phase(LoopPhase::BuildingContext);
            let prompt = self.prompt(state, event);
            let request = LlmRequest {
                model: self.identity.model.clone(),
                messages: prompt.messages,
                tools: (!prompt.tools.is_empty()).then_some(prompt.tools),
                max_tokens: Some(self.settings.max_tokens),
                system: Some(prompt.system),
                ..Default::default()
            };

            self.set_phase(LoopPhase::AwaitingModel);
            let reply = self.invoke_model(request, cancel).await?;
            if !reply.has_tool_calls() {
                return Ok(reply.text);
            }
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            self.set_phase(LoopPhase::DispatchingTools);
            self.dispatch_tools(state, reply, ctx).await;
            debug!(
                bot = %self.identity.name,
                iteration = iterations,
                "tool calls dispatched, continuing"
            );
        }
    }

    async fn call_model(&self, request: LlmRequest) -> LlmResult<ModelReply> {
        let stream = self.provider.complete_stream(request, None).await?;
        collect_reply(stream).await
    }

    /// One model call with timeout and bounded retry of transient failures.
    async fn invoke_model(
        &self,
        request: LlmRequest,
        cancel: &CancellationToken,
    ) -> AgentResult<ModelReply> {
        let attempts = self.settings.model_max_attempts.max(1);
        let timeout = self.settings.model_timeout();
        let mut last = String::new();

        for attempt in 1..=attempts {
            let result = match tokio::time::timeout(timeout, self.call_model(request.clone())).await
            {
                Ok(r) => r,
                Err(_) => Err(LlmError::Timeout(timeout.as_millis() as u64)),
            };

            match result {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_permanent() => {
                    error!(bot = %self.identity.name, error = %e, "model rejected credentials");
                    return Err(AgentError::ModelPermanent(e.to_string()));
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        bot = %self.identity.name,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "model call failed"
                    );
                    last = e.to_string();
                    if attempt < attempts {
                        let wait = backoff(self.settings.retry_base(), attempt, e.retry_after_ms());
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
                Err(e) => {
                    warn!(bot = %self.identity.name, error = %e, "model call failed");
                    return Err(AgentError::Model(e.to_string()));
                }
            }
        }

        Err(AgentError::ModelExhausted { attempts, last })
    }

    /// Run every call of `reply` and append results in issue order.
    async fn dispatch_tools(&self, state: &mut ConversationState, reply: ModelReply, ctx: &ToolContext) {
        let mut calls = Vec::with_capacity(reply.tool_calls.len());
        let mut parsed = Vec::with_capacity(reply.tool_calls.len());
        for tc in &reply.tool_calls {
            let args = tc
                .parse_arguments()
                .map_err(|e| ToolInvocationError::invalid(&tc.name, e.to_string()));
            calls.push(ToolInvocation {
                invocation_id: tc.id.clone(),
                tool_name: tc.name.clone(),
                arguments: args.clone().unwrap_or_else(|_| Value::Object(Default::default())),
            });
            parsed.push(args);
        }
        state.push_pending(Turn::assistant(reply.text, calls.clone()));

        let concurrent = calls.len() > 1
            && self
                .tools
                .all_read_only(calls.iter().map(|c| c.tool_name.as_str()));

        let outcomes: Vec<ToolOutcome> = if concurrent {
            join_all(
                calls
                    .iter()
                    .zip(parsed)
                    .map(|(call, args)| self.invoke_tool(call, args, ctx)),
            )
            .await
        } else {
            let mut out = Vec::with_capacity(calls.len());
            for (call, args) in calls.iter().zip(parsed) {
                out.push(self.invoke_tool(call, args, ctx).await);
            }
            out
        };

        for (call, outcome) in calls.iter().zip(outcomes) {
            let (content, is_error) = match outcome {
                Ok(result) => (result.to_content_string(), false),
                Err(e) => (e.to_string(), true),
            };
            let content = truncate_output(content, self.settings.max_tool_output_chars);
            state.push_pending(Turn::tool_result(
                &call.invocation_id,
                &call.tool_name,
                content,
                is_error,
            ));
        }
    }

    async fn invoke_tool(
        &self,
        call: &ToolInvocation,
        args: Result<Value, ToolInvocationError>,
        ctx: &ToolContext,
    ) -> ToolOutcome {
        let args = args?;
        debug!(bot = %ctx.bot_name, tool = %call.tool_name, id = %call.invocation_id, "executing tool");
        let outcome = self.tools.invoke(&call.tool_name, args, ctx).await;
        if let Err(e) = &outcome {
            warn!(bot = %ctx.bot_name, tool = %call.tool_name, error = %e, "tool failed");
        }
        outcome
    }
}

fn backoff(base: Duration, attempt: u32, retry_after_ms: Option<u64>) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16));
    match retry_after_ms {
        Some(ms) => exp.max(Duration::from_millis(ms)),
        None => exp,
    }
}

fn truncate_output(content: String, max_chars: usize) -> String {
    let total = content.chars().count();
    if total <= max_chars {
        return content;
    }
    let head: String = content.chars().take(max_chars).collect();
    format!("{}...\n[truncated, {} total chars]", head, total)
}

/// Reply text after skip-marker handling, or `None` when nothing should be sent.
pub fn finalize_reply(text: &str, decision: Decision) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.contains(SKIP_MARKER) {
        if decision == Decision::MayReply {
            return None;
        }
        let stripped = trimmed.replace(SKIP_MARKER, "");
        let stripped = stripped.trim();
        return (!stripped.is_empty()).then(|| stripped.to_string());
    }
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// One bot's long-running task.
pub struct AgentLoop {
    identity: Arc<BotIdentity>,
    deps: LoopDeps,
    state: ConversationState,
    policy: DiscussionPolicy,
    recent: RecentIds,
    phase: Arc<watch::Sender<LoopPhase>>,
}

impl AgentLoop {
    pub fn new(identity: Arc<BotIdentity>, deps: LoopDeps) -> Self {
        let (tx, _) = watch::channel(LoopPhase::Idle);
        Self::with_phase_sender(identity, deps, Arc::new(tx))
    }

    /// Publish phases on an existing channel, so observers survive restarts.
    pub fn with_phase_sender(
        identity: Arc<BotIdentity>,
        deps: LoopDeps,
        phase: Arc<watch::Sender<LoopPhase>>,
    ) -> Self {
        let state = ConversationState::new(deps.settings.max_stored_turns);
        let policy = DiscussionPolicy::new((*deps.multi_bot).clone());
        Self {
            identity,
            deps,
            state,
            policy,
            recent: RecentIds::default(),
            phase,
        }
    }

    pub fn phase(&self) -> watch::Receiver<LoopPhase> {
        self.phase.subscribe()
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    fn set_phase(&self, phase: LoopPhase) {
        self.phase.send_replace(phase);
    }

    /// Drain `mailbox` until cancelled, closed or halted.
    ///
    /// An `Err` means the loop could not start; a panic propagates to the
    /// task's join handle.
    pub async fn run(mut self, mailbox: Mailbox, cancel: CancellationToken) -> AgentResult<LoopExit> {
        let provider = match self.deps.providers.build(&self.identity) {
            Ok(provider) => provider,
            Err(e) => {
                self.deps.bus.unsubscribe(mailbox.id());
                error!(bot = %self.identity.name, error = %e, "no model provider");
                return Err(AgentError::ProviderSetup(e.to_string()));
            }
        };
        self.deps
            .subtasks
            .bind(self.identity.clone(), provider.clone());

        let engine = TurnEngine::new(
            self.identity.clone(),
            provider,
            self.deps.tools.clone(),
            self.deps.context.clone(),
            self.deps.settings.clone(),
        )
        .with_phase(self.phase.clone());

        info!(bot = %self.identity.name, model = %self.identity.model, "agent loop started");
        self.set_phase(LoopPhase::Idle);

        let exit = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break LoopExit::Stopped,
                event = mailbox.recv() => match event {
                    Some(event) => event,
                    None => break LoopExit::Stopped,
                },
            };
            if let Some(exit) = self.handle_event(&engine, event, &cancel).await {
                break exit;
            }
        };

        self.deps.bus.unsubscribe(mailbox.id());
        self.set_phase(match exit {
            LoopExit::Stopped => LoopPhase::Stopped,
            LoopExit::Halted => LoopPhase::Halted,
        });
        info!(bot = %self.identity.name, ?exit, turns = self.state.len(), "agent loop exited");
        Ok(exit)
    }

    async fn handle_event(
        &mut self,
        engine: &TurnEngine,
        event: InboundEvent,
        cancel: &CancellationToken,
    ) -> Option<LoopExit> {
        let name = self.identity.name.clone();
        if event.is_own_echo(&name) {
            debug!(bot = %name, event = %event.event_id, "ignoring own echo");
            return None;
        }
        if !self.recent.insert(&event.event_id) {
            debug!(bot = %name, event = %event.event_id, "duplicate event ignored");
            return None;
        }

        let decision = self.policy.decide(&name, &event);
        let inbound = Turn::inbound(&event, &name);
        if !decision.replies() {
            self.state.commit_inbound_only(inbound);
            return None;
        }

        let ctx = ToolContext::new(&name, &event.source_channel_id, &event.event_id);
        let max_iterations = self.deps.settings.max_tool_iterations;
        let result = engine
            .run(&mut self.state, &event, &ctx, max_iterations, cancel)
            .await;

        match result {
            Ok(text) => match finalize_reply(&text, decision) {
                Some(reply) => {
                    self.set_phase(LoopPhase::Emitting);
                    self.pace(cancel).await;
                    let msg = OutboundMessage::new(&name, &event.source_channel_id, &reply)
                        .in_reply_to(&event.event_id);
                    match self.publish(msg).await {
                        Ok(()) => {
                            self.state.push_pending(Turn::assistant(reply, Vec::new()));
                            self.state.commit(inbound);
                            self.policy.record_reply(&event);
                            info!(bot = %name, event = %event.event_id, "reply sent");
                        }
                        Err(e) => {
                            error!(bot = %name, error = %e, "reply dropped after publish retries");
                            self.state.commit_inbound_only(inbound);
                        }
                    }
                }
                None => {
                    if decision == Decision::MayReply {
                        info!(bot = %name, from = %event.sender_id, "chose to skip");
                    } else {
                        warn!(bot = %name, event = %event.event_id, "empty reply, nothing sent");
                    }
                    self.state.commit_inbound_only(inbound);
                }
            },
            Err(AgentError::ModelPermanent(reason)) => {
                error!(bot = %name, reason = %reason, "halting loop");
                self.state.commit_inbound_only(inbound);
                self.notify_failure(FailureKind::ModelPermanent, &event).await;
                return Some(LoopExit::Halted);
            }
            Err(AgentError::Cancelled) => {
                debug!(bot = %name, "cycle cancelled");
                self.state.commit_inbound_only(inbound);
            }
            Err(e) => {
                warn!(bot = %name, kind = %e.failure_kind(), error = %e, "cycle failed");
                self.state.commit_inbound_only(inbound);
                if decision == Decision::MustReply {
                    self.notify_failure(e.failure_kind(), &event).await;
                }
            }
        }

        self.set_phase(LoopPhase::Idle);
        None
    }

    /// Optional jittered delay before a reply goes out.
    async fn pace(&self, cancel: &CancellationToken) {
        let (min, max) = self.deps.multi_bot.reply_delay_range();
        if max.is_zero() {
            return;
        }
        let span = (max - min).as_millis();
        let jitter = if span == 0 {
            0
        } else {
            (uuid::Uuid::new_v4().as_u128() % (span + 1)) as u64
        };
        let delay = min + Duration::from_millis(jitter);
        debug!(bot = %self.identity.name, delay_ms = delay.as_millis() as u64, "pacing reply");
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    async fn publish(&self, msg: OutboundMessage) -> Result<(), TransportError> {
        let attempts = self.deps.settings.publish_max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.deps.bus.publish_outbound(msg.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(bot = %msg.bot_name, attempt, error = %e, "publish failed, retrying");
                    tokio::time::sleep(backoff(self.deps.settings.retry_base(), attempt, None)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn notify_failure(&self, kind: FailureKind, event: &InboundEvent) {
        let Some(text) = kind.user_message() else {
            return;
        };
        let msg = OutboundMessage::new(&self.identity.name, &event.source_channel_id, text)
        .in_reply_to(&event.event_id);
        if let Err(e) = self.publish(msg).await {
            error!(bot = %self.identity.name, kind = %kind, error = %e, "could not report failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_marker_is_honoured_only_for_bot_triggers() {
        assert_eq!(finalize_reply(" [SKIP] ", Decision::MayReply), None);
        assert_eq!(finalize_reply("[SKIP]", Decision::MustReply), None);
        assert_eq!(
            finalize_reply("[SKIP] Sure, here it is.", Decision::MustReply).as_deref(),
            Some("Sure, here it is.")
        );
        assert_eq!(
            finalize_reply("  hello  ", Decision::MayReply).as_deref(),
            Some("hello")
        );
    }

    #[test]
    fn backoff_doubles_and_respects_retry_after() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 1, None), Duration::from_millis(100));
        assert_eq!(backoff(base, 3, None), Duration::from_millis(400));
        assert_eq!(backoff(base, 1, Some(1500)), Duration::from_millis(1500));
    }

    #[test]
    fn truncation_counts_characters() {
        let s = "é".repeat(10);
        let t = truncate_output(s, 3);
        assert!(t.starts_with("ééé..."));
        assert!(t.contains("10 total chars"));
        // 10 chars but 20 bytes: under the limit, kept whole.
        assert_eq!(truncate_output("é".repeat(10), 10), "é".repeat(10));
        assert_eq!(truncate_output("short".into(), 10), "short");
    }
}
