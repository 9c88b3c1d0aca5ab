//! Bot manager - one supervised agent loop per configured bot.
//!
//! Each bot gets a supervisor task that subscribes it to the bus, runs its
//! loop inline and catches errors and panics at that boundary. A crashed
//! loop is restarted with fresh conversation state and a new subscription,
//! up to `max_restarts` times inside `restart_window`. Past that budget the
//! bot is marked failed and left alone; its siblings keep running.

use crate::error::{GatewayError, GatewayResult};
use chorusclaw_agent::{AgentError, AgentLoop, LoopDeps, LoopExit, LoopPhase, MessageBus};
use chorusclaw_core::{validate_identities, BotFailure, BotIdentity, FailureKind, SupervisorConfig};
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Supervisor-level state of one bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BotState {
    Starting,
    Running,
    Restarting,
    /// Stopped itself after a permanent model failure.
    Halted,
    /// Restart budget exhausted, or the bot could not be set up.
    Failed,
    Stopped,
}

impl std::fmt::Display for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Restarting => write!(f, "restarting"),
            Self::Halted => write!(f, "halted"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time view of one bot.
#[derive(Debug, Clone, Serialize)]
pub struct BotStatus {
    pub name: String,
    pub model: String,
    pub persona_preview: String,
    /// Masked; never the full credential.
    pub credential: String,
    pub state: BotState,
    pub phase: String,
    pub restarts: u32,
    pub dropped_events: u64,
    pub last_error: Option<String>,
}

struct BotSlot {
    identity: Arc<BotIdentity>,
    state: BotState,
    restarts: u32,
    last_error: Option<String>,
    phase: Arc<watch::Sender<LoopPhase>>,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

struct Shared {
    deps: LoopDeps,
    config: SupervisorConfig,
    slots: DashMap<String, BotSlot>,
    cancel: CancellationToken,
}

impl Shared {
    fn set_state(&self, name: &str, state: BotState) {
        if let Some(mut slot) = self.slots.get_mut(name) {
            slot.state = state;
        }
    }

    fn record_failure(&self, failure: &BotFailure, state: BotState, count_restart: bool) {
        if let Some(mut slot) = self.slots.get_mut(&failure.bot) {
            slot.state = state;
            slot.last_error = Some(failure.to_string());
            if count_restart {
                slot.restarts += 1;
            }
        }
    }

    /// Spawn a fresh supervisor for `name` under a new child token.
    fn launch(self: &Arc<Self>, name: &str) {
        let cancel = self.cancel.child_token();
        let (identity, phase) = match self.slots.get_mut(name) {
            Some(mut slot) => {
                slot.cancel = cancel.clone();
                slot.state = BotState::Starting;
                (slot.identity.clone(), slot.phase.clone())
            }
            None => return,
        };
        let handle = tokio::spawn(supervise(self.clone(), identity, phase, cancel));
        if let Some(mut slot) = self.slots.get_mut(name) {
            slot.supervisor = Some(handle);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

async fn supervise(
    shared: Arc<Shared>,
    identity: Arc<BotIdentity>,
    phase: Arc<watch::Sender<LoopPhase>>,
    cancel: CancellationToken,
) {
    let name = identity.name.clone();
    let mut crashes: VecDeque<Instant> = VecDeque::new();

    loop {
        if cancel.is_cancelled() {
            shared.set_state(&name, BotState::Stopped);
            return;
        }

        let mailbox = shared.deps.bus.subscribe(&name);
        let subscription = mailbox.id();
        shared.set_state(&name, BotState::Running);
        let agent = AgentLoop::with_phase_sender(identity.clone(), shared.deps.clone(), phase.clone());

        let outcome = AssertUnwindSafe(agent.run(mailbox, cancel.clone()))
            .catch_unwind()
            .await;
        shared.deps.bus.unsubscribe(subscription);

        let failure = match outcome {
            Ok(Ok(LoopExit::Stopped)) => {
                shared.set_state(&name, BotState::Stopped);
                return;
            }
            Ok(Ok(LoopExit::Halted)) => {
                warn!(bot = %name, "bot halted, waiting for a manual restart");
                shared.set_state(&name, BotState::Halted);
                return;
            }
            Ok(Err(AgentError::ProviderSetup(msg))) => {
                let failure = BotFailure::new(&name, FailureKind::Configuration, msg);
                error!(bot = %name, error = %failure, "bot cannot start");
                shared.record_failure(&failure, BotState::Failed, false);
                return;
            }
            Ok(Err(e)) => BotFailure::new(&name, FailureKind::LoopCrash, e.to_string()),
            Err(payload) => BotFailure::new(&name, FailureKind::LoopCrash, panic_message(&*payload)),
        };
        phase.send_replace(LoopPhase::Stopped);
        error!(bot = %name, error = %failure, "agent loop crashed");

        if cancel.is_cancelled() {
            shared.record_failure(&failure, BotState::Stopped, false);
            return;
        }

        let now = Instant::now();
        let window = shared.config.restart_window();
        while crashes
            .front()
            .is_some_and(|t| now.duration_since(*t) > window)
        {
            crashes.pop_front();
        }
        if crashes.len() as u32 >= shared.config.max_restarts {
            error!(
                bot = %name,
                restarts = crashes.len(),
                window_secs = window.as_secs(),
                "restart budget exhausted, bot failed"
            );
            shared.record_failure(&failure, BotState::Failed, false);
            return;
        }
        crashes.push_back(now);
        shared.record_failure(&failure, BotState::Restarting, true);

        let delay = shared.config.restart_delay();
        info!(bot = %name, attempt = crashes.len(), delay_ms = delay.as_millis() as u64, "restarting bot");
        tokio::select! {
            _ = cancel.cancelled() => {
                shared.set_state(&name, BotState::Stopped);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Validates bot definitions and starts their supervisors.
pub struct BotManager {
    deps: LoopDeps,
    config: SupervisorConfig,
}

impl BotManager {
    pub fn new(deps: LoopDeps, config: SupervisorConfig) -> Self {
        Self { deps, config }
    }

    /// Validate `identities` and start one supervised loop per bot.
    ///
    /// Nothing is spawned when validation fails. Must be called inside a
    /// tokio runtime.
    pub fn start(self, identities: Vec<BotIdentity>) -> GatewayResult<RunningGateway> {
        validate_identities(&identities)?;

        let shared = Arc::new(Shared {
            deps: self.deps,
            config: self.config,
            slots: DashMap::new(),
            cancel: CancellationToken::new(),
        });

        let names: Vec<String> = identities.iter().map(|i| i.name.clone()).collect();
        for identity in identities {
            let (phase, _) = watch::channel(LoopPhase::Idle);
            shared.slots.insert(
                identity.name.clone(),
                BotSlot {
                    identity: Arc::new(identity),
                    state: BotState::Starting,
                    restarts: 0,
                    last_error: None,
                    phase: Arc::new(phase),
                    cancel: CancellationToken::new(),
                    supervisor: None,
                },
            );
        }
        for name in &names {
            shared.launch(name);
        }
        info!(bots = ?names, "gateway started");

        Ok(RunningGateway { shared })
    }
}

/// Handle to a started set of bots.
pub struct RunningGateway {
    shared: Arc<Shared>,
}

impl RunningGateway {
    pub fn bus(&self) -> Arc<MessageBus> {
        self.shared.deps.bus.clone()
    }

    pub fn deps(&self) -> &LoopDeps {
        &self.shared.deps
    }

    /// Snapshot of every bot, by name.
    pub fn status(&self) -> Vec<BotStatus> {
        let bus = &self.shared.deps.bus;
        let mut list: Vec<BotStatus> = self
            .shared
            .slots
            .iter()
            .map(|slot| BotStatus {
                name: slot.identity.name.clone(),
                model: slot.identity.model.clone(),
                persona_preview: slot.identity.persona_preview(),
                credential: slot.identity.masked_credential(),
                state: slot.state,
                phase: slot.phase.borrow().to_string(),
                restarts: slot.restarts,
                dropped_events: bus.dropped_for(&slot.identity.name),
                last_error: slot.last_error.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn bot_state(&self, name: &str) -> Option<BotState> {
        self.shared.slots.get(name).map(|s| s.state)
    }

    /// Phase updates for `name`. The receiver stays valid across restarts.
    pub fn phase(&self, name: &str) -> Option<watch::Receiver<LoopPhase>> {
        self.shared.slots.get(name).map(|s| s.phase.subscribe())
    }

    /// Stop the bot if it is running and start it again with fresh state and
    /// a fresh restart budget. Clears `Halted` and `Failed`.
    pub async fn restart_bot(&self, name: &str) -> GatewayResult<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(GatewayError::ShuttingDown);
        }
        let (cancel, handle) = {
            let mut slot = self
                .shared
                .slots
                .get_mut(name)
                .ok_or_else(|| GatewayError::UnknownBot(name.to_string()))?;
            slot.restarts = 0;
            slot.last_error = None;
            (slot.cancel.clone(), slot.supervisor.take())
        };
        cancel.cancel();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(bot = %name, "manual restart");
        self.shared.launch(name);
        Ok(())
    }

    /// Cancel every loop and sub-task, wait up to the shutdown timeout, then
    /// abort whatever is still running.
    pub async fn stop(self) {
        let subtasks = &self.shared.deps.subtasks;
        info!(running_subtasks = subtasks.running_count(), "stopping gateway");
        self.shared.cancel.cancel();
        subtasks.shutdown();

        let handles: Vec<(String, JoinHandle<()>)> = self
            .shared
            .slots
            .iter_mut()
            .filter_map(|mut slot| {
                let name = slot.key().clone();
                slot.supervisor.take().map(|h| (name, h))
            })
            .collect();

        let deadline = Instant::now() + self.shared.config.shutdown_timeout();
        for (name, mut handle) in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(bot = %name, "bot did not stop in time, aborting");
                handle.abort();
            }
        }

        self.shared.deps.bus.close_all();
        for mut slot in self.shared.slots.iter_mut() {
            slot.state = BotState::Stopped;
        }
        info!("gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "panic with non-string payload");
    }

    #[test]
    fn state_serializes_kebab_case() {
        assert_eq!(serde_json::to_string(&BotState::Restarting).unwrap(), "\"restarting\"");
        assert_eq!(BotState::Halted.to_string(), "halted");
    }
}
