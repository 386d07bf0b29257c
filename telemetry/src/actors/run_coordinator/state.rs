//! Pure run lifecycle state machine, kept free of I/O so every transition
//! can be unit tested.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{AckOutcome, CommandId, ControlAction, ControlCommand, RunState};
use std::collections::HashMap;

/// Lifecycle signals raised by the worker, the executor or supervision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Started,
    Completed { summary: Option<String> },
    Failed { error: String },
    /// The execution environment ended the run (browser closed, host shutdown)
    ExternalTermination { reason: String },
    /// The worker task died without reporting an outcome
    WorkerLost { reason: String },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Started => "started",
            LifecycleEvent::Completed { .. } => "completed",
            LifecycleEvent::Failed { .. } => "failed",
            LifecycleEvent::ExternalTermination { .. } => "external_termination",
            LifecycleEvent::WorkerLost { .. } => "worker_lost",
        }
    }

    fn target(&self) -> RunState {
        match self {
            LifecycleEvent::Started => RunState::InProgress,
            LifecycleEvent::Completed { .. } => RunState::Success,
            LifecycleEvent::Failed { .. } => RunState::Failed,
            LifecycleEvent::ExternalTermination { .. } | LifecycleEvent::WorkerLost { .. } => {
                RunState::Terminated
            }
        }
    }

    fn message(&self) -> Option<String> {
        match self {
            LifecycleEvent::Started => None,
            LifecycleEvent::Completed { summary } => summary.clone(),
            LifecycleEvent::Failed { error } => Some(error.clone()),
            LifecycleEvent::ExternalTermination { reason }
            | LifecycleEvent::WorkerLost { reason } => Some(reason.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunStateMachine {
    state: RunState,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    last_message: Option<String>,
    seen_commands: HashMap<CommandId, AckOutcome>,
    transitions: Vec<Transition>,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            state: RunState::Pending,
            started_at: None,
            ended_at: None,
            last_message: None,
            seen_commands: HashMap::new(),
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn last_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    fn transition(&mut self, to: RunState, message: Option<String>) -> Transition {
        let at = Utc::now();
        let transition = Transition {
            from: self.state,
            to,
            message: message.clone(),
            at,
        };
        if to == RunState::InProgress && self.started_at.is_none() {
            self.started_at = Some(at);
        }
        if to.is_terminal() {
            self.ended_at = Some(at);
        }
        self.state = to;
        self.last_message = message;
        self.transitions.push(transition.clone());
        transition
    }

    /// Apply a lifecycle signal. Returns `None` when it does not change the
    /// state (e.g. the run is already terminal).
    pub fn apply_lifecycle(&mut self, event: &LifecycleEvent) -> Option<Transition> {
        if self.state.is_terminal() {
            return None;
        }
        match event {
            LifecycleEvent::Started if self.state != RunState::Pending => None,
            _ => Some(self.transition(event.target(), event.message())),
        }
    }

    /// Apply a control command exactly once per `command_id`.
    pub fn apply_command(&mut self, command: &ControlCommand) -> (AckOutcome, Option<Transition>) {
        if self.seen_commands.contains_key(&command.command_id) {
            return (AckOutcome::AlreadyApplied, None);
        }

        let target = match (command.command, self.state) {
            (_, state) if state.is_terminal() => None,
            (ControlAction::Pause, RunState::InProgress) => Some(RunState::Paused),
            (ControlAction::Resume, RunState::Paused) => Some(RunState::InProgress),
            (ControlAction::Stop, _) => Some(RunState::Cancelled),
            _ => None,
        };

        let result = match target {
            Some(to) => {
                let message = format!("{} requested by observer", command.command);
                (AckOutcome::Applied, Some(self.transition(to, Some(message))))
            }
            None => (AckOutcome::NoOp, None),
        };
        self.seen_commands
            .insert(command.command_id.clone(), result.0);
        result
    }
}
