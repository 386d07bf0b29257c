//! RunCoordinatorActor - single authority over one run's lifecycle state.
//!
//! Lifecycle signals (worker started/finished, executor termination,
//! supervision) and observer control commands are serialized through this
//! actor's mailbox. Each transition is mirrored on a watch channel for the
//! worker's safe points, published to the hub as `run_status` and recorded
//! in the trace.

mod messages;
mod safe_point;
mod state;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde_json::json;
use shared_types::{ControlCommand, Level, LiveMessage, ProcessedAck, RunId, RunState, TaskId};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use messages::{CoordinatorError, RunCoordinatorMsg, RunStatusSnapshot};
pub use safe_point::{Interrupted, SafePoint};
pub use state::{LifecycleEvent, RunStateMachine, Transition};

use crate::actors::trace_recorder::{EventDraft, TraceRecorder};
use crate::control::ControlChannel;
use crate::hub::Hub;

pub const COORDINATOR_TASK: &str = "coordinator";
pub const RUN_CATEGORY: &str = "RUN";
pub const CONTROL_CATEGORY: &str = "CONTROL";

#[derive(Debug, Default)]
pub struct RunCoordinatorActor;

#[derive(Debug)]
pub struct RunCoordinatorArguments {
    pub run_id: RunId,
    pub hub: Option<Hub>,
    pub recorder: Option<TraceRecorder>,
    pub state_tx: watch::Sender<RunState>,
}

pub struct RunCoordinatorState {
    run_id: RunId,
    machine: RunStateMachine,
    hub: Option<Hub>,
    recorder: Option<TraceRecorder>,
    state_tx: watch::Sender<RunState>,
}

#[async_trait]
impl Actor for RunCoordinatorActor {
    type Msg = RunCoordinatorMsg;
    type State = RunCoordinatorState;
    type Arguments = RunCoordinatorArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            run_id = %args.run_id,
            "RunCoordinatorActor starting"
        );

        let machine = RunStateMachine::new();
        args.state_tx.send_replace(machine.state());
        let state = RunCoordinatorState {
            run_id: args.run_id,
            machine,
            hub: args.hub,
            recorder: args.recorder,
            state_tx: args.state_tx,
        };
        publish_status(&state, None).await;
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            RunCoordinatorMsg::Lifecycle { event, reply } => {
                match state.machine.apply_lifecycle(&event) {
                    Some(transition) => {
                        tracing::info!(
                            actor_id = %myself.get_id(),
                            run_id = %state.run_id,
                            event = event.name(),
                            from = %transition.from,
                            to = %transition.to,
                            "Run state changed"
                        );
                        announce(state, &transition).await;
                    }
                    None => {
                        tracing::debug!(
                            run_id = %state.run_id,
                            event = event.name(),
                            current = %state.machine.state(),
                            "Lifecycle event does not change state"
                        );
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(state.machine.state());
                }
            }
            RunCoordinatorMsg::Control { command, reply } => {
                let ack = Self::handle_control(&myself, state, command).await;
                let _ = reply.send(ack);
            }
            RunCoordinatorMsg::GetStatus { reply } => {
                let _ = reply.send(RunStatusSnapshot {
                    run_id: state.run_id.clone(),
                    status: state.machine.state(),
                    started_at: state.machine.started_at(),
                    ended_at: state.machine.ended_at(),
                    message: state.machine.last_message().map(str::to_string),
                    transitions: state.machine.transitions().len(),
                });
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            run_id = %state.run_id,
            final_state = %state.machine.state(),
            "RunCoordinatorActor stopped"
        );
        Ok(())
    }
}

impl RunCoordinatorActor {
    async fn handle_control(
        myself: &ActorRef<RunCoordinatorMsg>,
        state: &mut RunCoordinatorState,
        command: ControlCommand,
    ) -> ProcessedAck {
        let from = state.machine.state();
        let (outcome, transition) = state.machine.apply_command(&command);

        tracing::info!(
            actor_id = %myself.get_id(),
            run_id = %state.run_id,
            command_id = %command.command_id,
            command = %command.command,
            ?outcome,
            from = %from,
            to = %state.machine.state(),
            "Control command processed"
        );

        if let Some(transition) = &transition {
            announce(state, transition).await;
        }

        if let Some(recorder) = &state.recorder {
            let draft = EventDraft::new(
                Level::Info,
                CONTROL_CATEGORY,
                format!("{} command {:?}", command.command, outcome),
            )
            .code(format!("CONTROL_{}", command.command.as_str().to_ascii_uppercase()))
            .data(json!({
                "command_id": command.command_id,
                "command": command.command,
                "outcome": outcome,
                "from": from,
                "to": state.machine.state(),
                "issued_at": command.issued_at,
            }));
            if let Err(e) = recorder.record(&TaskId::from(COORDINATOR_TASK), draft).await {
                tracing::warn!(run_id = %state.run_id, error = %e, "Control event not recorded");
            }
        }

        ProcessedAck::new(command.command_id, outcome)
    }
}

async fn announce(state: &RunCoordinatorState, transition: &Transition) {
    state.state_tx.send_replace(transition.to);
    publish_status(state, transition.message.clone()).await;

    if let Some(recorder) = &state.recorder {
        let level = match transition.to {
            RunState::Failed | RunState::Terminated => Level::Error,
            RunState::Cancelled => Level::Warn,
            _ => Level::Info,
        };
        let draft = EventDraft::new(
            level,
            RUN_CATEGORY,
            format!("Run {} -> {}", transition.from, transition.to),
        )
        .code(format!("RUN_{}", transition.to))
        .data(json!({
            "from": transition.from,
            "to": transition.to,
            "message": transition.message,
        }));
        if let Err(e) = recorder.record(&TaskId::from(COORDINATOR_TASK), draft).await {
            tracing::warn!(run_id = %state.run_id, error = %e, "Status change not recorded");
        }
    }
}

async fn publish_status(state: &RunCoordinatorState, message: Option<String>) {
    if let Some(hub) = &state.hub {
        let status = LiveMessage::RunStatus {
            status: state.machine.state(),
            message,
        };
        if let Err(e) = hub.publish(&state.run_id, status).await {
            tracing::warn!(run_id = %state.run_id, error = %e, "Run status not published");
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunCoordinator {
    actor: ActorRef<RunCoordinatorMsg>,
    run_id: RunId,
    state_rx: watch::Receiver<RunState>,
}

impl RunCoordinator {
    pub async fn spawn(
        run_id: RunId,
        hub: Option<Hub>,
        recorder: Option<TraceRecorder>,
    ) -> Result<(Self, JoinHandle<()>), CoordinatorError> {
        let (state_tx, state_rx) = watch::channel(RunState::Pending);
        let args = RunCoordinatorArguments {
            run_id: run_id.clone(),
            hub,
            recorder,
            state_tx,
        };
        let (actor, handle) = Actor::spawn(None, RunCoordinatorActor, args)
            .await
            .map_err(|e| CoordinatorError::Spawn(e.to_string()))?;
        Ok((
            Self {
                actor,
                run_id,
                state_rx,
            },
            handle,
        ))
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Latest state, without a mailbox round trip
    pub fn state(&self) -> RunState {
        *self.state_rx.borrow()
    }

    pub fn safe_point(&self, call_timeout: Duration) -> SafePoint {
        SafePoint::new(self.state_rx.clone(), call_timeout)
    }

    pub fn control_channel(&self) -> ControlChannel {
        ControlChannel::new(self.run_id.clone(), self.actor.clone())
    }

    pub async fn lifecycle(&self, event: LifecycleEvent) -> Result<RunState, CoordinatorError> {
        ractor::call!(self.actor, |reply| RunCoordinatorMsg::Lifecycle {
            event,
            reply: Some(reply),
        })
        .map_err(|e| CoordinatorError::Unavailable(e.to_string()))
    }

    pub async fn status(&self) -> Result<RunStatusSnapshot, CoordinatorError> {
        ractor::call!(self.actor, |reply| RunCoordinatorMsg::GetStatus { reply })
            .map_err(|e| CoordinatorError::Unavailable(e.to_string()))
    }

    /// Resolve once the run reaches a terminal state.
    pub async fn wait_terminal(&self) -> RunState {
        let mut rx = self.state_rx.clone();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() || rx.changed().await.is_err() {
                return state;
            }
        }
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }
}
