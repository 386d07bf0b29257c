//! Control channel - observer commands into a run's coordinator.
//!
//! Delivery is two-phase. [`ControlChannel::submit`] returns once the
//! command is in the coordinator's mailbox (the "received" ack); the
//! [`ControlReceipt`] then resolves to the coordinator's [`ProcessedAck`]
//! after the command was applied, found to be a duplicate, or ignored.

use chrono::{DateTime, Utc};
use ractor::ActorRef;
use shared_types::{CommandId, ControlCommand, ProcessedAck, RunId};
use tokio::sync::oneshot;

use crate::actors::run_coordinator::RunCoordinatorMsg;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Command for run {actual} sent to run {expected}")]
    WrongRun { expected: RunId, actual: RunId },

    #[error("Run coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    #[error("Command {0} was dropped before it was processed")]
    AckDropped(CommandId),
}

#[derive(Debug, Clone)]
pub struct ControlChannel {
    run_id: RunId,
    coordinator: ActorRef<RunCoordinatorMsg>,
}

/// Proof that the coordinator accepted a command into its mailbox
#[derive(Debug)]
pub struct ControlReceipt {
    command_id: CommandId,
    received_at: DateTime<Utc>,
    processed: oneshot::Receiver<ProcessedAck>,
}

impl ControlReceipt {
    pub fn command_id(&self) -> &CommandId {
        &self.command_id
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Wait for the coordinator to process the command.
    pub async fn processed(self) -> Result<ProcessedAck, ControlError> {
        self.processed
            .await
            .map_err(|_| ControlError::AckDropped(self.command_id))
    }
}

impl ControlChannel {
    pub fn new(run_id: RunId, coordinator: ActorRef<RunCoordinatorMsg>) -> Self {
        Self {
            run_id,
            coordinator,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Hand a command to the coordinator without waiting for it to be applied.
    pub fn submit(&self, command: ControlCommand) -> Result<ControlReceipt, ControlError> {
        if command.run_id != self.run_id {
            return Err(ControlError::WrongRun {
                expected: self.run_id.clone(),
                actual: command.run_id,
            });
        }

        let command_id = command.command_id.clone();
        let action = command.command;
        let (tx, rx) = oneshot::channel();
        self.coordinator
            .cast(RunCoordinatorMsg::Control {
                command,
                reply: tx.into(),
            })
            .map_err(|e| ControlError::CoordinatorUnavailable(e.to_string()))?;

        tracing::info!(
            run_id = %self.run_id,
            command_id = %command_id,
            command = %action,
            "Control command received"
        );

        Ok(ControlReceipt {
            command_id,
            received_at: Utc::now(),
            processed: rx,
        })
    }

    /// Submit and wait for the processed-ack.
    pub async fn send(&self, command: ControlCommand) -> Result<ProcessedAck, ControlError> {
        self.submit(command)?.processed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::run_coordinator::{LifecycleEvent, RunCoordinator};
    use shared_types::{AckOutcome, ControlAction, RunState};

    #[tokio::test]
    async fn test_submit_then_processed() {
        let run_id = RunId::from("run-ctl");
        let (coordinator, _handle) = RunCoordinator::spawn(run_id.clone(), None, None)
            .await
            .unwrap();
        coordinator.lifecycle(LifecycleEvent::Started).await.unwrap();
        let channel = coordinator.control_channel();

        let receipt = channel
            .submit(ControlCommand::new(run_id.clone(), "stop-1", ControlAction::Stop))
            .unwrap();
        assert_eq!(receipt.command_id(), &CommandId::from("stop-1"));
        let ack = receipt.processed().await.unwrap();
        assert_eq!(ack.outcome, AckOutcome::Applied);
        assert_eq!(coordinator.state(), RunState::Cancelled);
    }

    #[tokio::test]
    async fn test_wrong_run_is_rejected() {
        let (coordinator, _handle) = RunCoordinator::spawn(RunId::from("a"), None, None)
            .await
            .unwrap();
        let err = coordinator
            .control_channel()
            .submit(ControlCommand::new(RunId::from("b"), "x", ControlAction::Pause))
            .unwrap_err();
        assert!(matches!(err, ControlError::WrongRun { .. }));
    }

    #[tokio::test]
    async fn test_stopped_coordinator_is_unavailable() {
        let run_id = RunId::from("gone");
        let (coordinator, handle) = RunCoordinator::spawn(run_id.clone(), None, None)
            .await
            .unwrap();
        coordinator.stop();
        handle.await.unwrap();

        let err = coordinator
            .control_channel()
            .submit(ControlCommand::new(run_id, "x", ControlAction::Stop))
            .unwrap_err();
        assert!(matches!(err, ControlError::CoordinatorUnavailable(_)));
    }
}
