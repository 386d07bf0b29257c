use chrono::{DateTime, Utc};
use ractor::RpcReplyPort;
use serde::{Deserialize, Serialize};
use shared_types::{ControlCommand, ProcessedAck, RunId, RunState};

use super::state::LifecycleEvent;

#[derive(Debug)]
pub enum RunCoordinatorMsg {
    Lifecycle {
        event: LifecycleEvent,
        reply: Option<RpcReplyPort<RunState>>,
    },
    /// Cast by the control channel; the reply is the processed-ack
    Control {
        command: ControlCommand,
        reply: RpcReplyPort<ProcessedAck>,
    },
    GetStatus {
        reply: RpcReplyPort<RunStatusSnapshot>,
    },
}

/// Point-in-time view of a run, served by the status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatusSnapshot {
    pub run_id: RunId,
    pub status: RunState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub transitions: usize,
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum CoordinatorError {
    #[error("Run coordinator unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to spawn run coordinator: {0}")]
    Spawn(String),
}
