use ractor::RpcReplyPort;
use serde_json::Value;
use shared_types::{ArtifactRef, Level, SpanId, SpanOutcome, TaskId};

use crate::trace::TraceError;

#[derive(Debug)]
pub enum TraceRecorderMsg {
    /// Open a span under the task's current innermost span
    BeginSpan {
        task_id: TaskId,
        category: String,
        label: String,
        reply: RpcReplyPort<Result<OpenedSpan, TraceError>>,
    },
    /// Close a span. Sent without a reply when a scope is dropped.
    EndSpan {
        span_id: SpanId,
        outcome: SpanOutcome,
        reply: Option<RpcReplyPort<Result<u64, TraceError>>>,
    },
    /// Record a leaf event; replies `None` when filtered by level
    RecordEvent {
        task_id: TaskId,
        draft: EventDraft,
        reply: Option<RpcReplyPort<Result<Option<u64>, TraceError>>>,
    },
    GetNextSequence {
        reply: RpcReplyPort<u64>,
    },
    /// Open span stack of a task, outermost first
    GetOpenSpans {
        task_id: TaskId,
        reply: RpcReplyPort<Vec<SpanId>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedSpan {
    pub span_id: SpanId,
    pub sequence_no: u64,
    pub parent_span_id: Option<SpanId>,
}

/// Event contents before the recorder assigns sequence and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub level: Level,
    pub category: String,
    pub code: Option<String>,
    pub message: String,
    pub data: Value,
    pub artifact_ref: Option<ArtifactRef>,
    /// Browser console line; fanned out as `console_log` instead of `run_event`
    pub console: bool,
}

impl EventDraft {
    pub fn new(level: Level, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            category: category.into(),
            code: None,
            message: message.into(),
            data: Value::Null,
            artifact_ref: None,
            console: false,
        }
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn artifact(mut self, artifact_ref: ArtifactRef) -> Self {
        self.artifact_ref = Some(artifact_ref);
        self
    }

    pub fn console(mut self) -> Self {
        self.console = true;
        self
    }
}
