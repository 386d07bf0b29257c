//! Shared types between the worker, the telemetry backend and observers
//!
//! These types are used by:
//! - the trace log (persisted JSON lines)
//! - the live channel (WebSocket frames fanned out by the hub)
//! - the control channel (observer -> worker commands and acknowledgements)
//!
//! Serializable with serde for JSON over WebSocket/HTTP and on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Identifiers
// ============================================================================

/// Identity of one automation run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Logical thread of execution inside a run (main flow, watchdog, ...)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn main() -> Self {
        Self("main".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SpanId(pub String);

impl SpanId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpanId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Observer-chosen identifier used to deduplicate control commands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CommandId(pub String);

impl CommandId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommandId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Levels, States, Outcomes
// ============================================================================

/// Event severity, ordered from most to least verbose
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }

    /// Map a browser console message type (`log`, `warn`, ...) to a level.
    pub fn from_console(kind: &str) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "warn" | "warning" => Level::Warn,
            "error" => Level::Error,
            "debug" => Level::Debug,
            "trace" => Level::Trace,
            _ => Level::Info,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Ok(Level::Trace),
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "ERROR" => Ok(Level::Error),
            other => Err(format!("unknown level: {other}")),
        }
    }
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    InProgress,
    Paused,
    Success,
    Failed,
    Cancelled,
    Terminated,
}

impl RunState {
    /// Terminal states are immutable once entered
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Success | RunState::Failed | RunState::Cancelled | RunState::Terminated
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::InProgress => "IN_PROGRESS",
            RunState::Paused => "PAUSED",
            RunState::Success => "SUCCESS",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
            RunState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpanOutcome {
    Ok,
    Error,
    Abandoned,
}

impl SpanOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanOutcome::Ok => "ok",
            SpanOutcome::Error => "error",
            SpanOutcome::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for SpanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Artifacts
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    Html,
    Json,
    Text,
}

impl ArtifactKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Image => "img",
            ArtifactKind::Html => "html",
            ArtifactKind::Json => "json",
            ArtifactKind::Text => "txt",
        }
    }
}

/// Pointer from an event to content held in the artifact store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    /// Lowercase hex SHA-256 of the content
    pub content_hash: String,
    pub kind: ArtifactKind,
    /// MIME type used when embedding (e.g. "image/png")
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ============================================================================
// Trace Records (persisted format)
// ============================================================================

/// Opens a span
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeginRecord {
    pub sequence_no: u64,
    pub run_id: RunId,
    pub task_id: TaskId,
    pub span_id: SpanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    pub category: String,
    pub label: String,
    pub ts: DateTime<Utc>,
}

/// Closes a span
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndRecord {
    pub sequence_no: u64,
    pub span_id: SpanId,
    pub outcome: SpanOutcome,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Leaf log entry; never changes nesting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub sequence_no: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub task_id: TaskId,
    pub level: Level,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<ArtifactRef>,
    pub ts: DateTime<Utc>,
}

/// One line of the append-only trace log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceRecord {
    Begin(BeginRecord),
    End(EndRecord),
    Event(EventRecord),
}

impl TraceRecord {
    pub fn sequence_no(&self) -> u64 {
        match self {
            TraceRecord::Begin(r) => r.sequence_no,
            TraceRecord::End(r) => r.sequence_no,
            TraceRecord::Event(r) => r.sequence_no,
        }
    }

    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            TraceRecord::Begin(r) => r.ts,
            TraceRecord::End(r) => r.ts,
            TraceRecord::Event(r) => r.ts,
        }
    }

    /// Task the record belongs to, when the record carries it
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            TraceRecord::Begin(r) => Some(&r.task_id),
            TraceRecord::End(r) => r.task_id.as_ref(),
            TraceRecord::Event(r) => Some(&r.task_id),
        }
    }
}

// ============================================================================
// Live Channel (hub -> observers)
// ============================================================================

/// Closed set of messages fanned out to observers of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    RunEvent {
        level: Level,
        category: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    RunStatus {
        status: RunState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ScreencastFrame {
        seq: u64,
        /// Base64-encoded image
        frame: String,
    },
    ConsoleLog {
        level: Level,
        message: String,
    },
}

impl LiveMessage {
    pub fn is_screencast(&self) -> bool {
        matches!(self, LiveMessage::ScreencastFrame { .. })
    }
}

// ============================================================================
// Control Channel (observers -> worker)
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Stop,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Stop => "stop",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlCommand {
    pub run_id: RunId,
    pub command_id: CommandId,
    pub command: ControlAction,
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
}

impl ControlCommand {
    pub fn new(run_id: RunId, command_id: impl Into<CommandId>, command: ControlAction) -> Self {
        Self {
            run_id,
            command_id: command_id.into(),
            command,
            issued_at: Utc::now(),
        }
    }
}

impl From<String> for CommandId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// What the coordinator did with a command
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    /// The command caused a state transition
    Applied,
    /// The command_id was seen before; nothing happened this time
    AlreadyApplied,
    /// Accepted but not valid in the current state (e.g. run already terminal)
    NoOp,
}

/// Sent to the issuing observer once the coordinator has processed a command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessedAck {
    pub command_id: CommandId,
    pub applied: bool,
    pub outcome: AckOutcome,
}

impl ProcessedAck {
    pub fn new(command_id: CommandId, outcome: AckOutcome) -> Self {
        Self {
            command_id,
            applied: outcome == AckOutcome::Applied,
            outcome,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
