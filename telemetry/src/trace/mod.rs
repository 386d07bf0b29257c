//! Trace persistence and reconstruction.
//!
//! - `log`: append-only JSON-lines trace file (writer + tolerant reader)
//! - `tree`: rebuilds the nested action tree from trace records
//! - `artifacts`: content-addressed store for screenshots, HTML and JSON blobs

pub mod artifacts;
pub mod log;
pub mod tree;

pub use artifacts::{Artifact, ArtifactContent, ArtifactError, ArtifactSet, ArtifactStore};
pub use log::{parse_trace, read_trace, trace_path, TraceLog, TraceLogWriter, TRACE_FILE_NAME};
pub use tree::{ActionTree, CodeCount, Node, SpanNode, SpanState, MAX_SPAN_DEPTH};

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while recording or reading a trace
#[derive(Debug, thiserror::Error, Clone)]
pub enum TraceError {
    #[error("Trace I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Trace log is poisoned after a failed rollback: {0}")]
    Poisoned(String),

    #[error("Unknown span: {0}")]
    UnknownSpan(String),

    #[error("Trace recorder unavailable: {0}")]
    RecorderUnavailable(String),

    #[error("Artifact error: {0}")]
    Artifact(String),
}

impl From<std::io::Error> for TraceError {
    fn from(e: std::io::Error) -> Self {
        TraceError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for TraceError {
    fn from(e: serde_json::Error) -> Self {
        TraceError::Serialization(e.to_string())
    }
}

impl From<ArtifactError> for TraceError {
    fn from(e: ArtifactError) -> Self {
        TraceError::Artifact(e.to_string())
    }
}
