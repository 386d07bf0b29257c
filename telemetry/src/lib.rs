//! Run telemetry - trace recording, live observation and control of
//! automation runs.
//!
//! A run writes an append-only JSONL trace through its `TraceRecorder`,
//! streams live messages through the `Hub` to any number of observers, and
//! accepts pause/resume/stop commands through its `ControlChannel`. Traces
//! reconstruct into an `ActionTree` that renders to a self-contained HTML
//! report.

pub mod actors;
pub mod api;
pub mod config;
pub mod control;
pub mod demo;
pub mod hub;
pub mod registry;
pub mod report;
pub mod trace;

pub use actors::run_coordinator::{RunCoordinator, SafePoint};
pub use actors::trace_recorder::{SpanScope, TraceRecorder};
pub use config::TelemetryConfig;
pub use control::ControlChannel;
pub use hub::Hub;
pub use registry::{RunContext, RunRegistry};
pub use report::ReportRenderer;
pub use trace::ActionTree;
