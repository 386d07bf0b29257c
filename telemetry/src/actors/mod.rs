//! Per-run actors.
//!
//! Each run owns one `TraceRecorderActor` (sole writer of the run's trace)
//! and one `RunCoordinatorActor` (sole owner of the run's state).

pub mod run_coordinator;
pub mod trace_recorder;

pub use run_coordinator::{RunCoordinator, RunCoordinatorActor, RunCoordinatorMsg};
pub use trace_recorder::{TraceRecorder, TraceRecorderActor, TraceRecorderMsg};
