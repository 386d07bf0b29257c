//! Run registry - owns the per-run actors and the hub.
//!
//! `launch` wires a run together (room, recorder, coordinator, control
//! channel), starts the worker and supervises it: the worker's own result
//! decides SUCCESS/FAILED, and a worker that panics or vanishes is
//! reported as lost, which terminates the run.

use base64::Engine;
use dashmap::DashMap;
use shared_types::{RunId, RunState};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinError, JoinHandle};

use crate::actors::run_coordinator::{
    CoordinatorError, Interrupted, LifecycleEvent, RunCoordinator, SafePoint,
};
use crate::actors::trace_recorder::{TraceRecorder, TraceRecorderArguments};
use crate::config::TelemetryConfig;
use crate::control::ControlChannel;
use crate::hub::Hub;
use crate::trace::TraceError;

const MAX_RUN_ID_LEN: usize = 128;
const SHUTDOWN_REASON: &str = "telemetry service shutting down";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// What a worker returns: an optional completion summary
pub type WorkerResult = Result<Option<String>, WorkerError>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum RegistryError {
    #[error("Run {0} already exists")]
    AlreadyExists(RunId),

    #[error("Invalid run id: {0:?}")]
    InvalidRunId(String),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Run ids become directory names; keep them to a safe alphabet.
pub fn is_valid_run_id(run_id: &str) -> bool {
    !run_id.is_empty()
        && run_id.len() <= MAX_RUN_ID_LEN
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: RunId,
    pub run_dir: PathBuf,
    pub recorder: TraceRecorder,
    pub coordinator: RunCoordinator,
    pub control: ControlChannel,
}

/// Everything a worker needs to report into its run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub recorder: TraceRecorder,
    pub coordinator: RunCoordinator,
    pub safe_point: SafePoint,
    hub: Hub,
}

impl RunContext {
    /// Publish a screencast frame (raw image bytes); frames are never traced.
    pub fn publish_frame(&self, image: &[u8]) -> Option<u64> {
        let frame = base64::engine::general_purpose::STANDARD.encode(image);
        match self.hub.publish_frame(&self.run_id, frame) {
            Ok(seq) => Some(seq),
            Err(e) => {
                tracing::debug!(run_id = %self.run_id, error = %e, "Frame not published");
                None
            }
        }
    }

    /// Report that the execution environment ended the run.
    pub async fn terminate(&self, reason: impl Into<String>) -> Result<RunState, CoordinatorError> {
        self.coordinator
            .lifecycle(LifecycleEvent::ExternalTermination {
                reason: reason.into(),
            })
            .await
    }
}

/// Tasks driving a launched run
struct RunTasks {
    worker: AbortHandle,
    supervisor: JoinHandle<()>,
}

struct RegistryInner {
    config: TelemetryConfig,
    hub: Hub,
    runs: DashMap<RunId, RunHandle>,
    tasks: DashMap<RunId, RunTasks>,
}

#[derive(Clone)]
pub struct RunRegistry {
    inner: Arc<RegistryInner>,
}

impl RunRegistry {
    pub fn new(config: TelemetryConfig) -> Self {
        let hub = Hub::new(config.hub.clone());
        Self {
            inner: Arc::new(RegistryInner {
                config,
                hub,
                runs: DashMap::new(),
                tasks: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.inner.config
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.inner.config.run_dir(run_id)
    }

    pub fn get(&self, run_id: &RunId) -> Option<RunHandle> {
        self.inner.runs.get(run_id).map(|entry| entry.value().clone())
    }

    pub fn run_ids(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.inner.runs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Create the room, recorder and coordinator for a new run.
    pub async fn create_run(&self, run_id: RunId) -> Result<RunHandle, RegistryError> {
        if !is_valid_run_id(run_id.as_str()) {
            return Err(RegistryError::InvalidRunId(run_id.0));
        }
        if self.inner.runs.contains_key(&run_id) {
            return Err(RegistryError::AlreadyExists(run_id));
        }

        let hub = self.inner.hub.clone();
        let run_dir = self.run_dir(&run_id);
        hub.open_room(&run_id);

        let (recorder, coordinator) = match self.spawn_actors(&run_id, &run_dir).await {
            Ok(actors) => actors,
            Err(e) => {
                // A concurrent create for the same id may own the room by now.
                if !self.inner.runs.contains_key(&run_id) {
                    hub.close_room(&run_id);
                }
                tracing::warn!(run_id = %run_id, error = %e, "Run could not be created");
                return Err(e);
            }
        };

        let handle = RunHandle {
            run_id: run_id.clone(),
            run_dir,
            control: coordinator.control_channel(),
            recorder,
            coordinator,
        };

        match self.inner.runs.entry(run_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                handle.recorder.stop();
                handle.coordinator.stop();
                Err(RegistryError::AlreadyExists(run_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle.clone());
                tracing::info!(run_id = %run_id, run_dir = %handle.run_dir.display(), "Run registered");
                Ok(handle)
            }
        }
    }

    async fn spawn_actors(
        &self,
        run_id: &RunId,
        run_dir: &std::path::Path,
    ) -> Result<(TraceRecorder, RunCoordinator), RegistryError> {
        let hub = self.inner.hub.clone();
        let (recorder, _) = TraceRecorder::spawn(TraceRecorderArguments {
            run_id: run_id.clone(),
            run_dir: run_dir.to_path_buf(),
            min_level: self.inner.config.min_level,
            hub: Some(hub.clone()),
        })
        .await?;

        match RunCoordinator::spawn(run_id.clone(), Some(hub), Some(recorder.clone())).await {
            Ok((coordinator, _)) => Ok((recorder, coordinator)),
            Err(e) => {
                recorder.stop();
                Err(e.into())
            }
        }
    }

    /// Create a run, mark it started and execute `worker` under supervision.
    pub async fn launch<F, Fut>(&self, run_id: RunId, worker: F) -> Result<RunHandle, RegistryError>
    where
        F: FnOnce(RunContext) -> Fut + Send + 'static,
        Fut: Future<Output = WorkerResult> + Send + 'static,
    {
        let handle = self.create_run(run_id).await?;
        handle.coordinator.lifecycle(LifecycleEvent::Started).await?;

        let ctx = RunContext {
            run_id: handle.run_id.clone(),
            recorder: handle.recorder.clone(),
            coordinator: handle.coordinator.clone(),
            safe_point: handle
                .coordinator
                .safe_point(self.inner.config.external_call_timeout),
            hub: self.inner.hub.clone(),
        };

        let worker_task = tokio::spawn(worker(ctx));
        let tasks = RunTasks {
            worker: worker_task.abort_handle(),
            supervisor: tokio::spawn(supervise(handle.clone(), worker_task)),
        };
        self.inner.tasks.insert(handle.run_id.clone(), tasks);
        Ok(handle)
    }

    /// Drop runs that have been terminal for longer than the retention window.
    pub fn prune_expired(&self) -> Vec<RunId> {
        let pruned = self.inner.hub.prune(self.inner.config.retention);
        for run_id in &pruned {
            self.inner.tasks.remove(run_id);
            if let Some((_, handle)) = self.inner.runs.remove(run_id) {
                handle.recorder.stop();
                handle.coordinator.stop();
                tracing::info!(run_id = %run_id, "Run pruned");
            }
        }
        pruned
    }

    pub fn spawn_pruner(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.inner.config.prune_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                registry.prune_expired();
            }
        })
    }

    /// Terminate every unfinished run, then stop all actors and close all rooms.
    ///
    /// Each run reaches a terminal status in its trace before its actors go
    /// away; workers still running are aborted.
    pub async fn shutdown(&self) {
        let run_ids = self.run_ids();
        for run_id in &run_ids {
            let Some((_, handle)) = self.inner.runs.remove(run_id) else {
                continue;
            };
            let tasks = self.inner.tasks.remove(run_id).map(|(_, tasks)| tasks);
            settle_for_shutdown(&handle, tasks).await;
            handle.recorder.stop();
            handle.coordinator.stop();
            self.inner.hub.close_room(run_id);
        }
        tracing::info!(runs = run_ids.len(), "Run registry shut down");
    }
}

async fn settle_for_shutdown(handle: &RunHandle, tasks: Option<RunTasks>) {
    if !handle.coordinator.state().is_terminal() {
        let event = LifecycleEvent::ExternalTermination {
            reason: SHUTDOWN_REASON.to_string(),
        };
        if let Err(e) = handle.coordinator.lifecycle(event).await {
            tracing::error!(run_id = %handle.run_id, error = %e, "Could not terminate run on shutdown");
        } else if tokio::time::timeout(SHUTDOWN_GRACE, handle.coordinator.wait_terminal())
            .await
            .is_err()
        {
            tracing::warn!(run_id = %handle.run_id, "Run not terminal after shutdown grace");
        }
    }

    if let Some(tasks) = tasks {
        tasks.worker.abort();
        if tokio::time::timeout(SHUTDOWN_GRACE, tasks.supervisor).await.is_err() {
            tracing::warn!(run_id = %handle.run_id, "Supervisor did not finish on shutdown");
        }
    }

    // Span ends queued by the aborted worker land before the recorder stops.
    if let Err(e) = handle.recorder.next_sequence().await {
        tracing::warn!(run_id = %handle.run_id, error = %e, "Recorder not flushed on shutdown");
    }
    tracing::info!(run_id = %handle.run_id, state = %handle.coordinator.state(), "Run shut down");
}

async fn supervise(handle: RunHandle, worker: JoinHandle<WorkerResult>) {
    let event = match worker.await {
        Ok(Ok(summary)) => LifecycleEvent::Completed { summary },
        Ok(Err(e)) => LifecycleEvent::Failed {
            error: e.to_string(),
        },
        Err(join_error) => LifecycleEvent::WorkerLost {
            reason: describe_join_error(join_error),
        },
    };

    tracing::info!(
        run_id = %handle.run_id,
        event = event.name(),
        current = %handle.coordinator.state(),
        "Worker finished"
    );

    match handle.coordinator.lifecycle(event).await {
        Ok(state) => {
            tracing::info!(run_id = %handle.run_id, final_state = %state, "Run settled");
        }
        Err(e) => {
            tracing::error!(run_id = %handle.run_id, error = %e, "Could not settle run state");
        }
    }
}

fn describe_join_error(error: JoinError) -> String {
    if error.is_cancelled() {
        return "worker task was cancelled".to_string();
    }
    match error.try_into_panic() {
        Ok(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            format!("worker panicked: {message}")
        }
        Err(other) => format!("worker task failed: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_validation() {
        assert!(is_valid_run_id("01HZY3Q9V0-abc_1"));
        assert!(!is_valid_run_id(""));
        assert!(!is_valid_run_id("../etc"));
        assert!(!is_valid_run_id("a/b"));
        assert!(!is_valid_run_id(&"x".repeat(MAX_RUN_ID_LEN + 1)));
    }
}
