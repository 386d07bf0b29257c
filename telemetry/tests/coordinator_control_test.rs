//! Run lifecycle, control commands and worker supervision

use run_telemetry::actors::run_coordinator::Interrupted;
use run_telemetry::config::TelemetryConfig;
use run_telemetry::registry::{RegistryError, RunContext, RunRegistry, WorkerError, WorkerResult};
use run_telemetry::report::render_run_report;
use run_telemetry::trace::{read_trace, trace_path, ActionTree};
use shared_types::{AckOutcome, ControlAction, ControlCommand, RunId, RunState, TaskId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

fn test_registry(dir: &tempfile::TempDir) -> RunRegistry {
    RunRegistry::new(TelemetryConfig {
        data_dir: dir.path().to_path_buf(),
        ..TelemetryConfig::default()
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Counts steps between safe points, then blocks in a long external call.
async fn stepping_worker(
    ctx: RunContext,
    steps: Arc<AtomicU64>,
    guard_tx: oneshot::Sender<Result<(), Interrupted>>,
) -> WorkerResult {
    let mut safe_point = ctx.safe_point.clone();
    while steps.load(Ordering::SeqCst) < 5 {
        safe_point.checkpoint().await?;
        steps.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    // Only cancellation ends this call.
    let result = safe_point
        .guard(tokio::time::sleep(Duration::from_secs(3600)))
        .await;
    let _ = guard_tx.send(result);
    Err(WorkerError::Failed("guard returned".to_string()))
}

async fn polling_worker(ctx: RunContext) -> WorkerResult {
    let mut safe_point = ctx.safe_point.clone();
    loop {
        safe_point
            .guard(tokio::time::sleep(Duration::from_millis(20)))
            .await?;
    }
}

async fn terminating_worker(ctx: RunContext) -> WorkerResult {
    ctx.terminate("container OOM-killed")
        .await
        .map_err(|e| WorkerError::Failed(e.to_string()))?;
    let mut safe_point = ctx.safe_point.clone();
    safe_point.checkpoint().await?;
    Ok(None)
}

async fn panicking_worker(_ctx: RunContext) -> WorkerResult {
    panic!("browser process crashed");
}

/// Opens a span and dies without any chance to close it.
async fn crashing_mid_span_worker(ctx: RunContext) -> WorkerResult {
    let navigate = ctx
        .recorder
        .begin(&TaskId::main(), "BROWSER", "Navigate")
        .await;
    std::mem::forget(navigate);
    panic!("renderer gone");
}

#[tokio::test]
async fn test_pause_blocks_worker_until_resume_and_stop_cancels() {
    let dir = tempfile::tempdir().unwrap();
    let registry = test_registry(&dir);
    let steps = Arc::new(AtomicU64::new(0));
    let (guard_tx, guard_rx) = oneshot::channel::<Result<(), Interrupted>>();

    let worker_steps = steps.clone();
    let handle = registry
        .launch(RunId::from("run-pause"), move |ctx| {
            stepping_worker(ctx, worker_steps, guard_tx)
        })
        .await
        .unwrap();
    let control = handle.control.clone();
    let run_id = handle.run_id.clone();

    wait_until(|| steps.load(Ordering::SeqCst) >= 1).await;
    let ack = control
        .send(ControlCommand::new(run_id.clone(), "pause-1", ControlAction::Pause))
        .await
        .unwrap();
    assert!(ack.applied);
    assert_eq!(handle.coordinator.state(), RunState::Paused);

    // At most one in-flight step finishes after the pause lands.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let paused_at = steps.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(steps.load(Ordering::SeqCst), paused_at);
    assert!(paused_at < 5);

    let ack = control
        .send(ControlCommand::new(run_id.clone(), "resume-1", ControlAction::Resume))
        .await
        .unwrap();
    assert_eq!(ack.outcome, AckOutcome::Applied);
    wait_until(|| steps.load(Ordering::SeqCst) >= 5).await;

    let ack = control
        .send(ControlCommand::new(run_id.clone(), "stop-1", ControlAction::Stop))
        .await
        .unwrap();
    assert!(ack.applied);

    let guard_result = timeout(Duration::from_secs(2), guard_rx)
        .await
        .expect("guard was not interrupted")
        .unwrap();
    assert_eq!(guard_result, Err(Interrupted::Cancelled));

    assert_eq!(handle.coordinator.wait_terminal().await, RunState::Cancelled);
    // The worker's own failure after a stop cannot overwrite the terminal state.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = handle.coordinator.status().await.unwrap();
    assert_eq!(snapshot.status, RunState::Cancelled);

    let log = read_trace(&trace_path(&handle.run_dir)).await.unwrap();
    let tree = ActionTree::reconstruct(log.records);
    let codes: Vec<String> = tree.code_summary().into_iter().map(|c| c.code).collect();
    for code in [
        "RUN_IN_PROGRESS",
        "RUN_PAUSED",
        "RUN_CANCELLED",
        "CONTROL_PAUSE",
        "CONTROL_RESUME",
        "CONTROL_STOP",
    ] {
        assert!(codes.iter().any(|c| c == code), "missing {code} in {codes:?}");
    }
}

#[tokio::test]
async fn test_duplicate_stop_is_acknowledged_once() {
    let dir = tempfile::tempdir().unwrap();
    let registry = test_registry(&dir);
    let handle = registry
        .launch(RunId::from("run-dup"), polling_worker)
        .await
        .unwrap();

    let stop = ControlCommand::new(handle.run_id.clone(), "stop-twice", ControlAction::Stop);
    let first = handle.control.send(stop.clone()).await.unwrap();
    let second = handle.control.send(stop).await.unwrap();

    assert_eq!(first.outcome, AckOutcome::Applied);
    assert!(first.applied);
    assert_eq!(second.outcome, AckOutcome::AlreadyApplied);
    assert!(!second.applied);
    assert_eq!(handle.coordinator.wait_terminal().await, RunState::Cancelled);

    // Started, then one cancel; the duplicate adds nothing.
    let snapshot = handle.coordinator.status().await.unwrap();
    assert_eq!(snapshot.transitions, 2);
}

#[tokio::test]
async fn test_commands_after_terminal_are_no_ops() {
    let dir = tempfile::tempdir().unwrap();
    let registry = test_registry(&dir);
    let handle = registry
        .launch(RunId::from("run-done"), |_ctx: RunContext| async move {
            Ok::<_, WorkerError>(Some("all fields filled".to_string()))
        })
        .await
        .unwrap();

    assert_eq!(handle.coordinator.wait_terminal().await, RunState::Success);

    for (id, action) in [
        ("late-pause", ControlAction::Pause),
        ("late-resume", ControlAction::Resume),
        ("late-stop", ControlAction::Stop),
    ] {
        let ack = handle
            .control
            .send(ControlCommand::new(handle.run_id.clone(), id, action))
            .await
            .unwrap();
        assert_eq!(ack.outcome, AckOutcome::NoOp, "{action} should be a no-op");
    }

    let snapshot = handle.coordinator.status().await.unwrap();
    assert_eq!(snapshot.status, RunState::Success);
    assert_eq!(snapshot.message.as_deref(), Some("all fields filled"));
    assert!(snapshot.ended_at.is_some());
}

#[tokio::test]
async fn test_command_for_other_run_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let registry = test_registry(&dir);
    let handle = registry.create_run(RunId::from("run-a")).await.unwrap();

    let err = handle
        .control
        .submit(ControlCommand::new(RunId::from("run-b"), "c-1", ControlAction::Stop))
        .unwrap_err();
    assert!(err.to_string().contains("run-b"));
    assert_eq!(handle.coordinator.state(), RunState::Pending);
}

#[tokio::test]
async fn test_worker_error_fails_run() {
    let dir = tempfile::tempdir().unwrap();
    let registry = test_registry(&dir);
    let handle = registry
        .launch(RunId::from("run-fail"), |_ctx: RunContext| async move {
            Err::<Option<String>, _>(WorkerError::Failed(
                "captcha blocked submission".to_string(),
            ))
        })
        .await
        .unwrap();

    assert_eq!(handle.coordinator.wait_terminal().await, RunState::Failed);
    let snapshot = handle.coordinator.status().await.unwrap();
    assert!(snapshot
        .message
        .unwrap_or_default()
        .contains("captcha blocked submission"));
}

#[tokio::test]
async fn test_worker_panic_terminates_run() {
    let dir = tempfile::tempdir().unwrap();
    let registry = test_registry(&dir);
    let handle = registry
        .launch(RunId::from("run-panic"), panicking_worker)
        .await
        .unwrap();

    assert_eq!(handle.coordinator.wait_terminal().await, RunState::Terminated);
    let snapshot = handle.coordinator.status().await.unwrap();
    assert!(snapshot
        .message
        .unwrap_or_default()
        .contains("browser process crashed"));
}

#[tokio::test]
async fn test_crash_mid_span_leaves_abandoned_span() {
    let dir = tempfile::tempdir().unwrap();
    let registry = test_registry(&dir);
    let handle = registry
        .launch(RunId::from("run-crash"), crashing_mid_span_worker)
        .await
        .unwrap();

    assert_eq!(handle.coordinator.wait_terminal().await, RunState::Terminated);

    let log = read_trace(&trace_path(&handle.run_dir)).await.unwrap();
    let mut tree = ActionTree::reconstruct(log.records);
    let navigate = tree.find_span("Navigate").unwrap();
    assert!(navigate.end.is_none());
    assert_eq!(tree.mark_abandoned(), 1);

    let html = render_run_report(&handle.run_dir, "crash", true).await.unwrap();
    assert!(html.contains("<span class=\"badge abandoned\">abandoned</span>"));
    assert!(html.contains("Navigate"));
}

#[tokio::test]
async fn test_external_termination_reported_by_worker() {
    let dir = tempfile::tempdir().unwrap();
    let registry = test_registry(&dir);
    let handle = registry
        .launch(RunId::from("run-oom"), terminating_worker)
        .await
        .unwrap();

    assert_eq!(handle.coordinator.wait_terminal().await, RunState::Terminated);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = handle.coordinator.status().await.unwrap();
    assert_eq!(snapshot.status, RunState::Terminated);
    assert_eq!(snapshot.message.as_deref(), Some("container OOM-killed"));
}

#[tokio::test]
async fn test_duplicate_run_id_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let registry = test_registry(&dir);
    registry.create_run(RunId::from("run-x")).await.unwrap();
    assert!(registry.create_run(RunId::from("run-x")).await.is_err());
    assert!(registry.create_run(RunId::from("../escape")).await.is_err());
    assert_eq!(registry.run_ids(), vec![RunId::from("run-x")]);
    registry.shutdown().await;
    assert!(registry.run_ids().is_empty());
}

#[tokio::test]
async fn test_shutdown_terminates_running_runs() {
    let dir = tempfile::tempdir().unwrap();
    let registry = test_registry(&dir);
    let handle = registry
        .launch(RunId::from("run-shutdown"), polling_worker)
        .await
        .unwrap();
    wait_until(|| handle.coordinator.state() == RunState::InProgress).await;

    timeout(Duration::from_secs(10), registry.shutdown())
        .await
        .expect("shutdown hung");

    assert_eq!(handle.coordinator.state(), RunState::Terminated);
    assert!(registry.run_ids().is_empty());
    assert!(!registry.hub().has_room(&handle.run_id));

    let log = read_trace(&trace_path(&handle.run_dir)).await.unwrap();
    let tree = ActionTree::reconstruct(log.records);
    let summary = tree.code_summary();
    assert!(summary.iter().any(|c| c.code == "RUN_TERMINATED"), "codes: {summary:?}");
    let terminal_records: usize = summary
        .iter()
        .filter(|c| {
            ["RUN_SUCCESS", "RUN_FAILED", "RUN_CANCELLED", "RUN_TERMINATED"].contains(&c.code.as_str())
        })
        .map(|c| c.count)
        .sum();
    assert_eq!(terminal_records, 1);
}

#[tokio::test]
async fn test_failed_run_creation_releases_room() {
    // A regular file where the data directory should be.
    let data_file = tempfile::NamedTempFile::new().unwrap();
    let registry = RunRegistry::new(TelemetryConfig {
        data_dir: data_file.path().to_path_buf(),
        ..TelemetryConfig::default()
    });
    let run_id = RunId::from("run-nodir");

    let err = registry.create_run(run_id.clone()).await.unwrap_err();
    assert!(matches!(err, RegistryError::Trace(_)), "unexpected error: {err}");
    assert!(!registry.hub().has_room(&run_id));
    assert!(registry.run_ids().is_empty());
}
