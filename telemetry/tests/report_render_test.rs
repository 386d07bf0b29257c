//! HTML report rendering from persisted run directories

use run_telemetry::actors::trace_recorder::{EventDraft, TraceRecorder, TraceRecorderArguments};
use run_telemetry::report::{render_run_report, ReportError};
use serde_json::json;
use shared_types::{ArtifactKind, Level, RunId, TaskId};
use std::path::Path;

const PNG_BYTES: &[u8] = &[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x01, 0x02];

/// Writes a small run: one ok span, one failed span, one span left open,
/// a console line, a JSON and an image artifact.
async fn record_sample_run(run_dir: &Path) {
    let (recorder, handle) = TraceRecorder::spawn(TraceRecorderArguments {
        run_id: RunId::from("run-report"),
        run_dir: run_dir.to_path_buf(),
        min_level: Level::Debug,
        hub: None,
    })
    .await
    .unwrap();
    let main = TaskId::main();

    let open = recorder.begin(&main, "BROWSER", "Open <b>portal</b>").await;
    recorder
        .console(&main, "warn", "deprecated API <script>x()</script>")
        .await
        .unwrap();
    recorder
        .artifact(
            &main,
            EventDraft::new(Level::Info, "EXTRACT", "Captured fields").code("EXTRACTED"),
            ArtifactKind::Json,
            "application/json",
            Some("fields"),
            br#"{"email":"ada@example.test"}"#,
        )
        .await
        .unwrap();
    open.finish().await.unwrap();

    let submit = recorder.begin(&main, "FORMS", "Submit").await;
    recorder
        .artifact(
            &main,
            EventDraft::new(Level::Info, "BROWSER", "Screenshot"),
            ArtifactKind::Image,
            "image/png",
            Some("after-submit"),
            PNG_BYTES,
        )
        .await
        .unwrap();
    submit.fail("timeout waiting for #confirm").await.unwrap();

    let hanging = recorder.begin(&main, "FORMS", "Wait for confirmation").await;
    recorder
        .event(&main, Level::Info, "FORMS", "polling", json!({ "attempt": 1 }))
        .await
        .unwrap();
    std::mem::forget(hanging);

    recorder.stop();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_report_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    record_sample_run(dir.path()).await;

    let first = render_run_report(dir.path(), "Run report", true).await.unwrap();
    let second = render_run_report(dir.path(), "Run report", true).await.unwrap();
    assert_eq!(first, second);
    assert!(first.starts_with("<!DOCTYPE html>"));
}

#[tokio::test]
async fn test_span_states_depend_on_run_being_finished() {
    let dir = tempfile::tempdir().unwrap();
    record_sample_run(dir.path()).await;

    let live = render_run_report(dir.path(), "live", false).await.unwrap();
    assert!(live.contains("<span class=\"badge open\">open</span>"));
    assert!(!live.contains("<span class=\"badge abandoned\">"));

    let finished = render_run_report(dir.path(), "done", true).await.unwrap();
    assert!(finished.contains("<span class=\"badge abandoned\">abandoned</span>"));
    assert!(!finished.contains("<span class=\"badge open\">"));

    // Ok spans start collapsed; failed and abandoned ones start expanded.
    assert!(finished.contains("<details class=\"span state-ok\">"));
    assert!(finished.contains("<details class=\"span state-error\" open>"));
    assert!(finished.contains("<details class=\"span state-abandoned\" open>"));
    assert!(finished.contains("ACTION_FAILED"));
    assert!(finished.contains("timeout waiting for #confirm"));
}

#[tokio::test]
async fn test_artifacts_are_embedded() {
    let dir = tempfile::tempdir().unwrap();
    record_sample_run(dir.path()).await;

    let html = render_run_report(dir.path(), "artifacts", true).await.unwrap();
    assert!(html.contains("src=\"data:image/png;base64,iVBORw0KGgoBAg==\""));
    assert!(html.contains("<pre class=\"artifact json\" title=\"fields\">"));
    assert!(html.contains("\"email\": \"ada@example.test\""));
    assert!(!html.contains("unavailable"));
}

#[tokio::test]
async fn test_user_content_is_escaped() {
    let dir = tempfile::tempdir().unwrap();
    record_sample_run(dir.path()).await;

    let html = render_run_report(dir.path(), "<Run & Co>", true).await.unwrap();
    assert!(html.contains("<title>&lt;Run &amp; Co&gt;</title>"));
    assert!(html.contains("Open &lt;b&gt;portal&lt;/b&gt;"));
    assert!(html.contains("deprecated API &lt;script&gt;x()&lt;/script&gt;"));
    assert!(!html.contains("<script>"));
    assert!(!html.contains("<b>portal</b>"));
}

#[tokio::test]
async fn test_missing_artifact_shows_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    record_sample_run(dir.path()).await;

    let mut entries = tokio::fs::read_dir(dir.path().join("artifacts")).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        if entry.path().extension().and_then(|e| e.to_str()) == Some("img") {
            tokio::fs::remove_file(entry.path()).await.unwrap();
        }
    }

    let html = render_run_report(dir.path(), "missing", true).await.unwrap();
    assert!(html.contains("<div class=\"artifact missing\">Artifact after-submit"));
    assert!(!html.contains("data:image/png"));
}

#[tokio::test]
async fn test_missing_trace_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = render_run_report(dir.path(), "none", true).await.unwrap_err();
    assert!(matches!(err, ReportError::NotFound(_)));
}

#[tokio::test]
async fn test_torn_trace_renders_with_notice() {
    let dir = tempfile::tempdir().unwrap();
    record_sample_run(dir.path()).await;

    let path = run_telemetry::trace::trace_path(dir.path());
    let mut bytes = tokio::fs::read(&path).await.unwrap();
    bytes.extend_from_slice(b"{\"kind\":\"end\",\"seq");
    tokio::fs::write(&path, bytes).await.unwrap();

    let html = render_run_report(dir.path(), "torn", true).await.unwrap();
    assert!(html.contains("class=\"notice\""));
    assert!(html.contains("Submit"));
}
