//! Scripted demo run.
//!
//! Walks a fake form-filling session through the same calls a browser
//! worker makes: nested spans, console lines, screencast frames from a side
//! task, a JSON artifact, and safe points so observers can pause and stop it.

use serde_json::json;
use shared_types::{ArtifactKind, Level, RunState, TaskId};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::actors::trace_recorder::EventDraft;
use crate::registry::{RunContext, WorkerError, WorkerResult};

/// 1x1 transparent PNG used as the demo screencast frame
const DEMO_FRAME: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15, 0xc4,
    0x89, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae,
    0x42, 0x60, 0x82,
];

const FIELDS: &[(&str, &str)] = &[
    ("first_name", "Ada"),
    ("last_name", "Lovelace"),
    ("email", "ada@example.test"),
];

#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Pause between simulated actions
    pub step_delay: Duration,
    pub frame_interval: Duration,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(750),
            frame_interval: Duration::from_millis(250),
        }
    }
}

pub async fn scripted_run(ctx: RunContext, options: DemoOptions) -> WorkerResult {
    let main = TaskId::main();
    let recorder = ctx.recorder.clone();
    let mut safe_point = ctx.safe_point.clone();

    let screencast = Screencast::start(ctx.clone(), options.frame_interval);

    let result = recorder
        .in_span(&main, "BROWSER", "Open application form", async {
            safe_point
                .guard(tokio::time::sleep(options.step_delay))
                .await?;
            recorder
                .event(
                    &main,
                    Level::Info,
                    "BROWSER",
                    "Navigated to form",
                    json!({ "url": "https://jobs.example.test/apply" }),
                )
                .await?;
            recorder
                .console(&main, "log", "form.js loaded in 42ms")
                .await?;
            Ok::<_, WorkerError>(())
        })
        .await;
    if let Err(e) = result {
        screencast.finish().await;
        return Err(e);
    }

    let filled = recorder
        .in_span(&main, "FORMS", "Fill applicant fields", async {
            for (field, value) in FIELDS {
                safe_point.checkpoint().await?;
                recorder
                    .in_span(&main, "FIND_APPLY", &format!("Fill {field}"), async {
                        safe_point
                            .guard(tokio::time::sleep(options.step_delay))
                            .await?;
                        recorder
                            .record(
                                &main,
                                EventDraft::new(Level::Info, "FORMS", format!("Typed into {field}"))
                                    .code("FIELD_FILLED")
                                    .data(json!({ "field": field, "length": value.len() })),
                            )
                            .await?;
                        Ok::<_, WorkerError>(())
                    })
                    .await?;
            }
            recorder
                .console(&main, "warn", "autocomplete attribute missing on #email")
                .await?;
            Ok::<_, WorkerError>(())
        })
        .await;
    if let Err(e) = filled {
        screencast.finish().await;
        return Err(e);
    }

    let extracted = json!(FIELDS
        .iter()
        .map(|(field, value)| (field.to_string(), json!(value)))
        .collect::<serde_json::Map<String, serde_json::Value>>());
    let payload = serde_json::to_vec_pretty(&extracted)
        .map_err(|e| WorkerError::Failed(e.to_string()))?;
    recorder
        .artifact(
            &main,
            EventDraft::new(Level::Info, "EXTRACT", "Captured submitted values").code("EXTRACTED"),
            ArtifactKind::Json,
            "application/json",
            Some("submitted-values"),
            &payload,
        )
        .await?;
    recorder
        .artifact(
            &main,
            EventDraft::new(Level::Info, "BROWSER", "Final screenshot"),
            ArtifactKind::Image,
            "image/png",
            Some("final"),
            DEMO_FRAME,
        )
        .await?;

    screencast.finish().await;
    Ok(Some(format!("filled {} fields", FIELDS.len())))
}

/// Side task publishing frames until told to stop
struct Screencast {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Screencast {
    fn start(ctx: RunContext, interval: Duration) -> Self {
        let (stop, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let task_id = TaskId::from("screencast");
            let scope = ctx.recorder.begin(&task_id, "BROWSER", "Screencast").await;
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let state = ctx.safe_point.state();
                        if state.is_terminal() {
                            break;
                        }
                        if state != RunState::Paused {
                            ctx.publish_frame(DEMO_FRAME);
                        }
                    }
                }
            }

            if let Err(e) = scope.finish().await {
                tracing::debug!(error = %e, "Screencast span not closed");
            }
        });
        Self { stop, task }
    }

    async fn finish(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Screencast task failed");
        }
    }
}
