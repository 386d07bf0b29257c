//! TraceRecorderActor - single sequencing point for a run's trace.
//!
//! One actor per run. Every span begin, span end and event is assigned the
//! next `sequence_no`, appended to `<run_dir>/trace.jsonl` and synced before
//! the caller gets its reply, then forwarded to the hub for live observers.
//! Per-task open span stacks live here, so concurrent tasks nest correctly
//! without sharing a global "current span".

mod messages;
mod scope;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde_json::json;
use shared_types::{
    ArtifactKind, BeginRecord, EndRecord, EventRecord, Level, LiveMessage, RunId, SpanId,
    SpanOutcome, TaskId, TraceRecord,
};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use tokio::task::JoinHandle;

pub use messages::{EventDraft, OpenedSpan, TraceRecorderMsg};
pub use scope::SpanScope;

use crate::hub::Hub;
use crate::trace::{trace_path, ArtifactStore, TraceError, TraceLogWriter};

pub const SPAN_BEGIN_CODE: &str = "span.begin";
pub const SPAN_END_CODE: &str = "span.end";
pub const CONSOLE_CATEGORY: &str = "CONSOLE";

#[derive(Debug, Default)]
pub struct TraceRecorderActor;

#[derive(Debug, Clone)]
pub struct TraceRecorderArguments {
    pub run_id: RunId,
    pub run_dir: PathBuf,
    pub min_level: Level,
    pub hub: Option<Hub>,
}

#[derive(Debug, Clone)]
struct OpenSpan {
    task_id: TaskId,
    started_at: DateTime<Utc>,
}

pub struct TraceRecorderState {
    run_id: RunId,
    writer: TraceLogWriter,
    next_seq: u64,
    min_level: Level,
    hub: Option<Hub>,
    stacks: HashMap<TaskId, Vec<SpanId>>,
    open: HashMap<SpanId, OpenSpan>,
}

#[async_trait]
impl Actor for TraceRecorderActor {
    type Msg = TraceRecorderMsg;
    type State = TraceRecorderState;
    type Arguments = TraceRecorderArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            run_id = %args.run_id,
            run_dir = %args.run_dir.display(),
            "TraceRecorderActor starting"
        );

        let (writer, existing) = TraceLogWriter::open(trace_path(&args.run_dir)).await?;
        let next_seq = existing.last_sequence_no().map_or(1, |seq| seq + 1);
        if !existing.records.is_empty() {
            tracing::info!(
                run_id = %args.run_id,
                existing_records = existing.records.len(),
                next_seq,
                "Continuing existing trace"
            );
        }

        Ok(TraceRecorderState {
            run_id: args.run_id,
            writer,
            next_seq,
            min_level: args.min_level,
            hub: args.hub,
            stacks: HashMap::new(),
            open: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            TraceRecorderMsg::BeginSpan {
                task_id,
                category,
                label,
                reply,
            } => {
                let result = Self::handle_begin(state, task_id, category, label).await;
                let _ = reply.send(result);
            }
            TraceRecorderMsg::EndSpan {
                span_id,
                outcome,
                reply,
            } => {
                let result = Self::handle_end(state, span_id.clone(), outcome).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::warn!(
                                run_id = %state.run_id,
                                span_id = %span_id,
                                error = %e,
                                "Failed to close dropped span"
                            );
                        }
                    }
                }
            }
            TraceRecorderMsg::RecordEvent {
                task_id,
                draft,
                reply,
            } => {
                let result = Self::handle_event(state, task_id, draft).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::warn!(run_id = %state.run_id, error = %e, "Failed to record event");
                        }
                    }
                }
            }
            TraceRecorderMsg::GetNextSequence { reply } => {
                let _ = reply.send(state.next_seq);
            }
            TraceRecorderMsg::GetOpenSpans { task_id, reply } => {
                let stack = state.stacks.get(&task_id).cloned().unwrap_or_default();
                let _ = reply.send(stack);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            run_id = %state.run_id,
            next_seq = state.next_seq,
            open_spans = state.open.len(),
            "TraceRecorderActor stopped"
        );
        Ok(())
    }
}

impl TraceRecorderActor {
    async fn handle_begin(
        state: &mut TraceRecorderState,
        task_id: TaskId,
        category: String,
        label: String,
    ) -> Result<OpenedSpan, TraceError> {
        let sequence_no = state.next_seq;
        let span_id = SpanId::new();
        let parent_span_id = state
            .stacks
            .get(&task_id)
            .and_then(|stack| stack.last().cloned());
        let ts = Utc::now();

        let record = TraceRecord::Begin(BeginRecord {
            sequence_no,
            run_id: state.run_id.clone(),
            task_id: task_id.clone(),
            span_id: span_id.clone(),
            parent_span_id: parent_span_id.clone(),
            category: category.clone(),
            label: label.clone(),
            ts,
        });
        state.writer.append(&record).await?;
        state.next_seq += 1;

        state
            .stacks
            .entry(task_id.clone())
            .or_default()
            .push(span_id.clone());
        state.open.insert(
            span_id.clone(),
            OpenSpan {
                task_id: task_id.clone(),
                started_at: ts,
            },
        );

        publish(
            state,
            LiveMessage::RunEvent {
                level: Level::Info,
                category,
                message: label,
                code: Some(SPAN_BEGIN_CODE.to_string()),
                data: Some(json!({
                    "sequence_no": sequence_no,
                    "task_id": task_id,
                    "span_id": span_id,
                    "parent_span_id": parent_span_id,
                })),
            },
        );

        Ok(OpenedSpan {
            span_id,
            sequence_no,
            parent_span_id,
        })
    }

    async fn handle_end(
        state: &mut TraceRecorderState,
        span_id: SpanId,
        outcome: SpanOutcome,
    ) -> Result<u64, TraceError> {
        let Some(open) = state.open.get(&span_id).cloned() else {
            return Err(TraceError::UnknownSpan(span_id.to_string()));
        };

        let sequence_no = state.next_seq;
        let ts = Utc::now();
        let duration_ms = u64::try_from((ts - open.started_at).num_milliseconds()).unwrap_or(0);

        let record = TraceRecord::End(EndRecord {
            sequence_no,
            span_id: span_id.clone(),
            outcome,
            ts,
            run_id: Some(state.run_id.clone()),
            task_id: Some(open.task_id.clone()),
            duration_ms: Some(duration_ms),
        });
        state.writer.append(&record).await?;
        state.next_seq += 1;

        state.open.remove(&span_id);
        if let Some(stack) = state.stacks.get_mut(&open.task_id) {
            if let Some(pos) = stack.iter().rposition(|open_id| *open_id == span_id) {
                if pos + 1 != stack.len() {
                    tracing::debug!(
                        run_id = %state.run_id,
                        span_id = %span_id,
                        "Span closed while inner spans are still open"
                    );
                }
                stack.remove(pos);
            }
        }

        let level = match outcome {
            SpanOutcome::Ok => Level::Info,
            SpanOutcome::Abandoned => Level::Warn,
            SpanOutcome::Error => Level::Error,
        };
        publish(
            state,
            LiveMessage::RunEvent {
                level,
                category: "SPAN".to_string(),
                message: format!("span {outcome}"),
                code: Some(SPAN_END_CODE.to_string()),
                data: Some(json!({
                    "sequence_no": sequence_no,
                    "task_id": open.task_id,
                    "span_id": span_id,
                    "outcome": outcome,
                    "duration_ms": duration_ms,
                })),
            },
        );

        Ok(sequence_no)
    }

    async fn handle_event(
        state: &mut TraceRecorderState,
        task_id: TaskId,
        draft: EventDraft,
    ) -> Result<Option<u64>, TraceError> {
        if draft.level < state.min_level {
            return Ok(None);
        }

        let sequence_no = state.next_seq;
        let record = TraceRecord::Event(EventRecord {
            sequence_no,
            run_id: Some(state.run_id.clone()),
            task_id,
            level: draft.level,
            category: draft.category.clone(),
            code: draft.code.clone(),
            message: draft.message.clone(),
            data: draft.data.clone(),
            artifact_ref: draft.artifact_ref.clone(),
            ts: Utc::now(),
        });
        state.writer.append(&record).await?;
        state.next_seq += 1;

        let message = if draft.console {
            LiveMessage::ConsoleLog {
                level: draft.level,
                message: draft.message,
            }
        } else {
            LiveMessage::RunEvent {
                level: draft.level,
                category: draft.category,
                message: draft.message,
                code: draft.code,
                data: (!draft.data.is_null()).then_some(draft.data),
            }
        };
        publish(state, message);

        Ok(Some(sequence_no))
    }
}

/// Live delivery is best effort and never waits; the trace record is
/// already durable.
fn publish(state: &TraceRecorderState, message: LiveMessage) {
    let Some(hub) = &state.hub else {
        return;
    };
    match hub.try_publish(&state.run_id, message) {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(run_id = %state.run_id, "Room ingress full; live message dropped");
        }
        Err(e) => {
            tracing::debug!(run_id = %state.run_id, error = %e, "Live publish failed");
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle used by worker tasks to record into a run's trace
#[derive(Debug, Clone)]
pub struct TraceRecorder {
    actor: ActorRef<TraceRecorderMsg>,
    run_id: RunId,
    artifacts: ArtifactStore,
}

impl TraceRecorder {
    pub async fn spawn(
        args: TraceRecorderArguments,
    ) -> Result<(Self, JoinHandle<()>), TraceError> {
        let artifacts = ArtifactStore::for_run_dir(&args.run_dir);
        let run_id = args.run_id.clone();
        let (actor, handle) = Actor::spawn(None, TraceRecorderActor, args)
            .await
            .map_err(|e| TraceError::RecorderUnavailable(e.to_string()))?;
        Ok((
            Self {
                actor,
                run_id,
                artifacts,
            },
            handle,
        ))
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Open a span. Recording failures never fail the caller: the returned
    /// scope is detached and its close is a no-op.
    pub async fn begin(&self, task_id: &TaskId, category: &str, label: &str) -> SpanScope {
        match self.try_begin(task_id, category, label).await {
            Ok(opened) => SpanScope::open(
                self.clone(),
                task_id.clone(),
                category,
                label,
                opened.span_id,
            ),
            Err(e) => {
                tracing::warn!(
                    run_id = %self.run_id,
                    task_id = %task_id,
                    label,
                    error = %e,
                    "Span begin not recorded; continuing without it"
                );
                SpanScope::detached(self.clone(), task_id.clone(), category, label)
            }
        }
    }

    pub async fn try_begin(
        &self,
        task_id: &TaskId,
        category: &str,
        label: &str,
    ) -> Result<OpenedSpan, TraceError> {
        ractor::call!(self.actor, |reply| TraceRecorderMsg::BeginSpan {
            task_id: task_id.clone(),
            category: category.to_string(),
            label: label.to_string(),
            reply,
        })
        .map_err(|e| TraceError::RecorderUnavailable(e.to_string()))?
    }

    pub async fn end(&self, span_id: &SpanId, outcome: SpanOutcome) -> Result<u64, TraceError> {
        ractor::call!(self.actor, |reply| TraceRecorderMsg::EndSpan {
            span_id: span_id.clone(),
            outcome,
            reply: Some(reply),
        })
        .map_err(|e| TraceError::RecorderUnavailable(e.to_string()))?
    }

    /// Close a span without waiting for the write.
    pub(crate) fn end_detached(&self, span_id: SpanId, outcome: SpanOutcome) {
        if let Err(e) = self.actor.cast(TraceRecorderMsg::EndSpan {
            span_id,
            outcome,
            reply: None,
        }) {
            tracing::warn!(run_id = %self.run_id, error = %e, "Trace recorder gone; span end lost");
        }
    }

    /// Record an event; `Ok(None)` when it was below the minimum level.
    pub async fn record(&self, task_id: &TaskId, draft: EventDraft) -> Result<Option<u64>, TraceError> {
        ractor::call!(self.actor, |reply| TraceRecorderMsg::RecordEvent {
            task_id: task_id.clone(),
            draft,
            reply: Some(reply),
        })
        .map_err(|e| TraceError::RecorderUnavailable(e.to_string()))?
    }

    pub async fn event(
        &self,
        task_id: &TaskId,
        level: Level,
        category: &str,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<Option<u64>, TraceError> {
        self.record(task_id, EventDraft::new(level, category, message).data(data))
            .await
    }

    /// Record a browser console line (`log`, `warn`, `error`, ...).
    pub async fn console(
        &self,
        task_id: &TaskId,
        console_type: &str,
        message: impl Into<String>,
    ) -> Result<Option<u64>, TraceError> {
        let draft = EventDraft::new(Level::from_console(console_type), CONSOLE_CATEGORY, message)
            .data(json!({ "type": console_type }))
            .console();
        self.record(task_id, draft).await
    }

    /// Store content in the artifact store and record an event pointing at it.
    pub async fn artifact(
        &self,
        task_id: &TaskId,
        draft: EventDraft,
        kind: ArtifactKind,
        mime: &str,
        name: Option<&str>,
        content: &[u8],
    ) -> Result<Option<u64>, TraceError> {
        let reference = self.artifacts.put(kind, mime, name, content).await?;
        self.record(task_id, draft.artifact(reference)).await
    }

    /// Run `fut` inside a span; `Ok` closes it ok, `Err` closes it as error.
    pub async fn in_span<T, E, Fut>(
        &self,
        task_id: &TaskId,
        category: &str,
        label: &str,
        fut: Fut,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let scope = self.begin(task_id, category, label).await;
        let result = fut.await;
        let closed = match &result {
            Ok(_) => scope.finish().await,
            Err(e) => scope.fail(e).await,
        };
        if let Err(e) = closed {
            tracing::warn!(run_id = %self.run_id, label, error = %e, "Span end not recorded");
        }
        result
    }

    pub async fn next_sequence(&self) -> Result<u64, TraceError> {
        ractor::call!(self.actor, |reply| TraceRecorderMsg::GetNextSequence { reply })
            .map_err(|e| TraceError::RecorderUnavailable(e.to_string()))
    }

    pub async fn open_spans(&self, task_id: &TaskId) -> Result<Vec<SpanId>, TraceError> {
        ractor::call!(self.actor, |reply| TraceRecorderMsg::GetOpenSpans {
            task_id: task_id.clone(),
            reply,
        })
        .map_err(|e| TraceError::RecorderUnavailable(e.to_string()))
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{read_trace, ActionTree};
    use tempfile::TempDir;

    async fn spawn_recorder(dir: &TempDir, min_level: Level) -> (TraceRecorder, JoinHandle<()>) {
        TraceRecorder::spawn(TraceRecorderArguments {
            run_id: RunId::from("run-test"),
            run_dir: dir.path().to_path_buf(),
            min_level,
            hub: None,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_dense() {
        let dir = TempDir::new().unwrap();
        let (recorder, handle) = spawn_recorder(&dir, Level::Info).await;
        let task = TaskId::main();

        let scope = recorder.begin(&task, "BROWSER", "open page").await;
        let seq = recorder
            .event(&task, Level::Info, "BROWSER", "navigated", json!({"url": "https://example.test"}))
            .await
            .unwrap();
        assert_eq!(seq, Some(2));
        scope.finish().await.unwrap();
        assert_eq!(recorder.next_sequence().await.unwrap(), 4);

        recorder.stop();
        handle.await.unwrap();

        let log = read_trace(&trace_path(dir.path())).await.unwrap();
        let seqs: Vec<u64> = log.records.iter().map(TraceRecord::sequence_no).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_events_below_min_level_are_dropped() {
        let dir = TempDir::new().unwrap();
        let (recorder, _handle) = spawn_recorder(&dir, Level::Info).await;
        let task = TaskId::main();

        let dropped = recorder
            .event(&task, Level::Debug, "SYSTEM", "noisy", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(dropped, None);

        let kept = recorder.console(&task, "warn", "deprecated API").await.unwrap();
        assert_eq!(kept, Some(1));
    }

    #[tokio::test]
    async fn test_dropped_scope_is_abandoned_and_unknown_end_rejected() {
        let dir = TempDir::new().unwrap();
        let (recorder, handle) = spawn_recorder(&dir, Level::Info).await;
        let task = TaskId::main();

        {
            let _scope = recorder.begin(&task, "FORMS", "fill form").await;
        }
        assert!(recorder.open_spans(&task).await.unwrap().is_empty());

        let err = recorder
            .end(&SpanId::from("never-opened"), SpanOutcome::Ok)
            .await
            .unwrap_err();
        assert!(matches!(err, TraceError::UnknownSpan(_)));

        recorder.stop();
        handle.await.unwrap();

        let log = read_trace(&trace_path(dir.path())).await.unwrap();
        let tree = ActionTree::reconstruct(log.records);
        let span = tree.find_span("fill form").unwrap();
        assert_eq!(span.state, crate::trace::SpanState::Closed(SpanOutcome::Abandoned));
    }

    #[tokio::test]
    async fn test_reopen_continues_sequence() {
        let dir = TempDir::new().unwrap();
        let task = TaskId::main();

        let (recorder, handle) = spawn_recorder(&dir, Level::Info).await;
        recorder
            .event(&task, Level::Info, "SYSTEM", "first", serde_json::Value::Null)
            .await
            .unwrap();
        recorder.stop();
        handle.await.unwrap();

        let (recorder, _handle) = spawn_recorder(&dir, Level::Info).await;
        let seq = recorder
            .event(&task, Level::Info, "SYSTEM", "second", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(seq, Some(2));
    }
}
