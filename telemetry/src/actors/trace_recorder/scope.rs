use shared_types::{Level, SpanId, SpanOutcome, TaskId};

use super::{EventDraft, TraceRecorder};
use crate::trace::TraceError;

pub const ACTION_FAILED_CODE: &str = "ACTION_FAILED";

/// An open span. Close it with [`finish`](Self::finish) or
/// [`fail`](Self::fail); dropping it unclosed records an `abandoned` end
/// (or `error` while unwinding from a panic).
#[derive(Debug)]
pub struct SpanScope {
    recorder: TraceRecorder,
    task_id: TaskId,
    category: String,
    label: String,
    span_id: Option<SpanId>,
}

impl SpanScope {
    pub(super) fn open(
        recorder: TraceRecorder,
        task_id: TaskId,
        category: &str,
        label: &str,
        span_id: SpanId,
    ) -> Self {
        Self {
            recorder,
            task_id,
            category: category.to_string(),
            label: label.to_string(),
            span_id: Some(span_id),
        }
    }

    /// A scope whose begin was never recorded
    pub(super) fn detached(
        recorder: TraceRecorder,
        task_id: TaskId,
        category: &str,
        label: &str,
    ) -> Self {
        Self {
            recorder,
            task_id,
            category: category.to_string(),
            label: label.to_string(),
            span_id: None,
        }
    }

    pub fn span_id(&self) -> Option<&SpanId> {
        self.span_id.as_ref()
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_detached(&self) -> bool {
        self.span_id.is_none()
    }

    pub async fn finish(self) -> Result<(), TraceError> {
        self.close(SpanOutcome::Ok).await
    }

    /// Record the error inside the span, then close it with `error`.
    pub async fn fail(self, error: impl std::fmt::Display) -> Result<(), TraceError> {
        if !self.is_detached() {
            let draft = EventDraft::new(
                Level::Error,
                self.category.clone(),
                format!("{} failed: {error}", self.label),
            )
            .code(ACTION_FAILED_CODE);
            if let Err(e) = self.recorder.record(&self.task_id, draft).await {
                tracing::warn!(label = %self.label, error = %e, "Failure event not recorded");
            }
        }
        self.close(SpanOutcome::Error).await
    }

    pub async fn close(mut self, outcome: SpanOutcome) -> Result<(), TraceError> {
        match self.span_id.take() {
            Some(span_id) => self.recorder.end(&span_id, outcome).await.map(|_| ()),
            None => Ok(()),
        }
    }
}

impl Drop for SpanScope {
    fn drop(&mut self) {
        if let Some(span_id) = self.span_id.take() {
            let outcome = if std::thread::panicking() {
                SpanOutcome::Error
            } else {
                SpanOutcome::Abandoned
            };
            tracing::debug!(
                span_id = %span_id,
                label = %self.label,
                %outcome,
                "Span scope dropped without an outcome"
            );
            self.recorder.end_detached(span_id, outcome);
        }
    }
}
