//! Self-contained HTML report for one run.
//!
//! The output depends only on the trace and the artifact contents: no
//! generation timestamp, no external assets, maps rendered in sorted order.
//! Rendering the same trace twice yields byte-identical HTML.

use base64::Engine;
use chrono::SecondsFormat;
use html_escape::{encode_double_quoted_attribute, encode_text};
use shared_types::{ArtifactKind, ArtifactRef, EventRecord};
use std::fmt::Write;
use std::path::{Path, PathBuf};

use crate::actors::trace_recorder::CONSOLE_CATEGORY;
use crate::trace::{
    read_trace, trace_path, ActionTree, ArtifactContent, ArtifactSet, ArtifactStore, Node,
    SpanNode, SpanState, TraceError,
};

const STYLE: &str = r#"
body { font-family: -apple-system, "Segoe UI", Helvetica, Arial, sans-serif; margin: 2rem; color: #1d1d1f; background: #fafafa; }
h1 { font-size: 1.4rem; margin-bottom: 0.5rem; }
h2 { font-size: 1.1rem; margin-top: 2rem; border-bottom: 1px solid #ddd; padding-bottom: 0.25rem; }
ul.summary { list-style: none; padding: 0; display: flex; gap: 1.5rem; flex-wrap: wrap; }
ul.summary li b { font-variant-numeric: tabular-nums; }
.notice { background: #fff4e5; border: 1px solid #f0b46a; padding: 0.5rem 0.75rem; border-radius: 4px; }
details.span { margin: 0.2rem 0 0.2rem 0; border-left: 2px solid #ccd; padding-left: 0.6rem; }
details.span > summary { cursor: pointer; padding: 0.15rem 0; }
.children { margin-left: 1rem; }
.seq { color: #888; font-family: ui-monospace, Menlo, monospace; font-size: 0.85em; }
.badge { display: inline-block; padding: 0 0.4rem; border-radius: 3px; font-size: 0.8em; font-weight: 600; text-transform: uppercase; }
.badge.ok { background: #e3f5e1; color: #1e6b1a; }
.badge.error { background: #fde2e1; color: #a4161a; }
.badge.abandoned { background: #eee; color: #555; }
.badge.open { background: #e1ecfd; color: #1a4fa4; }
.badge.inconsistent { background: #fff0c2; color: #7a5b00; }
.category { color: #555; font-size: 0.85em; }
.label { font-weight: 600; }
.task, .duration { color: #888; font-size: 0.85em; }
.event { padding: 0.15rem 0; }
.event .level { font-size: 0.8em; font-weight: 600; }
.level-ERROR .level { color: #a4161a; }
.level-WARN .level { color: #9a6700; }
.level-DEBUG .level, .level-TRACE .level { color: #888; }
.code { font-family: ui-monospace, Menlo, monospace; font-size: 0.85em; background: #f0f0f0; padding: 0 0.3rem; border-radius: 3px; }
.console-line { font-family: ui-monospace, Menlo, monospace; font-size: 0.85em; white-space: nowrap; }
pre { background: #f4f4f4; padding: 0.5rem; overflow-x: auto; font-size: 0.85em; max-height: 24rem; }
img.artifact { max-width: 100%; border: 1px solid #ddd; margin: 0.25rem 0; }
.artifact.missing { color: #a4161a; font-style: italic; }
table { border-collapse: collapse; width: 100%; font-size: 0.9em; }
th, td { text-align: left; padding: 0.2rem 0.5rem; border-bottom: 1px solid #eee; vertical-align: top; }
td.num { font-variant-numeric: tabular-nums; }
"#;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("No trace found at {0}")]
    NotFound(PathBuf),

    #[error(transparent)]
    Trace(#[from] TraceError),
}

#[derive(Debug, Clone)]
pub struct ReportRenderer {
    title: String,
    truncated_tail: bool,
}

impl ReportRenderer {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            truncated_tail: false,
        }
    }

    /// Show a notice that the trace ended in a torn or malformed line.
    pub fn with_truncated_tail(mut self, truncated_tail: bool) -> Self {
        self.truncated_tail = truncated_tail;
        self
    }

    pub fn render(&self, tree: &ActionTree, artifacts: &ArtifactSet) -> String {
        let mut out = String::new();
        let title = encode_text(&self.title);

        let _ = writeln!(&mut out, "<!DOCTYPE html>");
        let _ = writeln!(&mut out, "<html lang=\"en\">");
        let _ = writeln!(&mut out, "<head>");
        let _ = writeln!(&mut out, "<meta charset=\"utf-8\">");
        let _ = writeln!(&mut out, "<title>{title}</title>");
        let _ = writeln!(&mut out, "<style>{STYLE}</style>");
        let _ = writeln!(&mut out, "</head>");
        let _ = writeln!(&mut out, "<body>");
        let _ = writeln!(&mut out, "<h1>{title}</h1>");

        self.render_summary(&mut out, tree);
        render_triage(&mut out, tree);

        let _ = writeln!(&mut out, "<section class=\"actions\">");
        let _ = writeln!(&mut out, "<h2>Actions</h2>");
        if tree.is_empty() {
            let _ = writeln!(&mut out, "<p class=\"empty\">No actions recorded.</p>");
        }
        for node in &tree.roots {
            render_node(&mut out, node, artifacts);
        }
        let _ = writeln!(&mut out, "</section>");

        render_timeline(&mut out, tree);

        let _ = writeln!(&mut out, "</body>");
        let _ = writeln!(&mut out, "</html>");
        out
    }

    fn render_summary(&self, out: &mut String, tree: &ActionTree) {
        let spans = tree.spans();
        let count = |state: &str| spans.iter().filter(|s| s.state.as_str() == state).count();
        let events = tree.events();
        let errors = events
            .iter()
            .filter(|e| e.level == shared_types::Level::Error)
            .count();

        let _ = writeln!(out, "<ul class=\"summary\">");
        let _ = writeln!(out, "<li>Spans <b>{}</b></li>", spans.len());
        let _ = writeln!(out, "<li>Ok <b>{}</b></li>", count("ok"));
        let _ = writeln!(out, "<li>Error <b>{}</b></li>", count("error"));
        let _ = writeln!(out, "<li>Abandoned <b>{}</b></li>", count("abandoned"));
        let _ = writeln!(out, "<li>Open <b>{}</b></li>", count("open"));
        let _ = writeln!(out, "<li>Inconsistent <b>{}</b></li>", tree.inconsistent_count());
        let _ = writeln!(out, "<li>Events <b>{}</b></li>", events.len());
        let _ = writeln!(out, "<li>Errors <b>{errors}</b></li>");
        if let Some(last) = tree.last_sequence_no() {
            let _ = writeln!(out, "<li>Last sequence <b>{last}</b></li>");
        }
        let _ = writeln!(out, "</ul>");

        if self.truncated_tail {
            let _ = writeln!(
                out,
                "<p class=\"notice\">The trace ends in an incomplete record; the report shows everything before it.</p>"
            );
        }
    }
}

fn render_triage(out: &mut String, tree: &ActionTree) {
    let summary = tree.code_summary();
    let _ = writeln!(out, "<section class=\"triage\">");
    let _ = writeln!(out, "<h2>Triage</h2>");
    if summary.is_empty() {
        let _ = writeln!(out, "<p class=\"empty\">No coded events.</p>");
    } else {
        let _ = writeln!(out, "<table>");
        let _ = writeln!(out, "<tr><th>Code</th><th>Count</th><th>Worst level</th></tr>");
        for entry in summary {
            let _ = writeln!(
                out,
                "<tr><td><span class=\"code\">{}</span></td><td class=\"num\">{}</td><td class=\"level-{}\"><span class=\"level\">{}</span></td></tr>",
                encode_text(&entry.code),
                entry.count,
                entry.max_level,
                entry.max_level
            );
        }
        let _ = writeln!(out, "</table>");
    }
    let _ = writeln!(out, "</section>");
}

fn render_node(out: &mut String, node: &Node, artifacts: &ArtifactSet) {
    match node {
        Node::Span(span) => render_span(out, span, artifacts),
        Node::Event(event) => render_event(out, event, artifacts),
    }
}

fn render_span(out: &mut String, span: &SpanNode, artifacts: &ArtifactSet) {
    let state = span.state.as_str();
    let expanded = !matches!(span.state, SpanState::Closed(shared_types::SpanOutcome::Ok));

    let _ = write!(
        out,
        "<details class=\"span state-{state}\"{}>",
        if expanded { " open" } else { "" }
    );
    let _ = write!(
        out,
        "<summary><span class=\"seq\">#{}</span> <span class=\"badge {state}\">{state}</span>",
        span.first_seq()
    );
    if span.inconsistent {
        let _ = write!(out, " <span class=\"badge inconsistent\">inconsistent</span>");
    }
    let _ = write!(
        out,
        " <span class=\"category\">{}</span> <span class=\"label\">{}</span> <span class=\"task\">{}</span>",
        encode_text(span.category()),
        encode_text(span.label()),
        encode_text(span.task_id.as_str())
    );
    if let Some(ms) = span.duration_ms() {
        let _ = write!(out, " <span class=\"duration\">{ms} ms</span>");
    }
    let _ = writeln!(out, "</summary>");

    if !span.children.is_empty() {
        let _ = writeln!(out, "<div class=\"children\">");
        for child in &span.children {
            render_node(out, child, artifacts);
        }
        let _ = writeln!(out, "</div>");
    }
    let _ = writeln!(out, "</details>");
}

fn render_event(out: &mut String, event: &EventRecord, artifacts: &ArtifactSet) {
    let level = event.level.as_str();

    if event.category == CONSOLE_CATEGORY {
        let _ = writeln!(
            out,
            "<div class=\"event console level-{level}\" id=\"event-{}\"><span class=\"seq\">#{}</span> <code class=\"console-line\">[{level}] {}</code></div>",
            event.sequence_no,
            event.sequence_no,
            encode_text(&event.message)
        );
        return;
    }

    let _ = write!(
        out,
        "<div class=\"event level-{level}\" id=\"event-{}\"><span class=\"seq\">#{}</span> <span class=\"level\">{level}</span> <span class=\"category\">{}</span>",
        event.sequence_no,
        event.sequence_no,
        encode_text(&event.category)
    );
    if let Some(code) = &event.code {
        let _ = write!(out, " <span class=\"code\">{}</span>", encode_text(code));
    }
    let _ = writeln!(out, " <span class=\"message\">{}</span>", encode_text(&event.message));

    if !event.data.is_null() {
        let pretty = serde_json::to_string_pretty(&event.data).unwrap_or_else(|_| event.data.to_string());
        let _ = writeln!(out, "<pre class=\"data\">{}</pre>", encode_text(&pretty));
    }
    if let Some(reference) = &event.artifact_ref {
        render_artifact(out, reference, artifacts);
    }
    let _ = writeln!(out, "</div>");
}

fn render_artifact(out: &mut String, reference: &ArtifactRef, artifacts: &ArtifactSet) {
    let short_hash: String = reference.content_hash.chars().take(12).collect();
    let name = reference.name.as_deref().unwrap_or(&short_hash);

    let Some(artifact) = artifacts.get(&reference.content_hash) else {
        let _ = writeln!(
            out,
            "<div class=\"artifact missing\">Artifact {} ({}) unavailable</div>",
            encode_text(name),
            encode_text(&short_hash)
        );
        return;
    };

    let content = match &artifact.content {
        ArtifactContent::Pointer(location) => {
            let _ = writeln!(
                out,
                "<div class=\"artifact pointer\"><a href=\"{}\">{}</a></div>",
                encode_double_quoted_attribute(location),
                encode_text(name)
            );
            return;
        }
        ArtifactContent::Inline(content) => content,
    };

    match reference.kind {
        ArtifactKind::Image => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(content);
            let _ = writeln!(
                out,
                "<img class=\"artifact\" alt=\"{}\" src=\"data:{};base64,{encoded}\">",
                encode_double_quoted_attribute(name),
                encode_double_quoted_attribute(&reference.mime)
            );
        }
        ArtifactKind::Json => {
            let text = serde_json::from_slice::<serde_json::Value>(content)
                .ok()
                .and_then(|value| serde_json::to_string_pretty(&value).ok())
                .unwrap_or_else(|| String::from_utf8_lossy(content).into_owned());
            let _ = writeln!(
                out,
                "<pre class=\"artifact json\" title=\"{}\">{}</pre>",
                encode_double_quoted_attribute(name),
                encode_text(&text)
            );
        }
        ArtifactKind::Html => {
            let _ = writeln!(
                out,
                "<details class=\"artifact html\"><summary>HTML snapshot {}</summary><pre>{}</pre></details>",
                encode_text(name),
                encode_text(&String::from_utf8_lossy(content))
            );
        }
        ArtifactKind::Text => {
            let _ = writeln!(
                out,
                "<pre class=\"artifact text\" title=\"{}\">{}</pre>",
                encode_double_quoted_attribute(name),
                encode_text(&String::from_utf8_lossy(content))
            );
        }
    }
}

fn render_timeline(out: &mut String, tree: &ActionTree) {
    let events = tree.events();
    let _ = writeln!(out, "<section class=\"timeline\">");
    let _ = writeln!(out, "<h2>Timeline</h2>");
    if events.is_empty() {
        let _ = writeln!(out, "<p class=\"empty\">No events recorded.</p>");
        let _ = writeln!(out, "</section>");
        return;
    }

    let _ = writeln!(out, "<table>");
    let _ = writeln!(
        out,
        "<tr><th>#</th><th>Time</th><th>Task</th><th>Level</th><th>Category</th><th>Code</th><th>Message</th></tr>"
    );
    for event in events {
        let _ = writeln!(
            out,
            "<tr class=\"level-{}\"><td class=\"num\"><a href=\"#event-{}\">{}</a></td><td>{}</td><td>{}</td><td><span class=\"level\">{}</span></td><td>{}</td><td>{}</td><td>{}</td></tr>",
            event.level,
            event.sequence_no,
            event.sequence_no,
            event.ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            encode_text(event.task_id.as_str()),
            event.level,
            encode_text(&event.category),
            encode_text(event.code.as_deref().unwrap_or("")),
            encode_text(&event.message)
        );
    }
    let _ = writeln!(out, "</table>");
    let _ = writeln!(out, "</section>");
}

/// Read a run directory's trace and artifacts and render its report.
///
/// With `run_finished`, spans that never closed are shown as abandoned
/// rather than open.
pub async fn render_run_report(
    run_dir: &Path,
    title: &str,
    run_finished: bool,
) -> Result<String, ReportError> {
    let path = trace_path(run_dir);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(ReportError::NotFound(path));
    }

    let log = read_trace(&path).await?;
    let mut tree = ActionTree::reconstruct(log.records);
    if run_finished {
        let abandoned = tree.mark_abandoned();
        if abandoned > 0 {
            tracing::debug!(run_dir = %run_dir.display(), abandoned, "Marked unclosed spans abandoned");
        }
    }
    let artifacts = ArtifactStore::for_run_dir(run_dir).collect(&tree).await;

    Ok(ReportRenderer::new(title)
        .with_truncated_tail(log.truncated_tail)
        .render(&tree, &artifacts))
}
