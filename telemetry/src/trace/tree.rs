//! Action tree reconstruction.
//!
//! Records are replayed in `sequence_no` order with one open-span stack per
//! task, so interleaved tasks never borrow each other's parents. Malformed
//! input (an end that does not match the top of its stack, an end for a
//! span that never began, a begin naming an unknown parent) is repaired
//! best-effort and the affected node is flagged `inconsistent` instead of
//! failing the whole tree. Span nesting is capped at [`MAX_SPAN_DEPTH`];
//! deeper begins are attached higher up and flagged.

use shared_types::{BeginRecord, EndRecord, EventRecord, Level, SpanId, SpanOutcome, TaskId, TraceRecord};
use std::collections::HashMap;

/// Deepest span nesting kept in a tree; rendering recurses once per level.
pub const MAX_SPAN_DEPTH: usize = 256;

const UNMATCHED_END_LABEL: &str = "(unmatched end)";
const UNKNOWN_CATEGORY: &str = "UNKNOWN";
const UNKNOWN_TASK: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    Open,
    Closed(SpanOutcome),
    /// Never closed, and the run is over
    Abandoned,
}

impl SpanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanState::Open => "open",
            SpanState::Closed(outcome) => outcome.as_str(),
            SpanState::Abandoned => "abandoned",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, SpanState::Open)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpanNode {
    pub span_id: SpanId,
    pub task_id: TaskId,
    /// None for a synthetic node created from an end without a begin
    pub begin: Option<BeginRecord>,
    pub end: Option<EndRecord>,
    pub state: SpanState,
    pub inconsistent: bool,
    pub children: Vec<Node>,
}

impl SpanNode {
    pub fn label(&self) -> &str {
        self.begin
            .as_ref()
            .map(|b| b.label.as_str())
            .unwrap_or(UNMATCHED_END_LABEL)
    }

    pub fn category(&self) -> &str {
        self.begin
            .as_ref()
            .map(|b| b.category.as_str())
            .unwrap_or(UNKNOWN_CATEGORY)
    }

    /// Sequence number of the record that opened (or, for synthetic nodes,
    /// closed) the span
    pub fn first_seq(&self) -> u64 {
        self.begin
            .as_ref()
            .map(|b| b.sequence_no)
            .or_else(|| self.end.as_ref().map(|e| e.sequence_no))
            .unwrap_or_default()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let end = self.end.as_ref()?;
        if end.duration_ms.is_some() {
            return end.duration_ms;
        }
        let begin = self.begin.as_ref()?;
        u64::try_from((end.ts - begin.ts).num_milliseconds()).ok()
    }

    pub fn is_synthetic(&self) -> bool {
        self.begin.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Span(SpanNode),
    Event(EventRecord),
}

impl Node {
    pub fn first_seq(&self) -> u64 {
        match self {
            Node::Span(span) => span.first_seq(),
            Node::Event(event) => event.sequence_no,
        }
    }
}

/// Occurrences of one event code, for triage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeCount {
    pub code: String,
    pub count: usize,
    pub max_level: Level,
}

/// Forest of spans and events rebuilt from a trace
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionTree {
    pub roots: Vec<Node>,
}

impl ActionTree {
    /// Rebuild the tree from records in any order; duplicates (same
    /// `sequence_no`) are dropped.
    pub fn reconstruct(records: impl IntoIterator<Item = TraceRecord>) -> Self {
        let mut records: Vec<TraceRecord> = records.into_iter().collect();
        records.sort_by_key(TraceRecord::sequence_no);
        records.dedup_by_key(|r| r.sequence_no());

        let mut builder = TreeBuilder::default();
        for record in records {
            match record {
                TraceRecord::Begin(begin) => builder.begin(begin),
                TraceRecord::End(end) => builder.end(end),
                TraceRecord::Event(event) => builder.event(event),
            }
        }
        builder.finish()
    }

    /// Mark every still-open span abandoned. Used once the run is terminal.
    pub fn mark_abandoned(&mut self) -> usize {
        fn visit(nodes: &mut [Node], count: &mut usize) {
            for node in nodes {
                if let Node::Span(span) = node {
                    if span.state.is_open() {
                        span.state = SpanState::Abandoned;
                        *count += 1;
                    }
                    visit(&mut span.children, count);
                }
            }
        }

        let mut count = 0;
        visit(&mut self.roots, &mut count);
        count
    }

    /// Spans in pre-order (parents before children, siblings in sequence order)
    pub fn spans(&self) -> Vec<&SpanNode> {
        let mut spans = Vec::new();
        walk(&self.roots, &mut |node| {
            if let Node::Span(span) = node {
                spans.push(span);
            }
        });
        spans
    }

    pub fn find_span(&self, label: &str) -> Option<&SpanNode> {
        self.spans().into_iter().find(|s| s.label() == label)
    }

    /// All events across all tasks in sequence order
    pub fn events(&self) -> Vec<&EventRecord> {
        let mut events = Vec::new();
        walk(&self.roots, &mut |node| {
            if let Node::Event(event) = node {
                events.push(event);
            }
        });
        events.sort_by_key(|e| e.sequence_no);
        events
    }

    /// Records equivalent to the ones the tree was built from, in sequence order
    pub fn to_records(&self) -> Vec<TraceRecord> {
        let mut records = Vec::new();
        walk(&self.roots, &mut |node| match node {
            Node::Span(span) => {
                if let Some(begin) = &span.begin {
                    records.push(TraceRecord::Begin(begin.clone()));
                }
                if let Some(end) = &span.end {
                    records.push(TraceRecord::End(end.clone()));
                }
            }
            Node::Event(event) => records.push(TraceRecord::Event(event.clone())),
        });
        records.sort_by_key(TraceRecord::sequence_no);
        records
    }

    /// Event counts per code, most frequent first
    pub fn code_summary(&self) -> Vec<CodeCount> {
        let mut counts: HashMap<&str, (usize, Level)> = HashMap::new();
        for event in self.events() {
            if let Some(code) = event.code.as_deref() {
                let entry = counts.entry(code).or_insert((0, event.level));
                entry.0 += 1;
                entry.1 = entry.1.max(event.level);
            }
        }

        let mut summary: Vec<CodeCount> = counts
            .into_iter()
            .map(|(code, (count, max_level))| CodeCount {
                code: code.to_string(),
                count,
                max_level,
            })
            .collect();
        summary.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.code.cmp(&b.code)));
        summary
    }

    pub fn open_span_count(&self) -> usize {
        self.spans().iter().filter(|s| s.state.is_open()).count()
    }

    pub fn inconsistent_count(&self) -> usize {
        self.spans().iter().filter(|s| s.inconsistent).count()
    }

    pub fn last_sequence_no(&self) -> Option<u64> {
        self.to_records().last().map(TraceRecord::sequence_no)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

fn walk<'a>(nodes: &'a [Node], f: &mut impl FnMut(&'a Node)) {
    for node in nodes {
        f(node);
        if let Node::Span(span) = node {
            walk(&span.children, f);
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Child {
    Span(usize),
    Event(usize),
}

#[derive(Debug)]
struct SpanSlot {
    node: SpanNode,
    children: Vec<Child>,
    /// 1 for a root span
    depth: usize,
}

#[derive(Debug, Default)]
struct TreeBuilder {
    spans: Vec<SpanSlot>,
    events: Vec<Option<EventRecord>>,
    roots: Vec<Child>,
    stacks: HashMap<TaskId, Vec<usize>>,
    index: HashMap<SpanId, usize>,
}

impl TreeBuilder {
    fn attach(&mut self, parent: Option<usize>, child: Child) {
        match parent {
            Some(idx) => self.spans[idx].children.push(child),
            None => self.roots.push(child),
        }
    }

    fn depth_below(&self, parent: Option<usize>) -> usize {
        parent.map_or(1, |p| self.spans[p].depth + 1)
    }

    fn top_of(&self, task_id: &TaskId) -> Option<usize> {
        self.stacks.get(task_id).and_then(|stack| stack.last().copied())
    }

    fn begin(&mut self, begin: BeginRecord) {
        if let Some(&existing) = self.index.get(&begin.span_id) {
            tracing::debug!(span_id = %begin.span_id, "Duplicate span begin ignored");
            self.spans[existing].node.inconsistent = true;
            return;
        }

        let stack = self.stacks.entry(begin.task_id.clone()).or_default();
        let (parent, inconsistent) = match &begin.parent_span_id {
            Some(declared) => {
                let position = stack
                    .iter()
                    .rposition(|&idx| self.spans[idx].node.span_id == *declared);
                match position {
                    Some(pos) => (Some(stack[pos]), pos + 1 != stack.len()),
                    None => (stack.last().copied(), true),
                }
            }
            // Declared root while the task still has a span open: nest it
            // like any other record of the task, but flag it.
            None => (stack.last().copied(), !stack.is_empty()),
        };

        let (parent, inconsistent) = match parent {
            Some(p) if self.spans[p].depth >= MAX_SPAN_DEPTH => {
                let shallower = stack
                    .iter()
                    .rev()
                    .copied()
                    .find(|&open| self.spans[open].depth < MAX_SPAN_DEPTH);
                (shallower, true)
            }
            other => (other, inconsistent),
        };
        let depth = self.depth_below(parent);

        let idx = self.spans.len();
        self.spans.push(SpanSlot {
            node: SpanNode {
                span_id: begin.span_id.clone(),
                task_id: begin.task_id.clone(),
                begin: Some(begin.clone()),
                end: None,
                state: SpanState::Open,
                inconsistent,
                children: Vec::new(),
            },
            children: Vec::new(),
            depth,
        });
        self.index.insert(begin.span_id, idx);
        self.stacks.entry(begin.task_id).or_default().push(idx);
        self.attach(parent, Child::Span(idx));
    }

    fn end(&mut self, end: EndRecord) {
        let Some(&idx) = self.index.get(&end.span_id) else {
            self.unmatched_end(end);
            return;
        };

        if self.spans[idx].node.end.is_some() {
            tracing::debug!(span_id = %end.span_id, "Duplicate span end ignored");
            self.spans[idx].node.inconsistent = true;
            return;
        }

        let task_id = self.spans[idx].node.task_id.clone();
        let mut inconsistent = end.task_id.as_ref().is_some_and(|t| *t != task_id);

        let stack = self.stacks.entry(task_id).or_default();
        match stack.iter().rposition(|&open| open == idx) {
            Some(pos) if pos + 1 == stack.len() => {
                stack.pop();
            }
            Some(pos) => {
                // Closed out of order: spans above it stay open.
                stack.remove(pos);
                inconsistent = true;
            }
            None => inconsistent = true,
        }

        let node = &mut self.spans[idx].node;
        node.state = SpanState::Closed(end.outcome);
        node.end = Some(end);
        node.inconsistent |= inconsistent;
    }

    fn unmatched_end(&mut self, end: EndRecord) {
        let task_id = end
            .task_id
            .clone()
            .unwrap_or_else(|| TaskId::from(UNKNOWN_TASK));
        let parent = self.top_of(&task_id);
        let depth = self.depth_below(parent);

        let idx = self.spans.len();
        self.spans.push(SpanSlot {
            node: SpanNode {
                span_id: end.span_id.clone(),
                task_id,
                begin: None,
                state: SpanState::Closed(end.outcome),
                end: Some(end.clone()),
                inconsistent: true,
                children: Vec::new(),
            },
            children: Vec::new(),
            depth,
        });
        self.index.insert(end.span_id, idx);
        self.attach(parent, Child::Span(idx));
    }

    fn event(&mut self, event: EventRecord) {
        let parent = self.top_of(&event.task_id);
        let idx = self.events.len();
        self.events.push(Some(event));
        self.attach(parent, Child::Event(idx));
    }

    fn finish(mut self) -> ActionTree {
        let roots = std::mem::take(&mut self.roots);
        let roots = roots
            .into_iter()
            .filter_map(|child| self.build(child))
            .collect();
        ActionTree { roots }
    }

    fn build(&mut self, child: Child) -> Option<Node> {
        match child {
            Child::Event(idx) => self.events[idx].take().map(Node::Event),
            Child::Span(idx) => {
                let children = std::mem::take(&mut self.spans[idx].children);
                let built: Vec<Node> = children
                    .into_iter()
                    .filter_map(|c| self.build(c))
                    .collect();
                let mut node = self.spans[idx].node.clone();
                node.children = built;
                Some(Node::Span(node))
            }
        }
    }
}
