//! Property tests for action tree reconstruction

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use run_telemetry::trace::{ActionTree, Node, SpanNode};
use shared_types::{
    BeginRecord, EndRecord, EventRecord, Level, RunId, SpanId, SpanOutcome, TaskId, TraceRecord,
};

#[derive(Debug, Clone)]
enum Op {
    Open(usize),
    Close(usize),
    Event(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..3).prop_map(Op::Open),
        (0usize..3).prop_map(Op::Close),
        (0usize..3).prop_map(Op::Event),
    ]
}

/// Turn ops into a well-nested trace: closes only ever pop the task's own
/// innermost span, and `close_all` closes whatever remains.
fn build_trace(ops: &[Op], close_all: bool) -> Vec<TraceRecord> {
    let run_id = RunId::from("prop");
    let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let mut stacks: Vec<Vec<SpanId>> = vec![Vec::new(); 3];
    let mut records = Vec::new();
    let mut seq = 0u64;
    let mut next_seq = || {
        seq += 1;
        seq
    };

    for op in ops {
        match op {
            Op::Open(task) => {
                let span_id = SpanId(format!("s{}", records.len()));
                records.push(TraceRecord::Begin(BeginRecord {
                    sequence_no: next_seq(),
                    run_id: run_id.clone(),
                    task_id: TaskId(format!("t{task}")),
                    span_id: span_id.clone(),
                    parent_span_id: stacks[*task].last().cloned(),
                    category: "PROP".to_string(),
                    label: span_id.0.clone(),
                    ts,
                }));
                stacks[*task].push(span_id);
            }
            Op::Close(task) => {
                if let Some(span_id) = stacks[*task].pop() {
                    records.push(TraceRecord::End(EndRecord {
                        sequence_no: next_seq(),
                        span_id,
                        outcome: SpanOutcome::Ok,
                        ts,
                        run_id: Some(run_id.clone()),
                        task_id: Some(TaskId(format!("t{task}"))),
                        duration_ms: None,
                    }));
                }
            }
            Op::Event(task) => records.push(TraceRecord::Event(EventRecord {
                sequence_no: next_seq(),
                run_id: Some(run_id.clone()),
                task_id: TaskId(format!("t{task}")),
                level: Level::Info,
                category: "PROP".to_string(),
                code: None,
                message: format!("e{}", records.len()),
                data: serde_json::Value::Null,
                artifact_ref: None,
                ts,
            })),
        }
    }

    if close_all {
        for (task, stack) in stacks.iter_mut().enumerate() {
            while let Some(span_id) = stack.pop() {
                records.push(TraceRecord::End(EndRecord {
                    sequence_no: next_seq(),
                    span_id,
                    outcome: SpanOutcome::Ok,
                    ts,
                    run_id: Some(run_id.clone()),
                    task_id: Some(TaskId(format!("t{task}"))),
                    duration_ms: None,
                }));
            }
        }
    }
    records
}

fn assert_nested(span: &SpanNode) {
    for child in &span.children {
        match child {
            Node::Span(child_span) => {
                let begin = child_span.begin.as_ref().unwrap();
                assert_eq!(begin.parent_span_id.as_ref(), Some(&span.span_id));
                assert_eq!(child_span.task_id, span.task_id);
                assert_nested(child_span);
            }
            Node::Event(event) => assert_eq!(event.task_id, span.task_id),
        }
    }
}

proptest! {
    #[test]
    fn prop_well_nested_traces_rebuild_parentage(
        ops in prop::collection::vec(op_strategy(), 0..80),
        close_all in any::<bool>(),
    ) {
        let records = build_trace(&ops, close_all);
        let begins = records.iter().filter(|r| matches!(r, TraceRecord::Begin(_))).count();
        let tree = ActionTree::reconstruct(records.clone());

        prop_assert_eq!(tree.inconsistent_count(), 0);
        prop_assert_eq!(tree.spans().len(), begins);
        if close_all {
            prop_assert_eq!(tree.open_span_count(), 0);
        }
        for root in &tree.roots {
            match root {
                Node::Span(span) => {
                    prop_assert!(span.begin.as_ref().unwrap().parent_span_id.is_none());
                    assert_nested(span);
                }
                Node::Event(_) => {}
            }
        }

        let mut sorted = records;
        sorted.sort_by_key(TraceRecord::sequence_no);
        prop_assert_eq!(tree.to_records(), sorted);
    }

    #[test]
    fn prop_record_order_does_not_matter(
        ops in prop::collection::vec(op_strategy(), 0..60),
        seed in any::<u64>(),
    ) {
        let records = build_trace(&ops, true);
        let mut shuffled = records.clone();
        // Deterministic shuffle keyed by the seed.
        shuffled.sort_by_key(|r| r.sequence_no().wrapping_mul(seed | 1).rotate_left(17));
        prop_assert_eq!(
            ActionTree::reconstruct(shuffled),
            ActionTree::reconstruct(records)
        );
    }
}
