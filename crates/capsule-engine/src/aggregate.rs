use chrono::Utc;
use serde_json::Value;

use capsule_core::error::CapsuleError;
use capsule_core::graph::StepGraph;
use capsule_core::types::{LoggedEvent, RunFailure, RunId, RunRecord};
use capsule_tools::pointer::scan_pointers;

use crate::output::OutputTable;

/// Slot that, when written, is the run's output.
pub const FINAL_SLOT: &str = "final";

/// The run's output: slot `final`, else the slot of the last declared step.
pub fn select_output(graph: &StepGraph, table: &OutputTable) -> Value {
    if let Some(value) = table.get(FINAL_SLOT) {
        return value.clone();
    }
    graph
        .step_plan
        .last()
        .and_then(|step| table.get(step.output_slot()))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Citations of an output, deduplicated in first-seen order.
///
/// An explicit top-level `citations` array wins; otherwise pointer tokens
/// are scanned from every string in the output, nested ones included.
pub fn collect_citations(output: &Value) -> Vec<String> {
    let mut raw = Vec::new();
    match output.get("citations").and_then(Value::as_array) {
        Some(list) => raw.extend(list.iter().filter_map(Value::as_str).map(str::to_string)),
        None => scan_text(output, &mut raw),
    }

    let mut citations: Vec<String> = Vec::with_capacity(raw.len());
    for c in raw {
        if !citations.contains(&c) {
            citations.push(c);
        }
    }
    citations
}

fn scan_text(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.extend(scan_pointers(s)),
        Value::Array(items) => items.iter().for_each(|v| scan_text(v, out)),
        Value::Object(map) => map.values().for_each(|v| scan_text(v, out)),
        _ => {}
    }
}

/// Assemble the record of a successful run.
pub fn build_record(
    graph: &StepGraph,
    run_id: RunId,
    table: &OutputTable,
    events: Vec<LoggedEvent>,
) -> RunRecord {
    let output = select_output(graph, table);
    let citations = collect_citations(&output);
    let logs = events.iter().map(|e| e.event.to_string()).collect();
    RunRecord {
        id: run_id,
        capsule_id: graph.id.clone(),
        output,
        citations,
        artifacts: Vec::new(),
        logs,
        events,
        created_at: Utc::now(),
        failure: None,
    }
}

/// Assemble the record of a run that stopped on `error`.
///
/// The output stays null; slots written before the failure are kept on
/// `RunRecord::failure`.
pub fn build_failed_record(
    graph: &StepGraph,
    run_id: RunId,
    table: &OutputTable,
    events: Vec<LoggedEvent>,
    error: &CapsuleError,
) -> RunRecord {
    let logs = events.iter().map(|e| e.event.to_string()).collect();
    let partial_outputs = table
        .iter()
        .map(|(slot, value)| (slot.to_string(), value.clone()))
        .collect();
    RunRecord {
        id: run_id,
        capsule_id: graph.id.clone(),
        output: Value::Null,
        citations: Vec::new(),
        artifacts: Vec::new(),
        logs,
        events,
        created_at: Utc::now(),
        failure: Some(RunFailure {
            code: error.code().to_string(),
            message: error.to_string(),
            step_id: error.step().map(str::to_string),
            partial_outputs,
        }),
    }
}
