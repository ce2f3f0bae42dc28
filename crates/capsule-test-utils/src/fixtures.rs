use std::path::PathBuf;

use serde_json::{json, Value};

use capsule_core::graph::{
    EnvSpec, Step, StepGraph, SynthesisStyle, SynthesizeStep, ToolStep,
};

pub fn tool_step(id: &str, tool: &str, input: Value, depends_on: &[&str]) -> Step {
    Step::Tool(ToolStep {
        id: id.to_string(),
        description: String::new(),
        tool: tool.to_string(),
        input,
        save_as: None,
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
    })
}

/// Tool step writing to an explicit slot.
pub fn tool_step_as(
    id: &str,
    tool: &str,
    input: Value,
    save_as: &str,
    depends_on: &[&str],
) -> Step {
    Step::Tool(ToolStep {
        id: id.to_string(),
        description: String::new(),
        tool: tool.to_string(),
        input,
        save_as: Some(save_as.to_string()),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
    })
}

pub fn synth_step(id: &str, source: &str, objective: &str, depends_on: &[&str]) -> Step {
    Step::Synthesize(SynthesizeStep {
        id: id.to_string(),
        description: String::new(),
        source: source.to_string(),
        save_as: "draft".to_string(),
        objective: objective.to_string(),
        max_items: 3,
        style: SynthesisStyle::Bullet,
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
    })
}

/// One-shot graph allowing `allow`, with default limits.
pub fn graph(id: &str, steps: Vec<Step>, allow: &[&str]) -> StepGraph {
    StepGraph {
        id: id.to_string(),
        task_id: format!("task_{}", id),
        objective: "Test objective".to_string(),
        rationale: String::new(),
        step_plan: steps,
        io_schema: Value::Null,
        env_spec: EnvSpec {
            tools_allowlist: allow.iter().map(|s| s.to_string()).collect(),
            ..EnvSpec::default()
        },
        evidence_refs: Vec::new(),
        guardrails: serde_json::Map::new(),
        one_shot: true,
        created_at: chrono::Utc::now(),
    }
}

/// Evidence-card collection `{ "items": [...] }` with `n` cards.
pub fn evidence_items(n: usize) -> Value {
    let items: Vec<Value> = (1..=n)
        .map(|i| {
            json!({
                "id": format!("ev://kb/doc{}#p0?v=h{}", i, i),
                "title": format!("Doc {}", i),
                "summary": format!("Finding {}.", i),
            })
        })
        .collect();
    json!({ "items": items })
}

/// Evidence index JSON file with three records, in a fresh temp dir.
pub fn evidence_index_file() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.json");
    let records = json!([
        {"id": "retry", "collection": "kb", "hash": "a1", "title": "Retry policy",
         "text": "Tool calls are retried with exponential backoff."},
        {"id": "window", "collection": "kb", "hash": "b2", "title": "Concurrency window",
         "text": "The scheduler widens its window while the backlog grows."},
        {"id": "gate", "collection": "kb", "hash": "c3", "title": "Run gate",
         "summary": "Each graph runs at most once."}
    ]);
    std::fs::write(&path, records.to_string()).unwrap();
    (dir, path)
}
