use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use capsule_core::config::EngineConfig;
use capsule_core::graph::StepGraph;
use capsule_core::types::RunEvent;
use capsule_engine::{CapsuleEngine, FileRunStore, RunLogger};
use capsule_test_utils::{
    evidence_index_file, graph, synth_step, tool_step, tool_step_as, ProbeTool, ScriptedTool,
};
use capsule_tools::{EvidenceIndex, ToolRegistry};
use tokio_util::sync::CancellationToken;

fn engine(tools: ToolRegistry) -> CapsuleEngine {
    CapsuleEngine::new(Arc::new(tools), EngineConfig::default())
}

const TRANSLATED_GRAPH: &str = r#"{
    "id": "cap_retry_doc",
    "taskId": "task_42",
    "objective": "Explain how failing tool calls are handled",
    "rationale": "Two evidence queries, one draft, one pointer check",
    "stepPlan": [
        {"kind": "tool", "id": "collect_primary", "tool": "retrieve_evidence",
         "input": {"query": "retry", "topK": 4}},
        {"kind": "tool", "id": "collect_secondary", "tool": "retrieve_evidence",
         "input": {"query": "window", "topK": 4}},
        {"kind": "synthesize", "id": "draft_summary",
         "source": "collect_primary,collect_secondary",
         "objective": "Explain how failing tool calls are handled",
         "dependsOn": ["collect_primary", "collect_secondary"]},
        {"kind": "tool", "id": "validate_pointers", "tool": "render_with_pointers",
         "input": {"draft": "{{draft.draft}}"}, "saveAs": "final",
         "dependsOn": ["draft_summary"]}
    ],
    "ioSchema": {"input": {}, "output": {}},
    "envSpec": {
        "toolsAllowlist": ["retrieve_evidence", "render_with_pointers"],
        "timeoutMs": 60000,
        "cpuLimit": 1,
        "memMb": 1024,
        "maxParallel": 4,
        "volumes": [{"path": "/data", "mode": "ro"}]
    },
    "evidenceRefs": [],
    "guardrails": {"citationsRequired": true},
    "oneShot": true
}"#;

#[tokio::test]
async fn test_translated_graph_runs_end_to_end() {
    let (_index_dir, index_path) = evidence_index_file();
    let index = EvidenceIndex::load(&index_path, "external").await.unwrap();
    let tools = ToolRegistry::with_builtins(Some(Arc::new(index)));

    let artifacts = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    let engine = engine(tools).with_store(Arc::new(FileRunStore::new(artifacts.path())));

    let graph = StepGraph::from_json(TRANSLATED_GRAPH).unwrap();
    let rx = engine.event_bus().subscribe();
    let logger = tokio::spawn(RunLogger::new(logs.path().to_path_buf(), 3).run(
        rx,
        graph.id.clone(),
        CancellationToken::new(),
    ));

    let record = engine.execute(&graph).await.unwrap();

    assert_eq!(record.capsule_id, "cap_retry_doc");
    assert_eq!(record.output["ok"], true);
    let content = record.output["content"].as_str().unwrap();
    assert!(content.starts_with("## Explain how failing tool calls are handled\n\n- "));
    assert_eq!(
        record.citations,
        vec!["ev://kb/retry#p0?v=a1", "ev://kb/window#p0?v=b2"]
    );

    assert_eq!(record.artifacts.len(), 1);
    assert!(std::path::Path::new(&record.artifacts[0]).exists());

    tokio::time::timeout(Duration::from_secs(5), logger)
        .await
        .unwrap()
        .unwrap();
    let log_files: Vec<_> = std::fs::read_dir(logs.path().join("cap_retry_doc"))
        .unwrap()
        .collect();
    assert_eq!(log_files.len(), 1);
}

#[tokio::test]
async fn test_downstream_step_receives_upstream_value() {
    let probe = ProbeTool::new("echo", Duration::from_millis(1));
    let mut tools = ToolRegistry::new();
    tools.register(ScriptedTool::ok("lookup", json!({"value": 42})));
    tools.register(probe.clone());

    let g = graph(
        "a_then_b",
        vec![
            tool_step("a", "lookup", json!({}), &[]),
            tool_step("b", "echo", json!({"n": "{{a.value}}", "note": "a={{a.value}}"}), &["a"]),
        ],
        &["lookup", "echo"],
    );
    let record = engine(tools).execute(&g).await.unwrap();

    assert_eq!(
        probe.input_for("b").unwrap(),
        json!({"n": 42, "note": "a={{a.value}}"})
    );
    assert_eq!(record.output["echo"]["n"], 42);
}

#[tokio::test(start_paused = true)]
async fn test_independent_steps_respect_max_parallel() {
    let probe = ProbeTool::new("probe", Duration::from_millis(100));
    let mut tools = ToolRegistry::new();
    tools.register(probe.clone());

    let mut g = graph(
        "three_wide",
        vec![
            tool_step("x", "probe", json!({}), &[]),
            tool_step("y", "probe", json!({}), &[]),
            tool_step("z", "probe", json!({}), &[]),
        ],
        &["probe"],
    );
    g.env_spec.max_parallel = 2;

    let record = engine(tools).execute(&g).await.unwrap();
    assert!(probe.peak_concurrency() <= 2);
    assert_eq!(probe.finished().len(), 3);
    assert_eq!(record.output["step"], "z");
}

#[tokio::test(start_paused = true)]
async fn test_flaky_tool_succeeds_on_third_attempt() {
    let flaky = ScriptedTool::new("flaky", 2, json!({"items": []}));
    let mut tools = ToolRegistry::new();
    tools.register(flaky.clone());

    let g = graph("flaky_run", vec![tool_step("fetch", "flaky", json!({}), &[])], &["flaky"]);
    let record = engine(tools).execute(&g).await.unwrap();

    assert_eq!(record.attempts_for("fetch"), 3);
    assert_eq!(
        record
            .logs
            .iter()
            .filter(|l| l.starts_with("step:attempt id=fetch"))
            .count(),
        3
    );

    let calls = flaky.call_instants();
    assert_eq!(calls.len(), 3);
    assert!(calls[1] - calls[0] >= Duration::from_millis(100));
    assert!(calls[1] - calls[0] < Duration::from_millis(150));
    assert!(calls[2] - calls[1] >= Duration::from_millis(200));
    assert!(calls[2] - calls[1] < Duration::from_millis(250));
}

#[tokio::test]
async fn test_disallowed_tool_is_never_invoked() {
    let forbidden = ScriptedTool::ok("shell", json!("pwned"));
    let mut tools = ToolRegistry::new();
    tools.register(forbidden.clone());

    let g = graph("locked", vec![tool_step("x", "shell", json!({}), &[])], &["other"]);
    let err = engine(tools).execute(&g).await.unwrap_err();

    assert_eq!(err.code(), "TOOL_NOT_ALLOWED");
    assert_eq!(err.step(), Some("x"));
    assert_eq!(forbidden.invocations(), 0);
}

#[tokio::test]
async fn test_unregistered_tool_is_not_implemented() {
    let g = graph("ghost", vec![tool_step("x", "ghost", json!({}), &[])], &["ghost"]);
    let err = engine(ToolRegistry::new()).execute(&g).await.unwrap_err();
    assert_eq!(err.code(), "TOOL_NOT_IMPLEMENTED");
}

#[tokio::test]
async fn test_empty_synthesis_source_fails() {
    let mut tools = ToolRegistry::new();
    tools.register(ScriptedTool::ok("search", json!({"items": []})));

    let g = graph(
        "no_evidence",
        vec![
            tool_step("evidence", "search", json!({}), &[]),
            synth_step("summary", "evidence", "Summarise", &["evidence"]),
        ],
        &["search"],
    );
    let err = engine(tools).execute(&g).await.unwrap_err();
    assert_eq!(err.code(), "SYNTHESIS_NO_EVIDENCE");
    assert_eq!(err.step(), Some("summary"));

    let record = err.run_record().expect("failed run carries its record");
    let failure = record.failure.as_ref().unwrap();
    assert!(failure.partial_outputs.contains_key("evidence"));
    assert!(!failure.partial_outputs.contains_key("draft"));
    assert!(!record.events.iter().any(|e| matches!(
        &e.event,
        RunEvent::StepCompleted { step_id, .. } if step_id == "summary"
    )));
    assert!(record.output.is_null());
}

#[tokio::test]
async fn test_reuse_is_rejected_after_success_and_failure() {
    let mut tools = ToolRegistry::new();
    tools.register(ScriptedTool::ok("t", json!(1)));
    let engine = engine(tools);

    let ok = graph("ok", vec![tool_step("x", "t", json!({}), &[])], &["t"]);
    engine.execute(&ok).await.unwrap();
    assert_eq!(engine.execute(&ok).await.unwrap_err().code(), "ALREADY_USED");

    let bad = graph("bad", vec![tool_step("x", "t", json!({}), &[])], &[]);
    assert_eq!(engine.execute(&bad).await.unwrap_err().code(), "TOOL_NOT_ALLOWED");
    assert_eq!(engine.execute(&bad).await.unwrap_err().code(), "ALREADY_USED");
}

#[tokio::test]
async fn test_empty_graph_yields_null_output() {
    let record = engine(ToolRegistry::new())
        .execute(&graph("empty", vec![], &[]))
        .await
        .unwrap();
    assert!(record.output.is_null());
    assert!(record.citations.is_empty());
    assert!(record.artifacts.is_empty());
}

#[tokio::test]
async fn test_cyclic_graph_is_rejected_before_running() {
    let tool = ScriptedTool::ok("t", json!(1));
    let mut tools = ToolRegistry::new();
    tools.register(tool.clone());

    let g = graph(
        "loop",
        vec![
            tool_step("a", "t", json!({}), &["b"]),
            tool_step("b", "t", json!({}), &["a"]),
        ],
        &["t"],
    );
    let err = engine(tools).execute(&g).await.unwrap_err();
    assert_eq!(err.code(), "CYCLE_DETECTED");
    assert_eq!(tool.invocations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_deadline_surfaces_as_timeout() {
    let mut tools = ToolRegistry::new();
    tools.register(ProbeTool::new("sleepy", Duration::from_secs(20)));

    let mut g = graph("late", vec![tool_step("x", "sleepy", json!({}), &[])], &["sleepy"]);
    g.env_spec.timeout_ms = 1_000;

    let engine = engine(tools);
    let mut rx = engine.event_bus().subscribe();
    let err = engine.execute(&g).await.unwrap_err();
    assert_eq!(err.code(), "RUN_TIMEOUT");

    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        last = Some(event);
    }
    assert!(matches!(last, Some(RunEvent::RunFailed { code, .. }) if code == "RUN_TIMEOUT"));
}

#[tokio::test]
async fn test_final_slot_citations_come_from_text() {
    let mut tools = ToolRegistry::new();
    tools.register(ScriptedTool::ok(
        "writer",
        json!({"content": "Claim [ref:ev://kb/a#p0?v=1]; again ev://kb/a#p0?v=1"}),
    ));

    let g = graph(
        "text_cites",
        vec![tool_step_as("w", "writer", json!({}), "final", &[])],
        &["writer"],
    );
    let record = engine(tools).execute(&g).await.unwrap();
    assert_eq!(record.citations, vec!["ev://kb/a#p0?v=1"]);
}
