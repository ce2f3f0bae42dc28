use std::sync::Arc;

use tracing::{error, info, warn};

use capsule_core::config::EngineConfig;
use capsule_core::error::{CapsuleError, Result};
use capsule_core::event::EventBus;
use capsule_core::graph::StepGraph;
use capsule_core::traits::RunStore;
use capsule_core::types::{LoggedEvent, RunEvent, RunId, RunRecord};
use capsule_tools::ToolRegistry;

use crate::aggregate;
use crate::gate::RunGate;
use crate::invoker::ToolInvoker;
use crate::scheduler::Scheduler;

/// Executes step graphs: gate, validate, schedule, aggregate, persist.
pub struct CapsuleEngine {
    tools: Arc<ToolRegistry>,
    gate: Arc<RunGate>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
    store: Option<Arc<dyn RunStore>>,
}

impl CapsuleEngine {
    pub fn new(tools: Arc<ToolRegistry>, config: EngineConfig) -> Self {
        Self {
            tools,
            gate: Arc::new(RunGate::new()),
            event_bus: Arc::new(EventBus::default()),
            config,
            store: None,
        }
    }

    /// Persist successful runs and merge the returned references into
    /// `RunRecord::artifacts`.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share a gate between engines.
    pub fn with_gate(mut self, gate: Arc<RunGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn gate(&self) -> &Arc<RunGate> {
        &self.gate
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Run `graph` once.
    ///
    /// A graph id that was submitted before fails with `ALREADY_USED`.
    /// Once past that check the id is marked used when this call returns,
    /// whether the run succeeded, failed, or the graph was invalid.
    ///
    /// A run that fails after scheduling starts still produces a record:
    /// it is persisted like a successful one and returned inside
    /// `CapsuleError::RunFailed`.
    pub async fn execute(&self, graph: &StepGraph) -> Result<RunRecord> {
        let _ticket = self.gate.begin(&graph.id)?;
        let run_id = RunId::new();

        if let Err(e) = graph.validate() {
            self.publish_failure(&run_id, graph, &e);
            return Err(e);
        }

        let invoker = ToolInvoker::new(self.tools.clone(), self.config.retry.clone().into());
        let scheduler = Scheduler::new(Arc::new(invoker), self.config.window.clone())
            .with_event_bus(self.event_bus.clone());
        let report = scheduler.run(graph, &run_id).await;

        if let Err(e) = report.outcome {
            let failed = self.publish_failure(&run_id, graph, &e);
            let mut record = aggregate::build_failed_record(
                graph,
                run_id,
                &report.outputs,
                report.events,
                &e,
            );
            record.logs.push(failed.to_string());
            record.events.push(LoggedEvent::now(failed));
            self.persist(&mut record).await;
            return Err(CapsuleError::RunFailed {
                record: Box::new(record),
                source: Box::new(e),
            });
        }

        let mut record =
            aggregate::build_record(graph, run_id.clone(), &report.outputs, report.events);
        let done = RunEvent::RunCompleted {
            run_id,
            graph_id: graph.id.clone(),
            citations: record.citations.len(),
        };
        record.logs.push(done.to_string());
        record.events.push(LoggedEvent::now(done.clone()));
        self.event_bus.publish(done);
        self.persist(&mut record).await;

        info!(
            run_id = %record.id,
            graph_id = %graph.id,
            citations = record.citations.len(),
            "Run completed"
        );
        Ok(record)
    }

    async fn persist(&self, record: &mut RunRecord) {
        let Some(store) = &self.store else {
            return;
        };
        match store.save(record).await {
            Ok(refs) => record.artifacts.extend(refs),
            Err(e) => warn!(run_id = %record.id, error = %e, "Failed to persist run"),
        }
    }

    fn publish_failure(&self, run_id: &RunId, graph: &StepGraph, e: &CapsuleError) -> RunEvent {
        error!(run_id = %run_id, graph_id = %graph.id, code = e.code(), error = %e, "Run failed");
        let event = RunEvent::RunFailed {
            run_id: run_id.clone(),
            graph_id: graph.id.clone(),
            code: e.code().to_string(),
            error: e.to_string(),
        };
        self.event_bus.publish(event.clone());
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileRunStore;
    use capsule_test_utils::{graph, tool_step, tool_step_as, ScriptedTool};
    use futures::future::BoxFuture;
    use serde_json::json;

    fn engine(tools: ToolRegistry) -> CapsuleEngine {
        CapsuleEngine::new(Arc::new(tools), EngineConfig::default())
    }

    struct FailingStore;

    impl RunStore for FailingStore {
        fn save<'a>(&'a self, _record: &'a RunRecord) -> BoxFuture<'a, Result<Vec<String>>> {
            Box::pin(async { Err(CapsuleError::Storage("read-only".into())) })
        }
    }

    #[tokio::test]
    async fn test_successful_run_then_reuse_is_rejected() {
        let mut tools = ToolRegistry::new();
        tools.register(ScriptedTool::ok("t", json!({"answer": 42})));
        let engine = engine(tools);
        let g = graph(
            "once",
            vec![tool_step_as("only", "t", json!({}), "final", &[])],
            &["t"],
        );

        let record = engine.execute(&g).await.unwrap();
        assert_eq!(record.output, json!({"answer": 42}));
        assert_eq!(record.capsule_id, "once");
        assert!(record.id.as_str().starts_with("run_"));
        assert!(record.logs.last().unwrap().starts_with("run:complete"));

        let err = engine.execute(&g).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_USED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_is_still_used() {
        let mut tools = ToolRegistry::new();
        tools.register(ScriptedTool::failing("t"));
        let engine = engine(tools);
        let g = graph("fails", vec![tool_step("x", "t", json!({}), &[])], &["t"]);

        let err = engine.execute(&g).await.unwrap_err();
        assert_eq!(err.code(), "TOOL_EXECUTION_FAILED");
        assert!(engine.gate().is_used("fails"));
        assert_eq!(
            engine.execute(&g).await.unwrap_err().code(),
            "ALREADY_USED"
        );
    }

    #[tokio::test]
    async fn test_invalid_graph_is_used_once_submitted() {
        let engine = engine(ToolRegistry::new());
        let mut g = graph("bad", vec![], &[]);
        g.one_shot = false;

        assert_eq!(engine.execute(&g).await.unwrap_err().code(), "INVALID_GRAPH");
        assert!(engine.gate().is_used("bad"));
    }

    #[tokio::test]
    async fn test_events_reach_the_bus_in_order() {
        let mut tools = ToolRegistry::new();
        tools.register(ScriptedTool::ok("t", json!(1)));
        let engine = engine(tools);
        let mut rx = engine.event_bus().subscribe();
        let g = graph("bus", vec![tool_step("x", "t", json!({}), &[])], &["t"]);

        let record = engine.execute(&g).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        let recorded: Vec<RunEvent> = record.events.into_iter().map(|e| e.event).collect();
        assert_eq!(seen, recorded);
        assert!(seen.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_store_failure_keeps_the_record() {
        let mut tools = ToolRegistry::new();
        tools.register(ScriptedTool::ok("t", json!(1)));
        let engine = engine(tools).with_store(Arc::new(FailingStore));
        let g = graph("store", vec![tool_step("x", "t", json!({}), &[])], &["t"]);

        let record = engine.execute(&g).await.unwrap();
        assert!(record.artifacts.is_empty());
        assert_eq!(record.output, json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_record_is_persisted() {
        let mut tools = ToolRegistry::new();
        tools.register(ScriptedTool::ok("up", json!({"v": 1})));
        tools.register(ScriptedTool::failing("down"));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileRunStore::new(dir.path()));
        let engine = engine(tools).with_store(store.clone());
        let g = graph(
            "half",
            vec![
                tool_step("a", "up", json!({}), &[]),
                tool_step("b", "down", json!({}), &["a"]),
            ],
            &["up", "down"],
        );

        let err = engine.execute(&g).await.unwrap_err();
        assert_eq!(err.code(), "TOOL_EXECUTION_FAILED");
        assert_eq!(err.step(), Some("b"));

        let record = err.run_record().expect("failed run carries its record");
        assert!(!record.is_success());
        assert_eq!(record.attempts_for("b"), 3);
        let count = |prefix: &str| record.logs.iter().filter(|l| l.starts_with(prefix)).count();
        assert_eq!(count("step:attempt id=b"), 3);
        assert_eq!(count("step:error id=b"), 3);
        assert!(record.logs.last().unwrap().starts_with("run:failed"));
        assert_eq!(record.artifacts.len(), 1);

        let saved: RunRecord =
            serde_json::from_str(&std::fs::read_to_string(store.run_path(record)).unwrap())
                .unwrap();
        assert_eq!(saved.logs, record.logs);
        let failure = saved.failure.unwrap();
        assert_eq!(failure.step_id.as_deref(), Some("b"));
        assert_eq!(failure.partial_outputs.get("a"), Some(&json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_failed_run_events_match_the_bus() {
        let engine = engine(ToolRegistry::new());
        let mut rx = engine.event_bus().subscribe();
        let g = graph("ghost", vec![tool_step("x", "ghost", json!({}), &[])], &["ghost"]);

        let err = engine.execute(&g).await.unwrap_err();
        let record = err.run_record().unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        let recorded: Vec<RunEvent> = record.events.iter().map(|e| e.event.clone()).collect();
        assert_eq!(seen, recorded);
    }

    #[tokio::test]
    async fn test_invalid_graph_has_no_record() {
        let engine = engine(ToolRegistry::new());
        let mut g = graph("bad_once", vec![], &[]);
        g.one_shot = false;
        assert!(engine.execute(&g).await.unwrap_err().run_record().is_none());
    }

    #[tokio::test]
    async fn test_shared_gate_spans_engines() {
        let gate = Arc::new(RunGate::new());
        let first = engine(ToolRegistry::new()).with_gate(gate.clone());
        let second = engine(ToolRegistry::new()).with_gate(gate);
        let g = graph("shared", vec![], &[]);

        assert!(first.execute(&g).await.is_ok());
        assert_eq!(second.execute(&g).await.unwrap_err().code(), "ALREADY_USED");
    }
}
