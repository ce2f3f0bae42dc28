//! Dependency-driven execution of a step graph.
//!
//! A single coordinator owns the output table, the ready queue, the
//! dependency bookkeeping and the event log. Step bodies run as tasks in a
//! `JoinSet` and report back through their join result and an event channel;
//! they never touch coordinator state. Events are recorded as they arrive,
//! ahead of any completion that is ready at the same time.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use indexmap::{IndexMap, IndexSet};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use capsule_core::config::WindowConfig;
use capsule_core::error::{CapsuleError, Result};
use capsule_core::event::EventBus;
use capsule_core::graph::{Step, StepGraph};
use capsule_core::types::{LoggedEvent, RunEvent, RunId, ToolContext};

use crate::invoker::{EventSink, ToolInvoker};
use crate::output::OutputTable;
use crate::synthesis;
use crate::template;
use crate::window::ConcurrencyWindow;

/// Everything a run produced, whether or not it succeeded.
#[derive(Debug)]
pub struct ScheduleReport {
    pub outputs: OutputTable,
    pub events: Vec<LoggedEvent>,
    /// First terminal failure, if any.
    pub outcome: Result<()>,
}

pub struct Scheduler {
    invoker: Arc<ToolInvoker>,
    window: WindowConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl Scheduler {
    pub fn new(invoker: Arc<ToolInvoker>, window: WindowConfig) -> Self {
        Self {
            invoker,
            window,
            event_bus: None,
        }
    }

    /// Also publish every recorded event on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Run `graph` to completion, first failure, or its deadline.
    ///
    /// The graph must already be validated; cycles would leave steps
    /// pending forever and are rejected by `StepGraph::validate`.
    pub async fn run(&self, graph: &StepGraph, run_id: &RunId) -> ScheduleReport {
        Coordinator::new(self, graph, run_id.clone()).drive().await
    }
}

struct StepOutcome {
    step_id: String,
    result: Result<serde_json::Value>,
    attempts: u32,
    elapsed: Duration,
}

struct Coordinator<'g> {
    graph: &'g StepGraph,
    run_id: RunId,
    invoker: Arc<ToolInvoker>,
    event_bus: Option<Arc<EventBus>>,

    table: OutputTable,
    log: Vec<LoggedEvent>,
    /// Unfinished dependencies of every step not yet launched.
    waiting_on: IndexMap<String, IndexSet<String>>,
    /// Reverse edges: step -> steps that depend on it.
    dependents: IndexMap<String, Vec<String>>,
    ready: VecDeque<String>,
    window: ConcurrencyWindow,
    tasks: JoinSet<StepOutcome>,
    events_tx: EventSink,
    events_rx: mpsc::UnboundedReceiver<LoggedEvent>,
    failure: Option<CapsuleError>,
}

impl<'g> Coordinator<'g> {
    fn new(scheduler: &Scheduler, graph: &'g StepGraph, run_id: RunId) -> Self {
        let mut waiting_on: IndexMap<String, IndexSet<String>> = IndexMap::new();
        let mut dependents: IndexMap<String, Vec<String>> = IndexMap::new();
        let mut ready = VecDeque::new();

        for step in &graph.step_plan {
            let deps: IndexSet<String> = step.depends_on().iter().cloned().collect();
            for dep in &deps {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(step.id().to_string());
            }
            if deps.is_empty() {
                ready.push_back(step.id().to_string());
            } else {
                waiting_on.insert(step.id().to_string(), deps);
            }
        }

        let (floor, ceiling) = graph.env_spec.window_bounds();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            graph,
            run_id,
            invoker: scheduler.invoker.clone(),
            event_bus: scheduler.event_bus.clone(),
            table: OutputTable::new(),
            log: Vec::new(),
            waiting_on,
            dependents,
            ready,
            window: ConcurrencyWindow::new(floor, ceiling, scheduler.window.clone()),
            tasks: JoinSet::new(),
            events_tx,
            events_rx,
            failure: None,
        }
    }

    async fn drive(mut self) -> ScheduleReport {
        self.record(RunEvent::RunStarted {
            run_id: self.run_id.clone(),
            graph_id: self.graph.id.clone(),
            steps: self.graph.step_plan.len(),
        });
        info!(
            run_id = %self.run_id,
            graph_id = %self.graph.id,
            steps = self.graph.step_plan.len(),
            window = self.window.current(),
            "Run started"
        );

        let timeout_ms = self.graph.env_spec.timeout_ms;
        let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
        tokio::pin!(deadline);

        loop {
            self.launch_ready();
            if self.tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = &mut deadline => {
                    warn!(graph_id = %self.graph.id, timeout_ms, in_flight = self.tasks.len(), "Run deadline expired");
                    self.tasks.shutdown().await;
                    self.drain_events();
                    if self.failure.is_none() {
                        self.failure = Some(CapsuleError::RunTimeout {
                            graph: self.graph.id.clone(),
                            timeout_ms,
                        });
                    }
                    break;
                }
                Some(event) = self.events_rx.recv() => self.push(event),
                Some(joined) = self.tasks.join_next() => {
                    self.drain_events();
                    match joined {
                        Ok(outcome) => self.settle(outcome),
                        Err(e) => {
                            warn!(error = %e, "Step task did not complete");
                            if self.failure.is_none() {
                                self.failure = Some(CapsuleError::StepAborted(e.to_string()));
                            }
                        }
                    }
                }
            }
        }

        self.drain_events();
        ScheduleReport {
            outputs: self.table,
            events: self.log,
            outcome: match self.failure {
                Some(e) => Err(e),
                None => Ok(()),
            },
        }
    }

    /// Start ready steps while the window has room. Nothing new starts once
    /// a step has failed.
    fn launch_ready(&mut self) {
        while self.failure.is_none() && self.tasks.len() < self.window.current() {
            let Some(step_id) = self.ready.pop_front() else {
                break;
            };
            self.launch(&step_id);
        }
    }

    fn launch(&mut self, step_id: &str) {
        let graph = self.graph;
        let Some(step) = graph.step(step_id) else {
            return;
        };

        self.record(RunEvent::StepStarted {
            step_id: step_id.to_string(),
            kind: step.kind(),
            tool: step.tool_name().map(str::to_string),
        });
        debug!(step_id, kind = %step.kind(), "Step launched");

        match step {
            Step::Tool(tool_step) => {
                if let Err(e) = self.invoker.preflight(tool_step, &graph.env_spec) {
                    self.fail(step, e, 0);
                    return;
                }
                let input = match template::resolve(&tool_step.input, &self.table) {
                    Ok(input) => input,
                    Err(e) => {
                        self.fail(step, e, 0);
                        return;
                    }
                };

                let invoker = self.invoker.clone();
                let sink = self.events_tx.clone();
                let tool_step = tool_step.clone();
                let ctx = ToolContext {
                    run_id: self.run_id.clone(),
                    graph_id: graph.id.clone(),
                    step_id: step_id.to_string(),
                    attempt: 0,
                };
                self.spawn(step_id, async move {
                    let invocation = invoker.invoke(&tool_step, input, ctx, &sink).await;
                    (invocation.result, invocation.attempts)
                });
            }
            Step::Synthesize(synth) => {
                let sources: Vec<(String, Option<serde_json::Value>)> = synth
                    .sources()
                    .into_iter()
                    .map(|name| (name.to_string(), self.table.get(name).cloned()))
                    .collect();
                let synth = synth.clone();
                self.spawn(step_id, async move {
                    (synthesis::evaluate(&synth, &sources), 1)
                });
            }
        }
    }

    fn spawn<F>(&mut self, step_id: &str, body: F)
    where
        F: Future<Output = (Result<serde_json::Value>, u32)> + Send + 'static,
    {
        let step_id = step_id.to_string();
        self.tasks.spawn(async move {
            let started = Instant::now();
            let (result, attempts) = match AssertUnwindSafe(body).catch_unwind().await {
                Ok(out) => out,
                Err(_) => (
                    Err(CapsuleError::StepAborted(format!("step {} panicked", step_id))),
                    0,
                ),
            };
            StepOutcome {
                step_id,
                result,
                attempts,
                elapsed: started.elapsed(),
            }
        });
    }

    fn settle(&mut self, outcome: StepOutcome) {
        let graph = self.graph;
        let Some(step) = graph.step(&outcome.step_id) else {
            return;
        };
        let elapsed_ms = outcome.elapsed.as_millis() as u64;

        match outcome.result {
            Ok(value) => {
                let slot = step.output_slot().to_string();
                if self.table.insert(slot.clone(), value) {
                    debug!(slot = %slot, step_id = %outcome.step_id, "Output slot overwritten");
                    self.record(RunEvent::SlotOverwritten {
                        slot: slot.clone(),
                        step_id: outcome.step_id.clone(),
                    });
                }
                self.record(RunEvent::StepCompleted {
                    step_id: outcome.step_id.clone(),
                    kind: step.kind(),
                    slot,
                    elapsed_ms,
                });
                self.unblock(&outcome.step_id);
            }
            Err(e) => self.fail(step, e, outcome.attempts),
        }

        if let Some(adj) = self.window.observe(elapsed_ms, self.ready.len()) {
            debug!(from = adj.from, to = adj.to, avg_ms = adj.avg_ms, "Concurrency window adjusted");
            self.record(RunEvent::WindowAdjusted {
                from: adj.from,
                to: adj.to,
                avg_ms: adj.avg_ms,
                queue_depth: self.ready.len(),
            });
        }
    }

    fn unblock(&mut self, finished: &str) {
        let Some(dependents) = self.dependents.get(finished) else {
            return;
        };
        for dependent in dependents {
            if let Some(deps) = self.waiting_on.get_mut(dependent) {
                deps.shift_remove(finished);
                if deps.is_empty() {
                    self.waiting_on.shift_remove(dependent);
                    self.ready.push_back(dependent.clone());
                }
            }
        }
    }

    fn fail(&mut self, step: &Step, error: CapsuleError, attempts: u32) {
        warn!(
            step_id = %step.id(),
            tool = step.tool_name().unwrap_or("-"),
            attempts,
            code = error.code(),
            error = %error,
            "Step failed"
        );
        self.record(RunEvent::StepFailed {
            step_id: step.id().to_string(),
            kind: step.kind(),
            tool: step.tool_name().map(str::to_string),
            code: error.code().to_string(),
            error: error.to_string(),
        });
        if self.failure.is_none() {
            self.failure = Some(CapsuleError::StepFailed {
                step: step.id().to_string(),
                tool: step.tool_name().map(str::to_string),
                attempts,
                source: Box::new(error),
            });
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.push(event);
        }
    }

    fn record(&mut self, event: RunEvent) {
        self.push(LoggedEvent::now(event));
    }

    fn push(&mut self, logged: LoggedEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(logged.event.clone());
        }
        self.log.push(logged);
    }
}
