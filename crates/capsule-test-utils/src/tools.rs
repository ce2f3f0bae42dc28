use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::time::Instant;

use capsule_core::error::{CapsuleError, Result};
use capsule_core::traits::Tool;
use capsule_core::types::ToolContext;

/// Tool that fails a fixed number of times, then returns a fixed output.
///
/// Clones share state, so a test can keep one handle and register another.
#[derive(Clone)]
pub struct ScriptedTool {
    name: String,
    failures: usize,
    output: Value,
    calls: Arc<Mutex<Vec<Instant>>>,
}

impl ScriptedTool {
    pub fn new(name: &str, failures: usize, output: Value) -> Self {
        Self {
            name: name.to_string(),
            failures,
            output,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always succeeds.
    pub fn ok(name: &str, output: Value) -> Self {
        Self::new(name, 0, output)
    }

    /// Never succeeds.
    pub fn failing(name: &str) -> Self {
        Self::new(name, usize::MAX, Value::Null)
    }

    pub fn invocations(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Instants at which each call started.
    pub fn call_instants(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted test tool"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn execute(&self, _input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(Instant::now());
                calls.len()
            };
            if call <= self.failures {
                return Err(CapsuleError::ToolExecution {
                    tool: self.name.clone(),
                    message: format!("scripted failure {}", call),
                });
            }
            Ok(self.output.clone())
        })
    }
}

/// Tool that sleeps, then echoes its input, recording concurrency.
#[derive(Clone)]
pub struct ProbeTool {
    name: String,
    delay: Duration,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    started: Arc<Mutex<Vec<String>>>,
    finished: Arc<Mutex<Vec<String>>>,
    inputs: Arc<Mutex<Vec<(String, Value)>>>,
}

impl ProbeTool {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            started: Arc::new(Mutex::new(Vec::new())),
            finished: Arc::new(Mutex::new(Vec::new())),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Highest number of calls observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Step ids in the order their calls started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Step ids in the order their calls finished.
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }

    /// Resolved input received by a step's call.
    pub fn input_for(&self, step_id: &str) -> Option<Value> {
        self.inputs
            .lock()
            .unwrap()
            .iter()
            .find(|(s, _)| s == step_id)
            .map(|(_, v)| v.clone())
    }
}

impl Tool for ProbeTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Concurrency probe"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.started.lock().unwrap().push(ctx.step_id.clone());
            self.inputs
                .lock()
                .unwrap()
                .push((ctx.step_id.clone(), input.clone()));

            tokio::time::sleep(self.delay).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.finished.lock().unwrap().push(ctx.step_id.clone());
            Ok(json!({ "step": ctx.step_id, "echo": input }))
        })
    }
}
