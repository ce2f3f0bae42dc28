//! Compiled step graph ("capsule") model.
//!
//! A `StepGraph` is produced by an upstream translator and executed at most
//! once. The wire shape (camelCase fields, `kind`-tagged steps) matches the
//! JSON the translator emits.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CapsuleError, Result};

/// A compiled, immutable plan of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepGraph {
    pub id: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub step_plan: Vec<Step>,
    #[serde(default)]
    pub io_schema: serde_json::Value,
    #[serde(default)]
    pub env_spec: EnvSpec,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
    /// Free-form policy flags, carried through untouched.
    #[serde(default)]
    pub guardrails: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_one_shot")]
    pub one_shot: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_one_shot() -> bool { true }

/// Execution environment limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvSpec {
    #[serde(default)]
    pub network_whitelist: Vec<String>,
    #[serde(default)]
    pub tools_allowlist: Vec<String>,
    /// Per-run deadline, enforced by the scheduler.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// CPU budget; doubles as the lower bound of the concurrency window.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default = "default_mem_mb")]
    pub mem_mb: u64,
    /// Upper bound of the concurrency window.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
}

fn default_timeout_ms() -> u64 { 60_000 }
fn default_cpu_limit() -> f64 { 1.0 }
fn default_mem_mb() -> u64 { 1024 }
fn default_max_parallel() -> usize { 4 }

impl Default for EnvSpec {
    fn default() -> Self {
        Self {
            network_whitelist: Vec::new(),
            tools_allowlist: Vec::new(),
            timeout_ms: default_timeout_ms(),
            cpu_limit: default_cpu_limit(),
            mem_mb: default_mem_mb(),
            max_parallel: default_max_parallel(),
            volumes: Vec::new(),
        }
    }
}

impl EnvSpec {
    pub fn is_tool_allowed(&self, tool: &str) -> bool {
        self.tools_allowlist.iter().any(|t| t == tool)
    }

    /// `(floor, ceiling)` of the concurrency window.
    ///
    /// The ceiling is at least 1; the floor is the CPU budget rounded up and
    /// clamped into `1..=ceiling`.
    pub fn window_bounds(&self) -> (usize, usize) {
        let ceiling = self.max_parallel.max(1);
        let cpu = if self.cpu_limit.is_finite() && self.cpu_limit > 0.0 {
            self.cpu_limit.ceil() as usize
        } else {
            1
        };
        (cpu.clamp(1, ceiling), ceiling)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeMount {
    pub path: String,
    #[serde(default)]
    pub mode: VolumeMode,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeMode {
    #[default]
    Ro,
    Rw,
}

/// One unit of work in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Step {
    Tool(ToolStep),
    Synthesize(SynthesizeStep),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStep {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub tool: String,
    /// May contain whole-string `{{slot.path}}` tokens.
    #[serde(default = "empty_object")]
    pub input: serde_json::Value,
    #[serde(default)]
    pub save_as: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizeStep {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Comma-separated output slot names.
    pub source: String,
    #[serde(default = "default_draft_slot")]
    pub save_as: String,
    pub objective: String,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default)]
    pub style: SynthesisStyle,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_draft_slot() -> String { "draft".to_string() }
fn default_max_items() -> usize { 3 }

impl SynthesizeStep {
    pub fn sources(&self) -> Vec<&str> {
        self.source
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisStyle {
    #[default]
    Bullet,
    Paragraph,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Tool,
    Synthesize,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tool => write!(f, "tool"),
            Self::Synthesize => write!(f, "synthesize"),
        }
    }
}

impl Step {
    pub fn id(&self) -> &str {
        match self {
            Self::Tool(s) => &s.id,
            Self::Synthesize(s) => &s.id,
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Self::Tool(_) => StepKind::Tool,
            Self::Synthesize(_) => StepKind::Synthesize,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Tool(s) => &s.description,
            Self::Synthesize(s) => &s.description,
        }
    }

    pub fn depends_on(&self) -> &[String] {
        match self {
            Self::Tool(s) => &s.depends_on,
            Self::Synthesize(s) => &s.depends_on,
        }
    }

    /// Output slot the step writes to. Tool steps default to their id.
    pub fn output_slot(&self) -> &str {
        match self {
            Self::Tool(s) => s.save_as.as_deref().unwrap_or(&s.id),
            Self::Synthesize(s) => &s.save_as,
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::Tool(s) => Some(&s.tool),
            Self::Synthesize(_) => None,
        }
    }
}

impl StepGraph {
    /// Parse a graph from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let graph: StepGraph = serde_json::from_str(json)?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.step_plan.iter().find(|s| s.id() == id)
    }

    /// Check the structural invariants the scheduler relies on: unique ids,
    /// in-graph dependencies, bounded `maxItems`, `oneShot`, and acyclicity.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CapsuleError::InvalidGraph("graph id is empty".into()));
        }
        if !self.one_shot {
            return Err(CapsuleError::InvalidGraph(format!(
                "graph {} is not one-shot",
                self.id
            )));
        }

        let mut ids = HashSet::new();
        for step in &self.step_plan {
            if step.id().is_empty() {
                return Err(CapsuleError::InvalidGraph("step with empty id".into()));
            }
            if !ids.insert(step.id()) {
                return Err(CapsuleError::InvalidGraph(format!(
                    "duplicate step id '{}'",
                    step.id()
                )));
            }
        }

        for step in &self.step_plan {
            for dep in step.depends_on() {
                if !ids.contains(dep.as_str()) {
                    return Err(CapsuleError::InvalidGraph(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id(),
                        dep
                    )));
                }
            }
            if let Step::Synthesize(s) = step {
                if !(1..=10).contains(&s.max_items) {
                    return Err(CapsuleError::InvalidGraph(format!(
                        "step '{}' maxItems must be within 1..=10, got {}",
                        s.id, s.max_items
                    )));
                }
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm; any step left unvisited sits on (or behind) a cycle.
    fn check_acyclic(&self) -> Result<()> {
        let mut indegree: HashMap<&str, usize> = self
            .step_plan
            .iter()
            .map(|s| (s.id(), s.depends_on().len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.step_plan {
            for dep in step.depends_on() {
                dependents.entry(dep.as_str()).or_default().push(step.id());
            }
        }

        let mut queue: VecDeque<&str> = self
            .step_plan
            .iter()
            .filter(|s| s.depends_on().is_empty())
            .map(|s| s.id())
            .collect();
        let mut visited = 0usize;

        while let Some(id) = queue.pop_front() {
            visited += 1;
            for next in dependents.get(id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }

        if visited == self.step_plan.len() {
            return Ok(());
        }
        let stuck = self
            .step_plan
            .iter()
            .find(|s| indegree.get(s.id()).copied().unwrap_or(0) > 0)
            .map(|s| s.id().to_string())
            .unwrap_or_default();
        Err(CapsuleError::CycleDetected { step: stuck })
    }
}
