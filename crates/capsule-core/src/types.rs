use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::StepKind;

/// Unique run identifier (`run_<uuid>`).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(format!("run_{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub graph_id: String,
    pub step_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Structured event emitted by the scheduler for every notable transition.
///
/// Downstream consumers (reflection, run logs) read these instead of
/// matching on log text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        graph_id: String,
        steps: usize,
    },
    StepStarted {
        step_id: String,
        kind: StepKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },
    AttemptStarted {
        step_id: String,
        tool: String,
        attempt: u32,
    },
    AttemptSucceeded {
        step_id: String,
        tool: String,
        attempt: u32,
        elapsed_ms: u64,
    },
    AttemptFailed {
        step_id: String,
        tool: String,
        attempt: u32,
        error: String,
        /// Backoff before the next attempt; `None` when no retry follows.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_in_ms: Option<u64>,
    },
    StepCompleted {
        step_id: String,
        kind: StepKind,
        slot: String,
        elapsed_ms: u64,
    },
    StepFailed {
        step_id: String,
        kind: StepKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
        code: String,
        error: String,
    },
    SlotOverwritten {
        slot: String,
        step_id: String,
    },
    WindowAdjusted {
        from: usize,
        to: usize,
        avg_ms: u64,
        queue_depth: usize,
    },
    RunCompleted {
        run_id: RunId,
        graph_id: String,
        citations: usize,
    },
    RunFailed {
        run_id: RunId,
        graph_id: String,
        code: String,
        error: String,
    },
}

impl RunEvent {
    /// Step the event belongs to, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step_id, .. }
            | Self::AttemptStarted { step_id, .. }
            | Self::AttemptSucceeded { step_id, .. }
            | Self::AttemptFailed { step_id, .. }
            | Self::StepCompleted { step_id, .. }
            | Self::StepFailed { step_id, .. }
            | Self::SlotOverwritten { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted { .. } | Self::RunFailed { .. })
    }
}

/// Human-readable log line, one per event.
impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunStarted {
                run_id,
                graph_id,
                steps,
            } => write!(f, "run:start run={} graph={} steps={}", run_id, graph_id, steps),
            Self::StepStarted { step_id, kind, tool } => match tool {
                Some(tool) => write!(f, "step:start id={} kind={} tool={}", step_id, kind, tool),
                None => write!(f, "step:start id={} kind={}", step_id, kind),
            },
            Self::AttemptStarted {
                step_id,
                tool,
                attempt,
            } => write!(f, "step:attempt id={} tool={} n={}", step_id, tool, attempt),
            Self::AttemptSucceeded {
                step_id,
                tool,
                attempt,
                elapsed_ms,
            } => write!(
                f,
                "step:ok id={} tool={} n={} elapsed_ms={}",
                step_id, tool, attempt, elapsed_ms
            ),
            Self::AttemptFailed {
                step_id,
                tool,
                attempt,
                error,
                retry_in_ms,
            } => {
                write!(f, "step:error id={} tool={} n={}", step_id, tool, attempt)?;
                if let Some(ms) = retry_in_ms {
                    write!(f, " retry_in_ms={}", ms)?;
                }
                write!(f, " error={}", error)
            }
            Self::StepCompleted {
                step_id,
                kind,
                slot,
                elapsed_ms,
            } => write!(
                f,
                "step:done id={} kind={} slot={} elapsed_ms={}",
                step_id, kind, slot, elapsed_ms
            ),
            Self::StepFailed {
                step_id,
                kind,
                tool,
                code,
                error,
            } => {
                write!(f, "step:failed id={} kind={}", step_id, kind)?;
                if let Some(tool) = tool {
                    write!(f, " tool={}", tool)?;
                }
                write!(f, " code={} error={}", code, error)
            }
            Self::SlotOverwritten { slot, step_id } => {
                write!(f, "output:overwrite slot={} by={}", slot, step_id)
            }
            Self::WindowAdjusted {
                from,
                to,
                avg_ms,
                queue_depth,
            } => write!(
                f,
                "window:adjust from={} to={} avg_ms={} queue={}",
                from, to, avg_ms, queue_depth
            ),
            Self::RunCompleted {
                run_id,
                graph_id,
                citations,
            } => write!(
                f,
                "run:complete run={} graph={} citations={}",
                run_id, graph_id, citations
            ),
            Self::RunFailed {
                run_id,
                graph_id,
                code,
                error,
            } => write!(
                f,
                "run:failed run={} graph={} code={} error={}",
                run_id, graph_id, code, error
            ),
        }
    }
}

/// An event with the wall-clock instant it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

impl LoggedEvent {
    pub fn now(event: RunEvent) -> Self {
        Self {
            at: Utc::now(),
            event,
        }
    }
}

/// Outcome of one graph execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: RunId,
    /// Id of the graph that produced this run.
    pub capsule_id: String,
    pub output: serde_json::Value,
    pub citations: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub events: Vec<LoggedEvent>,
    pub created_at: DateTime<Utc>,
    /// Set when the run stopped on an error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

/// Why a run stopped, and what it had produced by then.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Slots written before the failure.
    #[serde(default)]
    pub partial_outputs: serde_json::Map<String, serde_json::Value>,
}

impl RunRecord {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Attempt-start events recorded for a step.
    pub fn attempts_for(&self, step_id: &str) -> usize {
        self.events
            .iter()
            .filter(|e| {
                matches!(&e.event, RunEvent::AttemptStarted { step_id: s, .. } if s == step_id)
            })
            .count()
    }
}
