use thiserror::Error;

use crate::types::RunRecord;

#[derive(Debug, Error)]
pub enum CapsuleError {
    // Policy violations
    #[error("TOOL_NOT_ALLOWED: step {step} uses tool '{tool}' outside the allow-list")]
    ToolNotAllowed { step: String, tool: String },

    #[error("TOOL_NOT_IMPLEMENTED: no tool '{tool}' registered (step {step})")]
    ToolNotImplemented { step: String, tool: String },

    // Data-flow violations
    #[error("PLACEHOLDER_UNRESOLVED: {path}")]
    PlaceholderUnresolved { path: String },

    #[error("SYNTHESIS_SOURCE_MISSING: step {step} found no source among [{sources}]")]
    SynthesisSourceMissing { step: String, sources: String },

    #[error("SYNTHESIS_NO_EVIDENCE: every source of step {step} is empty")]
    SynthesisNoEvidence { step: String },

    // Transient tool failures
    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Reuse violations
    #[error("ALREADY_USED: graph {0} was already submitted")]
    AlreadyUsed(String),

    // Graph construction
    #[error("INVALID_GRAPH: {0}")]
    InvalidGraph(String),

    #[error("CYCLE_DETECTED: dependency cycle through step {step}")]
    CycleDetected { step: String },

    // Run-level
    #[error("step {step} failed after {attempts} attempt(s): {source}")]
    StepFailed {
        step: String,
        tool: Option<String>,
        attempts: u32,
        source: Box<CapsuleError>,
    },

    /// A scheduled run that stopped on `source`; `record` holds its log.
    #[error("{source}")]
    RunFailed {
        record: Box<RunRecord>,
        source: Box<CapsuleError>,
    },

    #[error("RUN_TIMEOUT: graph {graph} exceeded {timeout_ms}ms")]
    RunTimeout { graph: String, timeout_ms: u64 },

    #[error("Step task aborted: {0}")]
    StepAborted(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used for retry and propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Policy,
    DataFlow,
    Transient,
    Reuse,
    Graph,
    Timeout,
    Internal,
}

impl CapsuleError {
    /// Stable machine-readable code. `StepFailed` reports the code of its cause.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ToolNotAllowed { .. } => "TOOL_NOT_ALLOWED",
            Self::ToolNotImplemented { .. } => "TOOL_NOT_IMPLEMENTED",
            Self::PlaceholderUnresolved { .. } => "PLACEHOLDER_UNRESOLVED",
            Self::SynthesisSourceMissing { .. } => "SYNTHESIS_SOURCE_MISSING",
            Self::SynthesisNoEvidence { .. } => "SYNTHESIS_NO_EVIDENCE",
            Self::ToolExecution { .. } => "TOOL_EXECUTION_FAILED",
            Self::ToolTimeout { .. } => "TOOL_TIMEOUT",
            Self::ToolValidation(_) => "TOOL_INPUT_INVALID",
            Self::AlreadyUsed(_) => "ALREADY_USED",
            Self::InvalidGraph(_) => "INVALID_GRAPH",
            Self::CycleDetected { .. } => "CYCLE_DETECTED",
            Self::StepFailed { source, .. } | Self::RunFailed { source, .. } => source.code(),
            Self::RunTimeout { .. } => "RUN_TIMEOUT",
            Self::StepAborted(_) => "STEP_ABORTED",
            Self::Config(_) | Self::ConfigNotFound(_) => "CONFIG",
            Self::Storage(_) => "STORAGE",
            Self::Io(_) => "IO",
            Self::Json(_) => "JSON",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ToolNotAllowed { .. } | Self::ToolNotImplemented { .. } => ErrorKind::Policy,
            Self::PlaceholderUnresolved { .. }
            | Self::SynthesisSourceMissing { .. }
            | Self::SynthesisNoEvidence { .. } => ErrorKind::DataFlow,
            Self::ToolExecution { .. } | Self::ToolTimeout { .. } | Self::ToolValidation(_) => {
                ErrorKind::Transient
            }
            Self::AlreadyUsed(_) => ErrorKind::Reuse,
            Self::InvalidGraph(_) | Self::CycleDetected { .. } => ErrorKind::Graph,
            Self::StepFailed { source, .. } | Self::RunFailed { source, .. } => source.kind(),
            Self::RunTimeout { .. } => ErrorKind::Timeout,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether a failed tool call may be attempted again.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// The failing step id, when the error is tagged with one.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::RunFailed { source, .. } => source.step(),
            Self::StepFailed { step, .. }
            | Self::ToolNotAllowed { step, .. }
            | Self::ToolNotImplemented { step, .. }
            | Self::SynthesisSourceMissing { step, .. }
            | Self::SynthesisNoEvidence { step }
            | Self::CycleDetected { step } => Some(step),
            _ => None,
        }
    }

    /// Innermost cause, unwrapping `StepFailed` and `RunFailed`.
    pub fn root(&self) -> &CapsuleError {
        match self {
            Self::StepFailed { source, .. } | Self::RunFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// The record of the failed run, when the run got as far as scheduling.
    pub fn run_record(&self) -> Option<&RunRecord> {
        match self {
            Self::RunFailed { record, .. } => Some(record),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CapsuleError>;
