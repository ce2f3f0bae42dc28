use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use capsule_core::config::RetryConfig;
use capsule_core::error::{CapsuleError, ErrorKind, Result};
use capsule_core::graph::{EnvSpec, ToolStep};
use capsule_core::types::{LoggedEvent, RunEvent, ToolContext};
use capsule_tools::ToolRegistry;

/// Channel step bodies use to report events to the coordinator.
pub type EventSink = mpsc::UnboundedSender<LoggedEvent>;

pub(crate) fn emit(sink: &EventSink, event: RunEvent) {
    // Closed only once the run has been torn down.
    let _ = sink.send(LoggedEvent::now(event));
}

/// Attempt budget and exponential backoff for tool calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `initial * 2^(attempt-1)`,
    /// capped at `max_backoff_ms`. No jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

/// Result of running one tool step to completion or exhaustion.
#[derive(Debug)]
pub struct Invocation {
    pub result: Result<serde_json::Value>,
    /// Calls actually made; zero when a precondition failed.
    pub attempts: u32,
}

/// Runs tool steps against the registry with allow-list checks and retries.
pub struct ToolInvoker {
    tools: Arc<ToolRegistry>,
    policy: RetryPolicy,
}

impl ToolInvoker {
    pub fn new(tools: Arc<ToolRegistry>, policy: RetryPolicy) -> Self {
        Self { tools, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Policy checks made before any input is resolved or any call is made.
    pub fn preflight(&self, step: &ToolStep, env: &EnvSpec) -> Result<()> {
        if !env.is_tool_allowed(&step.tool) {
            return Err(CapsuleError::ToolNotAllowed {
                step: step.id.clone(),
                tool: step.tool.clone(),
            });
        }
        if self.tools.get(&step.tool).is_none() {
            return Err(CapsuleError::ToolNotImplemented {
                step: step.id.clone(),
                tool: step.tool.clone(),
            });
        }
        Ok(())
    }

    /// Call the step's tool with already resolved input, retrying failures.
    pub async fn invoke(
        &self,
        step: &ToolStep,
        input: serde_json::Value,
        ctx: ToolContext,
        sink: &EventSink,
    ) -> Invocation {
        let mut attempt = 0;
        loop {
            attempt += 1;
            emit(
                sink,
                RunEvent::AttemptStarted {
                    step_id: step.id.clone(),
                    tool: step.tool.clone(),
                    attempt,
                },
            );

            let started = Instant::now();
            let call_ctx = ToolContext {
                attempt,
                ..ctx.clone()
            };
            let error = match self.tools.execute(&step.tool, input.clone(), call_ctx).await {
                Ok(value) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    debug!(step_id = %step.id, tool = %step.tool, attempt, elapsed_ms, "Tool call succeeded");
                    emit(
                        sink,
                        RunEvent::AttemptSucceeded {
                            step_id: step.id.clone(),
                            tool: step.tool.clone(),
                            attempt,
                            elapsed_ms,
                        },
                    );
                    return Invocation {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) => as_call_error(&step.tool, e),
            };

            let retry_in = (error.is_retryable() && attempt < self.policy.max_attempts)
                .then(|| self.policy.backoff(attempt));
            emit(
                sink,
                RunEvent::AttemptFailed {
                    step_id: step.id.clone(),
                    tool: step.tool.clone(),
                    attempt,
                    error: error.to_string(),
                    retry_in_ms: retry_in.map(|d| d.as_millis() as u64),
                },
            );

            match retry_in {
                Some(backoff) => {
                    warn!(
                        step_id = %step.id,
                        tool = %step.tool,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Retrying tool call"
                    );
                    tokio::time::sleep(backoff).await;
                }
                None => {
                    return Invocation {
                        result: Err(error),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

/// Every failure of the call itself is transient; anything a tool reports
/// outside the tool error variants is folded into `ToolExecution`.
fn as_call_error(tool: &str, e: CapsuleError) -> CapsuleError {
    match e.kind() {
        ErrorKind::Transient => e,
        _ => CapsuleError::ToolExecution {
            tool: tool.to_string(),
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_test_utils::ScriptedTool;
    use serde_json::json;

    fn step(tool: &str) -> ToolStep {
        ToolStep {
            id: "fetch".into(),
            description: String::new(),
            tool: tool.into(),
            input: json!({}),
            save_as: None,
            depends_on: vec![],
        }
    }

    fn env(allow: &[&str]) -> EnvSpec {
        EnvSpec {
            tools_allowlist: allow.iter().map(|s| s.to_string()).collect(),
            ..EnvSpec::default()
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            run_id: Default::default(),
            graph_id: "g".into(),
            step_id: "fetch".into(),
            attempt: 0,
        }
    }

    fn invoker(tool: ScriptedTool) -> ToolInvoker {
        let mut registry = ToolRegistry::new();
        registry.register(tool);
        ToolInvoker::new(Arc::new(registry), RetryPolicy::default())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LoggedEvent>) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e.event);
        }
        out
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(40), Duration::from_millis(300));
    }

    #[test]
    fn test_preflight_checks_allow_list_then_registry() {
        let inv = invoker(ScriptedTool::ok("known", json!(1)));
        let err = inv.preflight(&step("known"), &env(&[])).unwrap_err();
        assert_eq!(err.code(), "TOOL_NOT_ALLOWED");
        let err = inv.preflight(&step("ghost"), &env(&["ghost"])).unwrap_err();
        assert_eq!(err.code(), "TOOL_NOT_IMPLEMENTED");
        assert!(inv.preflight(&step("known"), &env(&["known"])).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let tool = ScriptedTool::new("flaky", 2, json!({"ok": true}));
        let inv = invoker(tool.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let out = inv.invoke(&step("flaky"), json!({}), ctx(), &tx).await;
        assert_eq!(out.result.unwrap(), json!({"ok": true}));
        assert_eq!(out.attempts, 3);
        assert_eq!(tool.invocations(), 3);

        let calls = tool.call_instants();
        let first_gap = calls[1] - calls[0];
        let second_gap = calls[2] - calls[1];
        assert!(first_gap >= Duration::from_millis(100) && first_gap < Duration::from_millis(110));
        assert!(second_gap >= Duration::from_millis(200) && second_gap < Duration::from_millis(210));

        let events = drain(&mut rx);
        let starts = events
            .iter()
            .filter(|e| matches!(e, RunEvent::AttemptStarted { .. }))
            .count();
        assert_eq!(starts, 3);
        assert!(matches!(
            events.last(),
            Some(RunEvent::AttemptSucceeded { attempt: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let tool = ScriptedTool::failing("down");
        let inv = invoker(tool.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let out = inv.invoke(&step("down"), json!({}), ctx(), &tx).await;
        let err = out.result.unwrap_err();
        assert_eq!(err.code(), "TOOL_EXECUTION_FAILED");
        assert!(err.to_string().contains("scripted failure 3"));
        assert_eq!(out.attempts, 3);
        assert_eq!(tool.invocations(), 3);

        let events = drain(&mut rx);
        assert!(matches!(
            events.last(),
            Some(RunEvent::AttemptFailed { attempt: 3, retry_in_ms: None, .. })
        ));
    }

    #[test]
    fn test_foreign_errors_become_tool_failures() {
        let e = as_call_error("t", CapsuleError::Storage("disk".into()));
        assert_eq!(e.code(), "TOOL_EXECUTION_FAILED");
        let e = as_call_error("t", CapsuleError::ToolValidation("bad".into()));
        assert_eq!(e.code(), "TOOL_INPUT_INVALID");
    }
}
