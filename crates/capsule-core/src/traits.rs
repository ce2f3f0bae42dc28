use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{RunRecord, ToolContext};

/// An allow-listable external capability a tool step can invoke.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (matched against the graph's allow-list).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with its resolved input.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Timeout in seconds for a single call.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Persistence for finished runs.
pub trait RunStore: Send + Sync + 'static {
    /// Persist a run and return stable references (artifact locators).
    fn save<'a>(&'a self, record: &'a RunRecord) -> BoxFuture<'a, Result<Vec<String>>>;
}
