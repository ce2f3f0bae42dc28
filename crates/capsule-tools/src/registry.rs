use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use capsule_core::error::{CapsuleError, Result};
use capsule_core::traits::Tool;
use capsule_core::types::ToolContext;

use crate::evidence::EvidenceIndex;

/// Name, description and input schema of a registered tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Register an already shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute one call of a tool by name, bounded by the tool's timeout.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<serde_json::Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| CapsuleError::ToolNotImplemented {
                step: ctx.step_id.clone(),
                tool: name.to_string(),
            })?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());

        match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(CapsuleError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }

    /// Registry with the built-in evidence tools.
    ///
    /// `retrieve_evidence` is only registered when an index is supplied;
    /// `render_with_pointers` needs no backing store.
    pub fn with_builtins(index: Option<Arc<EvidenceIndex>>) -> Self {
        let mut registry = Self::new();
        if let Some(index) = index {
            registry.register(crate::builtin::RetrieveEvidenceTool::new(index));
        }
        registry.register(crate::builtin::RenderWithPointersTool);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;

    struct SlowTool;

    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Never finishes in time"
        }

        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }

        fn execute(
            &self,
            _input: serde_json::Value,
            _ctx: ToolContext,
        ) -> BoxFuture<'_, Result<serde_json::Value>> {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(json!(null))
            })
        }

        fn timeout_secs(&self) -> u64 {
            1
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            run_id: Default::default(),
            graph_id: "g".into(),
            step_id: "s1".into(),
            attempt: 1,
        }
    }

    #[test]
    fn test_builtins_depend_on_index() {
        let registry = ToolRegistry::with_builtins(None);
        assert_eq!(registry.list(), vec!["render_with_pointers"]);

        let registry = ToolRegistry::with_builtins(Some(Arc::new(EvidenceIndex::default())));
        assert_eq!(
            registry.list(),
            vec!["render_with_pointers", "retrieve_evidence"]
        );
        assert_eq!(registry.definitions().len(), 2);
    }

    #[test]
    fn test_register_and_unregister() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        assert!(registry.get("slow").is_some());
        assert!(registry.unregister("slow"));
        assert!(!registry.unregister("slow"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_implemented() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", json!({}), ctx()).await.unwrap_err();
        assert_eq!(err.code(), "TOOL_NOT_IMPLEMENTED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tool_times_out() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        let err = registry.execute("slow", json!({}), ctx()).await.unwrap_err();
        assert!(matches!(err, CapsuleError::ToolTimeout { timeout_secs: 1, .. }));
        assert!(err.is_retryable());
    }
}
