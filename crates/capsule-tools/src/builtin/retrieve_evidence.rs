use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use capsule_core::error::{CapsuleError, Result};
use capsule_core::traits::Tool;
use capsule_core::types::ToolContext;

use crate::evidence::EvidenceIndex;

const DEFAULT_TOP_K: usize = 8;
const CARD_CONFIDENCE: f64 = 0.6;

/// Returns pointer-only evidence cards matching a query.
pub struct RetrieveEvidenceTool {
    index: Arc<EvidenceIndex>,
}

impl RetrieveEvidenceTool {
    pub fn new(index: Arc<EvidenceIndex>) -> Self {
        Self { index }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveInput {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

impl Tool for RetrieveEvidenceTool {
    fn name(&self) -> &str {
        "retrieve_evidence"
    }

    fn description(&self) -> &str {
        "Search the evidence index and return pointer-only cards."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search text"
                },
                "topK": {
                    "type": "integer",
                    "description": "Maximum number of cards (default: 8)"
                }
            },
            "required": ["query"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let params: RetrieveInput = serde_json::from_value(input)
                .map_err(|e| CapsuleError::ToolValidation(e.to_string()))?;
            if params.query.trim().is_empty() {
                return Err(CapsuleError::ToolValidation("query must not be empty".into()));
            }

            let top_k = params.top_k.unwrap_or(DEFAULT_TOP_K).max(1);
            let items: Vec<serde_json::Value> = self
                .index
                .search(&params.query, top_k)
                .into_iter()
                .map(|r| r.to_card(CARD_CONFIDENCE))
                .collect();

            debug!(step = %ctx.step_id, query = %params.query, cards = items.len(), "Retrieved evidence");
            Ok(serde_json::json!({ "items": items }))
        })
    }
}
