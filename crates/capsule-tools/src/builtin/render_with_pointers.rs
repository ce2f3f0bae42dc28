use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, warn};

use capsule_core::error::{CapsuleError, Result};
use capsule_core::traits::Tool;
use capsule_core::types::ToolContext;

use crate::pointer::{parse_pointer, scan_ref_markers};

/// Checks every `[ref:…]` marker in a draft and returns the cited pointers.
pub struct RenderWithPointersTool;

#[derive(Deserialize)]
struct RenderInput {
    draft: String,
}

impl Tool for RenderWithPointersTool {
    fn name(&self) -> &str {
        "render_with_pointers"
    }

    fn description(&self) -> &str {
        "Validate the citation markers of a draft and list its citations."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "draft": {
                    "type": "string",
                    "description": "Draft text carrying [ref:ev://...] markers"
                }
            },
            "required": ["draft"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let params: RenderInput = serde_json::from_value(input)
                .map_err(|e| CapsuleError::ToolValidation(e.to_string()))?;
            if params.draft.trim().is_empty() {
                return Err(CapsuleError::ToolValidation("draft must not be empty".into()));
            }

            let mut citations: Vec<String> = Vec::new();
            let mut bad: Vec<String> = Vec::new();
            for marker in scan_ref_markers(&params.draft) {
                if parse_pointer(&marker).is_err() {
                    bad.push(marker);
                } else if !citations.contains(&marker) {
                    citations.push(marker);
                }
            }

            if !bad.is_empty() {
                warn!(step = %ctx.step_id, bad = bad.len(), "Draft carries unresolvable pointers");
                return Ok(serde_json::json!({
                    "ok": false,
                    "error": "POINTER_RESOLVE_FAILED",
                    "bad": bad,
                }));
            }

            debug!(step = %ctx.step_id, citations = citations.len(), "Draft pointers verified");
            Ok(serde_json::json!({
                "ok": true,
                "content": params.draft,
                "citations": citations,
            }))
        })
    }
}
