//! Deterministic draft rendering from evidence collections.

use serde_json::{json, Value};

use capsule_core::error::{CapsuleError, Result};
use capsule_core::graph::{SynthesisStyle, SynthesizeStep};

/// Render a synthesis step from the current values of its source slots.
///
/// `sources` pairs each name listed in `step.source` with the slot's value,
/// or `None` when the slot was never written.
pub fn evaluate(step: &SynthesizeStep, sources: &[(String, Option<Value>)]) -> Result<Value> {
    let mut found_collection = false;
    let mut items: Vec<&Value> = Vec::new();
    for (_, value) in sources {
        if let Some(collection) = value.as_ref().and_then(collection_of) {
            found_collection = true;
            items.extend(collection.iter());
        }
    }

    if !found_collection {
        return Err(CapsuleError::SynthesisSourceMissing {
            step: step.id.clone(),
            sources: step.source.clone(),
        });
    }
    if items.is_empty() {
        return Err(CapsuleError::SynthesisNoEvidence {
            step: step.id.clone(),
        });
    }

    let selected: Vec<&Value> = items.into_iter().take(step.max_items.max(1)).collect();

    let mut citations: Vec<String> = Vec::new();
    let mut lines: Vec<String> = Vec::with_capacity(selected.len());
    for item in &selected {
        let pointer = pointer_of(item);
        let summary = summary_of(item);
        if let Some(p) = pointer {
            if !citations.iter().any(|c| c == p) {
                citations.push(p.to_string());
            }
        }
        lines.push(render_line(step.style, summary, pointer));
    }

    let body = match step.style {
        SynthesisStyle::Bullet => lines.join("\n"),
        SynthesisStyle::Paragraph => lines.join(" "),
    };
    let draft = format!("## {}\n\n{}", step.objective, body);

    Ok(json!({
        "draft": draft,
        "citations": citations,
        "items": selected,
    }))
}

/// The `items` (or `cards`) array of a slot value.
fn collection_of(value: &Value) -> Option<&Vec<Value>> {
    value
        .get("items")
        .and_then(Value::as_array)
        .or_else(|| value.get("cards").and_then(Value::as_array))
}

fn pointer_of(item: &Value) -> Option<&str> {
    item.get("id")
        .and_then(Value::as_str)
        .or_else(|| item.get("pointer").and_then(Value::as_str))
        .filter(|p| !p.is_empty())
}

fn summary_of(item: &Value) -> &str {
    item.get("summary")
        .and_then(Value::as_str)
        .or_else(|| item.get("title").and_then(Value::as_str))
        .unwrap_or("")
        .trim()
}

fn render_line(style: SynthesisStyle, summary: &str, pointer: Option<&str>) -> String {
    match (style, pointer) {
        (SynthesisStyle::Bullet, Some(p)) => format!("- {} [ref:{}]", summary, p),
        (SynthesisStyle::Bullet, None) => format!("- {}", summary),
        (SynthesisStyle::Paragraph, Some(p)) => {
            format!("{} [ref:{}].", summary.trim_end_matches('.'), p)
        }
        (SynthesisStyle::Paragraph, None) => format!("{}.", summary.trim_end_matches('.')),
    }
}
