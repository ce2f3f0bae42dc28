//! `{{slot.field}}` placeholder resolution against the output table.
//!
//! Only strings that consist entirely of one token are replaced, and they are
//! replaced by the referenced JSON value itself (not its string form).
//! Strings that merely contain a token are passed through untouched.

use std::sync::OnceLock;

use serde_json::Value;

use capsule_core::error::{CapsuleError, Result};

use crate::output::OutputTable;

/// Resolve every whole-string token inside `value`, depth first.
pub fn resolve(value: &Value, table: &OutputTable) -> Result<Value> {
    match value {
        Value::String(s) => match token_path(s) {
            Some(path) => lookup(path, table).cloned(),
            None => Ok(value.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|v| resolve(v, table))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, table)?);
            }
            Ok(Value::Object(out))
        }
        _ => Ok(value.clone()),
    }
}

/// Dotted path of a whole-string token, if `s` is one.
pub fn token_path(s: &str) -> Option<&str> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"^\{\{\s*([^{}\s]+)\s*\}\}$").expect("static token pattern")
    });
    re.captures(s).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Walk `path` (slot first, then object fields or array indices).
pub fn lookup<'t>(path: &str, table: &'t OutputTable) -> Result<&'t Value> {
    let unresolved = || CapsuleError::PlaceholderUnresolved {
        path: path.to_string(),
    };

    let mut segments = path.split('.');
    let slot = segments.next().filter(|s| !s.is_empty()).ok_or_else(unresolved)?;
    let mut current = table.get(slot).ok_or_else(unresolved)?;

    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(unresolved)?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> OutputTable {
        let mut t = OutputTable::new();
        t.insert(
            "evidence",
            json!({"items": [{"id": "ev://kb/a#p0?v=1"}], "count": 1}),
        );
        t.insert("draft", json!({"draft": "## Goal\n\n- x"}));
        t
    }

    #[test]
    fn test_replaces_whole_token_with_value() {
        let input = json!({"draft": "{{draft.draft}}", "n": "{{ evidence.count }}"});
        let out = resolve(&input, &table()).unwrap();
        assert_eq!(out, json!({"draft": "## Goal\n\n- x", "n": 1}));
    }

    #[test]
    fn test_whole_slot_and_array_index() {
        let out = resolve(&json!(["{{evidence.items.0.id}}", "{{draft}}"]), &table()).unwrap();
        assert_eq!(out[0], "ev://kb/a#p0?v=1");
        assert_eq!(out[1], json!({"draft": "## Goal\n\n- x"}));
    }

    #[test]
    fn test_partial_tokens_and_literals_pass_through() {
        let input = json!({
            "text": "see {{draft.draft}} here",
            "n": 3,
            "flag": true,
            "nested": [{"q": "plain"}]
        });
        let out = resolve(&input, &table()).unwrap();
        assert_eq!(out, input);
        assert_eq!(resolve(&out, &table()).unwrap(), out);
    }

    #[test]
    fn test_missing_path_names_it() {
        let err = resolve(&json!({"x": "{{draft.missing}}"}), &table()).unwrap_err();
        assert_eq!(err.code(), "PLACEHOLDER_UNRESOLVED");
        assert!(err.to_string().contains("draft.missing"));

        let err = resolve(&json!("{{nope}}"), &table()).unwrap_err();
        assert!(matches!(err, CapsuleError::PlaceholderUnresolved { path } if path == "nope"));

        assert!(resolve(&json!("{{evidence.items.7}}"), &table()).is_err());
        assert!(resolve(&json!("{{evidence.count.deeper}}"), &table()).is_err());
    }

    #[test]
    fn test_failure_is_deterministic() {
        let input = json!({"a": "{{gone.x}}"});
        let first = resolve(&input, &table()).unwrap_err().to_string();
        let second = resolve(&input, &table()).unwrap_err().to_string();
        assert_eq!(first, second);
    }
}
