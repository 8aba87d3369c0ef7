//! Result size capping.
//!
//! Handler output is persisted with the job row. Oversized values are replaced
//! by a bounded summary object so a single job cannot bloat the table.

use serde_json::{Map, Value, json};

const MAX_KEY_CHARS: usize = 128;

/// Bounds applied to persisted handler results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultLimits {
    /// Largest serialized result stored verbatim.
    pub max_bytes: usize,
    /// Characters of serialized output kept in the summary preview.
    pub preview_chars: usize,
    /// Top-level keys listed in the summary for object results.
    pub max_keys: usize,
}

impl Default for ResultLimits {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024,
            preview_chars: 1000,
            max_keys: 50,
        }
    }
}

/// Return `value` unchanged if it fits, otherwise a truncation summary.
pub fn cap_result(value: Value, limits: &ResultLimits) -> Value {
    let serialized = value.to_string();
    let actual_bytes = serialized.len();
    if actual_bytes <= limits.max_bytes {
        return value;
    }

    let preview: String = serialized.chars().take(limits.preview_chars).collect();
    let preview_truncated = preview.len() < serialized.len();

    let mut summary = Map::new();
    summary.insert("_truncated".into(), Value::Bool(true));
    summary.insert("reason".into(), json!("result_too_large"));
    summary.insert("actual_bytes".into(), json!(actual_bytes));
    summary.insert("max_bytes".into(), json!(limits.max_bytes));
    summary.insert("original_type".into(), json!(type_name(&value)));
    summary.insert("preview".into(), Value::String(preview));
    summary.insert("preview_truncated".into(), Value::Bool(preview_truncated));

    if let Value::Object(map) = &value {
        let keys: Vec<Value> = map
            .keys()
            .take(limits.max_keys)
            .map(|k| Value::String(k.chars().take(MAX_KEY_CHARS).collect()))
            .collect();
        summary.insert("keys".into(), Value::Array(keys));
        summary.insert("total_keys".into(), json!(map.len()));
    }

    Value::Object(summary)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
