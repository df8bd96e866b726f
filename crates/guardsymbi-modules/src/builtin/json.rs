use futures::future::BoxFuture;

use guardsymbi_core::traits::{CallResult, ModuleFunction};
use guardsymbi_core::types::StepFailure;

use super::str_arg;

// ── JSON.parse ──────────────────────────────────────────────────

pub struct JsonParse;

impl ModuleFunction for JsonParse {
    fn module(&self) -> &str {
        "JSON"
    }
    fn name(&self) -> &str {
        "parse"
    }
    fn arity(&self) -> Option<usize> {
        Some(1)
    }
    fn call(&self, args: Vec<serde_json::Value>) -> BoxFuture<'_, CallResult> {
        Box::pin(async move {
            // Already-structured input passes through
            if !args[0].is_string() {
                return Ok(args[0].clone());
            }
            let text = str_arg(&args, 0, "text")?;
            serde_json::from_str(text).map_err(|e| {
                StepFailure::parse(e.to_string()).with_payload(serde_json::json!({
                    "line": e.line(),
                    "column": e.column(),
                }))
            })
        })
    }
}

// ── JSON.stringify ──────────────────────────────────────────────

pub struct JsonStringify;

impl ModuleFunction for JsonStringify {
    fn module(&self) -> &str {
        "JSON"
    }
    fn name(&self) -> &str {
        "stringify"
    }
    fn arity(&self) -> Option<usize> {
        Some(1)
    }
    fn call(&self, args: Vec<serde_json::Value>) -> BoxFuture<'_, CallResult> {
        Box::pin(async move {
            serde_json::to_string_pretty(&args[0])
                .map(serde_json::Value::String)
                .map_err(|e| StepFailure::runtime(e.to_string()))
        })
    }
}

// ── JSON.get ────────────────────────────────────────────────────

pub struct JsonGet;

impl ModuleFunction for JsonGet {
    fn module(&self) -> &str {
        "JSON"
    }
    fn name(&self) -> &str {
        "get"
    }
    fn arity(&self) -> Option<usize> {
        Some(2)
    }
    fn call(&self, args: Vec<serde_json::Value>) -> BoxFuture<'_, CallResult> {
        Box::pin(async move {
            let path = str_arg(&args, 1, "path")?;
            Ok(json_path_query(&args[0], path))
        })
    }
}

/// Query by dot-notation path (`items[0].name`). Missing segments yield null.
fn json_path_query(value: &serde_json::Value, path: &str) -> serde_json::Value {
    let mut current = value.clone();
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        // Check for array index: key[0]
        if let Some(bracket_pos) = segment.find('[') {
            let key = &segment[..bracket_pos];
            let idx_str = segment[bracket_pos + 1..].trim_end_matches(']');
            if !key.is_empty() {
                current = current.get(key).cloned().unwrap_or(serde_json::Value::Null);
            }
            if let Ok(idx) = idx_str.parse::<usize>() {
                current = current.get(idx).cloned().unwrap_or(serde_json::Value::Null);
            }
        } else {
            current = current
                .get(segment)
                .cloned()
                .unwrap_or(serde_json::Value::Null);
        }
    }
    current
}
