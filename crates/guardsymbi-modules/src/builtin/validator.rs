use futures::future::BoxFuture;

use guardsymbi_core::traits::{CallResult, ModuleFunction};
use guardsymbi_core::types::StepFailure;

// ── DataValidator.validate ──────────────────────────────────────

/// Checks a value against a small schema:
/// `{ "type": ..., "required": [...], "properties": { field: { "type": ... } } }`.
/// Returns the value unchanged when valid.
pub struct Validate;

impl ModuleFunction for Validate {
    fn module(&self) -> &str {
        "DataValidator"
    }
    fn name(&self) -> &str {
        "validate"
    }
    fn arity(&self) -> Option<usize> {
        Some(2)
    }
    fn call(&self, args: Vec<serde_json::Value>) -> BoxFuture<'_, CallResult> {
        Box::pin(async move {
            let violations = check_schema(&args[0], &args[1], "$");
            if violations.is_empty() {
                Ok(args[0].clone())
            } else {
                Err(StepFailure::validation(violations.join("; "))
                    .with_payload(serde_json::json!({ "violations": violations })))
            }
        })
    }
}

// ── DataValidator.nonEmpty ──────────────────────────────────────

pub struct NonEmpty;

impl ModuleFunction for NonEmpty {
    fn module(&self) -> &str {
        "DataValidator"
    }
    fn name(&self) -> &str {
        "nonEmpty"
    }
    fn arity(&self) -> Option<usize> {
        Some(1)
    }
    fn call(&self, args: Vec<serde_json::Value>) -> BoxFuture<'_, CallResult> {
        Box::pin(async move {
            let empty = match &args[0] {
                serde_json::Value::Null => true,
                serde_json::Value::String(s) => s.is_empty(),
                serde_json::Value::Array(a) => a.is_empty(),
                serde_json::Value::Object(o) => o.is_empty(),
                _ => false,
            };
            if empty {
                Err(StepFailure::validation("value is empty"))
            } else {
                Ok(args[0].clone())
            }
        })
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn type_matches(value: &serde_json::Value, expected: &str) -> bool {
    let actual = type_name(value);
    actual == expected || (expected == "number" && actual == "integer")
}

fn check_schema(value: &serde_json::Value, schema: &serde_json::Value, at: &str) -> Vec<String> {
    let mut violations = Vec::new();

    if let Some(expected) = schema.get("type").and_then(|t| t.as_str()) {
        if !type_matches(value, expected) {
            violations.push(format!("{}: expected {}, got {}", at, expected, type_name(value)));
            return violations;
        }
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if value.get(field).is_none() {
                violations.push(format!("{}: missing required field '{}'", at, field));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (field, sub) in props {
            if let Some(v) = value.get(field) {
                violations.extend(check_schema(v, sub, &format!("{}.{}", at, field)));
            }
        }
    }

    if let (Some(items), Some(arr)) = (schema.get("items"), value.as_array()) {
        for (i, v) in arr.iter().enumerate() {
            violations.extend(check_schema(v, items, &format!("{}[{}]", at, i)));
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardsymbi_core::types::FailureKind;
    use serde_json::json;

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "required": ["name", "items"],
            "properties": {
                "name": { "type": "string" },
                "items": { "type": "array", "items": { "type": "number" } }
            }
        })
    }

    #[tokio::test]
    async fn test_valid_value_returned() {
        let doc = json!({"name": "q3", "items": [1, 2.5]});
        let out = Validate.call(vec![doc.clone(), schema()]).await.unwrap();
        assert_eq!(out, doc);
    }

    #[tokio::test]
    async fn test_violations_collected() {
        let doc = json!({"items": [1, "two"]});
        let err = Validate.call(vec![doc, schema()]).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ValidationError);
        assert!(err.message.contains("missing required field 'name'"));
        assert!(err.message.contains("$.items[1]: expected number, got string"));
        assert_eq!(err.payload.unwrap()["violations"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_empty() {
        assert!(NonEmpty.call(vec![json!([])]).await.is_err());
        assert!(NonEmpty.call(vec![json!("")]).await.is_err());
        assert_eq!(NonEmpty.call(vec![json!(0)]).await.unwrap(), json!(0));
    }
}
