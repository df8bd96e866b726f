use std::sync::Arc;

use indexmap::IndexMap;

use guardsymbi_core::types::{ContextSnapshot, EventKind, StepFailure};
use guardsymbi_mcp::McpGateway;

use crate::journal::RunJournal;

/// Per-task variable scope.
///
/// Created when a task starts and dropped when it reaches a terminal state;
/// never shared between tasks.
pub struct ExecutionContext {
    task: String,
    vars: IndexMap<String, serde_json::Value>,
    error: Option<StepFailure>,
    degraded: bool,
    journal: Arc<RunJournal>,
    assist: Option<Arc<McpGateway>>,
}

impl ExecutionContext {
    pub fn new(
        task: impl Into<String>,
        journal: Arc<RunJournal>,
        assist: Option<Arc<McpGateway>>,
    ) -> Self {
        Self {
            task: task.into(),
            vars: IndexMap::new(),
            error: None,
            degraded: false,
            journal,
            assist,
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn bind(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.vars.get(name)
    }

    /// Look up a dotted path such as `load.items[0].name` or `load.items.0`.
    pub fn resolve(&self, path: &str) -> Option<&serde_json::Value> {
        let mut segments = split_path(path);
        let root = segments.next()?;
        let mut current = self.vars.get(root.key?)?;
        if let Some(idx) = root.index {
            current = current.get(idx)?;
        }
        for seg in segments {
            if let Some(key) = seg.key {
                current = match current {
                    serde_json::Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                    other => other.get(key)?,
                };
            }
            if let Some(idx) = seg.index {
                current = current.get(idx)?;
            }
        }
        Some(current)
    }

    /// Replace the value at a dotted path, creating intermediate objects.
    ///
    /// Returns `false` when the path crosses a non-object value.
    pub fn set_path(&mut self, path: &str, value: serde_json::Value) -> bool {
        let Some((root, rest)) = path.split_once('.') else {
            self.bind(path, value);
            return true;
        };
        let mut current = self
            .vars
            .entry(root.to_string())
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        let keys: Vec<&str> = rest.split('.').collect();
        for (i, key) in keys.iter().enumerate() {
            let last = i + 1 == keys.len();
            let serde_json::Value::Object(map) = current else {
                return false;
            };
            if last {
                map.insert(key.to_string(), value);
                return true;
            }
            current = map
                .entry(key.to_string())
                .or_insert_with(|| serde_json::Value::Object(Default::default()));
        }
        false
    }

    pub fn set_error(&mut self, failure: StepFailure) {
        self.error = Some(failure);
    }

    /// The fault currently being recovered, if any.
    pub fn error(&self) -> Option<&StepFailure> {
        self.error.as_ref()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    /// Set when an upstream task failed under a `continue` policy.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Copy of all bindings, in binding order.
    pub fn snapshot(&self) -> ContextSnapshot {
        self.vars.clone()
    }

    pub fn journal(&self) -> &Arc<RunJournal> {
        &self.journal
    }

    pub fn assist(&self) -> Option<&Arc<McpGateway>> {
        self.assist.as_ref()
    }

    pub fn emit(&self, step: Option<&str>, kind: EventKind) {
        self.journal.record(Some(&self.task), step, kind);
    }
}

struct PathSegment<'a> {
    key: Option<&'a str>,
    index: Option<usize>,
}

fn split_path(path: &str) -> impl Iterator<Item = PathSegment<'_>> {
    path.split('.').filter(|s| !s.is_empty()).map(|segment| {
        match segment.find('[') {
            Some(pos) => PathSegment {
                key: Some(&segment[..pos]).filter(|k| !k.is_empty()),
                index: segment[pos + 1..].trim_end_matches(']').parse().ok(),
            },
            None => PathSegment {
                key: Some(segment),
                index: None,
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardsymbi_core::types::RunId;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("t", Arc::new(RunJournal::new(RunId::new(), None)), None)
    }

    #[test]
    fn test_resolve_paths() {
        let mut c = ctx();
        c.bind("load", json!({"items": [{"name": "a"}, {"name": "b"}], "total": 2}));
        assert_eq!(c.resolve("load.total"), Some(&json!(2)));
        assert_eq!(c.resolve("load.items[1].name"), Some(&json!("b")));
        assert_eq!(c.resolve("load.items.0.name"), Some(&json!("a")));
        assert_eq!(c.resolve("load.missing"), None);
        assert_eq!(c.resolve("nothing"), None);
    }

    #[test]
    fn test_set_path() {
        let mut c = ctx();
        c.bind("raw", json!("broken"));
        assert!(c.set_path("raw", json!("fixed")));
        assert_eq!(c.get("raw"), Some(&json!("fixed")));

        assert!(c.set_path("cfg.limits.max", json!(5)));
        assert_eq!(c.resolve("cfg.limits.max"), Some(&json!(5)));

        c.bind("n", json!(1));
        assert!(!c.set_path("n.inner", json!(0)));
    }

    #[test]
    fn test_snapshot_preserves_binding_order() {
        let mut c = ctx();
        c.bind("z", json!(1));
        c.bind("a", json!(2));
        let snap = c.snapshot();
        let keys: Vec<&str> = snap.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a"]);
    }
}
