use futures::future::BoxFuture;
use tracing::debug;

use guardsymbi_core::traits::{CallResult, ModuleFunction};
use guardsymbi_core::types::StepFailure;

use super::str_arg;

// ── File.read ───────────────────────────────────────────────────

pub struct FileRead;

impl ModuleFunction for FileRead {
    fn module(&self) -> &str {
        "File"
    }
    fn name(&self) -> &str {
        "read"
    }
    fn arity(&self) -> Option<usize> {
        Some(1)
    }
    fn call(&self, args: Vec<serde_json::Value>) -> BoxFuture<'_, CallResult> {
        Box::pin(async move {
            let path = str_arg(&args, 0, "path")?;
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| StepFailure::io(format!("{}: {}", path, e)))?;
            debug!(path, bytes = content.len(), "File read");
            Ok(serde_json::Value::String(content))
        })
    }
}

// ── File.write ──────────────────────────────────────────────────

pub struct FileWrite;

impl ModuleFunction for FileWrite {
    fn module(&self) -> &str {
        "File"
    }
    fn name(&self) -> &str {
        "write"
    }
    fn arity(&self) -> Option<usize> {
        Some(2)
    }
    fn call(&self, args: Vec<serde_json::Value>) -> BoxFuture<'_, CallResult> {
        Box::pin(async move {
            let path = str_arg(&args, 0, "path")?;
            let content = match &args[1] {
                serde_json::Value::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other)
                    .map_err(|e| StepFailure::runtime(e.to_string()))?,
            };
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| StepFailure::io(format!("{}: {}", parent.display(), e)))?;
                }
            }
            tokio::fs::write(path, content.as_bytes())
                .await
                .map_err(|e| StepFailure::io(format!("{}: {}", path, e)))?;
            Ok(serde_json::json!({ "path": path, "bytes": content.len() }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardsymbi_core::types::FailureKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/report.json");
        let path_str = path.to_str().unwrap().to_string();

        let written = FileWrite
            .call(vec![json!(path_str), json!({"total": 3})])
            .await
            .unwrap();
        assert_eq!(written["path"], json!(path_str));

        let content = FileRead.call(vec![json!(path_str)]).await.unwrap();
        assert!(content.as_str().unwrap().contains("\"total\": 3"));
    }

    #[tokio::test]
    async fn test_read_missing_is_io_error() {
        let err = FileRead
            .call(vec![json!("/definitely/not/here.json")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::IoError);
    }

    #[tokio::test]
    async fn test_non_string_path_rejected() {
        let err = FileRead.call(vec![json!(42)]).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ValidationError);
    }
}
