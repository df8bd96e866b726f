use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use guardsymbi_core::decl::{Arg, OperationRef};
use guardsymbi_core::traits::CallResult;
use guardsymbi_core::types::{FailureKind, McpRequestKind, StepFailure};
use guardsymbi_modules::ModuleRegistry;

use crate::assist::{assist_failure, consult};
use crate::context::ExecutionContext;

/// Executes one step operation against a task's context.
///
/// Ordinary operations go to the module registry; `AI.*` operations go to
/// the assistance gateway. Faults come back as [`StepFailure`] values and
/// binding results into the context is left to the caller.
pub struct StepInterpreter {
    registry: Arc<ModuleRegistry>,
    default_timeout: Duration,
    cancel: CancellationToken,
}

impl StepInterpreter {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        default_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            default_timeout,
            cancel,
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub async fn execute(
        &self,
        op: &OperationRef,
        ctx: &ExecutionContext,
        step: &str,
        timeout: Option<Duration>,
    ) -> CallResult {
        let args = resolve_args(op, ctx)?;

        if op.is_ai() {
            return self.execute_ai(op, args, ctx, step, timeout).await;
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        debug!(task = %ctx.task(), step, operation = %op, args = args.len(), "Dispatching operation");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(StepFailure::runtime("run cancelled").at(&op.module, &op.function))
            }
            result = self.registry.call(&op.module, &op.function, args, timeout) => result,
        }
    }

    async fn execute_ai(
        &self,
        op: &OperationRef,
        args: Vec<serde_json::Value>,
        ctx: &ExecutionContext,
        step: &str,
        timeout: Option<Duration>,
    ) -> CallResult {
        let Some(kind) = McpRequestKind::from_function(&op.function) else {
            return Err(StepFailure::new(
                FailureKind::UnknownOperation,
                format!("no AI operation named '{}'", op.function),
            )
            .at(&op.module, &op.function));
        };

        let subject = args.first().cloned().unwrap_or(serde_json::Value::Null);
        let message = match &subject {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let response = consult(ctx, step, kind, message, timeout)
            .await
            .map_err(|e| assist_failure(&e, &op.function))?;

        let text = response.explanation.map(serde_json::Value::String);
        Ok(match kind {
            McpRequestKind::Fix | McpRequestKind::Optimize => response.value.unwrap_or(subject),
            McpRequestKind::SuggestFix | McpRequestKind::ExplainError => text
                .or(response.value)
                .unwrap_or(serde_json::Value::Null),
        })
    }
}

/// Turn declared arguments into values from the context.
pub fn resolve_args(op: &OperationRef, ctx: &ExecutionContext) -> Result<Vec<serde_json::Value>, StepFailure> {
    op.args
        .iter()
        .map(|arg| match arg {
            Arg::Value { value } => Ok(value.clone()),
            Arg::Var { var } => ctx.resolve(var).cloned().ok_or_else(|| {
                StepFailure::runtime(format!("unbound variable '{}'", var))
                    .at(&op.module, &op.function)
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::RunJournal;
    use guardsymbi_core::types::{EventKind, RunId};
    use guardsymbi_mcp::McpGateway;
    use guardsymbi_test_utils::{MockAssistant, ScriptedFunction};
    use serde_json::json;

    fn interpreter(registry: ModuleRegistry) -> StepInterpreter {
        StepInterpreter::new(
            Arc::new(registry),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
    }

    fn ctx_with(assist: Option<Arc<McpGateway>>) -> ExecutionContext {
        ExecutionContext::new("t", Arc::new(RunJournal::new(RunId::new(), None)), assist)
    }

    #[tokio::test]
    async fn test_resolves_vars_and_literals() {
        let interp = interpreter(ModuleRegistry::with_builtins());
        let mut ctx = ctx_with(None);
        ctx.bind("doc", json!({"a": {"b": 7}}));

        let op = OperationRef::new("JSON", "get")
            .arg(Arg::var("doc"))
            .arg(Arg::value(json!("a.b")));
        assert_eq!(interp.execute(&op, &ctx, "s", None).await.unwrap(), json!(7));
    }

    #[tokio::test]
    async fn test_unbound_variable_is_runtime_fault() {
        let interp = interpreter(ModuleRegistry::with_builtins());
        let ctx = ctx_with(None);
        let op = OperationRef::new("JSON", "parse").arg(Arg::var("raw"));
        let err = interp.execute(&op, &ctx, "s", None).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::RuntimeError);
        assert_eq!(err.module, "JSON");
        assert!(err.message.contains("raw"));
    }

    #[tokio::test]
    async fn test_module_fault_is_captured() {
        let mut registry = ModuleRegistry::new();
        registry.register(
            ScriptedFunction::new("File", "read")
                .always_failing(FailureKind::IoError)
                .with_message("permission denied"),
        );
        let interp = interpreter(registry);
        let err = interp
            .execute(&OperationRef::new("File", "read"), &ctx_with(None), "s", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::IoError);
        assert_eq!(err.function, "read");
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_override() {
        let mut registry = ModuleRegistry::new();
        registry.register(ScriptedFunction::new("Slow", "op").with_delay(Duration::from_secs(10)));
        let interp = interpreter(registry);
        let err = interp
            .execute(
                &OperationRef::new("Slow", "op"),
                &ctx_with(None),
                "s",
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::TimeoutError);
    }

    #[tokio::test]
    async fn test_ai_optimize_goes_to_gateway() {
        let mock = Arc::new(
            MockAssistant::new().with_value(McpRequestKind::Optimize, json!({"items": [3]})),
        );
        let gateway = Arc::new(McpGateway::new(mock.clone(), Duration::from_secs(5)));
        let mut ctx = ctx_with(Some(gateway));
        ctx.bind("valid", json!({"items": [3, 3]}));

        let interp = interpreter(ModuleRegistry::new());
        let op = OperationRef::new("AI", "optimize").arg(Arg::var("valid"));
        let value = interp.execute(&op, &ctx, "AI.optimize", None).await.unwrap();

        assert_eq!(value, json!({"items": [3]}));
        assert_eq!(mock.count(McpRequestKind::Optimize), 1);
        let kinds: Vec<&str> = ctx.journal().events().iter().map(|e| e.kind.name()).collect();
        assert_eq!(kinds, vec!["ai_requested", "ai_responded"]);
    }

    #[tokio::test]
    async fn test_ai_without_gateway_fails_step() {
        let interp = interpreter(ModuleRegistry::new());
        let ctx = ctx_with(None);
        let op = OperationRef::new("AI", "explainError").arg(Arg::value(json!("boom")));
        let err = interp.execute(&op, &ctx, "s", None).await.unwrap_err();
        assert_eq!(err.module, "AI");
        assert!(matches!(
            ctx.journal().events()[0].kind,
            EventKind::AiFailed { .. }
        ));
    }
}
