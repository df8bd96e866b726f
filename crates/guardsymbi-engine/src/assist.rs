use std::time::Duration;

use tracing::{info, warn};

use guardsymbi_core::error::{GuardError, Result};
use guardsymbi_core::types::{EventKind, FailureKind, McpRequestKind, McpResponse, StepFailure};

use crate::context::ExecutionContext;

/// Ask the assistance collaborator for help on behalf of a task step.
///
/// Emits `ai_requested` before sending and `ai_responded`/`ai_failed` after.
pub async fn consult(
    ctx: &ExecutionContext,
    step: &str,
    kind: McpRequestKind,
    message: String,
    timeout: Option<Duration>,
) -> Result<McpResponse> {
    let Some(gateway) = ctx.assist() else {
        ctx.emit(
            Some(step),
            EventKind::AiFailed {
                id: String::new(),
                kind,
                error: GuardError::McpUnavailable.to_string(),
            },
        );
        return Err(GuardError::McpUnavailable);
    };

    let request = gateway.new_request(kind, message, ctx.snapshot());
    let id = request.id.clone();
    info!(task = %ctx.task(), step, kind = %kind, id = %id, "Requesting AI assistance");
    ctx.emit(Some(step), EventKind::AiRequested { id: id.clone(), kind });

    match gateway.dispatch(request, timeout).await {
        Ok(response) => {
            ctx.emit(
                Some(step),
                EventKind::AiResponded {
                    id,
                    kind,
                    has_value: response.value.is_some(),
                },
            );
            Ok(response)
        }
        Err(e) => {
            warn!(task = %ctx.task(), step, kind = %kind, error = %e, "AI assistance failed");
            ctx.emit(
                Some(step),
                EventKind::AiFailed {
                    id,
                    kind,
                    error: e.to_string(),
                },
            );
            Err(e)
        }
    }
}

/// Express a failed assistance call as a step fault of `AI.<function>`.
pub fn assist_failure(err: &GuardError, function: &str) -> StepFailure {
    let kind = match err {
        GuardError::McpTimeout { .. } => FailureKind::TimeoutError,
        _ => FailureKind::RuntimeError,
    };
    StepFailure::new(kind, err.to_string()).at(guardsymbi_core::decl::AI_MODULE, function)
}
