use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use guardsymbi_core::config::RecoveryConfig;
use guardsymbi_core::decl::{ErrorHandler, OperationRef, StepDecl, TaskDecl};
use guardsymbi_core::types::{EventKind, McpRequestKind, StepFailure, TaskFailure, TaskState};
use guardsymbi_mcp::McpGateway;

use crate::assist::consult;
use crate::context::ExecutionContext;
use crate::guard::{GuardEvaluator, GuardOutcome};
use crate::interpreter::StepInterpreter;
use crate::journal::RunJournal;
use crate::recovery::{calculate_backoff, decide, ErrorChecker, RecoveryDecision};
use crate::report::{RecoveryAttempt, RemediationAction};

/// Everything a task needs from its run, shared by all task workers.
pub struct RunScope {
    pub interpreter: StepInterpreter,
    pub checker: Arc<ErrorChecker>,
    pub recovery: RecoveryConfig,
    pub journal: Arc<RunJournal>,
    pub gateway: Option<Arc<McpGateway>>,
    pub cancel: CancellationToken,
}

/// Terminal result of one task.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub state: TaskState,
    pub output: Option<serde_json::Value>,
    pub failure: Option<TaskFailure>,
    /// Failed under `continue`: dependents still run, degraded.
    pub continue_downstream: bool,
    pub degraded: bool,
    pub recovery: Vec<RecoveryAttempt>,
    pub elapsed_ms: u64,
}

impl TaskRun {
    /// A task that never ran.
    pub fn aborted(failure: TaskFailure) -> Self {
        Self {
            state: TaskState::Aborted,
            output: None,
            failure: Some(failure),
            continue_downstream: false,
            degraded: false,
            recovery: Vec::new(),
            elapsed_ms: 0,
        }
    }
}

/// How a task's step sequence ended early.
enum StepEnd {
    Fail(TaskFailure),
    Continue(TaskFailure),
    Abort(TaskFailure),
}

/// Runs one task's steps in declaration order.
pub struct TaskDriver {
    scope: Arc<RunScope>,
    name: String,
    decl: TaskDecl,
}

impl TaskDriver {
    pub fn new(scope: Arc<RunScope>, name: String, decl: TaskDecl) -> Self {
        Self { scope, name, decl }
    }

    /// `inputs` are upstream outputs keyed by binding path (`load` or `Ingest.load`).
    pub async fn run(self, inputs: Vec<(String, serde_json::Value)>, degraded: bool) -> TaskRun {
        let start = Instant::now();
        let mut ctx = ExecutionContext::new(
            self.name.clone(),
            self.scope.journal.clone(),
            self.scope.gateway.clone(),
        );
        for (path, value) in inputs {
            if !ctx.set_path(&path, value) {
                warn!(task = %self.name, input = %path, "Input binding collides with another input");
            }
        }
        if degraded {
            ctx.mark_degraded();
        }

        info!(task = %self.name, degraded, steps = self.decl.steps.len(), "Task started");
        ctx.emit(None, EventKind::TaskStarted { degraded });

        let mut recovery = Vec::new();
        let mut last = serde_json::Value::Null;
        let result = self.run_steps(&mut ctx, &mut recovery, &mut last).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let (state, failure, continue_downstream) = match result {
            Ok(()) => (TaskState::Succeeded, None, false),
            Err(StepEnd::Fail(f)) => (TaskState::Failed, Some(f), false),
            Err(StepEnd::Continue(f)) => (TaskState::Failed, Some(f), true),
            Err(StepEnd::Abort(f)) => (TaskState::Aborted, Some(f), false),
        };
        let output = (state == TaskState::Succeeded).then(|| {
            ctx.get(self.decl.output_binding())
                .cloned()
                .unwrap_or(last)
        });

        TaskRun {
            state,
            output,
            failure,
            continue_downstream,
            degraded,
            recovery,
            elapsed_ms,
        }
    }

    async fn run_steps(
        &self,
        ctx: &mut ExecutionContext,
        recovery: &mut Vec<RecoveryAttempt>,
        last: &mut serde_json::Value,
    ) -> Result<(), StepEnd> {
        for (idx, step) in self.decl.steps.iter().enumerate() {
            let label = step.label(idx);
            if self.scope.cancel.is_cancelled() {
                return Err(StepEnd::Abort(TaskFailure::Cancelled));
            }

            if let Some(clause) = &step.guard {
                let evaluator = GuardEvaluator::new(&self.scope.interpreter);
                match evaluator.evaluate(clause, ctx, &label).await {
                    GuardOutcome::Passed { binding } => {
                        ctx.emit(Some(label.as_str()), EventKind::GuardPassed);
                        if let Some((name, value)) = binding {
                            *last = value.clone();
                            ctx.bind(name, value);
                        }
                    }
                    GuardOutcome::Failed { reason } => {
                        if self.scope.cancel.is_cancelled() {
                            return Err(StepEnd::Abort(TaskFailure::Cancelled));
                        }
                        warn!(task = %self.name, step = %label, reason = %reason, "Guard failed");
                        ctx.emit(
                            Some(label.as_str()),
                            EventKind::GuardFailed {
                                reason: reason.clone(),
                            },
                        );
                        recovery.extend(evaluator.run_else(clause, ctx, &label, &reason).await);
                        if self.scope.cancel.is_cancelled() {
                            return Err(StepEnd::Abort(TaskFailure::Cancelled));
                        }
                        return Err(StepEnd::Fail(TaskFailure::Guard {
                            step: label,
                            reason,
                        }));
                    }
                }
            }

            if let Some(op) = &step.call {
                let value = self.run_operation(step, op, &label, ctx, recovery).await?;
                if let Some(name) = &step.bind {
                    ctx.bind(name.clone(), value.clone());
                }
                *last = value;
            }
        }
        Ok(())
    }

    /// Attempt an operation under its onError policy.
    async fn run_operation(
        &self,
        step: &StepDecl,
        op: &OperationRef,
        label: &str,
        ctx: &mut ExecutionContext,
        recovery: &mut Vec<RecoveryAttempt>,
    ) -> Result<serde_json::Value, StepEnd> {
        let timeout = step.timeout_secs.map(Duration::from_secs);
        let mut attempt = 1;

        loop {
            if self.scope.cancel.is_cancelled() {
                return Err(StepEnd::Abort(TaskFailure::Cancelled));
            }
            ctx.emit(Some(label), EventKind::StepStarted { attempt });
            let failure = match self
                .scope
                .interpreter
                .execute(op, ctx, label, timeout)
                .await
            {
                Ok(value) => {
                    debug!(task = %self.name, step = label, attempt, "Step succeeded");
                    ctx.emit(Some(label), EventKind::StepSucceeded { attempt });
                    ctx.clear_error();
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            if self.scope.cancel.is_cancelled() {
                return Err(StepEnd::Abort(TaskFailure::Cancelled));
            }

            let failure = self.scope.checker.classify(failure);
            warn!(
                task = %self.name,
                step = label,
                attempt,
                kind = %failure.kind,
                error = %failure.message,
                "Step faulted"
            );
            ctx.emit(
                Some(label),
                EventKind::StepFaulted {
                    attempt,
                    kind: failure.kind,
                    message: failure.message.clone(),
                },
            );
            ctx.set_error(failure.clone());

            let handler = step
                .on_error
                .as_ref()
                .or_else(|| self.scope.recovery.handler_for(failure.kind));
            let decision = decide(
                failure.kind,
                attempt,
                handler,
                &self.scope.checker,
                self.scope.recovery.default_max_attempts,
            );

            match decision {
                RecoveryDecision::Retry {
                    next_attempt,
                    ai_fix,
                } => {
                    if let (true, Some(handler)) = (ai_fix, handler) {
                        let record = self
                            .apply_ai_fix(handler, op, &failure, ctx, label, attempt)
                            .await;
                        recovery.push(record);
                        if self.scope.cancel.is_cancelled() {
                            return Err(StepEnd::Abort(TaskFailure::Cancelled));
                        }
                    }
                    let delay = handler
                        .and_then(|h| h.backoff.as_ref())
                        .or(self.scope.recovery.backoff.as_ref())
                        .map(|b| calculate_backoff(next_attempt, b))
                        .unwrap_or(Duration::ZERO);
                    ctx.emit(
                        Some(label),
                        EventKind::RetryScheduled {
                            next_attempt,
                            delay_ms: delay.as_millis() as u64,
                        },
                    );
                    recovery.push(RecoveryAttempt::new(
                        label,
                        attempt,
                        RemediationAction::Retry,
                        format!("attempt {} scheduled after {}ms", next_attempt, delay.as_millis()),
                    ));
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.scope.cancel.cancelled() => {
                                return Err(StepEnd::Abort(TaskFailure::Cancelled));
                            }
                        }
                    }
                    attempt = next_attempt;
                }
                RecoveryDecision::Exit => {
                    recovery.push(RecoveryAttempt::new(
                        label,
                        attempt,
                        RemediationAction::Exit,
                        "task aborted",
                    ));
                    return Err(StepEnd::Abort(TaskFailure::Exit { failure }));
                }
                RecoveryDecision::Continue => {
                    recovery.push(RecoveryAttempt::new(
                        label,
                        attempt,
                        RemediationAction::Continue,
                        "task failed, dependents continue",
                    ));
                    return Err(StepEnd::Continue(TaskFailure::Step { failure }));
                }
                RecoveryDecision::Fail { exhausted } => {
                    if exhausted {
                        ctx.emit(
                            Some(label),
                            EventKind::RetriesExhausted { attempts: attempt },
                        );
                        recovery.push(RecoveryAttempt::new(
                            label,
                            attempt,
                            RemediationAction::Exhausted,
                            format!("gave up after {} attempt(s)", attempt),
                        ));
                    }
                    return Err(StepEnd::Fail(TaskFailure::Step { failure }));
                }
                RecoveryDecision::Fatal => {
                    recovery.push(RecoveryAttempt::new(
                        label,
                        attempt,
                        RemediationAction::Fatal,
                        format!("{} is fatal", failure.kind),
                    ));
                    return Err(StepEnd::Abort(TaskFailure::Fatal { failure }));
                }
            }
        }
    }

    /// Ask for a corrected value and bind it before the next attempt.
    ///
    /// The value replaces `fix_target`, or the operation's first variable
    /// argument. Assistance failures are recorded; the retry still happens.
    async fn apply_ai_fix(
        &self,
        handler: &ErrorHandler,
        op: &OperationRef,
        failure: &StepFailure,
        ctx: &mut ExecutionContext,
        label: &str,
        attempt: u32,
    ) -> RecoveryAttempt {
        let message = format!(
            "{}: {}",
            handler
                .fix_message
                .as_deref()
                .unwrap_or("Repair the input so the operation succeeds"),
            failure
        );
        let timeout = handler.ai_timeout_secs.map(Duration::from_secs);
        let target = handler.fix_target.as_deref().or_else(|| op.first_var());

        let outcome = match consult(ctx, label, McpRequestKind::Fix, message, timeout).await {
            Ok(response) => match (response.value, target) {
                (Some(value), Some(target)) => {
                    if ctx.set_path(target, value) {
                        info!(task = %self.name, step = label, target, "Applied AI fix");
                        format!("applied to '{}'", target)
                    } else {
                        format!("could not bind '{}'", target)
                    }
                }
                (Some(_), None) => "no binding to apply the fix to".to_string(),
                (None, _) => "no corrected value".to_string(),
            },
            Err(e) => format!("failed: {}", e),
        };
        RecoveryAttempt::new(label, attempt, RemediationAction::AiFix, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardsymbi_core::decl::{RecoveryAction, TaskDecl};
    use guardsymbi_core::types::{FailureKind, RunId};
    use guardsymbi_modules::ModuleRegistry;
    use guardsymbi_test_utils::{MockAssistant, ScriptedFunction, StaticFunction};
    use std::sync::atomic::Ordering;

    fn scope(registry: ModuleRegistry, gateway: Option<Arc<McpGateway>>) -> Arc<RunScope> {
        let cancel = CancellationToken::new();
        Arc::new(RunScope {
            interpreter: StepInterpreter::new(
                Arc::new(registry),
                Duration::from_secs(5),
                cancel.clone(),
            ),
            checker: Arc::new(ErrorChecker::default()),
            recovery: RecoveryConfig::default(),
            journal: Arc::new(RunJournal::new(RunId::new(), None)),
            gateway,
            cancel,
        })
    }

    fn flaky_task(handler: ErrorHandler) -> TaskDecl {
        TaskDecl::new("load").with_step(
            StepDecl::call(OperationRef::new("Net", "fetch"))
                .bind("body")
                .on_error(handler),
        )
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let f = ScriptedFunction::new("Net", "fetch")
            .failing(2, FailureKind::IoError)
            .returning(serde_json::json!("ok"));
        let calls = f.counter();
        let mut registry = ModuleRegistry::new();
        registry.register(f);

        let handler = ErrorHandler::new(vec![RecoveryAction::Retry]).with_max_attempts(3);
        let run = TaskDriver::new(scope(registry, None), "load".into(), flaky_task(handler))
            .run(Vec::new(), false)
            .await;

        assert_eq!(run.state, TaskState::Succeeded);
        assert_eq!(run.output, Some(serde_json::json!("ok")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            run.recovery
                .iter()
                .filter(|r| r.action == RemediationAction::Retry)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_retry_bound_is_respected() {
        let f = ScriptedFunction::new("Net", "fetch").always_failing(FailureKind::IoError);
        let calls = f.counter();
        let mut registry = ModuleRegistry::new();
        registry.register(f);

        let handler = ErrorHandler::new(vec![RecoveryAction::Retry]).with_max_attempts(4);
        let run = TaskDriver::new(scope(registry, None), "load".into(), flaky_task(handler))
            .run(Vec::new(), false)
            .await;

        assert_eq!(run.state, TaskState::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(run.failure, Some(TaskFailure::Step { .. })));
        assert!(run
            .recovery
            .iter()
            .any(|r| r.action == RemediationAction::Exhausted));
    }

    #[tokio::test]
    async fn test_exit_aborts_task() {
        let mut registry = ModuleRegistry::new();
        registry.register(ScriptedFunction::new("Net", "fetch").always_failing(FailureKind::IoError));

        let handler = ErrorHandler::new(vec![RecoveryAction::Exit]);
        let run = TaskDriver::new(scope(registry, None), "load".into(), flaky_task(handler))
            .run(Vec::new(), false)
            .await;

        assert_eq!(run.state, TaskState::Aborted);
        assert!(matches!(run.failure, Some(TaskFailure::Exit { .. })));
    }

    #[tokio::test]
    async fn test_continue_marks_downstream() {
        let mut registry = ModuleRegistry::new();
        registry.register(ScriptedFunction::new("Net", "fetch").always_failing(FailureKind::IoError));

        let handler = ErrorHandler::new(vec![RecoveryAction::Continue]);
        let run = TaskDriver::new(scope(registry, None), "load".into(), flaky_task(handler))
            .run(Vec::new(), false)
            .await;

        assert_eq!(run.state, TaskState::Failed);
        assert!(run.continue_downstream);
    }

    #[tokio::test]
    async fn test_ai_fix_rebinds_argument() {
        let mut registry = ModuleRegistry::with_builtins();
        registry.register(StaticFunction::new("Src", "raw", serde_json::json!("{\"a\":1,}")));

        let mock = MockAssistant::new().with_value(McpRequestKind::Fix, serde_json::json!("{\"a\":1}"));
        let gateway = Arc::new(McpGateway::new(Arc::new(mock), Duration::from_secs(1)));

        let task = TaskDecl::new("load")
            .with_step(StepDecl::call(OperationRef::new("Src", "raw")).bind("raw"))
            .with_step(
                StepDecl::call(OperationRef::new("JSON", "parse").arg(
                    guardsymbi_core::decl::Arg::var("raw"),
                ))
                .bind("data")
                .on_error(
                    ErrorHandler::new(vec![RecoveryAction::AiFix, RecoveryAction::Retry])
                        .with_max_attempts(3),
                ),
            )
            .with_output("data");

        let run = TaskDriver::new(scope(registry, Some(gateway.clone())), "load".into(), task)
            .run(Vec::new(), false)
            .await;

        assert_eq!(run.state, TaskState::Succeeded);
        assert_eq!(run.output, Some(serde_json::json!({"a": 1})));
        assert_eq!(gateway.stats_for(McpRequestKind::Fix).sent, 1);
    }

    #[tokio::test]
    async fn test_guard_failure_skips_remaining_steps() {
        let f = ScriptedFunction::new("Net", "fetch").returning(serde_json::json!(1));
        let calls = f.counter();
        let mut registry = ModuleRegistry::new();
        registry.register(f);

        let task = TaskDecl::new("check")
            .with_step(StepDecl::guard(guardsymbi_core::decl::GuardClause::expr(
                "exists missing",
            )))
            .with_step(StepDecl::call(OperationRef::new("Net", "fetch")));

        let run = TaskDriver::new(scope(registry, None), "check".into(), task)
            .run(Vec::new(), false)
            .await;

        assert_eq!(run.state, TaskState::Failed);
        assert!(matches!(run.failure, Some(TaskFailure::Guard { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
