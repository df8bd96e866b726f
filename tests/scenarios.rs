use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use guardsymbi_core::config::EngineConfig;
use guardsymbi_core::decl::{
    Arg, ErrorHandler, ModuleDecl, OperationRef, RecoveryAction, StepDecl, TaskDecl,
};
use guardsymbi_core::types::{
    EventKind, FailureKind, McpRequestKind, RunStatus, TaskFailure, TaskState,
};
use guardsymbi_core::GuardError;
use guardsymbi_engine::{EngineBuilder, RemediationAction};
use guardsymbi_modules::ModuleRegistry;
use guardsymbi_test_utils::fixtures::SAMPLE_ARTIFACT;
use guardsymbi_test_utils::{
    sample_module, sample_registry, MockAssistant, Recorder, SampleInput, ScriptedFunction,
    StaticFunction,
};

fn call(module: &str, function: &str) -> StepDecl {
    StepDecl::call(OperationRef::new(module, function))
}

#[tokio::test]
async fn test_sample_broken_input_is_repaired_once() {
    let mock = Arc::new(
        MockAssistant::new().with_value(McpRequestKind::Fix, json!(SampleInput::VALID)),
    );
    let engine = EngineBuilder::new()
        .with_module(sample_module())
        .with_registry(sample_registry(SampleInput::BROKEN))
        .with_assistant(mock.clone())
        .build()
        .unwrap();

    let report = engine.run(None).await.unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    for task in &report.tasks {
        assert_eq!(task.state, TaskState::Succeeded, "{} did not succeed", task.name);
    }
    assert_eq!(mock.count(McpRequestKind::Fix), 1);
    assert_eq!(report.ai_count(McpRequestKind::Fix), 1);
    assert_eq!(report.output, Some(json!({ "artifact": SAMPLE_ARTIFACT })));

    let load = report.task("load").unwrap();
    assert_eq!(load.count(RemediationAction::AiFix), 1);
    assert_eq!(load.count(RemediationAction::Retry), 1);
    assert_eq!(
        load.output,
        Some(json!({"name": "q3", "items": [12, 7.5, 3]}))
    );

    // the fix request carries the failing context
    let fix = &mock.requests()[0];
    assert!(fix.message.starts_with("repair the JSON document"));
    assert_eq!(fix.context.get("raw"), Some(&json!(SampleInput::BROKEN)));
}

#[tokio::test]
async fn test_sample_guard_failure_aborts_report() {
    let mock = Arc::new(MockAssistant::new());
    let engine = EngineBuilder::new()
        .with_module(sample_module())
        .with_registry(sample_registry(SampleInput::INVALID_SCHEMA))
        .with_assistant(mock.clone())
        .build()
        .unwrap();

    let report = engine.run(Some("report")).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.state_of("load"), Some(TaskState::Succeeded));
    assert_eq!(report.state_of("validateAndOptimize"), Some(TaskState::Failed));
    assert_eq!(report.state_of("report"), Some(TaskState::Aborted));
    assert!(report.output.is_none());

    let validate = report.task("validateAndOptimize").unwrap();
    assert!(matches!(validate.failure, Some(TaskFailure::Guard { .. })));
    assert_eq!(validate.count(RemediationAction::SuggestFix), 1);
    assert_eq!(validate.count(RemediationAction::Retry), 0);

    assert_eq!(mock.count(McpRequestKind::SuggestFix), 1);
    assert_eq!(mock.count(McpRequestKind::Optimize), 0);
    assert_eq!(
        report.task("report").and_then(|t| t.failure.clone()),
        Some(TaskFailure::AbortedDependency {
            upstream: "validateAndOptimize".to_string()
        })
    );
}

#[tokio::test]
async fn test_guard_failure_stands_when_assistance_fails() {
    let mock = Arc::new(
        MockAssistant::new().with_transport_failure(McpRequestKind::SuggestFix, "connection reset"),
    );
    let engine = EngineBuilder::new()
        .with_module(sample_module())
        .with_registry(sample_registry(SampleInput::INVALID_SCHEMA))
        .with_assistant(mock)
        .build()
        .unwrap();

    let report = engine.run(Some("validateAndOptimize")).await.unwrap();
    let validate = report.task("validateAndOptimize").unwrap();
    assert_eq!(validate.state, TaskState::Failed);
    assert!(matches!(validate.failure, Some(TaskFailure::Guard { .. })));
    assert!(report
        .events_for("validateAndOptimize")
        .any(|e| matches!(e.kind, EventKind::AiFailed { .. })));
}

#[tokio::test]
async fn test_retry_bound_limits_invocations() {
    for bound in [1u32, 2, 5] {
        let f = ScriptedFunction::new("Net", "fetch").always_failing(FailureKind::IoError);
        let calls = f.counter();
        let mut registry = ModuleRegistry::new();
        registry.register(f);

        let module = ModuleDecl::new("Sync").with_task(
            TaskDecl::new("pull").with_step(
                call("Net", "fetch")
                    .on_error(ErrorHandler::new(vec![RecoveryAction::Retry]).with_max_attempts(bound)),
            ),
        );
        let engine = EngineBuilder::new()
            .with_module(module)
            .with_registry(registry)
            .build()
            .unwrap();

        let report = engine.run(Some("pull")).await.unwrap();
        assert_eq!(report.state_of("pull"), Some(TaskState::Failed));
        assert_eq!(calls.load(Ordering::SeqCst), bound);
        assert_eq!(
            report.task("pull").unwrap().count(RemediationAction::Retry),
            (bound - 1) as usize
        );
    }
}

#[tokio::test]
async fn test_fix_without_assistant_still_retries() {
    let f = ScriptedFunction::new("JSON", "load").always_failing(FailureKind::ParseError);
    let calls = f.counter();
    let mut registry = ModuleRegistry::new();
    registry.register(f);
    registry.register(StaticFunction::new("Src", "raw", json!("{")));

    let module = ModuleDecl::new("Parse").with_task(
        TaskDecl::new("parse")
            .with_step(call("Src", "raw").bind("raw"))
            .with_step(
                StepDecl::call(OperationRef::new("JSON", "load").arg(Arg::var("raw"))).on_error(
                    ErrorHandler::new(vec![RecoveryAction::AiFix, RecoveryAction::Retry])
                        .with_max_attempts(2),
                ),
            ),
    );
    let engine = EngineBuilder::new()
        .with_module(module)
        .with_registry(registry)
        .build()
        .unwrap();

    let report = engine.run(Some("parse")).await.unwrap();
    let parse = report.task("parse").unwrap();
    assert_eq!(parse.state, TaskState::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(parse.count(RemediationAction::AiFix), 1);
    assert!(parse.recovery[0].outcome.contains("No MCP transport configured"));
}

#[tokio::test]
async fn test_fan_out_branches_are_independent() {
    let ok = ScriptedFunction::new("Work", "ok").returning(json!("done"));
    let ok_calls = ok.counter();
    let mut registry = ModuleRegistry::new();
    registry.register(StaticFunction::new("Work", "seed", json!(1)));
    registry.register(ok);
    registry.register(ScriptedFunction::new("Work", "broken").always_failing(FailureKind::RuntimeError));
    registry.register(StaticFunction::new("Work", "merge", json!("merged")));

    let module = ModuleDecl::new("Fan")
        .with_task(TaskDecl::new("seed").with_step(call("Work", "seed")))
        .with_task(TaskDecl::new("left").with_input("seed").with_step(call("Work", "broken")))
        .with_task(TaskDecl::new("right").with_input("seed").with_step(call("Work", "ok")))
        .with_task(
            TaskDecl::new("after_right")
                .with_input("right")
                .with_step(call("Work", "merge")),
        )
        .with_task(
            TaskDecl::new("join")
                .with_input("left")
                .with_input("after_right")
                .with_step(call("Work", "merge")),
        );
    let engine = EngineBuilder::new()
        .with_module(module)
        .with_registry(registry)
        .build()
        .unwrap();

    let report = engine.run(Some("join")).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.state_of("seed"), Some(TaskState::Succeeded));
    assert_eq!(report.state_of("left"), Some(TaskState::Failed));
    assert_eq!(report.state_of("right"), Some(TaskState::Succeeded));
    assert_eq!(report.state_of("after_right"), Some(TaskState::Succeeded));
    assert_eq!(report.state_of("join"), Some(TaskState::Aborted));
    assert_eq!(ok_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cycle_reports_members() {
    let module = ModuleDecl::new("Loop")
        .with_task(TaskDecl::new("start"))
        .with_task(TaskDecl::new("a").with_input("start").with_input("c"))
        .with_task(TaskDecl::new("b").with_input("a"))
        .with_task(TaskDecl::new("c").with_input("b"));

    let err = EngineBuilder::new()
        .with_module(module)
        .build()
        .err()
        .expect("cycle must be rejected");
    match err {
        GuardError::CyclicDependency { cycle } => {
            assert_eq!(cycle.len(), 4);
            assert_eq!(cycle.first(), cycle.last());
            for member in ["a", "b", "c"] {
                assert!(cycle.iter().any(|m| m == member), "{} missing from {:?}", member, cycle);
            }
            assert!(!cycle.iter().any(|m| m == "start"));
        }
        other => panic!("expected a cycle, got {}", other),
    }
}

#[tokio::test]
async fn test_steps_run_in_declaration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ModuleRegistry::new();
    for label in ["first", "second", "third"] {
        registry.register(Recorder::new("Seq", label, label, log.clone()));
    }

    let module = ModuleDecl::new("Order").with_task(
        TaskDecl::new("ordered")
            .with_step(call("Seq", "first"))
            .with_step(call("Seq", "second"))
            .with_step(call("Seq", "third").bind("last"))
            .with_output("last"),
    );
    let engine = EngineBuilder::new()
        .with_module(module)
        .with_registry(registry)
        .build()
        .unwrap();

    let report = engine.run(Some("ordered")).await.unwrap();
    assert_eq!(report.output, Some(json!("third")));
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "first:start",
            "first:end",
            "second:start",
            "second:end",
            "third:start",
            "third:end"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_independent_tasks_overlap() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ModuleRegistry::new();
    registry.register(Recorder::new("Io", "a", "a", log.clone()).with_delay(Duration::from_millis(100)));
    registry.register(Recorder::new("Io", "b", "b", log.clone()).with_delay(Duration::from_millis(100)));
    registry.register(StaticFunction::new("Io", "done", json!(true)));

    let module = ModuleDecl::new("Par")
        .with_task(TaskDecl::new("a").with_step(call("Io", "a")))
        .with_task(TaskDecl::new("b").with_step(call("Io", "b")))
        .with_task(
            TaskDecl::new("both")
                .with_input("a")
                .with_input("b")
                .with_step(call("Io", "done")),
        );
    let engine = EngineBuilder::new()
        .with_module(module)
        .with_registry(registry)
        .build()
        .unwrap();

    let report = engine.run(Some("both")).await.unwrap();
    assert!(report.succeeded());
    let log = log.lock().unwrap();
    assert!(log[0].ends_with(":start"));
    assert!(log[1].ends_with(":start"));
}

#[tokio::test(start_paused = true)]
async fn test_max_parallel_one_serializes_tasks() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ModuleRegistry::new();
    registry.register(Recorder::new("Io", "a", "a", log.clone()).with_delay(Duration::from_millis(100)));
    registry.register(Recorder::new("Io", "b", "b", log.clone()).with_delay(Duration::from_millis(100)));

    let module = ModuleDecl::new("Serial")
        .with_task(TaskDecl::new("a").with_step(call("Io", "a")))
        .with_task(TaskDecl::new("b").with_step(call("Io", "b")))
        .with_task(TaskDecl::new("both").with_input("a").with_input("b"));

    let mut config = EngineConfig::default();
    config.engine.max_parallel = 1;
    let engine = EngineBuilder::new()
        .with_module(module)
        .with_registry(registry)
        .with_config(config)
        .build()
        .unwrap();

    let report = engine.run(Some("both")).await.unwrap();
    assert!(report.succeeded());
    let log = log.lock().unwrap();
    assert_eq!(*log, vec!["a:start", "a:end", "b:start", "b:end"]);
}

#[tokio::test]
async fn test_runs_are_idempotent() {
    let engine = EngineBuilder::new()
        .with_module(sample_module())
        .with_registry(sample_registry(SampleInput::VALID))
        .with_assistant(Arc::new(MockAssistant::new()))
        .build()
        .unwrap();

    let first = engine.run(None).await.unwrap();
    let second = engine.run(None).await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.status, second.status);
    assert_eq!(first.output, second.output);
    let states = |r: &guardsymbi_engine::RunReport| {
        r.tasks
            .iter()
            .map(|t| (t.name.clone(), t.state))
            .collect::<Vec<_>>()
    };
    assert_eq!(states(&first), states(&second));
    assert_eq!(first.events.len(), second.events.len());
}

#[tokio::test]
async fn test_continue_runs_dependents_degraded() {
    let mut registry = ModuleRegistry::new();
    registry.register(ScriptedFunction::new("Feed", "latest").always_failing(FailureKind::IoError));
    registry.register(StaticFunction::echo("Feed", "render"));

    let module = ModuleDecl::new("News")
        .with_task(
            TaskDecl::new("fetch").with_step(
                call("Feed", "latest")
                    .bind("items")
                    .on_error(ErrorHandler::new(vec![RecoveryAction::Continue])),
            ),
        )
        .with_task(
            TaskDecl::new("page").with_input("fetch").with_step(
                StepDecl::call(OperationRef::new("Feed", "render").arg(Arg::var("fetch")))
                    .bind("html"),
            ),
        );
    let engine = EngineBuilder::new()
        .with_module(module)
        .with_registry(registry)
        .build()
        .unwrap();

    let report = engine.run(Some("page")).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.state_of("fetch"), Some(TaskState::Failed));

    let page = report.task("page").unwrap();
    assert_eq!(page.state, TaskState::Succeeded);
    assert!(page.degraded);
    assert_eq!(page.output, Some(serde_json::Value::Null));
    assert!(report
        .events_for("page")
        .any(|e| e.kind == EventKind::TaskStarted { degraded: true }));
}

#[tokio::test]
async fn test_exit_aborts_only_dependents() {
    let mut registry = ModuleRegistry::new();
    registry.register(ScriptedFunction::new("Db", "migrate").always_failing(FailureKind::RuntimeError));
    registry.register(StaticFunction::new("Db", "vacuum", json!("ok")));

    let module = ModuleDecl::new("Maint")
        .with_task(
            TaskDecl::new("migrate").with_step(
                call("Db", "migrate").on_error(ErrorHandler::new(vec![RecoveryAction::Exit])),
            ),
        )
        .with_task(TaskDecl::new("vacuum").with_step(call("Db", "vacuum")))
        .with_task(TaskDecl::new("seed").with_input("migrate"))
        .with_task(
            TaskDecl::new("all")
                .with_input("seed")
                .with_input("vacuum"),
        );
    let engine = EngineBuilder::new()
        .with_module(module)
        .with_registry(registry)
        .build()
        .unwrap();

    let report = engine.run(Some("all")).await.unwrap();
    assert_eq!(report.state_of("migrate"), Some(TaskState::Aborted));
    assert!(matches!(
        report.task("migrate").and_then(|t| t.failure.clone()),
        Some(TaskFailure::Exit { .. })
    ));
    assert_eq!(report.state_of("vacuum"), Some(TaskState::Succeeded));
    assert_eq!(report.state_of("seed"), Some(TaskState::Aborted));
    assert_eq!(report.state_of("all"), Some(TaskState::Aborted));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_in_flight_tasks() {
    let mut registry = ModuleRegistry::new();
    registry.register(
        ScriptedFunction::new("Slow", "crunch")
            .returning(json!(1))
            .with_delay(Duration::from_secs(10)),
    );
    registry.register(StaticFunction::new("Slow", "quick", json!(2)));

    let module = ModuleDecl::new("Batch")
        .with_task(TaskDecl::new("quick").with_step(call("Slow", "quick")))
        .with_task(TaskDecl::new("crunch").with_step(call("Slow", "crunch")))
        .with_task(
            TaskDecl::new("publish")
                .with_input("quick")
                .with_input("crunch"),
        );
    let engine = EngineBuilder::new()
        .with_module(module)
        .with_registry(registry)
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = engine.run_with_cancel(Some("publish"), cancel).await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.state_of("quick"), Some(TaskState::Succeeded));
    assert_eq!(report.state_of("crunch"), Some(TaskState::Aborted));
    assert_eq!(report.state_of("publish"), Some(TaskState::Aborted));
    assert_eq!(
        report.task("crunch").and_then(|t| t.failure.clone()),
        Some(TaskFailure::Cancelled)
    );
    assert!(report.tasks.iter().all(|t| t.state.is_terminal()));
}

#[tokio::test(start_paused = true)]
async fn test_run_deadline_cancels() {
    let mut registry = ModuleRegistry::new();
    registry.register(
        ScriptedFunction::new("Slow", "crunch")
            .returning(json!(1))
            .with_delay(Duration::from_secs(10)),
    );
    let module = ModuleDecl::new("Batch")
        .with_task(TaskDecl::new("crunch").with_step(call("Slow", "crunch")));

    let mut config = EngineConfig::default();
    config.engine.run_timeout_secs = Some(1);
    let engine = EngineBuilder::new()
        .with_module(module)
        .with_registry(registry)
        .with_config(config)
        .build()
        .unwrap();

    let report = engine.run(Some("crunch")).await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.state_of("crunch"), Some(TaskState::Aborted));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_fix_does_not_reattempt() {
    let f = ScriptedFunction::new("JSON", "load").always_failing(FailureKind::ParseError);
    let calls = f.counter();
    let mut registry = ModuleRegistry::new();
    registry.register(f);
    registry.register(StaticFunction::new("Src", "raw", json!("{")));

    let module = ModuleDecl::new("Parse").with_task(
        TaskDecl::new("parse")
            .with_step(call("Src", "raw").bind("raw"))
            .with_step(
                StepDecl::call(OperationRef::new("JSON", "load").arg(Arg::var("raw"))).on_error(
                    ErrorHandler::new(vec![RecoveryAction::AiFix, RecoveryAction::Retry])
                        .with_max_attempts(3),
                ),
            ),
    );
    let mock = Arc::new(
        MockAssistant::new()
            .with_value(McpRequestKind::Fix, json!("{}"))
            .with_delay(Duration::from_secs(10)),
    );
    let engine = EngineBuilder::new()
        .with_module(module)
        .with_registry(registry)
        .with_assistant(mock.clone())
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let report = engine.run_with_cancel(Some("parse"), cancel).await.unwrap();
    let parse = report.task("parse").unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(parse.state, TaskState::Aborted);
    assert_eq!(parse.failure, Some(TaskFailure::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(mock.count(McpRequestKind::Fix), 1);
    assert_eq!(parse.count(RemediationAction::Retry), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_guard_else_aborts_task() {
    let mock = Arc::new(MockAssistant::new().with_delay(Duration::from_secs(10)));
    let engine = EngineBuilder::new()
        .with_module(sample_module())
        .with_registry(sample_registry(SampleInput::INVALID_SCHEMA))
        .with_assistant(mock.clone())
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let report = engine
        .run_with_cancel(Some("validateAndOptimize"), cancel)
        .await
        .unwrap();
    let validate = report.task("validateAndOptimize").unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(validate.state, TaskState::Aborted);
    assert_eq!(validate.failure, Some(TaskFailure::Cancelled));
    assert_eq!(mock.count(McpRequestKind::SuggestFix), 1);
}

#[tokio::test]
async fn test_fan_in_keeps_same_named_inputs_apart() {
    let mut registry = ModuleRegistry::new();
    registry.register(StaticFunction::new("SrcA", "read", json!("from A")));
    registry.register(StaticFunction::new("SrcB", "read", json!("from B")));
    registry.register(StaticFunction::collect("Util", "pair"));

    let engine = EngineBuilder::new()
        .with_module(ModuleDecl::new("A").with_task(TaskDecl::new("load").with_step(call("SrcA", "read"))))
        .with_module(ModuleDecl::new("B").with_task(TaskDecl::new("load").with_step(call("SrcB", "read"))))
        .with_module(
            ModuleDecl::new("C").with_task(
                TaskDecl::new("merge")
                    .with_input("A.load")
                    .with_input("B.load")
                    .with_step(StepDecl::call(
                        OperationRef::new("Util", "pair")
                            .arg(Arg::var("A.load"))
                            .arg(Arg::var("B.load")),
                    )),
            ),
        )
        .with_registry(registry)
        .build()
        .unwrap();

    let report = engine.run(Some("merge")).await.unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.output, Some(json!(["from A", "from B"])));
}
