use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::info;

use guardsymbi_core::config::EngineConfig;
use guardsymbi_core::decl::ModuleDecl;
use guardsymbi_core::error::{GuardError, Result};
use guardsymbi_core::event::EventBus;
use guardsymbi_core::traits::AssistTransport;
use guardsymbi_core::types::{EventKind, RunId, RunStatus, TaskState};
use guardsymbi_mcp::McpGateway;
use guardsymbi_modules::ModuleRegistry;

use crate::graph::{DependencyGraph, GraphBuilder, TaskId};
use crate::interpreter::StepInterpreter;
use crate::journal::RunJournal;
use crate::recovery::ErrorChecker;
use crate::report::{RunReport, TaskReport};
use crate::scheduler::Scheduler;
use crate::task::RunScope;

const DEFAULT_ASSIST_TIMEOUT_SECS: u64 = 30;

/// Assembles an [`Engine`] from declarations, modules, config and an optional
/// assistance transport.
pub struct EngineBuilder {
    modules: Vec<ModuleDecl>,
    registry: Option<ModuleRegistry>,
    config: EngineConfig,
    assistant: Option<Arc<dyn AssistTransport>>,
    event_bus: Option<Arc<EventBus>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            registry: None,
            config: EngineConfig::default(),
            assistant: None,
            event_bus: None,
        }
    }

    pub fn with_module(mut self, module: ModuleDecl) -> Self {
        self.modules.push(module);
        self
    }

    pub fn with_modules(mut self, modules: impl IntoIterator<Item = ModuleDecl>) -> Self {
        self.modules.extend(modules);
        self
    }

    /// Defaults to the builtin modules.
    pub fn with_registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_assistant(mut self, transport: Arc<dyn AssistTransport>) -> Self {
        self.assistant = Some(transport);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Validate the declarations and build the dependency graph.
    ///
    /// Any build-time error means nothing will ever run.
    pub fn build(self) -> Result<Engine> {
        let graph = GraphBuilder::new()
            .require_ai_annotation(self.config.engine.require_ai_annotation)
            .build(self.modules)?;
        let checker = ErrorChecker::from_config(&self.config.recovery)?;

        info!(
            tasks = graph.len(),
            assistant = self.assistant.as_ref().map(|a| a.name()).unwrap_or("none"),
            "Engine ready"
        );

        Ok(Engine {
            graph: Arc::new(graph),
            registry: Arc::new(self.registry.unwrap_or_else(ModuleRegistry::with_builtins)),
            checker: Arc::new(checker),
            config: self.config,
            assistant: self.assistant,
            event_bus: self.event_bus.unwrap_or_default(),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated workflow, ready to run any number of times.
pub struct Engine {
    graph: Arc<DependencyGraph>,
    registry: Arc<ModuleRegistry>,
    checker: Arc<ErrorChecker>,
    config: EngineConfig,
    assistant: Option<Arc<dyn AssistTransport>>,
    event_bus: Arc<EventBus>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// The given task, or the declared `run` directive when `None`.
    pub fn resolve_entry(&self, entry: Option<&str>) -> Result<TaskId> {
        match entry.or_else(|| self.graph.run_directive()) {
            Some(name) => self.graph.lookup(name),
            None => Err(GuardError::UnknownEntryTask(
                "no task given and no run directive declared".to_string(),
            )),
        }
    }

    /// Execution order of the entry closure, without running anything.
    pub fn plan(&self, entry: Option<&str>) -> Result<Vec<String>> {
        let entry = self.resolve_entry(entry)?;
        Ok(self
            .graph
            .closure(entry)
            .into_iter()
            .map(|id| self.graph.display_name(id))
            .collect())
    }

    pub async fn run(&self, entry: Option<&str>) -> Result<RunReport> {
        self.run_with_cancel(entry, CancellationToken::new()).await
    }

    /// Run the entry task and everything it depends on.
    ///
    /// Cancelling `cancel` aborts in-flight module and assistance calls and
    /// marks every unfinished task `Aborted`. Task faults are reported, not
    /// returned; only an unresolvable entry is an `Err`.
    pub async fn run_with_cancel(
        &self,
        entry: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let start = Instant::now();
        let entry_id = self.resolve_entry(entry)?;
        let entry_name = self.graph.display_name(entry_id);
        let run_id = RunId::new();
        let run_cancel = cancel.child_token();

        let journal = Arc::new(RunJournal::new(
            run_id.clone(),
            Some(self.event_bus.clone()),
        ));
        let assist_timeout = Duration::from_secs(
            self.config
                .mcp
                .as_ref()
                .map(|m| m.timeout_secs)
                .unwrap_or(DEFAULT_ASSIST_TIMEOUT_SECS),
        );
        let gateway = self.assistant.as_ref().map(|transport| {
            Arc::new(
                McpGateway::new(transport.clone(), assist_timeout)
                    .with_cancel(run_cancel.child_token()),
            )
        });

        let scope = Arc::new(RunScope {
            interpreter: StepInterpreter::new(
                self.registry.clone(),
                Duration::from_secs(self.config.engine.step_timeout_secs),
                run_cancel.clone(),
            ),
            checker: self.checker.clone(),
            recovery: self.config.recovery.clone(),
            journal: journal.clone(),
            gateway: gateway.clone(),
            cancel: run_cancel.clone(),
        });

        let closure_len = self.graph.closure(entry_id).len();
        info!(run = %run_id, entry = %entry_name, tasks = closure_len, "Run started");
        journal.record(
            None,
            None,
            EventKind::RunStarted {
                entry: entry_name.clone(),
                tasks: closure_len,
            },
        );

        let schedule = Scheduler::new(
            self.graph.clone(),
            scope,
            self.config.engine.max_parallel,
        )
        .with_run_timeout(self.config.engine.run_timeout_secs.map(Duration::from_secs))
        .run(entry_id)
        .await;

        let all_succeeded = schedule
            .runs
            .iter()
            .all(|(_, run)| run.state == TaskState::Succeeded);
        let status = if all_succeeded {
            RunStatus::Succeeded
        } else if schedule.cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };

        let mut output = None;
        let tasks: Vec<TaskReport> = schedule
            .runs
            .into_iter()
            .map(|(id, run)| {
                let node = self.graph.node(id);
                if id == entry_id && run.state == TaskState::Succeeded {
                    output = run.output.clone();
                }
                TaskReport {
                    name: node.name().to_string(),
                    module: node.module.clone(),
                    state: run.state,
                    output: run.output,
                    failure: run.failure,
                    degraded: run.degraded,
                    recovery: run.recovery,
                    elapsed_ms: run.elapsed_ms,
                }
            })
            .collect();

        journal.record(None, None, EventKind::RunCompleted { status });
        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(run = %run_id, status = %status, elapsed_ms, "Run completed");

        Ok(RunReport {
            run_id,
            entry: entry_name,
            status,
            output,
            tasks,
            ai_calls: gateway.map(|g| g.stats()).unwrap_or_default(),
            events: journal.events(),
            elapsed_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardsymbi_core::decl::{OperationRef, StepDecl, TaskDecl};
    use guardsymbi_core::types::{FailureKind, McpRequestKind, TaskFailure};
    use guardsymbi_test_utils::{
        sample_module, sample_registry, MockAssistant, SampleInput, ScriptedFunction,
        StaticFunction,
    };
    use serde_json::json;

    fn engine(raw: &str, mock: Arc<MockAssistant>) -> Engine {
        EngineBuilder::new()
            .with_module(sample_module())
            .with_registry(sample_registry(raw))
            .with_assistant(mock)
            .build()
            .unwrap()
    }

    #[test]
    fn test_plan_follows_dependencies() {
        let e = engine(SampleInput::VALID, Arc::new(MockAssistant::new()));
        assert_eq!(
            e.plan(Some("report")).unwrap(),
            vec!["load", "validateAndOptimize", "report"]
        );
        assert_eq!(e.plan(Some("load")).unwrap(), vec!["load"]);
        // falls back to the run directive
        assert_eq!(e.plan(None).unwrap().last().map(String::as_str), Some("report"));
    }

    #[test]
    fn test_unknown_entry() {
        let e = engine(SampleInput::VALID, Arc::new(MockAssistant::new()));
        assert!(matches!(
            e.plan(Some("publish")),
            Err(GuardError::UnknownEntryTask(_))
        ));
    }

    #[tokio::test]
    async fn test_sample_run_succeeds() {
        let mock = Arc::new(MockAssistant::new());
        let report = engine(SampleInput::VALID, mock.clone())
            .run(None)
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.entry, "report");
        assert_eq!(report.output, Some(json!({"artifact": "reports/q3.pdf"})));
        assert_eq!(report.tasks.len(), 3);
        assert_eq!(mock.count(McpRequestKind::Optimize), 1);
        assert_eq!(mock.count(McpRequestKind::Fix), 0);

        let seqs: Vec<u64> = report.events.iter().map(|e| e.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
        assert!(matches!(
            report.events.last().map(|e| &e.kind),
            Some(EventKind::RunCompleted {
                status: RunStatus::Succeeded
            })
        ));
    }

    #[tokio::test]
    async fn test_failed_dependency_aborts_downstream() {
        let mut registry = ModuleRegistry::new();
        registry.register(ScriptedFunction::new("Net", "fetch").always_failing(FailureKind::IoError));
        registry.register(StaticFunction::echo("Text", "upper"));

        let module = ModuleDecl::new("Pipeline")
            .with_task(
                TaskDecl::new("fetch").with_step(StepDecl::call(OperationRef::new("Net", "fetch"))),
            )
            .with_task(
                TaskDecl::new("shout")
                    .with_input("fetch")
                    .with_step(StepDecl::call(OperationRef::new("Text", "upper"))),
            );

        let engine = EngineBuilder::new()
            .with_module(module)
            .with_registry(registry)
            .build()
            .unwrap();
        let report = engine.run(Some("shout")).await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.state_of("fetch"), Some(TaskState::Failed));
        assert_eq!(report.state_of("shout"), Some(TaskState::Aborted));
        assert_eq!(
            report.task("shout").and_then(|t| t.failure.clone()),
            Some(TaskFailure::AbortedDependency {
                upstream: "fetch".to_string()
            })
        );
        assert!(report.output.is_none());
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_aborts_everything() {
        let e = engine(SampleInput::VALID, Arc::new(MockAssistant::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = e.run_with_cancel(None, cancel).await.unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(report
            .tasks
            .iter()
            .all(|t| t.state == TaskState::Aborted && t.failure == Some(TaskFailure::Cancelled)));
    }
}
