pub mod assist;
pub mod context;
pub mod engine;
pub mod graph;
pub mod guard;
pub mod interpreter;
pub mod journal;
pub mod recovery;
pub mod report;
pub mod run_log;
pub mod scheduler;
pub mod state;
pub mod task;

pub use context::ExecutionContext;
pub use engine::{Engine, EngineBuilder};
pub use graph::{DependencyGraph, GraphBuilder, TaskId, TaskNode};
pub use guard::{evaluate_expr, GuardEvaluator, GuardOutcome};
pub use interpreter::StepInterpreter;
pub use journal::RunJournal;
pub use recovery::{decide, ErrorChecker, RecoveryDecision};
pub use report::{RecoveryAttempt, RemediationAction, RunReport, TaskReport};
pub use run_log::RunLogger;
pub use scheduler::{Schedule, Scheduler};
pub use task::{RunScope, TaskDriver, TaskRun};
