use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use guardsymbi_core::types::{McpRequestKind, RunEvent, RunId, RunStatus, TaskFailure, TaskState};
use guardsymbi_mcp::KindStats;

/// What the recovery machinery (or a guard's else block) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    Retry,
    AiFix,
    Exit,
    Continue,
    Exhausted,
    Fatal,
    SuggestFix,
    ExplainError,
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemediationAction::Retry => "retry",
            RemediationAction::AiFix => "ai_fix",
            RemediationAction::Exit => "exit",
            RemediationAction::Continue => "continue",
            RemediationAction::Exhausted => "exhausted",
            RemediationAction::Fatal => "fatal",
            RemediationAction::SuggestFix => "suggest_fix",
            RemediationAction::ExplainError => "explain_error",
        };
        f.write_str(s)
    }
}

/// One entry in a task's recovery path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub step: String,
    pub attempt: u32,
    pub action: RemediationAction,
    pub outcome: String,
}

impl RecoveryAttempt {
    pub fn new(
        step: &str,
        attempt: u32,
        action: RemediationAction,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            step: step.to_string(),
            attempt,
            action,
            outcome: outcome.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub name: String,
    pub module: String,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    /// Ran with a failed upstream's input replaced by null.
    #[serde(default)]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery: Vec<RecoveryAttempt>,
    pub elapsed_ms: u64,
}

impl TaskReport {
    /// Recovery entries with the given action.
    pub fn count(&self, action: RemediationAction) -> usize {
        self.recovery.iter().filter(|r| r.action == action).count()
    }
}

/// Externally observable result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub entry: String,
    pub status: RunStatus,
    /// Entry task output; absent unless the entry task succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Tasks of the entry closure, in topological order.
    pub tasks: Vec<TaskReport>,
    #[serde(default)]
    pub ai_calls: HashMap<McpRequestKind, KindStats>,
    pub events: Vec<RunEvent>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn task(&self, name: &str) -> Option<&TaskReport> {
        self.tasks
            .iter()
            .find(|t| t.name == name || format!("{}.{}", t.module, t.name) == name)
    }

    pub fn state_of(&self, name: &str) -> Option<TaskState> {
        self.task(name).map(|t| t.state)
    }

    /// Requests of `kind` sent to the assistance collaborator.
    pub fn ai_count(&self, kind: McpRequestKind) -> u32 {
        self.ai_calls.get(&kind).map(|s| s.sent).unwrap_or(0)
    }

    /// Events for one task, in order.
    pub fn events_for<'a>(&'a self, task: &'a str) -> impl Iterator<Item = &'a RunEvent> + 'a {
        self.events
            .iter()
            .filter(move |e| e.task.as_deref() == Some(task))
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Run {} ({}): {} in {}ms",
            self.run_id, self.entry, self.status, self.elapsed_ms
        )?;
        for task in &self.tasks {
            write!(f, "  {:<24} {}", task.name, task.state)?;
            if task.degraded {
                write!(f, " (degraded)")?;
            }
            if let Some(failure) = &task.failure {
                write!(f, "  [{}] {}", failure.kind(), failure)?;
            }
            writeln!(f)?;
            for r in &task.recovery {
                writeln!(
                    f,
                    "      {} #{} {}: {}",
                    r.step, r.attempt, r.action, r.outcome
                )?;
            }
        }
        let mut kinds: Vec<_> = self.ai_calls.iter().filter(|(_, s)| s.sent > 0).collect();
        kinds.sort_by_key(|(k, _)| k.as_str());
        for (kind, stats) in kinds {
            writeln!(
                f,
                "  AI {:<12} sent={} ok={} rejected={} timed_out={} failed={}",
                kind.as_str(),
                stats.sent,
                stats.ok,
                stats.rejected,
                stats.timed_out,
                stats.failed
            )?;
        }
        if let Some(output) = &self.output {
            writeln!(f, "Output: {}", output)?;
        }
        Ok(())
    }
}
