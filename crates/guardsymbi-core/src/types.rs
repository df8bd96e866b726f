use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordered snapshot of context bindings.
pub type ContextSnapshot = IndexMap<String, serde_json::Value>;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a task within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Aborted
        )
    }

    /// Legal transitions. Any non-terminal state may be aborted.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Pending, Ready) | (Ready, Running) => true,
            (Running, Succeeded) | (Running, Failed) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Classification tag attached to every step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ParseError,
    ValidationError,
    IoError,
    TimeoutError,
    UnknownOperation,
    RuntimeError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::ParseError => "ParseError",
            FailureKind::ValidationError => "ValidationError",
            FailureKind::IoError => "IOError",
            FailureKind::TimeoutError => "TimeoutError",
            FailureKind::UnknownOperation => "UnknownOperation",
            FailureKind::RuntimeError => "RuntimeError",
        };
        f.write_str(s)
    }
}

/// A fault raised by a step's operation, captured as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub module: String,
    pub function: String,
    pub kind: FailureKind,
    pub message: String,
    /// Original error payload from the module, if it supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl StepFailure {
    /// A fault not yet attributed to a module function.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            module: String::new(),
            function: String::new(),
            kind,
            message: message.into(),
            payload: None,
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ParseError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ValidationError, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(FailureKind::IoError, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RuntimeError, message)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attribute the fault to `module.function`.
    pub fn at(mut self, module: &str, function: &str) -> Self {
        self.module = module.to_string();
        self.function = function.to_string();
        self
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in {}.{}: {}",
            self.kind, self.module, self.function, self.message
        )
    }
}

/// Why a task did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskFailure {
    /// An operation fault that recovery could not resolve.
    Step { failure: StepFailure },
    /// A guard precondition failed.
    Guard { step: String, reason: String },
    /// `exit` in an onError block.
    Exit { failure: StepFailure },
    /// Fault classified as fatal.
    Fatal { failure: StepFailure },
    /// An upstream task failed or aborted.
    AbortedDependency { upstream: String },
    Cancelled,
}

impl TaskFailure {
    /// Short tag for reports.
    pub fn kind(&self) -> String {
        match self {
            TaskFailure::Step { failure } => format!("StepFailure({})", failure.kind),
            TaskFailure::Guard { .. } => "GuardFailure".to_string(),
            TaskFailure::Exit { failure } => format!("Exit({})", failure.kind),
            TaskFailure::Fatal { failure } => format!("Fatal({})", failure.kind),
            TaskFailure::AbortedDependency { .. } => "AbortedDependency".to_string(),
            TaskFailure::Cancelled => "Cancelled".to_string(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::Step { failure }
            | TaskFailure::Exit { failure }
            | TaskFailure::Fatal { failure } => write!(f, "{}: {}", self.kind(), failure),
            TaskFailure::Guard { step, reason } => {
                write!(f, "GuardFailure at {}: {}", step, reason)
            }
            TaskFailure::AbortedDependency { upstream } => {
                write!(f, "AbortedDependency: upstream '{}' did not succeed", upstream)
            }
            TaskFailure::Cancelled => f.write_str("Cancelled"),
        }
    }
}

// ---- MCP wire contract ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum McpRequestKind {
    Fix,
    SuggestFix,
    Optimize,
    ExplainError,
}

impl McpRequestKind {
    pub const ALL: [McpRequestKind; 4] = [
        McpRequestKind::Fix,
        McpRequestKind::SuggestFix,
        McpRequestKind::Optimize,
        McpRequestKind::ExplainError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            McpRequestKind::Fix => "fix",
            McpRequestKind::SuggestFix => "suggestFix",
            McpRequestKind::Optimize => "optimize",
            McpRequestKind::ExplainError => "explainError",
        }
    }

    /// Map an `AI.<function>` step operation to a request kind.
    pub fn from_function(function: &str) -> Option<Self> {
        match function {
            "fix" => Some(McpRequestKind::Fix),
            "suggestFix" | "suggest_fix" => Some(McpRequestKind::SuggestFix),
            "optimize" => Some(McpRequestKind::Optimize),
            "explainError" | "explain_error" => Some(McpRequestKind::ExplainError),
            _ => None,
        }
    }
}

impl fmt::Display for McpRequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpRequest {
    pub id: String,
    pub kind: McpRequestKind,
    pub message: String,
    #[serde(default)]
    pub context: ContextSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpResponse {
    pub id: String,
    pub status: McpStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl McpResponse {
    pub fn ok(id: impl Into<String>, value: Option<serde_json::Value>) -> Self {
        Self {
            id: id.into(),
            status: McpStatus::Ok,
            value,
            explanation: None,
        }
    }

    pub fn error(id: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: McpStatus::Error,
            value: None,
            explanation: Some(explanation.into()),
        }
    }

    pub fn with_explanation(mut self, text: impl Into<String>) -> Self {
        self.explanation = Some(text.into());
        self
    }
}

// ---- Execution log ----

/// What happened at a state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted { entry: String, tasks: usize },
    TaskReady,
    TaskStarted { degraded: bool },
    StepStarted { attempt: u32 },
    StepSucceeded { attempt: u32 },
    StepFaulted { attempt: u32, kind: FailureKind, message: String },
    RetryScheduled { next_attempt: u32, delay_ms: u64 },
    RetriesExhausted { attempts: u32 },
    GuardPassed,
    GuardFailed { reason: String },
    AiRequested { id: String, kind: McpRequestKind },
    AiResponded { id: String, kind: McpRequestKind, has_value: bool },
    AiFailed { id: String, kind: McpRequestKind, error: String },
    TaskSucceeded,
    TaskFailed { reason: String },
    TaskAborted { reason: String },
    RunCompleted { status: RunStatus },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::RunStarted { .. } => "run_started",
            EventKind::TaskReady => "task_ready",
            EventKind::TaskStarted { .. } => "task_started",
            EventKind::StepStarted { .. } => "step_started",
            EventKind::StepSucceeded { .. } => "step_succeeded",
            EventKind::StepFaulted { .. } => "step_faulted",
            EventKind::RetryScheduled { .. } => "retry_scheduled",
            EventKind::RetriesExhausted { .. } => "retries_exhausted",
            EventKind::GuardPassed => "guard_passed",
            EventKind::GuardFailed { .. } => "guard_failed",
            EventKind::AiRequested { .. } => "ai_requested",
            EventKind::AiResponded { .. } => "ai_responded",
            EventKind::AiFailed { .. } => "ai_failed",
            EventKind::TaskSucceeded => "task_succeeded",
            EventKind::TaskFailed { .. } => "task_failed",
            EventKind::TaskAborted { .. } => "task_aborted",
            EventKind::RunCompleted { .. } => "run_completed",
        }
    }
}

/// One entry in the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_transitions() {
        use TaskState::*;
        assert!(Pending.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Running));
        assert!(Running.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Aborted));
        assert!(Running.can_transition_to(Aborted));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Succeeded.can_transition_to(Aborted));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn test_mcp_request_wire_format() {
        let mut context = ContextSnapshot::new();
        context.insert("raw".into(), serde_json::json!("{bad"));
        let req = McpRequest {
            id: "r1".into(),
            kind: McpRequestKind::SuggestFix,
            message: "schema invalid".into(),
            context,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["kind"], "suggestFix");
        assert_eq!(json["context"]["raw"], "{bad");

        let resp: McpResponse =
            serde_json::from_str(r#"{"id":"r1","status":"ok","value":{"a":1}}"#).unwrap();
        assert_eq!(resp.status, McpStatus::Ok);
        assert_eq!(resp.value, Some(serde_json::json!({"a": 1})));
        assert!(resp.explanation.is_none());
    }

    #[test]
    fn test_request_kind_from_function() {
        assert_eq!(
            McpRequestKind::from_function("optimize"),
            Some(McpRequestKind::Optimize)
        );
        assert_eq!(
            McpRequestKind::from_function("explainError"),
            Some(McpRequestKind::ExplainError)
        );
        assert_eq!(McpRequestKind::from_function("render"), None);
    }

    #[test]
    fn test_failure_display() {
        let f = StepFailure::parse("unexpected token").at("JSON", "parse");
        assert_eq!(f.to_string(), "ParseError in JSON.parse: unexpected token");
        let t = TaskFailure::Step { failure: f };
        assert_eq!(t.kind(), "StepFailure(ParseError)");
    }

    #[test]
    fn test_event_serializes_flat() {
        let ev = RunEvent {
            run_id: RunId("run".into()),
            seq: 3,
            task: Some("load".into()),
            step: None,
            timestamp: Utc::now(),
            kind: EventKind::StepStarted { attempt: 2 },
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "step_started");
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["task"], "load");
    }
}
