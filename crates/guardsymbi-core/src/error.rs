use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    // Build-time errors
    #[error("Task '{task}' references unknown task '{reference}'")]
    UnknownTaskReference { task: String, reference: String },

    #[error("Task '{task}' reference '{reference}' is ambiguous: {candidates:?}")]
    AmbiguousTaskReference {
        task: String,
        reference: String,
        candidates: Vec<String>,
    },

    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Duplicate task '{task}' in module '{module}'")]
    DuplicateTaskName { module: String, task: String },

    #[error("Module '{module}' declared twice with version {version}")]
    DuplicateModule { module: String, version: String },

    #[error("Task '{task}' calls AI.{function} without an @mcp/@ai annotation")]
    AiNotPermitted { task: String, function: String },

    #[error("Entry task not found: {0}")]
    UnknownEntryTask(String),

    #[error("Invalid declaration: {0}")]
    Declaration(String),

    // MCP errors
    #[error("MCP request {id} ({kind}) timed out after {timeout_ms}ms")]
    McpTimeout {
        id: String,
        kind: String,
        timeout_ms: u64,
    },

    #[error("MCP request {id} rejected: {message}")]
    McpRejected { id: String, message: String },

    #[error("MCP transport error: {0}")]
    McpTransport(String),

    #[error("No MCP transport configured")]
    McpUnavailable,

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GuardError {
    /// Whether this error was raised while validating declarations,
    /// before any task could run.
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            GuardError::UnknownTaskReference { .. }
                | GuardError::AmbiguousTaskReference { .. }
                | GuardError::CyclicDependency { .. }
                | GuardError::DuplicateTaskName { .. }
                | GuardError::DuplicateModule { .. }
                | GuardError::AiNotPermitted { .. }
                | GuardError::Declaration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;
