use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{McpRequest, McpResponse, StepFailure};

/// Outcome of a module function call.
pub type CallResult = std::result::Result<serde_json::Value, StepFailure>;

/// A callable exposed by an external module (`File.read`, `JSON.parse`, ...).
pub trait ModuleFunction: Send + Sync + 'static {
    /// Module name the function belongs to.
    fn module(&self) -> &str;

    /// Function name within the module.
    fn name(&self) -> &str;

    /// Fixed argument count, if the contract declares one.
    fn arity(&self) -> Option<usize> {
        None
    }

    /// Invoke the function with arguments resolved from the execution context.
    fn call(&self, args: Vec<serde_json::Value>) -> BoxFuture<'_, CallResult>;

    /// Per-call timeout override in seconds.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// Transport to the AI-assistance collaborator.
pub trait AssistTransport: Send + Sync + 'static {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Deliver one correlated request and await its response.
    fn send(&self, request: McpRequest) -> BoxFuture<'_, Result<McpResponse>>;
}
