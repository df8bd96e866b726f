use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use guardsymbi_core::error::{GuardError, Result};
use guardsymbi_core::traits::AssistTransport;
use guardsymbi_core::types::{McpRequest, McpRequestKind, McpResponse};

#[derive(Clone)]
enum Reply {
    Value(serde_json::Value),
    Error(String),
    TransportFailure(String),
}

/// Scripted assistance collaborator that records every request.
///
/// Kinds without a script answer `ok` with no value and a canned explanation.
#[derive(Default)]
pub struct MockAssistant {
    replies: HashMap<McpRequestKind, Reply>,
    requests: Mutex<Vec<McpRequest>>,
    delay: Option<Duration>,
    wrong_ids: bool,
}

impl MockAssistant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, kind: McpRequestKind, value: serde_json::Value) -> Self {
        self.replies.insert(kind, Reply::Value(value));
        self
    }

    pub fn with_error(mut self, kind: McpRequestKind, explanation: &str) -> Self {
        self.replies
            .insert(kind, Reply::Error(explanation.to_string()));
        self
    }

    pub fn with_transport_failure(mut self, kind: McpRequestKind, message: &str) -> Self {
        self.replies
            .insert(kind, Reply::TransportFailure(message.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answer with an id that does not match the request.
    pub fn with_wrong_ids(mut self) -> Self {
        self.wrong_ids = true;
        self
    }

    pub fn requests(&self) -> Vec<McpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, kind: McpRequestKind) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }
}

impl AssistTransport for MockAssistant {
    fn name(&self) -> &str {
        "mock"
    }

    fn send(&self, request: McpRequest) -> BoxFuture<'_, Result<McpResponse>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let id = if self.wrong_ids {
                format!("{}-other", request.id)
            } else {
                request.id.clone()
            };

            match self.replies.get(&request.kind).cloned() {
                Some(Reply::Value(v)) => Ok(McpResponse::ok(id, Some(v))),
                Some(Reply::Error(e)) => Ok(McpResponse::error(id, e)),
                Some(Reply::TransportFailure(e)) => Err(GuardError::McpTransport(e)),
                None => Ok(McpResponse::ok(id, None)
                    .with_explanation(format!("mock {} for: {}", request.kind, request.message))),
            }
        })
    }
}
