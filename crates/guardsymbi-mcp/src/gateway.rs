use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use guardsymbi_core::error::{GuardError, Result};
use guardsymbi_core::traits::AssistTransport;
use guardsymbi_core::types::{ContextSnapshot, McpRequest, McpRequestKind, McpResponse, McpStatus};

/// Per-kind request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindStats {
    pub sent: u32,
    pub ok: u32,
    pub rejected: u32,
    pub timed_out: u32,
    pub failed: u32,
}

/// Correlates assistance requests with responses over one transport.
///
/// Every request carries a fresh id; a response whose id differs is a
/// transport error. Requests still pending when [`cancel_all`] fires
/// resolve to [`GuardError::Cancelled`].
///
/// [`cancel_all`]: McpGateway::cancel_all
pub struct McpGateway {
    transport: Arc<dyn AssistTransport>,
    timeout: Duration,
    in_flight: Mutex<HashMap<String, McpRequestKind>>,
    stats: Mutex<HashMap<McpRequestKind, KindStats>>,
    cancel: CancellationToken,
}

impl McpGateway {
    pub fn new(transport: Arc<dyn AssistTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            in_flight: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Tie pending requests to an outer cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build a request with a fresh correlation id.
    pub fn new_request(
        &self,
        kind: McpRequestKind,
        message: impl Into<String>,
        context: ContextSnapshot,
    ) -> McpRequest {
        McpRequest {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            message: message.into(),
            context,
        }
    }

    /// Send a prepared request and await its correlated response.
    ///
    /// `Ok` only for a response with status `ok`; an `error` status maps
    /// to [`GuardError::McpRejected`].
    pub async fn dispatch(
        &self,
        request: McpRequest,
        timeout: Option<Duration>,
    ) -> Result<McpResponse> {
        let id = request.id.clone();
        let kind = request.kind;
        let timeout = timeout.unwrap_or(self.timeout);

        if self.cancel.is_cancelled() {
            return Err(GuardError::Cancelled);
        }

        self.lock_in_flight().insert(id.clone(), kind);
        self.bump(kind, |s| s.sent += 1);
        debug!(id = %id, kind = %kind, transport = %self.transport.name(), "MCP request sent");

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(GuardError::Cancelled),
            res = tokio::time::timeout(timeout, self.transport.send(request)) => match res {
                Ok(inner) => inner,
                Err(_) => Err(GuardError::McpTimeout {
                    id: id.clone(),
                    kind: kind.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
        };

        self.lock_in_flight().remove(&id);

        let result = outcome.and_then(|response| {
            if response.id != id {
                return Err(GuardError::McpTransport(format!(
                    "response id '{}' does not match request '{}'",
                    response.id, id
                )));
            }
            match response.status {
                McpStatus::Ok => Ok(response),
                McpStatus::Error => Err(GuardError::McpRejected {
                    id: id.clone(),
                    message: response
                        .explanation
                        .unwrap_or_else(|| "no explanation".to_string()),
                }),
            }
        });

        match &result {
            Ok(_) => self.bump(kind, |s| s.ok += 1),
            Err(GuardError::McpRejected { .. }) => self.bump(kind, |s| s.rejected += 1),
            Err(GuardError::McpTimeout { .. }) => {
                warn!(id = %id, kind = %kind, "MCP request timed out");
                self.bump(kind, |s| s.timed_out += 1)
            }
            Err(e) => {
                warn!(id = %id, kind = %kind, error = %e, "MCP request failed");
                self.bump(kind, |s| s.failed += 1)
            }
        }
        result
    }

    /// Build and dispatch in one call.
    pub async fn request(
        &self,
        kind: McpRequestKind,
        message: impl Into<String>,
        context: ContextSnapshot,
    ) -> Result<McpResponse> {
        let request = self.new_request(kind, message, context);
        self.dispatch(request, None).await
    }

    pub async fn fix(&self, message: &str, context: ContextSnapshot) -> Result<McpResponse> {
        self.request(McpRequestKind::Fix, message, context).await
    }

    pub async fn suggest_fix(&self, message: &str, context: ContextSnapshot) -> Result<McpResponse> {
        self.request(McpRequestKind::SuggestFix, message, context).await
    }

    pub async fn optimize(&self, message: &str, context: ContextSnapshot) -> Result<McpResponse> {
        self.request(McpRequestKind::Optimize, message, context).await
    }

    pub async fn explain_error(
        &self,
        message: &str,
        context: ContextSnapshot,
    ) -> Result<McpResponse> {
        self.request(McpRequestKind::ExplainError, message, context).await
    }

    /// Abandon every pending request.
    pub fn cancel_all(&self) {
        let pending = self.in_flight_count();
        if pending > 0 {
            debug!(pending, "Cancelling in-flight MCP requests");
        }
        self.cancel.cancel();
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    pub fn stats(&self) -> HashMap<McpRequestKind, KindStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn stats_for(&self, kind: McpRequestKind) -> KindStats {
        self.stats().get(&kind).copied().unwrap_or_default()
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, McpRequestKind>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self, kind: McpRequestKind, f: impl FnOnce(&mut KindStats)) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(stats.entry(kind).or_default());
    }
}
