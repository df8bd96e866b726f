use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use rmcp::model::CallToolRequestParams;
use rmcp::service::RunningService;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransport;
use rmcp::{RoleClient, ServiceExt};

use guardsymbi_core::config::{McpConfig, McpToolNames, McpTransport};
use guardsymbi_core::error::{GuardError, Result};
use guardsymbi_core::traits::AssistTransport;
use guardsymbi_core::types::{McpRequest, McpResponse};

use crate::handler::GuardClientHandler;

type McpConnection = RunningService<RoleClient, GuardClientHandler>;

/// Assistance over an MCP server: each request kind maps to one tool call.
pub struct McpToolTransport {
    name: String,
    transport: McpTransport,
    tools: McpToolNames,
    connection: Mutex<Option<McpConnection>>,
}

impl McpToolTransport {
    /// Spawn or dial the server and complete the MCP handshake.
    pub async fn connect(config: &McpConfig) -> Result<Self> {
        let name = match &config.transport {
            McpTransport::Stdio { command, .. } => command.clone(),
            McpTransport::StreamableHttp { url } | McpTransport::Https { url, .. } => url.clone(),
        };
        let connection = open(&name, &config.transport).await?;
        info!(server = %name, "MCP server connected");
        Ok(Self {
            name,
            transport: config.transport.clone(),
            tools: config.tools.clone(),
            connection: Mutex::new(Some(connection)),
        })
    }

    async fn reconnect(&self) -> Result<()> {
        let mut conn = self.connection.lock().await;
        if let Some(mut old) = conn.take() {
            let _ = old.close().await;
        }
        *conn = Some(open(&self.name, &self.transport).await?);
        Ok(())
    }

    async fn call_tool_inner(&self, request: &McpRequest) -> Result<McpResponse> {
        let tool = self.tools.tool_for(request.kind).to_string();
        let arguments = match serde_json::to_value(request)? {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        };

        let conn = self.connection.lock().await;
        let client = conn
            .as_ref()
            .ok_or_else(|| GuardError::McpTransport(format!("'{}' not connected", self.name)))?;

        let params = CallToolRequestParams {
            name: tool.clone().into(),
            arguments,
            meta: None,
            task: None,
        };

        let result = client.call_tool(params).await.map_err(|e| {
            GuardError::McpTransport(format!("Tool call '{}.{}' failed: {}", self.name, tool, e))
        })?;

        let text: Vec<String> = result
            .content
            .iter()
            .map(|c| match c.raw {
                rmcp::model::RawContent::Text(ref t) => t.text.to_string(),
                _ => format!("{:?}", c.raw),
            })
            .collect();
        let text = text.join("\n");

        debug!(server = %self.name, tool = %tool, bytes = text.len(), "MCP tool returned");

        if result.is_error.unwrap_or(false) {
            return Ok(McpResponse::error(&request.id, text));
        }
        Ok(parse_tool_output(&request.id, &text))
    }
}

async fn open(name: &str, transport: &McpTransport) -> Result<McpConnection> {
    let handler = GuardClientHandler::new(name);
    match transport {
        McpTransport::Stdio { command, args, env } => {
            let mut cmd = tokio::process::Command::new(command);
            cmd.args(args);
            for (k, v) in env {
                cmd.env(k, v);
            }

            let child = rmcp::transport::TokioChildProcess::new(cmd).map_err(|e| {
                GuardError::McpTransport(format!("Failed to spawn {}: {}", command, e))
            })?;

            handler.serve(child).await.map_err(|e| {
                GuardError::McpTransport(format!("MCP init for '{}' failed: {}", name, e))
            })
        }
        McpTransport::StreamableHttp { url } => {
            let http = StreamableHttpClientTransport::from_uri(url.as_str());

            <GuardClientHandler as ServiceExt<RoleClient>>::serve(handler, http)
                .await
                .map_err(|e| {
                    GuardError::McpTransport(format!("MCP init for '{}' failed: {}", name, e))
                })
        }
        McpTransport::Https { .. } => Err(GuardError::Config(
            "https endpoints are not MCP tool servers".to_string(),
        )),
    }
}

/// Tool output is either a full response envelope or a bare value.
fn parse_tool_output(id: &str, text: &str) -> McpResponse {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) if value.get("status").is_some() => {
            match serde_json::from_value::<McpResponse>(value.clone()) {
                Ok(response) => response,
                Err(_) => McpResponse::ok(id, Some(value)),
            }
        }
        Ok(value) => McpResponse::ok(id, Some(value)),
        Err(_) if text.trim().is_empty() => McpResponse::ok(id, None),
        Err(_) => McpResponse::ok(id, Some(serde_json::Value::String(text.to_string())))
            .with_explanation(text),
    }
}

impl AssistTransport for McpToolTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, request: McpRequest) -> BoxFuture<'_, Result<McpResponse>> {
        Box::pin(async move {
            let result = self.call_tool_inner(&request).await;

            // One reconnect when the server went away
            if let Err(ref e) = result {
                let err_str = e.to_string();
                if err_str.contains("closed") || err_str.contains("Transport") {
                    warn!(server = %self.name, "MCP transport closed, attempting reconnect");
                    if self.reconnect().await.is_ok() {
                        return self.call_tool_inner(&request).await;
                    }
                }
            }
            result
        })
    }
}
