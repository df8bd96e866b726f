pub mod client;
pub mod gateway;
pub mod handler;
pub mod https;

use std::sync::Arc;

use guardsymbi_core::config::{McpConfig, McpTransport};
use guardsymbi_core::error::Result;
use guardsymbi_core::traits::AssistTransport;

pub use client::McpToolTransport;
pub use gateway::{KindStats, McpGateway};
pub use handler::GuardClientHandler;
pub use https::HttpsTransport;

/// Open the transport described by `config`.
pub async fn connect(config: &McpConfig) -> Result<Arc<dyn AssistTransport>> {
    match &config.transport {
        McpTransport::Https { url, headers } => {
            let transport = HttpsTransport::new(url, headers)?;
            Ok(Arc::new(transport))
        }
        McpTransport::Stdio { .. } | McpTransport::StreamableHttp { .. } => {
            let transport = McpToolTransport::connect(config).await?;
            Ok(Arc::new(transport))
        }
    }
}

/// Build a gateway from config, connecting its transport.
pub async fn gateway_from_config(config: &McpConfig) -> Result<McpGateway> {
    let transport = connect(config).await?;
    Ok(McpGateway::new(
        transport,
        std::time::Duration::from_secs(config.timeout_secs),
    ))
}
