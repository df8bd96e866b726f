use std::collections::HashMap;

use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use guardsymbi_core::error::{GuardError, Result};
use guardsymbi_core::traits::AssistTransport;
use guardsymbi_core::types::{McpRequest, McpResponse};

/// Assistance over a plain JSON endpoint: POST the request, read the response.
///
/// Connections use rustls with TLS 1.2 as the floor.
pub struct HttpsTransport {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
}

impl HttpsTransport {
    pub fn new(url: &str, headers: &HashMap<String, String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .build()
            .map_err(|e| GuardError::McpTransport(format!("HTTP client: {}", e)))?;

        let mut header_map = HeaderMap::new();
        for (k, v) in headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| GuardError::Config(format!("Invalid header name '{}': {}", k, e)))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| GuardError::Config(format!("Invalid value for '{}': {}", k, e)))?;
            header_map.insert(name, value);
        }

        Ok(Self {
            client,
            url: url.to_string(),
            headers: header_map,
        })
    }
}

impl AssistTransport for HttpsTransport {
    fn name(&self) -> &str {
        &self.url
    }

    fn send(&self, request: McpRequest) -> BoxFuture<'_, Result<McpResponse>> {
        Box::pin(async move {
            debug!(url = %self.url, id = %request.id, kind = %request.kind, "POST assistance request");
            let response = self
                .client
                .post(&self.url)
                .headers(self.headers.clone())
                .json(&request)
                .send()
                .await
                .map_err(|e| GuardError::McpTransport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(GuardError::McpTransport(format!("HTTP {}: {}", status, body)));
            }

            response
                .json::<McpResponse>()
                .await
                .map_err(|e| GuardError::McpTransport(format!("Malformed response: {}", e)))
        })
    }
}
