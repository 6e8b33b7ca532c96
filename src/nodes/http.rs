/// HTTP request node
///
/// Configuration: `url` (required), `method` (GET), `headers`, `body`.
/// `{{path}}` placeholders in all of them are resolved against the node input.
/// Output is `{statusCode, headers, body}`; a non-2xx status is a failed
/// outcome that still carries the response, a transport error is retried.

use super::{path, NodeContext, NodeHandler, NodeOutcome};
use crate::error::{EngineError, Result};
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::time::Duration;

const NODE_TYPE: &str = "http-request";

#[derive(Debug, Clone)]
pub struct HttpRequestNode {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRequestNode {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    async fn send(&self, input: Value, ctx: NodeContext) -> Result<NodeOutcome> {
        let url = ctx
            .configuration
            .get("url")
            .map(|u| path::render(u, &input))
            .and_then(|u| u.as_str().map(str::to_string))
            .ok_or_else(|| EngineError::Validation("http-request requires a 'url'".to_string()))?;

        let method = ctx.config_str("method").unwrap_or("GET").to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|_| {
            EngineError::Validation(format!("unsupported HTTP method: {}", method))
        })?;

        let timeout = ctx
            .config_u64("timeout")
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);

        let mut request = self.client.request(method.clone(), &url).timeout(timeout);

        if let Some(Value::Object(headers)) = ctx.configuration.get("headers").map(|h| path::render(h, &input)) {
            for (key, value) in headers {
                match value {
                    Value::String(s) => request = request.header(key.as_str(), s),
                    other => request = request.header(key.as_str(), other.to_string()),
                }
            }
        }

        if let Some(body) = ctx.configuration.get("body").map(|b| path::render(b, &input)) {
            request = match body {
                Value::String(text) => request.header("Content-Type", "text/plain").body(text),
                Value::Null => request,
                other => request.json(&other),
            };
        }

        tracing::debug!(node_id = %ctx.node_id, %method, %url, "🌍 Sending HTTP request");

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::node(NODE_TYPE, format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), Value::String(s.to_string()))))
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| EngineError::node(NODE_TYPE, format!("failed to read response body: {}", e)))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        let output = json!({
            "statusCode": status.as_u16(),
            "headers": headers,
            "body": body,
        });

        if status.is_success() {
            tracing::debug!(node_id = %ctx.node_id, status = status.as_u16(), "✅ HTTP request completed");
            Ok(NodeOutcome::ok(output))
        } else {
            tracing::warn!(node_id = %ctx.node_id, status = status.as_u16(), %url, "HTTP request returned error status");
            Ok(NodeOutcome::failed(
                format!("{} {} returned {}", method, url, status),
                output,
            ))
        }
    }
}

impl NodeHandler for HttpRequestNode {
    fn node_type(&self) -> &str {
        NODE_TYPE
    }

    fn execute(&self, input: Value, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(self.send(input, ctx))
    }
}
