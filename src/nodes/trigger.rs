/// Entry-point and response-shaping nodes
///
/// Triggers do no work of their own: the execution input (or the merged
/// predecessor outputs) flows through unchanged.

use super::{path, NodeContext, NodeHandler, NodeOutcome};
use crate::error::Result;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

/// Pass-through node registered under each trigger type name
#[derive(Debug, Clone)]
pub struct TriggerNode {
    node_type: String,
}

impl TriggerNode {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
        }
    }
}

impl NodeHandler for TriggerNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn execute(&self, input: Value, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move {
            tracing::debug!(node_id = %ctx.node_id, "Trigger fired");
            Ok(NodeOutcome::ok(input))
        })
    }
}

/// Builds `{webhook_response: {statusCode, headers, body}}` from the
/// configuration, with `{{path}}` placeholders resolved against the input
#[derive(Debug, Clone, Copy)]
pub struct WebhookResponseNode;

impl NodeHandler for WebhookResponseNode {
    fn node_type(&self) -> &str {
        "webhook-response"
    }

    fn execute(&self, input: Value, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move {
            let status_code = ctx.config_u64("statusCode").unwrap_or(200);
            let headers = ctx
                .configuration
                .get("headers")
                .map(|h| path::render(h, &input))
                .unwrap_or_else(|| Value::Object(Map::new()));
            let body = ctx
                .configuration
                .get("body")
                .map(|b| path::render(b, &input))
                .unwrap_or(Value::Null);

            Ok(NodeOutcome::ok(json!({
                "webhook_response": {
                    "statusCode": status_code,
                    "headers": headers,
                    "body": body,
                }
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_passes_input_through() {
        let node = TriggerNode::new("manual-trigger");
        assert_eq!(node.node_type(), "manual-trigger");

        let outcome = node
            .execute(json!({ "x": 1 }), NodeContext::default())
            .await
            .unwrap();
        assert_eq!(outcome.output, json!({ "x": 1 }));
    }

    #[tokio::test]
    async fn webhook_response_renders_body() {
        let ctx = NodeContext {
            configuration: json!({ "statusCode": 201, "body": { "greeting": "hi {{name}}" } }),
            ..NodeContext::default()
        };
        let outcome = WebhookResponseNode
            .execute(json!({ "name": "ada" }), ctx)
            .await
            .unwrap();

        assert_eq!(outcome.output["webhook_response"]["statusCode"], 201);
        assert_eq!(outcome.output["webhook_response"]["body"]["greeting"], "hi ada");
    }
}
