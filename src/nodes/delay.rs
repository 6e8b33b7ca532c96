/// Delay node
///
/// Sleeps for `duration` (or `delay`) milliseconds, 1000 by default, then
/// returns `{delayed, duration, inputData}`.

use super::{NodeContext, NodeHandler, NodeOutcome};
use crate::error::Result;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone, Copy)]
pub struct DelayNode;

impl NodeHandler for DelayNode {
    fn node_type(&self) -> &str {
        "delay"
    }

    fn execute(&self, input: Value, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move {
            let duration = ctx
                .config_u64("duration")
                .or_else(|| ctx.config_u64("delay"))
                .unwrap_or(DEFAULT_DELAY_MS);

            tracing::debug!(node_id = %ctx.node_id, duration, "⏳ Delaying");
            tokio::time::sleep(Duration::from_millis(duration)).await;

            Ok(NodeOutcome::ok(json!({
                "delayed": true,
                "duration": duration,
                "inputData": input,
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waits_and_reports_duration() {
        let ctx = NodeContext {
            configuration: json!({ "delay": 5 }),
            ..NodeContext::default()
        };
        let started = std::time::Instant::now();
        let outcome = DelayNode.execute(json!({ "x": 1 }), ctx).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(5));
        assert_eq!(outcome.output["duration"], 5);
        assert_eq!(outcome.output["inputData"], json!({ "x": 1 }));
    }
}
