/// Node Executor Registry
///
/// Maps node type strings to handlers. The orchestrator never runs node logic
/// itself: the task queue resolves the handler here for every attempt.
///
/// Built-in node types:
/// - trigger, manual-trigger, webhook-trigger: pass the input through
/// - http-request: outbound HTTP call with reqwest
/// - delay: sleep, then pass the input along
/// - data-transform: set/copy/delete/rename on dotted paths
/// - conditional: first matching condition wins
/// - webhook-response: shape a response payload
/// - custom-code: sandboxed Lua via mlua

pub mod code;
pub mod conditional;
pub mod delay;
pub mod http;
pub mod path;
pub mod transform;
pub mod trigger;

use crate::config::NodesConfig;
use crate::error::{EngineError, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// What a handler reports back for one attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl NodeOutcome {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    /// Failed outcome that still carries an output (e.g. a non-2xx response)
    pub fn failed(error: impl Into<String>, output: Value) -> Self {
        Self {
            success: false,
            output,
            error: Some(error.into()),
        }
    }
}

/// Per-attempt context passed to a handler
#[derive(Debug, Clone, Default)]
pub struct NodeContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub node_id: String,
    pub configuration: Value,
    pub variables: Map<String, Value>,
    /// 1-based attempt number
    pub attempt: u32,
}

impl NodeContext {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.configuration.get(key).and_then(Value::as_str)
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.configuration.get(key).and_then(Value::as_u64)
    }
}

/// Business logic of one node type
pub trait NodeHandler: Send + Sync + 'static {
    fn node_type(&self) -> &str;

    fn execute(&self, input: Value, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>>;
}

/// Registry of node handlers keyed by node type
#[derive(Clone, Default)]
pub struct NodeExecutorRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl std::fmt::Debug for NodeExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutorRegistry")
            .field("node_types", &self.node_types())
            .finish()
    }
}

impl NodeExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in node type
    pub fn with_builtins(config: &NodesConfig) -> Self {
        let mut registry = Self::new();
        registry.register(trigger::TriggerNode::new("trigger"));
        registry.register(trigger::TriggerNode::new("manual-trigger"));
        registry.register(trigger::TriggerNode::new("webhook-trigger"));
        registry.register(trigger::WebhookResponseNode);
        registry.register(http::HttpRequestNode::new(config.http_timeout_ms));
        registry.register(delay::DelayNode);
        registry.register(transform::DataTransformNode);
        registry.register(conditional::ConditionalNode);
        registry.register(code::CustomCodeNode::new(
            config.code_timeout_ms,
            config.code_memory_limit_bytes,
        ));
        registry
    }

    /// Register a handler under its own node type, replacing any previous one
    pub fn register(&mut self, handler: impl NodeHandler) {
        let node_type = handler.node_type().to_string();
        self.handlers.insert(node_type, Arc::new(handler));
    }

    /// Register a shared handler under an explicit node type
    pub fn register_as(&mut self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type.into(), handler);
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Registered node types, sorted
    pub fn node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Run one attempt of a node
    pub async fn execute(&self, node_type: &str, input: Value, ctx: NodeContext) -> Result<NodeOutcome> {
        let handler = self
            .handlers
            .get(node_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownNodeType(node_type.to_string()))?;

        tracing::debug!(
            execution_id = %ctx.execution_id,
            node_id = %ctx.node_id,
            node_type,
            attempt = ctx.attempt,
            "Executing node"
        );
        handler.execute(input, ctx).await
    }
}
