/// Core workflow type definitions
///
/// Defines the persisted shape of workflows: typed nodes, directed connections
/// and per-workflow execution settings. These types are serialized as camelCase
/// JSON for storage and for the CLI import format.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A complete workflow definition containing nodes and their connections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-onboarding")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    /// User owning the definition
    #[serde(default)]
    pub owner_id: String,
    /// Nodes of the workflow graph
    pub nodes: Vec<Node>,
    /// Directed connections between nodes
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Execution settings (error policy, timeouts, retries)
    #[serde(default)]
    pub settings: WorkflowSettings,
    /// Free-form variables copied into every execution context
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// A single typed node in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique node identifier within the workflow
    pub id: String,
    /// Display name, defaults to the id
    #[serde(default)]
    pub name: String,
    /// Node type resolved through the Node Executor Registry (e.g. "http-request")
    #[serde(rename = "type")]
    pub node_type: String,
    /// Type-specific configuration. The keys `timeout` (ms) and `retries`
    /// override the engine defaults for this node.
    #[serde(default)]
    pub configuration: Value,
    /// Editor position, carried through untouched
    #[serde(default)]
    pub position: Position,
}

/// Editor canvas coordinates
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Directed connection from an output of one node to an input of another
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub source_node_id: String,
    #[serde(default = "default_port")]
    pub source_output: String,
    pub target_node_id: String,
    /// Key under which the source output appears in the target's input
    #[serde(default = "default_port")]
    pub target_input: String,
}

fn default_port() -> String {
    "main".to_string()
}

/// What happens to an execution when a node fails permanently
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorHandling {
    /// Cancel everything in flight and fail the execution
    #[default]
    StopOnError,
    /// Keep running branches that do not depend on the failed node
    ContinueOnError,
}

/// Per-workflow execution settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Whole-execution ceiling, overrides the engine default
    #[serde(default)]
    pub execution_timeout_ms: Option<u64>,
    /// Attempts per node, overrides the engine default
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl Node {
    /// Create a node with an empty configuration
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            node_type: node_type.into(),
            configuration: Value::Object(Map::new()),
            position: Position::default(),
        }
    }

    /// Builder-style configuration setter
    pub fn with_configuration(mut self, configuration: Value) -> Self {
        self.configuration = configuration;
        self
    }

    /// Per-node timeout override from `configuration.timeout`
    pub fn timeout_override_ms(&self) -> Option<u64> {
        self.configuration.get("timeout").and_then(Value::as_u64)
    }

    /// Per-node attempts override from `configuration.retries`
    pub fn attempts_override(&self) -> Option<u32> {
        self.configuration
            .get("retries")
            .and_then(Value::as_u64)
            .map(|r| u32::try_from(r).unwrap_or(u32::MAX))
    }
}

impl Connection {
    /// Connection using the default `main` ports
    pub fn new(
        id: impl Into<String>,
        source_node_id: impl Into<String>,
        target_node_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_node_id: source_node_id.into(),
            source_output: default_port(),
            target_node_id: target_node_id.into(),
            target_input: default_port(),
        }
    }

    /// Builder-style target port setter
    pub fn into_input(mut self, target_input: impl Into<String>) -> Self {
        self.target_input = target_input.into();
        self
    }
}

impl Workflow {
    /// Create a workflow with default settings
    pub fn new(id: impl Into<String>, nodes: Vec<Node>, connections: Vec<Connection>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            owner_id: String::new(),
            nodes,
            connections,
            settings: WorkflowSettings::default(),
            variables: Map::new(),
        }
    }

    /// Builder-style error policy setter
    pub fn with_error_handling(mut self, error_handling: ErrorHandling) -> Self {
        self.settings.error_handling = error_handling;
        self
    }
}
