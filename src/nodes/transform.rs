/// Data transform node
///
/// Applies `transformations` in order to a copy of the input:
/// `set` (target, value), `copy` (source, target), `delete` (target),
/// `rename` (source, target). Paths are dotted; `set` values may contain
/// `{{path}}` placeholders resolved against the document being built.

use super::{path, NodeContext, NodeHandler, NodeOutcome};
use crate::error::{EngineError, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy)]
pub struct DataTransformNode;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
enum Transformation {
    Set {
        target: String,
        #[serde(default)]
        value: Value,
    },
    Copy {
        source: String,
        target: String,
    },
    Delete {
        target: String,
    },
    Rename {
        source: String,
        target: String,
    },
}

fn apply(doc: &mut Value, transformation: Transformation) {
    match transformation {
        Transformation::Set { target, value } => {
            let value = path::render(&value, doc);
            path::set(doc, &target, value);
        }
        Transformation::Copy { source, target } => {
            let value = path::get(doc, &source).cloned().unwrap_or(Value::Null);
            path::set(doc, &target, value);
        }
        Transformation::Delete { target } => {
            path::delete(doc, &target);
        }
        Transformation::Rename { source, target } => {
            if let Some(value) = path::delete(doc, &source) {
                path::set(doc, &target, value);
            }
        }
    }
}

impl NodeHandler for DataTransformNode {
    fn node_type(&self) -> &str {
        "data-transform"
    }

    fn execute(&self, input: Value, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move {
            let transformations: Vec<Transformation> = match ctx.configuration.get("transformations") {
                Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                    EngineError::Validation(format!("invalid transformations: {}", e))
                })?,
                None => Vec::new(),
            };

            let mut doc = match input {
                Value::Object(_) => input,
                Value::Null => Value::Object(Map::new()),
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other);
                    Value::Object(map)
                }
            };

            let count = transformations.len();
            for transformation in transformations {
                apply(&mut doc, transformation);
            }
            tracing::debug!(node_id = %ctx.node_id, count, "Applied transformations");

            Ok(NodeOutcome::ok(doc))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn run(input: Value, transformations: Value) -> Result<NodeOutcome> {
        let ctx = NodeContext {
            configuration: json!({ "transformations": transformations }),
            ..NodeContext::default()
        };
        DataTransformNode.execute(input, ctx).await
    }

    #[tokio::test]
    async fn applies_operations_in_order() {
        let outcome = run(
            json!({ "user": { "first": "Ada", "tmp": 1 } }),
            json!([
                { "operation": "set", "target": "greeting", "value": "hello {{user.first}}" },
                { "operation": "copy", "source": "user.first", "target": "name" },
                { "operation": "delete", "target": "user.tmp" },
                { "operation": "rename", "source": "name", "target": "profile.name" }
            ]),
        )
        .await
        .unwrap();

        assert_eq!(
            outcome.output,
            json!({
                "user": { "first": "Ada" },
                "greeting": "hello Ada",
                "profile": { "name": "Ada" }
            })
        );
    }

    #[tokio::test]
    async fn unknown_operation_is_rejected() {
        let err = run(json!({}), json!([{ "operation": "explode", "target": "x" }]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
