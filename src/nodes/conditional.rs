/// Conditional node
///
/// Evaluates `conditions` in order; the first one that holds decides the
/// output `{result: value, condition_met: true}`. When none holds the output is
/// `{result: defaultValue, condition_met: false}`.

use super::{path, NodeContext, NodeHandler, NodeOutcome};
use crate::error::{EngineError, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy)]
pub struct ConditionalNode;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    StartsWith,
    EndsWith,
    IsEmpty,
    IsNotEmpty,
}

#[derive(Debug, Clone, Deserialize)]
struct Condition {
    #[serde(default)]
    left: Value,
    operator: Operator,
    #[serde(default)]
    right: Value,
    #[serde(default)]
    value: Value,
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
    }
}

/// Compare two already-resolved operands
pub fn evaluate(left: &Value, operator: Operator, right: &Value) -> bool {
    match operator {
        Operator::Equals => left == right,
        Operator::NotEquals => left != right,
        Operator::GreaterThan => match (as_number(left), as_number(right)) {
            (Some(l), Some(r)) => l > r,
            _ => false,
        },
        Operator::LessThan => match (as_number(left), as_number(right)) {
            (Some(l), Some(r)) => l < r,
            _ => false,
        },
        Operator::Contains => match left {
            Value::Array(items) => items.contains(right),
            _ => as_text(left).contains(&as_text(right)),
        },
        Operator::StartsWith => as_text(left).starts_with(&as_text(right)),
        Operator::EndsWith => as_text(left).ends_with(&as_text(right)),
        Operator::IsEmpty => is_empty(left),
        Operator::IsNotEmpty => !is_empty(left),
    }
}

impl NodeHandler for ConditionalNode {
    fn node_type(&self) -> &str {
        "conditional"
    }

    fn execute(&self, input: Value, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move {
            let conditions: Vec<Condition> = match ctx.configuration.get("conditions") {
                Some(raw) => serde_json::from_value(raw.clone())
                    .map_err(|e| EngineError::Validation(format!("invalid conditions: {}", e)))?,
                None => Vec::new(),
            };

            for (index, condition) in conditions.into_iter().enumerate() {
                let left = path::render(&condition.left, &input);
                let right = path::render(&condition.right, &input);
                if evaluate(&left, condition.operator, &right) {
                    tracing::debug!(node_id = %ctx.node_id, index, "Condition met");
                    return Ok(NodeOutcome::ok(json!({
                        "result": condition.value,
                        "condition_met": true,
                    })));
                }
            }

            let default = ctx.configuration.get("defaultValue").cloned().unwrap_or(Value::Null);
            Ok(NodeOutcome::ok(json!({
                "result": default,
                "condition_met": false,
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operators() {
        assert!(evaluate(&json!(3), Operator::GreaterThan, &json!("2")));
        assert!(evaluate(&json!("abc"), Operator::StartsWith, &json!("ab")));
        assert!(evaluate(&json!(["a", "b"]), Operator::Contains, &json!("b")));
        assert!(evaluate(&json!(""), Operator::IsEmpty, &Value::Null));
        assert!(!evaluate(&json!("x"), Operator::Equals, &json!("y")));
        assert!(!evaluate(&json!("n/a"), Operator::LessThan, &json!(1)));
    }

    #[tokio::test]
    async fn first_matching_condition_wins() {
        let ctx = NodeContext {
            configuration: json!({
                "conditions": [
                    { "left": "{{score}}", "operator": "greater_than", "right": 90, "value": "A" },
                    { "left": "{{score}}", "operator": "greater_than", "right": 50, "value": "B" }
                ],
                "defaultValue": "F"
            }),
            ..NodeContext::default()
        };
        let outcome = ConditionalNode.execute(json!({ "score": 70 }), ctx).await.unwrap();
        assert_eq!(outcome.output, json!({ "result": "B", "condition_met": true }));
    }

    #[tokio::test]
    async fn falls_back_to_default() {
        let ctx = NodeContext {
            configuration: json!({
                "conditions": [{ "left": "{{name}}", "operator": "equals", "right": "bob", "value": 1 }],
                "defaultValue": 0
            }),
            ..NodeContext::default()
        };
        let outcome = ConditionalNode.execute(json!({ "name": "ada" }), ctx).await.unwrap();
        assert_eq!(outcome.output, json!({ "result": 0, "condition_met": false }));
    }
}
