/// Custom code node using mlua
///
/// Runs the `code` configuration as a Lua chunk on a blocking thread. The
/// interpreter only gets the table, string, math and utf8 libraries; file,
/// process and module loading are unavailable. A fresh state is created per
/// attempt with an instruction hook for the wall-clock budget and a heap
/// ceiling. The chunk sees `input` and `variables` globals and its return
/// value becomes the node output.

use super::{NodeContext, NodeHandler, NodeOutcome};
use crate::error::{EngineError, Result};
use futures::future::BoxFuture;
use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib, VmState};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

const NODE_TYPE: &str = "custom-code";
const HOOK_INSTRUCTION_INTERVAL: u32 = 1000;

#[derive(Debug, Clone)]
pub struct CustomCodeNode {
    timeout: Duration,
    memory_limit_bytes: usize,
}

impl CustomCodeNode {
    pub fn new(timeout_ms: u64, memory_limit_bytes: usize) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
            memory_limit_bytes,
        }
    }
}

impl NodeHandler for CustomCodeNode {
    fn node_type(&self) -> &str {
        NODE_TYPE
    }

    fn execute(&self, input: Value, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        let timeout = self.timeout;
        let memory_limit = self.memory_limit_bytes;

        Box::pin(async move {
            let language = ctx.config_str("language").unwrap_or("lua");
            if language != "lua" {
                return Err(EngineError::Validation(format!(
                    "unsupported language: {}",
                    language
                )));
            }
            let code = ctx
                .config_str("code")
                .ok_or_else(|| EngineError::Validation("custom-code requires 'code'".to_string()))?
                .to_string();

            tracing::debug!(node_id = %ctx.node_id, "🧠 Running custom code");

            let variables = ctx.variables.clone();
            let result = tokio::task::spawn_blocking(move || {
                run_sandboxed(&code, input, variables, timeout, memory_limit)
            })
            .await
            .map_err(|e| EngineError::node(NODE_TYPE, format!("sandbox thread failed: {}", e)))?;

            match result {
                Ok(output) => Ok(NodeOutcome::ok(output)),
                Err(message) => Err(EngineError::node(NODE_TYPE, message)),
            }
        })
    }
}

fn run_sandboxed(
    code: &str,
    input: Value,
    variables: Map<String, Value>,
    timeout: Duration,
    memory_limit: usize,
) -> std::result::Result<Value, String> {
    let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8;
    let lua = Lua::new_with(libs, LuaOptions::new())
        .map_err(|e| format!("failed to create Lua state: {}", e))?;

    lua.set_memory_limit(memory_limit)
        .map_err(|e| format!("failed to set memory limit: {}", e))?;

    let started = Instant::now();
    let _ = lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_, _| {
            if started.elapsed() > timeout {
                Err(mlua::Error::RuntimeError(format!(
                    "execution time limit of {}ms exceeded",
                    timeout.as_millis()
                )))
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    let globals = lua.globals();
    for name in ["dofile", "loadfile", "load", "require", "collectgarbage"] {
        globals
            .set(name, mlua::Nil)
            .map_err(|e| format!("failed to restrict globals: {}", e))?;
    }

    let input = lua
        .to_value(&input)
        .map_err(|e| format!("failed to convert input: {}", e))?;
    let variables = lua
        .to_value(&Value::Object(variables))
        .map_err(|e| format!("failed to convert variables: {}", e))?;
    globals
        .set("input", input)
        .map_err(|e| format!("failed to set input: {}", e))?;
    globals
        .set("variables", variables)
        .map_err(|e| format!("failed to set variables: {}", e))?;

    let result: mlua::Value = lua
        .load(code)
        .set_name(NODE_TYPE)
        .eval()
        .map_err(|e| format!("Lua script execution failed: {}", e))?;

    lua.from_value::<Value>(result)
        .map_err(|e| format!("failed to convert result: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(code: &str) -> NodeContext {
        NodeContext {
            configuration: json!({ "code": code }),
            ..NodeContext::default()
        }
    }

    #[tokio::test]
    async fn returns_computed_table() {
        let node = CustomCodeNode::new(1000, 8 * 1024 * 1024);
        let outcome = node
            .execute(json!({ "score": 21 }), ctx("return { doubled = input.score * 2 }"))
            .await
            .unwrap();
        assert_eq!(outcome.output["doubled"], json!(42));
    }

    #[tokio::test]
    async fn sees_workflow_variables() {
        let node = CustomCodeNode::new(1000, 8 * 1024 * 1024);
        let mut context = ctx("return variables.region");
        context.variables.insert("region".into(), json!("eu"));

        let outcome = node.execute(Value::Null, context).await.unwrap();
        assert_eq!(outcome.output, json!("eu"));
    }

    #[tokio::test]
    async fn infinite_loop_hits_time_limit() {
        let node = CustomCodeNode::new(50, 8 * 1024 * 1024);
        let err = node
            .execute(Value::Null, ctx("while true do end"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("time limit"));
    }

    #[tokio::test]
    async fn os_library_is_unavailable() {
        let node = CustomCodeNode::new(1000, 8 * 1024 * 1024);
        let err = node
            .execute(Value::Null, ctx("return os.time()"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NodeExecution { .. }));
    }

    #[tokio::test]
    async fn other_languages_are_rejected() {
        let node = CustomCodeNode::new(1000, 8 * 1024 * 1024);
        let context = NodeContext {
            configuration: json!({ "code": "1", "language": "javascript" }),
            ..NodeContext::default()
        };
        let err = node.execute(Value::Null, context).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
