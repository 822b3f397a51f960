//! Demo tools and method handlers served by the `mcp-server` binary.

use mcp_core::protocol::{CallToolResult, Tool};
use mcp_core::{HandlerError, JsonRpcError, Server, ToolRegistry};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Weak};
use tracing::info;

/// Registry holding `echo` and `math`.
pub fn demo_tools() -> ToolRegistry {
    let tools = ToolRegistry::new();
    tools.register(
        Tool {
            name: "echo".into(),
            description: "Echo back a message".into(),
            input_schema: json!({
                "type": "object",
                "required": ["message"],
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The message to echo back"
                    }
                }
            }),
        },
        |_ctx, arguments| async move { Ok::<_, HandlerError>(CallToolResult::text(echo(&arguments)?)) },
    );
    tools.register(
        Tool {
            name: "math".into(),
            description: "Perform basic mathematical operations".into(),
            input_schema: json!({
                "type": "object",
                "required": ["operation", "a", "b"],
                "properties": {
                    "operation": {
                        "type": "string",
                        "description": "The operation to perform (add, subtract, multiply, divide)",
                        "enum": ["add", "subtract", "multiply", "divide"]
                    },
                    "a": { "type": "number", "description": "First number" },
                    "b": { "type": "number", "description": "Second number" }
                }
            }),
        },
        |_ctx, arguments| async move { Ok::<_, HandlerError>(CallToolResult::text(math(&arguments)?)) },
    );
    tools
}

fn echo(arguments: &Map<String, Value>) -> Result<String, JsonRpcError> {
    arguments
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| JsonRpcError::invalid_params("Missing or invalid 'message' parameter"))
}

fn number(arguments: &Map<String, Value>, name: &str) -> Result<f64, JsonRpcError> {
    arguments
        .get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| JsonRpcError::invalid_params(format!("Missing or invalid '{}' parameter", name)))
}

/// Result is rendered with two decimals.
fn math(arguments: &Map<String, Value>) -> Result<String, JsonRpcError> {
    let operation = arguments
        .get("operation")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcError::invalid_params("Missing or invalid 'operation' parameter"))?;
    let a = number(arguments, "a")?;
    let b = number(arguments, "b")?;

    let result = match operation {
        "add" => a + b,
        "subtract" => a - b,
        "multiply" => a * b,
        "divide" => {
            if b == 0.0 {
                return Err(JsonRpcError::invalid_params("Division by zero"));
            }
            a / b
        }
        other => return Err(JsonRpcError::invalid_params(format!("Unknown operation: {}", other))),
    };
    Ok(format!("{:.2}", result))
}

#[derive(Debug, Default, Deserialize)]
struct EchoParams {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct AddParams {
    #[serde(default)]
    a: f64,
    #[serde(default)]
    b: f64,
}

#[derive(Debug, Default, Deserialize)]
struct LogMessage {
    #[serde(default)]
    level: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    source: String,
}

/// Plain JSON-RPC methods outside the MCP tool surface: `echo`, `add` and
/// `listMethods`, plus the `ping` and `notifications/message` notifications.
pub fn register_legacy_handlers(server: &Arc<Server>) {
    server.register_handler("echo", |_ctx, params| async move {
        let params: EchoParams = params
            .parse_or_default()
            .map_err(|_| JsonRpcError::invalid_params("Invalid echo parameters"))?;
        Ok::<_, HandlerError>(json!({ "echo": params.message }))
    });

    server.register_handler("add", |_ctx, params| async move {
        let params: AddParams = params
            .parse_or_default()
            .map_err(|_| JsonRpcError::invalid_params("Invalid add parameters"))?;
        Ok::<_, HandlerError>(json!({ "result": params.a + params.b }))
    });

    let weak: Weak<Server> = Arc::downgrade(server);
    server.register_handler("listMethods", move |_ctx, _params| {
        let server = weak.upgrade();
        async move {
            let server = server.ok_or_else(|| anyhow::anyhow!("server is gone"))?;
            Ok::<_, HandlerError>(json!({ "methods": server.methods() }))
        }
    });

    server.register_notification_handler("ping", |ctx, _params| async move {
        info!(session_id = ?ctx.session_id, "Received ping notification");
        Ok::<_, HandlerError>(())
    });

    server.register_notification_handler("notifications/message", |_ctx, params| async move {
        match params.parse_or_default::<LogMessage>() {
            Ok(msg) => info!(level = %msg.level, source = %msg.source, "{}", msg.message),
            Err(e) => info!(error = %e.message, "Invalid notification parameters"),
        }
        Ok::<_, HandlerError>(())
    });
}
