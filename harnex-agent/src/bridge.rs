// ABOUTME: Per-query MCP endpoint that exposes client tools to a CLI backend over HTTP JSON-RPC.
// ABOUTME: Each tools/call becomes a tool_call envelope and waits for the matching tool_response.

use crate::event::{ToolCall, ToolResponse};
use crate::harness::ClientToolDefinition;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Offered when the client does not name a protocol version
const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

struct BridgeState {
    tools: Vec<ClientToolDefinition>,
    calls: mpsc::UnboundedSender<ToolCall>,
    pending: Mutex<HashMap<String, oneshot::Sender<ToolResponse>>>,
}

impl BridgeState {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<ToolResponse>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Loopback MCP server owned by one query.
///
/// Dropping the bridge stops the server and fails every call still waiting
/// for an answer.
pub(crate) struct ToolBridge {
    url: String,
    state: Arc<BridgeState>,
    calls: mpsc::UnboundedReceiver<ToolCall>,
    shutdown: CancellationToken,
}

impl ToolBridge {
    /// Bind an ephemeral loopback port and start serving `tools`.
    /// Must be called from within a tokio runtime.
    pub fn start(tools: Vec<ClientToolDefinition>) -> Result<Self> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
            .context("Failed to bind client tool bridge")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let listener = tokio::net::TcpListener::from_std(listener)
            .context("Failed to register client tool bridge with the runtime")?;

        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let state = Arc::new(BridgeState {
            tools,
            calls: calls_tx,
            pending: Mutex::new(HashMap::new()),
        });
        let app = Router::new()
            .route("/mcp", post(mcp_handler))
            .with_state(state.clone());

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone().cancelled_owned();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
            {
                tracing::warn!(error = %e, "Client tool bridge stopped with an error");
            }
        });

        let url = format!("http://{}/mcp", addr);
        tracing::debug!(url = %url, tools = state.tools.len(), "Client tool bridge listening");
        Ok(Self {
            url,
            state,
            calls: calls_rx,
            shutdown,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next tool call made by the backend
    pub async fn next_call(&mut self) -> Option<ToolCall> {
        self.calls.recv().await
    }

    /// Answer a pending call. Returns false if `call_id` is not waiting here.
    pub fn resolve(&self, response: ToolResponse) -> bool {
        let Some(waiter) = self.state.pending().remove(&response.call_id) else {
            return false;
        };
        if waiter.send(response).is_err() {
            tracing::debug!("Backend stopped waiting for the tool result");
        }
        true
    }
}

impl Drop for ToolBridge {
    fn drop(&mut self) {
        self.state.pending().clear();
        self.shutdown.cancel();
    }
}

async fn mcp_handler(
    State(state): State<Arc<BridgeState>>,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    tracing::debug!(method = %request.method, "Client tool bridge request");

    let Some(id) = request.id else {
        // notifications/initialized and friends carry no id and expect no body
        return StatusCode::ACCEPTED.into_response();
    };

    let response = match request.method.as_str() {
        "initialize" => {
            let version = request
                .params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_PROTOCOL_VERSION);
            JsonRpcResponse::result(
                id,
                json!({
                    "protocolVersion": version,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "harnex",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
        }
        "ping" => JsonRpcResponse::result(id, json!({})),
        "tools/list" => JsonRpcResponse::result(id, json!({ "tools": tool_list(&state.tools) })),
        "tools/call" => call_tool(&state, id, &request.params).await,
        other => JsonRpcResponse::error(id, -32601, format!("Method not found: {}", other)),
    };

    (StatusCode::OK, Json(response)).into_response()
}

fn tool_list(tools: &[ClientToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let schema = match &tool.input_schema {
                Value::Object(_) => tool.input_schema.clone(),
                _ => json!({ "type": "object" }),
            };
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": schema,
            })
        })
        .collect()
}

fn tool_text(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

async fn call_tool(state: &BridgeState, id: Value, params: &Value) -> JsonRpcResponse {
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    if !state.tools.iter().any(|t| t.name == name) {
        return JsonRpcResponse::error(id, -32602, format!("Unknown tool: {}", name));
    }

    let call_id = format!("harnex_{}", uuid::Uuid::new_v4().simple());
    let (tx, rx) = oneshot::channel();
    state.pending().insert(call_id.clone(), tx);

    let call = ToolCall {
        call_id: call_id.clone(),
        tool_name: name.to_string(),
        args: params.get("arguments").cloned().unwrap_or_else(|| json!({})),
    };
    if state.calls.send(call).is_err() {
        state.pending().remove(&call_id);
        return JsonRpcResponse::result(id, tool_text("Query is no longer running".to_string(), true));
    }
    tracing::info!(tool = %name, call_id = %call_id, "Client tool call received");

    match rx.await {
        Ok(response) => {
            JsonRpcResponse::result(id, tool_text(response.content_text(), response.is_error()))
        }
        Err(_) => JsonRpcResponse::result(
            id,
            tool_text("Query ended before the tool call was answered".to_string(), true),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn magic_tool() -> ClientToolDefinition {
        ClientToolDefinition {
            name: "get_magic_number".to_string(),
            description: "Returns the magic number".to_string(),
            input_schema: Value::Null,
        }
    }

    async fn rpc(url: &str, body: Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(url)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_and_list_tools() {
        let bridge = ToolBridge::start(vec![magic_tool()]).unwrap();
        assert!(bridge.url().starts_with("http://127.0.0.1:"));

        let init: Value = rpc(
            bridge.url(),
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": "2025-06-18"}}),
        )
        .await
        .json()
        .await
        .unwrap();
        assert_eq!(init["result"]["protocolVersion"], "2025-06-18");
        assert_eq!(init["result"]["serverInfo"]["name"], "harnex");

        let list: Value = rpc(
            bridge.url(),
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        )
        .await
        .json()
        .await
        .unwrap();
        let tools = list["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "get_magic_number");
        assert_eq!(tools[0]["inputSchema"], json!({"type": "object"}));
    }

    #[tokio::test]
    async fn test_notification_gets_no_body() {
        let bridge = ToolBridge::start(vec![magic_tool()]).unwrap();
        let response = rpc(
            bridge.url(),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .await;
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_call_waits_for_resolve() {
        let mut bridge = ToolBridge::start(vec![magic_tool()]).unwrap();
        let url = bridge.url().to_string();
        let request = tokio::spawn(async move {
            rpc(
                &url,
                json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call",
                       "params": {"name": "get_magic_number", "arguments": {"seed": 3}}}),
            )
            .await
            .json::<Value>()
            .await
            .unwrap()
        });

        let call = bridge.next_call().await.unwrap();
        assert_eq!(call.tool_name, "get_magic_number");
        assert_eq!(call.args, json!({"seed": 3}));
        assert!(!bridge.resolve(ToolResponse::ok("someone-else", json!("0"))));
        assert!(bridge.resolve(ToolResponse::ok(call.call_id.clone(), json!({"content": "42"}))));

        let reply = request.await.unwrap();
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"]["content"][0]["text"], "42");
        assert_eq!(reply["result"]["isError"], false);
    }

    #[tokio::test]
    async fn test_error_response_is_flagged() {
        let mut bridge = ToolBridge::start(vec![magic_tool()]).unwrap();
        let url = bridge.url().to_string();
        let request = tokio::spawn(async move {
            rpc(
                &url,
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "get_magic_number"}}),
            )
            .await
            .json::<Value>()
            .await
            .unwrap()
        });

        let call = bridge.next_call().await.unwrap();
        assert_eq!(call.args, json!({}));
        bridge.resolve(ToolResponse::err(call.call_id, "lookup failed"));

        let reply = request.await.unwrap();
        assert_eq!(reply["result"]["content"][0]["text"], "lookup failed");
        assert_eq!(reply["result"]["isError"], true);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_rejected() {
        let bridge = ToolBridge::start(vec![magic_tool()]).unwrap();
        let reply: Value = rpc(
            bridge.url(),
            json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {"name": "rm_rf"}}),
        )
        .await
        .json()
        .await
        .unwrap();
        assert_eq!(reply["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn test_drop_fails_waiting_calls() {
        let mut bridge = ToolBridge::start(vec![magic_tool()]).unwrap();
        let url = bridge.url().to_string();
        let request = tokio::spawn(async move {
            rpc(
                &url,
                json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": {"name": "get_magic_number"}}),
            )
            .await
            .json::<Value>()
            .await
            .unwrap()
        });

        bridge.next_call().await.unwrap();
        drop(bridge);

        let reply = tokio::time::timeout(std::time::Duration::from_secs(5), request)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply["result"]["isError"], true);
    }
}
