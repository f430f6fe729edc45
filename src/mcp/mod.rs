//! Read-only session access for agents over MCP: JSON-RPC 2.0 messages in
//! `Content-Length` frames on stdin/stdout.

mod framing;
mod tools;

pub use framing::*;
pub use tools::*;

use crate::infra::{CancellationToken, SessionStore, sweep_best_effort};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::io::{BufRead, Write};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const TOOL_ERROR: i64 = -32000;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcResponse {
    fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

pub struct McpServer {
    store: SessionStore,
}

impl McpServer {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    /// Serves requests until the peer closes `input`.
    pub fn serve(&self, mut input: impl BufRead, mut output: impl Write) -> Result<(), McpError> {
        while let Some(body) = read_frame(&mut input)? {
            let response = match serde_json::from_slice::<RpcRequest>(&body) {
                Ok(request) => self.handle(request),
                Err(error) => {
                    tracing::warn!(error = %error, "mcp_invalid_json");
                    Some(RpcResponse::error(Value::Null, PARSE_ERROR, "invalid json"))
                }
            };
            if let Some(response) = response {
                let body = serde_json::to_vec(&response).map_err(McpError::Encode)?;
                write_frame(&mut output, &body)?;
            }
        }
        Ok(())
    }

    /// Requests without an id are notifications and never get a response.
    fn handle(&self, request: RpcRequest) -> Option<RpcResponse> {
        let RpcRequest { id, method, params } = request;
        let Some(id) = id else {
            tracing::debug!(method = %method, "mcp_notification");
            return None;
        };
        if method.is_empty() {
            return Some(RpcResponse::error(id, INVALID_REQUEST, "missing method"));
        }

        let response = match method.as_str() {
            "initialize" => RpcResponse::result(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
            "ping" => RpcResponse::result(id, json!({ "ok": true })),
            "tools/list" => RpcResponse::result(id, json!({ "tools": tool_definitions() })),
            "tools/call" => self.call(id, params),
            other => RpcResponse::error(id, METHOD_NOT_FOUND, format!("method not found: {other}")),
        };
        Some(response)
    }

    fn call(&self, id: Value, params: Option<Value>) -> RpcResponse {
        let params = params.unwrap_or(Value::Null);
        let params: ToolCallParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(_) => return RpcResponse::error(id, INVALID_PARAMS, "invalid tools/call params"),
        };
        let arguments = params.arguments.unwrap_or_default();

        match call_tool(&self.store, &params.name, &arguments) {
            Ok(payload) => {
                tracing::info!(tool = %params.name, "mcp_tool_call");
                let text = payload.to_string();
                RpcResponse::result(
                    id,
                    json!({
                        "isError": false,
                        "content": [{ "type": "text", "text": text }],
                        "structuredContent": payload,
                    }),
                )
            }
            Err(error) => {
                tracing::warn!(tool = %params.name, error = %error, "mcp_tool_call_failed");
                let code = match error {
                    ToolError::MissingArgument(_) | ToolError::InvalidArgument { .. } => {
                        INVALID_PARAMS
                    }
                    _ => TOOL_ERROR,
                };
                RpcResponse::error(id, code, error.to_string())
            }
        }
    }
}

/// Sweeps expired sessions every `interval` until `stop` is cancelled.
pub fn spawn_periodic_sweep(
    store: SessionStore,
    stop: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !stop.wait_timeout(interval) {
            sweep_best_effort(&store, None, None);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FinalMeta, RunResult, SCHEMA_VERSION, StartMeta, TransportMode};
    use std::io::Cursor;
    use std::time::Instant;
    use time::OffsetDateTime;

    fn server() -> (tempfile::TempDir, McpServer) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("open");
        (dir, McpServer::new(store))
    }

    fn exchange(server: &McpServer, messages: &[Value]) -> Vec<Value> {
        let mut input = Vec::new();
        for message in messages {
            let body = serde_json::to_vec(message).expect("encode");
            write_frame(&mut input, &body).expect("frame");
        }
        let mut output = Vec::new();
        server
            .serve(Cursor::new(input), &mut output)
            .expect("serve");

        let mut reader = Cursor::new(output);
        let mut responses = Vec::new();
        while let Some(body) = read_frame(&mut reader).expect("read response") {
            responses.push(serde_json::from_slice(&body).expect("decode"));
        }
        responses
    }

    fn ended_session(store: &SessionStore, session_id: &str, started_at: OffsetDateTime) {
        store
            .write_start_meta(&StartMeta {
                schema_version: SCHEMA_VERSION.to_string(),
                session_id: session_id.to_string(),
                command: vec!["true".to_string()],
                working_directory: "/".to_string(),
                started_at,
                retention_seconds: 1,
                transport_mode: TransportMode::Pipe,
                tty_attached: false,
                pid: 0,
            })
            .expect("meta");
        store
            .write_final_meta(&FinalMeta::from_outcome(
                session_id,
                started_at,
                &RunResult::Exited { code: 0 },
            ))
            .expect("final");
    }

    #[test]
    fn initialize_ping_and_tool_listing() {
        let (_dir, server) = server();
        let responses = exchange(
            &server,
            &[
                json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
                json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
                json!({ "jsonrpc": "2.0", "id": "two", "method": "ping" }),
                json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/list" }),
            ],
        );
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[0]["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(responses[0]["result"]["serverInfo"]["name"], "derun");
        assert_eq!(responses[1]["id"], "two");
        assert_eq!(responses[1]["result"]["ok"], true);

        let names: Vec<&str> = responses[2]["result"]["tools"]
            .as_array()
            .expect("tools")
            .iter()
            .filter_map(|tool| tool["name"].as_str())
            .collect();
        assert_eq!(
            names,
            [LIST_SESSIONS, GET_SESSION, READ_OUTPUT, WAIT_OUTPUT]
        );
    }

    #[test]
    fn protocol_errors_use_json_rpc_codes() {
        let (_dir, server) = server();
        let mut input = Vec::new();
        write_frame(&mut input, b"{not json").expect("frame");
        for message in [
            json!({ "jsonrpc": "2.0", "id": 1 }),
            json!({ "jsonrpc": "2.0", "id": 2, "method": "resources/list" }),
            json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": [] }),
            json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": { "name": GET_SESSION, "arguments": {} }
            }),
            json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "tools/call",
                "params": { "name": GET_SESSION, "arguments": { "session_id": "nope" } }
            }),
        ] {
            let body = serde_json::to_vec(&message).expect("encode");
            write_frame(&mut input, &body).expect("frame");
        }
        let mut output = Vec::new();
        server
            .serve(Cursor::new(input), &mut output)
            .expect("serve");

        let mut reader = Cursor::new(output);
        let mut codes = Vec::new();
        while let Some(body) = read_frame(&mut reader).expect("read") {
            let response: Value = serde_json::from_slice(&body).expect("decode");
            codes.push(response["error"]["code"].as_i64().expect("error code"));
        }
        assert_eq!(
            codes,
            [
                PARSE_ERROR,
                INVALID_REQUEST,
                METHOD_NOT_FOUND,
                INVALID_PARAMS,
                INVALID_PARAMS,
                TOOL_ERROR
            ]
        );
    }

    #[test]
    fn tool_results_carry_text_and_structured_content() {
        let (_dir, server) = server();
        ended_session(&server.store, "s1", OffsetDateTime::now_utc());
        let responses = exchange(
            &server,
            &[json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "tools/call",
                "params": { "name": LIST_SESSIONS, "arguments": { "limit": 10 } }
            })],
        );
        let result = &responses[0]["result"];
        assert_eq!(result["isError"], false);
        assert_eq!(result["structuredContent"]["total_count"], 1);
        assert_eq!(result["structuredContent"]["schema_version"], SCHEMA_VERSION);
        let text = result["content"][0]["text"].as_str().expect("text");
        let reparsed: Value = serde_json::from_str(text).expect("text is json");
        assert_eq!(reparsed, result["structuredContent"]);
    }

    #[test]
    fn periodic_sweep_removes_expired_sessions_until_stopped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("open");
        let long_ago = OffsetDateTime::now_utc() - time::Duration::days(30);
        ended_session(&store, "old", long_ago);

        let stop = CancellationToken::new();
        let sweeper =
            spawn_periodic_sweep(store.clone(), stop.clone(), Duration::from_millis(10));
        let deadline = Instant::now() + Duration::from_secs(10);
        while store.has_session_metadata("old").unwrap_or(false) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        stop.cancel();
        sweeper.join().expect("join");
        assert!(!store.has_session_metadata("old").expect("check"));
    }
}
