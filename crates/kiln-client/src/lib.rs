#![warn(missing_docs)]

//! # kiln-client
//!
//! MCP client sessions for kiln's tool-server pool.
//!
//! Each configured tool server is spawned as a child process speaking MCP
//! over its stdio. [`McpClient`] owns one such child: it performs the
//! protocol handshake at connect time, lists tools, and forwards opaque
//! tool calls. The broker talks to clients through the [`ToolClient`]
//! trait so tests can substitute stubs.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use kiln_config::ToolServerRecord;
use kiln_error::BridgeError;
use rmcp::model::{CallToolRequestParam, CallToolResult, Content, RawContent};
use rmcp::service::RunningService;
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell};

/// Budget for spawning a tool server and completing the MCP handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A tool exposed by a tool server, as reported over `list_tools`.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    /// Canonical tool name.
    pub name: String,
    /// Tool description, if the server provided one.
    pub description: Option<String>,
    /// JSON Schema for the tool's input parameters, passed through opaquely.
    pub input_schema: Value,
}

/// A live session with one tool server.
///
/// Implementations serialise tool calls: at most one request is in flight
/// per client. Retries are a policy decision left to callers.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// List the tools this server exposes, in server-reported order.
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, BridgeError>;

    /// Call a tool and return its response payload as opaque JSON.
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, BridgeError>;

    /// Close the session and terminate the child. Safe to call repeatedly.
    async fn stop(&self);
}

/// A client connection to a single tool server over stdio.
#[derive(Debug)]
pub struct McpClient {
    name: String,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
    tools: OnceCell<Vec<ToolInfo>>,
}

impl McpClient {
    /// Spawn the configured child with merged environment and working
    /// directory, then perform the MCP handshake.
    ///
    /// Fails with [`BridgeError::ServerStartFailed`] when the process cannot
    /// be spawned or the handshake does not complete within
    /// [`HANDSHAKE_TIMEOUT`].
    pub async fn connect(record: &ToolServerRecord) -> Result<Self, BridgeError> {
        let name = record.name.clone();

        tracing::info!(
            server = %name,
            command = %record.command,
            args = ?record.args,
            cwd = ?record.cwd,
            "connecting to tool server"
        );

        let transport = TokioChildProcess::new(Command::new(&record.command).configure(|cmd| {
            cmd.args(&record.args);
            for (key, value) in &record.env {
                cmd.env(key, value);
            }
            if let Some(cwd) = &record.cwd {
                cmd.current_dir(cwd);
            }
        }))
        .map_err(|e| BridgeError::ServerStartFailed {
            server: name.clone(),
            message: format!("failed to spawn '{}': {e}", record.command),
        })?;

        let service = tokio::time::timeout(HANDSHAKE_TIMEOUT, ().serve(transport))
            .await
            .map_err(|_| BridgeError::ServerStartFailed {
                server: name.clone(),
                message: format!(
                    "handshake did not complete within {}s",
                    HANDSHAKE_TIMEOUT.as_secs()
                ),
            })?
            .map_err(|e| BridgeError::ServerStartFailed {
                server: name.clone(),
                message: format!("handshake failed: {e}"),
            })?;

        tracing::info!(server = %name, "tool server connected");

        Ok(Self {
            name,
            service: Mutex::new(Some(service)),
            tools: OnceCell::new(),
        })
    }

    /// The configured server name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl ToolClient for McpClient {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, BridgeError> {
        self.tools
            .get_or_try_init(|| async {
                let guard = self.service.lock().await;
                let service = guard.as_ref().ok_or_else(|| BridgeError::ServerUnavailable {
                    server: self.name.clone(),
                    message: "session is stopped".into(),
                })?;

                let tools =
                    service
                        .list_all_tools()
                        .await
                        .map_err(|e| BridgeError::ServerUnavailable {
                            server: self.name.clone(),
                            message: format!("list_tools failed: {e}"),
                        })?;

                Ok(tools
                    .into_iter()
                    .map(|t| ToolInfo {
                        name: t.name.to_string(),
                        description: t.description.map(|d: Cow<'_, str>| d.to_string()),
                        input_schema: serde_json::to_value(&*t.input_schema)
                            .unwrap_or(Value::Object(Default::default())),
                    })
                    .collect())
            })
            .await
            .map(|tools| tools.clone())
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, BridgeError> {
        // Holding the session lock across the request serialises calls on
        // this client; results come back in request order.
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| BridgeError::ServerUnavailable {
            server: self.name.clone(),
            message: "session is stopped".into(),
        })?;

        let arguments = arguments.as_object().cloned().or_else(|| {
            if arguments.is_null() {
                Some(serde_json::Map::new())
            } else {
                None
            }
        });

        let result: CallToolResult = service
            .call_tool(CallToolRequestParam {
                name: Cow::Owned(tool.to_string()),
                arguments,
            })
            .await
            .map_err(|e| BridgeError::ServerUnavailable {
                server: self.name.clone(),
                message: format!("tool '{tool}' transport failure: {e}"),
            })?;

        flatten_tool_result(&self.name, result)
    }

    async fn stop(&self) {
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            tracing::info!(server = %self.name, "stopping tool server");
            let _ = service.cancel().await;
        }
    }
}

/// Convert an MCP `CallToolResult` into plain JSON for the sandbox.
///
/// Structured content wins when present; a server-reported error becomes
/// [`BridgeError::Tool`] with the message preserved.
fn flatten_tool_result(server: &str, result: CallToolResult) -> Result<Value, BridgeError> {
    if let Some(structured) = result.structured_content {
        return Ok(structured);
    }

    if result.is_error == Some(true) {
        let message = result
            .content
            .iter()
            .filter_map(|c| match &c.raw {
                RawContent::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        return Err(BridgeError::Tool {
            server: server.to_string(),
            message,
        });
    }

    match result.content.len() {
        0 => Ok(Value::Null),
        1 => Ok(content_to_value(&result.content[0])),
        _ => Ok(Value::Array(
            result.content.iter().map(content_to_value).collect(),
        )),
    }
}

/// Convert a single content item to JSON. Text that parses as JSON is
/// passed through as the parsed value.
fn content_to_value(content: &Content) -> Value {
    match &content.raw {
        RawContent::Text(t) => {
            serde_json::from_str(&t.text).unwrap_or_else(|_| Value::String(t.text.clone()))
        }
        RawContent::Image(img) => serde_json::json!({
            "type": "image",
            "data": img.data,
            "mime_type": img.mime_type,
        }),
        RawContent::Resource(r) => serde_json::json!({
            "type": "resource",
            "resource": serde_json::to_value(&r.resource).unwrap_or(Value::Null),
        }),
        RawContent::Audio(a) => serde_json::json!({
            "type": "audio",
            "data": a.data,
            "mime_type": a.mime_type,
        }),
        _ => serde_json::json!({"type": "unknown"}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_from_json(json: serde_json::Value) -> CallToolResult {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn flatten_prefers_structured_content() {
        let result = result_from_json(serde_json::json!({
            "content": [{"type": "text", "text": "ignored"}],
            "structuredContent": {"temp": 72}
        }));
        let value = flatten_tool_result("w", result).unwrap();
        assert_eq!(value["temp"], 72);
    }

    #[test]
    fn flatten_parses_json_text() {
        let result = result_from_json(serde_json::json!({
            "content": [{"type": "text", "text": "{\"city\":\"NYC\"}"}]
        }));
        let value = flatten_tool_result("w", result).unwrap();
        assert_eq!(value["city"], "NYC");
    }

    #[test]
    fn flatten_keeps_plain_text_as_string() {
        let result = result_from_json(serde_json::json!({
            "content": [{"type": "text", "text": "just words"}]
        }));
        let value = flatten_tool_result("w", result).unwrap();
        assert_eq!(value, Value::String("just words".into()));
    }

    #[test]
    fn flatten_empty_content_is_null() {
        let result = result_from_json(serde_json::json!({"content": []}));
        assert_eq!(flatten_tool_result("w", result).unwrap(), Value::Null);
    }

    #[test]
    fn flatten_multiple_items_become_array() {
        let result = result_from_json(serde_json::json!({
            "content": [
                {"type": "text", "text": "1"},
                {"type": "text", "text": "two"}
            ]
        }));
        let value = flatten_tool_result("w", result).unwrap();
        assert_eq!(value, serde_json::json!([1, "two"]));
    }

    #[test]
    fn flatten_server_error_preserves_message() {
        let result = result_from_json(serde_json::json!({
            "content": [{"type": "text", "text": "city not found"}],
            "isError": true
        }));
        let err = flatten_tool_result("weather", result).unwrap_err();
        match err {
            BridgeError::Tool { server, message } => {
                assert_eq!(server, "weather");
                assert_eq!(message, "city not found");
            }
            other => panic!("expected Tool error, got: {other}"),
        }
    }
}
