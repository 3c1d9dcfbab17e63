//! Per-invocation context and RPC dispatch.
//!
//! An [`Invocation`] is created for one `run` call and released on exit.
//! It captures the allowed-server set, a metadata snapshot, borrowed client
//! handles, and the scoped IPC directory. It answers every `rpc_request`
//! the sandbox raises during its execution; failures are always encoded as
//! `{"success": false, "error": ...}` payloads, never raised to the frame
//! loop.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_client::ToolClient;
use kiln_sandbox::{RpcHandler, RpcRequest};
use serde_json::Value;

use crate::broker::{ServerDocs, ServerMetadata};
use crate::state::IpcDir;

/// Context for one `run` call. Single-use; dropping it releases the IPC
/// directory but never the clients or the container.
pub struct Invocation {
    requested: Vec<String>,
    allowed: HashSet<String>,
    metadata: Vec<Arc<ServerMetadata>>,
    docs: HashMap<String, Arc<ServerDocs>>,
    clients: HashMap<String, Arc<dyn ToolClient>>,
    discovered: Value,
    ipc: IpcDir,
}

fn fail(message: impl Into<String>) -> Value {
    serde_json::json!({"success": false, "error": message.into()})
}

impl Invocation {
    pub(crate) fn new(
        requested: Vec<String>,
        metadata: Vec<Arc<ServerMetadata>>,
        docs: HashMap<String, Arc<ServerDocs>>,
        clients: HashMap<String, Arc<dyn ToolClient>>,
        discovered: Value,
        ipc: IpcDir,
    ) -> Self {
        let allowed = requested.iter().cloned().collect();
        Self {
            requested,
            allowed,
            metadata,
            docs,
            clients,
            discovered,
            ipc,
        }
    }

    /// The allowed server names, sorted.
    pub fn allowed_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.allowed.iter().cloned().collect();
        names.sort();
        names
    }

    /// The metadata snapshot as a JSON array (execute-frame payload).
    pub fn metadata_json(&self) -> Value {
        let refs: Vec<&ServerMetadata> = self.metadata.iter().map(|m| m.as_ref()).collect();
        serde_json::to_value(refs).unwrap_or_else(|_| Value::Array(Vec::new()))
    }

    /// The host path of this invocation's IPC directory.
    pub fn ipc_path(&self) -> &Path {
        self.ipc.path()
    }

    /// Container environment additions for the launch command.
    pub fn container_env(&self) -> Vec<(String, String)> {
        vec![
            ("MCP_AVAILABLE_SERVERS".into(), self.metadata_json().to_string()),
            ("MCP_DISCOVERED_SERVERS".into(), self.discovered.to_string()),
        ]
    }

    fn gate(&self, server: &str) -> Result<(), Value> {
        if self.allowed.contains(server) {
            Ok(())
        } else {
            Err(fail(format!("Server '{server}' is not available")))
        }
    }

    async fn dispatch(&self, request: RpcRequest) -> Value {
        match request {
            RpcRequest::ListServers => {
                serde_json::json!({"success": true, "servers": self.allowed_sorted()})
            }

            RpcRequest::ListTools { server } => {
                if let Err(resp) = self.gate(&server) {
                    return resp;
                }
                match self.metadata.iter().find(|m| m.name == server) {
                    Some(meta) => serde_json::json!({"success": true, "tools": meta.tools}),
                    None => fail(format!("Server '{server}' is not available")),
                }
            }

            RpcRequest::QueryToolDocs {
                server,
                tool,
                detail,
            } => {
                if let Err(resp) = self.gate(&server) {
                    return resp;
                }
                let Some(docs) = self.docs.get(&server) else {
                    return fail(format!("Documentation unavailable for server {server}"));
                };
                let formatted: Vec<Value> = match &tool {
                    Some(ident) => match docs.lookup(ident) {
                        Some(entry) => vec![docs.format_entry(entry, detail)],
                        None => {
                            return fail(format!(
                                "Tool '{ident}' not found for server {server}"
                            ))
                        }
                    },
                    None => docs
                        .entries
                        .iter()
                        .map(|entry| docs.format_entry(entry, detail))
                        .collect(),
                };
                serde_json::json!({"success": true, "docs": formatted})
            }

            RpcRequest::SearchToolDocs {
                query,
                limit,
                detail,
            } => {
                let tokens: Vec<String> = query
                    .to_lowercase()
                    .split_whitespace()
                    .map(str::to_owned)
                    .collect();
                if tokens.is_empty() {
                    return fail("Missing 'query' value");
                }
                let capped = limit.clamp(1, 20) as usize;
                let mut matches = Vec::new();
                'servers: for name in &self.requested {
                    let Some(docs) = self.docs.get(name) else {
                        continue;
                    };
                    for entry in &docs.entries {
                        if tokens.iter().all(|t| entry.keywords.contains(t.as_str())) {
                            matches.push(docs.format_entry(entry, detail));
                            if matches.len() >= capped {
                                break 'servers;
                            }
                        }
                    }
                }
                serde_json::json!({"success": true, "results": matches})
            }

            RpcRequest::CallTool {
                server,
                tool,
                arguments,
            } => {
                if let Err(resp) = self.gate(&server) {
                    return resp;
                }
                let Some(client) = self.clients.get(&server) else {
                    return fail(format!("Server {server} is not loaded"));
                };
                if !(arguments.is_object() || arguments.is_null()) {
                    return fail("Arguments must be an object");
                }
                tracing::debug!(server = %server, tool = %tool, "forwarding tool call");
                match client.call_tool(&tool, arguments).await {
                    Ok(result) => serde_json::json!({"success": true, "result": result}),
                    Err(err) => {
                        tracing::debug!(server = %server, tool = %tool, error = %err, "tool call failed");
                        fail(err.to_string())
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RpcHandler for Invocation {
    async fn handle_rpc(&self, payload: Value) -> Value {
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("<missing>")
            .to_string();
        match serde_json::from_value::<RpcRequest>(payload) {
            Ok(request) => self.dispatch(request).await,
            Err(_) => fail(format!("Unknown RPC type: {kind}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DocEntry, ToolSpec};
    use kiln_error::BridgeError;
    use serde_json::json;

    struct StubClient;

    #[async_trait]
    impl ToolClient for StubClient {
        async fn list_tools(&self) -> Result<Vec<kiln_client::ToolInfo>, BridgeError> {
            Ok(Vec::new())
        }

        async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, BridgeError> {
            match tool {
                "get_forecast" => Ok(json!({"temp": 72, "city": arguments["city"]})),
                "broken" => Err(BridgeError::Tool {
                    server: "weather".into(),
                    message: "city not found".into(),
                }),
                _ => Err(BridgeError::Tool {
                    server: "weather".into(),
                    message: format!("no such tool: {tool}"),
                }),
            }
        }

        async fn stop(&self) {}
    }

    fn weather_metadata() -> Arc<ServerMetadata> {
        Arc::new(ServerMetadata {
            name: "weather".into(),
            alias: "weather".into(),
            cwd: None,
            tools: vec![ToolSpec {
                name: "get_forecast".into(),
                alias: "get_forecast".into(),
                description: "Current conditions for a city".into(),
                input_schema: json!({"type": "object", "properties": {"city": {"type": "string"}}}),
            }],
        })
    }

    fn weather_docs() -> Arc<ServerDocs> {
        Arc::new(ServerDocs {
            server: "weather".into(),
            alias: "weather".into(),
            entries: vec![DocEntry {
                name: "get_forecast".into(),
                alias: "get_forecast".into(),
                description: "Current conditions for a city".into(),
                input_schema: json!({"type": "object"}),
                keywords: "weather weather get_forecast get_forecast current conditions for a city"
                    .into(),
            }],
        })
    }

    fn invocation(allowed: &[&str]) -> (Invocation, tempfile::TempDir) {
        let base = tempfile::tempdir().unwrap();
        let ipc = IpcDir::create(base.path()).unwrap();
        let requested: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
        let mut docs = HashMap::new();
        let mut clients: HashMap<String, Arc<dyn ToolClient>> = HashMap::new();
        let mut metadata = Vec::new();
        if requested.iter().any(|s| s == "weather") {
            metadata.push(weather_metadata());
            docs.insert("weather".to_string(), weather_docs());
            clients.insert("weather".to_string(), Arc::new(StubClient));
        }
        let inv = Invocation::new(
            requested,
            metadata,
            docs,
            clients,
            json!({"weather": "Forecasts", "sports": "Scores"}),
            ipc,
        );
        (inv, base)
    }

    #[tokio::test]
    async fn list_servers_returns_sorted_allowed_set() {
        let (inv, _guard) = invocation(&["weather"]);
        let resp = inv.handle_rpc(json!({"type": "list_servers"})).await;
        assert_eq!(resp["success"], true);
        assert_eq!(resp["servers"], json!(["weather"]));
    }

    #[tokio::test]
    async fn unrequested_server_is_gated() {
        let (inv, _guard) = invocation(&["weather"]);
        let resp = inv
            .handle_rpc(json!({"type": "call_tool", "server": "sports", "tool": "scores", "arguments": {}}))
            .await;
        assert_eq!(resp["success"], false);
        let message = resp["error"].as_str().unwrap();
        assert!(message.contains("'sports'"), "must name the server: {message}");
    }

    #[tokio::test]
    async fn list_tools_gated_and_served_from_snapshot() {
        let (inv, _guard) = invocation(&["weather"]);

        let resp = inv
            .handle_rpc(json!({"type": "list_tools", "server": "weather"}))
            .await;
        assert_eq!(resp["success"], true);
        assert_eq!(resp["tools"][0]["name"], "get_forecast");

        let resp = inv
            .handle_rpc(json!({"type": "list_tools", "server": "sports"}))
            .await;
        assert_eq!(resp["success"], false);
    }

    #[tokio::test]
    async fn call_tool_wraps_success() {
        let (inv, _guard) = invocation(&["weather"]);
        let resp = inv
            .handle_rpc(json!({
                "type": "call_tool",
                "server": "weather",
                "tool": "get_forecast",
                "arguments": {"city": "NYC"}
            }))
            .await;
        assert_eq!(resp["success"], true);
        assert_eq!(resp["result"]["temp"], 72);
        assert_eq!(resp["result"]["city"], "NYC");
    }

    #[tokio::test]
    async fn call_tool_wraps_tool_error_without_raising() {
        let (inv, _guard) = invocation(&["weather"]);
        let resp = inv
            .handle_rpc(json!({
                "type": "call_tool",
                "server": "weather",
                "tool": "broken",
                "arguments": {}
            }))
            .await;
        assert_eq!(resp["success"], false);
        assert!(resp["error"].as_str().unwrap().contains("city not found"));
    }

    #[tokio::test]
    async fn call_tool_rejects_non_object_arguments() {
        let (inv, _guard) = invocation(&["weather"]);
        let resp = inv
            .handle_rpc(json!({
                "type": "call_tool",
                "server": "weather",
                "tool": "get_forecast",
                "arguments": [1, 2]
            }))
            .await;
        assert_eq!(resp["success"], false);
        assert!(resp["error"].as_str().unwrap().contains("object"));
    }

    #[tokio::test]
    async fn query_docs_summary_omits_schema() {
        let (inv, _guard) = invocation(&["weather"]);
        let resp = inv
            .handle_rpc(json!({"type": "query_tool_docs", "server": "weather"}))
            .await;
        assert_eq!(resp["success"], true);
        let docs = resp["docs"].as_array().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["tool"], "get_forecast");
        assert_eq!(docs[0]["serverAlias"], "weather");
        assert!(docs[0].get("inputSchema").is_none());
    }

    #[tokio::test]
    async fn query_docs_full_includes_schema() {
        let (inv, _guard) = invocation(&["weather"]);
        let resp = inv
            .handle_rpc(json!({
                "type": "query_tool_docs",
                "server": "weather",
                "tool": "get_forecast",
                "detail": "full"
            }))
            .await;
        assert_eq!(resp["success"], true);
        assert!(resp["docs"][0].get("inputSchema").is_some());
    }

    #[tokio::test]
    async fn query_docs_unknown_tool_fails() {
        let (inv, _guard) = invocation(&["weather"]);
        let resp = inv
            .handle_rpc(json!({
                "type": "query_tool_docs",
                "server": "weather",
                "tool": "nope"
            }))
            .await;
        assert_eq!(resp["success"], false);
        assert!(resp["error"].as_str().unwrap().contains("'nope'"));
    }

    #[tokio::test]
    async fn search_matches_all_tokens() {
        let (inv, _guard) = invocation(&["weather"]);
        let resp = inv
            .handle_rpc(json!({"type": "search_tool_docs", "query": "current city"}))
            .await;
        assert_eq!(resp["success"], true);
        assert_eq!(resp["results"].as_array().unwrap().len(), 1);

        let resp = inv
            .handle_rpc(json!({"type": "search_tool_docs", "query": "current nonsense"}))
            .await;
        assert_eq!(resp["results"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn search_rejects_blank_query_and_clamps_limit() {
        let (inv, _guard) = invocation(&["weather"]);
        let resp = inv
            .handle_rpc(json!({"type": "search_tool_docs", "query": "   "}))
            .await;
        assert_eq!(resp["success"], false);

        let resp = inv
            .handle_rpc(json!({"type": "search_tool_docs", "query": "forecast", "limit": 0}))
            .await;
        assert_eq!(resp["success"], true);
        assert_eq!(resp["results"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_rpc_type_is_rejected() {
        let (inv, _guard) = invocation(&["weather"]);
        let resp = inv.handle_rpc(json!({"type": "drop_tables"})).await;
        assert_eq!(resp["success"], false);
        assert!(resp["error"].as_str().unwrap().contains("drop_tables"));
    }

    #[tokio::test]
    async fn empty_allowed_set_exposes_nothing() {
        let (inv, _guard) = invocation(&[]);
        let resp = inv.handle_rpc(json!({"type": "list_servers"})).await;
        assert_eq!(resp["servers"], json!([]));

        let resp = inv
            .handle_rpc(json!({"type": "call_tool", "server": "weather", "tool": "get_forecast"}))
            .await;
        assert_eq!(resp["success"], false);
    }

    #[test]
    fn container_env_carries_metadata_and_discovery() {
        let (inv, _guard) = invocation(&["weather"]);
        let env = inv.container_env();
        let available = env
            .iter()
            .find(|(k, _)| k == "MCP_AVAILABLE_SERVERS")
            .map(|(_, v)| v.clone())
            .unwrap();
        let parsed: Value = serde_json::from_str(&available).unwrap();
        assert_eq!(parsed[0]["name"], "weather");

        let discovered = env
            .iter()
            .find(|(k, _)| k == "MCP_DISCOVERED_SERVERS")
            .map(|(_, v)| v.clone())
            .unwrap();
        let parsed: Value = serde_json::from_str(&discovered).unwrap();
        assert_eq!(parsed["weather"], "Forecasts");
    }
}
