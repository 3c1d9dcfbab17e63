#![warn(missing_docs)]

//! # kiln-server
//!
//! MCP surface and broker facade for the kiln code-execution bridge.
//!
//! Exposes exactly one tool to agents, `run_python`: execute Python in a
//! persistent, network-isolated container sandbox, with proxies for any
//! requested MCP tool servers mounted into the evaluation namespace.

pub mod broker;
pub mod invocation;
pub mod state;

pub use broker::{
    Broker, ClientFactory, ExecOutcome, ServerMetadata, StdioClientFactory, ToolSpec,
};
pub use invocation::Invocation;

use std::future::Future;
use std::sync::Arc;

use kiln_error::RunStatus;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    Implementation, ListResourcesResult, PaginatedRequestParam, RawResource,
    ReadResourceRequestParam, ReadResourceResult, Resource, ResourceContents,
    ServerCapabilities, ServerInfo,
};
use rmcp::schemars::JsonSchema;
use rmcp::service::RequestContext;
use rmcp::{tool, tool_handler, tool_router, ErrorData, RoleServer, ServerHandler};
use serde::Deserialize;

/// URI of the capability overview resource.
pub const CAPABILITY_RESOURCE_URI: &str = "resource://kiln/capabilities";

const CAPABILITY_RESOURCE_TEXT: &str = "\
# kiln sandbox capabilities

Persistent Python sandbox: variables survive between `run_python` calls \
within the same session.

## Quick usage

- Pass `servers=[...]` to mount MCP proxies. Each allowed server appears \
as `mcp_<alias>`; call tools with `await mcp_<alias>.<tool>(...)`.
- Discover before guessing: `await search_tool_docs('query')` finds tools \
across the allowed servers; `await query_tool_docs(server)` lists one \
server's docs; `discovered_servers(detailed=True)` shows every configured \
server with its description.
- `await list_servers()` returns the servers this call may reach.
- Server configs may set `cwd`; check a server's metadata before assuming \
its working directory.

The sandbox has no network access of its own; all outside reach goes \
through the mounted MCP proxies.
";

/// The kiln MCP server handler.
///
/// Implements `ServerHandler` to serve `run_python` over stdio transport.
#[derive(Clone)]
pub struct KilnServer {
    broker: Arc<Broker>,
    tool_router: ToolRouter<Self>,
}

impl KilnServer {
    /// Wrap a broker in the MCP handler.
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            tool_router: Self::tool_router(),
        }
    }

    /// The underlying broker.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}

/// Input for the `run_python` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunPythonInput {
    /// Python code to execute. For MCP tools, use:
    /// `result = await mcp_<server>.<tool>(...); print(result)`.
    pub code: String,
    /// MCP servers to load for this call. Required when calling MCP tools;
    /// an empty list runs with no proxies mounted.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Execution timeout in seconds, clamped to the configured ceiling.
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[tool_router(router = tool_router)]
impl KilnServer {
    /// Execute Python in the persistent container sandbox.
    #[tool(
        name = "run_python",
        description = "Execute Python code in a persistent, network-isolated sandbox. Variables persist between calls. To call MCP server tools, pass servers=['name'] and use: result = await mcp_<name>.<tool>(...); print(result). Discovery helpers available inside the sandbox: await list_servers(), await search_tool_docs('query'), await query_tool_docs(server), discovered_servers()."
    )]
    pub async fn run_python(
        &self,
        Parameters(input): Parameters<RunPythonInput>,
    ) -> Result<String, String> {
        tracing::info!(
            code_len = input.code.len(),
            servers = ?input.servers,
            timeout = ?input.timeout,
            "run_python: starting"
        );

        let timeout = input
            .timeout
            .unwrap_or(self.broker.settings().default_timeout);
        let outcome = self.broker.run(&input.code, &input.servers, timeout).await;

        let json = serde_json::to_string_pretty(&outcome)
            .map_err(|e| format!("result serialization failed: {e}"))?;
        match outcome.status {
            RunStatus::Success => {
                tracing::info!(
                    stdout_len = outcome.stdout.len(),
                    stderr_len = outcome.stderr.len(),
                    "run_python: complete"
                );
                Ok(json)
            }
            status => {
                tracing::warn!(status = status.as_str(), "run_python: failed");
                Err(json)
            }
        }
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for KilnServer {
    fn get_info(&self) -> ServerInfo {
        let names = self.broker.server_names();
        let listing = if names.is_empty() {
            "none".to_string()
        } else {
            names.join(", ")
        };

        ServerInfo {
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            instructions: Some(format!(
                "kiln code-execution bridge. One tool: run_python(code, servers, timeout) \
                 executes Python in a persistent rootless container with no network access.\n\
                 \n\
                 Available MCP servers: {listing}.\n\
                 \n\
                 To call a server's tools, name it in `servers` and use \
                 `await mcp_<alias>.<tool>(...)` inside the code. Inside the sandbox, \
                 `await search_tool_docs('query')` finds tools and \
                 `await query_tool_docs(server)` shows their parameters; don't guess \
                 tool names. Variables persist between calls while the container stays \
                 warm; an idle timeout eventually recycles it."
            )),
            server_info: Implementation {
                name: "kiln".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            ..Default::default()
        }
    }

    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListResourcesResult, ErrorData>> + Send + '_ {
        std::future::ready(Ok(ListResourcesResult {
            next_cursor: None,
            resources: vec![{
                let mut r = RawResource::new(CAPABILITY_RESOURCE_URI, "kiln-capabilities");
                r.description =
                    Some("Sandbox capability overview and proxy usage notes".into());
                r.mime_type = Some("text/markdown".into());
                Resource::new(r, None)
            }],
        }))
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ReadResourceResult, ErrorData>> + Send + '_ {
        std::future::ready(if request.uri.as_str() == CAPABILITY_RESOURCE_URI {
            Ok(ReadResourceResult {
                contents: vec![ResourceContents::text(
                    CAPABILITY_RESOURCE_TEXT,
                    CAPABILITY_RESOURCE_URI,
                )],
            })
        } else {
            Err(ErrorData::resource_not_found(
                format!("unknown resource: {}", request.uri),
                None,
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiln_config::{BridgeSettings, ToolServerRecord};
    use kiln_error::BridgeError;
    use kiln_sandbox::{ExecOutput, ExecuteRequest, RpcHandler, SandboxDriver};

    struct UnreachableSandbox;

    #[async_trait]
    impl SandboxDriver for UnreachableSandbox {
        async fn execute(
            &self,
            _handler: Arc<dyn RpcHandler>,
            _req: ExecuteRequest,
        ) -> Result<ExecOutput, BridgeError> {
            panic!("sandbox must not be touched");
        }

        async fn shutdown(&self) {}
    }

    struct UnreachableFactory;

    #[async_trait]
    impl ClientFactory for UnreachableFactory {
        async fn connect(
            &self,
            _record: &ToolServerRecord,
        ) -> Result<Arc<dyn kiln_client::ToolClient>, BridgeError> {
            panic!("no client should be spawned");
        }
    }

    fn test_server(records: Vec<ToolServerRecord>) -> KilnServer {
        let broker = Broker::with_parts(
            BridgeSettings::default(),
            records,
            Arc::new(UnreachableSandbox),
            Arc::new(UnreachableFactory),
        );
        KilnServer::new(Arc::new(broker))
    }

    fn record(name: &str) -> ToolServerRecord {
        ToolServerRecord {
            name: name.into(),
            command: "does-not-matter".into(),
            args: vec![],
            env: Default::default(),
            cwd: None,
            description: format!("{name} tools"),
            self_entry: false,
        }
    }

    #[test]
    fn get_info_lists_discovered_servers() {
        let server = test_server(vec![record("weather"), record("sports")]);
        let info = server.get_info();
        assert_eq!(info.server_info.name, "kiln");
        let instructions = info.instructions.unwrap();
        assert!(instructions.contains("run_python"));
        assert!(instructions.contains("weather, sports"));
    }

    #[test]
    fn get_info_with_no_servers() {
        let server = test_server(vec![]);
        let instructions = server.get_info().instructions.unwrap();
        assert!(instructions.contains("Available MCP servers: none"));
    }

    #[tokio::test]
    async fn empty_code_is_a_validation_error() {
        let server = test_server(vec![]);
        let result = server
            .run_python(Parameters(RunPythonInput {
                code: "   \n".into(),
                servers: vec![],
                timeout: None,
            }))
            .await;
        let body = result.unwrap_err();
        assert!(body.contains("validation_error"), "got: {body}");
        assert!(body.contains("empty code"));
    }

    #[tokio::test]
    async fn unknown_server_rejected_before_any_spawn() {
        // The panicking sandbox and factory prove nothing is touched.
        let server = test_server(vec![record("weather")]);
        let result = server
            .run_python(Parameters(RunPythonInput {
                code: "print(1)".into(),
                servers: vec!["weathr".into()],
                timeout: Some(5),
            }))
            .await;
        let body = result.unwrap_err();
        assert!(body.contains("validation_error"));
        assert!(body.contains("weathr"));
        assert!(body.contains("did you mean 'weather'?"), "got: {body}");
    }
}
