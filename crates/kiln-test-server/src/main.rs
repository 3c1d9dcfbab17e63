//! Minimal MCP tool server for integration testing.
//!
//! Exposes a few tools over stdio transport: an echo, a canned weather
//! forecast, and a tool that always reports an error. Spawned as a child
//! process by the kiln-client integration tests.

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars::JsonSchema;
use rmcp::{tool, tool_handler, tool_router, ServerHandler, ServiceExt};
use serde::Deserialize;

#[derive(Clone)]
struct TestServer {
    tool_router: ToolRouter<Self>,
}

impl TestServer {
    fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EchoInput {
    /// The message to echo back.
    message: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ForecastInput {
    /// City to report on.
    city: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FailInput {
    /// Message to fail with.
    #[serde(default)]
    reason: Option<String>,
}

#[tool_router(router = tool_router)]
impl TestServer {
    /// Echo a message back.
    #[tool(name = "echo", description = "Echo a message back unchanged")]
    async fn echo(&self, Parameters(input): Parameters<EchoInput>) -> Result<String, String> {
        Ok(serde_json::json!({
            "echoed": input.message
        })
        .to_string())
    }

    /// Canned forecast.
    #[tool(
        name = "get_forecast",
        description = "Current weather conditions for a city"
    )]
    async fn get_forecast(
        &self,
        Parameters(input): Parameters<ForecastInput>,
    ) -> Result<String, String> {
        Ok(serde_json::json!({
            "temp": 72,
            "city": input.city,
        })
        .to_string())
    }

    /// Always fails, for error-path tests.
    #[tool(name = "always.fails", description = "Reports a tool error")]
    async fn always_fails(
        &self,
        Parameters(input): Parameters<FailInput>,
    ) -> Result<String, String> {
        Err(input.reason.unwrap_or_else(|| "deliberate failure".into()))
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for TestServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some("Test MCP server for kiln integration tests".into()),
            server_info: Implementation {
                name: "kiln-test-server".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() {
    let server = TestServer::new();
    let service = server.serve(rmcp::transport::io::stdio()).await.unwrap();
    service.waiting().await.unwrap();
}
