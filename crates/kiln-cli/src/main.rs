//! kiln: the code-execution MCP bridge.
//!
//! Serves one MCP tool, `run_python`, over stdio: caller code runs in a
//! rootless network-isolated container while the broker multiplexes its
//! RPC traffic to the configured tool servers.

use std::sync::Arc;

use anyhow::Result;
use kiln_config::BridgeSettings;
use kiln_server::{Broker, KilnServer};
use rmcp::ServiceExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("kiln {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Stdout carries the MCP transport; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = BridgeSettings::from_env();
    tracing::info!(
        image = %settings.image,
        max_timeout = settings.max_timeout,
        idle_timeout = settings.idle_timeout,
        "kiln starting"
    );

    let broker = Arc::new(Broker::new(settings));
    tracing::info!(
        servers = broker.server_names().len(),
        "serving run_python over stdio"
    );

    let server = KilnServer::new(broker.clone());
    let service = server.serve(rmcp::transport::io::stdio()).await?;

    tokio::select! {
        result = service.waiting() => { result?; }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal, stopping gracefully");
        }
    }

    broker.shutdown().await;
    Ok(())
}
