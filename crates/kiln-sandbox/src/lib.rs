#![warn(missing_docs)]

//! # kiln-sandbox
//!
//! Rootless container sandbox for the kiln code-execution broker.
//!
//! Executes caller-supplied Python in a locked-down container with no
//! network, a read-only root, and dropped capabilities. The only bridge to
//! the host is a line-framed JSON protocol on the container's stdio: code
//! goes down as `execute` frames, output comes back as `stdout`/`stderr`
//! frames, and sandbox code reaches tool servers through correlated
//! `rpc_request`/`rpc_response` pairs routed to an [`RpcHandler`].
//!
//! ## Isolation model
//!
//! - **Rootless runtime**: podman preferred, docker fallback
//! - **No network**: `--network none`
//! - **Read-only root**: writable tmpfs only at `/tmp` and `/workspace`
//! - **No privileges**: `--cap-drop ALL`, `--security-opt no-new-privileges`,
//!   unprivileged UID
//! - **Bounded resources**: pids, memory, optional CPU quota
//! - **Bounded output**: per-stream caps with a truncation sentinel
//! - **One container, reused**: variables persist between executes; the
//!   idle TTL provides a clean slate after inactivity

pub mod container;
pub mod entrypoint;
pub mod frame;
pub mod output;
pub mod runtime;

pub use container::{ContainerConfig, ContainerSandbox, ExecOutput, ExecuteRequest};
pub use frame::{Detail, HostFrame, RpcRequest, SandboxFrame};
pub use output::{CappedBuffer, TRUNCATION_SENTINEL};

/// Trait for answering RPC requests issued by sandbox code.
///
/// Implementations hold the tool-server sessions and the per-invocation
/// allowed-set. The sandbox never sees credentials or process handles; it
/// calls through opaque proxies that route here.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync {
    /// Answer one `rpc_request` payload.
    ///
    /// Must always return a response object of the form
    /// `{"success": bool, ...}`; errors are encoded in the payload, never
    /// raised to the frame loop.
    async fn handle_rpc(&self, payload: serde_json::Value) -> serde_json::Value;
}

/// The execution surface the broker drives.
///
/// [`ContainerSandbox`] is the production implementation; tests substitute
/// scripted fakes to exercise broker semantics without a container runtime.
#[async_trait::async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Run one execution, routing sandbox RPC traffic to `handler`.
    async fn execute(
        &self,
        handler: std::sync::Arc<dyn RpcHandler>,
        req: ExecuteRequest,
    ) -> Result<ExecOutput, kiln_error::BridgeError>;

    /// Stop the sandbox if it is running. Idempotent.
    async fn shutdown(&self);
}

#[async_trait::async_trait]
impl SandboxDriver for ContainerSandbox {
    async fn execute(
        &self,
        handler: std::sync::Arc<dyn RpcHandler>,
        req: ExecuteRequest,
    ) -> Result<ExecOutput, kiln_error::BridgeError> {
        ContainerSandbox::execute(self, handler, req).await
    }

    async fn shutdown(&self) {
        ContainerSandbox::shutdown(self).await;
    }
}
