//! Broker settings read from the `MCP_BRIDGE_*` environment family.

use std::path::PathBuf;

/// Name this broker announces over MCP and uses for self-exclusion checks.
pub const BRIDGE_NAME: &str = "kiln";

/// Per-stream output cap for one execution (stdout and stderr each).
pub const MAX_STREAM_BYTES: usize = 1024 * 1024;

/// Runtime knobs for the sandbox and broker.
///
/// Every field has a default; [`BridgeSettings::from_env`] overlays the
/// `MCP_BRIDGE_*` variables on top. Unparseable numeric values fall back to
/// the default rather than aborting startup.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Pinned container runtime executable, if any (`MCP_BRIDGE_RUNTIME`).
    pub runtime: Option<String>,
    /// Base container image (`MCP_BRIDGE_IMAGE`).
    pub image: String,
    /// Memory cap in runtime-native syntax (`MCP_BRIDGE_MEMORY`).
    pub memory: String,
    /// Process count cap (`MCP_BRIDGE_PIDS`).
    pub pids: u32,
    /// CPU quota in runtime-native syntax (`MCP_BRIDGE_CPUS`).
    pub cpus: Option<String>,
    /// Default per-run timeout in seconds (`MCP_BRIDGE_TIMEOUT`).
    pub default_timeout: u64,
    /// Ceiling the per-run timeout is clamped to (`MCP_BRIDGE_MAX_TIMEOUT`).
    pub max_timeout: u64,
    /// Idle seconds before the container is shut down
    /// (`MCP_BRIDGE_RUNTIME_IDLE_TIMEOUT`); 0 disables the timer.
    pub idle_timeout: u64,
    /// UID:GID the container runs as (`MCP_BRIDGE_CONTAINER_USER`).
    pub container_user: String,
    /// Root for persistent state and IPC directories
    /// (`MCP_BRIDGE_STATE_DIR`; defaults to `$HOME/MCPs`).
    pub state_dir: Option<PathBuf>,
    /// Allow configs that point back at this broker
    /// (`MCP_BRIDGE_ALLOW_SELF_SERVER`).
    pub allow_self_server: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            runtime: None,
            image: "python:3.14-slim".into(),
            memory: "512m".into(),
            pids: 128,
            cpus: None,
            default_timeout: 30,
            max_timeout: 120,
            idle_timeout: 300,
            container_user: "65534:65534".into(),
            state_dir: None,
            allow_self_server: false,
        }
    }
}

impl BridgeSettings {
    /// Build settings from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            runtime: non_empty_var("MCP_BRIDGE_RUNTIME"),
            image: non_empty_var("MCP_BRIDGE_IMAGE").unwrap_or(defaults.image),
            memory: non_empty_var("MCP_BRIDGE_MEMORY").unwrap_or(defaults.memory),
            pids: parsed_var("MCP_BRIDGE_PIDS").unwrap_or(defaults.pids),
            cpus: non_empty_var("MCP_BRIDGE_CPUS"),
            default_timeout: parsed_var("MCP_BRIDGE_TIMEOUT").unwrap_or(defaults.default_timeout),
            max_timeout: parsed_var("MCP_BRIDGE_MAX_TIMEOUT").unwrap_or(defaults.max_timeout),
            idle_timeout: parsed_var("MCP_BRIDGE_RUNTIME_IDLE_TIMEOUT")
                .unwrap_or(defaults.idle_timeout),
            container_user: non_empty_var("MCP_BRIDGE_CONTAINER_USER")
                .unwrap_or(defaults.container_user),
            state_dir: non_empty_var("MCP_BRIDGE_STATE_DIR").map(PathBuf::from),
            allow_self_server: truthy_var("MCP_BRIDGE_ALLOW_SELF_SERVER"),
        }
    }

    /// Clamp a requested timeout into `[1, max_timeout]` seconds.
    pub fn clamp_timeout(&self, requested: u64) -> u64 {
        requested.clamp(1, self.max_timeout.max(1))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    non_empty_var(name).and_then(|v| v.parse().ok())
}

fn truthy_var(name: &str) -> bool {
    matches!(
        non_empty_var(name).as_deref().map(str::to_lowercase),
        Some(ref v) if matches!(v.as_str(), "1" | "true" | "yes")
    )
}
