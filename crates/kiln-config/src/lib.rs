#![warn(missing_docs)]

//! # kiln-config
//!
//! Configuration for the kiln code-execution broker.
//!
//! Two concerns live here:
//!
//! - [`BridgeSettings`]: knobs read from the `MCP_BRIDGE_*` environment
//!   family (container image, resource caps, timeouts, state directory).
//! - [`discovery`]: the ordered walk over well-known `mcpServers` config
//!   locations that yields the set of spawnable tool servers.

pub mod discovery;
pub mod settings;

pub use discovery::{default_sources, discover, ConfigSource, SourceKind, ToolServerRecord};
pub use settings::BridgeSettings;

use std::path::PathBuf;

/// Resolve the user's home directory from `$HOME`.
///
/// The broker targets Unix hosts (rootless podman/docker); `$HOME` is the
/// authoritative source there.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
