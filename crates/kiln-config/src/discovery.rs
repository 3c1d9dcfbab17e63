//! Tool-server discovery.
//!
//! Walks a fixed, priority-ordered list of filesystem locations for
//! `mcpServers` JSON configuration and produces the ordered list of
//! spawnable [`ToolServerRecord`]s. Duplicate names resolve first-wins, so
//! user-scoped sources override workspace ones. Entries that appear to
//! launch this broker itself are dropped to prevent recursive self-hosting.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::settings::BRIDGE_NAME;

/// Whether a config source is a single file or a directory of `*.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// One JSON file.
    File,
    /// Every `*.json` file inside, in lexicographic order.
    Directory,
}

/// One location to probe for server configuration.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// The file or directory path.
    pub path: PathBuf,
    /// How to read it.
    pub kind: SourceKind,
    /// Human-readable origin, used in logs.
    pub label: &'static str,
}

impl ConfigSource {
    fn file(path: PathBuf, label: &'static str) -> Self {
        Self {
            path,
            kind: SourceKind::File,
            label,
        }
    }

    fn dir(path: PathBuf, label: &'static str) -> Self {
        Self {
            path,
            kind: SourceKind::Directory,
            label,
        }
    }
}

/// Immutable configuration for one spawnable tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolServerRecord {
    /// Unique server name (deduplication key).
    pub name: String,
    /// Executable to spawn.
    pub command: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Environment merged on top of the broker's when spawning.
    pub env: HashMap<String, String>,
    /// Working directory; broker cwd when absent.
    pub cwd: Option<String>,
    /// Advisory description, shown in discovery listings.
    pub description: String,
    /// Explicit `"self": true` marker from the config entry. Such records
    /// only survive discovery when self-hosting is allowed.
    pub self_entry: bool,
}

/// Raw shape of one `mcpServers` entry. Unknown keys are ignored; entries
/// without a `command` (e.g. URL-based servers) are skipped.
#[derive(Debug, Deserialize)]
struct RawServerEntry {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "self")]
    self_entry: bool,
}

/// Raw shape of one config file.
#[derive(Debug, Deserialize)]
struct RawConfigFile {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
}

/// The default priority-ordered source list.
///
/// `MCP_SERVERS_CONFIG`, when set, replaces the whole list with that one
/// file. Do not reorder: first-wins deduplication makes this list the
/// precedence order.
pub fn default_sources() -> Vec<ConfigSource> {
    if let Ok(path) = std::env::var("MCP_SERVERS_CONFIG") {
        let path = path.trim();
        if !path.is_empty() {
            return vec![ConfigSource::file(PathBuf::from(path), "env override")];
        }
    }

    let mut sources = Vec::new();
    if let Some(home) = crate::home_dir() {
        sources.push(ConfigSource::dir(home.join("MCPs"), "user MCPs"));
        sources.push(ConfigSource::dir(
            home.join(".config/mcp/servers"),
            "standard MCP",
        ));
    }
    if let Ok(cwd) = std::env::current_dir() {
        sources.push(ConfigSource::dir(cwd.join("mcp-servers"), "local project"));
        sources.push(ConfigSource::file(
            cwd.join(".vscode/mcp.json"),
            "VS Code workspace",
        ));
    }
    if let Some(home) = crate::home_dir() {
        sources.push(ConfigSource::file(home.join(".claude.json"), "Claude CLI"));
        sources.push(ConfigSource::file(home.join(".cursor/mcp.json"), "Cursor"));
        sources.push(ConfigSource::file(
            home.join(".opencode.json"),
            "OpenCode CLI",
        ));
        sources.push(ConfigSource::file(
            home.join(".codeium/windsurf/mcp_config.json"),
            "Windsurf",
        ));

        #[cfg(target_os = "macos")]
        {
            sources.push(ConfigSource::file(
                home.join("Library/Application Support/Claude Code/claude_code_config.json"),
                "Claude Code (macOS)",
            ));
            sources.push(ConfigSource::file(
                home.join("Library/Application Support/Claude/claude_desktop_config.json"),
                "Claude Desktop (macOS)",
            ));
            sources.push(ConfigSource::file(
                home.join("Library/Application Support/Code/User/settings.json"),
                "VS Code global (macOS)",
            ));
        }
        #[cfg(target_os = "linux")]
        {
            sources.push(ConfigSource::file(
                home.join(".config/Code/User/settings.json"),
                "VS Code global (Linux)",
            ));
        }
    }
    sources
}

/// Walk `sources` in order and return the deduplicated server list.
///
/// Malformed files are warned about and skipped; missing paths are skipped
/// silently. Parse errors never abort discovery. The result order is the
/// discovery order, which is stable for an unchanged filesystem.
pub fn discover(sources: &[ConfigSource], allow_self: bool) -> Vec<ToolServerRecord> {
    let mut records: Vec<ToolServerRecord> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for source in sources {
        if !source.path.exists() {
            continue;
        }
        match source.kind {
            SourceKind::File => {
                collect_file(&source.path, source.label, allow_self, &mut records, &mut seen);
            }
            SourceKind::Directory => {
                let mut files: Vec<PathBuf> = match std::fs::read_dir(&source.path) {
                    Ok(entries) => entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                        .collect(),
                    Err(err) => {
                        tracing::warn!(
                            source = source.label,
                            path = %source.path.display(),
                            error = %err,
                            "failed to read config directory"
                        );
                        continue;
                    }
                };
                files.sort();
                for file in files {
                    collect_file(&file, source.label, allow_self, &mut records, &mut seen);
                }
            }
        }
    }

    records
}

fn collect_file(
    path: &Path,
    label: &'static str,
    allow_self: bool,
    records: &mut Vec<ToolServerRecord>,
    seen: &mut HashSet<String>,
) {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(source = label, path = %path.display(), error = %err, "failed to read config file");
            return;
        }
    };
    let parsed: RawConfigFile = match serde_json::from_str(&text) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(source = label, path = %path.display(), error = %err, "skipping malformed config file");
            return;
        }
    };

    let file_description = parsed.description.unwrap_or_default();
    for (name, raw) in parsed.mcp_servers {
        if seen.contains(&name) {
            continue;
        }
        let entry: RawServerEntry = match serde_json::from_value(raw) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(source = label, server = %name, error = %err, "skipping unsupported server entry");
                continue;
            }
        };
        if !allow_self && (entry.self_entry || looks_like_self(&name, &entry.command, &entry.args))
        {
            tracing::info!(source = label, server = %name, "skipping self-referential server entry");
            continue;
        }
        let description = entry.description.unwrap_or_else(|| file_description.clone());
        tracing::info!(source = label, server = %name, path = %path.display(), "found tool server");
        seen.insert(name.clone());
        records.push(ToolServerRecord {
            name,
            command: entry.command,
            args: entry.args,
            env: entry.env,
            cwd: entry.cwd,
            description,
            self_entry: entry.self_entry,
        });
    }
}

/// Heuristic: does this entry launch the broker itself?
///
/// Matches on the server name, the command basename, and any argument
/// carrying the bridge name as a substring. Records can also opt out
/// explicitly with `"self": true`.
fn looks_like_self(name: &str, command: &str, args: &[String]) -> bool {
    if name.to_lowercase() == BRIDGE_NAME {
        return true;
    }
    let command_name = Path::new(command)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if command_name == BRIDGE_NAME || command_name.ends_with(&format!("{BRIDGE_NAME}-cli")) {
        return true;
    }
    args.iter()
        .any(|arg| arg.to_lowercase().contains(BRIDGE_NAME))
}
