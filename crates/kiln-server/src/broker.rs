//! The broker facade.
//!
//! Owns the discovered server records, the lazily-started client pool, the
//! alias map, and the metadata/docs caches; produces per-call
//! [`Invocation`]s and drives the sandbox. Client sessions and the
//! container outlive invocations; caches and aliases live for the broker's
//! lifetime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_client::{McpClient, ToolClient};
use kiln_config::{BridgeSettings, ToolServerRecord};
use kiln_error::{BridgeError, RunStatus};
use kiln_sandbox::{
    ContainerConfig, ContainerSandbox, Detail, ExecuteRequest, SandboxDriver,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::invocation::Invocation;
use crate::state::{self, IpcDir};

/// A tool exposed to the sandbox, with its identifier-safe alias.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    /// Canonical name as reported by the server.
    pub name: String,
    /// Alias usable as a Python identifier inside the sandbox.
    pub alias: String,
    /// Tool description (may be empty).
    pub description: String,
    /// Input schema, passed through opaquely (`null` when absent).
    pub input_schema: Value,
}

/// Cached per-server bundle shipped to the sandbox with each execute.
///
/// Immutable once cached for the broker's lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMetadata {
    /// Configured server name.
    pub name: String,
    /// Identifier-safe alias (the `mcp_<alias>` proxy name).
    pub alias: String,
    /// Configured working directory, surfaced for sandbox introspection.
    pub cwd: Option<String>,
    /// Tools in server-reported order.
    pub tools: Vec<ToolSpec>,
}

/// One tool's searchable documentation entry.
#[derive(Debug, Clone)]
pub(crate) struct DocEntry {
    pub name: String,
    pub alias: String,
    pub description: String,
    pub input_schema: Value,
    /// Lowercased haystack for token matching.
    pub keywords: String,
}

/// Documentation bundle for one server.
pub(crate) struct ServerDocs {
    pub server: String,
    pub alias: String,
    pub entries: Vec<DocEntry>,
}

impl ServerDocs {
    /// Shape one entry for the wire at the requested detail level.
    pub(crate) fn format_entry(&self, entry: &DocEntry, detail: Detail) -> Value {
        let mut doc = serde_json::json!({
            "server": self.server,
            "serverAlias": self.alias,
            "tool": entry.name,
            "toolAlias": entry.alias,
        });
        if !entry.description.is_empty() {
            doc["description"] = Value::String(entry.description.clone());
        }
        if detail == Detail::Full && !entry.input_schema.is_null() {
            doc["inputSchema"] = entry.input_schema.clone();
        }
        doc
    }

    /// Find an entry by tool name or alias, case-insensitively.
    pub(crate) fn lookup(&self, ident: &str) -> Option<&DocEntry> {
        let target = ident.to_lowercase();
        self.entries
            .iter()
            .find(|e| e.name.to_lowercase() == target || e.alias.to_lowercase() == target)
    }
}

/// Result surface of one `run` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    /// One of `success`, `error`, `validation_error`, `timeout`.
    pub status: RunStatus,
    /// Captured stdout (capped; partial on timeout).
    pub stdout: String,
    /// Captured stderr (capped; partial on timeout).
    pub stderr: String,
    /// `0` on success, non-zero otherwise.
    pub exit_code: i32,
    /// The deduplicated server list this run requested.
    pub servers: Vec<String>,
    /// Human-readable failure reason, absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecOutcome {
    pub(crate) fn from_error(err: BridgeError, servers: Vec<String>) -> Self {
        let status = err.status();
        let (stdout, stderr) = match &err {
            BridgeError::Timeout { stdout, stderr, .. } => (stdout.clone(), stderr.clone()),
            _ => (String::new(), String::new()),
        };
        let mut message = err.to_string();
        if let Some(hint) = err.suggestion() {
            message = format!("{message} ({hint})");
        }
        Self {
            status,
            stdout,
            stderr,
            exit_code: 1,
            servers,
            error: Some(message),
        }
    }
}

/// Seam for producing [`ToolClient`]s, so tests can stub the pool.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Spawn and handshake a client for one record.
    async fn connect(&self, record: &ToolServerRecord) -> Result<Arc<dyn ToolClient>, BridgeError>;
}

/// Production factory: stdio child processes over MCP.
pub struct StdioClientFactory;

#[async_trait]
impl ClientFactory for StdioClientFactory {
    async fn connect(&self, record: &ToolServerRecord) -> Result<Arc<dyn ToolClient>, BridgeError> {
        Ok(Arc::new(McpClient::connect(record).await?))
    }
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<String, Arc<dyn ToolClient>>,
    start_order: Vec<String>,
    aliases: HashMap<String, String>,
    metadata: HashMap<String, Arc<ServerMetadata>>,
    docs: HashMap<String, Arc<ServerDocs>>,
}

/// Process-wide broker state: one sandbox, one client pool, one cache.
pub struct Broker {
    settings: BridgeSettings,
    sandbox: Arc<dyn SandboxDriver>,
    factory: Arc<dyn ClientFactory>,
    records: HashMap<String, ToolServerRecord>,
    order: Vec<String>,
    state: Mutex<BrokerState>,
}

fn container_config(settings: &BridgeSettings) -> ContainerConfig {
    ContainerConfig {
        runtime: settings.runtime.clone(),
        image: settings.image.clone(),
        memory: settings.memory.clone(),
        pids: settings.pids,
        cpus: settings.cpus.clone(),
        container_user: settings.container_user.clone(),
        idle_timeout: Duration::from_secs(settings.idle_timeout),
        max_stream_bytes: kiln_config::settings::MAX_STREAM_BYTES,
    }
}

impl Broker {
    /// Discover servers, prune stale IPC directories, and wire the
    /// production sandbox and client factory.
    pub fn new(settings: BridgeSettings) -> Self {
        let sources = kiln_config::default_sources();
        let records = kiln_config::discover(&sources, settings.allow_self_server);
        tracing::info!(servers = records.len(), "discovery complete");
        state::prune_stale_ipc_dirs(
            &state::resolve_state_dir(&settings),
            state::MAX_RETAINED_IPC_DIRS,
        );
        let sandbox: Arc<dyn SandboxDriver> =
            Arc::new(ContainerSandbox::new(container_config(&settings)));
        Self::with_parts(settings, records, sandbox, Arc::new(StdioClientFactory))
    }

    /// Assemble a broker from explicit parts (custom wiring, tests).
    pub fn with_parts(
        settings: BridgeSettings,
        records: Vec<ToolServerRecord>,
        sandbox: Arc<dyn SandboxDriver>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let order: Vec<String> = records.iter().map(|r| r.name.clone()).collect();
        let records = records.into_iter().map(|r| (r.name.clone(), r)).collect();
        Self {
            settings,
            sandbox,
            factory,
            records,
            order,
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Broker settings.
    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Discovered server names, in discovery order.
    pub fn server_names(&self) -> &[String] {
        &self.order
    }

    /// Discovered name → description map, in discovery order.
    pub fn descriptions_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for name in &self.order {
            if let Some(record) = self.records.get(name) {
                map.insert(name.clone(), Value::String(record.description.clone()));
            }
        }
        Value::Object(map)
    }

    fn unknown(&self, name: &str) -> BridgeError {
        BridgeError::UnknownServer {
            name: name.to_string(),
            known: self.order.clone(),
        }
    }

    /// Ensure a live client for `name`. Idempotent; concurrent racers keep
    /// the first session and stop the surplus one.
    pub async fn load_server(&self, name: &str) -> Result<(), BridgeError> {
        let record = self.records.get(name).ok_or_else(|| self.unknown(name))?;
        {
            let state = self.state.lock().await;
            if state.clients.contains_key(name) {
                return Ok(());
            }
        }

        let client = self.factory.connect(record).await?;

        let mut state = self.state.lock().await;
        if state.clients.contains_key(name) {
            drop(state);
            client.stop().await;
        } else {
            state.clients.insert(name.to_string(), client);
            state.start_order.push(name.to_string());
            tracing::info!(server = %name, "tool server loaded");
        }
        Ok(())
    }

    /// Cached metadata for `name`, populating the cache (and the docs
    /// index) on first use via one `list_tools` call.
    pub async fn server_metadata(&self, name: &str) -> Result<Arc<ServerMetadata>, BridgeError> {
        {
            let state = self.state.lock().await;
            if let Some(meta) = state.metadata.get(name) {
                return Ok(meta.clone());
            }
        }

        self.load_server(name).await?;
        let client = {
            let state = self.state.lock().await;
            state.clients.get(name).cloned()
        }
        .ok_or_else(|| BridgeError::ServerUnavailable {
            server: name.to_string(),
            message: "client missing after load".into(),
        })?;

        let tools = client.list_tools().await?;
        let cwd = self.records.get(name).and_then(|r| r.cwd.clone());

        let mut state = self.state.lock().await;
        if let Some(meta) = state.metadata.get(name) {
            return Ok(meta.clone());
        }
        let alias = alias_for(&mut state.aliases, name);

        let mut alias_counts: HashMap<String, usize> = HashMap::new();
        let mut specs = Vec::with_capacity(tools.len());
        let mut entries = Vec::with_capacity(tools.len());
        for info in &tools {
            let base = sanitize_identifier(&info.name, "tool");
            let count = alias_counts
                .entry(base.clone())
                .and_modify(|c| *c += 1)
                .or_insert(1);
            let tool_alias = if *count == 1 {
                base
            } else {
                format!("{base}_{count}")
            };
            let description = info
                .description
                .clone()
                .unwrap_or_default()
                .trim()
                .to_string();
            let keywords = format!(
                "{} {} {} {} {}",
                name, alias, info.name, tool_alias, description
            )
            .to_lowercase();
            specs.push(ToolSpec {
                name: info.name.clone(),
                alias: tool_alias.clone(),
                description: description.clone(),
                input_schema: info.input_schema.clone(),
            });
            entries.push(DocEntry {
                name: info.name.clone(),
                alias: tool_alias,
                description,
                input_schema: info.input_schema.clone(),
                keywords,
            });
        }

        let meta = Arc::new(ServerMetadata {
            name: name.to_string(),
            alias: alias.clone(),
            cwd,
            tools: specs,
        });
        state.metadata.insert(name.to_string(), meta.clone());
        state.docs.insert(
            name.to_string(),
            Arc::new(ServerDocs {
                server: name.to_string(),
                alias,
                entries,
            }),
        );
        tracing::info!(server = %name, tools = meta.tools.len(), "server metadata cached");
        Ok(meta)
    }

    /// Build the per-call context for `requested` servers: metadata
    /// snapshot, docs, client handles, and a fresh IPC directory.
    pub async fn prepare_invocation(&self, requested: &[String]) -> Result<Invocation, BridgeError> {
        let mut metadata = Vec::with_capacity(requested.len());
        let mut docs = HashMap::new();
        let mut clients: HashMap<String, Arc<dyn ToolClient>> = HashMap::new();
        for name in requested {
            metadata.push(self.server_metadata(name).await?);
            let state = self.state.lock().await;
            if let Some(d) = state.docs.get(name) {
                docs.insert(name.clone(), d.clone());
            }
            if let Some(c) = state.clients.get(name) {
                clients.insert(name.clone(), c.clone());
            }
        }
        let ipc = IpcDir::create(&state::resolve_state_dir(&self.settings))?;
        Ok(Invocation::new(
            requested.to_vec(),
            metadata,
            docs,
            clients,
            self.descriptions_json(),
            ipc,
        ))
    }

    /// Execute `code` with the requested servers mounted.
    ///
    /// Never returns `Err`: every failure is folded into the outcome's
    /// status and error message.
    pub async fn run(&self, code: &str, servers: &[String], timeout_secs: u64) -> ExecOutcome {
        let requested = dedupe(servers);
        match self.run_inner(code, &requested, timeout_secs).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(error = %err, code = err.code(), "execution failed");
                ExecOutcome::from_error(err, requested)
            }
        }
    }

    async fn run_inner(
        &self,
        code: &str,
        requested: &[String],
        timeout_secs: u64,
    ) -> Result<ExecOutcome, BridgeError> {
        if code.trim().is_empty() {
            return Err(BridgeError::Validation("empty code".into()));
        }
        let timeout = self.settings.clamp_timeout(timeout_secs);

        // Reject unknown names before any client or container is touched.
        for name in requested {
            if !self.records.contains_key(name) {
                return Err(self.unknown(name));
            }
        }
        for name in requested {
            self.load_server(name).await?;
        }

        let invocation = self.prepare_invocation(requested).await?;
        let req = ExecuteRequest {
            code: code.to_string(),
            timeout: Duration::from_secs(timeout),
            allowed_servers: invocation.allowed_sorted(),
            metadata: invocation.metadata_json(),
            ipc_dir: invocation.ipc_path().to_path_buf(),
            extra_mounts: Vec::new(),
            env: invocation.container_env(),
        };

        tracing::info!(
            servers = ?requested,
            timeout_s = timeout,
            code_len = code.len(),
            "executing sandbox code"
        );
        let output = self.sandbox.execute(Arc::new(invocation), req).await?;

        Ok(ExecOutcome {
            status: RunStatus::Success,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: 0,
            servers: requested.to_vec(),
            error: None,
        })
    }

    /// Stop the container, then every live client in reverse start order.
    /// Metadata caches and aliases are retained.
    pub async fn shutdown(&self) {
        self.sandbox.shutdown().await;
        let (clients, order) = {
            let mut state = self.state.lock().await;
            (
                std::mem::take(&mut state.clients),
                std::mem::take(&mut state.start_order),
            )
        };
        for name in order.iter().rev() {
            if let Some(client) = clients.get(name) {
                client.stop().await;
            }
        }
        tracing::info!("broker shut down");
    }
}

fn dedupe(servers: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    servers
        .iter()
        .filter(|name| seen.insert(name.as_str()))
        .cloned()
        .collect()
}

fn alias_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"[^a-z0-9_]+").unwrap())
}

/// Python keywords that may not be shadowed by a tool alias.
const PYTHON_KEYWORDS: [&str; 35] = [
    "false", "none", "true", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while",
    "with", "yield",
];

/// Stable identifier-safe alias for a server name.
///
/// Lowercase, runs of non-`[a-z0-9_]` collapsed to `_`, `_`-prefixed when
/// digit-led, collisions suffixed `_2`, `_3`, ...
fn alias_for(aliases: &mut HashMap<String, String>, name: &str) -> String {
    if let Some(alias) = aliases.get(name) {
        return alias.clone();
    }
    let cleaned = alias_regex()
        .replace_all(&name.to_lowercase(), "_")
        .into_owned();
    let base = if cleaned.is_empty() {
        "server".to_string()
    } else if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{cleaned}")
    } else {
        cleaned
    };

    let used: HashSet<&String> = aliases.values().collect();
    let mut alias = base.clone();
    let mut suffix = 1;
    while used.contains(&alias) {
        suffix += 1;
        alias = format!("{base}_{suffix}");
    }
    drop(used);
    aliases.insert(name.to_string(), alias.clone());
    alias
}

/// Convert an arbitrary string into a valid Python identifier.
fn sanitize_identifier(value: &str, default: &str) -> String {
    let cleaned = alias_regex()
        .replace_all(&value.trim().to_lowercase(), "_")
        .into_owned();
    let mut ident = if cleaned.is_empty() {
        default.to_string()
    } else {
        cleaned
    };
    if ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident = format!("_{ident}");
    }
    if PYTHON_KEYWORDS.contains(&ident.as_str()) {
        ident.push('_');
    }
    ident
}
