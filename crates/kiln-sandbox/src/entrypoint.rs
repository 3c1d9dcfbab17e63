//! The generated in-container entrypoint.
//!
//! Rendered into the IPC directory before the first launch and executed as
//! `python3 -u /ipc/entrypoint.py` inside the container. It is the sandbox
//! side of the broker protocol: a stream proxy pair re-emitting prints as
//! frames, one stdin reader task, an RPC-call primitive with a correlation
//! table, a per-execute proxy installer, and a single-threaded execute
//! loop over a persistent namespace.

/// File name of the artefact inside the IPC directory.
pub const ENTRYPOINT_FILE_NAME: &str = "entrypoint.py";

/// Path of the artefact as seen from inside the container.
pub const ENTRYPOINT_CONTAINER_PATH: &str = "/ipc/entrypoint.py";

/// Render the entrypoint source.
///
/// The artefact is static: per-invocation allowed-sets and metadata arrive
/// inside each `execute` frame, and the discovered-server listing is fed
/// through the container environment at launch.
pub fn render() -> String {
    ENTRYPOINT_TEMPLATE.to_string()
}

const ENTRYPOINT_TEMPLATE: &str = r#"import asyncio
import ast
import inspect
import json
import os
import signal
import sys
import traceback

DISCOVERED_SERVERS = json.loads(os.environ.get("MCP_DISCOVERED_SERVERS", "{}"))

_PENDING_RESPONSES = {}
_REQUEST_COUNTER = 0
_EXECUTION_QUEUE = asyncio.Queue()
_CURRENT_EXECUTION = None


def _send_message(message):
    sys.__stdout__.write(json.dumps(message, separators=(",", ":")) + "\n")
    sys.__stdout__.flush()


class _StreamProxy:
    def __init__(self, kind):
        self._kind = kind

    def write(self, data):
        if not data:
            return
        _send_message({"type": self._kind, "data": data})

    def flush(self):
        pass

    def isatty(self):
        return False


sys.stdout = _StreamProxy("stdout")
sys.stderr = _StreamProxy("stderr")


class MCPError(RuntimeError):
    """Raised when an MCP call fails."""


async def _rpc_call(payload):
    global _REQUEST_COUNTER
    loop = asyncio.get_running_loop()
    _REQUEST_COUNTER += 1
    request_id = _REQUEST_COUNTER
    future = loop.create_future()
    _PENDING_RESPONSES[request_id] = future
    _send_message({"type": "rpc_request", "id": request_id, "payload": payload})
    response = await future
    if not isinstance(response, dict):
        raise MCPError("Malformed RPC response")
    if not response.get("success", True):
        raise MCPError(response.get("error", "MCP request failed"))
    return response


async def call_tool(server, tool, arguments=None):
    response = await _rpc_call(
        {"type": "call_tool", "server": server, "tool": tool, "arguments": arguments or {}}
    )
    return response.get("result")


async def list_tools(server):
    response = await _rpc_call({"type": "list_tools", "server": server})
    return response.get("tools", [])


async def list_servers():
    response = await _rpc_call({"type": "list_servers"})
    return tuple(response.get("servers", ()))


async def query_tool_docs(server, tool=None, detail="summary"):
    payload = {"type": "query_tool_docs", "server": server, "detail": detail}
    if tool is not None:
        payload["tool"] = tool
    response = await _rpc_call(payload)
    docs = response.get("docs", [])
    if tool is not None and isinstance(docs, list) and len(docs) == 1:
        return docs[0]
    return docs


async def search_tool_docs(query, limit=5, detail="summary"):
    response = await _rpc_call(
        {"type": "search_tool_docs", "query": query, "limit": limit, "detail": detail}
    )
    return response.get("results", [])


def discovered_servers(detailed=False):
    if detailed:
        return tuple({"name": k, "description": v} for k, v in DISCOVERED_SERVERS.items())
    return tuple(DISCOVERED_SERVERS.keys())


_LOADED_SERVER_NAMES = ()


def list_servers_sync():
    return tuple(name for name in _LOADED_SERVER_NAMES if name)


class _MCPProxy:
    """Proxy for one allowed server: attribute access yields a tool call."""

    def __init__(self, server_info):
        self._server_name = server_info.get("name")
        self._tools = {tool.get("alias"): tool for tool in server_info.get("tools", [])}

    async def list_tools(self):
        return await list_tools(self._server_name)

    def __getattr__(self, tool_alias):
        if tool_alias.startswith("_"):
            raise AttributeError(tool_alias)
        tool = self._tools.get(tool_alias)
        target = tool.get("name") if tool else tool_alias

        async def _invoke(**kwargs):
            return await call_tool(self._server_name, target, kwargs)

        _invoke.__name__ = tool_alias
        if tool and tool.get("description"):
            _invoke.__doc__ = tool.get("description")
        return _invoke


_NAMESPACE = {
    "__name__": "__sandbox__",
    "MCPError": MCPError,
    "call_tool": call_tool,
    "list_tools": list_tools,
    "list_servers": list_servers,
    "list_servers_sync": list_servers_sync,
    "query_tool_docs": query_tool_docs,
    "search_tool_docs": search_tool_docs,
    "discovered_servers": discovered_servers,
}


def _install_proxies(metadata):
    global _LOADED_SERVER_NAMES
    for key in [k for k in _NAMESPACE if k.startswith("mcp_")]:
        del _NAMESPACE[key]
    proxies = {}
    for server in metadata or []:
        proxy = _MCPProxy(server)
        proxies[server.get("name")] = proxy
        _NAMESPACE["mcp_" + str(server.get("alias"))] = proxy
    _LOADED_SERVER_NAMES = tuple(proxies.keys())
    _NAMESPACE["mcp_servers"] = proxies
    _NAMESPACE["LOADED_MCP_SERVERS"] = _LOADED_SERVER_NAMES


def _cancel_current():
    task = _CURRENT_EXECUTION
    if task is not None and not task.done():
        task.cancel()


async def _stdin_reader():
    loop = asyncio.get_running_loop()
    reader = asyncio.StreamReader()
    protocol = asyncio.StreamReaderProtocol(reader)
    await loop.connect_read_pipe(lambda: protocol, sys.stdin)

    while True:
        line = await reader.readline()
        if not line:
            os._exit(0)
        try:
            message = json.loads(line.decode())
        except Exception:
            continue
        if not isinstance(message, dict):
            continue

        msg_type = message.get("type")
        if msg_type == "rpc_response":
            future = _PENDING_RESPONSES.pop(message.get("id"), None)
            if future is not None and not future.done():
                future.set_result(message.get("payload"))
        elif msg_type == "execute":
            await _EXECUTION_QUEUE.put(message)
        elif msg_type == "cancel":
            _cancel_current()


async def _execute_code(code):
    try:
        flags = getattr(ast, "PyCF_ALLOW_TOP_LEVEL_AWAIT", 0)
        compiled = compile(code, "<sandbox>", "exec", flags=flags)
        result = eval(compiled, _NAMESPACE, _NAMESPACE)
        if inspect.isawaitable(result):
            await result
    except asyncio.CancelledError:
        print("Execution cancelled", file=sys.stderr)
    except SystemExit as exc:
        print("SystemExit: %s" % (exc.code,), file=sys.stderr)
    except BaseException:
        traceback.print_exc()


async def _main_loop():
    global _CURRENT_EXECUTION
    loop = asyncio.get_running_loop()
    try:
        loop.add_signal_handler(signal.SIGTERM, _cancel_current)
    except (NotImplementedError, RuntimeError):
        pass

    asyncio.ensure_future(_stdin_reader())
    while True:
        message = await _EXECUTION_QUEUE.get()
        _install_proxies(message.get("metadata"))
        _CURRENT_EXECUTION = asyncio.ensure_future(_execute_code(message.get("code", "")))
        await _CURRENT_EXECUTION
        _CURRENT_EXECUTION = None
        _send_message({"type": "execution_done"})


if __name__ == "__main__":
    try:
        asyncio.run(_main_loop())
    except KeyboardInterrupt:
        pass
"#;
