//! Wire protocol between the broker and the sandbox container.
//!
//! Every frame is a single JSON object on one line of the container's
//! stdio, UTF-8, newline-delimited. There is no length prefix; emitters
//! must never produce embedded newlines (serde_json escapes them inside
//! strings). Frames with an unknown `type` are dropped with a warning
//! rather than failing the session.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Frames sent from the broker to the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    /// Run `code` in the persistent evaluation context.
    Execute {
        /// Invocation id, echoed in a matching `cancel`.
        id: u64,
        /// The Python source to evaluate.
        code: String,
        /// Servers this invocation may reach.
        allowed_servers: Vec<String>,
        /// Cached metadata for the allowed servers (proxy install input).
        metadata: Value,
    },
    /// Answer to an earlier `rpc_request` with the same `id`.
    RpcResponse {
        /// Correlates with the request id.
        id: u64,
        /// `{"success": bool, ...}` response object.
        payload: Value,
    },
    /// Abort the currently running execution.
    Cancel {
        /// The invocation id being cancelled.
        id: u64,
    },
}

/// Frames sent from the sandbox to the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxFrame {
    /// A chunk of standard output from user code.
    Stdout {
        /// The text, in emission order.
        data: String,
    },
    /// A chunk of standard error from user code.
    Stderr {
        /// The text, in emission order.
        data: String,
    },
    /// Sandbox code wants the broker to perform an RPC.
    RpcRequest {
        /// Strictly increasing within a container lifetime.
        id: u64,
        /// An [`RpcRequest`]-shaped payload, kept opaque here so malformed
        /// requests surface as RPC errors instead of frame-loop failures.
        payload: Value,
    },
    /// The current execution finished (successfully or not).
    ExecutionDone,
}

/// Requested documentation depth for tool docs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Detail {
    /// Names and descriptions only.
    #[default]
    Summary,
    /// Include input schemas.
    Full,
}

impl<'de> Deserialize<'de> for Detail {
    // Unknown detail values degrade to summary instead of erroring.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.to_lowercase().as_str() {
            "full" => Detail::Full,
            _ => Detail::Summary,
        })
    }
}

fn default_search_limit() -> i64 {
    5
}

/// The RPC payloads sandbox code may issue, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcRequest {
    /// Names of the servers this invocation may reach.
    ListServers,
    /// Cached tool list for one allowed server.
    ListTools {
        /// The server to list.
        server: String,
    },
    /// Documentation for one tool (or all tools) on an allowed server.
    QueryToolDocs {
        /// The server to query.
        server: String,
        /// Restrict to one tool by name or alias.
        #[serde(default)]
        tool: Option<String>,
        /// Documentation depth.
        #[serde(default)]
        detail: Detail,
    },
    /// Ranked tool search across the allowed servers.
    SearchToolDocs {
        /// Whitespace-separated tokens; all must match.
        query: String,
        /// Maximum results, clamped to `[1, 20]`.
        #[serde(default = "default_search_limit")]
        limit: i64,
        /// Documentation depth.
        #[serde(default)]
        detail: Detail,
    },
    /// Forward a call to a tool server.
    CallTool {
        /// Target server.
        server: String,
        /// Tool name as reported by the server.
        tool: String,
        /// Opaque arguments object.
        #[serde(default)]
        arguments: Value,
    },
}

/// Write one frame as a single JSON line and flush.
///
/// Callers requiring line-atomic interleaving (multiple writers on one
/// stream) must hold their own lock around this call.
pub async fn write_frame<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &T,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one raw line. Returns `None` at EOF (clean shutdown).
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// Decode one line into a [`SandboxFrame`].
///
/// Returns `None` (after a warning) for lines that are not JSON objects,
/// lack a string `type`, or carry an unknown type. The frame loop skips
/// these rather than failing the session.
pub fn decode_sandbox_frame(line: &str) -> Option<SandboxFrame> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, "dropping unparseable sandbox frame");
            return None;
        }
    };
    let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);
    match serde_json::from_value::<SandboxFrame>(value) {
        Ok(frame) => Some(frame),
        Err(err) => {
            tracing::warn!(
                kind = kind.as_deref().unwrap_or("<missing>"),
                error = %err,
                "dropping sandbox frame of unknown shape"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn roundtrip_host(frame: &HostFrame) -> HostFrame {
        let mut buf = Vec::new();
        write_frame(&mut buf, frame).await.unwrap();
        assert_eq!(buf.iter().filter(|&&b| b == b'\n').count(), 1);
        assert_eq!(*buf.last().unwrap(), b'\n');
        let mut cursor = Cursor::new(buf);
        let line = read_line(&mut cursor).await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn execute_frame_roundtrip() {
        let frame = HostFrame::Execute {
            id: 3,
            code: "print(1+1)".into(),
            allowed_servers: vec!["weather".into()],
            metadata: serde_json::json!([{"name": "weather", "alias": "weather", "tools": []}]),
        };
        assert_eq!(roundtrip_host(&frame).await, frame);
    }

    #[tokio::test]
    async fn rpc_response_roundtrip() {
        let frame = HostFrame::RpcResponse {
            id: 9,
            payload: serde_json::json!({"success": true, "result": {"temp": 72}}),
        };
        assert_eq!(roundtrip_host(&frame).await, frame);
    }

    #[tokio::test]
    async fn cancel_frame_wire_shape() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &HostFrame::Cancel { id: 4 }).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "{\"type\":\"cancel\",\"id\":4}\n");
    }

    #[tokio::test]
    async fn embedded_newlines_stay_escaped() {
        let frame = HostFrame::Execute {
            id: 1,
            code: "print('a')\nprint('b')".into(),
            allowed_servers: vec![],
            metadata: Value::Null,
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        // One delimiter only: the terminator. The code's newline is escaped.
        assert_eq!(buf.iter().filter(|&&b| b == b'\n').count(), 1);
        assert_eq!(roundtrip_host(&frame).await, frame);
    }

    #[test]
    fn decode_stream_frames() {
        let frame = decode_sandbox_frame("{\"type\":\"stdout\",\"data\":\"2\\n\"}\n").unwrap();
        assert_eq!(
            frame,
            SandboxFrame::Stdout {
                data: "2\n".into()
            }
        );
        let frame = decode_sandbox_frame("{\"type\":\"execution_done\"}").unwrap();
        assert_eq!(frame, SandboxFrame::ExecutionDone);
    }

    #[test]
    fn decode_drops_unknown_type() {
        assert!(decode_sandbox_frame("{\"type\":\"telemetry\",\"data\":1}").is_none());
    }

    #[test]
    fn decode_drops_non_object_and_garbage() {
        assert!(decode_sandbox_frame("[1,2,3]").is_none());
        assert!(decode_sandbox_frame("not json at all").is_none());
        assert!(decode_sandbox_frame("").is_none());
        assert!(decode_sandbox_frame("\n").is_none());
    }

    #[tokio::test]
    async fn read_line_none_at_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_line(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn multiple_frames_in_stream() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &SandboxFrame::Stdout { data: "a".into() })
            .await
            .unwrap();
        write_frame(
            &mut buf,
            &SandboxFrame::RpcRequest {
                id: 1,
                payload: serde_json::json!({"type": "list_servers"}),
            },
        )
        .await
        .unwrap();
        write_frame(&mut buf, &SandboxFrame::ExecutionDone).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let mut frames = Vec::new();
        while let Some(line) = read_line(&mut cursor).await.unwrap() {
            frames.push(decode_sandbox_frame(&line).unwrap());
        }
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], SandboxFrame::Stdout { .. }));
        assert!(matches!(frames[1], SandboxFrame::RpcRequest { .. }));
        assert!(matches!(frames[2], SandboxFrame::ExecutionDone));
    }

    #[test]
    fn rpc_request_payload_variants() {
        let req: RpcRequest = serde_json::from_value(serde_json::json!({
            "type": "call_tool",
            "server": "weather",
            "tool": "get_forecast",
            "arguments": {"city": "NYC"}
        }))
        .unwrap();
        match req {
            RpcRequest::CallTool {
                server,
                tool,
                arguments,
            } => {
                assert_eq!(server, "weather");
                assert_eq!(tool, "get_forecast");
                assert_eq!(arguments["city"], "NYC");
            }
            other => panic!("expected CallTool, got: {other:?}"),
        }

        let req: RpcRequest =
            serde_json::from_value(serde_json::json!({"type": "list_servers"})).unwrap();
        assert_eq!(req, RpcRequest::ListServers);
    }

    #[test]
    fn rpc_request_defaults() {
        let req: RpcRequest = serde_json::from_value(serde_json::json!({
            "type": "search_tool_docs",
            "query": "forecast"
        }))
        .unwrap();
        match req {
            RpcRequest::SearchToolDocs { limit, detail, .. } => {
                assert_eq!(limit, 5);
                assert_eq!(detail, Detail::Summary);
            }
            other => panic!("expected SearchToolDocs, got: {other:?}"),
        }
    }

    #[test]
    fn unknown_detail_degrades_to_summary() {
        let req: RpcRequest = serde_json::from_value(serde_json::json!({
            "type": "query_tool_docs",
            "server": "weather",
            "detail": "everything"
        }))
        .unwrap();
        match req {
            RpcRequest::QueryToolDocs { detail, tool, .. } => {
                assert_eq!(detail, Detail::Summary);
                assert!(tool.is_none());
            }
            other => panic!("expected QueryToolDocs, got: {other:?}"),
        }
    }

    #[test]
    fn unknown_rpc_type_fails_payload_parse() {
        let result: Result<RpcRequest, _> =
            serde_json::from_value(serde_json::json!({"type": "drop_tables"}));
        assert!(result.is_err());
    }
}
