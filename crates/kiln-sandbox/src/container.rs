//! Sandbox container lifecycle and frame dispatch.
//!
//! One [`ContainerSandbox`] owns at most one live container. The container
//! is launched lazily on first use, reused across executions, torn down
//! after the idle TTL, and hard-killed when a timed-out execution ignores
//! its cancel frame. The session lock doubles as the serialisation point:
//! at most one execution is inside the container at any instant.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use kiln_error::BridgeError;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::entrypoint;
use crate::frame::{self, HostFrame, SandboxFrame};
use crate::output::CappedBuffer;
use crate::runtime::detect_runtime;
use crate::RpcHandler;

/// Grace period for the sandbox to acknowledge a cancel frame.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Grace period between closing stdin and hard-killing on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Maximum bytes captured from container stderr for debug logging.
const MAX_STDERR_CAPTURE_BYTES: usize = 4096;

/// Launch-time knobs for the sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Pinned runtime executable; probed when `None`.
    pub runtime: Option<String>,
    /// Container image to run.
    pub image: String,
    /// Memory cap in runtime-native syntax.
    pub memory: String,
    /// Process count cap.
    pub pids: u32,
    /// CPU quota in runtime-native syntax.
    pub cpus: Option<String>,
    /// UID:GID the container runs as.
    pub container_user: String,
    /// Idle time before the container is stopped; zero disables.
    pub idle_timeout: Duration,
    /// Per-stream output cap for one execution.
    pub max_stream_bytes: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            image: "python:3.14-slim".into(),
            memory: "512m".into(),
            pids: 128,
            cpus: None,
            container_user: "65534:65534".into(),
            idle_timeout: Duration::from_secs(300),
            max_stream_bytes: 1024 * 1024,
        }
    }
}

/// Everything one execution needs beyond the code itself.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    /// The Python source to evaluate.
    pub code: String,
    /// Wall-clock budget for this execution.
    pub timeout: Duration,
    /// Servers this invocation may reach.
    pub allowed_servers: Vec<String>,
    /// Metadata snapshot for the allowed servers (JSON array).
    pub metadata: serde_json::Value,
    /// Host directory bind-mounted at `/ipc`.
    pub ipc_dir: PathBuf,
    /// Additional `host:container:mode` volume specs.
    pub extra_mounts: Vec<String>,
    /// Additional container environment (launch-time only).
    pub env: Vec<(String, String)>,
}

/// Captured output of one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Standard output, in emission order, capped.
    pub stdout: String,
    /// Standard error, in emission order, capped.
    pub stderr: String,
}

struct Session {
    child: Child,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    stdout: BufReader<ChildStdout>,
    executions: u64,
    fresh: bool,
}

impl Session {
    /// Graceful stop: closing stdin makes the entrypoint exit on EOF.
    async fn stop(mut self) {
        self.stdin.lock().await.take();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait())
            .await
            .is_err()
        {
            let _ = self.child.kill().await;
        }
    }

    async fn kill(mut self) {
        let _ = self.child.kill().await;
    }
}

struct Shared {
    config: ContainerConfig,
    session: Mutex<Option<Session>>,
}

/// Manages the single sandbox container and its stdio framing.
pub struct ContainerSandbox {
    shared: Arc<Shared>,
    idle_timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ContainerSandbox {
    /// Create a manager; nothing is launched until the first execute.
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                session: Mutex::new(None),
            }),
            idle_timer: std::sync::Mutex::new(None),
        }
    }

    /// Execute `code` inside the container, routing its RPC traffic to
    /// `handler` and collecting capped stdout/stderr.
    ///
    /// Serialised: a concurrent caller queues on the session lock until the
    /// active execution reports `execution_done` or is cancelled.
    #[tracing::instrument(skip_all, fields(code_len = req.code.len(), timeout_s = req.timeout.as_secs()))]
    pub async fn execute(
        &self,
        handler: Arc<dyn RpcHandler>,
        req: ExecuteRequest,
    ) -> Result<ExecOutput, BridgeError> {
        self.cancel_idle_timer();
        let mut guard = self.shared.session.lock().await;

        let relaunch = match guard.as_mut() {
            Some(session) => session.child.try_wait().ok().flatten().is_some(),
            None => true,
        };
        if relaunch {
            if let Some(old) = guard.take() {
                tracing::debug!("previous sandbox container exited, relaunching");
                old.kill().await;
            }
            *guard = Some(self.launch(&req).await?);
        }
        let Some(session) = guard.as_mut() else {
            return Err(BridgeError::Internal(anyhow::anyhow!(
                "sandbox session missing after launch"
            )));
        };

        session.executions += 1;
        let invocation_id = session.executions;
        let fresh = std::mem::take(&mut session.fresh);
        let writer = session.stdin.clone();

        let execute = HostFrame::Execute {
            id: invocation_id,
            code: req.code.clone(),
            allowed_servers: req.allowed_servers.clone(),
            metadata: req.metadata.clone(),
        };
        // A session whose first frame never arrived must not be reused.
        if let Err(err) = write_host_frame(&writer, &execute).await {
            if let Some(session) = guard.take() {
                session.kill().await;
            }
            return Err(if fresh {
                BridgeError::ContainerLaunchFailed {
                    details: format!("container rejected its first frame: {err}"),
                }
            } else {
                err
            });
        }

        let mut stdout = CappedBuffer::new(self.shared.config.max_stream_bytes);
        let mut stderr = CappedBuffer::new(self.shared.config.max_stream_bytes);

        let pumped = tokio::time::timeout(
            req.timeout,
            frame_pump(
                &writer,
                &mut session.stdout,
                handler.clone(),
                &mut stdout,
                &mut stderr,
            ),
        )
        .await;

        match pumped {
            Ok(Ok(())) => {
                drop(guard);
                self.schedule_idle_shutdown();
                Ok(ExecOutput {
                    stdout: stdout.into_string(),
                    stderr: stderr.into_string(),
                })
            }
            Ok(Err(err)) => {
                if let Some(session) = guard.take() {
                    session.kill().await;
                }
                if fresh {
                    Err(BridgeError::ContainerLaunchFailed {
                        details: format!(
                            "container exited before completing its first execution: {err}"
                        ),
                    })
                } else {
                    Err(err)
                }
            }
            Err(_elapsed) => {
                let seconds = req.timeout.as_secs();
                tracing::warn!(invocation = invocation_id, seconds, "execution deadline exceeded, sending cancel");

                let cancel_sent = write_host_frame(&writer, &HostFrame::Cancel { id: invocation_id })
                    .await
                    .is_ok();
                let acknowledged = cancel_sent
                    && matches!(
                        tokio::time::timeout(
                            CANCEL_GRACE,
                            frame_pump(
                                &writer,
                                &mut session.stdout,
                                handler,
                                &mut stdout,
                                &mut stderr,
                            ),
                        )
                        .await,
                        Ok(Ok(()))
                    );

                if acknowledged {
                    drop(guard);
                    self.schedule_idle_shutdown();
                } else {
                    tracing::warn!("cancel not acknowledged, killing sandbox container");
                    if let Some(session) = guard.take() {
                        session.kill().await;
                    }
                }
                Err(BridgeError::Timeout {
                    seconds,
                    stdout: stdout.into_string(),
                    stderr: stderr.into_string(),
                })
            }
        }
    }

    /// Stop the container if it is running. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel_idle_timer();
        let session = self.shared.session.lock().await.take();
        if let Some(session) = session {
            tracing::info!("stopping sandbox container");
            session.stop().await;
        }
    }

    async fn launch(&self, req: &ExecuteRequest) -> Result<Session, BridgeError> {
        let config = &self.shared.config;
        let runtime = detect_runtime(config.runtime.as_deref())?;

        tokio::fs::write(
            req.ipc_dir.join(entrypoint::ENTRYPOINT_FILE_NAME),
            entrypoint::render(),
        )
        .await
        .map_err(|e| BridgeError::ContainerLaunchFailed {
            details: format!("failed to render entrypoint: {e}"),
        })?;

        let mut cmd = Command::new(&runtime);
        cmd.args(["run", "--rm", "--interactive"])
            .args(["--network", "none"])
            .arg("--read-only")
            .arg("--pids-limit")
            .arg(config.pids.to_string())
            .arg("--memory")
            .arg(&config.memory)
            .args(["--tmpfs", "/tmp:rw,noexec,nosuid,nodev,size=64m"])
            .args(["--tmpfs", "/workspace:rw,noexec,nosuid,nodev,size=128m"])
            .args(["--workdir", "/workspace"])
            .args(["--env", "HOME=/workspace"])
            .args(["--env", "PYTHONUNBUFFERED=1"])
            .args(["--env", "PYTHONIOENCODING=utf-8"])
            .args(["--env", "PYTHONDONTWRITEBYTECODE=1"])
            .args(["--security-opt", "no-new-privileges"])
            .args(["--cap-drop", "ALL"])
            .arg("--user")
            .arg(&config.container_user);
        if let Some(cpus) = &config.cpus {
            cmd.arg("--cpus").arg(cpus);
        }
        cmd.arg("--volume")
            .arg(format!("{}:/ipc:rw", req.ipc_dir.display()));
        for mount in &req.extra_mounts {
            cmd.arg("--volume").arg(mount);
        }
        for (key, value) in &req.env {
            cmd.arg("--env").arg(format!("{key}={value}"));
        }
        cmd.arg(&config.image)
            .args(["python3", "-u", entrypoint::ENTRYPOINT_CONTAINER_PATH]);

        tracing::info!(runtime = %runtime, image = %config.image, "launching sandbox container");

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::ContainerLaunchFailed {
                details: format!("failed to spawn '{runtime}': {e}"),
            })?;

        if let Some(child_stderr) = child.stderr.take() {
            tokio::spawn(capture_bounded_stderr(child_stderr));
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::ContainerLaunchFailed {
                details: "no stdin on sandbox container".into(),
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::ContainerLaunchFailed {
                details: "no stdout on sandbox container".into(),
            })?;

        Ok(Session {
            child,
            stdin: Arc::new(Mutex::new(Some(stdin))),
            stdout: BufReader::new(stdout),
            executions: 0,
            fresh: true,
        })
    }

    fn schedule_idle_shutdown(&self) {
        let ttl = self.shared.config.idle_timeout;
        if ttl.is_zero() {
            return;
        }
        self.cancel_idle_timer();
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let session = shared.session.lock().await.take();
            if let Some(session) = session {
                tracing::info!(ttl_s = ttl.as_secs(), "idle timeout reached, stopping sandbox container");
                session.stop().await;
            }
        });
        if let Ok(mut slot) = self.idle_timer.lock() {
            *slot = Some(handle);
        }
    }

    fn cancel_idle_timer(&self) {
        if let Ok(mut slot) = self.idle_timer.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for ContainerSandbox {
    fn drop(&mut self) {
        self.cancel_idle_timer();
    }
}

/// Write one frame under the stdin lock, so lines never interleave.
async fn write_host_frame<W: AsyncWrite + Unpin>(
    writer: &Mutex<Option<W>>,
    frame: &HostFrame,
) -> Result<(), BridgeError> {
    let mut guard = writer.lock().await;
    let Some(w) = guard.as_mut() else {
        return Err(BridgeError::Internal(anyhow::anyhow!(
            "sandbox stdin is closed"
        )));
    };
    frame::write_frame(w, frame)
        .await
        .map_err(|e| BridgeError::Internal(anyhow::anyhow!("failed to write frame: {e}")))
}

/// Read frames until `execution_done`, dispatching by type.
///
/// Stream frames land in the capped buffers in emission order. Each
/// `rpc_request` is answered from a spawned task so a slow tool call never
/// blocks frame consumption; the response write takes the stdin lock to
/// stay line-atomic. Generic over the IO types so tests can drive it with
/// in-memory streams.
pub(crate) async fn frame_pump<W, R>(
    writer: &Arc<Mutex<Option<W>>>,
    reader: &mut R,
    handler: Arc<dyn RpcHandler>,
    stdout: &mut CappedBuffer,
    stderr: &mut CappedBuffer,
) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = frame::read_line(reader)
            .await
            .map_err(|e| BridgeError::Internal(anyhow::anyhow!("sandbox stream read failed: {e}")))?;
        let Some(line) = line else {
            return Err(BridgeError::Internal(anyhow::anyhow!(
                "sandbox closed its stream before reporting completion"
            )));
        };
        let Some(frame) = frame::decode_sandbox_frame(&line) else {
            continue;
        };
        match frame {
            SandboxFrame::Stdout { data } => stdout.push(&data),
            SandboxFrame::Stderr { data } => stderr.push(&data),
            SandboxFrame::ExecutionDone => return Ok(()),
            SandboxFrame::RpcRequest { id, payload } => {
                let writer = writer.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let payload = handler.handle_rpc(payload).await;
                    let response = HostFrame::RpcResponse { id, payload };
                    let mut guard = writer.lock().await;
                    if let Some(w) = guard.as_mut() {
                        if let Err(err) = frame::write_frame(w, &response).await {
                            tracing::warn!(id, error = %err, "failed to deliver rpc response");
                        }
                    } else {
                        tracing::warn!(id, "sandbox stdin closed before rpc response delivery");
                    }
                });
            }
        }
    }
}

/// Read at most [`MAX_STDERR_CAPTURE_BYTES`] from container stderr and log
/// via tracing, then drain the rest without storing it. Bounds memory
/// against chatty runtimes while keeping pull/launch diagnostics visible.
async fn capture_bounded_stderr<R: tokio::io::AsyncRead + Unpin>(mut stderr: R) {
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; MAX_STDERR_CAPTURE_BYTES];
    let mut total = 0;
    loop {
        match stderr.read(&mut buf[total..]).await {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                if total >= MAX_STDERR_CAPTURE_BYTES {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    if total > 0 {
        let text = String::from_utf8_lossy(&buf[..total]);
        tracing::debug!(target: "kiln::sandbox::container", "{}", text);
    }
    let mut discard = [0u8; 1024];
    loop {
        match stderr.read(&mut discard).await {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
}
