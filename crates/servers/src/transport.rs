//! Stdio transports for tool servers.
//!
//! Two variants speak newline-delimited JSON-RPC:
//! - **Local stdio**: spawn a child process and use its stdin/stdout.
//! - **Sandbox stdio**: use streams attached to a sandboxed process; the
//!   read side carries the runtime's 8-byte frame multiplexing and is
//!   demultiplexed before any JSON parsing.
//!
//! HTTP and SSE transports live in [`crate::remote`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use tb_domain::Error;

use crate::frame::FramedLineReader;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Maximum number of non-JSON lines to skip before declaring the server
/// broken (guards against servers that log to stdout).
const MAX_SKIP_LINES: usize = 1000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait + error
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Duplex JSON-RPC channel to one tool server.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Send a request and wait for the correlated response.
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError>;

    /// Send a notification (no response expected).
    async fn send_notification(&self, method: &str) -> Result<(), TransportError>;

    /// Whether the channel is still usable.
    fn is_alive(&self) -> bool;

    /// Shut the channel down gracefully.
    async fn shutdown(&self);
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tool server process has exited")]
    ProcessExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("HTTP status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("framing error: {0}")]
    Framing(String),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(e) => Error::Io(e),
            TransportError::Json(e) => Error::Integrity(format!("malformed JSON-RPC: {e}")),
            TransportError::ProcessExited => {
                Error::TransientExternal("tool server process has exited".into())
            }
            TransportError::Timeout => Error::TransientExternal("tool server timed out".into()),
            TransportError::Http { status, message } => {
                // 408/429 and all 5xx are retryable; remaining 4xx are not.
                if status == 408 || status == 429 || status >= 500 {
                    Error::TransientExternal(format!("HTTP {status}: {message}"))
                } else {
                    Error::PermanentExternal(format!("HTTP {status}: {message}"))
                }
            }
            TransportError::Connect(message) => Error::TransientExternal(message),
            TransportError::Framing(message) => Error::Integrity(message),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Local stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Spawned-child transport. One JSON-RPC message per line.
///
/// `request_lock` serializes entire request/response cycles so concurrent
/// callers cannot read each other's responses.
pub struct LocalStdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
    timeout: Duration,
}

impl LocalStdioTransport {
    /// Spawn the configured command and wire up its stdio.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            timeout,
        })
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read the next JSON-looking line, skipping log noise.
    async fn read_line(&self) -> Result<String, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut stdout = self.stdout.lock().await;
        let mut skipped = 0usize;
        loop {
            let mut line = String::new();
            let bytes_read = stdout.read_line(&mut line).await?;
            if bytes_read == 0 {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::ProcessExited);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_owned());
            }
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::Framing(
                    "tool server produced too many non-JSON lines on stdout".into(),
                ));
            }
            tracing::debug!(line = %trimmed, "skipping non-JSON line from tool server stdout");
        }
    }
}

#[async_trait]
impl ToolTransport for LocalStdioTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let _guard = self.request_lock.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;

        tracing::debug!(id, method, "sending tool server request");
        self.write_line(&json).await?;

        let result = tokio::time::timeout(self.timeout, async {
            loop {
                let line = self.read_line().await?;
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&line) {
                    if resp.id == id {
                        return Ok(resp);
                    }
                    tracing::debug!(expected_id = id, got_id = resp.id, "skipping stale response");
                    continue;
                }
                // Server-initiated notifications have no id; skip them.
                tracing::debug!(line = %line, "skipping non-matching tool server message");
            }
        })
        .await;

        result.map_err(|_| TransportError::Timeout)?
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        self.write_line(&serde_json::to_string(&notif)?).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(error = %e, "error closing tool server stdin");
            }
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(?status, "tool server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "error waiting for tool server process");
            }
            Err(_) => {
                tracing::warn!("tool server did not exit within timeout, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill tool server process");
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type BoxWriter = Box<dyn tokio::io::AsyncWrite + Send + Unpin>;
type BoxReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Transport over streams attached to a sandboxed process.
///
/// Writes go to the sandbox's stdin unframed; reads pass through the
/// frame demuxer so stderr noise never reaches the JSON parser.
pub struct SandboxStdioTransport {
    writer: Mutex<BoxWriter>,
    reader: Mutex<FramedLineReader<BoxReader>>,
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
    timeout: Duration,
}

impl SandboxStdioTransport {
    pub fn new(streams: tb_sandbox::AttachedStreams, timeout: Duration) -> Self {
        Self {
            writer: Mutex::new(streams.writer),
            reader: Mutex::new(FramedLineReader::new(streams.reader)),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            timeout,
        }
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_json_line(&self) -> Result<String, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut reader = self.reader.lock().await;
        let mut skipped = 0usize;
        loop {
            let line = reader
                .read_line()
                .await
                .map_err(|e| TransportError::Framing(e.to_string()))?;
            let line = match line {
                Some(line) => line,
                None => {
                    self.alive.store(false, Ordering::SeqCst);
                    return Err(TransportError::ProcessExited);
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_owned());
            }
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::Framing(
                    "sandboxed tool server produced too many non-JSON lines".into(),
                ));
            }
            tracing::debug!(line = %trimmed, "skipping non-JSON line from sandboxed tool server");
        }
    }
}

#[async_trait]
impl ToolTransport for SandboxStdioTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let _guard = self.request_lock.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;

        tracing::debug!(id, method, "sending request to sandboxed tool server");
        self.write_line(&json).await?;

        let result = tokio::time::timeout(self.timeout, async {
            loop {
                let line = self.read_json_line().await?;
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&line) {
                    if resp.id == id {
                        return Ok(resp);
                    }
                    tracing::debug!(expected_id = id, got_id = resp.id, "skipping stale response");
                    continue;
                }
                tracing::debug!(line = %line, "skipping non-matching tool server message");
            }
        })
        .await;

        result.map_err(|_| TransportError::Timeout)?
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        self.write_line(&serde_json::to_string(&notif)?).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "error closing sandbox stdin stream");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_frame, StreamKind};
    use tb_sandbox::AttachedStreams;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn http_status_classification() {
        let transient: Error = TransportError::Http {
            status: 503,
            message: "unavailable".into(),
        }
        .into();
        assert!(transient.is_retryable());

        let throttled: Error = TransportError::Http {
            status: 429,
            message: "slow down".into(),
        }
        .into();
        assert!(throttled.is_retryable());

        let permanent: Error = TransportError::Http {
            status: 404,
            message: "nope".into(),
        }
        .into();
        assert!(!permanent.is_retryable());
        assert_eq!(permanent.code(), "upstream");
    }

    #[test]
    fn framing_errors_are_integrity() {
        let err: Error = TransportError::Framing("bad header".into()).into();
        assert_eq!(err.code(), "integrity");
    }

    #[test]
    fn spawn_missing_binary_fails() {
        let result = LocalStdioTransport::spawn(
            "definitely-not-a-real-binary-5150",
            &[],
            &HashMap::new(),
            None,
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    /// Wire a sandbox-stdio transport to an in-memory tool server double
    /// that frames its stdout like a sandbox runtime would.
    fn scripted_sandbox_server() -> SandboxStdioTransport {
        let (near_write, far_read) = tokio::io::duplex(64 * 1024);
        let (far_write, near_read) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let mut input = BufReader::new(far_read);
            let mut output = far_write;
            loop {
                let mut line = String::new();
                if input.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                let req: JsonRpcRequest = match serde_json::from_str(line.trim()) {
                    Ok(req) => req,
                    Err(_) => continue, // notification
                };
                // Emit some stderr noise before every reply.
                let noise = encode_frame(StreamKind::Stderr, b"handling request\n");
                output.write_all(&noise).await.unwrap();

                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": req.id,
                    "result": { "echo": req.method }
                });
                let payload = format!("{reply}\n");
                let frame = encode_frame(StreamKind::Stdout, payload.as_bytes());
                output.write_all(&frame).await.unwrap();
            }
        });

        SandboxStdioTransport::new(
            AttachedStreams {
                writer: Box::new(near_write),
                reader: Box::new(near_read),
            },
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn sandbox_transport_roundtrip() {
        let transport = scripted_sandbox_server();
        let resp = transport.send_request("tools/list", None).await.unwrap();
        assert_eq!(resp.into_result().unwrap()["echo"], "tools/list");
        assert!(transport.is_alive());
    }

    #[tokio::test]
    async fn sandbox_transport_sequential_requests_correlate() {
        let transport = scripted_sandbox_server();
        for method in ["initialize", "tools/list", "tools/call"] {
            let resp = transport.send_request(method, None).await.unwrap();
            assert_eq!(resp.into_result().unwrap()["echo"], method);
        }
    }

    #[tokio::test]
    async fn sandbox_transport_notification_is_fire_and_forget() {
        let transport = scripted_sandbox_server();
        transport
            .send_notification("notifications/initialized")
            .await
            .unwrap();
        // A follow-up request still works.
        let resp = transport.send_request("tools/list", None).await.unwrap();
        assert!(!resp.is_error());
    }

    #[tokio::test]
    async fn sandbox_transport_reports_eof_as_process_exit() {
        let (near_write, _far_read) = tokio::io::duplex(64);
        let (far_write, near_read) = tokio::io::duplex(64);
        drop(far_write); // immediate EOF on the read side

        let transport = SandboxStdioTransport::new(
            AttachedStreams {
                writer: Box::new(near_write),
                reader: Box::new(near_read),
            },
            Duration::from_secs(1),
        );
        let err = transport.send_request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, TransportError::ProcessExited));
        assert!(!transport.is_alive());
    }
}
