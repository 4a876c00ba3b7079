//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Writing JSON-RPC requests to stdin (one JSON object per line)
//! - A reader task that routes stdout responses to waiting callers by id
//! - Failing every pending caller once stdout closes
//!
//! Several requests may be in flight at once; each carries its own id and
//! the reader hands the matching response to exactly that caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{error_codes, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

type PendingMap = HashMap<u64, oneshot::Sender<JsonRpcResponse>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    /// `None` once stdin has been closed for shutdown.
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: Arc<Mutex<PendingMap>>,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a transport over any writer/reader pair and start its reader task.
    ///
    /// For a child process these are its stdin and stdout.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending = Arc::new(Mutex::new(PendingMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_loop(
            server_name.to_string(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Self {
            server_name: server_name.to_string(),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            pending,
            closed,
            reader_task,
        }
    }

    /// Whether stdout has closed (the process is gone or hung up).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a request with a fresh id and wait for its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let req = JsonRpcRequest::new(next_request_id(), method, params);
        self.send(req, timeout, method).await
    }

    /// Send a prepared request and wait up to `timeout` for the response with
    /// the same id. `label` names the operation in timeout errors.
    pub async fn send(
        &self,
        req: JsonRpcRequest,
        timeout: Duration,
        label: &str,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = req.id;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        // Dropped on every exit, including when the caller abandons this future.
        let _entry = PendingEntry {
            pending: &self.pending,
            id,
        };

        // The reader sets `closed` before draining, so checking after the
        // insert means our entry is either drained or rejected here.
        if self.is_closed() {
            return Err(self.stdout_closed());
        }

        let mut json = serde_json::to_string(&req)
            .map_err(|e| self.transport_error(&format!("failed to serialize request: {e}")))?;
        json.push('\n');
        self.write_line(&json).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(self.stdout_closed()),
            Err(_) => Err(McpError::Timeout {
                server: self.server_name.clone(),
                tool: label.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });

        let mut json = serde_json::to_string(&notification).map_err(|e| {
            self.transport_error(&format!("failed to serialize notification: {e}"))
        })?;
        json.push('\n');

        self.write_line(&json).await
    }

    /// Close stdin. Well-behaved stdio servers exit on EOF.
    pub async fn close_stdin(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = w.shutdown().await;
        }
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    async fn write_line(&self, line: &str) -> Result<(), McpError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("stdin already closed"))?;

        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(&format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(&format!("failed to flush stdin: {e}")))
    }

    fn stdout_closed(&self) -> McpError {
        self.transport_error("server stdout closed (process may have exited)")
    }

    fn transport_error(&self, reason: &str) -> McpError {
        McpError::Transport {
            server: self.server_name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Removes a request's pending slot once its caller stops waiting.
struct PendingEntry<'a> {
    pending: &'a Mutex<PendingMap>,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

fn lock(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Route response lines to pending callers until stdout closes.
async fn read_loop<R>(
    server: String,
    reader: R,
    pending: Arc<Mutex<PendingMap>>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match parse_response(trimmed) {
                    Some(resp) => {
                        let waiter = lock(&pending).remove(&resp.id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(resp);
                            }
                            None => tracing::debug!(
                                server = %server,
                                id = resp.id,
                                "response for unknown or expired request"
                            ),
                        }
                    }
                    // Server log output or server-initiated messages.
                    None => {
                tracing::trace!(server = %server, line = trimmed, "skipping non-response line")
            }
                }
            }
            Ok(None) => {
                tracing::debug!(server = %server, "server stdout closed");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "failed to read server stdout");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    let orphaned = lock(&pending).drain().count();
    if orphaned > 0 {
        tracing::warn!(
            server = %server,
            orphaned,
            "failing pending requests after stdout closed"
        );
    }
}

/// Parse a line as a response. Lines carrying a `method` are requests or
/// notifications from the server and are not responses.
fn parse_response(line: &str) -> Option<JsonRpcResponse> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    if value.get("method").is_some() {
        return None;
    }
    serde_json::from_value(value).ok()
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(
    server: &str,
    response: JsonRpcResponse,
) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ToolFailed {
            server: server.to_string(),
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or_else(|| McpError::ToolFailed {
        server: server.to_string(),
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
