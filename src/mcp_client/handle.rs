//! Server process handles.
//!
//! A `ServerHandle` owns exactly one tool-provider process and its transport.
//! Handles are produced by a `ServerLauncher`, which spawns the process,
//! waits for readiness, and hands back a running handle or a `StartupError`.
//! Nothing outside the handle signals the process directly.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{
    InitializeResult, McpToolDefinition, Readiness, ServerConfig, ToolCall, TransportKind,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// MCP protocol revision sent in the `initialize` handshake.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Stderr lines kept for startup diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the stderr relay to drain after a failed start.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ─── Traits ──────────────────────────────────────────────────────────────────

/// A running tool-provider process.
#[async_trait]
pub trait ServerHandle: Send + Sync {
    /// Logical server name.
    fn name(&self) -> &str;

    /// OS process id, if the transport has one.
    fn pid(&self) -> Option<u32>;

    /// Tools advertised during the readiness handshake.
    fn tools(&self) -> &[McpToolDefinition];

    /// Send one tool call and wait for its response until `call.deadline`.
    async fn call_tool(&self, call: &ToolCall) -> Result<serde_json::Value, McpError>;

    /// Lightweight liveness round trip. Any response counts as success.
    async fn ping(&self, timeout: Duration) -> Result<(), McpError>;

    /// Non-blocking check that the process has not exited.
    async fn is_alive(&self) -> bool;

    /// Stop the process: graceful signal, grace period, then force kill.
    /// Safe to call on an already-dead process and more than once.
    async fn terminate(&self) -> Result<(), McpError>;
}

/// Starts handles for a configuration. Injected into the manager so tests
/// can substitute a scripted launcher.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    /// Spawn the server and return once it is ready, or fail with
    /// `StartupError` after `config.startup_timeout()`.
    async fn start(&self, config: Arc<ServerConfig>) -> Result<Arc<dyn ServerHandle>, McpError>;
}

/// Whether two handles are the same running instance.
pub(crate) fn same_handle(a: &Arc<dyn ServerHandle>, b: &Arc<dyn ServerHandle>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

// ─── StdioLauncher ───────────────────────────────────────────────────────────

/// Launcher for processes speaking JSON-RPC over stdio.
#[derive(Debug, Clone, Default)]
pub struct StdioLauncher {
    /// Working directory used when a server has no `cwd` of its own.
    working_dir: Option<PathBuf>,
}

impl StdioLauncher {
    pub fn new(working_dir: Option<PathBuf>) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl ServerLauncher for StdioLauncher {
    async fn start(&self, config: Arc<ServerConfig>) -> Result<Arc<dyn ServerHandle>, McpError> {
        match config.transport {
            TransportKind::Stdio => {
                let handle = StdioServerHandle::spawn(config, self.working_dir.as_deref()).await?;
                Ok(Arc::new(handle))
            }
        }
    }
}

// ─── StdioServerHandle ───────────────────────────────────────────────────────

/// A child process with its JSON-RPC transport and advertised tools.
pub struct StdioServerHandle {
    config: Arc<ServerConfig>,
    pid: Option<u32>,
    process: tokio::sync::Mutex<Child>,
    transport: StdioTransport,
    tools: Vec<McpToolDefinition>,
    stderr_task: Option<JoinHandle<()>>,
    terminated: AtomicBool,
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

impl StdioServerHandle {
    /// Spawn the process and wait for readiness per `config.readiness`.
    pub async fn spawn(
        config: Arc<ServerConfig>,
        working_dir: Option<&std::path::Path>,
    ) -> Result<Self, McpError> {
        let name = config.name.as_str();
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.envs(&config.env);

        // Per-server cwd overrides the launcher's working_dir
        let effective_dir = config
            .cwd
            .as_deref()
            .map(PathBuf::from)
            .or_else(|| working_dir.map(PathBuf::from));
        if let Some(dir) = effective_dir {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // A handle dropped without terminate() (cancelled start) must not leak
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            startup_error(name, format!("failed to spawn '{}': {e}", config.command))
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| startup_error(name, "failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| startup_error(name, "failed to capture stdout".into()))?;

        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(relay_stderr(name.to_string(), stderr, Arc::clone(&stderr_tail)))
        });

        let transport = StdioTransport::new(name, stdin, stdout);

        tracing::debug!(server = name, pid, command = %config.command, "spawned server process");

        let startup_timeout = config.startup_timeout();
        let ready = tokio::time::timeout(
            startup_timeout,
            wait_until_ready(&config, &transport, &mut child),
        )
        .await;

        let failure = match ready {
            Ok(Ok(tools)) => {
                tracing::info!(server = name, pid, tools = tools.len(), "server ready");
                return Ok(Self {
                    config: Arc::clone(&config),
                    pid,
                    process: tokio::sync::Mutex::new(child),
                    transport,
                    tools,
                    stderr_task,
                    terminated: AtomicBool::new(false),
                });
            }
            Ok(Err(McpError::StartupError { reason, .. })) => reason,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("not ready after {}s", startup_timeout.as_secs()),
        };

        // Failed start: reap the process, then collect whatever it said.
        let _ = child.kill().await;
        drop(transport);
        let stderr_ctx = drain_stderr_tail(stderr_task, &stderr_tail).await;
        if !stderr_ctx.is_empty() {
            tracing::warn!(
            server = name,
            stderr = %stderr_ctx,
            "server stderr captured on failure"
        );
        }

        Err(startup_error(name, format!("{failure}{}", format_stderr_suffix(&stderr_ctx))))
    }

    /// Whether `terminate()` has been called.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerHandle for StdioServerHandle {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn tools(&self) -> &[McpToolDefinition] {
        &self.tools
    }

    async fn call_tool(&self, call: &ToolCall) -> Result<serde_json::Value, McpError> {
        let remaining = call.remaining();
        if remaining.is_zero() {
            return Err(McpError::Timeout {
                server: self.config.name.clone(),
                tool: call.tool.clone(),
                timeout_ms: 0,
            });
        }

        let response = self.transport.send(call.to_request(), remaining, &call.tool).await?;
        extract_result(&self.config.name, response)
    }

    async fn ping(&self, timeout: Duration) -> Result<(), McpError> {
        self.transport.request("ping", None, timeout).await.map(|_| ())
    }

    async fn is_alive(&self) -> bool {
        let mut child = self.process.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn terminate(&self) -> Result<(), McpError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let name = self.config.name.as_str();
        let grace = self.config.shutdown_grace();
        let mut child = self.process.lock().await;

        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!(server = name, %status, "server already exited");
            return Ok(());
        }

        // Send shutdown notification and close stdin (best-effort)
        let _ = tokio::time::timeout(grace, self.transport.notify("shutdown", None)).await;
        self.transport.close_stdin().await;

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = name, pid = self.pid, %status, "server stopped");
                Ok(())
            }
            _ => {
                tracing::warn!(
                    server = name,
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "server ignored shutdown, killing"
                );
                match child.kill().await {
                    Ok(()) => Ok(()),
                    Err(_) if matches!(child.try_wait(), Ok(Some(_))) => Ok(()),
                    Err(e) => Err(McpError::Transport {
                        server: name.to_string(),
                        reason: format!("failed to kill process: {e}"),
                    }),
                }
            }
        }
    }
}

impl Drop for StdioServerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

// ─── Readiness ───────────────────────────────────────────────────────────────

/// Block until the process is ready; returns the tools it advertised.
async fn wait_until_ready(
    config: &ServerConfig,
    transport: &StdioTransport,
    child: &mut Child,
) -> Result<Vec<McpToolDefinition>, McpError> {
    match &config.readiness {
        Readiness::Handshake => handshake(config, transport).await,
        Readiness::Delay { ms } => {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            match child.try_wait() {
                Ok(None) => Ok(Vec::new()),
                Ok(Some(status)) => Err(startup_error(
                    &config.name,
                    format!("process exited during startup ({status})"),
                )),
                Err(e) => Err(startup_error(&config.name, format!("failed to poll process: {e}"))),
            }
        }
    }
}

/// Perform the MCP initialization handshake.
async fn handshake(
    config: &ServerConfig,
    transport: &StdioTransport,
) -> Result<Vec<McpToolDefinition>, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let response = transport
        .request("initialize", Some(params), config.startup_timeout())
        .await?;

    if let Some(err) = response.error {
        return Err(startup_error(
            &config.name,
            format!("initialize rejected [{}]: {}", err.code, err.message),
        ));
    }

    let init: InitializeResult = match response.result {
        Some(value) if !value.is_null() => serde_json::from_value(value).map_err(|e| {
            startup_error(&config.name, format!("failed to parse initialize response: {e}"))
        })?,
        _ => InitializeResult::default(),
    };

    if let Some(info) = &init.server_info {
        tracing::debug!(
            server = %config.name,
            reported_name = ?info.name,
            reported_version = ?info.version,
            "initialize handshake complete"
        );
    }

    let _ = transport.notify("notifications/initialized", None).await;
    Ok(init.tools)
}

// ─── Stderr ──────────────────────────────────────────────────────────────────

/// Relay child stderr into the log, keeping the last few lines for diagnostics.
async fn relay_stderr(server: String, stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, line = %line, "server stderr");
        let mut buf = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if buf.len() == STDERR_TAIL_LINES {
            buf.pop_front();
        }
        buf.push_back(line);
    }
}

/// Wait briefly for the stderr relay to finish, then join the captured tail.
async fn drain_stderr_tail(task: Option<JoinHandle<()>>, tail: &StderrTail) -> String {
    if let Some(task) = task {
        let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
    }
    let buf = tail.lock().unwrap_or_else(PoisonError::into_inner);
    buf.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

fn startup_error(name: &str, reason: String) -> McpError {
    McpError::StartupError {
        name: name.to_string(),
        reason,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Minimal stdio server: answers every request that has an id.
    const RESPONDER: &str = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo"}]}}\n' "$id"
  fi
done"#;

    /// Answers the handshake, then exits.
    const ONE_SHOT: &str = r#"IFS= read -r line
id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id""#;

    fn sh_config(name: &str, script: &str) -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            args: vec!["-c".into(), script.into()],
            startup_timeout_secs: 5,
            shutdown_grace_ms: 1_000,
            ..ServerConfig::new(name, "sh")
        })
    }

    #[tokio::test]
    async fn test_handshake_call_and_terminate() {
        let handle = StdioServerHandle::spawn(sh_config("echo", RESPONDER), None)
            .await
            .unwrap();
        assert!(handle.pid().is_some());
        assert_eq!(handle.tools().len(), 1);
        assert!(handle.is_alive().await);

        let call = ToolCall::new(
            "echo",
            "echo",
            serde_json::json!({"text": "hi"}),
            Duration::from_secs(5),
        );
        let result = handle.call_tool(&call).await.unwrap();
        assert_eq!(result["tools"][0]["name"], "echo");

        handle.ping(Duration::from_secs(5)).await.unwrap();

        handle.terminate().await.unwrap();
        assert!(!handle.is_alive().await);
        assert!(handle.is_terminated());

        // Idempotent
        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_call_after_exit_is_transport_error() {
        let handle = StdioServerHandle::spawn(sh_config("oneshot", ONE_SHOT), None)
            .await
            .unwrap();

        let call = ToolCall::new(
            "oneshot",
            "anything",
            serde_json::json!({}),
            Duration::from_secs(5),
        );
        let err = handle.call_tool(&call).await.unwrap_err();
        assert!(err.is_transport(), "expected transport error, got {err:?}");

        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_delay_readiness_and_force_kill() {
        let config = Arc::new(ServerConfig {
            args: vec!["30".into()],
            readiness: Readiness::Delay { ms: 50 },
            shutdown_grace_ms: 100,
            ..ServerConfig::new("sleeper", "sleep")
        });
        let handle = StdioServerHandle::spawn(config, None).await.unwrap();
        assert!(handle.is_alive().await);
        assert!(handle.tools().is_empty());

        // `sleep` ignores stdin, so this exercises the kill path.
        handle.terminate().await.unwrap();
        assert!(!handle.is_alive().await);
    }

    #[tokio::test]
    async fn test_delay_readiness_detects_early_exit() {
        let config = Arc::new(ServerConfig {
            readiness: Readiness::Delay { ms: 200 },
            ..ServerConfig::new("quitter", "true")
        });
        let err = StdioServerHandle::spawn(config, None).await.err().unwrap();
        assert!(err.to_string().contains("exited during startup"), "{err}");
    }

    #[tokio::test]
    async fn test_handshake_timeout_kills_process() {
        let config = Arc::new(ServerConfig {
            args: vec!["30".into()],
            startup_timeout_secs: 1,
            ..ServerConfig::new("silent", "sleep")
        });
        let start = std::time::Instant::now();
        let err = StdioServerHandle::spawn(config, None).await.err().unwrap();
        assert!(matches!(err, McpError::StartupError { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_missing_command() {
        let config = Arc::new(ServerConfig::new("ghost", "/nonexistent/mcp-server-binary"));
        let err = StdioServerHandle::spawn(config, None).await.err().unwrap();
        match err {
            McpError::StartupError { name, reason } => {
                assert_eq!(name, "ghost");
                assert!(reason.contains("failed to spawn"));
            }
            other => panic!("expected StartupError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_startup_failure_includes_stderr() {
        let config = sh_config("crasher", "echo boom >&2; exit 3");
        let err = StdioServerHandle::spawn(config, None).await.err().unwrap();
        assert!(err.to_string().contains("boom"), "{err}");
    }

    #[tokio::test]
    async fn test_launcher_returns_trait_object() {
        let launcher = StdioLauncher::default();
        let handle = launcher.start(sh_config("echo", RESPONDER)).await.unwrap();
        assert_eq!(handle.name(), "echo");
        handle.terminate().await.unwrap();
    }

    #[test]
    fn test_format_stderr_suffix() {
        assert_eq!(format_stderr_suffix(""), "");
        assert_eq!(format_stderr_suffix("oops\n"), " | stderr: oops");
    }
}
