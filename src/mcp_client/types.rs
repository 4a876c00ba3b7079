//! Shared types for the MCP lifecycle manager.
//!
//! JSON-RPC 2.0 message types, server configuration, lifecycle state, and
//! the reports returned to agent callers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::transport::next_request_id;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Tool definition advertised by a server during its handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub params_schema: serde_json::Value,
}

/// MCP initialize response payload. Every field is optional: servers differ
/// in what they report, and only the id match matters for readiness.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// How the manager talks to a server. One `ServerHandle` implementation
/// exists per variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Line-delimited JSON-RPC over the child's stdin/stdout.
    #[default]
    Stdio,
}

/// How a freshly spawned process signals that it is ready.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Readiness {
    /// Send `initialize` and wait for a non-error response with the same id.
    #[default]
    Handshake,
    /// Wait a fixed delay, then require the process to still be running.
    Delay { ms: u64 },
}

/// Immutable launch description for one tool-provider process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Logical name. Filled from the map key when loaded from a file.
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub readiness: Readiness,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// Base delay for exponential restart backoff.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
}

/// Set to 30s to accommodate ML-heavy servers that import large frameworks
/// at startup.
fn default_startup_timeout_secs() -> u64 {
    30
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_max_restart_attempts() -> u32 {
    3
}
fn default_restart_backoff_ms() -> u64 {
    1_000
}

impl ServerConfig {
    /// Config with default timeouts and restart policy.
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            transport: TransportKind::Stdio,
            readiness: Readiness::Handshake,
            startup_timeout_secs: default_startup_timeout_secs(),
            call_timeout_ms: default_call_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_restart_attempts: default_max_restart_attempts(),
            restart_backoff_ms: default_restart_backoff_ms(),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn restart_backoff_base(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

// ─── Lifecycle State ─────────────────────────────────────────────────────────

/// Per-server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Uninitialized,
    Starting,
    Ready,
    Unhealthy,
    Restarting,
    PermanentlyFailed,
    Stopped,
}

impl ServerState {
    /// Terminal states never leave except to `Stopped`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ServerState::PermanentlyFailed | ServerState::Stopped)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;

        if next == Stopped {
            return self != Stopped;
        }
        matches!(
            (self, next),
            (Uninitialized, Starting)
                | (Starting, Ready)
                | (Starting, Unhealthy)
                | (Starting, PermanentlyFailed)
                | (Ready, Unhealthy)
                | (Ready, Restarting)
                | (Unhealthy, Restarting)
                | (Unhealthy, PermanentlyFailed)
                | (Restarting, Ready)
                | (Restarting, Unhealthy)
                | (Restarting, PermanentlyFailed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Uninitialized => "uninitialized",
            ServerState::Starting => "starting",
            ServerState::Ready => "ready",
            ServerState::Unhealthy => "unhealthy",
            ServerState::Restarting => "restarting",
            ServerState::PermanentlyFailed => "permanently_failed",
            ServerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Health ──────────────────────────────────────────────────────────────────

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    /// Process alive but the probe exceeded its deadline.
    Unresponsive,
    /// Process exited or its pipes are gone.
    Crashed,
}

/// Result of probing one server.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub verdict: HealthVerdict,
    pub checked_at: DateTime<Utc>,
    pub latency: Option<Duration>,
    pub detail: Option<String>,
}

impl HealthStatus {
    pub fn new(verdict: HealthVerdict, latency: Option<Duration>, detail: Option<String>) -> Self {
        Self {
            verdict,
            checked_at: Utc::now(),
            latency,
            detail,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.verdict == HealthVerdict::Healthy
    }
}

// ─── Tool Calls ──────────────────────────────────────────────────────────────

/// One request in flight against one server.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub server: String,
    pub tool: String,
    pub arguments: serde_json::Value,
    /// Used verbatim as the JSON-RPC request id.
    pub correlation_id: u64,
    pub deadline: Instant,
}

impl ToolCall {
    /// Build a call with a fresh correlation id, due `timeout` from now.
    pub fn new(server: &str, tool: &str, arguments: serde_json::Value, timeout: Duration) -> Self {
        Self {
            server: server.to_string(),
            tool: tool.to_string(),
            arguments,
            correlation_id: next_request_id(),
            deadline: Instant::now() + timeout,
        }
    }

    /// Time left before the deadline (zero once it has passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// The `tools/call` request carrying this call.
    pub fn to_request(&self) -> JsonRpcRequest {
        JsonRpcRequest::new(
            self.correlation_id,
            "tools/call",
            Some(serde_json::json!({
                "name": self.tool,
                "arguments": self.arguments,
            })),
        )
    }
}

// ─── Reports ─────────────────────────────────────────────────────────────────

/// Startup outcome for one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStartReport {
    pub state: ServerState,
    /// Restarts performed before reaching `state`.
    pub restarts: u32,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// Per-server result of `initialize`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitializeReport {
    pub servers: BTreeMap<String, ServerStartReport>,
}

impl InitializeReport {
    /// Names that reached `ready`.
    pub fn ready(&self) -> Vec<&str> {
        self.names_where(|r| r.state == ServerState::Ready)
    }

    /// Names that did not reach `ready`.
    pub fn failed(&self) -> Vec<&str> {
        self.names_where(|r| r.state != ServerState::Ready)
    }

    pub fn get(&self, name: &str) -> Option<&ServerStartReport> {
        self.servers.get(name)
    }

    fn names_where(&self, pred: impl Fn(&ServerStartReport) -> bool) -> Vec<&str> {
        self.servers
            .iter()
            .filter(|(_, r)| pred(r))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Result of `shutdown`. Errors are collected, never raised.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub errors: Vec<(String, String)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
