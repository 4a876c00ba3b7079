//! MCP lifecycle error types.

use thiserror::Error;

use super::types::ServerState;

/// Errors that can occur while supervising MCP servers.
///
/// Failures are always scoped to one server name; nothing here is meant to
/// tear down the caller.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process failed to launch or did not signal readiness in time.
    #[error("server '{name}' failed to start: {reason}")]
    StartupError {
        name: String,
        reason: String,
    },

    /// The stdio channel broke (process exited, pipe closed, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    Transport {
        server: String,
        reason: String,
    },

    /// A call exceeded its deadline while the process is otherwise alive.
    #[error("call '{tool}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        tool: String,
        timeout_ms: u64,
    },

    /// The server answered with a JSON-RPC error object.
    #[error("server '{server}' returned error [{code}]: {message}")]
    ToolFailed {
        server: String,
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The caller referenced a server name that was never configured.
    #[error("unknown server: '{name}'")]
    ServerNotFound {
        name: String,
    },

    /// The server exists but is not `ready`.
    #[error("server '{name}' is unavailable (state: {state})")]
    ServerUnavailable {
        name: String,
        state: ServerState,
    },

    /// A live handle is already registered under this name.
    #[error("server '{name}' already has a registered handle")]
    AlreadyRegistered {
        name: String,
    },

    /// Tool not found in the catalog.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// Tool call arguments failed the required-field check.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments {
        tool: String,
        reason: String,
    },

    /// All restart attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} restart attempts")]
    RestartExhausted {
        name: String,
        attempts: u32,
    },

    /// Every configured server failed to start (or any, under the strict policy).
    #[error("servers failed to start: {}", failed.join(", "))]
    AllServersFailed {
        failed: Vec<String>,
    },

    /// `initialize` was cancelled before it completed.
    #[error("initialization cancelled")]
    Cancelled,

    /// Configuration error (missing file, bad values, duplicate names).
    #[error("config error: {reason}")]
    Config {
        reason: String,
    },
}

impl McpError {
    /// Whether this error means the underlying channel is broken.
    pub fn is_transport(&self) -> bool {
        matches!(self, McpError::Transport { .. })
    }

    /// Whether retrying the same operation later could plausibly succeed.
    ///
    /// Caller bugs (unknown names, bad arguments) and terminal failures are
    /// never retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            McpError::Timeout { .. }
                | McpError::Transport { .. }
                | McpError::StartupError { .. }
                | McpError::ServerUnavailable {
                    state: ServerState::Starting
                        | ServerState::Restarting
                        | ServerState::Unhealthy,
                    ..
                }
        )
    }
}
