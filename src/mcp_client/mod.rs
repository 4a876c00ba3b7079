//! MCP client: lifecycle management for tool-provider child processes.
//!
//! This module handles:
//! - Spawning MCP servers and waiting for readiness
//! - JSON-RPC 2.0 communication over process stdio
//! - Health probing and supervised restarts with backoff
//! - Tool call routing with timeouts and transport-failure recovery
//! - Deterministic shutdown of every child process
//!
//! Agents talk to `McpServerManager`; everything else is plumbing behind it.

pub mod catalog;
pub mod config;
pub mod errors;
pub mod handle;
pub mod health;
pub mod manager;
pub mod registry;
pub mod restart;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use catalog::ToolCatalog;
pub use config::{find_config_path, load_servers_config, McpServersConfig, SupervisorSettings};
pub use errors::McpError;
pub use handle::{ServerHandle, ServerLauncher, StdioLauncher, StdioServerHandle};
pub use health::{HealthMonitor, HealthPolicy};
pub use manager::{InitializeOptions, InitializePolicy, ManagerOptions, McpServerManager};
pub use restart::{RestartMode, RestartOutcome};
pub use types::{
    HealthStatus, HealthVerdict, InitializeReport, McpToolDefinition, Readiness, ServerConfig,
    ServerStartReport, ServerState, ShutdownReport, TransportKind,
};
