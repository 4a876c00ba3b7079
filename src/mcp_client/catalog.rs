//! Tool catalog: aggregates tool definitions across running servers.
//!
//! Provides:
//! - Tool lookup by fully-qualified name (`server.tool`)
//! - Server-name resolution for a tool
//! - Required-argument validation before dispatch

use std::collections::BTreeMap;
use std::sync::Arc;

use super::errors::McpError;
use super::handle::ServerHandle;
use super::types::McpToolDefinition;

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

/// Tools advertised by servers during their readiness handshake.
///
/// Names are stored as `"server_name.tool_name"` (e.g. `"filesystem.list_dir"`).
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    /// `tool_name → (server_name, definition)`.
    tools: BTreeMap<String, (String, McpToolDefinition)>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of every tool the given handles advertise.
    pub fn from_handles(handles: &[(String, Arc<dyn ServerHandle>)]) -> Self {
        let mut catalog = Self::new();
        for (name, handle) in handles {
            catalog.register_server_tools(name, handle.tools());
        }
        catalog
    }

    /// Add a server's tools. Unqualified names get the server prefix.
    pub fn register_server_tools(&mut self, server_name: &str, tools: &[McpToolDefinition]) {
        for tool in tools {
            let fq_name = if tool.name.contains('.') {
                tool.name.clone()
            } else {
                format!("{server_name}.{}", tool.name)
            };
            self.tools
                .insert(fq_name, (server_name.to_string(), tool.clone()));
        }
    }

    /// Remove all tools belonging to a server.
    pub fn unregister_server(&mut self, server_name: &str) {
        self.tools.retain(|_, (srv, _)| srv != server_name);
    }

    pub fn get_tool(&self, name: &str) -> Option<&McpToolDefinition> {
        self.tools.get(name).map(|(_, def)| def)
    }

    /// The server that advertised `tool_name`.
    pub fn get_server_for_tool(&self, tool_name: &str) -> Option<&str> {
        self.tools.get(tool_name).map(|(srv, _)| srv.as_str())
    }

    /// Split `"filesystem.list_dir"` into `("filesystem", "list_dir")`.
    pub fn split_name(tool_name: &str) -> Option<(&str, &str)> {
        tool_name
            .split_once('.')
            .filter(|(server, tool)| !server.is_empty() && !tool.is_empty())
    }

    /// Fully-qualified names, sorted.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Count tools belonging to a specific server.
    pub fn tools_for_server(&self, server_name: &str) -> usize {
        self.tools
            .values()
            .filter(|(srv, _)| srv == server_name)
            .count()
    }

    /// Resolve a tool call: the tool exists and its required arguments are
    /// present. Returns `(server, tool)` as the server knows them.
    ///
    /// Only top-level `required` fields are checked; full schema validation
    /// is left to the server.
    pub fn validate_tool_call(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<(String, String), McpError> {
        let (server, def) = self.tools.get(tool_name).ok_or_else(|| McpError::UnknownTool {
            name: tool_name.to_string(),
        })?;

        let required = def
            .params_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default();
        let args = arguments.as_object();
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !args.is_some_and(|obj| obj.contains_key(field)) {
                return Err(McpError::InvalidArguments {
                    tool: tool_name.to_string(),
                    reason: format!("missing required field: '{field}'"),
                });
            }
        }

        Ok((server.clone(), def.name.clone()))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
