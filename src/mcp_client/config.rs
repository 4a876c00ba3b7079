//! Servers file loader.
//!
//! Reads `mcp-servers.yaml`, interpolates `${VAR}` / `${VAR:-default}` from
//! the environment, fills each server's name from its map key, and
//! validates the result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::errors::McpError;
use super::health::HealthPolicy;
use super::manager::{InitializeOptions, InitializePolicy, ManagerOptions};
use super::types::ServerConfig;

/// File name searched for by `find_config_path`.
pub const CONFIG_FILE_NAME: &str = "mcp-servers.yaml";

/// Environment variable naming the servers file explicitly.
pub const CONFIG_PATH_ENV: &str = "MCP_LIFECYCLE_CONFIG";

// ─── Schema ──────────────────────────────────────────────────────────────────

/// Top-level servers file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

/// Supervision and startup policy shared by all servers.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,
    #[serde(default = "default_true")]
    pub restart_unresponsive: bool,
    #[serde(default)]
    pub initialize_policy: InitializePolicy,
    #[serde(default)]
    pub retry_startup_failures: bool,
}

fn default_health_interval_secs() -> u64 {
    30
}
fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_max_concurrent_probes() -> usize {
    8
}
fn default_true() -> bool {
    true
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_concurrent_probes: default_max_concurrent_probes(),
            restart_unresponsive: true,
            initialize_policy: InitializePolicy::default(),
            retry_startup_failures: false,
        }
    }
}

impl SupervisorSettings {
    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            interval: Duration::from_secs(self.health_interval_secs),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            max_concurrent_probes: self.max_concurrent_probes,
            restart_unresponsive: self.restart_unresponsive,
        }
    }

    pub fn initialize_options(&self) -> InitializeOptions {
        InitializeOptions {
            policy: self.initialize_policy,
            retry_startup_failures: self.retry_startup_failures,
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            health: self.health_policy(),
            initialize: self.initialize_options(),
        }
    }
}

impl McpServersConfig {
    /// Server configs sorted by name, ready to hand to `initialize`.
    pub fn server_configs(&self) -> Vec<Arc<ServerConfig>> {
        let mut configs: Vec<Arc<ServerConfig>> =
            self.servers.values().cloned().map(Arc::new).collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Reject configs that could never start.
    pub fn validate(&self) -> Result<(), McpError> {
        for (name, server) in &self.servers {
            if server.command.trim().is_empty() {
                return Err(config_error(format!("server '{name}': command is empty")));
            }
            if server.startup_timeout_secs == 0 {
                return Err(config_error(format!(
                    "server '{name}': startup_timeout_secs must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the servers file.
///
/// Search order:
/// 1. `MCP_LIFECYCLE_CONFIG` env var
/// 2. `mcp-servers.yaml` in `start` and each of its ancestors
pub fn find_config_path(start: &Path) -> Result<PathBuf, McpError> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_PATH_ENV} points at a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(config_error(format!("could not find {CONFIG_FILE_NAME}")))
}

/// Load, interpolate, and validate the servers file.
///
/// Relative `cwd` entries are resolved against the file's directory.
pub fn load_servers_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;

    let mut config = parse_servers_config(&raw)?;

    if let Some(base) = path.parent() {
        for server in config.servers.values_mut() {
            if let Some(cwd) = server.cwd.as_mut() {
                let resolved = Path::new(cwd.as_str());
                if resolved.is_relative() {
                    *cwd = base.join(resolved).to_string_lossy().into_owned();
                }
            }
        }
    }

    tracing::info!(
        path = %path.display(),
        servers = config.servers.len(),
        "loaded servers config"
    );
    Ok(config)
}

/// Parse servers config text (YAML or JSON).
pub fn parse_servers_config(raw: &str) -> Result<McpServersConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);
    let mut config: McpServersConfig = serde_yaml::from_str(&interpolated)
        .map_err(|e| config_error(format!("failed to parse config: {e}")))?;

    for (key, server) in config.servers.iter_mut() {
        server.name = key.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Unset variables without a default
/// become the empty string.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

fn config_error(reason: String) -> McpError {
    McpError::Config { reason }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
