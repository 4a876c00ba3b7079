//! `mcp-lifecycle`: run a set of MCP servers under supervision until Ctrl-C.
//!
//! Usage: `mcp-lifecycle [path/to/mcp-servers.yaml]`. Without an argument the
//! file is located via `MCP_LIFECYCLE_CONFIG` or by walking up from the
//! current directory.

use std::path::PathBuf;

use anyhow::Context;

use mcp_lifecycle::mcp_client::{find_config_path, load_servers_config, McpError, McpServerManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcp_lifecycle::init_tracing(&mcp_lifecycle::data_dir())
        .context("failed to initialize logging")?;

    let config_path = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            find_config_path(&cwd)?
        }
    };
    let config = load_servers_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let manager = McpServerManager::with_stdio(config.supervisor.manager_options());

    // A failed signal listener must not cancel startup.
    let interrupted = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let started = manager.initialize_until(config.server_configs(), interrupted).await;
    let report = match started {
        Ok(report) => report,
        Err(McpError::Cancelled) => {
            tracing::info!("interrupted during startup");
            return Ok(());
        }
        Err(e) => {
            manager.shutdown().await;
            return Err(e).context("MCP servers failed to start");
        }
    };

    for (name, server) in &report.servers {
        match &server.error {
            None => tracing::info!(
                server = %name,
                state = %server.state,
                restarts = server.restarts,
                "startup result"
            ),
            Some(error) => tracing::warn!(
                server = %name,
                state = %server.state,
                error = %error,
                "startup result"
            ),
        }
    }
    eprintln!(
        "mcp-lifecycle: {} of {} servers ready, Ctrl-C to stop",
        report.ready().len(),
        report.servers.len()
    );

    manager.spawn_supervisor();

    let signal = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");

    let shutdown = manager.shutdown().await;
    for (name, error) in &shutdown.errors {
        tracing::warn!(server = %name, error = %error, "server did not stop cleanly");
    }
    tracing::info!(stopped = shutdown.stopped.len(), "supervisor exiting");

    signal.context("failed to listen for Ctrl-C")?;
    Ok(())
}
