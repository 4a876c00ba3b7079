//! MCP server manager: the façade agents talk to.
//!
//! Orchestrates the launcher, registry, health monitor and restart
//! controller. The manager is a cheap `Clone` over shared state; callers
//! receive it by injection and must pair `initialize` with `shutdown`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::catalog::ToolCatalog;
use super::errors::McpError;
use super::handle::{same_handle, ServerHandle, ServerLauncher, StdioLauncher};
use super::health::{HealthMonitor, HealthPolicy};
use super::registry::ServerRegistry;
use super::restart::{stopped, RestartContext, RestartController, RestartMode, RestartOutcome};
use super::types::{
    HealthStatus, InitializeReport, ServerConfig, ServerStartReport, ServerState, ShutdownReport,
    ToolCall,
};

/// How long `shutdown` waits for in-flight starts and restarts to unwind.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const MIN_SUPERVISE_INTERVAL: Duration = Duration::from_millis(10);

// ─── Options ─────────────────────────────────────────────────────────────────

/// When `initialize` reports failure instead of partial success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializePolicy {
    /// Never fail; the report says what started.
    Partial,
    /// Fail if a non-empty config set produced no ready server.
    #[default]
    FailIfAllFail,
    /// Fail if any server did not reach `ready`.
    FailIfAnyFail,
}

#[derive(Debug, Clone, Default)]
pub struct InitializeOptions {
    pub policy: InitializePolicy,
    /// Route startup failures through the restart controller instead of
    /// marking them permanently failed on the spot.
    pub retry_startup_failures: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    pub health: HealthPolicy,
    pub initialize: InitializeOptions,
}

// ─── In-flight tracking ──────────────────────────────────────────────────────

/// Counts starts and restarts that may still produce a handle.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard<'a>(&'a InFlight);

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

// ─── McpServerManager ────────────────────────────────────────────────────────

struct Inner {
    launcher: Arc<dyn ServerLauncher>,
    options: ManagerOptions,
    registry: tokio::sync::Mutex<ServerRegistry>,
    configs: Mutex<HashMap<String, Arc<ServerConfig>>>,
    health: HealthMonitor,
    restarts: RestartController,
    in_flight: InFlight,
    initialized: AtomicBool,
    stop: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Starts, supervises and stops a set of MCP servers.
#[derive(Clone)]
pub struct McpServerManager {
    inner: Arc<Inner>,
}

impl McpServerManager {
    pub fn new(launcher: Arc<dyn ServerLauncher>, options: ManagerOptions) -> Self {
        let health = HealthMonitor::new(options.health.clone());
        Self {
            inner: Arc::new(Inner {
                launcher,
                options,
                registry: tokio::sync::Mutex::new(ServerRegistry::new()),
                configs: Mutex::new(HashMap::new()),
                health,
                restarts: RestartController::new(),
                in_flight: InFlight::default(),
                initialized: AtomicBool::new(false),
                stop: watch::channel(false).0,
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Manager that spawns every server as a stdio child process.
    pub fn with_stdio(options: ManagerOptions) -> Self {
        Self::new(Arc::new(StdioLauncher::default()), options)
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    // ─── Startup ─────────────────────────────────────────────────────────

    /// Start every configured server concurrently.
    ///
    /// Per-server outcomes are always in the report; whether the call fails
    /// as a whole is decided by `InitializePolicy`. Servers that did start
    /// stay running either way, so callers must still `shutdown()`.
    pub async fn initialize(
        &self,
        configs: Vec<Arc<ServerConfig>>,
    ) -> Result<InitializeReport, McpError> {
        let mut seen = HashSet::new();
        if let Some(dup) = configs.iter().find(|c| !seen.insert(c.name.as_str())) {
            return Err(McpError::Config {
                reason: format!("duplicate server name '{}'", dup.name),
            });
        }

        {
            let mut registry = self.inner.registry.lock().await;
            if self.is_stopping() {
                return Err(McpError::Cancelled);
            }
            if self.inner.initialized.swap(true, Ordering::SeqCst) {
                return Err(McpError::Config {
                    reason: "manager is already initialized".into(),
                });
            }
            let mut known = self.lock_configs();
            for config in &configs {
                registry.declare(&config.name);
                known.insert(config.name.clone(), Arc::clone(config));
            }
        }

        tracing::info!(servers = configs.len(), "starting MCP servers");
        let started = Instant::now();

        let results =
            join_all(configs.iter().map(|config| self.start_one(Arc::clone(config)))).await;
        let report = InitializeReport {
            servers: results.into_iter().collect(),
        };

        let ready = report.ready().len();
        let failed: Vec<String> = report.failed().into_iter().map(String::from).collect();
        tracing::info!(
            ready,
            failed = failed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "MCP server initialization complete"
        );

        if self.is_stopping() {
            return Err(McpError::Cancelled);
        }

        let fail = match self.inner.options.initialize.policy {
            InitializePolicy::Partial => false,
            InitializePolicy::FailIfAllFail => !configs.is_empty() && ready == 0,
            InitializePolicy::FailIfAnyFail => !failed.is_empty(),
        };
        if fail {
            return Err(McpError::AllServersFailed { failed });
        }
        Ok(report)
    }

    /// `initialize`, abandoned if `cancel` completes first.
    ///
    /// On cancellation in-flight starts are dropped (killing their
    /// processes), every started handle is terminated, and `Cancelled` is
    /// returned.
    pub async fn initialize_until<F>(
        &self,
        configs: Vec<Arc<ServerConfig>>,
        cancel: F,
    ) -> Result<InitializeReport, McpError>
    where
        F: Future<Output = ()>,
    {
        let finished = {
            let init = self.initialize(configs);
            tokio::pin!(init);
            tokio::pin!(cancel);
            tokio::select! {
                result = &mut init => Some(result),
                _ = &mut cancel => None,
            }
        };

        match finished {
            Some(result) => result,
            None => {
                tracing::warn!("initialization cancelled, tearing down started servers");
                let report = self.shutdown().await;
                if !report.is_clean() {
                    tracing::warn!(errors = report.errors.len(), "cleanup after cancel had errors");
                }
                Err(McpError::Cancelled)
            }
        }
    }

    async fn start_one(&self, config: Arc<ServerConfig>) -> (String, ServerStartReport) {
        let _in_flight = self.inner.in_flight.enter();
        let name = config.name.clone();
        let started = Instant::now();

        self.inner
            .registry
            .lock()
            .await
            .transition(&name, ServerState::Starting);

        let launch = tokio::time::timeout(
            config.startup_timeout(),
            self.inner.launcher.start(Arc::clone(&config)),
        );
        let result = tokio::select! {
            result = launch => Some(result),
            _ = stopped(self.inner.stop.subscribe()) => None,
        };

        let mut restarts = 0;
        let error = match result {
            None => Some("shutdown during startup".to_string()),
            Some(Ok(Ok(handle))) => self.install(&name, handle).await.err(),
            Some(Ok(Err(e))) => Some(e.to_string()),
            Some(Err(_)) => Some(format!(
                "server '{name}' not ready after {}s",
                config.startup_timeout().as_secs()
            )),
        };

        let error = match error {
            Some(reason) if !self.is_stopping() => {
                tracing::warn!(server = %name, error = %reason, "server failed to start");
                let retry = self.inner.options.initialize.retry_startup_failures;
                {
                    let mut registry = self.inner.registry.lock().await;
                    registry.record_failure(&name);
                    let next = if retry {
                        ServerState::Unhealthy
                    } else {
                        ServerState::PermanentlyFailed
                    };
                    registry.transition(&name, next);
                }

                if retry {
                    match self
                        .inner
                        .restarts
                        .recover(self.restart_ctx(None), config, RestartMode::Automatic)
                        .await
                    {
                        RestartOutcome::Restarted { restarts: n, .. } => {
                            restarts = n;
                            None
                        }
                        RestartOutcome::PermanentlyFailed {
                            attempts,
                            last_error,
                            ..
                        } => {
                            restarts = attempts;
                            last_error.or(Some(reason))
                        }
                        _ => Some(reason),
                    }
                } else {
                    tracing::error!(server = %name, "server marked permanently failed at startup");
                    Some(reason)
                }
            }
            other => other,
        };

        let state = self
            .inner
            .registry
            .lock()
            .await
            .state(&name)
            .unwrap_or(ServerState::Stopped);
        let report = ServerStartReport {
            state,
            restarts,
            error,
            elapsed: started.elapsed(),
        };
        (name, report)
    }

    /// Register a freshly started handle, unless shutdown got there first.
    async fn install(&self, name: &str, handle: Arc<dyn ServerHandle>) -> Result<(), String> {
        let mut registry = self.inner.registry.lock().await;
        let refused = if self.is_stopping() {
            Some("shutdown during startup".to_string())
        } else {
            registry.register(name, Arc::clone(&handle)).err().map(|e| e.to_string())
        };

        if let Some(reason) = refused {
            drop(registry);
            if let Err(e) = handle.terminate().await {
                tracing::warn!(server = name, error = %e, "failed to terminate refused handle");
            }
            return Err(reason);
        }

        registry.transition(name, ServerState::Ready);
        registry.reset_failures(name);
        tracing::info!(
            server = name,
            pid = handle.pid(),
            tools = handle.tools().len(),
            "server ready"
        );
        Ok(())
    }

    // ─── Agent-facing ────────────────────────────────────────────────────

    /// Handle for `name`, only if it is `ready`.
    pub async fn get_server(&self, name: &str) -> Result<Arc<dyn ServerHandle>, McpError> {
        let registry = self.inner.registry.lock().await;
        match registry.state(name) {
            None => Err(McpError::ServerNotFound {
                name: name.to_string(),
            }),
            Some(ServerState::Ready) => registry.get(name),
            Some(state) => Err(McpError::ServerUnavailable {
                name: name.to_string(),
                state,
            }),
        }
    }

    /// Invoke `tool` on server `name` with the server's call timeout.
    ///
    /// A broken transport triggers one probe and, if the server is not
    /// healthy, one immediate restart. The call itself is not replayed.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let handle = self.get_server(name).await?;
        let config = self.config(name)?;
        let call = ToolCall::new(name, tool, arguments, config.call_timeout());

        tracing::debug!(server = name, tool, id = call.correlation_id, "calling tool");
        let result = tokio::time::timeout_at(call.deadline, handle.call_tool(&call)).await;

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(McpError::Timeout { .. })) | Err(_) => {
                tracing::warn!(
                    server = name,
                    tool,
                    timeout_ms = config.call_timeout_ms,
                    "tool call timed out"
                );
                Err(McpError::Timeout {
                    server: name.to_string(),
                    tool: tool.to_string(),
                    timeout_ms: config.call_timeout_ms,
                })
            }
            Ok(Err(e)) if e.is_transport() => {
                self.recover_after_transport(handle, config, e).await
            }
            Ok(Err(e)) => Err(e),
        }
    }

    /// Route a fully-qualified `server.tool` name through the tool catalog.
    pub async fn call_tool_by_name(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let catalog = self.tools().await;
        match catalog.validate_tool_call(tool_name, &arguments) {
            Ok((server, tool)) => self.call_tool(&server, &tool, arguments).await,
            Err(McpError::UnknownTool { name }) => {
                // A known server that is down should read as unavailable.
                if let Some((server, _)) = ToolCatalog::split_name(&name) {
                    if let Err(e @ McpError::ServerUnavailable { .. }) =
                        self.get_server(server).await
                    {
                        return Err(e);
                    }
                }
                Err(McpError::UnknownTool { name })
            }
            Err(e) => Err(e),
        }
    }

    async fn recover_after_transport(
        &self,
        handle: Arc<dyn ServerHandle>,
        config: Arc<ServerConfig>,
        error: McpError,
    ) -> Result<serde_json::Value, McpError> {
        let name = config.name.clone();
        tracing::warn!(server = %name, error = %error, "transport failure during tool call");

        let status = self.inner.health.probe(handle.as_ref()).await;
        let healthy = status.is_healthy();
        {
            let mut registry = self.inner.registry.lock().await;
            // Someone already replaced the handle.
            let current = registry.get(&name).ok();
            if !current.is_some_and(|h| same_handle(&h, &handle)) {
                return Err(error);
            }
            if !healthy {
                registry.record_failure(&name);
            }
            registry.record_health(&name, status);
        }
        if healthy {
            return Err(error);
        }

        match self.recover(config, RestartMode::Immediate, Some(handle)).await {
            RestartOutcome::Restarted { .. } | RestartOutcome::Coalesced => Err(error),
            _ => {
                let state = self.state(&name).await.unwrap_or(ServerState::Stopped);
                Err(McpError::ServerUnavailable { name, state })
            }
        }
    }

    // ─── Supervision ─────────────────────────────────────────────────────

    /// Probe every registered handle. Records nothing.
    pub async fn health_check(&self) -> BTreeMap<String, HealthStatus> {
        let handles = self.inner.registry.lock().await.handles();
        self.inner.health.check_all(handles).await
    }

    /// One supervision pass: probe, record, and restart what needs it.
    ///
    /// Returns the restart outcome for every server that was acted on.
    pub async fn supervise_once(&self) -> BTreeMap<String, RestartOutcome> {
        if self.is_stopping() {
            return BTreeMap::new();
        }

        let policy = self.inner.health.policy().clone();
        let handles = self.inner.registry.lock().await.handles();
        let statuses = self.inner.health.check_all(handles.clone()).await;
        let mut probed: HashMap<String, Arc<dyn ServerHandle>> = handles.into_iter().collect();

        let mut targets: Vec<(String, Option<Arc<dyn ServerHandle>>)> = Vec::new();
        {
            let mut registry = self.inner.registry.lock().await;
            for (name, status) in statuses {
                let Some(handle) = probed.remove(&name) else {
                    continue;
                };
                // Replaced while the probe ran: the verdict is stale.
                let current = registry.get(&name).ok();
                if !current.is_some_and(|h| same_handle(&h, &handle)) {
                    tracing::debug!(server = %name, "handle replaced, ignoring stale verdict");
                    continue;
                }

                if status.is_healthy() {
                    registry.reset_failures(&name);
                } else {
                    let failures = registry.record_failure(&name);
                    tracing::warn!(
                        server = %name,
                        verdict = ?status.verdict,
                        failures,
                        detail = status.detail.as_deref().unwrap_or(""),
                        "health probe failed"
                    );
                    if policy.is_restart_eligible(status.verdict) {
                        targets.push((name.clone(), Some(handle)));
                    }
                }
                registry.record_health(&name, status);
            }
            // Left unhealthy by an earlier immediate restart.
            for name in registry.handleless_in(ServerState::Unhealthy) {
                if !targets.iter().any(|(target, _)| *target == name) {
                    targets.push((name, None));
                }
            }
        }

        let mut recoveries = Vec::with_capacity(targets.len());
        for (name, expected) in targets {
            let Ok(config) = self.config(&name) else {
                continue;
            };
            let manager = self.clone();
            recoveries.push(async move {
                let outcome = manager
                    .recover(config, RestartMode::Automatic, expected)
                    .await;
                (name, outcome)
            });
        }
        let outcomes: BTreeMap<String, RestartOutcome> =
            join_all(recoveries).await.into_iter().collect();

        for (name, outcome) in &outcomes {
            tracing::debug!(server = %name, ?outcome, "supervision restart finished");
        }
        outcomes
    }

    /// Run `supervise_once` every `HealthPolicy::interval` until shutdown.
    ///
    /// Returns `false` if a supervisor is already running or shutdown began.
    pub fn spawn_supervisor(&self) -> bool {
        let mut slot = self.inner.supervisor.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || self.is_stopping() {
            return false;
        }

        // `interval_at` rejects a zero period.
        let interval = self.inner.health.policy().interval.max(MIN_SUPERVISE_INTERVAL);
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = McpServerManager { inner };
                if manager.is_stopping() {
                    break;
                }
                let outcomes = manager.supervise_once().await;
                if !outcomes.is_empty() {
                    tracing::info!(restarted = outcomes.len(), "supervision pass acted on servers");
                }
            }
        }));
        tracing::info!(interval_secs = interval.as_secs(), "supervisor started");
        true
    }

    /// Restart `name` on request, without waiting out a first backoff.
    pub async fn restart_server(&self, name: &str) -> Result<RestartOutcome, McpError> {
        let config = self.config(name)?;
        let state = self.state(name).await.unwrap_or(ServerState::Stopped);
        let restartable = matches!(
            state,
            ServerState::Ready | ServerState::Unhealthy | ServerState::Restarting
        );
        if !restartable || self.is_stopping() {
            return Err(McpError::ServerUnavailable {
                name: name.to_string(),
                state,
            });
        }

        tracing::info!(server = name, %state, "explicit restart requested");
        match self.recover(config, RestartMode::Explicit, None).await {
            outcome @ (RestartOutcome::Restarted { .. } | RestartOutcome::Coalesced) => Ok(outcome),
            RestartOutcome::PermanentlyFailed { attempts, .. } => Err(McpError::RestartExhausted {
                name: name.to_string(),
                attempts,
            }),
            RestartOutcome::Failed { .. } | RestartOutcome::Aborted => {
                let state = self.state(name).await.unwrap_or(ServerState::Stopped);
                Err(McpError::ServerUnavailable {
                    name: name.to_string(),
                    state,
                })
            }
        }
    }

    /// Recover `config.name`. With `expected`, the recovery only proceeds
    /// while that handle is still the registered one.
    async fn recover(
        &self,
        config: Arc<ServerConfig>,
        mode: RestartMode,
        expected: Option<Arc<dyn ServerHandle>>,
    ) -> RestartOutcome {
        let _in_flight = self.inner.in_flight.enter();
        self.inner
            .restarts
            .recover(self.restart_ctx(expected), config, mode)
            .await
    }

    fn restart_ctx(&self, expected: Option<Arc<dyn ServerHandle>>) -> RestartContext<'_> {
        RestartContext {
            registry: &self.inner.registry,
            launcher: self.inner.launcher.as_ref(),
            stop: self.inner.stop.subscribe(),
            expected,
        }
    }

    // ─── Shutdown ────────────────────────────────────────────────────────

    /// Terminate every handle and move every server to `stopped`.
    ///
    /// Never fails; per-handle errors are collected in the report. Safe to
    /// call repeatedly, before `initialize`, or while it is running.
    pub async fn shutdown(&self) -> ShutdownReport {
        let first = !self.inner.stop.send_replace(true);

        let supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = supervisor {
            task.abort();
            let _ = task.await;
        }

        let mut report = self.terminate_all().await;

        // Starts and restarts still unwinding terminate their own handles.
        if tokio::time::timeout(DRAIN_TIMEOUT, self.inner.in_flight.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!("in-flight starts did not finish within the drain timeout");
        }
        let late = self.terminate_all().await;
        report.stopped.extend(late.stopped);
        report.errors.extend(late.errors);

        if first {
            tracing::info!(
                stopped = report.stopped.len(),
                errors = report.errors.len(),
                "MCP servers shut down"
            );
        }
        report
    }

    async fn terminate_all(&self) -> ShutdownReport {
        let handles = {
            let mut registry = self.inner.registry.lock().await;
            let names = registry.names();
            let handles: Vec<(String, Arc<dyn ServerHandle>)> = names
                .iter()
                .filter_map(|name| registry.unregister(name).map(|h| (name.clone(), h)))
                .collect();
            for name in &names {
                registry.transition(name, ServerState::Stopped);
            }
            handles
        };

        let results = join_all(handles.into_iter().map(|(name, handle)| async move {
            let result = handle.terminate().await;
            (name, result)
        }))
        .await;

        let mut report = ShutdownReport::default();
        for (name, result) in results {
            match result {
                Ok(()) => report.stopped.push(name),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "error stopping server");
                    report.errors.push((name, e.to_string()));
                }
            }
        }
        report
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub async fn state(&self, name: &str) -> Option<ServerState> {
        self.inner.registry.lock().await.state(name)
    }

    pub async fn states(&self) -> BTreeMap<String, ServerState> {
        self.inner.registry.lock().await.snapshot()
    }

    pub async fn last_health(&self, name: &str) -> Option<HealthStatus> {
        self.inner.registry.lock().await.last_health(name).cloned()
    }

    /// Tools advertised by currently registered servers.
    pub async fn tools(&self) -> ToolCatalog {
        let handles = self.inner.registry.lock().await.handles();
        ToolCatalog::from_handles(&handles)
    }

    /// Names in `ready`, sorted.
    pub async fn running_servers(&self) -> Vec<String> {
        self.states()
            .await
            .into_iter()
            .filter(|(_, state)| *state == ServerState::Ready)
            .map(|(name, _)| name)
            .collect()
    }

    /// Every configured name, sorted.
    pub async fn configured_servers(&self) -> Vec<String> {
        self.inner.registry.lock().await.names()
    }

    pub fn is_stopping(&self) -> bool {
        *self.inner.stop.borrow()
    }

    fn config(&self, name: &str) -> Result<Arc<ServerConfig>, McpError> {
        self.lock_configs()
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound {
                name: name.to_string(),
            })
    }

    fn lock_configs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ServerConfig>>> {
        self.inner.configs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
