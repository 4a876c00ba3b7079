//! Restart controller: recovery for unhealthy servers.
//!
//! Restarts back off exponentially (`base * 2^attempt`, capped) and stop
//! after `max_restart_attempts`, at which point the server is permanently
//! failed. At most one restart per server name runs at a time; concurrent
//! requests for the same name are coalesced.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use super::handle::{same_handle, ServerHandle, ServerLauncher};
use super::registry::ServerRegistry;
use super::types::{ServerConfig, ServerState};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Upper bound on a single backoff wait.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

// ─── Types ───────────────────────────────────────────────────────────────────

/// How a recovery was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    /// Health pass or startup failure: back off before every attempt and
    /// keep going until success or the attempt cap.
    Automatic,
    /// Caller-requested: the first attempt skips the backoff wait.
    Explicit,
    /// After a transport failure: a single attempt without backoff.
    Immediate,
}

/// What a recovery did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    /// A fresh handle is registered and `ready`.
    Restarted {
        restarts: u32,
        waited: Vec<Duration>,
    },
    /// Another restart of the same server was already in flight, or has
    /// already replaced the handle this recovery was meant for.
    Coalesced,
    /// The attempt cap was reached; no further automatic restarts.
    PermanentlyFailed {
        attempts: u32,
        waited: Vec<Duration>,
        last_error: Option<String>,
    },
    /// An `Immediate` attempt failed; retries remain for later passes.
    Failed {
        attempts: u32,
        error: String,
    },
    /// Shutdown began, or the server is already terminal.
    Aborted,
}

/// Shared state a recovery operates on.
pub struct RestartContext<'a> {
    pub registry: &'a tokio::sync::Mutex<ServerRegistry>,
    pub launcher: &'a dyn ServerLauncher,
    /// Flips to `true` once shutdown begins.
    pub stop: watch::Receiver<bool>,
    /// Handle the caller judged unhealthy. If another handle has since been
    /// registered, the recovery is skipped.
    pub expected: Option<Arc<dyn ServerHandle>>,
}

impl RestartContext<'_> {
    fn stopping(&self) -> bool {
        *self.stop.borrow()
    }

    async fn stopped(&self) {
        stopped(self.stop.clone()).await
    }
}

/// Resolves once `stop` reads `true` or its sender is gone.
pub(crate) async fn stopped(mut stop: watch::Receiver<bool>) {
    loop {
        let stopping = *stop.borrow_and_update();
        if stopping || stop.changed().await.is_err() {
            return;
        }
    }
}

/// Delay before restart attempt `attempt` (0-based): `base * 2^attempt`,
/// capped at `MAX_BACKOFF`. Non-decreasing in `attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

// ─── RestartController ───────────────────────────────────────────────────────

/// Marks a server name as restarting for as long as it lives.
pub struct RestartGuard<'a> {
    controller: &'a RestartController,
    name: String,
}

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.controller.lock().remove(&self.name);
    }
}

#[derive(Default)]
pub struct RestartController {
    in_flight: Mutex<HashSet<String>>,
}

impl RestartController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the restart slot for `name`, or `None` if one is in flight.
    pub fn try_begin(&self, name: &str) -> Option<RestartGuard<'_>> {
        if !self.lock().insert(name.to_string()) {
            return None;
        }
        Some(RestartGuard {
            controller: self,
            name: name.to_string(),
        })
    }

    pub fn is_restarting(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    /// Replace the handle for `config.name` with a freshly started one.
    ///
    /// The old handle (if any) is unregistered and fully terminated before
    /// the first attempt.
    pub async fn recover(
        &self,
        ctx: RestartContext<'_>,
        config: Arc<ServerConfig>,
        mode: RestartMode,
    ) -> RestartOutcome {
        let name = config.name.as_str();
        let Some(_guard) = self.try_begin(name) else {
            tracing::debug!(server = name, "restart already in flight, coalescing");
            return RestartOutcome::Coalesced;
        };
        if ctx.stopping() {
            return RestartOutcome::Aborted;
        }

        let old = {
            let mut registry = ctx.registry.lock().await;
            match registry.state(name) {
                None => return RestartOutcome::Aborted,
                Some(state) if state.is_terminal() => return RestartOutcome::Aborted,
                Some(_) => {}
            }
            if let Some(expected) = &ctx.expected {
                let current = registry.get(name).ok();
                if !current.is_some_and(|h| same_handle(&h, expected)) {
                    tracing::debug!(server = name, "handle already replaced, skipping restart");
                    return RestartOutcome::Coalesced;
                }
            }
            let next = if mode == RestartMode::Explicit {
                ServerState::Restarting
            } else {
                ServerState::Unhealthy
            };
            registry.transition(name, next);
            registry.unregister(name)
        };
        if let Some(old) = old {
            retire(name, old).await;
        }

        let max_attempts = config.max_restart_attempts;
        let mut waited = Vec::new();
        let mut last_error = None;
        let mut first = true;

        loop {
            let attempt = ctx.registry.lock().await.restart_attempts(name);
            if attempt >= max_attempts {
                return give_up(&ctx, name, attempt, waited, last_error).await;
            }

            let skip_backoff = first && mode != RestartMode::Automatic;
            first = false;
            if !skip_backoff {
                let delay = backoff_delay(config.restart_backoff_base(), attempt);
                tracing::info!(
                    server = name,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "restarting server after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.stopped() => return RestartOutcome::Aborted,
                }
                waited.push(delay);
            }
            if ctx.stopping() {
                return RestartOutcome::Aborted;
            }

            {
                let mut registry = ctx.registry.lock().await;
                registry.record_restart_attempt(name);
                registry.transition(name, ServerState::Restarting);
            }

            // Dropping an in-flight start kills the half-started process.
            let started = tokio::select! {
                started = tokio::time::timeout(
                    config.startup_timeout(),
                    ctx.launcher.start(Arc::clone(&config)),
                ) => started,
                _ = ctx.stopped() => return RestartOutcome::Aborted,
            };

            let error = match started {
                Ok(Ok(handle)) => return install(&ctx, name, handle, waited).await,
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "server '{name}' not ready after {}s",
                    config.startup_timeout().as_secs()
                ),
            };

            let attempts = {
                let mut registry = ctx.registry.lock().await;
                registry.record_failure(name);
                registry.transition(name, ServerState::Unhealthy);
                registry.restart_attempts(name)
            };
            tracing::warn!(
                server = name,
                attempt = attempts,
                error = %error,
                "restart attempt failed"
            );
            last_error = Some(error.clone());

            if mode == RestartMode::Immediate {
                if attempts >= max_attempts {
                    return give_up(&ctx, name, attempts, waited, last_error).await;
                }
                return RestartOutcome::Failed { attempts, error };
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Register a freshly started handle, unless shutdown raced us.
async fn install(
    ctx: &RestartContext<'_>,
    name: &str,
    handle: Arc<dyn ServerHandle>,
    waited: Vec<Duration>,
) -> RestartOutcome {
    let mut registry = ctx.registry.lock().await;
    if ctx.stopping() {
        drop(registry);
        retire(name, handle).await;
        return RestartOutcome::Aborted;
    }

    if let Err(e) = registry.register(name, Arc::clone(&handle)) {
        drop(registry);
        tracing::error!(server = name, error = %e, "could not register restarted server");
        retire(name, handle).await;
        return RestartOutcome::Aborted;
    }

    registry.transition(name, ServerState::Ready);
    let restarts = registry.restart_attempts(name);
    registry.reset_failures(name);
    tracing::info!(server = name, restarts, pid = handle.pid(), "server restarted");
    RestartOutcome::Restarted { restarts, waited }
}

async fn give_up(
    ctx: &RestartContext<'_>,
    name: &str,
    attempts: u32,
    waited: Vec<Duration>,
    last_error: Option<String>,
) -> RestartOutcome {
    ctx.registry
        .lock()
        .await
        .transition(name, ServerState::PermanentlyFailed);
    tracing::error!(
        server = name,
        attempts,
        last_error = last_error.as_deref().unwrap_or("none"),
        "server permanently failed, automatic restarts disabled"
    );
    RestartOutcome::PermanentlyFailed {
        attempts,
        waited,
        last_error,
    }
}

/// Terminate a handle that has already left the registry.
async fn retire(name: &str, handle: Arc<dyn ServerHandle>) {
    if let Err(e) = handle.terminate().await {
        tracing::warn!(server = name, error = %e, "failed to terminate old handle");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::testing::MockLauncher;

    use std::sync::atomic::Ordering;

    struct Fixture {
        registry: tokio::sync::Mutex<ServerRegistry>,
        launcher: Arc<MockLauncher>,
        stop: watch::Sender<bool>,
        controller: RestartController,
    }

    impl Fixture {
        fn new(names: &[&str]) -> Self {
            let mut registry = ServerRegistry::new();
            for name in names {
                registry.declare(name);
                registry.transition(name, ServerState::Starting);
                registry.transition(name, ServerState::Unhealthy);
            }
            Self {
                registry: tokio::sync::Mutex::new(registry),
                launcher: MockLauncher::new(),
                stop: watch::channel(false).0,
                controller: RestartController::new(),
            }
        }

        fn ctx(&self) -> RestartContext<'_> {
            RestartContext {
                registry: &self.registry,
                launcher: self.launcher.as_ref(),
                stop: self.stop.subscribe(),
                expected: None,
            }
        }

        async fn state(&self, name: &str) -> Option<ServerState> {
            self.registry.lock().await.state(name)
        }
    }

    fn config(name: &str, max_restart_attempts: u32) -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            max_restart_attempts,
            restart_backoff_ms: 100,
            ..ServerConfig::new(name, "mock")
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 40), MAX_BACKOFF);

        let delays: Vec<Duration> = (0..64).map(|n| backoff_delay(base, n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_try_begin_coalesces() {
        let controller = RestartController::new();
        let guard = controller.try_begin("x").unwrap();
        assert!(controller.try_begin("x").is_none());
        assert!(controller.try_begin("y").is_some());
        assert!(controller.is_restarting("x"));
        drop(guard);
        assert!(!controller.is_restarting("x"));
        assert!(controller.try_begin("x").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_succeeds_after_failures() {
        let fx = Fixture::new(&["beta"]);
        fx.launcher.script("beta").fail_starts.store(1, Ordering::SeqCst);

        let outcome = fx
            .controller
            .recover(fx.ctx(), config("beta", 3), RestartMode::Automatic)
            .await;

        assert_eq!(
            outcome,
            RestartOutcome::Restarted {
                restarts: 2,
                waited: vec![Duration::from_millis(100), Duration::from_millis(200)],
            }
        );
        assert_eq!(fx.state("beta").await, Some(ServerState::Ready));
        assert_eq!(fx.registry.lock().await.restart_attempts("beta"), 0);
        assert_eq!(fx.launcher.live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_gives_up_at_cap() {
        let fx = Fixture::new(&["gamma"]);
        let script = fx.launcher.script("gamma");
        script.fail_starts.store(u32::MAX, Ordering::SeqCst);

        let outcome = fx
            .controller
            .recover(fx.ctx(), config("gamma", 4), RestartMode::Automatic)
            .await;

        match outcome {
            RestartOutcome::PermanentlyFailed { attempts, waited, last_error } => {
                assert_eq!(attempts, 4);
                assert_eq!(waited.len(), 4);
                assert!(waited.windows(2).all(|w| w[0] <= w[1]));
                assert!(last_error.unwrap().contains("scripted"));
            }
            other => panic!("expected PermanentlyFailed, got {other:?}"),
        }
        assert_eq!(script.starts(), 4);
        assert_eq!(fx.state("gamma").await, Some(ServerState::PermanentlyFailed));

        // Terminal: no further starts.
        let again = fx
            .controller
            .recover(fx.ctx(), config("gamma", 4), RestartMode::Automatic)
            .await;
        assert_eq!(again, RestartOutcome::Aborted);
        assert_eq!(script.starts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_skips_first_backoff() {
        let fx = Fixture::new(&["fs"]);
        let start = tokio::time::Instant::now();

        let outcome = fx
            .controller
            .recover(fx.ctx(), config("fs", 3), RestartMode::Explicit)
            .await;

        assert_eq!(
            outcome,
            RestartOutcome::Restarted {
                restarts: 1,
                waited: vec![],
            }
        );
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_makes_one_attempt() {
        let fx = Fixture::new(&["kb"]);
        let script = fx.launcher.script("kb");
        script.fail_starts.store(u32::MAX, Ordering::SeqCst);

        let outcome = fx
            .controller
            .recover(fx.ctx(), config("kb", 3), RestartMode::Immediate)
            .await;

        assert!(matches!(outcome, RestartOutcome::Failed { attempts: 1, .. }));
        assert_eq!(script.starts(), 1);
        assert_eq!(fx.state("kb").await, Some(ServerState::Unhealthy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_recoveries_coalesce() {
        let fx = Fixture::new(&["x"]);
        let script = fx.launcher.script("x");
        script.start_delay_ms.store(500, Ordering::SeqCst);

        let (a, b) = tokio::join!(
            fx.controller.recover(fx.ctx(), config("x", 3), RestartMode::Explicit),
            fx.controller.recover(fx.ctx(), config("x", 3), RestartMode::Explicit),
        );

        let outcomes = [a, b];
        assert_eq!(
            outcomes.iter().filter(|o| **o == RestartOutcome::Coalesced).count(),
            1
        );
        assert_eq!(script.starts(), 1);
        assert_eq!(script.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_skips_replaced_handle() {
        use crate::mcp_client::testing::MockHandle;

        let fx = Fixture::new(&["x"]);
        let current: Arc<dyn ServerHandle> = Arc::new(MockHandle::detached("x"));
        let stale: Arc<dyn ServerHandle> = Arc::new(MockHandle::detached("x"));
        fx.registry
            .lock()
            .await
            .register("x", Arc::clone(&current))
            .unwrap();

        let mut ctx = fx.ctx();
        ctx.expected = Some(stale);
        let outcome = fx
            .controller
            .recover(ctx, config("x", 3), RestartMode::Automatic)
            .await;

        assert_eq!(outcome, RestartOutcome::Coalesced);
        assert_eq!(fx.launcher.script("x").starts(), 0);
        let registered = fx.registry.lock().await.get("x").unwrap();
        assert!(same_handle(&registered, &current));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_aborts_when_stopping() {
        let fx = Fixture::new(&["x"]);
        fx.stop.send_replace(true);

        let outcome = fx
            .controller
            .recover(fx.ctx(), config("x", 3), RestartMode::Automatic)
            .await;
        assert_eq!(outcome, RestartOutcome::Aborted);
        assert_eq!(fx.launcher.script("x").starts(), 0);
    }
}
