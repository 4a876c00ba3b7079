//! Server registry: the single source of truth for name → handle.
//!
//! Each configured server owns one slot holding at most one live handle,
//! its lifecycle state, and the failure counters that must survive handle
//! replacement. The registry performs no I/O: unregistering a handle hands
//! it back to the caller, who is responsible for terminating it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::errors::McpError;
use super::handle::ServerHandle;
use super::types::{HealthStatus, ServerState};

// ─── ServerSlot ──────────────────────────────────────────────────────────────

/// Runtime bookkeeping for one logical server.
struct ServerSlot {
    handle: Option<Arc<dyn ServerHandle>>,
    state: ServerState,
    /// Failed starts and unhealthy verdicts since the last healthy moment.
    consecutive_failures: u32,
    /// Restarts attempted since the server was last `ready`.
    restart_attempts: u32,
    last_health: Option<HealthStatus>,
}

impl ServerSlot {
    fn new() -> Self {
        Self {
            handle: None,
            state: ServerState::Uninitialized,
            consecutive_failures: 0,
            restart_attempts: 0,
            last_health: None,
        }
    }
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// Mapping from logical server name to its slot.
#[derive(Default)]
pub struct ServerRegistry {
    slots: HashMap<String, ServerSlot>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an `uninitialized` slot for `name`. Returns `false` if the name
    /// was already declared.
    pub fn declare(&mut self, name: &str) -> bool {
        if self.slots.contains_key(name) {
            return false;
        }
        self.slots.insert(name.to_string(), ServerSlot::new());
        true
    }

    /// Whether `name` was declared.
    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Attach a live handle to a declared name.
    ///
    /// Fails if a handle is already present: the old one must be
    /// unregistered (and terminated) first, so no duplicate process can be
    /// orphaned.
    pub fn register(&mut self, name: &str, handle: Arc<dyn ServerHandle>) -> Result<(), McpError> {
        let slot = self.slot_mut(name)?;
        if slot.handle.is_some() {
            return Err(McpError::AlreadyRegistered {
                name: name.to_string(),
            });
        }
        slot.handle = Some(handle);
        Ok(())
    }

    /// The handle for `name`, regardless of state.
    ///
    /// `ServerNotFound` for undeclared names; `ServerUnavailable` for names
    /// that currently have no handle.
    pub fn get(&self, name: &str) -> Result<Arc<dyn ServerHandle>, McpError> {
        let slot = self.slots.get(name).ok_or_else(|| McpError::ServerNotFound {
            name: name.to_string(),
        })?;
        slot.handle.clone().ok_or_else(|| McpError::ServerUnavailable {
            name: name.to_string(),
            state: slot.state,
        })
    }

    /// Detach and return the handle for `name`. Does not terminate it.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn ServerHandle>> {
        self.slots.get_mut(name).and_then(|slot| slot.handle.take())
    }

    /// Current state of `name`.
    pub fn state(&self, name: &str) -> Option<ServerState> {
        self.slots.get(name).map(|slot| slot.state)
    }

    /// Move `name` to `next` if the lifecycle allows it.
    ///
    /// Illegal edges are logged and ignored; returns whether the state changed.
    pub fn transition(&mut self, name: &str, next: ServerState) -> bool {
        let Some(slot) = self.slots.get_mut(name) else {
            return false;
        };
        if slot.state == next {
            return false;
        }
        if !slot.state.can_transition_to(next) {
            tracing::warn!(
                server = name,
                from = %slot.state,
                to = %next,
                "ignoring illegal state transition"
            );
            return false;
        }
        tracing::debug!(server = name, from = %slot.state, to = %next, "state transition");
        slot.state = next;
        true
    }

    /// Immutable copy of every name → state pair.
    pub fn snapshot(&self) -> BTreeMap<String, ServerState> {
        self.slots
            .iter()
            .map(|(name, slot)| (name.clone(), slot.state))
            .collect()
    }

    /// All live handles, for probing or teardown.
    pub fn handles(&self) -> Vec<(String, Arc<dyn ServerHandle>)> {
        self.slots
            .iter()
            .filter_map(|(name, slot)| slot.handle.clone().map(|h| (name.clone(), h)))
            .collect()
    }

    /// Declared names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names in `state` that currently have no handle.
    pub fn handleless_in(&self, state: ServerState) -> Vec<String> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.state == state && slot.handle.is_none())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Number of live handles.
    pub fn handle_count(&self) -> usize {
        self.slots.values().filter(|slot| slot.handle.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    // ─── Counters ────────────────────────────────────────────────────────

    /// Bump the consecutive-failure counter; returns the new value.
    pub fn record_failure(&mut self, name: &str) -> u32 {
        self.slots.get_mut(name).map_or(0, |slot| {
            slot.consecutive_failures += 1;
            slot.consecutive_failures
        })
    }

    pub fn consecutive_failures(&self, name: &str) -> u32 {
        self.slots.get(name).map_or(0, |slot| slot.consecutive_failures)
    }

    /// Bump the restart-attempt counter; returns the new value.
    pub fn record_restart_attempt(&mut self, name: &str) -> u32 {
        self.slots.get_mut(name).map_or(0, |slot| {
            slot.restart_attempts += 1;
            slot.restart_attempts
        })
    }

    pub fn restart_attempts(&self, name: &str) -> u32 {
        self.slots.get(name).map_or(0, |slot| slot.restart_attempts)
    }

    /// Clear both counters after the server is healthy again.
    pub fn reset_failures(&mut self, name: &str) {
        if let Some(slot) = self.slots.get_mut(name) {
            slot.consecutive_failures = 0;
            slot.restart_attempts = 0;
        }
    }

    pub fn record_health(&mut self, name: &str, status: HealthStatus) {
        if let Some(slot) = self.slots.get_mut(name) {
            slot.last_health = Some(status);
        }
    }

    pub fn last_health(&self, name: &str) -> Option<&HealthStatus> {
        self.slots.get(name).and_then(|slot| slot.last_health.as_ref())
    }

    fn slot_mut(&mut self, name: &str) -> Result<&mut ServerSlot, McpError> {
        self.slots.get_mut(name).ok_or_else(|| McpError::ServerNotFound {
            name: name.to_string(),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::testing::MockHandle;
    use crate::mcp_client::types::HealthVerdict;

    fn handle(name: &str) -> Arc<dyn ServerHandle> {
        Arc::new(MockHandle::detached(name))
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = ServerRegistry::new();
        assert!(registry.declare("search"));
        registry.register("search", handle("search")).unwrap();

        assert_eq!(registry.get("search").unwrap().name(), "search");
        assert_eq!(registry.handle_count(), 1);
    }

    #[test]
    fn test_register_rejects_duplicate_handle() {
        let mut registry = ServerRegistry::new();
        registry.declare("search");
        registry.register("search", handle("search")).unwrap();

        let err = registry.register("search", handle("search")).unwrap_err();
        assert!(matches!(err, McpError::AlreadyRegistered { .. }));

        // After unregistering, a replacement is accepted.
        assert!(registry.unregister("search").is_some());
        registry.register("search", handle("search")).unwrap();
        assert_eq!(registry.handle_count(), 1);
    }

    #[test]
    fn test_get_distinguishes_unknown_from_unavailable() {
        let mut registry = ServerRegistry::new();
        registry.declare("planner");

        assert!(matches!(
            registry.get("nope"),
            Err(McpError::ServerNotFound { .. })
        ));
        assert!(matches!(
            registry.get("planner"),
            Err(McpError::ServerUnavailable {
                state: ServerState::Uninitialized,
                ..
            })
        ));
    }

    #[test]
    fn test_register_undeclared_fails() {
        let mut registry = ServerRegistry::new();
        let err = registry.register("ghost", handle("ghost")).unwrap_err();
        assert!(matches!(err, McpError::ServerNotFound { .. }));
    }

    #[test]
    fn test_unregister_keeps_slot() {
        let mut registry = ServerRegistry::new();
        registry.declare("fs");
        registry.register("fs", handle("fs")).unwrap();

        assert!(registry.unregister("fs").is_some());
        assert!(registry.unregister("fs").is_none());
        assert!(registry.contains("fs"));
        assert_eq!(registry.handle_count(), 0);
    }

    #[test]
    fn test_transition_rejects_illegal_edges() {
        let mut registry = ServerRegistry::new();
        registry.declare("fs");

        assert!(!registry.transition("fs", ServerState::Ready));
        assert!(registry.transition("fs", ServerState::Starting));
        assert!(registry.transition("fs", ServerState::PermanentlyFailed));
        assert!(!registry.transition("fs", ServerState::Restarting));
        assert!(registry.transition("fs", ServerState::Stopped));
        assert_eq!(registry.state("fs"), Some(ServerState::Stopped));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut registry = ServerRegistry::new();
        registry.declare("a");
        registry.declare("b");
        registry.transition("a", ServerState::Starting);

        let snap = registry.snapshot();
        registry.transition("a", ServerState::Ready);

        assert_eq!(snap.len(), 2);
        assert_eq!(snap["a"], ServerState::Starting);
        assert_eq!(snap["b"], ServerState::Uninitialized);
    }

    #[test]
    fn test_counters_reset() {
        let mut registry = ServerRegistry::new();
        registry.declare("kb");
        assert_eq!(registry.record_failure("kb"), 1);
        assert_eq!(registry.record_failure("kb"), 2);
        assert_eq!(registry.record_restart_attempt("kb"), 1);

        registry.reset_failures("kb");
        assert_eq!(registry.consecutive_failures("kb"), 0);
        assert_eq!(registry.restart_attempts("kb"), 0);
    }

    #[test]
    fn test_record_health() {
        let mut registry = ServerRegistry::new();
        registry.declare("kb");
        assert!(registry.last_health("kb").is_none());

        registry.record_health("kb", HealthStatus::new(HealthVerdict::Crashed, None, None));
        assert_eq!(
            registry.last_health("kb").map(|h| h.verdict),
            Some(HealthVerdict::Crashed)
        );
    }

    #[test]
    fn test_handleless_in() {
        let mut registry = ServerRegistry::new();
        registry.declare("a");
        registry.declare("b");
        registry.transition("a", ServerState::Starting);
        registry.transition("a", ServerState::Unhealthy);
        registry.transition("b", ServerState::Starting);
        registry.transition("b", ServerState::Unhealthy);
        registry.register("b", handle("b")).unwrap();

        assert_eq!(registry.handleless_in(ServerState::Unhealthy), vec!["a".to_string()]);
    }
}
