//! Health monitor: detects handles that are dead or alive-but-unresponsive.
//!
//! Probe failures are data, not errors: every probe yields a `HealthStatus`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;

use super::errors::McpError;
use super::handle::ServerHandle;
use super::types::{HealthStatus, HealthVerdict};

// ─── Policy ──────────────────────────────────────────────────────────────────

/// Tunables for probing and for acting on probe results.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// Period of the background supervision loop.
    pub interval: Duration,
    /// Deadline for a single probe.
    pub probe_timeout: Duration,
    /// Probes running at once across all servers.
    pub max_concurrent_probes: usize,
    /// Treat `unresponsive` like `crashed` and restart. When false,
    /// unresponsive servers are only reported.
    pub restart_unresponsive: bool,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            max_concurrent_probes: 8,
            restart_unresponsive: true,
        }
    }
}

impl HealthPolicy {
    /// Whether a verdict should be routed to the restart controller.
    pub fn is_restart_eligible(&self, verdict: HealthVerdict) -> bool {
        match verdict {
            HealthVerdict::Healthy => false,
            HealthVerdict::Crashed => true,
            HealthVerdict::Unresponsive => self.restart_unresponsive,
        }
    }
}

// ─── HealthMonitor ───────────────────────────────────────────────────────────

pub struct HealthMonitor {
    policy: HealthPolicy,
}

impl HealthMonitor {
    pub fn new(policy: HealthPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Probe one handle with a ping bounded by `probe_timeout`.
    pub async fn probe(&self, handle: &dyn ServerHandle) -> HealthStatus {
        if !handle.is_alive().await {
            return HealthStatus::new(
                HealthVerdict::Crashed,
                None,
                Some("process exited".into()),
            );
        }

        let timeout = self.policy.probe_timeout;
        let start = Instant::now();
        let result = tokio::time::timeout(timeout, handle.ping(timeout)).await;
        let latency = Some(start.elapsed());

        match result {
            Ok(Ok(())) => HealthStatus::new(HealthVerdict::Healthy, latency, None),
            Ok(Err(McpError::Timeout { .. })) | Err(_) => HealthStatus::new(
                HealthVerdict::Unresponsive,
                latency,
                Some(format!("no ping response within {}ms", timeout.as_millis())),
            ),
            Ok(Err(e)) if e.is_transport() => {
                HealthStatus::new(HealthVerdict::Crashed, latency, Some(e.to_string()))
            }
            // The server answered, even if with an error: it is alive.
            Ok(Err(e)) => HealthStatus::new(HealthVerdict::Healthy, latency, Some(e.to_string())),
        }
    }

    /// Probe every handle concurrently (up to `max_concurrent_probes` at a
    /// time). One slow server never delays the others beyond that bound.
    pub async fn check_all(
        &self,
        handles: Vec<(String, Arc<dyn ServerHandle>)>,
    ) -> BTreeMap<String, HealthStatus> {
        let limit = self.policy.max_concurrent_probes.max(1);

        let mut probes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            probes.push(async move {
                let status = self.probe(handle.as_ref()).await;
                (name, status)
            });
        }
        let results: BTreeMap<String, HealthStatus> = stream::iter(probes)
            .buffer_unordered(limit)
            .collect()
            .await;

        let unhealthy = results.values().filter(|s| !s.is_healthy()).count();
        tracing::debug!(probed = results.len(), unhealthy, "health check complete");
        results
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
