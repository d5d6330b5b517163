//! Worker health monitoring: heartbeat polling and staleness eviction.

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::config::HealthConfig;
use crate::protocol::{IpcEnvelope, WorkerStatus};
use crate::supervisor::manager::MeshProcessManager;
use crate::supervisor::registry::{FleetStats, ProcessState};
use crate::telemetry::generate_correlation_id;

/// Polls every non-terminal worker on a fixed interval and evicts the ones
/// whose heartbeat has gone stale. Eviction is a force-kill; the exit
/// handling in the manager then decides whether a restart is due.
pub struct HealthMonitor {
    staleness_threshold: Duration,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            staleness_threshold: Duration::seconds(config.staleness_threshold_secs as i64),
        }
    }

    /// One poll tick over the whole fleet.
    ///
    /// Each worker is handled independently: a failed status request or a
    /// failed kill never affects the rest of the fleet.
    pub async fn poll_tick(&self, manager: &MeshProcessManager) {
        let records = manager.registry().records();
        let now = Utc::now();

        for record in records {
            if record.state.is_terminal() {
                continue;
            }

            let stale_for = now - record.last_heartbeat;
            if stale_for > self.staleness_threshold && record.state != ProcessState::Unhealthy {
                warn!(
                    mesh_id = %record.mesh_id,
                    stale_secs = stale_for.num_seconds(),
                    "Worker heartbeat stale; marking unhealthy and evicting"
                );
                manager
                    .registry()
                    .with_record(&record.mesh_id, |r| r.state = ProcessState::Unhealthy);
                // Best-effort: if the kill fails the next tick tries again.
                manager.force_kill(&record.mesh_id);
                continue;
            }

            let correlation_id = generate_correlation_id();
            if let Err(e) = manager
                .send_envelope(&record.mesh_id, &IpcEnvelope::status_request(correlation_id))
                .await
            {
                debug!(mesh_id = %record.mesh_id, error = %e, "Status request not delivered");
            }
        }
    }

    /// Fold a worker's self-report back into its record. Status flows
    /// worker→parent only; nothing here writes back to the worker.
    pub fn record_status(
        &self,
        manager: &MeshProcessManager,
        mesh_id: &str,
        status: &WorkerStatus,
    ) {
        manager.registry().with_record(mesh_id, |r| {
            r.last_heartbeat = Utc::now();
            r.connection_attempts = status.connection_attempts;
            if let Some(err) = &status.last_error {
                r.last_error = Some(err.clone());
            }
            // Reconcile the connection view from the worker's report, but
            // never overwrite policy states (blocked, stopped, restarting).
            if status.connected {
                if matches!(r.state, ProcessState::Ready | ProcessState::Disconnected) {
                    r.state = ProcessState::Connected;
                }
            } else if r.state == ProcessState::Connected {
                r.state = ProcessState::Disconnected;
            }
        });
        debug!(mesh_id = %mesh_id, connected = status.connected, "Heartbeat refreshed");
    }

    pub fn stats(&self, manager: &MeshProcessManager) -> FleetStats {
        manager.registry().stats()
    }
}
