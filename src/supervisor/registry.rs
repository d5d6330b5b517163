//! Supervisor-side process registry: one record per mesh worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::MeshWorkerConfig;

/// Lifecycle state of one supervised worker.
///
/// Normal path is `Spawning → Ready → Connected ⇄ Disconnected`; the rest
/// are side exits driven by policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Spawning,
    Ready,
    Connected,
    Disconnected,
    Restarting,
    Unhealthy,
    Blocked,
    Stopped,
    Failed,
}

impl ProcessState {
    /// Terminal states: the process is never restarted from these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Blocked | ProcessState::Stopped | ProcessState::Failed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProcessState::Spawning => "spawning",
            ProcessState::Ready => "ready",
            ProcessState::Connected => "connected",
            ProcessState::Disconnected => "disconnected",
            ProcessState::Restarting => "restarting",
            ProcessState::Unhealthy => "unhealthy",
            ProcessState::Blocked => "blocked",
            ProcessState::Stopped => "stopped",
            ProcessState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Mutable record for one supervised worker process.
///
/// Mutated only by the supervisor and the health monitor, both of which run
/// on the supervisor loop; destroyed when the process leaves the registry.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub mesh_id: String,
    /// Opaque directory metadata snapshot taken at spawn time
    pub metadata: serde_json::Value,
    /// Config to respawn with; identical across restarts
    pub config: MeshWorkerConfig,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub connection_attempts: u32,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub kicked: bool,
    pub server_disconnected: bool,
    pub last_error: Option<String>,
}

impl ProcessRecord {
    pub fn new(mesh_id: String, metadata: serde_json::Value, config: MeshWorkerConfig) -> Self {
        let now = Utc::now();
        Self {
            mesh_id,
            metadata,
            config,
            pid: None,
            state: ProcessState::Spawning,
            connection_attempts: 0,
            retry_count: 0,
            started_at: now,
            last_heartbeat: now,
            kicked: false,
            server_disconnected: false,
            last_error: None,
        }
    }

    /// Whether process exit should remove this record without a restart.
    pub fn exit_is_final(&self) -> bool {
        self.state.is_terminal() || self.server_disconnected
    }
}

/// Aggregate fleet counts, derivable in O(registry size).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FleetStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub stopped: usize,
}

/// Shared handle to the registry map.
///
/// All mutation happens on the supervisor loop; the lock exists because
/// pending async operations (spawn, delayed respawn, status handling) may
/// interleave arbitrarily, never because of cross-thread contention.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<String, ProcessRecord>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record only if the mesh has no record yet. This is the
    /// at-most-one-process-per-mesh invariant: callers reserve the slot
    /// before any await point in the spawn path.
    pub fn try_reserve(&self, record: ProcessRecord) -> bool {
        let mut map = self.inner.lock().unwrap();
        if map.contains_key(&record.mesh_id) {
            return false;
        }
        map.insert(record.mesh_id.clone(), record);
        true
    }

    pub fn contains(&self, mesh_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(mesh_id)
    }

    pub fn get(&self, mesh_id: &str) -> Option<ProcessRecord> {
        self.inner.lock().unwrap().get(mesh_id).cloned()
    }

    pub fn remove(&self, mesh_id: &str) -> Option<ProcessRecord> {
        self.inner.lock().unwrap().remove(mesh_id)
    }

    /// Run a closure against one record under the lock.
    pub fn with_record<R>(
        &self,
        mesh_id: &str,
        f: impl FnOnce(&mut ProcessRecord) -> R,
    ) -> Option<R> {
        let mut map = self.inner.lock().unwrap();
        map.get_mut(mesh_id).map(f)
    }

    pub fn mesh_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }

    pub fn records(&self) -> Vec<ProcessRecord> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn stats(&self) -> FleetStats {
        let map = self.inner.lock().unwrap();
        let mut stats = FleetStats {
            total: map.len(),
            ..Default::default()
        };
        for record in map.values() {
            match record.state {
                ProcessState::Connected => stats.connected += 1,
                ProcessState::Disconnected => stats.disconnected += 1,
                ProcessState::Unhealthy => stats.unhealthy += 1,
                ProcessState::Blocked | ProcessState::Stopped | ProcessState::Failed => {
                    stats.stopped += 1
                }
                _ => {}
            }
            if !matches!(record.state, ProcessState::Unhealthy) && !record.state.is_terminal() {
                stats.healthy += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(mesh_id: &str) -> ProcessRecord {
        ProcessRecord::new(
            mesh_id.to_string(),
            serde_json::Value::Null,
            MeshWorkerConfig {
                mesh_id: mesh_id.to_string(),
                endpoint: "wss://mesh.example.com/ws".to_string(),
                auth_token: None,
                device_id: "host".to_string(),
                peer_id: "bot".to_string(),
                command_prefixes: vec![],
                debug: false,
            },
        )
    }

    #[test]
    fn reserve_is_at_most_once_per_mesh() {
        let registry = ProcessRegistry::new();
        assert!(registry.try_reserve(record("abc")));
        assert!(!registry.try_reserve(record("abc")));
        assert_eq!(registry.len(), 1);

        registry.remove("abc");
        assert!(registry.try_reserve(record("abc")));
    }

    #[test]
    fn terminal_states_finalize_exit() {
        let mut r = record("abc");
        assert!(!r.exit_is_final());

        r.state = ProcessState::Stopped;
        assert!(r.exit_is_final());

        r.state = ProcessState::Disconnected;
        assert!(!r.exit_is_final());

        r.server_disconnected = true;
        assert!(r.exit_is_final());
    }

    #[test]
    fn stats_bucket_by_state() {
        let registry = ProcessRegistry::new();
        for (id, state) in [
            ("a", ProcessState::Connected),
            ("b", ProcessState::Connected),
            ("c", ProcessState::Disconnected),
            ("d", ProcessState::Unhealthy),
            ("e", ProcessState::Stopped),
            ("f", ProcessState::Spawning),
        ] {
            let mut r = record(id);
            r.state = state;
            assert!(registry.try_reserve(r));
        }

        let stats = registry.stats();
        assert_eq!(stats.total, 6);
        assert_eq!(stats.connected, 2);
        assert_eq!(stats.disconnected, 1);
        assert_eq!(stats.unhealthy, 1);
        assert_eq!(stats.stopped, 1);
        // healthy = everything not unhealthy and not terminal
        assert_eq!(stats.healthy, 4);
    }
}
